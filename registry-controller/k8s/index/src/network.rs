//! Mesh network topology and cross-network gateways.
//!
//! A [`NetworkTable`] is built from the mesh networks document and swapped in
//! whole, so readers observe either the prior table or the new one. The
//! [`Topology`] index additionally tracks which services act as gateways and
//! which names must be resolved through DNS.

use crate::{notify::DnsAction, service::ServiceIndex, ClusterInfo};
use ahash::AHashMap as HashMap;
use mesh_registry_controller_core::{
    dns::{NameSet, Referer},
    Gateway, IpNet, Service,
};
use mesh_registry_controller_k8s_api::mesh_networks::{
    GatewayTarget, MeshNetworks, NetworkEndpoints,
};
use std::{
    collections::{hash_map::Entry as HashEntry, BTreeMap},
    net::IpAddr,
    sync::Arc,
};
use tracing::{debug, trace, warn};

/// Marks a service as a gateway into the labelled network.
pub(crate) const NETWORK_LABEL: &str = "topology.istio.io/network";
/// Overrides the gateway port of a labelled gateway service.
pub(crate) const GATEWAY_PORT_LABEL: &str = "networking.istio.io/gatewayPort";
pub const DEFAULT_NETWORK_GATEWAY_PORT: u16 = 15443;

const FIXED_GATEWAY_SOURCE: &str = "MeshNetworks";
const DYNAMIC_GATEWAY_SOURCE: &str = "k8s";

/// The CIDR and registry lookups derived from a mesh networks document.
#[derive(Debug, Default)]
pub struct NetworkTable {
    ranges: Vec<(IpNet, String)>,

    /// Registry (cluster) IDs to the first network that claimed them.
    registry_networks: HashMap<String, String>,

    /// The network claiming this controller's registry.
    local_network: Option<String>,

    /// Ports of the gateway services of the local network, by hostname.
    registry_service_name_gateways: HashMap<String, u16>,

    /// Gateway addresses that must be resolved through DNS.
    dns_names: NameSet,

    /// Hostnames of the gateway services of the local network.
    service_names: NameSet,
}

#[derive(Debug, Default)]
pub(crate) struct Topology {
    table: Arc<NetworkTable>,

    /// Gateways by service hostname, then by network.
    gateways: HashMap<String, BTreeMap<String, Vec<Gateway>>>,

    /// The names currently passed to the DNS resolver, by referer.
    dns_watches: HashMap<Referer, NameSet>,
}

// === impl NetworkTable ===

impl NetworkTable {
    pub fn build(config: &MeshNetworks, cluster: &ClusterInfo) -> Self {
        let mut table = Self::default();

        for (network, spec) in &config.networks {
            for ep in &spec.endpoints {
                match ep {
                    NetworkEndpoints::FromCidr(cidr) => match parse_cidr(cidr) {
                        Some(net) => table.ranges.push((net, network.clone())),
                        None => warn!(%cidr, %network, "Unable to parse CIDR"),
                    },
                    NetworkEndpoints::FromRegistry(registry) => {
                        match table.registry_networks.entry(registry.clone()) {
                            HashEntry::Vacant(entry) => {
                                entry.insert(network.clone());
                            }
                            HashEntry::Occupied(entry) => warn!(
                                %registry,
                                first = %entry.get(),
                                ignored = %network,
                                "Multiple networks specify the same registry; only the first is used",
                            ),
                        }
                    }
                }
            }
        }

        table.local_network = table.registry_networks.get(&cluster.cluster_id).cloned();

        for (network, spec) in &config.networks {
            for gw in &spec.gateways {
                match &gw.target {
                    GatewayTarget::Address(addr) => {
                        if addr.parse::<IpAddr>().is_err() {
                            table.dns_names.insert(addr.clone());
                        }
                    }
                    GatewayTarget::RegistryServiceName(name) => {
                        if table.local_network.as_ref() != Some(network) {
                            continue;
                        }
                        let Ok(port) = u16::try_from(gw.port) else {
                            warn!(%name, port = gw.port, "Invalid gateway port");
                            continue;
                        };
                        let hostname = cluster.canonical_service_name(name);
                        table
                            .registry_service_name_gateways
                            .insert(hostname.clone(), port);
                        table.service_names.insert(hostname);
                    }
                }
            }
        }

        debug!(
            ranges = table.ranges.len(),
            local_network = ?table.local_network,
            gateway_services = table.service_names.len(),
            dns_names = table.dns_names.len(),
            "Built network table",
        );
        table
    }

    /// The network of the most specific range containing `ip`.
    pub fn network_for_address(&self, ip: IpAddr) -> Option<&str> {
        let mut best: Option<&(IpNet, String)> = None;
        for entry in self.ranges.iter().filter(|(net, _)| net.contains(&ip)) {
            match best {
                Some((net, _)) if net.prefix_len() >= entry.0.prefix_len() => {
                    trace!(%ip, ignored = %entry.1, "Address matches multiple networks");
                }
                _ => best = Some(entry),
            }
        }
        best.map(|(_, network)| network.as_str())
    }

    pub fn network_for_registry(&self, cluster_id: &str) -> Option<&str> {
        self.registry_networks.get(cluster_id).map(String::as_str)
    }

    /// The network of an endpoint address: a range match, else the local
    /// registry's network, else empty.
    pub(crate) fn endpoint_network(&self, addr: &str) -> String {
        addr.parse::<IpAddr>()
            .ok()
            .and_then(|ip| self.network_for_address(ip))
            .or(self.local_network.as_deref())
            .unwrap_or_default()
            .to_string()
    }
}

fn parse_cidr(s: &str) -> Option<IpNet> {
    s.parse::<IpNet>()
        .ok()
        .or_else(|| s.parse::<IpAddr>().ok().map(IpNet::from))
}

// === impl Topology ===

impl Topology {
    pub(crate) fn table(&self) -> &Arc<NetworkTable> {
        &self.table
    }

    /// Swaps in a rebuilt table and recomputes every gateway.
    pub(crate) fn reload(
        &mut self,
        table: NetworkTable,
        services: &ServiceIndex,
        cluster_id: &str,
        dns: &mut Vec<DnsAction>,
    ) {
        let prior = std::mem::replace(&mut self.table, Arc::new(table));
        let table = self.table.clone();

        self.set_watch(mesh_networks_referer(), table.dns_names.clone(), dns);

        let (added, deleted) = table.service_names.diff(&prior.service_names);
        for hostname in deleted {
            self.set_watch(fixed_referer(&hostname), NameSet::default(), dns);
        }
        for hostname in added {
            let names = services
                .get(&hostname)
                .map(|e| dns_names(&e.service, cluster_id))
                .unwrap_or_default();
            self.set_watch(fixed_referer(&hostname), names, dns);
        }

        self.gateways.clear();
        for hostname in services.hostnames() {
            if let Some(entry) = services.get(hostname) {
                self.extract_gateways(&entry.service, cluster_id, dns);
            }
        }
    }

    /// Determines whether `svc` is a gateway and republishes its gateways.
    pub(crate) fn extract_gateways(
        &mut self,
        svc: &Service,
        cluster_id: &str,
        dns: &mut Vec<DnsAction>,
    ) {
        let hostname = &svc.hostname;
        let names = dns_names(svc, cluster_id);
        if self.table.service_names.contains(hostname) {
            self.set_watch(fixed_referer(hostname), names.clone(), dns);
        }
        if svc.attributes.labels.get(NETWORK_LABEL).is_some() {
            self.set_watch(dynamic_referer(hostname), names, dns);
        } else {
            self.set_watch(dynamic_referer(hostname), NameSet::default(), dns);
        }

        let Some((mut port, network)) = self.gateway_details(svc) else {
            if self.gateways.remove(hostname).is_some() {
                debug!(%hostname, "No longer a gateway");
            }
            return;
        };

        if let Some(node_port) = svc
            .attributes
            .cluster_external_ports
            .get(cluster_id)
            .and_then(|ports| ports.get(&port))
        {
            port = *node_port;
        }

        let gateways = svc
            .attributes
            .cluster_external_addresses
            .get(cluster_id)
            .into_iter()
            .flatten()
            .map(|address| Gateway {
                address: address.clone(),
                port,
            })
            .collect::<Vec<_>>();
        debug!(%hostname, %network, ?gateways, "Gateway");
        self.gateways
            .insert(hostname.clone(), Some((network, gateways)).into_iter().collect());
    }

    pub(crate) fn remove_service(&mut self, hostname: &str, dns: &mut Vec<DnsAction>) {
        self.gateways.remove(hostname);
        self.set_watch(fixed_referer(hostname), NameSet::default(), dns);
        self.set_watch(dynamic_referer(hostname), NameSet::default(), dns);
    }

    /// The gateway port and network of `svc`, if it is a gateway.
    fn gateway_details(&self, svc: &Service) -> Option<(u16, String)> {
        let labels = &svc.attributes.labels;
        if let Some(network) = labels.get(NETWORK_LABEL) {
            let port = match labels.get(GATEWAY_PORT_LABEL) {
                None => DEFAULT_NETWORK_GATEWAY_PORT,
                Some(p) => p.parse().unwrap_or_else(|_| {
                    warn!(
                        port = %p,
                        service = %svc.hostname,
                        default = DEFAULT_NETWORK_GATEWAY_PORT,
                        "Could not parse gateway port label",
                    );
                    DEFAULT_NETWORK_GATEWAY_PORT
                }),
            };
            return Some((port, network.to_string()));
        }

        let port = self.table.registry_service_name_gateways.get(&svc.hostname)?;
        Some((*port, self.table.local_network.clone().unwrap_or_default()))
    }

    /// Gateways merged across services, by network.
    pub(crate) fn network_gateways(&self) -> BTreeMap<String, Vec<Gateway>> {
        let mut merged = BTreeMap::<String, Vec<Gateway>>::new();
        for by_network in self.gateways.values() {
            for (network, gateways) in by_network {
                if !gateways.is_empty() {
                    merged
                        .entry(network.clone())
                        .or_default()
                        .extend(gateways.iter().cloned());
                }
            }
        }
        for gateways in merged.values_mut() {
            gateways.sort();
            gateways.dedup();
        }
        merged
    }

    /// True if `name` is watched on behalf of any gateway.
    pub(crate) fn is_gateway_dns(&self, name: &str) -> bool {
        self.dns_watches.values().any(|names| names.contains(name))
    }

    /// Records the names to watch for `referer`, emitting a resolver call only
    /// when they differ from what was last sent.
    fn set_watch(&mut self, referer: Referer, names: NameSet, dns: &mut Vec<DnsAction>) {
        if names.is_empty() {
            if self.dns_watches.remove(&referer).is_some() {
                debug!(?referer, "Stop watching DNS names");
                dns.push(DnsAction::Cancel(referer));
            }
            return;
        }
        if self.dns_watches.get(&referer) == Some(&names) {
            return;
        }
        debug!(?referer, names = ?names.list(), "Watching DNS names");
        dns.push(DnsAction::Watch(referer.clone(), names.list()));
        self.dns_watches.insert(referer, names);
    }
}

/// The external addresses of `svc` that are hostnames rather than IPs.
fn dns_names(svc: &Service, cluster_id: &str) -> NameSet {
    svc.attributes
        .cluster_external_addresses
        .get(cluster_id)
        .into_iter()
        .flatten()
        .filter(|a| a.parse::<IpAddr>().is_err())
        .cloned()
        .collect()
}

fn mesh_networks_referer() -> Referer {
    Referer::new("istio.mesh", "MeshNetworks", "")
}

fn fixed_referer(hostname: &str) -> Referer {
    Referer::new(FIXED_GATEWAY_SOURCE, "Service", hostname)
}

fn dynamic_referer(hostname: &str) -> Referer {
    Referer::new(DYNAMIC_GATEWAY_SOURCE, "Service", hostname)
}
