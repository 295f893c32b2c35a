//! Service -> registry record.

use crate::{node::NodeIndex, pod::PodInfo, ClusterInfo};
use ahash::AHashMap as HashMap;
use anyhow::{Context, Result};
use mesh_registry_controller_core::{
    push::ChangeKind, Port, Protocol, Resolution, Service, ServiceAttributes, KUBERNETES_REGISTRY,
};
use mesh_registry_controller_k8s_api::{self as k8s, IntOrString, Labels, ResourceExt};
use std::{
    collections::{hash_map::Entry as HashEntry, BTreeMap},
    net::IpAddr,
    sync::Arc,
};
use tracing::{debug, trace, warn};

pub(crate) const KUBE_SERVICE_ACCOUNTS_ANNOTATION: &str = "alpha.istio.io/kubernetes-serviceaccounts";
pub(crate) const CANONICAL_SERVICE_ACCOUNTS_ANNOTATION: &str =
    "alpha.istio.io/canonical-serviceaccounts";
/// A JSON label map selecting the nodes that expose a node-port gateway.
pub(crate) const NODE_SELECTOR_ANNOTATION: &str = "traffic.istio.io/nodeSelector";

#[derive(Debug, Default)]
pub(crate) struct ServiceIndex {
    by_hostname: HashMap<String, ServiceEntry>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ServiceEntry {
    pub service: Arc<Service>,

    /// Empty when the service does not select pods.
    pub selector: Labels,

    /// Target ports by service port number.
    pub target_ports: BTreeMap<u16, TargetPort>,

    /// Set for node-port gateway services.
    pub node_selector: Option<Labels>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum TargetPort {
    Number(u16),
    Name(String),
}

// === impl ServiceIndex ===

impl ServiceIndex {
    /// Inserts or replaces a service. Returns `None` if an identical record
    /// was already indexed.
    pub(crate) fn insert(&mut self, entry: ServiceEntry) -> Option<ChangeKind> {
        match self.by_hostname.entry(entry.service.hostname.clone()) {
            HashEntry::Vacant(e) => {
                debug!(hostname = %e.key(), "Adding");
                e.insert(entry);
                Some(ChangeKind::Add)
            }
            HashEntry::Occupied(mut e) => {
                if *e.get() == entry {
                    trace!(hostname = %e.key(), "No changes");
                    return None;
                }
                debug!(hostname = %e.key(), "Updating");
                e.insert(entry);
                Some(ChangeKind::Update)
            }
        }
    }

    pub(crate) fn remove(&mut self, hostname: &str) -> Option<ServiceEntry> {
        let entry = self.by_hostname.remove(hostname)?;
        debug!(%hostname, "Deleted");
        Some(entry)
    }

    pub(crate) fn get(&self, hostname: &str) -> Option<&ServiceEntry> {
        self.by_hostname.get(hostname)
    }

    pub(crate) fn hostnames(&self) -> impl Iterator<Item = &String> {
        self.by_hostname.keys()
    }

    /// Entries ordered by hostname.
    pub(crate) fn sorted(&self) -> Vec<&ServiceEntry> {
        let mut entries = self.by_hostname.values().collect::<Vec<_>>();
        entries.sort_by(|a, b| a.service.hostname.cmp(&b.service.hostname));
        entries
    }

    /// Recomputes the external addresses of node-port gateway services,
    /// returning the services that changed.
    pub(crate) fn update_node_port_addresses(
        &mut self,
        nodes: &NodeIndex,
        cluster_id: &str,
    ) -> Vec<Arc<Service>> {
        let mut updated = Vec::new();
        for entry in self.by_hostname.values_mut() {
            if entry.set_node_port_addresses(nodes, cluster_id) {
                debug!(hostname = %entry.service.hostname, "Updated node-port gateway addresses");
                updated.push(entry.service.clone());
            }
        }
        updated
    }

    pub(crate) fn len(&self) -> usize {
        self.by_hostname.len()
    }
}

// === impl ServiceEntry ===

impl ServiceEntry {
    pub(crate) fn from_service(svc: &k8s::Service, cluster: &ClusterInfo) -> Result<Self> {
        let namespace = svc.namespace().context("service must have a namespace")?;
        let name = svc.metadata.name.clone().context("service must have a name")?;
        let hostname = cluster.service_hostname(&namespace, &name);
        let spec = svc.spec.clone().unwrap_or_default();

        let external_name = spec
            .external_name
            .clone()
            .filter(|_| spec.type_.as_deref() == Some("ExternalName"));
        let (address, resolution) = if external_name.is_some() {
            (None, Resolution::DnsLb)
        } else {
            match spec.cluster_ip.as_deref() {
                Some("None") => (None, Resolution::Passthrough),
                Some(ip) => (ip.parse::<IpAddr>().ok(), Resolution::ClientSideLb),
                None => (None, Resolution::ClientSideLb),
            }
        };

        let mut ports = Vec::new();
        let mut target_ports = BTreeMap::new();
        let mut node_ports = BTreeMap::new();
        for sp in spec.ports.iter().flatten() {
            let port = u16::try_from(sp.port)
                .with_context(|| format!("invalid port {} on service {hostname}", sp.port))?;
            let name = sp.name.clone().unwrap_or_default();
            let protocol = port_protocol(&name, sp.app_protocol.as_deref(), sp.protocol.as_deref());
            let target = match &sp.target_port {
                Some(IntOrString::Int(0)) | None => TargetPort::Number(port),
                Some(IntOrString::Int(n)) => TargetPort::Number(
                    u16::try_from(*n).with_context(|| format!("invalid target port {n}"))?,
                ),
                Some(IntOrString::String(s)) => match s.parse::<u16>() {
                    Ok(n) => TargetPort::Number(n),
                    Err(_) => TargetPort::Name(s.clone()),
                },
            };
            if let Some(np) = sp.node_port.and_then(|np| u16::try_from(np).ok()) {
                node_ports.insert(port, np);
            }
            target_ports.insert(port, target);
            ports.push(Port {
                name,
                port,
                protocol,
            });
        }

        let annotations = svc.annotations();
        let mut service_accounts = annotations
            .get(KUBE_SERVICE_ACCOUNTS_ANNOTATION)
            .into_iter()
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|sa| !sa.is_empty())
            .map(|sa| cluster.service_account_identity(&namespace, sa))
            .chain(
                annotations
                    .get(CANONICAL_SERVICE_ACCOUNTS_ANNOTATION)
                    .into_iter()
                    .flat_map(|v| v.split(','))
                    .map(str::trim)
                    .filter(|sa| !sa.is_empty())
                    .map(ToString::to_string),
            )
            .collect::<Vec<_>>();
        service_accounts.sort();
        service_accounts.dedup();

        let mut cluster_external_addresses = BTreeMap::new();
        let external_addrs = svc
            .status
            .iter()
            .flat_map(|s| s.load_balancer.iter())
            .flat_map(|lb| lb.ingress.iter().flatten())
            .filter_map(|i| i.ip.clone().or_else(|| i.hostname.clone()))
            .chain(spec.external_ips.iter().flatten().cloned())
            .filter(|a| !a.is_empty())
            .collect::<Vec<_>>();
        if !external_addrs.is_empty() {
            cluster_external_addresses.insert(cluster.cluster_id.clone(), external_addrs);
        }

        let is_node_port = spec.type_.as_deref() == Some("NodePort");
        let mut cluster_external_ports = BTreeMap::new();
        if is_node_port && !node_ports.is_empty() {
            cluster_external_ports.insert(cluster.cluster_id.clone(), node_ports);
        }

        let node_selector = annotations
            .get(NODE_SELECTOR_ANNOTATION)
            .filter(|_| is_node_port)
            .map(|json| {
                serde_json::from_str::<BTreeMap<String, String>>(json)
                    .map(Labels::from)
                    .unwrap_or_else(|error| {
                        warn!(%error, %hostname, "Invalid node selector; selecting all nodes");
                        Labels::default()
                    })
            });

        let selector = spec.selector.clone().unwrap_or_default();
        let service = Service {
            hostname,
            address,
            ports,
            service_accounts,
            mesh_external: external_name.is_some(),
            resolution,
            attributes: ServiceAttributes {
                registry: KUBERNETES_REGISTRY.to_string(),
                uid: format!("istio://{namespace}/services/{name}"),
                name,
                namespace,
                labels: svc.labels().clone().into(),
                label_selectors: selector.clone(),
                external_name,
                cluster_external_addresses,
                cluster_external_ports,
            },
        };

        Ok(Self {
            service: Arc::new(service),
            selector: selector.into(),
            target_ports,
            node_selector,
        })
    }

    /// Replaces the external addresses of a node-port gateway service with
    /// the addresses of its selected nodes. Returns true if they changed.
    pub(crate) fn set_node_port_addresses(&mut self, nodes: &NodeIndex, cluster_id: &str) -> bool {
        let Some(selector) = self.node_selector.as_ref() else {
            return false;
        };
        let addrs = nodes.external_addresses(selector);
        let current = self
            .service
            .attributes
            .cluster_external_addresses
            .get(cluster_id);
        if current.map(Vec::as_slice).unwrap_or_default() == addrs.as_slice() {
            return false;
        }
        let svc = Arc::make_mut(&mut self.service);
        if addrs.is_empty() {
            svc.attributes.cluster_external_addresses.remove(cluster_id);
        } else {
            svc.attributes
                .cluster_external_addresses
                .insert(cluster_id.to_string(), addrs);
        }
        true
    }

    /// The port number that traffic for `port` is delivered to. Named target
    /// ports are resolved against the pod's containers when a pod is known.
    pub(crate) fn target_port(&self, port: &Port, pod: Option<&PodInfo>) -> u16 {
        match self.target_ports.get(&port.port) {
            Some(TargetPort::Number(n)) => *n,
            Some(TargetPort::Name(name)) => pod
                .and_then(|p| p.container_port(name))
                .unwrap_or(port.port),
            None => port.port,
        }
    }
}

fn port_protocol(name: &str, app_protocol: Option<&str>, protocol: Option<&str>) -> Protocol {
    if protocol == Some("UDP") {
        return Protocol::Udp;
    }
    if let Some(p) = app_protocol.map(Protocol::parse) {
        if p != Protocol::Unsupported {
            return p;
        }
    }
    Protocol::from_port_name(name)
}
