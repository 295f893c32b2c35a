//! The registry controller owns every index and serializes their updates.
//!
//! Each index sits behind its own lock. Operations that touch several indices
//! acquire them in a fixed order (pods/nodes, services, endpoints, topology),
//! and every externally visible effect is dispatched only after all locks are
//! released.

use crate::{
    endpoints::{EndpointIndex, EndpointSet, EndpointSetKey, HostRef, Resolver},
    health,
    network::{NetworkTable, Topology},
    node::{NodeIndex, NodeLocality},
    notify::{endpoints_push, Effects, ServiceHandler},
    pod::{PodIndex, PodInfo, PodKey, PodUpdate, TLS_MODE_LABEL},
    service::{ServiceEntry, ServiceIndex},
    ClusterInfo,
};
use ahash::AHashSet as HashSet;
use anyhow::Result;
use futures::{prelude::*, stream::BoxStream};
use mesh_registry_controller_core::{
    dns::DnsResolver,
    push::{ChangeKind, Notifier, Push, PushReason},
    Endpoint, Gateway, Labels, Locality, Port, Probe, Proxy, Service, ServiceDiscovery,
    ServiceInstance, TlsMode,
};
use mesh_registry_controller_k8s_api::{self as k8s, MeshNetworks, ResourceExt};
use parking_lot::{RwLock, RwLockWriteGuard};
use std::{collections::BTreeMap, fmt, net::IpAddr, sync::Arc};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, info_span, instrument, warn, Instrument};

/// An update observed from the cluster or from mesh configuration.
#[derive(Clone, Debug)]
pub enum Event {
    Service(Change<k8s::Service>),
    EndpointSet(Change<EndpointSet>),
    Pod(Change<k8s::Pod>),
    Node(Change<k8s::Node>),
    NetworkConfig(MeshNetworks),
}

#[derive(Clone, Debug)]
pub enum Change<T> {
    Apply(T),
    Delete(T),
    /// The complete current set of resources, e.g. after a relist.
    Reset(Vec<T>),
}

pub type EventStream = BoxStream<'static, Event>;

pub struct Controller {
    cluster: Arc<ClusterInfo>,
    pods: RwLock<PodCache>,
    services: RwLock<ServiceIndex>,
    endpoints: RwLock<EndpointIndex>,
    topology: RwLock<Topology>,
    notifier: Arc<dyn Notifier>,
    dns: Option<Arc<dyn DnsResolver>>,
    service_handlers: RwLock<Vec<ServiceHandler>>,
}

/// Pods and nodes share a lock since pod locality is derived from nodes.
#[derive(Debug, Default)]
struct PodCache {
    pods: PodIndex,
    nodes: NodeIndex,
}

/// Stops the event workers started by [`Controller::start`]. Dropping the
/// handle also stops them.
#[derive(Debug)]
pub struct Handle {
    shutdown: watch::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexSizes {
    pub services: usize,
    pub pods: usize,
    pub nodes: usize,
    pub endpoint_sets: usize,
    pub pending_resolutions: usize,
    pub network_gateways: usize,
}

// === impl Controller ===

impl Controller {
    pub fn new(
        cluster: ClusterInfo,
        notifier: Arc<dyn Notifier>,
        dns: Option<Arc<dyn DnsResolver>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cluster: Arc::new(cluster),
            pods: Default::default(),
            services: Default::default(),
            endpoints: Default::default(),
            topology: Default::default(),
            notifier,
            dns,
            service_handlers: Default::default(),
        })
    }

    pub fn cluster_info(&self) -> &ClusterInfo {
        &self.cluster
    }

    /// Registers a function to be called after each service change.
    ///
    /// Handlers are called synchronously and must not block or register
    /// further handlers.
    pub fn append_service_handler(
        &self,
        f: impl Fn(&Service, ChangeKind) + Send + Sync + 'static,
    ) {
        self.service_handlers.write().push(Box::new(f));
    }

    /// Spawns a worker for each stream. Events within a stream are applied in
    /// order.
    pub fn start(self: &Arc<Self>, streams: Vec<EventStream>) -> Handle {
        let (shutdown, rx) = watch::channel(());
        let tasks = streams
            .into_iter()
            .enumerate()
            .map(|(i, events)| {
                let ctrl = self.clone();
                let shutdown = rx.clone();
                tokio::spawn(ctrl.process(events, shutdown).instrument(info_span!("events", i)))
            })
            .collect();
        info!(cluster = %self.cluster.cluster_id, "Started");
        Handle { shutdown, tasks }
    }

    async fn process(self: Arc<Self>, mut events: EventStream, mut shutdown: watch::Receiver<()>) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    debug!("Shutting down");
                    return;
                }
                event = events.next() => match event {
                    Some(event) => self.handle(event),
                    None => {
                        debug!("Event stream ended");
                        return;
                    }
                },
            }
        }
    }

    pub fn handle(&self, event: Event) {
        match event {
            Event::Service(Change::Apply(svc)) => self.apply_service(svc),
            Event::Service(Change::Delete(svc)) => self.delete_service(&svc),
            Event::Service(Change::Reset(svcs)) => self.reset_services(svcs),
            Event::EndpointSet(Change::Apply(set)) => self.apply_endpoint_set(set),
            Event::EndpointSet(Change::Delete(set)) => self.delete_endpoint_set(&set.key()),
            Event::EndpointSet(Change::Reset(sets)) => self.reset_endpoint_sets(sets),
            Event::Pod(Change::Apply(pod)) => self.apply_pod(pod),
            Event::Pod(Change::Delete(pod)) => self.delete_pod(&pod),
            Event::Pod(Change::Reset(pods)) => self.reset_pods(pods),
            Event::Node(Change::Apply(node)) => self.apply_node(node),
            Event::Node(Change::Delete(node)) => match node.metadata.name.as_deref() {
                Some(name) => self.delete_node(name),
                None => warn!("Ignoring deleted node without a name"),
            },
            Event::Node(Change::Reset(nodes)) => self.reset_nodes(nodes),
            Event::NetworkConfig(config) => self.reload_mesh_networks(&config),
        }
    }

    // === Services ===

    #[instrument(skip_all, fields(ns = ?svc.metadata.namespace, name = ?svc.metadata.name))]
    pub fn apply_service(&self, svc: k8s::Service) {
        let mut entry = match ServiceEntry::from_service(&svc, &self.cluster) {
            Ok(entry) => entry,
            Err(error) => {
                warn!(%error, "Ignoring invalid service");
                return;
            }
        };

        let mut effects = Effects::default();
        {
            let cache = self.pods.read();
            entry.set_node_port_addresses(&cache.nodes, &self.cluster.cluster_id);
            let svc = entry.service.clone();

            let mut services = self.services.write();
            let Some(kind) = services.insert(entry) else {
                return;
            };
            effects.service(svc.clone(), kind);

            let mut topology = self.topology.write();
            let gateways = topology.network_gateways();
            topology.extract_gateways(&svc, &self.cluster.cluster_id, &mut effects.dns);
            if topology.network_gateways() != gateways {
                effects.full(PushReason::NetworksChanged);
            }
        }
        self.dispatch(effects);
    }

    pub fn delete_service(&self, svc: &k8s::Service) {
        if let Some(hostname) = self.service_hostname(svc) {
            self.delete_service_hostname(&hostname);
        }
    }

    #[instrument(skip(self))]
    fn delete_service_hostname(&self, hostname: &str) {
        let mut effects = Effects::default();
        {
            let mut services = self.services.write();
            let Some(entry) = services.remove(hostname) else {
                return;
            };
            effects.service(entry.service, ChangeKind::Delete);

            let mut topology = self.topology.write();
            let gateways = topology.network_gateways();
            topology.remove_service(hostname, &mut effects.dns);
            if topology.network_gateways() != gateways {
                effects.full(PushReason::NetworksChanged);
            }
        }
        self.dispatch(effects);
    }

    #[instrument(skip_all)]
    pub fn reset_services(&self, svcs: Vec<k8s::Service>) {
        let mut stale = self
            .services
            .read()
            .hostnames()
            .cloned()
            .collect::<HashSet<_>>();
        for svc in svcs {
            if let Some(hostname) = self.service_hostname(&svc) {
                stale.remove(&hostname);
            }
            self.apply_service(svc);
        }
        for hostname in stale {
            self.delete_service_hostname(&hostname);
        }
    }

    fn service_hostname(&self, svc: &k8s::Service) -> Option<String> {
        let ns = svc.namespace()?;
        let name = svc.metadata.name.as_deref()?;
        Some(self.cluster.service_hostname(&ns, name))
    }

    // === Endpoint sets ===

    pub fn apply_endpoint_set(&self, set: EndpointSet) {
        let mut effects = Effects::default();
        {
            let cache = self.pods.read();
            let services = self.services.read();
            let mut endpoints = self.endpoints.write();
            let topology = self.topology.read();

            let hostname = self.cluster.service_hostname(&set.namespace, &set.service);
            let resolver = self.joiner(&cache, topology.table());
            let hosts = endpoints.apply(set, hostname, &resolver);
            self.endpoint_pushes(&services, &endpoints, hosts, &mut effects);
        }
        self.dispatch(effects);
    }

    pub fn delete_endpoint_set(&self, key: &EndpointSetKey) {
        let mut effects = Effects::default();
        {
            let services = self.services.read();
            let mut endpoints = self.endpoints.write();
            let hosts = endpoints.delete(key).into_iter().collect();
            self.endpoint_pushes(&services, &endpoints, hosts, &mut effects);
        }
        self.dispatch(effects);
    }

    #[instrument(skip_all)]
    pub fn reset_endpoint_sets(&self, sets: Vec<EndpointSet>) {
        let mut stale = self
            .endpoints
            .read()
            .keys()
            .cloned()
            .collect::<HashSet<_>>();
        for set in sets {
            stale.remove(&set.key());
            self.apply_endpoint_set(set);
        }
        for key in stale {
            self.delete_endpoint_set(&key);
        }
    }

    fn joiner<'a>(&'a self, cache: &'a PodCache, network: &'a NetworkTable) -> Resolver<'a> {
        Resolver {
            cluster: &self.cluster,
            pods: &cache.pods,
            nodes: &cache.nodes,
            network,
        }
    }

    fn endpoint_pushes(
        &self,
        services: &ServiceIndex,
        endpoints: &EndpointIndex,
        hosts: Vec<HostRef>,
        effects: &mut Effects,
    ) {
        for HostRef {
            hostname,
            namespace,
        } in hosts
        {
            let service = services.get(&hostname).map(|e| e.service.as_ref());
            effects.pushes.push(endpoints_push(
                service,
                &self.cluster.cluster_id,
                &hostname,
                &namespace,
                endpoints.endpoints(&hostname).to_vec(),
            ));
        }
    }

    // === Pods ===

    #[instrument(skip_all, fields(ns = ?pod.metadata.namespace, name = ?pod.metadata.name))]
    pub fn apply_pod(&self, pod: k8s::Pod) {
        let key = match PodKey::from_pod(&pod) {
            Ok(key) => key,
            Err(error) => {
                warn!(%error, "Ignoring invalid pod");
                return;
            }
        };

        let mut effects = Effects::default();
        {
            let mut cache = self.pods.write();
            let ip = match cache.pods.apply(pod) {
                Ok(PodUpdate::Addressable(ip)) => ip,
                Ok(_) => return,
                Err(error) => {
                    warn!(%error, "Ignoring invalid pod");
                    return;
                }
            };
            let cache = RwLockWriteGuard::downgrade(cache);

            // Proxy configuration for this address may have been computed
            // before the pod was known.
            effects.pushes.push(Push::Proxy {
                cluster_id: self.cluster.cluster_id.clone(),
                address: Some(ip),
            });

            let services = self.services.read();
            let mut endpoints = self.endpoints.write();
            let topology = self.topology.read();
            let resolver = self.joiner(&cache, topology.table());
            let hosts = endpoints.retry_pod(&key, &resolver);
            self.endpoint_pushes(&services, &endpoints, hosts, &mut effects);
        }
        self.dispatch(effects);
    }

    /// Endpoints derived from the pod are left in place until their endpoint
    /// set changes.
    pub fn delete_pod(&self, pod: &k8s::Pod) {
        match PodKey::from_pod(pod) {
            Ok(key) => {
                self.pods.write().pods.delete(&key);
            }
            Err(error) => warn!(%error, "Ignoring invalid pod"),
        }
    }

    #[instrument(skip_all)]
    pub fn reset_pods(&self, pods: Vec<k8s::Pod>) {
        let mut stale = self
            .pods
            .read()
            .pods
            .keys()
            .cloned()
            .collect::<HashSet<_>>();
        for pod in pods {
            if let Ok(key) = PodKey::from_pod(&pod) {
                stale.remove(&key);
            }
            self.apply_pod(pod);
        }
        let mut cache = self.pods.write();
        for key in stale {
            cache.pods.delete(&key);
        }
    }

    // === Nodes ===

    pub fn apply_node(&self, node: k8s::Node) {
        self.update_nodes(|nodes| nodes.apply(node));
    }

    pub fn delete_node(&self, name: &str) {
        self.update_nodes(|nodes| nodes.delete(name));
    }

    pub fn reset_nodes(&self, nodes: Vec<k8s::Node>) {
        self.update_nodes(|index| index.reset(nodes));
    }

    /// Applies a node change and, if node addresses may have changed,
    /// recomputes node-port gateways.
    fn update_nodes(&self, f: impl FnOnce(&mut NodeIndex) -> bool) {
        let mut effects = Effects::default();
        {
            let mut cache = self.pods.write();
            if !f(&mut cache.nodes) {
                return;
            }
            let cache = RwLockWriteGuard::downgrade(cache);

            let mut services = self.services.write();
            let updated =
                services.update_node_port_addresses(&cache.nodes, &self.cluster.cluster_id);
            if updated.is_empty() {
                return;
            }

            let mut topology = self.topology.write();
            for svc in &updated {
                topology.extract_gateways(svc, &self.cluster.cluster_id, &mut effects.dns);
            }
            effects.full(PushReason::NodeGatewayUpdate);
        }
        self.dispatch(effects);
    }

    // === Topology ===

    /// Rebuilds the network table and every gateway, then re-resolves all
    /// endpoints against the new table.
    #[instrument(skip_all, fields(networks = config.networks.len()))]
    pub fn reload_mesh_networks(&self, config: &MeshNetworks) {
        let table = NetworkTable::build(config, &self.cluster);

        let mut effects = Effects::default();
        {
            let cache = self.pods.read();
            let services = self.services.read();
            let mut endpoints = self.endpoints.write();
            let mut topology = self.topology.write();

            topology.reload(table, &services, &self.cluster.cluster_id, &mut effects.dns);
            let table = topology.table().clone();
            endpoints.resolve_all(&self.joiner(&cache, &table));
        }
        info!("Reloaded mesh networks");
        effects.full(PushReason::NetworksChanged);
        self.dispatch(effects);
    }

    /// Called when the addresses of a watched gateway DNS name change.
    pub fn refresh_gateway_endpoints(&self, name: &str) {
        if !self.topology.read().is_gateway_dns(name) {
            debug!(%name, "Ignoring unwatched name");
            return;
        }
        debug!(%name, "Gateway addresses changed");
        let mut effects = Effects::default();
        effects.full(PushReason::DnsUpdate);
        self.dispatch(effects);
    }

    // === Lookups ===

    /// The number of unobserved workloads that endpoint sets are waiting on.
    pub fn pending_resync_len(&self) -> usize {
        self.endpoints.read().pending_len()
    }

    pub fn pod_key_by_ip(&self, ip: &str) -> Option<PodKey> {
        self.pods.read().pods.key_by_ip(ip).cloned()
    }

    pub fn node_locality(&self, name: &str) -> Option<NodeLocality> {
        self.pods.read().nodes.locality(name).cloned()
    }

    pub fn network_for_address(&self, ip: IpAddr) -> Option<String> {
        let topology = self.topology.read();
        topology.table().network_for_address(ip).map(Into::into)
    }

    pub fn network_for_registry(&self, cluster_id: &str) -> Option<String> {
        let topology = self.topology.read();
        topology.table().network_for_registry(cluster_id).map(Into::into)
    }

    pub fn sizes(&self) -> IndexSizes {
        let (pods, nodes) = {
            let cache = self.pods.read();
            (cache.pods.len(), cache.nodes.len())
        };
        let services = self.services.read().len();
        let (endpoint_sets, pending_resolutions) = {
            let endpoints = self.endpoints.read();
            (endpoints.len(), endpoints.pending_len())
        };
        let network_gateways = self
            .topology
            .read()
            .network_gateways()
            .values()
            .map(Vec::len)
            .sum();
        IndexSizes {
            services,
            pods,
            nodes,
            endpoint_sets,
            pending_resolutions,
            network_gateways,
        }
    }

    fn dispatch(&self, effects: Effects) {
        let handlers = self.service_handlers.read();
        effects.dispatch(&*self.notifier, self.dns.as_deref(), &handlers);
    }

    /// Instances of the services in `pod`'s namespace that select it.
    fn pod_instances(&self, proxy: &Proxy, pod: &PodInfo, cache: &PodCache) -> Vec<ServiceInstance> {
        let services = self.services.read();
        let topology = self.topology.read();
        let resolver = self.joiner(cache, topology.table());

        let mut instances = Vec::new();
        for entry in services.sorted() {
            let svc = &entry.service;
            if svc.attributes.namespace != pod.key.namespace
                || entry.selector.is_empty()
                || !entry.selector.subset_of(&pod.labels)
            {
                continue;
            }
            let mut seen = HashSet::new();
            for port in &svc.ports {
                let target = entry.target_port(port, Some(pod));
                if !seen.insert((target, port.protocol)) {
                    continue;
                }
                for ip in &proxy.ip_addresses {
                    instances.push(ServiceInstance {
                        service: svc.clone(),
                        service_port: port.clone(),
                        endpoint: resolver.endpoint(ip, target, &port.name, Some(pod)),
                    });
                }
            }
        }
        instances
    }

    /// Instances derived from the proxy's self-reported metadata.
    fn metadata_instances(&self, proxy: &Proxy) -> Vec<ServiceInstance> {
        let meta = &proxy.metadata;
        let Some(address) = proxy.ip_addresses.first() else {
            return Vec::new();
        };
        if meta.labels.is_empty()
            || !(meta.cluster_id.is_empty() || meta.cluster_id == self.cluster.cluster_id)
        {
            return Vec::new();
        }

        let services = self.services.read();
        let topology = self.topology.read();
        let network = topology.table().endpoint_network(address);
        let locality = proxy
            .locality
            .as_ref()
            .map(|l| l.to_label())
            .unwrap_or_default();

        let mut instances = Vec::new();
        for entry in services.sorted() {
            let svc = &entry.service;
            if svc.attributes.namespace != proxy.config_namespace
                || entry.selector.is_empty()
                || !entry.selector.subset_of(&meta.labels)
            {
                continue;
            }
            let mut seen = HashSet::new();
            for port in &svc.ports {
                let target = entry.target_port(port, None);
                if !seen.insert((target, port.protocol)) {
                    continue;
                }
                instances.push(ServiceInstance {
                    service: svc.clone(),
                    service_port: port.clone(),
                    endpoint: Endpoint {
                        address: address.clone(),
                        endpoint_port: target,
                        service_port_name: port.name.clone(),
                        labels: meta.labels.clone(),
                        service_account: meta.service_account.clone(),
                        network: network.clone(),
                        locality: Locality {
                            label: locality.clone(),
                            cluster_id: self.cluster.cluster_id.clone(),
                        },
                        tls_mode: TlsMode::from_label(meta.labels.get(TLS_MODE_LABEL)),
                        uid: String::new(),
                    },
                });
            }
        }
        instances
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("cluster", &self.cluster)
            .field("pods", &self.pods)
            .field("services", &self.services)
            .field("endpoints", &self.endpoints)
            .field("topology", &self.topology)
            .finish_non_exhaustive()
    }
}

impl ServiceDiscovery for Controller {
    fn services(&self) -> Result<Vec<Arc<Service>>> {
        Ok(self
            .services
            .read()
            .sorted()
            .into_iter()
            .map(|e| e.service.clone())
            .collect())
    }

    fn get_service(&self, hostname: &str) -> Result<Option<Arc<Service>>> {
        Ok(self.services.read().get(hostname).map(|e| e.service.clone()))
    }

    fn instances_by_port(
        &self,
        svc: &Service,
        port: u16,
        labels: &[Labels],
    ) -> Result<Vec<ServiceInstance>> {
        let services = self.services.read();
        // Endpoints of deleted services are not served.
        let Some(entry) = services.get(&svc.hostname) else {
            return Ok(Vec::new());
        };
        let service = entry.service.clone();
        let Some(service_port) = service.port_by_number(port).cloned() else {
            return Ok(Vec::new());
        };

        if let Some(name) = service.attributes.external_name.clone() {
            let endpoint = Endpoint {
                address: name,
                endpoint_port: service_port.port,
                service_port_name: service_port.name.clone(),
                labels: Labels::default(),
                service_account: String::new(),
                network: String::new(),
                locality: Locality {
                    label: String::new(),
                    cluster_id: self.cluster.cluster_id.clone(),
                },
                tls_mode: TlsMode::Disabled,
                uid: String::new(),
            };
            return Ok(vec![ServiceInstance {
                service,
                service_port,
                endpoint,
            }]);
        }

        let endpoints = self.endpoints.read();
        Ok(endpoints
            .endpoints(&service.hostname)
            .iter()
            .filter(|ep| ep.service_port_name == service_port.name)
            .filter(|ep| labels.is_empty() || labels.iter().any(|l| l.subset_of(&ep.labels)))
            .map(|ep| ServiceInstance {
                service: service.clone(),
                service_port: service_port.clone(),
                endpoint: ep.clone(),
            })
            .collect())
    }

    fn get_proxy_service_instances(&self, proxy: &Proxy) -> Result<Vec<ServiceInstance>> {
        if let Some(ip) = proxy.ip_addresses.first() {
            let cache = self.pods.read();
            if let Some(pod) = cache.pods.get_by_ip(ip).cloned() {
                return Ok(self.pod_instances(proxy, &pod, &cache));
            }
        }
        Ok(self.metadata_instances(proxy))
    }

    fn get_istio_service_accounts(&self, svc: &Service, ports: &[u16]) -> Vec<String> {
        let mut accounts = svc.service_accounts.clone();
        for port in ports {
            match self.instances_by_port(svc, *port, &[]) {
                Ok(instances) => accounts.extend(
                    instances
                        .into_iter()
                        .map(|i| i.endpoint.service_account)
                        .filter(|sa| !sa.is_empty()),
                ),
                Err(error) => warn!(%error, hostname = %svc.hostname, port, "Failed to list instances"),
            }
        }
        accounts.sort();
        accounts.dedup();
        accounts
    }

    fn workload_health_check_info(&self, addr: &str) -> Vec<Probe> {
        let cache = self.pods.read();
        cache
            .pods
            .get_by_ip(addr)
            .map(|pod| health::probes(pod))
            .unwrap_or_default()
    }

    fn management_ports(&self, addr: &str) -> Vec<Port> {
        let cache = self.pods.read();
        cache
            .pods
            .get_by_ip(addr)
            .map(|pod| health::management_ports(pod))
            .unwrap_or_default()
    }

    fn network_gateways(&self) -> BTreeMap<String, Vec<Gateway>> {
        self.topology.read().network_gateways()
    }
}

// === impl Handle ===

impl Handle {
    /// Signals every worker to stop and waits for them to finish.
    pub async fn stop(self) {
        let Self { shutdown, tasks } = self;
        drop(shutdown);
        for task in tasks {
            if let Err(error) = task.await {
                warn!(%error, "Event worker failed");
            }
        }
        info!("Stopped");
    }
}
