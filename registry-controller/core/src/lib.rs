#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod dns;
mod endpoint;
mod proxy;
pub mod push;
mod service;

pub use self::{
    endpoint::{Endpoint, Locality, ServiceInstance, TlsMode},
    proxy::{NodeMetadata, Probe, Proxy, ProxyLocality},
    service::{Gateway, Port, Protocol, Resolution, Service, ServiceAttributes},
};
pub use ipnet::{IpNet, Ipv4Net, Ipv6Net};
pub use mesh_registry_controller_k8s_api::Labels;

use anyhow::Result;
use std::{collections::BTreeMap, sync::Arc};

/// The registry tag attached to every service discovered from Kubernetes.
pub const KUBERNETES_REGISTRY: &str = "Kubernetes";

/// Models the queries a service registry answers.
///
/// Absent services, pods and nodes are never errors: lookups return `None` or
/// an empty list.
pub trait ServiceDiscovery {
    /// All known services, ordered by hostname.
    fn services(&self) -> Result<Vec<Arc<Service>>>;

    fn get_service(&self, hostname: &str) -> Result<Option<Arc<Service>>>;

    /// Instances of `svc` on the service port numbered `port`, restricted to
    /// endpoints whose labels satisfy at least one of `labels`. An empty
    /// `labels` slice matches every endpoint.
    fn instances_by_port(
        &self,
        svc: &Service,
        port: u16,
        labels: &[Labels],
    ) -> Result<Vec<ServiceInstance>>;

    /// Instances co-located with `proxy`.
    fn get_proxy_service_instances(&self, proxy: &Proxy) -> Result<Vec<ServiceInstance>>;

    /// The sorted, deduplicated identities that may serve `svc` on `ports`.
    fn get_istio_service_accounts(&self, svc: &Service, ports: &[u16]) -> Vec<String>;

    fn workload_health_check_info(&self, addr: &str) -> Vec<Probe>;

    fn management_ports(&self, addr: &str) -> Vec<Port>;

    /// Gateways by network name.
    fn network_gateways(&self) -> BTreeMap<String, Vec<Gateway>>;
}
