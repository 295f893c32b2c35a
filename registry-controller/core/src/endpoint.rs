use crate::{Labels, Port, Service};
use std::{fmt, sync::Arc};

/// A resolved network endpoint of a service port.
///
/// Identified by its service hostname, `address` and `service_port_name`.
/// Endpoints refer to workloads only through `uid`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    pub endpoint_port: u16,
    pub service_port_name: String,
    pub labels: Labels,
    pub service_account: String,
    pub network: String,
    pub locality: Locality,
    pub tls_mode: TlsMode,
    /// `kubernetes://<pod>.<namespace>`, empty when no workload backs the address.
    pub uid: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Locality {
    /// `region/zone/subzone`
    pub label: String,
    pub cluster_id: String,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum TlsMode {
    #[default]
    Disabled,
    Istio,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceInstance {
    pub service: Arc<Service>,
    pub service_port: Port,
    pub endpoint: Endpoint,
}

// === impl TlsMode ===

impl TlsMode {
    pub fn from_label(value: Option<&str>) -> Self {
        match value {
            Some("istio") => Self::Istio,
            _ => Self::Disabled,
        }
    }
}

impl fmt::Display for TlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => "disabled".fmt(f),
            Self::Istio => "istio".fmt(f),
        }
    }
}
