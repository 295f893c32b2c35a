//! Notifications delivered to the configuration distribution engine.

use crate::Endpoint;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Push {
    /// Recompute all configuration.
    Full { reason: PushReason },

    /// A single service changed.
    Service {
        hostname: String,
        namespace: String,
        kind: ChangeKind,
    },

    /// The complete current endpoint list of a service.
    Endpoints {
        shard: String,
        hostname: String,
        namespace: String,
        endpoints: Vec<Endpoint>,
    },

    /// Proxy-specific configuration may be stale. `None` addresses every proxy
    /// in the cluster.
    Proxy {
        cluster_id: String,
        address: Option<String>,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Add,
    Update,
    Delete,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PushReason {
    HeadlessEndpointUpdate,
    NetworksChanged,
    NodeGatewayUpdate,
    DnsUpdate,
}

/// Receives push notifications.
///
/// Implementations are called synchronously by the controller and must not
/// block.
pub trait Notifier: Send + Sync {
    fn notify(&self, push: Push);
}

// === impl Push ===

impl Push {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Full { .. } => "full",
            Self::Service { .. } => "service",
            Self::Endpoints { .. } => "eds",
            Self::Proxy { .. } => "proxy",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => "add".fmt(f),
            Self::Update => "update".fmt(f),
            Self::Delete => "delete".fmt(f),
        }
    }
}
