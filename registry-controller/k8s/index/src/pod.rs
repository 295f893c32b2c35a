//! Pod -> IP, locality and identity.

use crate::{node::NodeIndex, ClusterInfo};
use ahash::AHashMap as HashMap;
use anyhow::{Context, Result};
use mesh_registry_controller_core::TlsMode;
use mesh_registry_controller_k8s_api::{self as k8s, Labels, ResourceExt};
use std::{
    collections::{hash_map::Entry as HashEntry, BTreeMap},
    fmt,
    sync::Arc,
};
use tracing::{debug, instrument, trace};

/// Overrides the node-derived locality of a pod. Uses `.` as the separator
/// since label values may not contain `/`.
pub(crate) const LOCALITY_LABEL: &str = "istio-locality";
pub(crate) const TLS_MODE_LABEL: &str = "security.istio.io/tlsMode";
pub(crate) const IDENTITY_ANNOTATION: &str = "alpha.istio.io/identity";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

/// The subset of a pod that the registry needs.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PodInfo {
    pub key: PodKey,
    pub ip: String,
    pub node_name: Option<String>,
    pub labels: Labels,
    pub annotations: BTreeMap<String, String>,
    pub service_account: String,
    pub containers: Vec<k8s::Container>,
}

#[derive(Debug, Default)]
pub(crate) struct PodIndex {
    by_key: HashMap<PodKey, Arc<PodInfo>>,
    by_ip: HashMap<String, PodKey>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum PodUpdate {
    /// The pod became addressable at the given IP, either for the first time
    /// or at a new address.
    Addressable(String),
    Updated,
    Unchanged,
    Removed,
}

// === impl PodKey ===

impl PodKey {
    pub fn new(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub(crate) fn from_pod(pod: &k8s::Pod) -> Result<Self> {
        let namespace = pod.namespace().context("pod must have a namespace")?;
        let name = pod.metadata.name.clone().context("pod must have a name")?;
        Ok(Self { namespace, name })
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl PodIndex ===

impl PodIndex {
    #[instrument(
        skip(self, pod),
        fields(
            ns = ?pod.metadata.namespace,
            name = ?pod.metadata.name,
        )
    )]
    pub(crate) fn apply(&mut self, pod: k8s::Pod) -> Result<PodUpdate> {
        let key = PodKey::from_pod(&pod)?;
        let info = match PodInfo::from_pod(key.clone(), pod) {
            Some(info) => info,
            // Pods without an IP, and pods that have terminated, are not
            // addressable.
            None => {
                return Ok(if self.delete(&key) {
                    PodUpdate::Removed
                } else {
                    PodUpdate::Unchanged
                })
            }
        };

        match self.by_key.entry(key) {
            HashEntry::Vacant(entry) => {
                debug!(ip = %info.ip, "Adding");
                let ip = info.ip.clone();
                self.by_ip.insert(ip.clone(), entry.key().clone());
                entry.insert(Arc::new(info));
                Ok(PodUpdate::Addressable(ip))
            }

            HashEntry::Occupied(mut entry) => {
                if **entry.get() == info {
                    trace!("No changes");
                    return Ok(PodUpdate::Unchanged);
                }

                let prior = std::mem::replace(entry.get_mut(), Arc::new(info));
                let ip = entry.get().ip.clone();
                if prior.ip == ip {
                    debug!("Updated");
                    return Ok(PodUpdate::Updated);
                }

                debug!(prior = %prior.ip, %ip, "Address changed");
                if self.by_ip.get(&prior.ip) == Some(entry.key()) {
                    self.by_ip.remove(&prior.ip);
                }
                self.by_ip.insert(ip.clone(), entry.key().clone());
                Ok(PodUpdate::Addressable(ip))
            }
        }
    }

    #[instrument(skip(self), fields(pod = %key))]
    pub(crate) fn delete(&mut self, key: &PodKey) -> bool {
        let Some(info) = self.by_key.remove(key) else {
            return false;
        };
        if self.by_ip.get(&info.ip) == Some(key) {
            self.by_ip.remove(&info.ip);
        }
        debug!("Deleted");
        true
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &PodKey> {
        self.by_key.keys()
    }

    pub(crate) fn get(&self, key: &PodKey) -> Option<&Arc<PodInfo>> {
        self.by_key.get(key)
    }

    pub(crate) fn key_by_ip(&self, ip: &str) -> Option<&PodKey> {
        self.by_ip.get(ip)
    }

    pub(crate) fn get_by_ip(&self, ip: &str) -> Option<&Arc<PodInfo>> {
        self.key_by_ip(ip).and_then(|k| self.by_key.get(k))
    }

    pub(crate) fn len(&self) -> usize {
        self.by_key.len()
    }
}

// === impl PodInfo ===

impl PodInfo {
    fn from_pod(key: PodKey, pod: k8s::Pod) -> Option<Self> {
        let status = pod.status?;
        if matches!(status.phase.as_deref(), Some("Succeeded" | "Failed")) {
            return None;
        }
        let ip = status.pod_ip.filter(|ip| !ip.is_empty())?;
        let spec = pod.spec.unwrap_or_default();
        Some(Self {
            key,
            ip,
            node_name: spec.node_name.filter(|n| !n.is_empty()),
            labels: pod.metadata.labels.into(),
            annotations: pod.metadata.annotations.unwrap_or_default(),
            service_account: spec
                .service_account_name
                .filter(|sa| !sa.is_empty())
                .unwrap_or_else(|| "default".to_string()),
            containers: spec.containers,
        })
    }

    /// The pod's locality label. An explicit pod label wins over the node's
    /// topology labels; an unknown node yields an empty locality.
    pub(crate) fn locality(&self, nodes: &NodeIndex) -> String {
        if let Some(l) = self.labels.get(LOCALITY_LABEL) {
            return l.replace('.', "/");
        }
        self.node_name
            .as_deref()
            .and_then(|n| nodes.locality(n))
            .map(|l| l.label())
            .unwrap_or_default()
    }

    pub(crate) fn identity(&self, cluster: &ClusterInfo) -> String {
        match self.annotations.get(IDENTITY_ANNOTATION) {
            Some(id) => cluster.custom_identity(id),
            None => cluster.service_account_identity(&self.key.namespace, &self.service_account),
        }
    }

    pub(crate) fn tls_mode(&self) -> TlsMode {
        TlsMode::from_label(self.labels.get(TLS_MODE_LABEL))
    }

    pub(crate) fn uid(&self) -> String {
        format!("kubernetes://{}.{}", self.key.name, self.key.namespace)
    }

    /// Resolves a named container port.
    pub(crate) fn container_port(&self, name: &str) -> Option<u16> {
        self.containers
            .iter()
            .flat_map(|c| c.ports.iter().flatten())
            .find(|p| p.name.as_deref() == Some(name))
            .and_then(|p| u16::try_from(p.container_port).ok())
    }
}
