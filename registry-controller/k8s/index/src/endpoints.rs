//! Endpoint sets -> resolved endpoints.
//!
//! An endpoint set lists addresses, each optionally referring to the pod that
//! owns it. Addresses whose pod has not been observed yet are withheld and
//! recorded as pending until the pod arrives, or until the set stops
//! referring to it.

use crate::{
    network::NetworkTable,
    node::NodeIndex,
    pod::{PodIndex, PodInfo, PodKey},
    ClusterInfo,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use anyhow::{Context, Result};
use mesh_registry_controller_core::{Endpoint, Labels, Locality, TlsMode};
use mesh_registry_controller_k8s_api::{self as k8s, ResourceExt};
use std::collections::hash_map::Entry as HashEntry;
use tracing::{debug, instrument, trace, warn};

/// Names the service that owns an endpoint slice.
pub(crate) const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

const MAX_NAME_LEN: usize = 253;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointSetKey {
    pub namespace: String,
    pub name: String,
}

/// A version of an `Endpoints` or `EndpointSlice` resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointSet {
    pub namespace: String,
    pub name: String,
    /// The name of the owning service.
    pub service: String,
    pub subsets: Vec<Subset>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Subset {
    pub addresses: Vec<SubsetAddress>,
    pub ports: Vec<SubsetPort>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubsetAddress {
    pub ip: String,
    pub target: Option<WorkloadRef>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubsetPort {
    pub name: String,
    pub port: u16,
}

/// Refers to the pod that owns an endpoint address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid workload reference {field} {value:?}")]
pub struct InvalidWorkloadRef {
    field: &'static str,
    value: String,
}

/// Identifies a hostname whose endpoints changed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct HostRef {
    pub hostname: String,
    pub namespace: String,
}

#[derive(Debug, Default)]
pub(crate) struct EndpointIndex {
    sets: HashMap<EndpointSetKey, StoredSet>,
    by_hostname: HashMap<String, HostEndpoints>,
    pending: PendingResync,
    generation: u64,
}

#[derive(Debug)]
struct StoredSet {
    raw: EndpointSet,
    hostname: String,
    resolved: Vec<Endpoint>,
    /// Orders sets by when they were last applied.
    generation: u64,
}

#[derive(Debug, Default)]
struct HostEndpoints {
    sets: HashSet<EndpointSetKey>,
    merged: Vec<Endpoint>,
}

/// Endpoint sets waiting on pods that have not been observed.
#[derive(Debug, Default)]
pub(crate) struct PendingResync {
    by_pod: HashMap<PodKey, HashSet<EndpointSetKey>>,
    by_set: HashMap<EndpointSetKey, HashSet<PodKey>>,
}

/// Joins endpoint addresses with the pods, nodes and networks they refer to.
pub(crate) struct Resolver<'a> {
    pub cluster: &'a ClusterInfo,
    pub pods: &'a PodIndex,
    pub nodes: &'a NodeIndex,
    pub network: &'a NetworkTable,
}

// === impl EndpointSet ===

impl EndpointSet {
    pub fn key(&self) -> EndpointSetKey {
        EndpointSetKey {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    pub fn from_endpoints(ep: &k8s::Endpoints) -> Result<Self> {
        let namespace = ep.namespace().context("endpoints must have a namespace")?;
        let name = ep.metadata.name.clone().context("endpoints must have a name")?;

        let mut subsets = Vec::new();
        for subset in ep.subsets.iter().flatten() {
            let addresses = subset
                .addresses
                .iter()
                .flatten()
                .map(|a| SubsetAddress {
                    ip: a.ip.clone(),
                    target: a
                        .target_ref
                        .as_ref()
                        .and_then(|r| WorkloadRef::from_object_ref(r, &namespace)),
                })
                .collect();
            let ports = subset
                .ports
                .iter()
                .flatten()
                .map(|p| {
                    Ok(SubsetPort {
                        name: p.name.clone().unwrap_or_default(),
                        port: u16::try_from(p.port)
                            .with_context(|| format!("invalid endpoint port {}", p.port))?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            subsets.push(Subset { addresses, ports });
        }

        Ok(Self {
            service: name.clone(),
            namespace,
            name,
            subsets,
        })
    }

    pub fn from_slice(slice: &k8s::EndpointSlice) -> Result<Self> {
        let namespace = slice
            .namespace()
            .context("endpoint slice must have a namespace")?;
        let name = slice
            .metadata
            .name
            .clone()
            .context("endpoint slice must have a name")?;
        let service = slice
            .labels()
            .get(SERVICE_NAME_LABEL)
            .cloned()
            .with_context(|| format!("endpoint slice {name} has no {SERVICE_NAME_LABEL} label"))?;

        let mut addresses = Vec::new();
        for ep in &slice.endpoints {
            let ready = ep
                .conditions
                .as_ref()
                .and_then(|c| c.ready)
                .unwrap_or(true);
            if !ready {
                continue;
            }
            let target = ep
                .target_ref
                .as_ref()
                .and_then(|r| WorkloadRef::from_object_ref(r, &namespace));
            for ip in &ep.addresses {
                addresses.push(SubsetAddress {
                    ip: ip.clone(),
                    target: target.clone(),
                });
            }
        }

        let ports = slice
            .ports
            .iter()
            .flatten()
            .filter_map(|p| {
                let port = u16::try_from(p.port?).ok()?;
                Some(SubsetPort {
                    name: p.name.clone().unwrap_or_default(),
                    port,
                })
            })
            .collect();

        Ok(Self {
            namespace,
            name,
            service,
            subsets: vec![Subset { addresses, ports }],
        })
    }
}

// === impl WorkloadRef ===

impl WorkloadRef {
    /// Only pod references name workloads.
    fn from_object_ref(r: &k8s::ObjectReference, default_ns: &str) -> Option<Self> {
        if r.kind.as_deref() != Some("Pod") {
            return None;
        }
        Some(Self {
            namespace: r
                .namespace
                .clone()
                .filter(|ns| !ns.is_empty())
                .unwrap_or_else(|| default_ns.to_string()),
            name: r.name.clone().unwrap_or_default(),
        })
    }

    pub fn validate(&self) -> Result<PodKey, InvalidWorkloadRef> {
        for (field, value) in [("namespace", &self.namespace), ("name", &self.name)] {
            if !is_valid_name(value) {
                return Err(InvalidWorkloadRef {
                    field,
                    value: value.clone(),
                });
            }
        }
        Ok(PodKey::new(&self.namespace, &self.name))
    }
}

/// A DNS-1123 subdomain: lowercase alphanumerics, '-' and '.', starting and
/// ending with an alphanumeric.
fn is_valid_name(s: &str) -> bool {
    let alnum = |c: u8| c.is_ascii_lowercase() || c.is_ascii_digit();
    match (s.as_bytes().first(), s.as_bytes().last()) {
        (Some(&first), Some(&last)) => {
            s.len() <= MAX_NAME_LEN
                && alnum(first)
                && alnum(last)
                && s.bytes().all(|c| alnum(c) || c == b'-' || c == b'.')
        }
        _ => false,
    }
}

// === impl Resolver ===

impl Resolver<'_> {
    /// Resolves the addresses of `set`. Returns the resolved endpoints and the
    /// pods that are referenced but unknown.
    pub(crate) fn resolve(&self, set: &EndpointSet) -> (Vec<Endpoint>, Vec<PodKey>) {
        let mut endpoints = Vec::new();
        let mut missing = Vec::new();
        for subset in &set.subsets {
            for addr in &subset.addresses {
                let pod = match &addr.target {
                    None => None,
                    Some(target) => match target.validate() {
                        Err(error) => {
                            warn!(%error, ip = %addr.ip, set = %set.name, "Skipping address");
                            continue;
                        }
                        Ok(key) => match self.pods.get(&key) {
                            Some(pod) => Some(pod.as_ref()),
                            None => {
                                trace!(pod = %key, ip = %addr.ip, "Pod not yet observed");
                                missing.push(key);
                                continue;
                            }
                        },
                    },
                };
                for port in &subset.ports {
                    endpoints.push(self.endpoint(&addr.ip, port.port, &port.name, pod));
                }
            }
        }
        (endpoints, missing)
    }

    pub(crate) fn endpoint(
        &self,
        address: &str,
        port: u16,
        port_name: &str,
        pod: Option<&PodInfo>,
    ) -> Endpoint {
        let network = self.network.endpoint_network(address);
        let cluster_id = self.cluster.cluster_id.clone();
        match pod {
            Some(pod) => Endpoint {
                address: address.to_string(),
                endpoint_port: port,
                service_port_name: port_name.to_string(),
                labels: pod.labels.clone(),
                service_account: pod.identity(self.cluster),
                network,
                locality: Locality {
                    label: pod.locality(self.nodes),
                    cluster_id,
                },
                tls_mode: pod.tls_mode(),
                uid: pod.uid(),
            },
            None => Endpoint {
                address: address.to_string(),
                endpoint_port: port,
                service_port_name: port_name.to_string(),
                labels: Labels::default(),
                service_account: String::new(),
                network,
                locality: Locality {
                    label: String::new(),
                    cluster_id,
                },
                tls_mode: TlsMode::Disabled,
                uid: String::new(),
            },
        }
    }
}

// === impl EndpointIndex ===

impl EndpointIndex {
    /// Applies a version of an endpoint set owned by `hostname`. Returns the
    /// hostnames whose endpoints must be announced; an identical redelivery
    /// announces nothing.
    #[instrument(skip(self, set, resolver), fields(ns = %set.namespace, name = %set.name))]
    pub(crate) fn apply(
        &mut self,
        set: EndpointSet,
        hostname: String,
        resolver: &Resolver<'_>,
    ) -> Vec<HostRef> {
        let key = set.key();
        let (resolved, missing) = resolver.resolve(&set);

        // Pending entries are always recomputed from the latest version, so
        // workloads the set no longer refers to are released here.
        self.pending.clear_set(&key);
        for pod in missing {
            self.pending.insert(pod, key.clone());
        }

        if let Some(stored) = self.sets.get(&key) {
            if stored.raw == set && stored.hostname == hostname && stored.resolved == resolved {
                trace!("No changes");
                return Vec::new();
            }
        }

        self.generation += 1;
        debug!(endpoints = resolved.len(), %hostname, "Applying");
        let namespace = set.namespace.clone();
        let stored = StoredSet {
            raw: set,
            hostname: hostname.clone(),
            resolved,
            generation: self.generation,
        };

        let mut affected = vec![HostRef {
            hostname: hostname.clone(),
            namespace: namespace.clone(),
        }];
        if let Some(prior) = self.sets.insert(key.clone(), stored) {
            if prior.hostname != hostname {
                self.detach(&prior.hostname, &key);
                affected.push(HostRef {
                    hostname: prior.hostname,
                    namespace,
                });
            }
        }
        self.by_hostname
            .entry(hostname)
            .or_default()
            .sets
            .insert(key);

        for host in &affected {
            self.merge(&host.hostname);
        }
        affected
    }

    #[instrument(skip(self), fields(ns = %key.namespace, name = %key.name))]
    pub(crate) fn delete(&mut self, key: &EndpointSetKey) -> Option<HostRef> {
        self.pending.clear_set(key);
        let stored = self.sets.remove(key)?;
        debug!("Deleted");
        self.detach(&stored.hostname, key);
        self.merge(&stored.hostname);
        Some(HostRef {
            hostname: stored.hostname,
            namespace: stored.raw.namespace,
        })
    }

    /// Re-resolves every set waiting on `pod`. Returns the hostnames whose
    /// endpoints changed as a result.
    #[instrument(skip(self, resolver), fields(%pod))]
    pub(crate) fn retry_pod(&mut self, pod: &PodKey, resolver: &Resolver<'_>) -> Vec<HostRef> {
        let keys = self.pending.take(pod);
        let mut affected = Vec::new();
        for key in keys {
            let Some(stored) = self.sets.get_mut(&key) else {
                continue;
            };
            let (resolved, missing) = resolver.resolve(&stored.raw);
            self.pending.clear_set(&key);
            for pod in missing {
                self.pending.insert(pod, key.clone());
            }
            debug!(set = %key.name, endpoints = resolved.len(), "Resolved pending endpoints");
            stored.resolved = resolved;
            affected.push(HostRef {
                hostname: stored.hostname.clone(),
                namespace: stored.raw.namespace.clone(),
            });
        }
        affected.sort();
        affected.dedup();
        for host in &affected {
            self.merge(&host.hostname);
        }
        affected
    }

    /// Re-resolves every set, e.g. after the network topology changes.
    pub(crate) fn resolve_all(&mut self, resolver: &Resolver<'_>) {
        let Self {
            sets,
            by_hostname,
            pending,
            ..
        } = self;
        for (key, stored) in sets.iter_mut() {
            let (resolved, missing) = resolver.resolve(&stored.raw);
            pending.clear_set(key);
            for pod in missing {
                pending.insert(pod, key.clone());
            }
            stored.resolved = resolved;
        }
        for (hostname, host) in by_hostname.iter_mut() {
            host.merged = merge(sets, &host.sets, hostname);
        }
    }

    /// The complete endpoint list of `hostname`.
    pub(crate) fn endpoints(&self, hostname: &str) -> &[Endpoint] {
        self.by_hostname
            .get(hostname)
            .map(|h| h.merged.as_slice())
            .unwrap_or_default()
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &EndpointSetKey> {
        self.sets.keys()
    }

    pub(crate) fn len(&self) -> usize {
        self.sets.len()
    }

    /// The number of unobserved workloads referenced by live endpoint sets.
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn detach(&mut self, hostname: &str, key: &EndpointSetKey) {
        if let HashEntry::Occupied(mut entry) = self.by_hostname.entry(hostname.to_string()) {
            entry.get_mut().sets.remove(key);
            if entry.get().sets.is_empty() {
                entry.remove();
            }
        }
    }

    fn merge(&mut self, hostname: &str) {
        if let Some(host) = self.by_hostname.get_mut(hostname) {
            host.merged = merge(&self.sets, &host.sets, hostname);
        }
    }
}

/// Concatenates the endpoints of `keys` in the order the sets were applied.
/// When two sets claim the same address and port, the most recently applied
/// set wins.
fn merge(
    sets: &HashMap<EndpointSetKey, StoredSet>,
    keys: &HashSet<EndpointSetKey>,
    hostname: &str,
) -> Vec<Endpoint> {
    let mut ordered = keys
        .iter()
        .filter_map(|k| sets.get(k).map(|s| (k, s)))
        .collect::<Vec<_>>();
    ordered.sort_by_key(|(_, s)| s.generation);

    let mut merged = Vec::<Endpoint>::new();
    let mut positions = HashMap::<(String, String), usize>::new();
    for (key, set) in ordered {
        for ep in &set.resolved {
            match positions.entry((ep.address.clone(), ep.service_port_name.clone())) {
                HashEntry::Vacant(entry) => {
                    entry.insert(merged.len());
                    merged.push(ep.clone());
                }
                HashEntry::Occupied(entry) => {
                    warn!(
                        %hostname,
                        address = %ep.address,
                        port = %ep.service_port_name,
                        set = %key.name,
                        "Endpoint claimed by multiple endpoint sets; using the latest",
                    );
                    merged[*entry.get()] = ep.clone();
                }
            }
        }
    }
    merged
}

// === impl PendingResync ===

impl PendingResync {
    fn insert(&mut self, pod: PodKey, set: EndpointSetKey) {
        self.by_set.entry(set.clone()).or_default().insert(pod.clone());
        self.by_pod.entry(pod).or_default().insert(set);
    }

    /// Releases every pending entry owned by `set`.
    fn clear_set(&mut self, set: &EndpointSetKey) {
        let Some(pods) = self.by_set.remove(set) else {
            return;
        };
        for pod in pods {
            if let HashEntry::Occupied(mut entry) = self.by_pod.entry(pod) {
                entry.get_mut().remove(set);
                if entry.get().is_empty() {
                    entry.remove();
                }
            }
        }
    }

    /// Removes and returns the sets waiting on `pod`.
    fn take(&mut self, pod: &PodKey) -> HashSet<EndpointSetKey> {
        let sets = self.by_pod.remove(pod).unwrap_or_default();
        for set in &sets {
            if let HashEntry::Occupied(mut entry) = self.by_set.entry(set.clone()) {
                entry.get_mut().remove(pod);
                if entry.get().is_empty() {
                    entry.remove();
                }
            }
        }
        sets
    }

    fn len(&self) -> usize {
        self.by_pod.len()
    }
}
