//! Node -> locality and external address.

use ahash::AHashMap as HashMap;
use mesh_registry_controller_k8s_api::{self as k8s, Labels, ResourceExt};
use std::collections::hash_map::Entry as HashEntry;
use tracing::{debug, instrument, trace, warn};

pub(crate) const NODE_REGION_LABEL: &str = "topology.kubernetes.io/region";
pub(crate) const NODE_ZONE_LABEL: &str = "topology.kubernetes.io/zone";
pub(crate) const LEGACY_NODE_REGION_LABEL: &str = "failure-domain.beta.kubernetes.io/region";
pub(crate) const LEGACY_NODE_ZONE_LABEL: &str = "failure-domain.beta.kubernetes.io/zone";
pub(crate) const SUBZONE_LABEL: &str = "topology.istio.io/subzone";

#[derive(Debug, Default)]
pub(crate) struct NodeIndex {
    index: HashMap<String, NodeInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct NodeInfo {
    pub locality: NodeLocality,
    pub labels: Labels,
    pub external_address: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct NodeLocality {
    pub region: String,
    pub zone: String,
    pub subzone: String,
}

// === impl NodeIndex ===

impl NodeIndex {
    /// Records a node and returns true if the set of external node addresses
    /// (or the labels used to select them) changed.
    #[instrument(skip(self, node), fields(name = ?node.metadata.name))]
    pub(crate) fn apply(&mut self, node: k8s::Node) -> bool {
        let Some(name) = node.metadata.name.clone() else {
            warn!("Ignoring node without a name");
            return false;
        };
        let info = NodeInfo::from_node(&node);
        match self.index.entry(name) {
            HashEntry::Vacant(entry) => {
                debug!(locality = ?info.locality, address = ?info.external_address, "Adding");
                let gateway_relevant = info.external_address.is_some();
                entry.insert(info);
                gateway_relevant
            }
            HashEntry::Occupied(mut entry) => {
                if *entry.get() == info {
                    trace!("No changes");
                    return false;
                }
                debug!(locality = ?info.locality, address = ?info.external_address, "Updating");
                let prior = std::mem::replace(entry.get_mut(), info);
                let current = entry.get();
                prior.external_address != current.external_address
                    || (current.external_address.is_some() && prior.labels != current.labels)
            }
        }
    }

    #[instrument(skip(self))]
    pub(crate) fn delete(&mut self, name: &str) -> bool {
        match self.index.remove(name) {
            Some(info) => {
                debug!("Deleted");
                info.external_address.is_some()
            }
            None => false,
        }
    }

    /// Replaces the set of known nodes.
    #[instrument(skip(self, nodes))]
    pub(crate) fn reset(&mut self, nodes: Vec<k8s::Node>) -> bool {
        let mut prior = self.index.keys().cloned().collect::<ahash::AHashSet<_>>();
        let mut changed = false;
        for node in nodes {
            if let Some(name) = node.metadata.name.as_deref() {
                prior.remove(name);
            }
            changed |= self.apply(node);
        }
        for name in prior {
            changed |= self.delete(&name);
        }
        changed
    }

    pub(crate) fn locality(&self, name: &str) -> Option<&NodeLocality> {
        self.index.get(name).map(|n| &n.locality)
    }

    /// External addresses of the nodes whose labels include every label in
    /// `selector`, sorted.
    pub(crate) fn external_addresses(&self, selector: &Labels) -> Vec<String> {
        let mut addrs = self
            .index
            .values()
            .filter(|n| selector.subset_of(&n.labels))
            .filter_map(|n| n.external_address.clone())
            .collect::<Vec<_>>();
        addrs.sort();
        addrs
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }
}

// === impl NodeInfo ===

impl NodeInfo {
    fn from_node(node: &k8s::Node) -> Self {
        let labels = node.labels();
        let label = |key: &str, legacy: Option<&str>| {
            labels
                .get(key)
                .or_else(|| legacy.and_then(|l| labels.get(l)))
                .cloned()
                .unwrap_or_default()
        };
        let locality = NodeLocality {
            region: label(NODE_REGION_LABEL, Some(LEGACY_NODE_REGION_LABEL)),
            zone: label(NODE_ZONE_LABEL, Some(LEGACY_NODE_ZONE_LABEL)),
            subzone: label(SUBZONE_LABEL, None),
        };

        let external_address = node
            .status
            .iter()
            .flat_map(|s| s.addresses.iter().flatten())
            .find(|a| a.type_ == "ExternalIP" && !a.address.is_empty())
            .map(|a| a.address.clone());

        Self {
            locality,
            labels: labels.clone().into(),
            external_address,
        }
    }
}

// === impl NodeLocality ===

impl NodeLocality {
    /// `region/zone/subzone`, keeping empty segments.
    pub fn label(&self) -> String {
        format!("{}/{}/{}", self.region, self.zone, self.subzone)
    }
}
