use crate::{Labels, Port};

/// A data plane proxy asking for its configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Proxy {
    pub id: String,
    pub ip_addresses: Vec<String>,
    pub config_namespace: String,
    pub locality: Option<ProxyLocality>,
    pub metadata: NodeMetadata,
}

/// Self-reported proxy metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeMetadata {
    pub cluster_id: String,
    pub service_account: String,
    pub labels: Labels,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProxyLocality {
    pub region: String,
    pub zone: String,
    pub subzone: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Probe {
    pub path: String,
    pub port: Option<Port>,
}

// === impl ProxyLocality ===

impl ProxyLocality {
    /// Renders `region[/zone[/subzone]]`, stopping at the first empty segment.
    pub fn to_label(&self) -> String {
        let mut label = self.region.clone();
        if self.zone.is_empty() {
            return label;
        }
        label.push('/');
        label.push_str(&self.zone);
        if self.subzone.is_empty() {
            return label;
        }
        label.push('/');
        label.push_str(&self.subzone);
        label
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locality_label() {
        let l = |r: &str, z: &str, s: &str| ProxyLocality {
            region: r.to_string(),
            zone: z.to_string(),
            subzone: s.to_string(),
        };
        assert_eq!(l("r", "z", "").to_label(), "r/z");
        assert_eq!(l("r", "z", "s").to_label(), "r/z/s");
        assert_eq!(l("r", "", "s").to_label(), "r");
        assert_eq!(l("", "", "").to_label(), "");
    }
}
