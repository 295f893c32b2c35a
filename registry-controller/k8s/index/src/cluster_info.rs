/// Holds cluster metadata.
#[derive(Clone, Debug)]
pub struct ClusterInfo {
    /// Identifies this registry, e.g. "Kubernetes". Endpoint localities and
    /// node-port mappings are keyed by this value.
    pub cluster_id: String,

    /// E.g. "cluster.local"
    pub domain_suffix: String,

    /// The mesh identity trust domain.
    pub trust_domain: String,
}

/// The namespace assumed for single-segment gateway service names.
pub(crate) const ISTIO_NAMESPACE: &str = "istio-system";

impl ClusterInfo {
    pub(crate) fn service_hostname(&self, ns: &str, name: &str) -> String {
        format!("{}.{}.svc.{}", name, ns, self.domain_suffix)
    }

    pub(crate) fn service_account_identity(&self, ns: &str, sa: &str) -> String {
        format!("spiffe://{}/ns/{}/sa/{}", self.trust_domain, ns, sa)
    }

    pub(crate) fn custom_identity(&self, identity: &str) -> String {
        format!("spiffe://{}/{}", self.trust_domain, identity)
    }

    /// Expands a gateway service reference of the form `name`,
    /// `name.namespace` or `name.namespace.svc.<suffix>` into a hostname.
    pub(crate) fn canonical_service_name(&self, name: &str) -> String {
        let mut segments = name.splitn(3, '.');
        let svc = segments.next().unwrap_or_default();
        match segments.next() {
            Some(ns) => self.service_hostname(ns, svc),
            None => self.service_hostname(ISTIO_NAMESPACE, svc),
        }
    }
}
