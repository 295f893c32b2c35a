use crate::core::push::{Notifier, Push};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use tracing::{debug, info};

/// Records push notifications.
///
/// No configuration distribution engine is attached to this process, so pushes
/// are logged and counted by kind.
#[derive(Clone, Debug)]
pub(crate) struct LogNotifier {
    pushes: Family<PushLabels, Counter>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct PushLabels {
    kind: &'static str,
}

// === impl LogNotifier ===

impl LogNotifier {
    pub(crate) fn register(reg: &mut Registry) -> Self {
        let pushes = Family::<PushLabels, Counter>::default();
        reg.register(
            "pushes",
            "Total number of push notifications by kind",
            pushes.clone(),
        );
        Self { pushes }
    }
}

impl Notifier for LogNotifier {
    fn notify(&self, push: Push) {
        let kind = push.kind();
        self.pushes.get_or_create(&PushLabels { kind }).inc();
        match push {
            Push::Full { reason } => info!(?reason, "Full push"),
            Push::Service {
                hostname,
                namespace,
                kind,
            } => debug!(%hostname, %namespace, %kind, "Service push"),
            Push::Endpoints {
                shard,
                hostname,
                namespace,
                endpoints,
            } => debug!(
                %shard,
                %hostname,
                %namespace,
                endpoints = endpoints.len(),
                "Endpoints push"
            ),
            Push::Proxy {
                cluster_id,
                address,
            } => debug!(%cluster_id, ?address, "Proxy push"),
        }
    }
}
