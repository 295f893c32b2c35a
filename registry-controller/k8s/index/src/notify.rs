//! Classifies index changes into push notifications.
//!
//! Index mutations record their externally visible effects in [`Effects`];
//! the controller dispatches them after every index lock has been released.

use mesh_registry_controller_core::{
    dns::{DnsResolver, Referer},
    push::{ChangeKind, Notifier, Push, PushReason},
    Endpoint, Service,
};
use std::sync::Arc;
use tracing::trace;

pub type ServiceHandler = Box<dyn Fn(&Service, ChangeKind) + Send + Sync + 'static>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum DnsAction {
    Watch(Referer, Vec<String>),
    Cancel(Referer),
}

#[derive(Debug, Default)]
pub(crate) struct Effects {
    pub pushes: Vec<Push>,
    pub dns: Vec<DnsAction>,
    pub services: Vec<(Arc<Service>, ChangeKind)>,
}

/// Chooses how an endpoint change is announced. Headless services are
/// resolved through DNS by clients, so their endpoint changes require a full
/// push.
pub(crate) fn endpoints_push(
    service: Option<&Service>,
    shard: &str,
    hostname: &str,
    namespace: &str,
    endpoints: Vec<Endpoint>,
) -> Push {
    if service.is_some_and(Service::is_headless) {
        return Push::Full {
            reason: PushReason::HeadlessEndpointUpdate,
        };
    }
    Push::Endpoints {
        shard: shard.to_string(),
        hostname: hostname.to_string(),
        namespace: namespace.to_string(),
        endpoints,
    }
}

// === impl Effects ===

impl Effects {
    pub(crate) fn service(&mut self, svc: Arc<Service>, kind: ChangeKind) {
        self.pushes.push(Push::Service {
            hostname: svc.hostname.clone(),
            namespace: svc.attributes.namespace.clone(),
            kind,
        });
        self.services.push((svc, kind));
    }

    pub(crate) fn full(&mut self, reason: PushReason) {
        self.pushes.push(Push::Full { reason });
    }

    pub(crate) fn dispatch(
        self,
        notifier: &dyn Notifier,
        resolver: Option<&dyn DnsResolver>,
        handlers: &[ServiceHandler],
    ) {
        if let Some(resolver) = resolver {
            for action in self.dns {
                match action {
                    DnsAction::Watch(referer, names) => resolver.watch(referer, names),
                    DnsAction::Cancel(referer) => resolver.cancel(&referer),
                }
            }
        }

        for (svc, kind) in &self.services {
            for handler in handlers {
                handler(svc, *kind);
            }
        }

        for push in self.pushes {
            trace!(kind = push.kind(), "Notifying");
            notifier.notify(push);
        }
    }
}
