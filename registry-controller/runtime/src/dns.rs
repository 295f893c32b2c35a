//! Periodically resolves the DNS names that gateways refer to.

use crate::{
    core::dns::{DnsResolver, Referer, WatchDelta, WatchTable},
    index::Controller,
};
use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use std::{net::IpAddr, sync::Arc};
use tokio::{sync::watch, time};
use tracing::{debug, info, trace, warn};

/// Tracks watched names on behalf of the controller and publishes the
/// combined name list to a polling task.
#[derive(Debug)]
pub(crate) struct PollingResolver {
    table: Mutex<WatchTable>,
    names: watch::Sender<Vec<String>>,
}

// === impl PollingResolver ===

impl PollingResolver {
    pub(crate) fn new() -> (Arc<Self>, watch::Receiver<Vec<String>>) {
        let (names, rx) = watch::channel(Vec::new());
        let resolver = Self {
            table: Default::default(),
            names,
        };
        (Arc::new(resolver), rx)
    }

    fn publish(&self, table: &WatchTable, delta: WatchDelta) {
        if delta.watched.is_empty() && delta.unwatched.is_empty() {
            return;
        }
        debug!(watched = ?delta.watched, unwatched = ?delta.unwatched, "Updating DNS names");
        self.names.send_replace(table.names());
    }
}

impl DnsResolver for PollingResolver {
    fn watch(&self, referer: Referer, names: Vec<String>) {
        let mut table = self.table.lock();
        let delta = table.watch(referer, names.into_iter().collect());
        self.publish(&table, delta);
    }

    fn cancel(&self, referer: &Referer) {
        let mut table = self.table.lock();
        let delta = table.cancel(referer);
        self.publish(&table, delta);
    }
}

/// Resolves every watched name each `period`, and immediately when the set of
/// names changes. The controller is told about each name whose addresses
/// changed.
///
/// Returns when the resolver is dropped.
pub(crate) async fn poll(
    mut names: watch::Receiver<Vec<String>>,
    controller: Arc<Controller>,
    period: time::Duration,
) {
    let mut resolved = HashMap::<String, Vec<IpAddr>>::new();
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            res = names.changed() => {
                if res.is_err() {
                    debug!("Resolver dropped");
                    return;
                }
            }
        }

        let current = names.borrow_and_update().clone();
        resolved.retain(|name, _| current.contains(name));
        for name in current {
            let addrs = match lookup(&name).await {
                Ok(addrs) => addrs,
                Err(error) => {
                    warn!(%name, %error, "Failed to resolve gateway address");
                    continue;
                }
            };
            if resolved.get(&name) == Some(&addrs) {
                trace!(%name, "Unchanged");
                continue;
            }
            info!(%name, ?addrs, "Gateway address changed");
            resolved.insert(name.clone(), addrs);
            controller.refresh_gateway_endpoints(&name);
        }
    }
}

async fn lookup(name: &str) -> std::io::Result<Vec<IpAddr>> {
    let mut addrs = tokio::net::lookup_host((name, 0))
        .await?
        .map(|sa| sa.ip())
        .collect::<Vec<_>>();
    addrs.sort();
    addrs.dedup();
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishes_only_membership_changes() {
        let (resolver, mut rx) = PollingResolver::new();
        let mesh = Referer::new("istio.mesh", "MeshNetworks", "");
        let svc = Referer::new("k8s", "Service", "gw.istio-system.svc.cluster.local");

        resolver.watch(mesh.clone(), vec!["gw.example.com".to_string()]);
        assert!(rx.has_changed().expect("resolver must be live"));
        assert_eq!(*rx.borrow_and_update(), ["gw.example.com"]);

        // Another referer to an already watched name changes nothing.
        resolver.watch(svc.clone(), vec!["gw.example.com".to_string()]);
        assert!(!rx.has_changed().expect("resolver must be live"));

        resolver.cancel(&mesh);
        assert!(!rx.has_changed().expect("resolver must be live"));

        resolver.cancel(&svc);
        assert!(rx.has_changed().expect("resolver must be live"));
        assert!(rx.borrow_and_update().is_empty());
    }

    #[tokio::test]
    async fn ip_literals_resolve_without_dns() {
        let addrs = lookup("127.0.0.1").await.expect("literal must resolve");
        assert_eq!(addrs, ["127.0.0.1".parse::<IpAddr>().unwrap()]);
    }
}
