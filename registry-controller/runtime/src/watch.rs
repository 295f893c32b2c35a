//! Adapts resource watches and configuration files into controller events.

use crate::{
    index::{Change, EndpointSet, Event, EventStream},
    k8s::MeshNetworks,
};
use anyhow::Result;
use futures::prelude::*;
use kube::runtime::watcher;
use std::path::PathBuf;
use tokio::time;
use tracing::{info, warn};

/// Folds a resource watch into controller changes.
///
/// Objects observed while the watch relists are buffered and delivered as a
/// single [`Change::Reset`] once the relist completes. Objects that `convert`
/// rejects are skipped.
pub(crate) fn changes<T, U>(
    events: impl Stream<Item = watcher::Event<T>>,
    convert: impl Fn(T) -> Option<U>,
) -> impl Stream<Item = Change<U>> {
    events
        .scan(None::<Vec<U>>, move |relist, event| {
            let change = match event {
                watcher::Event::Apply(obj) => convert(obj).map(Change::Apply),
                watcher::Event::Delete(obj) => convert(obj).map(Change::Delete),
                watcher::Event::Init => {
                    *relist = Some(Vec::new());
                    None
                }
                watcher::Event::InitApply(obj) => {
                    relist.get_or_insert_with(Vec::new).extend(convert(obj));
                    None
                }
                watcher::Event::InitDone => {
                    Some(Change::Reset(relist.take().unwrap_or_default()))
                }
            };
            future::ready(Some(change))
        })
        .filter_map(future::ready)
}

/// Wraps an endpoint conversion so that malformed objects are logged and
/// skipped.
pub(crate) fn endpoint_sets<T>(
    convert: fn(&T) -> Result<EndpointSet>,
) -> impl Fn(T) -> Option<EndpointSet> {
    move |obj| match convert(&obj) {
        Ok(set) => Some(set),
        Err(error) => {
            warn!(%error, "Skipping endpoints");
            None
        }
    }
}

/// Polls a mesh networks document, emitting an event each time its contents
/// change and parse.
///
/// Unreadable or invalid documents are logged; the last valid configuration
/// stays in effect.
pub(crate) fn mesh_networks(path: PathBuf, period: time::Duration) -> EventStream {
    let interval = time::interval(period);
    stream::unfold(
        (path, interval, None::<String>),
        |(path, mut interval, mut last)| async move {
            loop {
                interval.tick().await;
                let doc = match tokio::fs::read_to_string(&path).await {
                    Ok(doc) => doc,
                    Err(error) => {
                        warn!(path = %path.display(), %error, "Failed to read mesh networks");
                        continue;
                    }
                };
                if last.as_ref() == Some(&doc) {
                    continue;
                }

                let parsed = MeshNetworks::from_yaml(&doc);
                last = Some(doc);
                match parsed {
                    Ok(config) => {
                        info!(networks = config.networks.len(), "Mesh networks changed");
                        return Some((Event::NetworkConfig(config), (path, interval, last)));
                    }
                    Err(error) => {
                        warn!(path = %path.display(), %error, "Ignoring invalid mesh networks");
                    }
                }
            }
        },
    )
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn describe(change: Change<u32>) -> String {
        match change {
            Change::Apply(n) => format!("apply {n}"),
            Change::Delete(n) => format!("delete {n}"),
            Change::Reset(ns) => format!("reset {ns:?}"),
        }
    }

    #[tokio::test]
    async fn relists_are_delivered_as_resets() {
        let events = stream::iter(vec![
            watcher::Event::Init,
            watcher::Event::InitApply(1),
            watcher::Event::InitApply(2),
            watcher::Event::InitDone,
            watcher::Event::Apply(3),
            watcher::Event::Delete(1),
            watcher::Event::Init,
            watcher::Event::InitDone,
        ]);
        let changes = changes(events, Some).map(describe).collect::<Vec<_>>().await;
        assert_eq!(
            changes,
            ["reset [1, 2]", "apply 3", "delete 1", "reset []"]
        );
    }

    #[tokio::test]
    async fn rejected_objects_are_skipped() {
        let events = stream::iter(vec![
            watcher::Event::Init,
            watcher::Event::InitApply(1),
            watcher::Event::InitApply(2),
            watcher::Event::InitDone,
            watcher::Event::Apply(3),
            watcher::Event::Apply(4),
        ]);
        let even = |n: u32| (n % 2 == 0).then_some(n);
        let changes = changes(events, even).map(describe).collect::<Vec<_>>().await;
        assert_eq!(changes, ["reset [2]", "apply 4"]);
    }

    #[tokio::test]
    async fn mesh_networks_file_changes_are_emitted() {
        let path = std::env::temp_dir().join(format!(
            "mesh-networks-{}-{:?}.yaml",
            std::process::id(),
            std::thread::current().id()
        ));
        tokio::fs::write(&path, "networks:\n  network1:\n    endpoints:\n      - fromRegistry: Kubernetes\n")
            .await
            .expect("must write config");

        let mut events = mesh_networks(path.clone(), time::Duration::from_millis(10));
        let event = time::timeout(time::Duration::from_secs(5), events.next())
            .await
            .expect("must observe the initial document");
        match event {
            Some(Event::NetworkConfig(config)) => {
                assert!(config.networks.contains_key("network1"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // Invalid documents are skipped until a valid one is written.
        tokio::fs::write(&path, "networks: [")
            .await
            .expect("must write config");
        time::sleep(time::Duration::from_millis(50)).await;
        tokio::fs::write(&path, "networks:\n  network2: {}\n")
            .await
            .expect("must write config");
        let event = time::timeout(time::Duration::from_secs(5), events.next())
            .await
            .expect("must observe the updated document");
        match event {
            Some(Event::NetworkConfig(config)) => {
                assert!(config.networks.contains_key("network2"));
                assert!(!config.networks.contains_key("network1"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let _ = tokio::fs::remove_file(&path).await;
    }
}
