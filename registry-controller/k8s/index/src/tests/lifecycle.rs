use super::*;
use crate::{Change, Event};
use futures::prelude::*;
use tokio::{sync::mpsc, time};
use tokio_stream::wrappers::UnboundedReceiverStream;

async fn until(mut f: impl FnMut() -> bool) {
    time::timeout(time::Duration::from_secs(5), async {
        while !f() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition must be satisfied");
}

#[tokio::test]
async fn workers_apply_events_until_stopped() {
    let test = TestConfig::default();
    let (svc_tx, svc_rx) = mpsc::unbounded_channel();
    let (ep_tx, ep_rx) = mpsc::unbounded_channel();
    let handle = test.controller.start(vec![
        UnboundedReceiverStream::new(svc_rx).boxed(),
        UnboundedReceiverStream::new(ep_rx).boxed(),
    ]);

    svc_tx
        .send(Event::Service(Change::Apply(mk_service(
            "nsa",
            "svc1",
            &[("tcp-port", 8080)],
            &[],
        ))))
        .expect("worker must be running");
    ep_tx
        .send(Event::EndpointSet(Change::Apply(mk_endpoints(
            "nsa",
            "svc1",
            ("tcp-port", 8080),
            &[("10.0.0.1", None), ("10.0.0.2", Some("pod2"))],
        ))))
        .expect("worker must be running");

    until(|| {
        test.controller.pending_resync_len() == 1
            && test
                .controller
                .get_service("svc1.nsa.svc.cluster.local")
                .ok()
                .flatten()
                .is_some()
    })
    .await;
    assert_eq!(
        instance_addresses(&test.instances("nsa", "svc1", 8080)),
        ["10.0.0.1"]
    );

    handle.stop().await;
    assert!(
        svc_tx
            .send(Event::Pod(Change::Reset(vec![])))
            .is_err(),
        "workers must have released their streams"
    );
}

#[tokio::test]
async fn events_within_a_stream_apply_in_order() {
    let test = TestConfig::default();
    let svc = mk_service("nsa", "svc1", &[("http", 80)], &[]);
    let events = stream::iter(vec![
        Event::Service(Change::Apply(svc.clone())),
        Event::Pod(Change::Apply(mk_pod("nsa", "pod1", "10.0.0.1", "node1", &[]))),
        Event::Service(Change::Delete(svc)),
        Event::Pod(Change::Reset(vec![mk_pod(
            "nsa",
            "pod2",
            "10.0.0.2",
            "node1",
            &[],
        )])),
    ]);
    let handle = test.controller.start(vec![events.boxed()]);

    until(|| test.controller.pod_key_by_ip("10.0.0.2").is_some()).await;
    handle.stop().await;

    assert!(test.controller.pod_key_by_ip("10.0.0.1").is_none());
    assert!(test
        .controller
        .services()
        .expect("lookup must not fail")
        .is_empty());
    let kinds = test
        .pushes
        .take()
        .into_iter()
        .map(|p| p.kind())
        .collect::<Vec<_>>();
    assert_eq!(kinds, ["service", "proxy", "service", "proxy"]);
}

#[tokio::test]
async fn dropping_the_handle_stops_workers() {
    let test = TestConfig::default();
    let (tx, rx) = mpsc::unbounded_channel::<Event>();
    let handle = test
        .controller
        .start(vec![UnboundedReceiverStream::new(rx).boxed()]);
    drop(handle);

    time::timeout(time::Duration::from_secs(5), tx.closed())
        .await
        .expect("worker must release its stream");
}
