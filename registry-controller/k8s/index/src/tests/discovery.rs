use super::*;
use crate::health::{
    PROMETHEUS_PATH_ANNOTATION, PROMETHEUS_PORT_ANNOTATION, PROMETHEUS_SCRAPE_ANNOTATION,
};
use crate::service::{CANONICAL_SERVICE_ACCOUNTS_ANNOTATION, KUBE_SERVICE_ACCOUNTS_ANNOTATION};
use mesh_registry_controller_core::{
    Labels, NodeMetadata, Port, Probe, Protocol, Proxy, ProxyLocality, Resolution,
};

fn proxy(ip: &str, ns: &str) -> Proxy {
    Proxy {
        id: format!("sidecar~{ip}"),
        ip_addresses: vec![ip.to_string()],
        config_namespace: ns.to_string(),
        ..Default::default()
    }
}

fn http_probe(path: &str, port: IntOrString) -> k8s::Probe {
    k8s::Probe {
        http_get: Some(k8s::HTTPGetAction {
            path: Some(path.to_string()),
            port,
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn with_target_ports(mut svc: k8s::Service, targets: &[IntOrString]) -> k8s::Service {
    if let Some(spec) = svc.spec.as_mut() {
        for (port, target) in spec.ports.iter_mut().flatten().zip(targets) {
            port.target_port = Some(target.clone());
        }
    }
    svc
}

#[test]
fn proxy_instances_from_pod() {
    let test = TestConfig::with_cluster_id("fakeCluster");
    test.controller.apply_node(mk_node(
        "node1",
        &[(NODE_REGION_LABEL, "r1"), (NODE_ZONE_LABEL, "z1")],
        None,
    ));
    test.controller.apply_pod(mk_pod(
        "nsa",
        "pod1",
        "128.0.0.1",
        "node1",
        &[("app", "test-app")],
    ));
    test.controller.apply_service(mk_service(
        "nsa",
        "svc1",
        &[("tcp-port", 8080)],
        &[("app", "test-app")],
    ));
    // Neither of these select the pod.
    test.controller.apply_service(mk_service(
        "other",
        "svc1",
        &[("tcp-port", 8080)],
        &[("app", "test-app")],
    ));
    test.controller
        .apply_service(mk_service("nsa", "all", &[("tcp-port", 8080)], &[]));

    let instances = test
        .controller
        .get_proxy_service_instances(&proxy("128.0.0.1", "nsa"))
        .expect("lookup must not fail");
    assert_eq!(instances.len(), 1);
    let instance = &instances[0];
    assert_eq!(instance.service.hostname, "svc1.nsa.svc.cluster.local");
    assert_eq!(instance.service_port.name, "tcp-port");
    assert_eq!(instance.service_port.protocol, Protocol::Tcp);
    let ep = &instance.endpoint;
    assert_eq!(ep.address, "128.0.0.1");
    assert_eq!(ep.endpoint_port, 8080);
    assert_eq!(ep.locality.label, "r1/z1/");
    assert_eq!(ep.locality.cluster_id, "fakeCluster");
    assert_eq!(ep.uid, "kubernetes://pod1.nsa");
    assert_eq!(ep.service_account, "spiffe://cluster.local/ns/nsa/sa/default");
    assert_eq!(ep.labels.get("app"), Some("test-app"));
}

#[test]
fn proxy_instances_dedupe_by_target_port_and_protocol() {
    let test = TestConfig::default();
    let mut pod = mk_pod("nsa", "pod1", "128.0.0.1", "node1", &[("app", "test-app")]);
    if let Some(spec) = pod.spec.as_mut() {
        spec.containers = vec![k8s::Container {
            name: "app".to_string(),
            ports: Some(vec![k8s::ContainerPort {
                name: Some("web".to_string()),
                container_port: 9090,
                ..Default::default()
            }]),
            ..Default::default()
        }];
    }
    test.controller.apply_pod(pod);

    test.controller.apply_service(with_target_ports(
        mk_service(
            "nsa",
            "svc1",
            &[("http-1", 80), ("http-2", 81), ("tcp-3", 82)],
            &[("app", "test-app")],
        ),
        &[
            IntOrString::Int(8080),
            IntOrString::Int(8080),
            IntOrString::Int(8080),
        ],
    ));
    test.controller.apply_service(with_target_ports(
        mk_service("nsa", "named", &[("http", 80)], &[("app", "test-app")]),
        &[IntOrString::String("web".to_string())],
    ));

    let instances = test
        .controller
        .get_proxy_service_instances(&proxy("128.0.0.1", "nsa"))
        .expect("lookup must not fail");
    let summary = instances
        .iter()
        .map(|i| {
            (
                i.service.attributes.name.as_str(),
                i.service_port.name.as_str(),
                i.endpoint.endpoint_port,
            )
        })
        .collect::<Vec<_>>();
    assert_eq!(
        summary,
        [
            ("named", "http", 9090),
            ("svc1", "http-1", 8080),
            ("svc1", "tcp-3", 8080),
        ]
    );
}

#[test]
fn proxy_instances_for_ports_sharing_a_name() {
    let test = TestConfig::default();
    test.controller.apply_pod(mk_pod(
        "nsa",
        "pod1",
        "128.0.0.1",
        "node1",
        &[("app", "test-app")],
    ));
    test.controller.apply_service(mk_service(
        "nsa",
        "svc1",
        &[("tcp-port", 8080), ("tcp-port", 9090)],
        &[("app", "test-app")],
    ));

    let mut sidecar = proxy("128.0.0.1", "nsa");
    sidecar.ip_addresses.push("192.168.2.6".to_string());
    let instances = test
        .controller
        .get_proxy_service_instances(&sidecar)
        .expect("lookup must not fail");
    let summary = instances
        .iter()
        .map(|i| {
            (
                i.service_port.port,
                i.endpoint.address.as_str(),
                i.endpoint.endpoint_port,
            )
        })
        .collect::<Vec<_>>();
    assert_eq!(
        summary,
        [
            (8080, "128.0.0.1", 8080),
            (8080, "192.168.2.6", 8080),
            (9090, "128.0.0.1", 9090),
            (9090, "192.168.2.6", 9090),
        ]
    );
}

#[test]
fn proxy_instances_from_metadata() {
    let test = TestConfig::with_cluster_id("fakeCluster");
    test.controller.apply_service(mk_service(
        "nsa",
        "svc1",
        &[("tcp-port", 8080)],
        &[("app", "prod-app")],
    ));

    let mut vm = proxy("129.0.0.1", "nsa");
    vm.metadata = NodeMetadata {
        cluster_id: "fakeCluster".to_string(),
        service_account: "spiffe://cluster.local/ns/nsa/sa/vm".to_string(),
        labels: Labels::from(labels(&[("app", "prod-app"), ("istio-locality", "ignored")])),
    };
    vm.locality = Some(ProxyLocality {
        region: "r".to_string(),
        zone: "z".to_string(),
        subzone: String::new(),
    });

    let instances = test
        .controller
        .get_proxy_service_instances(&vm)
        .expect("lookup must not fail");
    assert_eq!(instances.len(), 1);
    let ep = &instances[0].endpoint;
    assert_eq!(ep.address, "129.0.0.1");
    assert_eq!(ep.endpoint_port, 8080);
    assert_eq!(ep.service_account, "spiffe://cluster.local/ns/nsa/sa/vm");
    assert_eq!(ep.locality.label, "r/z");
    assert_eq!(ep.labels, vm.metadata.labels);

    // Proxies from other clusters are not matched by metadata.
    let mut remote = vm.clone();
    remote.metadata.cluster_id = "remote".to_string();
    assert!(test
        .controller
        .get_proxy_service_instances(&remote)
        .expect("lookup must not fail")
        .is_empty());

    // Nor are proxies without labels.
    let mut unlabeled = vm;
    unlabeled.metadata.labels = Labels::default();
    assert!(test
        .controller
        .get_proxy_service_instances(&unlabeled)
        .expect("lookup must not fail")
        .is_empty());
}

#[test]
fn external_name_service_instances() {
    let test = TestConfig::default();
    let mut svc = mk_service("nsa", "svc5", &[("http", 80)], &[]);
    if let Some(spec) = svc.spec.as_mut() {
        spec.type_ = Some("ExternalName".to_string());
        spec.external_name = Some("foo.co".to_string());
        spec.cluster_ip = None;
    }
    test.controller.apply_service(svc);

    let record = test.service("nsa", "svc5");
    assert!(record.mesh_external);
    assert_eq!(record.resolution, Resolution::DnsLb);
    assert_eq!(record.address, None);

    let instances = test.instances("nsa", "svc5", 80);
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].endpoint.address, "foo.co");
    assert_eq!(instances[0].service_port.port, 80);

    assert!(test.instances("nsa", "svc5", 81).is_empty());
}

#[test]
fn service_accounts_union() {
    let test = TestConfig::default();
    let mut svc = mk_service("nsa", "svc1", &[("tcp-port", 8080)], &[("app", "a")]);
    svc.metadata.annotations = Some(labels(&[
        (KUBE_SERVICE_ACCOUNTS_ANNOTATION, "acct4"),
        (
            CANONICAL_SERVICE_ACCOUNTS_ANNOTATION,
            "acctvm2@gserviceaccount2.com",
        ),
    ]));
    test.controller.apply_service(svc);

    let mut pod1 = mk_pod("nsa", "pod1", "10.0.0.1", "node1", &[("app", "a")]);
    if let Some(spec) = pod1.spec.as_mut() {
        spec.service_account_name = Some("acct1".to_string());
    }
    test.controller.apply_pod(pod1);
    test.controller
        .apply_pod(mk_pod("nsa", "pod2", "10.0.0.2", "node1", &[("app", "a")]));
    test.controller
        .apply_pod(mk_pod("nsa", "pod3", "10.0.0.3", "node1", &[("app", "a")]));
    test.controller.apply_endpoint_set(mk_endpoints(
        "nsa",
        "svc1",
        ("tcp-port", 8080),
        &[
            ("10.0.0.1", Some("pod1")),
            ("10.0.0.2", Some("pod2")),
            ("10.0.0.3", Some("pod3")),
        ],
    ));

    let record = test.service("nsa", "svc1");
    assert_eq!(
        test.controller.get_istio_service_accounts(&record, &[8080]),
        [
            "acctvm2@gserviceaccount2.com",
            "spiffe://cluster.local/ns/nsa/sa/acct1",
            "spiffe://cluster.local/ns/nsa/sa/acct4",
            "spiffe://cluster.local/ns/nsa/sa/default",
        ]
    );

    // Only the service's declared accounts apply to ports without endpoints.
    assert_eq!(
        test.controller.get_istio_service_accounts(&record, &[9999]),
        [
            "acctvm2@gserviceaccount2.com",
            "spiffe://cluster.local/ns/nsa/sa/acct4",
        ]
    );
}

#[test]
fn instances_filtered_by_labels() {
    let test = TestConfig::default();
    test.controller.apply_service(mk_service(
        "nsa",
        "svc1",
        &[("tcp-port", 8080)],
        &[("app", "a")],
    ));
    test.controller.apply_pod(mk_pod(
        "nsa",
        "v1",
        "10.0.0.1",
        "node1",
        &[("app", "a"), ("version", "v1")],
    ));
    test.controller.apply_pod(mk_pod(
        "nsa",
        "v2",
        "10.0.0.2",
        "node1",
        &[("app", "a"), ("version", "v2")],
    ));
    test.controller.apply_endpoint_set(mk_endpoints(
        "nsa",
        "svc1",
        ("tcp-port", 8080),
        &[("10.0.0.1", Some("v1")), ("10.0.0.2", Some("v2"))],
    ));

    let record = test.service("nsa", "svc1");
    let filter = |pairs: &[(&str, &str)]| Labels::from(labels(pairs));
    let lookup = |filters: &[Labels]| {
        instance_addresses(
            &test
                .controller
                .instances_by_port(&record, 8080, filters)
                .expect("lookup must not fail"),
        )
    };
    assert_eq!(lookup(&[]), ["10.0.0.1", "10.0.0.2"]);
    assert_eq!(lookup(&[filter(&[("version", "v2")])]), ["10.0.0.2"]);
    assert_eq!(
        lookup(&[filter(&[("version", "v1")]), filter(&[("version", "v2")])]),
        ["10.0.0.1", "10.0.0.2"]
    );
    assert!(lookup(&[filter(&[("version", "v3")])]).is_empty());
}

#[test]
fn health_checks_from_container_probes() {
    let test = TestConfig::default();
    let mut pod = mk_pod("nsa", "pod1", "10.0.0.1", "node1", &[]);
    if let Some(spec) = pod.spec.as_mut() {
        spec.containers = vec![
            k8s::Container {
                name: "app".to_string(),
                ports: Some(vec![k8s::ContainerPort {
                    name: Some("live-port".to_string()),
                    container_port: 9090,
                    ..Default::default()
                }]),
                readiness_probe: Some(http_probe("/ready", IntOrString::Int(8080))),
                liveness_probe: Some(http_probe(
                    "/live",
                    IntOrString::String("live-port".to_string()),
                )),
                ..Default::default()
            },
            k8s::Container {
                name: "db".to_string(),
                liveness_probe: Some(k8s::Probe {
                    tcp_socket: Some(k8s::TCPSocketAction {
                        port: IntOrString::Int(7070),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ];
    }
    test.controller.apply_pod(pod.clone());

    let mgmt = |port: u16, protocol: Protocol| Port {
        name: format!("mgmt-{port}"),
        port,
        protocol,
    };
    assert_eq!(
        test.controller.workload_health_check_info("10.0.0.1"),
        [
            Probe {
                path: "/ready".to_string(),
                port: Some(mgmt(8080, Protocol::Http)),
            },
            Probe {
                path: "/live".to_string(),
                port: Some(mgmt(9090, Protocol::Http)),
            },
        ]
    );
    assert_eq!(
        test.controller.management_ports("10.0.0.1"),
        [
            mgmt(8080, Protocol::Http),
            mgmt(9090, Protocol::Http),
            mgmt(7070, Protocol::Tcp),
        ]
    );

    // A scrape annotation replaces the container probes.
    pod.metadata.annotations = Some(labels(&[
        (PROMETHEUS_SCRAPE_ANNOTATION, "true"),
        (PROMETHEUS_PATH_ANNOTATION, "/stats/prometheus"),
        (PROMETHEUS_PORT_ANNOTATION, "15020"),
    ]));
    test.controller.apply_pod(pod);
    assert_eq!(
        test.controller.workload_health_check_info("10.0.0.1"),
        [Probe {
            path: "/stats/prometheus".to_string(),
            port: Some(Port {
                name: String::new(),
                port: 15020,
                protocol: Protocol::Unsupported,
            }),
        }]
    );

    assert!(test.controller.workload_health_check_info("10.9.9.9").is_empty());
    assert!(test.controller.management_ports("10.9.9.9").is_empty());
}
