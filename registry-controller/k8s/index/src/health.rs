//! Pod probes -> health check and management port info.

use crate::pod::PodInfo;
use mesh_registry_controller_core::{Port, Probe, Protocol};
use mesh_registry_controller_k8s_api::{self as k8s, IntOrString};

pub(crate) const PROMETHEUS_SCRAPE_ANNOTATION: &str = "prometheus.io/scrape";
pub(crate) const PROMETHEUS_PATH_ANNOTATION: &str = "prometheus.io/path";
pub(crate) const PROMETHEUS_PORT_ANNOTATION: &str = "prometheus.io/port";
const DEFAULT_PROMETHEUS_PATH: &str = "/metrics";

/// Health checks for a pod. A prometheus scrape annotation replaces the
/// checks derived from container probes.
pub(crate) fn probes(pod: &PodInfo) -> Vec<Probe> {
    if pod
        .annotations
        .get(PROMETHEUS_SCRAPE_ANNOTATION)
        .is_some_and(|v| v == "true")
    {
        let path = pod
            .annotations
            .get(PROMETHEUS_PATH_ANNOTATION)
            .cloned()
            .unwrap_or_else(|| DEFAULT_PROMETHEUS_PATH.to_string());
        let port = pod
            .annotations
            .get(PROMETHEUS_PORT_ANNOTATION)
            .and_then(|p| p.parse::<u16>().ok())
            .map(|port| Port {
                name: String::new(),
                port,
                protocol: Protocol::Unsupported,
            });
        return vec![Probe { path, port }];
    }

    container_probes(pod)
        .filter_map(|probe| {
            let http = probe.http_get.as_ref()?;
            let port = resolve(pod, &http.port)?;
            Some(Probe {
                path: http.path.clone().unwrap_or_default(),
                port: Some(mgmt_port(port, Protocol::Http)),
            })
        })
        .collect()
}

/// Ports used only by probes.
pub(crate) fn management_ports(pod: &PodInfo) -> Vec<Port> {
    container_probes(pod)
        .filter_map(|probe| {
            if let Some(http) = probe.http_get.as_ref() {
                return resolve(pod, &http.port).map(|p| mgmt_port(p, Protocol::Http));
            }
            let tcp = probe.tcp_socket.as_ref()?;
            resolve(pod, &tcp.port).map(|p| mgmt_port(p, Protocol::Tcp))
        })
        .collect()
}

/// Readiness, then liveness, probes of each container.
fn container_probes(pod: &PodInfo) -> impl Iterator<Item = &k8s::Probe> {
    pod.containers.iter().flat_map(|c| {
        c.readiness_probe
            .as_ref()
            .into_iter()
            .chain(c.liveness_probe.as_ref())
    })
}

fn resolve(pod: &PodInfo, port: &IntOrString) -> Option<u16> {
    match port {
        IntOrString::Int(n) => u16::try_from(*n).ok(),
        IntOrString::String(s) => s.parse().ok().or_else(|| pod.container_port(s)),
    }
}

fn mgmt_port(port: u16, protocol: Protocol) -> Port {
    Port {
        name: format!("mgmt-{port}"),
        port,
        protocol,
    }
}
