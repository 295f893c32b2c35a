use crate::{
    core::dns::DnsResolver,
    dns::{self, PollingResolver},
    index::{self, ClusterInfo, Controller, EndpointSet, Event, EventStream},
    k8s,
    notify::LogNotifier,
    watch,
};
use anyhow::{bail, Result};
use clap::Parser;
use futures::prelude::*;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::{path::PathBuf, sync::Arc};
use tokio::time::Duration;
use tracing::{info, info_span, Instrument};

const MESH_NETWORKS_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DNS_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[clap(name = "registry", about = "A service registry controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "mesh_registry=info,warn",
        env = "MESH_REGISTRY_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Identifies this registry in endpoint shards and mesh network
    /// configuration.
    #[clap(long, default_value = "Kubernetes")]
    cluster_id: String,

    #[clap(long, alias = "cluster-domain", default_value = "cluster.local")]
    domain_suffix: String,

    #[clap(long, default_value = "cluster.local")]
    trust_domain: String,

    /// A mesh networks document, polled for changes.
    #[clap(long)]
    mesh_networks: Option<PathBuf>,

    /// The API from which service endpoints are read.
    #[clap(long, value_enum, default_value = "endpoints")]
    endpoint_mode: EndpointMode,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
enum EndpointMode {
    Endpoints,
    #[value(name = "endpointslices")]
    EndpointSlices,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            cluster_id,
            domain_suffix,
            trust_domain,
            mesh_networks,
            endpoint_mode,
        } = self;

        let cluster_info = ClusterInfo {
            cluster_id,
            domain_suffix,
            trust_domain,
        };

        let mut prom = <Registry>::default();
        let notifier = LogNotifier::register(prom.sub_registry_with_prefix("registry"));
        let (resolver, names) = PollingResolver::new();
        let controller = Controller::new(
            cluster_info,
            Arc::new(notifier),
            Some(resolver as Arc<dyn DnsResolver>),
        );

        index::metrics::register(
            prom.sub_registry_with_prefix("registry_index"),
            controller.clone(),
        );
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Spawn resource watches. Each stream is applied in order by its own
        // worker.

        let services = watch::changes(
            runtime.watch_all::<k8s::Service>(watcher::Config::default()),
            Some,
        )
        .map(Event::Service)
        .boxed();

        let endpoints = match endpoint_mode {
            EndpointMode::Endpoints => watch::changes(
                runtime.watch_all::<k8s::Endpoints>(watcher::Config::default()),
                watch::endpoint_sets(EndpointSet::from_endpoints),
            )
            .map(Event::EndpointSet)
            .boxed(),
            EndpointMode::EndpointSlices => watch::changes(
                runtime.watch_all::<k8s::EndpointSlice>(watcher::Config::default()),
                watch::endpoint_sets(EndpointSet::from_slice),
            )
            .map(Event::EndpointSet)
            .boxed(),
        };

        let pods = watch::changes(
            runtime.watch_all::<k8s::Pod>(watcher::Config::default()),
            Some,
        )
        .map(Event::Pod)
        .boxed();

        let nodes = watch::changes(
            runtime.watch_all::<k8s::Node>(watcher::Config::default()),
            Some,
        )
        .map(Event::Node)
        .boxed();

        let mut streams: Vec<EventStream> = vec![services, endpoints, pods, nodes];
        if let Some(path) = mesh_networks {
            info!(path = %path.display(), "Watching mesh networks");
            streams.push(watch::mesh_networks(path, MESH_NETWORKS_POLL_INTERVAL));
        }

        tokio::spawn(
            dns::poll(names, controller.clone(), DNS_REFRESH_INTERVAL)
                .instrument(info_span!("dns")),
        );

        let workers = controller.start(streams);

        // Block the main thread on the shutdown signal. Once it fires, stop the
        // event workers before exiting.
        let res = runtime.run().await;
        workers.stop().await;
        if res.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
