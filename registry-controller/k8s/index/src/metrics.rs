use crate::Controller;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};
use std::sync::Arc;

#[derive(Debug)]
struct Instrumented(Arc<Controller>);

pub fn register(reg: &mut Registry, controller: Arc<Controller>) {
    reg.register_collector(Box::new(Instrumented(controller)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let sizes = self.0.sizes();
        for (name, help, value) in [
            (
                "service_index_size",
                "The number of services in index",
                sizes.services,
            ),
            ("pod_index_size", "The number of pods in index", sizes.pods),
            ("node_index_size", "The number of nodes in index", sizes.nodes),
            (
                "endpoint_set_index_size",
                "The number of endpoint sets in index",
                sizes.endpoint_sets,
            ),
            (
                "pending_resolutions",
                "The number of unobserved pods referenced by endpoint sets",
                sizes.pending_resolutions,
            ),
            (
                "network_gateways",
                "The number of cross-network gateways",
                sizes.network_gateways,
            ),
        ] {
            let gauge = ConstGauge::new(value as u32);
            let gauge_encoder =
                encoder.encode_descriptor(name, help, None, MetricType::Gauge)?;
            gauge.encode(gauge_encoder)?;
        }
        Ok(())
    }
}
