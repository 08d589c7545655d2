pub mod script;
pub mod url;

use surge_metrics::{MetricId, MetricKind, Registry, ValueContains};

/// Built-in HTTP metrics shared by every runner that issues requests.
#[derive(Debug, Clone, Copy)]
pub struct HttpMetricIds {
    pub reqs: MetricId,
    pub duration: MetricId,
    pub failed: MetricId,
}

impl HttpMetricIds {
    pub fn register(registry: &Registry) -> Self {
        Self {
            reqs: registry.register("http_reqs", MetricKind::Counter, ValueContains::Default),
            duration: registry.register(
                "http_req_duration",
                MetricKind::Trend,
                ValueContains::Time,
            ),
            failed: registry.register("http_req_failed", MetricKind::Rate, ValueContains::Default),
        }
    }
}
