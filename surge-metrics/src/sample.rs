use std::sync::Arc;
use std::time::SystemTime;

use crate::registry::MetricId;

/// Sample metadata, shared cheaply between the emitting VU and the sinks.
/// Tags ride through to collectors; in-process sinks ignore them.
pub type SampleTags = Vec<(Arc<str>, Arc<str>)>;

/// A single measurement bound to a metric and a timestamp.
#[derive(Debug, Clone)]
pub struct Sample {
    pub metric: MetricId,
    pub tags: SampleTags,
    pub value: f64,
    pub time: SystemTime,
}

impl Sample {
    pub fn new(metric: MetricId, value: f64) -> Self {
        Self {
            metric,
            tags: SampleTags::new(),
            value,
            time: SystemTime::now(),
        }
    }

    pub fn with_tags(metric: MetricId, value: f64, tags: SampleTags) -> Self {
        Self {
            metric,
            tags,
            value,
            time: SystemTime::now(),
        }
    }
}
