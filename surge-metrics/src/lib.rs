pub mod metrics;
pub mod registry;
pub mod sample;
pub mod sink;

pub use metrics::{MetricDef, MetricKind, MetricSummary, ValueContains};
pub use registry::{MetricId, Registry};
pub use sample::{Sample, SampleTags};
pub use sink::{Aggregates, Sink};
