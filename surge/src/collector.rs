pub mod influxdb;
pub mod json;

/// How many samples a collector buffers before it starts dropping. The
/// engine reports drops on its `dropped_samples` counter.
pub(crate) const MAX_BUFFERED_SAMPLES: usize = 100_000;

/// Collector flush cadence.
pub(crate) const FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);
