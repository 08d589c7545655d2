use async_trait::async_trait;
use surge_metrics::Sample;

use crate::cancel::CancelSignal;

/// Streaming sink for raw samples (file writer, time-series database).
///
/// The engine owns the lifecycle: `init` before the run starts (a failure
/// is a setup error), `run` on a dedicated task so the collector can batch
/// and flush on its own schedule, `collect` as a non-blocking deposit from
/// the sample drainer.
#[async_trait]
pub trait Collector: Send + Sync {
    fn init(&self) -> anyhow::Result<()>;

    /// Flush loop; must return promptly once `stop` fires, after a final
    /// flush.
    async fn run(&self, stop: &CancelSignal);

    /// Deposit samples without blocking. Returns how many were dropped
    /// (buffer full, sink disabled); the engine counts drops but never
    /// fails the run on them.
    fn collect(&self, samples: &[Sample]) -> usize;
}
