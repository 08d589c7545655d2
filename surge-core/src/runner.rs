use std::sync::Arc;

use async_trait::async_trait;
use surge_metrics::Sample;

use crate::cancel::CancelSignal;
use crate::group::GroupTree;
use crate::options::Options;

/// A single-iteration executor, owned by exactly one pool worker.
///
/// Instances are independent; the engine never calls one VU from two
/// workers.
#[async_trait]
pub trait Vu: Send {
    /// Called before (re)use so the runner can bind per-user state to the
    /// worker's id. Runs on every park-to-active transition.
    fn reconfigure(&mut self, id: u64) -> anyhow::Result<()>;

    /// Perform exactly one logical iteration and return its samples.
    /// Blocking IO inside must honour `cancel`.
    async fn run_once(&mut self, cancel: &CancelSignal) -> anyhow::Result<Vec<Sample>>;
}

/// Factory for VU instances, carrying the shared group/check tree.
///
/// Any operation may fail with a construction error, in which case the
/// engine refuses to start.
pub trait Runner: Send + Sync {
    /// Source-declared option defaults, read once before the engine is
    /// built.
    fn options(&self) -> Options;

    /// Called after the CLI/config merge so the runner can pre-bake derived
    /// state (e.g. an HTTP client honouring `max-redirects`).
    fn apply_options(&self, options: &Options) -> anyhow::Result<()>;

    /// The group tree is append-only and safe to read while VUs execute.
    fn groups(&self) -> Arc<GroupTree>;

    fn new_vu(&self) -> anyhow::Result<Box<dyn Vu>>;
}
