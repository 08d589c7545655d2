use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use surge_metrics::{MetricId, MetricKind, MetricSummary, Registry, Sample, ValueContains};

use crate::cancel::CancelSignal;
use crate::collector::Collector;
use crate::group::GroupSnapshot;
use crate::options::{OptField, Options};
use crate::runner::{Runner, Vu};
use crate::thresholds::{self, ThresholdSet};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Options(#[from] crate::options::Error),

    #[error(transparent)]
    Thresholds(#[from] crate::thresholds::Error),

    #[error("runner setup failed: {0}")]
    Runner(anyhow::Error),

    #[error("collector setup failed: {0}")]
    Collector(anyhow::Error),

    #[error("invalid status patch: {0}")]
    InvalidPatch(String),
}

/// Control tick: status patches become visible to workers, thresholds are
/// re-evaluated and the clock advances on this cadence.
const TICK: Duration = Duration::from_millis(100);

/// Sample fan-in queue depth, in batches.
const INGEST_QUEUE: usize = 1024;

/// Engine state as exposed to the control API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct EngineStatus {
    pub running: bool,
    pub paused: bool,
    pub vus: i64,
    pub vus_max: i64,
    #[serde(rename = "at-time-ms", serialize_with = "ser_millis")]
    pub at_time: Duration,
    pub tainted: bool,
}

fn ser_millis<S: serde::Serializer>(
    d: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(d.as_millis() as u64)
}

/// Partial status mutation from the control API; fields are applied
/// atomically one by one.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StatusPatch {
    #[serde(default)]
    pub running: OptField<bool>,

    #[serde(default)]
    pub paused: OptField<bool>,

    #[serde(default)]
    pub vus: OptField<i64>,

    #[serde(default, alias = "vus_max")]
    pub vus_max: OptField<i64>,
}

#[derive(Debug, Clone, Copy)]
struct RunSettings {
    vus: i64,
    vus_max: i64,
    /// None = unbounded.
    duration: Option<Duration>,
    paused: bool,
    abort_on_taint: bool,
}

#[derive(Debug, Clone, Copy)]
struct BuiltinMetrics {
    iterations: MetricId,
    iteration_duration: MetricId,
    errors: MetricId,
    dropped_samples: MetricId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerCommand {
    Park,
    Active,
}

struct WorkerSlot {
    cmd: watch::Sender<WorkerCommand>,
}

/// The test execution engine: a fixed pool of VU workers, a single sample
/// drainer, and a 100ms control loop that owns the clock, the thresholds
/// and pool reconciliation.
pub struct Engine {
    runner: Arc<dyn Runner>,
    metrics: Arc<Registry>,
    thresholds: Vec<ThresholdSet>,
    collector: Option<Arc<dyn Collector>>,
    settings: RunSettings,
    status: Mutex<EngineStatus>,
    cancel: CancelSignal,
    collector_stop: CancelSignal,
    loop_alive: AtomicBool,
    builtin: BuiltinMetrics,
}

impl Engine {
    /// Build an engine from a runner and the merged options. Threshold
    /// parse errors and inconsistent VU counts are configuration errors;
    /// nothing runs on failure.
    pub fn new(runner: Arc<dyn Runner>, metrics: Arc<Registry>, options: &Options) -> Result<Self> {
        let vus = options.vus.value_or(1);
        let vus_max = options.vus_max.value_or(vus);
        if vus < 0 || vus_max < 0 {
            return Err(Error::Options(crate::options::Error::InvalidVus));
        }
        if vus > vus_max {
            return Err(Error::Options(crate::options::Error::VusExceedMax {
                vus,
                vus_max,
            }));
        }

        let duration = match options.duration.value_or(Duration::ZERO) {
            Duration::ZERO => None,
            d => Some(d),
        };

        let thresholds = ThresholdSet::build(&options.thresholds)?;

        let builtin = BuiltinMetrics {
            iterations: metrics.register("iterations", MetricKind::Counter, ValueContains::Default),
            iteration_duration: metrics.register(
                "iteration_duration",
                MetricKind::Trend,
                ValueContains::Time,
            ),
            errors: metrics.register("errors", MetricKind::Counter, ValueContains::Default),
            dropped_samples: metrics.register(
                "dropped_samples",
                MetricKind::Counter,
                ValueContains::Default,
            ),
        };

        let settings = RunSettings {
            vus,
            vus_max,
            duration,
            paused: options.paused.value_or(false),
            abort_on_taint: options.abort_on_taint.value_or(false),
        };

        Ok(Self {
            runner,
            metrics,
            thresholds,
            collector: None,
            settings,
            status: Mutex::new(EngineStatus {
                running: false,
                paused: settings.paused,
                vus,
                vus_max,
                at_time: Duration::ZERO,
                tainted: false,
            }),
            cancel: CancelSignal::new(),
            collector_stop: CancelSignal::new(),
            loop_alive: AtomicBool::new(false),
            builtin,
        })
    }

    pub fn set_collector(&mut self, collector: Box<dyn Collector>) {
        self.collector = Some(Arc::from(collector));
    }

    /// Request cooperative shutdown; workers stop at iteration boundaries.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// True while the control loop is alive (includes the paused state).
    pub fn is_running(&self) -> bool {
        self.loop_alive.load(Ordering::Acquire)
    }

    pub fn status(&self) -> EngineStatus {
        self.status.lock().clone()
    }

    pub fn at_time(&self) -> Duration {
        self.status.lock().at_time
    }

    pub fn tainted(&self) -> bool {
        self.status.lock().tainted
    }

    fn mark_tainted(&self) {
        self.status.lock().tainted = true;
    }

    /// Configured total run time; `finite = false` means unbounded (no
    /// progress bar).
    pub fn total_time(&self) -> (Duration, bool) {
        match self.settings.duration {
            Some(d) => (d, true),
            None => (Duration::ZERO, false),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.metrics
    }

    /// Snapshot of every metric's formatted aggregates at the current
    /// clock.
    pub fn metrics_summary(&self) -> Vec<MetricSummary> {
        self.metrics.summarize(self.at_time())
    }

    pub fn groups_snapshot(&self) -> GroupSnapshot {
        self.runner.groups().snapshot()
    }

    pub fn thresholds(&self) -> &[ThresholdSet] {
        &self.thresholds
    }

    /// Apply a control-API patch. Field validation errors surface to the
    /// API; accepted fields are reconciled by the scheduler within one
    /// tick.
    pub fn patch_status(&self, patch: &StatusPatch) -> Result<EngineStatus> {
        let mut st = self.status.lock();

        if patch.running.valid {
            match patch.running.value {
                Some(true) => {
                    if !self.is_running() {
                        return Err(Error::InvalidPatch(
                            "engine is not running and cannot be restarted".to_string(),
                        ));
                    }
                }
                Some(false) => {
                    tracing::debug!("stop requested via status patch");
                    self.cancel.cancel();
                }
                None => {}
            }
        }

        if patch.vus_max.valid
            && let Some(v) = patch.vus_max.value
        {
            if v < 0 {
                return Err(Error::InvalidPatch("vus-max must be non-negative".to_string()));
            }
            if v > self.settings.vus_max {
                return Err(Error::InvalidPatch(format!(
                    "vus-max ({v}) cannot exceed the provisioned pool ({})",
                    self.settings.vus_max
                )));
            }
            st.vus_max = v;
            if st.vus > v {
                st.vus = v;
            }
        }

        if patch.vus.valid
            && let Some(v) = patch.vus.value
        {
            if v < 0 {
                return Err(Error::InvalidPatch("vus must be non-negative".to_string()));
            }
            if v > st.vus_max {
                // Clamp, but still report the validation failure.
                let max = st.vus_max;
                st.vus = max;
                return Err(Error::InvalidPatch(format!(
                    "vus ({v}) exceeds vus-max ({max}); clamped to {max}"
                )));
            }
            st.vus = v;
        }

        if patch.paused.valid
            && let Some(p) = patch.paused.value
        {
            st.paused = p;
        }

        Ok(st.clone())
    }

    /// Run the test: provision the pool, start the drainer and collector,
    /// then drive the control loop until cancellation or duration expiry.
    /// On return all aggregates are final.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.loop_alive.store(true, Ordering::Release);
        let result = self.run_inner().await;
        self.loop_alive.store(false, Ordering::Release);
        self.status.lock().running = false;
        result
    }

    async fn run_inner(self: &Arc<Self>) -> Result<()> {
        if let Some(collector) = &self.collector {
            collector.init().map_err(Error::Collector)?;
        }

        // Provision every VU before anything starts; a construction error
        // means the run never begins.
        let mut vus = Vec::with_capacity(self.settings.vus_max as usize);
        for _ in 0..self.settings.vus_max {
            vus.push(self.runner.new_vu().map_err(Error::Runner)?);
        }

        let collector_task = self.collector.clone().map(|collector| {
            let engine = self.clone();
            tokio::spawn(async move {
                collector.run(&engine.collector_stop).await;
            })
        });

        let (samples_tx, mut samples_rx) = mpsc::channel::<Vec<Sample>>(INGEST_QUEUE);

        let drainer = {
            let engine = self.clone();
            tokio::spawn(async move {
                while let Some(batch) = samples_rx.recv().await {
                    engine.ingest(&batch);
                }
            })
        };

        let (pause_tx, pause_rx) = watch::channel(self.settings.paused);

        let mut workers = Vec::with_capacity(vus.len());
        let mut worker_handles = Vec::with_capacity(vus.len());
        for (idx, vu) in vus.into_iter().enumerate() {
            let initial = if (idx as i64) < self.settings.vus {
                WorkerCommand::Active
            } else {
                WorkerCommand::Park
            };
            let (cmd_tx, cmd_rx) = watch::channel(initial);
            workers.push(WorkerSlot { cmd: cmd_tx });

            let engine = self.clone();
            let paused = pause_rx.clone();
            let tx = samples_tx.clone();
            let id = idx as u64 + 1;
            worker_handles.push(tokio::spawn(async move {
                worker_loop(engine, id, vu, cmd_rx, paused, tx).await;
            }));
        }

        self.status.lock().running = true;
        tracing::debug!(
            vus = self.settings.vus,
            vus_max = self.settings.vus_max,
            "engine started"
        );

        let mut interval = tokio::time::interval(TICK);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = Instant::now();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let now = Instant::now();
            let dt = now.duration_since(last);
            last = now;

            let (at_time, paused, vus_target) = {
                let mut st = self.status.lock();
                if !st.paused {
                    st.at_time += dt;
                }
                (st.at_time, st.paused, st.vus)
            };

            if let Some(total) = self.settings.duration
                && at_time >= total
            {
                tracing::debug!("duration reached, stopping");
                break;
            }

            // Make the latest status visible to the pool.
            pause_tx.send_if_modified(|p| {
                if *p != paused {
                    *p = paused;
                    true
                } else {
                    false
                }
            });
            for (idx, worker) in workers.iter().enumerate() {
                let desired = if (idx as i64) < vus_target {
                    WorkerCommand::Active
                } else {
                    WorkerCommand::Park
                };
                worker.cmd.send_if_modified(|c| {
                    if *c != desired {
                        *c = desired;
                        true
                    } else {
                        false
                    }
                });
            }

            if thresholds::evaluate(&self.metrics, at_time, &self.thresholds) {
                self.mark_tainted();
            }

            if self.settings.abort_on_taint && self.tainted() {
                tracing::warn!("run is tainted, aborting (abort-on-taint)");
                break;
            }
        }

        // Cooperative shutdown: stop the pool, drain the queue completely,
        // then let the collector flush and exit.
        self.cancel.cancel();
        for handle in worker_handles {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "vu worker task failed");
            }
        }

        drop(samples_tx);
        let _ = drainer.await;

        self.collector_stop.cancel();
        if let Some(handle) = collector_task {
            let _ = handle.await;
        }

        tracing::debug!("engine stopped");
        Ok(())
    }

    /// Apply a batch to the sinks (exactly once per sample) and deposit it
    /// with the collector, counting anything the collector dropped.
    fn ingest(&self, batch: &[Sample]) {
        for sample in batch {
            self.metrics.apply(sample.metric, sample.value);
        }

        if let Some(collector) = &self.collector {
            let dropped = collector.collect(batch);
            if dropped > 0 {
                self.metrics
                    .apply(self.builtin.dropped_samples, dropped as f64);
            }
        }
    }
}

async fn worker_loop(
    engine: Arc<Engine>,
    id: u64,
    mut vu: Box<dyn Vu>,
    mut cmd: watch::Receiver<WorkerCommand>,
    mut paused: watch::Receiver<bool>,
    samples: mpsc::Sender<Vec<Sample>>,
) {
    let mut needs_reconfigure = true;

    loop {
        if engine.cancel.is_cancelled() {
            break;
        }

        let parked = *cmd.borrow() == WorkerCommand::Park;
        if parked || *paused.borrow() {
            if parked {
                needs_reconfigure = true;
            }
            tokio::select! {
                _ = engine.cancel.cancelled() => break,
                res = cmd.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
                res = paused.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
            }
            continue;
        }

        if needs_reconfigure {
            if let Err(err) = vu.reconfigure(id) {
                tracing::error!(vu = id, error = %err, "vu reconfigure failed, retiring worker");
                engine.mark_tainted();
                break;
            }
            needs_reconfigure = false;
        }

        let started = Instant::now();
        let batch = match vu.run_once(&engine.cancel).await {
            Ok(mut batch) => {
                batch.push(Sample::new(engine.builtin.iterations, 1.0));
                batch.push(Sample::new(
                    engine.builtin.iteration_duration,
                    started.elapsed().as_secs_f64() * 1e3,
                ));
                batch
            }
            Err(err) => {
                tracing::debug!(vu = id, error = %err, "iteration error");
                engine.mark_tainted();
                vec![
                    Sample::new(engine.builtin.errors, 1.0),
                    Sample::new(engine.builtin.iterations, 1.0),
                    Sample::new(
                        engine.builtin.iteration_duration,
                        started.elapsed().as_secs_f64() * 1e3,
                    ),
                ]
            }
        };

        // Bounded queue: backpressure here keeps sample loss off the
        // in-process path.
        if samples.send(batch).await.is_err() {
            break;
        }
    }
}
