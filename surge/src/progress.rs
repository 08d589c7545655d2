use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use surge_core::Engine;
use surge_core::duration::format_duration;

/// Terminal progress view fed from `EngineStatus` on the control-tick
/// cadence. Finite runs get a bar; unbounded runs a spinner.
pub struct Progress {
    bar: ProgressBar,
    task: tokio::task::JoinHandle<()>,
}

impl Progress {
    pub fn start(engine: Arc<Engine>) -> Self {
        let (total, finite) = engine.total_time();

        let bar = if finite {
            let bar = ProgressBar::new(total.as_millis() as u64);
            bar.set_style(
                ProgressStyle::with_template("{prefix:>9} [{bar:40}] {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar
        } else {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::with_template("{prefix:>9} {spinner} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            bar
        };
        bar.set_draw_target(ProgressDrawTarget::stderr_with_hz(10));
        bar.set_prefix("starting");

        let task = {
            let bar = bar.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(100));
                loop {
                    interval.tick().await;

                    let status = engine.status();
                    let label = if status.paused {
                        "paused"
                    } else if status.running {
                        "running"
                    } else if engine.is_running() {
                        "starting"
                    } else {
                        "stopping"
                    };
                    bar.set_prefix(label);

                    if finite {
                        let at = status.at_time.as_millis() as u64;
                        bar.set_position(at.min(total.as_millis() as u64));
                        bar.set_message(format!(
                            "{} / {}",
                            format_duration(status.at_time),
                            format_duration(total)
                        ));
                    } else {
                        bar.set_message(format!("{} / --", format_duration(status.at_time)));
                        bar.tick();
                    }
                }
            })
        };

        Self { bar, task }
    }

    pub fn finish(self) {
        self.task.abort();
        self.bar.finish_and_clear();
    }
}
