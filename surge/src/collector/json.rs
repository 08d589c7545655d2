use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use surge_core::{CancelSignal, Collector};
use surge_metrics::{Registry, Sample};

use super::{FLUSH_INTERVAL, MAX_BUFFERED_SAMPLES};

#[derive(Serialize)]
struct JsonSample<'a> {
    metric: &'a str,
    tags: std::collections::BTreeMap<&'a str, &'a str>,
    value: f64,
    time: String,
}

/// NDJSON file sink: one object per sample, flushed on a fixed cadence and
/// once more at shutdown.
pub struct JsonCollector {
    path: PathBuf,
    registry: Arc<Registry>,
    file: Mutex<Option<BufWriter<File>>>,
    buffer: Mutex<Vec<Sample>>,
}

impl JsonCollector {
    pub fn new(path: &str, registry: Arc<Registry>) -> Self {
        Self {
            path: PathBuf::from(path),
            registry,
            file: Mutex::new(None),
            buffer: Mutex::new(Vec::new()),
        }
    }

    fn flush(&self) {
        let samples = std::mem::take(&mut *self.buffer.lock());
        if samples.is_empty() {
            return;
        }

        let mut file = self.file.lock();
        let Some(writer) = file.as_mut() else {
            return;
        };

        for sample in &samples {
            let Some(name) = self.registry.name(sample.metric) else {
                continue;
            };
            let line = JsonSample {
                metric: &name,
                tags: sample
                    .tags
                    .iter()
                    .map(|(k, v)| (k.as_ref(), v.as_ref()))
                    .collect(),
                value: sample.value,
                time: DateTime::<Utc>::from(sample.time).to_rfc3339(),
            };
            match serde_json::to_string(&line) {
                Ok(json) => {
                    if let Err(err) = writeln!(writer, "{json}") {
                        tracing::warn!(path = %self.path.display(), error = %err, "json collector write failed");
                        return;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "json collector serialization failed");
                }
            }
        }

        if let Err(err) = writer.flush() {
            tracing::warn!(path = %self.path.display(), error = %err, "json collector flush failed");
        }
    }
}

#[async_trait]
impl Collector for JsonCollector {
    fn init(&self) -> anyhow::Result<()> {
        let file = File::create(&self.path)
            .map_err(|err| anyhow::anyhow!("failed to create {}: {err}", self.path.display()))?;
        *self.file.lock() = Some(BufWriter::new(file));
        Ok(())
    }

    async fn run(&self, stop: &CancelSignal) {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(FLUSH_INTERVAL) => self.flush(),
            }
        }
        self.flush();
    }

    fn collect(&self, samples: &[Sample]) -> usize {
        let mut buffer = self.buffer.lock();
        let room = MAX_BUFFERED_SAMPLES.saturating_sub(buffer.len());
        let take = samples.len().min(room);
        buffer.extend_from_slice(&samples[..take]);
        samples.len() - take
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use surge_metrics::{MetricKind, ValueContains};

    #[tokio::test]
    async fn writes_one_json_line_per_sample() {
        let registry = Arc::new(Registry::default());
        let id = registry.register("http_reqs", MetricKind::Counter, ValueContains::Default);

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("samples.ndjson");
        let collector = JsonCollector::new(path.to_str().expect("utf-8 path"), registry);
        collector.init().expect("init");

        let samples = vec![
            Sample::with_tags(id, 1.0, vec![(Arc::from("url"), Arc::from("http://x/"))]),
            Sample::new(id, 1.0),
        ];
        assert_eq!(collector.collect(&samples), 0);
        collector.flush();

        let content = std::fs::read_to_string(&path).expect("read output");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: serde_json::Value = serde_json::from_str(lines[0]).expect("valid json");
        assert_eq!(parsed["metric"], "http_reqs");
        assert_eq!(parsed["value"], 1.0);
        assert_eq!(parsed["tags"]["url"], "http://x/");
        assert!(parsed["time"].as_str().is_some_and(|t| t.contains('T')));
    }

    #[test]
    fn drops_overflow_and_reports_it() {
        let registry = Arc::new(Registry::default());
        let id = registry.register("m", MetricKind::Counter, ValueContains::Default);
        let collector = JsonCollector::new("/dev/null", registry);

        let batch: Vec<Sample> = (0..MAX_BUFFERED_SAMPLES + 10)
            .map(|_| Sample::new(id, 1.0))
            .collect();
        assert_eq!(collector.collect(&batch), 10);
    }
}
