use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use parking_lot::Mutex;

use surge_core::http::HttpRequest;
use surge_core::{CancelSignal, Collector, HttpClient};
use surge_metrics::{Registry, Sample};

use super::{FLUSH_INTERVAL, MAX_BUFFERED_SAMPLES};

/// Consecutive flush failures tolerated before the collector disables
/// itself for the rest of the run.
const MAX_FAILURES: u32 = 5;

/// InfluxDB v1 sink: line-protocol POSTs to `/write?db=<db>` on a fixed
/// cadence. Repeated failures disable the sink; the run itself is never
/// affected.
pub struct InfluxdbCollector {
    write_url: String,
    registry: Arc<Registry>,
    client: HttpClient,
    buffer: Mutex<Vec<Sample>>,
    failures: AtomicU32,
    disabled: AtomicBool,
}

impl InfluxdbCollector {
    /// `destination` is `http://host:8086/<database>`.
    pub fn new(destination: &str, registry: Arc<Registry>) -> anyhow::Result<Self> {
        let parsed = url::Url::parse(destination)
            .map_err(|_| anyhow::anyhow!("invalid influxdb url: {destination}"))?;
        anyhow::ensure!(
            matches!(parsed.scheme(), "http" | "https"),
            "invalid influxdb url scheme: {destination}"
        );

        let database = parsed.path().trim_matches('/');
        anyhow::ensure!(
            !database.is_empty() && !database.contains('/'),
            "influxdb url must name a database: {destination}"
        );

        let mut base = parsed.clone();
        base.set_path("/write");
        base.set_query(Some(&format!("db={database}")));

        Ok(Self {
            write_url: base.to_string(),
            registry,
            client: HttpClient::default(),
            buffer: Mutex::new(Vec::new()),
            failures: AtomicU32::new(0),
            disabled: AtomicBool::new(false),
        })
    }

    async fn flush(&self) {
        if self.disabled.load(Ordering::Relaxed) {
            return;
        }

        let samples = std::mem::take(&mut *self.buffer.lock());
        if samples.is_empty() {
            return;
        }

        let mut body = String::new();
        for sample in &samples {
            if let Some(line) = self.encode_line(sample) {
                body.push_str(&line);
                body.push('\n');
            }
        }
        if body.is_empty() {
            return;
        }

        let request = HttpRequest::post(&self.write_url, body.into());
        let ok = match self.client.request(request).await {
            Ok(response) if response.status < 300 => true,
            Ok(response) => {
                tracing::warn!(status = response.status, "influxdb write rejected");
                false
            }
            Err(err) => {
                tracing::warn!(error = %err, "influxdb write failed");
                false
            }
        };

        if ok {
            self.failures.store(0, Ordering::Relaxed);
        } else {
            let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures >= MAX_FAILURES {
                tracing::warn!(
                    failures,
                    "influxdb collector disabled for the rest of the run"
                );
                self.disabled.store(true, Ordering::Relaxed);
            }
        }
    }

    fn encode_line(&self, sample: &Sample) -> Option<String> {
        let name = self.registry.name(sample.metric)?;
        let mut line = escape_ident(&name);
        for (key, value) in &sample.tags {
            line.push(',');
            line.push_str(&escape_ident(key));
            line.push('=');
            line.push_str(&escape_ident(value));
        }
        let ns = sample
            .time
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        line.push_str(&format!(" value={} {ns}", sample.value));
        Some(line)
    }
}

/// Escape measurement/tag tokens per the v1 line protocol.
fn escape_ident(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace(' ', "\\ ")
        .replace('=', "\\=")
}

#[async_trait]
impl Collector for InfluxdbCollector {
    fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&self, stop: &CancelSignal) {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(FLUSH_INTERVAL) => self.flush().await,
            }
        }
        self.flush().await;
    }

    fn collect(&self, samples: &[Sample]) -> usize {
        if self.disabled.load(Ordering::Relaxed) {
            return samples.len();
        }

        let mut buffer = self.buffer.lock();
        let room = MAX_BUFFERED_SAMPLES.saturating_sub(buffer.len());
        let take = samples.len().min(room);
        buffer.extend_from_slice(&samples[..take]);
        samples.len() - take
    }
}
