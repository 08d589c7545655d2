use std::collections::BTreeMap;
use std::time::Duration;

use hdrhistogram::Histogram;
use parking_lot::Mutex;

use crate::metrics::MetricKind;

/// Formatted aggregate map, keyed by aggregate name (`count`, `rate`, `avg`,
/// `p95`, ...). Aggregates that are undefined for the current state are
/// omitted rather than reported as zero.
pub type Aggregates = BTreeMap<&'static str, f64>;

/// Per-metric accumulator.
///
/// Written by the engine's single drainer task; read (snapshotted) by the
/// threshold evaluator, the control API and the final summary. The interior
/// mutexes are uncontended on the write side.
#[derive(Debug)]
pub enum Sink {
    Counter(Mutex<CounterState>),
    Gauge(Mutex<GaugeState>),
    Rate(Mutex<RateState>),
    Trend(Mutex<Histogram<u64>>),
}

#[derive(Debug, Default)]
pub struct CounterState {
    pub sum: f64,
}

#[derive(Debug, Default)]
pub struct GaugeState {
    pub written: bool,
    pub value: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Default)]
pub struct RateState {
    pub total: u64,
    pub hits: u64,
}

fn new_trend_histogram() -> Histogram<u64> {
    // Bounds sized for latencies in milliseconds, up to an hour.
    match Histogram::<u64>::new_with_bounds(1, 60_000 * 60, 3) {
        Ok(h) => h,
        Err(err) => panic!("failed to create histogram: {err}"),
    }
}

impl Sink {
    pub fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Sink::Counter(Mutex::new(CounterState::default())),
            MetricKind::Gauge => Sink::Gauge(Mutex::new(GaugeState::default())),
            MetricKind::Rate => Sink::Rate(Mutex::new(RateState::default())),
            MetricKind::Trend => Sink::Trend(Mutex::new(new_trend_histogram())),
        }
    }

    pub fn apply(&self, value: f64) {
        match self {
            Sink::Counter(c) => {
                c.lock().sum += value;
            }
            Sink::Gauge(g) => {
                let mut g = g.lock();
                if g.written {
                    g.min = g.min.min(value);
                    g.max = g.max.max(value);
                } else {
                    g.written = true;
                    g.min = value;
                    g.max = value;
                }
                g.value = value;
            }
            Sink::Rate(r) => {
                let mut r = r.lock();
                r.total += 1;
                if value != 0.0 {
                    r.hits += 1;
                }
            }
            Sink::Trend(h) => {
                let mut h = h.lock();
                let _ = h.record(value.max(0.0).round() as u64);
            }
        }
    }

    /// Format the sink's aggregates. `elapsed` is the run's active time and
    /// feeds counter rates; it excludes paused time by construction.
    pub fn format(&self, elapsed: Duration) -> Aggregates {
        let mut out = Aggregates::new();
        match self {
            Sink::Counter(c) => {
                let c = c.lock();
                out.insert("count", c.sum);
                let secs = elapsed.as_secs_f64();
                if secs > 0.0 {
                    out.insert("rate", c.sum / secs);
                }
            }
            Sink::Gauge(g) => {
                let g = g.lock();
                if g.written {
                    out.insert("value", g.value);
                    out.insert("min", g.min);
                    out.insert("max", g.max);
                }
            }
            Sink::Rate(r) => {
                let r = r.lock();
                if r.total > 0 {
                    out.insert("rate", r.hits as f64 / r.total as f64);
                }
            }
            Sink::Trend(h) => {
                let h = h.lock();
                if h.len() > 0 {
                    out.insert("min", h.min() as f64);
                    out.insert("max", h.max() as f64);
                    out.insert("avg", h.mean());
                    out.insert("med", h.value_at_quantile(0.50) as f64);
                    out.insert("p90", h.value_at_quantile(0.90) as f64);
                    out.insert("p95", h.value_at_quantile(0.95) as f64);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_formats_count_and_rate() {
        let sink = Sink::new(MetricKind::Counter);
        sink.apply(1.0);
        sink.apply(2.5);

        let agg = sink.format(Duration::from_secs(2));
        assert_eq!(agg.get("count"), Some(&3.5));
        assert_eq!(agg.get("rate"), Some(&1.75));
    }

    #[test]
    fn counter_omits_rate_at_zero_elapsed() {
        let sink = Sink::new(MetricKind::Counter);
        sink.apply(1.0);

        let agg = sink.format(Duration::ZERO);
        assert_eq!(agg.get("count"), Some(&1.0));
        assert!(!agg.contains_key("rate"));
    }

    #[test]
    fn gauge_tracks_last_min_max() {
        let sink = Sink::new(MetricKind::Gauge);
        assert!(sink.format(Duration::from_secs(1)).is_empty());

        sink.apply(5.0);
        sink.apply(1.0);
        sink.apply(3.0);

        let agg = sink.format(Duration::from_secs(1));
        assert_eq!(agg.get("value"), Some(&3.0));
        assert_eq!(agg.get("min"), Some(&1.0));
        assert_eq!(agg.get("max"), Some(&5.0));
    }

    #[test]
    fn rate_is_hit_fraction() {
        let sink = Sink::new(MetricKind::Rate);
        assert!(sink.format(Duration::from_secs(1)).is_empty());

        sink.apply(1.0);
        sink.apply(0.0);
        sink.apply(1.0);
        sink.apply(1.0);

        let agg = sink.format(Duration::from_secs(1));
        assert_eq!(agg.get("rate"), Some(&0.75));
    }

    #[test]
    fn trend_formats_percentiles() {
        let sink = Sink::new(MetricKind::Trend);
        for v in [100.0, 200.0, 300.0, 400.0, 500.0] {
            sink.apply(v);
        }

        let agg = sink.format(Duration::from_secs(1));
        assert_eq!(agg.get("min"), Some(&100.0));
        assert!(agg.get("max").is_some_and(|v| *v >= 499.0));
        assert!(agg.get("med").is_some_and(|v| (250.0..=350.0).contains(v)));
        assert!(agg.get("p95").is_some_and(|v| *v >= 400.0));
        assert!(agg.contains_key("avg"));
        assert!(agg.contains_key("p90"));
    }
}
