use std::collections::HashMap;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::metrics::{MetricDef, MetricKind, MetricSummary, ValueContains};
use crate::sink::{Aggregates, Sink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetricId(u32);

#[derive(Debug, Default)]
struct Defs {
    defs: Vec<MetricDef>,
    by_name: HashMap<String, MetricId>,
}

/// Metric definitions plus one sink per metric.
///
/// Registration may happen concurrently (runners register custom metrics
/// lazily from inside iterations); sink writes come from a single drainer.
#[derive(Debug, Default)]
pub struct Registry {
    defs: RwLock<Defs>,
    sinks: DashMap<MetricId, Sink>,
}

impl Registry {
    /// Register a metric, or return the existing id when the name is taken.
    pub fn register(&self, name: &str, kind: MetricKind, contains: ValueContains) -> MetricId {
        let mut defs = self.defs.write();
        if let Some(id) = defs.by_name.get(name) {
            return *id;
        }

        let id = MetricId(defs.defs.len() as u32);
        defs.defs.push(MetricDef {
            name: name.to_string(),
            kind,
            contains,
        });
        defs.by_name.insert(name.to_string(), id);
        self.sinks.insert(id, Sink::new(kind));
        id
    }

    pub fn lookup(&self, name: &str) -> Option<MetricId> {
        self.defs.read().by_name.get(name).copied()
    }

    pub fn def(&self, id: MetricId) -> Option<MetricDef> {
        self.defs.read().defs.get(id.0 as usize).cloned()
    }

    pub fn name(&self, id: MetricId) -> Option<String> {
        self.defs
            .read()
            .defs
            .get(id.0 as usize)
            .map(|d| d.name.clone())
    }

    /// Apply one sample value to the metric's sink. Hot path for the drainer.
    pub fn apply(&self, id: MetricId, value: f64) {
        if let Some(sink) = self.sinks.get(&id) {
            sink.apply(value);
        }
    }

    /// Formatted aggregates for one metric.
    pub fn format(&self, id: MetricId, elapsed: Duration) -> Option<Aggregates> {
        self.sinks.get(&id).map(|sink| sink.format(elapsed))
    }

    /// Snapshot every metric, sorted by name.
    pub fn summarize(&self, elapsed: Duration) -> Vec<MetricSummary> {
        let defs = self.defs.read();
        let mut out: Vec<MetricSummary> = defs
            .defs
            .iter()
            .enumerate()
            .filter_map(|(idx, def)| {
                let sink = self.sinks.get(&MetricId(idx as u32))?;
                Some(MetricSummary {
                    name: def.name.clone(),
                    kind: def.kind,
                    contains: def.contains,
                    aggregates: sink.format(elapsed),
                })
            })
            .collect();

        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent_per_name() {
        let reg = Registry::default();
        let a = reg.register("http_reqs", MetricKind::Counter, ValueContains::Default);
        let b = reg.register("http_reqs", MetricKind::Counter, ValueContains::Default);
        assert_eq!(a, b);
        assert_eq!(reg.lookup("http_reqs"), Some(a));
    }

    #[test]
    fn lookup_unknown_is_none() {
        let reg = Registry::default();
        assert!(reg.lookup("nope").is_none());
    }

    #[test]
    fn apply_reaches_the_sink() {
        let reg = Registry::default();
        let id = reg.register("iterations", MetricKind::Counter, ValueContains::Default);
        reg.apply(id, 1.0);
        reg.apply(id, 1.0);

        let agg = reg.format(id, Duration::from_secs(1)).unwrap();
        assert_eq!(agg.get("count"), Some(&2.0));
    }

    #[test]
    fn summarize_sorts_by_name() {
        let reg = Registry::default();
        reg.register("zzz", MetricKind::Counter, ValueContains::Default);
        reg.register("aaa", MetricKind::Trend, ValueContains::Time);

        let names: Vec<String> = reg
            .summarize(Duration::from_secs(1))
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["aaa".to_string(), "zzz".to_string()]);
    }
}
