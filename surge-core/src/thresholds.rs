use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use surge_metrics::Registry;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid threshold expression for metric `{metric}`: {error}")]
    InvalidExpr { metric: String, error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdOp {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
}

/// Aggregate selector; maps directly onto a key of the sink's formatted
/// aggregate map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdAgg {
    Count,
    Rate,
    Value,
    Avg,
    Min,
    Max,
    Med,
    P90,
    P95,
}

impl ThresholdAgg {
    pub fn key(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Rate => "rate",
            Self::Value => "value",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
            Self::Med => "med",
            Self::P90 => "p90",
            Self::P95 => "p95",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdExpr {
    pub agg: ThresholdAgg,
    pub op: ThresholdOp,
    pub value: f64,
}

/// One parsed expression with its latched verdict.
#[derive(Debug)]
pub struct Threshold {
    /// Expression as written, for display.
    pub source: String,
    pub expr: ThresholdExpr,
    failed: AtomicBool,
}

impl Threshold {
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }
}

/// All thresholds declared for one metric, in declaration order.
#[derive(Debug)]
pub struct ThresholdSet {
    pub metric: String,
    pub thresholds: Vec<Threshold>,
}

impl ThresholdSet {
    /// Build threshold sets from the merged options mapping. Parse errors
    /// are configuration errors; the engine refuses to start on them.
    pub fn build(thresholds: &BTreeMap<String, Vec<String>>) -> Result<Vec<ThresholdSet>> {
        let mut out = Vec::with_capacity(thresholds.len());
        for (metric, exprs) in thresholds {
            let mut set = ThresholdSet {
                metric: metric.clone(),
                thresholds: Vec::with_capacity(exprs.len()),
            };
            for raw in exprs {
                let expr = parse_threshold_expr(raw).map_err(|error| Error::InvalidExpr {
                    metric: metric.clone(),
                    error,
                })?;
                set.thresholds.push(Threshold {
                    source: raw.clone(),
                    expr,
                    failed: AtomicBool::new(false),
                });
            }
            out.push(set);
        }
        Ok(out)
    }
}

pub fn parse_threshold_expr(raw: &str) -> std::result::Result<ThresholdExpr, String> {
    let s: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if s.is_empty() {
        return Err("empty threshold".to_string());
    }

    let ops = [
        ("<=", ThresholdOp::Lte),
        (">=", ThresholdOp::Gte),
        ("==", ThresholdOp::Eq),
        ("<", ThresholdOp::Lt),
        (">", ThresholdOp::Gt),
    ];
    let (op_pos, op_len, op) = ops
        .iter()
        .find_map(|(tok, op)| s.find(tok).map(|pos| (pos, tok.len(), *op)))
        .ok_or_else(|| format!("invalid threshold (missing operator): {raw}"))?;

    let (left, right_with_op) = s.split_at(op_pos);
    let right = &right_with_op[op_len..];
    if left.is_empty() || right.is_empty() {
        return Err(format!("invalid threshold: {raw}"));
    }

    let agg = if left.eq_ignore_ascii_case("count") {
        ThresholdAgg::Count
    } else if left.eq_ignore_ascii_case("rate") {
        ThresholdAgg::Rate
    } else if left.eq_ignore_ascii_case("value") {
        ThresholdAgg::Value
    } else if left.eq_ignore_ascii_case("avg") {
        ThresholdAgg::Avg
    } else if left.eq_ignore_ascii_case("min") {
        ThresholdAgg::Min
    } else if left.eq_ignore_ascii_case("max") {
        ThresholdAgg::Max
    } else if left.eq_ignore_ascii_case("med") {
        ThresholdAgg::Med
    } else if let Some(inner) = left.strip_prefix("p(").and_then(|v| v.strip_suffix(')')) {
        match inner {
            "90" => ThresholdAgg::P90,
            "95" => ThresholdAgg::P95,
            "50" => ThresholdAgg::Med,
            _ => {
                return Err(format!(
                    "unsupported percentile in threshold (expected p(50), p(90) or p(95)): {raw}"
                ));
            }
        }
    } else {
        return Err(format!("unknown aggregation `{left}` in threshold: {raw}"));
    };

    let value: f64 = right
        .parse()
        .map_err(|_| format!("invalid numeric value in threshold: {raw}"))?;

    Ok(ThresholdExpr { agg, op, value })
}

fn compare(observed: f64, op: ThresholdOp, expected: f64) -> bool {
    match op {
        ThresholdOp::Lt => observed < expected,
        ThresholdOp::Lte => observed <= expected,
        ThresholdOp::Gt => observed > expected,
        ThresholdOp::Gte => observed >= expected,
        ThresholdOp::Eq => observed == expected,
    }
}

/// Evaluate every not-yet-failed threshold against the current aggregates.
///
/// A threshold fires when its aggregate is present and the predicate is
/// false; metrics with no samples yet are left alone. `failed` latches.
/// Returns true when any threshold (newly or previously) is in the failed
/// state.
pub fn evaluate(registry: &Registry, elapsed: Duration, sets: &[ThresholdSet]) -> bool {
    let mut any_failed = false;

    for set in sets {
        let aggregates = registry
            .lookup(&set.metric)
            .and_then(|id| registry.format(id, elapsed));

        for threshold in &set.thresholds {
            if threshold.failed() {
                any_failed = true;
                continue;
            }

            let observed = aggregates
                .as_ref()
                .and_then(|agg| agg.get(threshold.expr.agg.key()).copied());

            if let Some(observed) = observed
                && !compare(observed, threshold.expr.op, threshold.expr.value)
            {
                tracing::debug!(
                    metric = %set.metric,
                    expression = %threshold.source,
                    observed,
                    "threshold crossed"
                );
                threshold.failed.store(true, Ordering::Relaxed);
                any_failed = true;
            }
        }
    }

    any_failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use surge_metrics::{MetricKind, ValueContains};

    #[test]
    fn parse_trims_whitespace() {
        let expr = parse_threshold_expr("  avg  <=  123  ").unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(expr.agg, ThresholdAgg::Avg);
        assert_eq!(expr.op, ThresholdOp::Lte);
        assert_eq!(expr.value, 123.0);
    }

    #[test]
    fn parse_maps_percentiles() {
        let expr = parse_threshold_expr("p(95)<100").unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(expr.agg, ThresholdAgg::P95);

        let expr = parse_threshold_expr("p(50)<100").unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(expr.agg, ThresholdAgg::Med);

        let err = match parse_threshold_expr("p(99)<100") {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(err.contains("unsupported percentile"));
    }

    #[test]
    fn parse_rejects_missing_operator() {
        assert!(parse_threshold_expr("avg 100").is_err());
        assert!(parse_threshold_expr("").is_err());
    }

    #[test]
    fn build_surfaces_parse_errors_with_the_metric_name() {
        let mut map = BTreeMap::new();
        map.insert("latency".to_string(), vec!["bogus".to_string()]);

        let err = match ThresholdSet::build(&map) {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("latency"));
    }

    #[test]
    fn missing_metric_does_not_fire() {
        let registry = Registry::default();
        let mut map = BTreeMap::new();
        map.insert("absent".to_string(), vec!["count>0".to_string()]);
        let sets = ThresholdSet::build(&map).unwrap_or_else(|e| panic!("{e}"));

        assert!(!evaluate(&registry, Duration::from_secs(1), &sets));
        assert!(!sets[0].thresholds[0].failed());
    }

    #[test]
    fn crossed_threshold_latches() {
        let registry = Registry::default();
        let id = registry.register("latency", MetricKind::Trend, ValueContains::Time);
        registry.apply(id, 500.0);

        let mut map = BTreeMap::new();
        map.insert("latency".to_string(), vec!["p(95)<100".to_string()]);
        let sets = ThresholdSet::build(&map).unwrap_or_else(|e| panic!("{e}"));

        assert!(evaluate(&registry, Duration::from_secs(1), &sets));
        assert!(sets[0].thresholds[0].failed());

        // Still failed even if later samples would satisfy the predicate.
        for _ in 0..100 {
            registry.apply(id, 1.0);
        }
        assert!(evaluate(&registry, Duration::from_secs(1), &sets));
        assert!(sets[0].thresholds[0].failed());
    }

    #[test]
    fn passing_threshold_stays_clean() {
        let registry = Registry::default();
        let id = registry.register("hits", MetricKind::Counter, ValueContains::Default);
        registry.apply(id, 3.0);

        let mut map = BTreeMap::new();
        map.insert("hits".to_string(), vec!["count>=3".to_string()]);
        let sets = ThresholdSet::build(&map).unwrap_or_else(|e| panic!("{e}"));

        assert!(!evaluate(&registry, Duration::from_secs(1), &sets));
    }
}
