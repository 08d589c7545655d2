use std::time::Duration;

use surge_core::duration::format_duration;
use surge_core::source::SourceData;
use surge_core::{CheckSnapshot, Engine, GroupSnapshot, Options};
use surge_metrics::{MetricSummary, ValueContains};

pub fn print_banner(src: &SourceData, opts: &Options, output: &str, api: Option<&str>) {
    let duration = opts.duration.value_or(Duration::ZERO);
    let duration = if duration.is_zero() {
        "unbounded".to_string()
    } else {
        format_duration(duration)
    };

    println!("surge v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("  execution: local");
    println!("     output: {output}");
    println!("     target: {} ({})", src.filename, src.kind);
    println!(
        "             duration: {duration}, vus: {}, max: {}",
        opts.vus.value_or(0),
        opts.vus_max.value_or(0)
    );
    if let Some(api) = api {
        println!();
        println!("        api: {api}");
    }
    println!();
}

pub fn print_report(engine: &Engine, opts: &Options) {
    let groups = engine.groups_snapshot();
    print_group(&groups, 1);

    let (passes, fails) = count_checks(&groups);
    if passes + fails > 0 {
        let rate = 100.0 * passes as f64 / (passes + fails) as f64;
        let acceptance = opts.acceptance.value_or(0.0);
        println!(
            "  checks: {rate:.2}% passed (acceptance: {:.2}%)",
            acceptance * 100.0
        );
        println!();
    }

    for metric in engine.metrics_summary() {
        let Some(value) = humanize(&metric) else {
            continue;
        };

        let icon = threshold_icon(engine, &metric.name);
        println!("  {icon} {}: {value}", metric.name);
    }
}

fn print_group(group: &GroupSnapshot, level: usize) {
    let indent = "  ".repeat(level);

    if !group.name.is_empty() {
        println!("{indent}█ {}", group.name);
        println!();
    }

    for check in &group.checks {
        println!("{indent}  {}", format_check(check));
    }
    if !group.checks.is_empty() {
        println!();
    }

    for child in &group.groups {
        print_group(child, level + 1);
    }
}

fn format_check(check: &CheckSnapshot) -> String {
    let icon = if check.fails > 0 { "✗" } else { "✓" };
    let rate = check.rate.map(|r| r * 100.0).unwrap_or(0.0);
    format!("{icon} {rate:6.2}% - {}", check.name)
}

fn count_checks(group: &GroupSnapshot) -> (u64, u64) {
    let mut passes = group.checks.iter().map(|c| c.passes).sum::<u64>();
    let mut fails = group.checks.iter().map(|c| c.fails).sum::<u64>();
    for child in &group.groups {
        let (p, f) = count_checks(child);
        passes += p;
        fails += f;
    }
    (passes, fails)
}

fn threshold_icon(engine: &Engine, metric: &str) -> &'static str {
    let mut icon = " ";
    for set in engine.thresholds() {
        if set.metric != metric {
            continue;
        }
        icon = "✓";
        if set.thresholds.iter().any(|t| t.failed()) {
            return "✗";
        }
    }
    icon
}

/// Render a metric one-liner, or `None` when there is nothing to show.
fn humanize(metric: &MetricSummary) -> Option<String> {
    let agg = &metric.aggregates;
    if agg.is_empty() {
        return None;
    }

    match metric.kind {
        surge_metrics::MetricKind::Counter => {
            let count = agg.get("count").copied().unwrap_or(0.0);
            if count == 0.0 {
                return None;
            }
            match agg.get("rate") {
                Some(rate) => Some(format!("{} ({rate:.2}/s)", format_num(count))),
                None => Some(format_num(count)),
            }
        }
        surge_metrics::MetricKind::Gauge => {
            Some(format_value(metric.contains, agg.get("value").copied()?))
        }
        surge_metrics::MetricKind::Rate => Some(format!("{:.2}%", agg.get("rate")? * 100.0)),
        surge_metrics::MetricKind::Trend => {
            let mut parts = Vec::new();
            for key in ["avg", "min", "med", "max", "p90", "p95"] {
                if let Some(v) = agg.get(key) {
                    parts.push(format!("{key}={}", format_value(metric.contains, *v)));
                }
            }
            (!parts.is_empty()).then(|| parts.join(" "))
        }
    }
}

fn format_num(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{}", v as i64)
    } else {
        format!("{v:.2}")
    }
}

fn format_value(contains: ValueContains, v: f64) -> String {
    match contains {
        ValueContains::Time => format!("{v:.2}ms"),
        ValueContains::Default => format_num(v),
    }
}
