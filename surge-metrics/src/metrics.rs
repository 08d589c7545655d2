use serde::Serialize;

use crate::sink::Aggregates;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Rate,
    Trend,
}

/// What a metric's values represent.
///
/// `Time` marks non-additive duration values; the human summary renders them
/// with a unit suffix instead of a bare number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ValueContains {
    Default,
    Time,
}

#[derive(Debug, Clone)]
pub struct MetricDef {
    pub name: String,
    pub kind: MetricKind,
    pub contains: ValueContains,
}

/// Point-in-time view of a metric and its formatted aggregates.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSummary {
    pub name: String,
    pub kind: MetricKind,
    pub contains: ValueContains,
    pub aggregates: Aggregates,
}
