use crate::event::{EventNode, EventRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity attached to a published anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyClass {
    Error,
    Critical,
    Warning,
    Info,
}

/// Inputs the scorer needs beyond the node itself. `previous_ts` is the
/// timestamp of the prior event for the same (service, event type), captured
/// before the last-event pointer was overwritten by this ingest.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ScoreContext {
    pub previous_ts: Option<i64>,
    pub expected_interval_ms: i64,
    pub expected_causes: usize,
}

/// Combined anomaly score: the maximum of the data, temporal-interval, and
/// causality-shape components, each in `[0, 1]`.
pub(crate) fn score(node: &EventNode, ctx: ScoreContext) -> f64 {
    let data = data_score(&node.event);
    let interval = interval_score(&node.event, ctx);
    let shape = shape_score(node, ctx.expected_causes);

    data.max(interval).max(shape).clamp(0.0, 1.0)
}

pub(crate) fn classify(record: &EventRecord, score: f64) -> AnomalyClass {
    if record.data.contains_key("error") {
        AnomalyClass::Error
    } else if score > 0.95 {
        AnomalyClass::Critical
    } else if score > 0.9 {
        AnomalyClass::Warning
    } else {
        AnomalyClass::Info
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Rule-based score over the data payload.
fn data_score(record: &EventRecord) -> f64 {
    let mut score: f64 = 0.0;

    if record.data.contains_key("error") {
        score = score.max(0.8);
    }
    if record
        .data
        .get("status")
        .and_then(numeric)
        .is_some_and(|status| status >= 500.0)
    {
        score = score.max(0.9);
    }
    if record
        .data
        .get("latency")
        .and_then(numeric)
        .is_some_and(|latency| latency > 1_000.0)
    {
        score = score.max(0.7);
    }

    score
}

/// Deviation of the observed inter-arrival gap from the expected one.
fn interval_score(record: &EventRecord, ctx: ScoreContext) -> f64 {
    let Some(previous_ts) = ctx.previous_ts else {
        return 0.0;
    };

    let expected = ctx.expected_interval_ms.max(1) as f64;
    let observed = (record.timestamp - previous_ts) as f64;
    let deviation = (observed - expected).abs() / expected;
    deviation.min(1.0)
}

/// How far the in-degree sits from the expected number of causes.
fn shape_score(node: &EventNode, expected_causes: usize) -> f64 {
    let expected = expected_causes.max(1) as f64;
    let actual = node.caused_by.len() as f64;
    ((actual - expected).abs() / expected).min(1.0)
}
