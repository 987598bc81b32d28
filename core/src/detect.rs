use crate::event::{data_similarity, EdgeKind, EventRecord};
use crate::graph::EventGraph;
use crate::index::TemporalIndex;
use std::collections::HashMap;

/// Data-flow correlation looks at a fixed one-second window.
const DATA_FLOW_WINDOW_MS: i64 = 1_000;

/// Minimum key-overlap ratio for a data-flow edge.
const DATA_FLOW_SIMILARITY: f64 = 0.8;

/// Confidence assigned to explicit `triggered_by` links.
const SERVICE_TRIGGER_CONFIDENCE: f64 = 0.9;

/// An edge a detector wants added. Applied by the engine in detector order,
/// so later, weaker detectors never overwrite a stronger existing edge.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EdgeProposal {
    pub from: String,
    pub to: String,
    pub confidence: f64,
    pub kind: EdgeKind,
}

/// Span parentage: the most recent event carrying the parent span id within
/// the same trace caused this one.
pub(crate) fn detect_trace(
    graph: &EventGraph,
    spans: &HashMap<(String, String), Vec<String>>,
    record: &EventRecord,
) -> Vec<EdgeProposal> {
    let (Some(trace_id), Some(parent_span)) = (&record.trace_id, &record.parent_span_id) else {
        return Vec::new();
    };

    let Some(candidates) = spans.get(&(trace_id.clone(), parent_span.clone())) else {
        return Vec::new();
    };

    // Most recent by event timestamp, not arrival order.
    candidates
        .iter()
        .filter(|id| id.as_str() != record.event_id)
        .filter_map(|id| graph.get(id))
        .max_by_key(|node| node.timestamp())
        .map(|parent| EdgeProposal {
            from: parent.event_id().to_string(),
            to: record.event_id.clone(),
            confidence: 1.0,
            kind: EdgeKind::Trace,
        })
        .into_iter()
        .collect()
}

/// Temporal proximity: candidates inside the correlation window get a
/// confidence that decays exponentially with the gap, boosted for shared
/// service or trace.
pub(crate) fn detect_temporal(
    graph: &EventGraph,
    temporal: &TemporalIndex,
    record: &EventRecord,
    window_ms: i64,
    confidence_threshold: f64,
) -> Vec<EdgeProposal> {
    let decay = window_ms as f64 / 3.0;
    let mut proposals = Vec::new();

    for candidate_id in temporal.range(record.timestamp - window_ms, record.timestamp) {
        if candidate_id == record.event_id {
            continue;
        }
        let Some(candidate) = graph.get(candidate_id) else {
            continue;
        };

        let gap = (record.timestamp - candidate.timestamp()).abs() as f64;
        let mut confidence = (-gap / decay).exp();

        if candidate.event.service_id == record.service_id {
            confidence *= 1.2;
        }
        let same_trace = record
            .trace_id
            .as_ref()
            .is_some_and(|t| candidate.event.trace_id.as_deref() == Some(t));
        if same_trace {
            confidence *= 1.5;
        }
        confidence = confidence.min(1.0);

        if confidence >= confidence_threshold {
            proposals.push(EdgeProposal {
                from: candidate_id.to_string(),
                to: record.event_id.clone(),
                confidence,
                kind: EdgeKind::Temporal,
            });
        }
    }

    proposals
}

/// Explicit trigger: `metadata.triggered_by` names the causing event.
pub(crate) fn detect_service_trigger(
    graph: &EventGraph,
    record: &EventRecord,
) -> Vec<EdgeProposal> {
    record
        .triggered_by()
        .filter(|id| *id != record.event_id)
        .and_then(|id| graph.get(id))
        .map(|trigger| EdgeProposal {
            from: trigger.event_id().to_string(),
            to: record.event_id.clone(),
            confidence: SERVICE_TRIGGER_CONFIDENCE,
            kind: EdgeKind::Service,
        })
        .into_iter()
        .collect()
}

/// Shared payload: events whose data bags overlap strongly within one second
/// are treated as a flow.
pub(crate) fn detect_data_flow(
    graph: &EventGraph,
    temporal: &TemporalIndex,
    record: &EventRecord,
) -> Vec<EdgeProposal> {
    if record.data.is_empty() {
        return Vec::new();
    }

    let mut proposals = Vec::new();
    for candidate_id in temporal.range(record.timestamp - DATA_FLOW_WINDOW_MS, record.timestamp) {
        if candidate_id == record.event_id {
            continue;
        }
        let Some(candidate) = graph.get(candidate_id) else {
            continue;
        };
        if candidate.event.data.is_empty() {
            continue;
        }

        let sim = data_similarity(&candidate.event.data, &record.data);
        if sim > DATA_FLOW_SIMILARITY {
            proposals.push(EdgeProposal {
                from: candidate_id.to_string(),
                to: record.event_id.clone(),
                confidence: sim,
                kind: EdgeKind::DataFlow,
            });
        }
    }

    proposals
}
