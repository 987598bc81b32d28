use crate::error::EngineError;
use crate::graph::EventGraph;
use crate::pattern::PatternStore;
use itertools::Itertools;
use serde::Serialize;
use std::collections::HashMap;

/// Confidence assigned to pattern-derived candidates.
const PATTERN_CONFIDENCE: f64 = 0.7;

/// History-derived candidates inherit the edge confidence, discounted.
const HISTORY_DISCOUNT: f64 = 0.8;

/// Candidates within the same 100 ms slot deduplicate.
const DEDUP_SLOT_MS: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionSource {
    Pattern,
    History,
}

/// A likely next event.
#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub event_type: String,
    pub service_id: String,
    pub timestamp: i64,
    pub confidence: f64,
    pub source: PredictionSource,
}

/// Short-horizon prediction anchored at an existing event.
///
/// Pattern candidates continue a recurring signature from the anchor's
/// position in it; history candidates replay the anchor's outgoing edges.
/// Output is deduplicated per (type, service, 100 ms slot) and sorted by
/// confidence descending, with full tiebreaks so the result is a pure
/// function of the graph snapshot.
pub fn predict(
    graph: &EventGraph,
    patterns: &PatternStore,
    event_id: &str,
    horizon_ms: i64,
    min_confidence: f64,
    tenant_id: Option<&str>,
) -> Result<Vec<Prediction>, EngineError> {
    let node = graph
        .get(event_id)
        .filter(|n| tenant_id.map_or(true, |t| n.event.tenant_id == t))
        .ok_or_else(|| EngineError::NotFound(event_id.to_string()))?;

    let mut candidates = Vec::new();

    for pattern in patterns.iter() {
        let types = &pattern.signature.event_types;
        let Some(position) = types.iter().position(|t| *t == node.event.event_type) else {
            continue;
        };
        if position + 1 >= types.len() {
            continue;
        }

        let step_ms = pattern.signature.duration_ms / types.len() as i64;
        candidates.push(Prediction {
            event_type: types[position + 1].clone(),
            service_id: node.event.service_id.clone(),
            timestamp: node.timestamp() + step_ms,
            confidence: PATTERN_CONFIDENCE,
            source: PredictionSource::Pattern,
        });
    }

    for (peer_id, edge) in &node.causes {
        let Some(follower) = graph.get(peer_id) else {
            continue;
        };
        if tenant_id.is_some_and(|t| follower.event.tenant_id != t) {
            continue;
        }
        let gap = follower.timestamp() - node.timestamp();
        if gap > horizon_ms {
            continue;
        }
        candidates.push(Prediction {
            event_type: follower.event.event_type.clone(),
            service_id: follower.event.service_id.clone(),
            timestamp: node.timestamp() + gap,
            confidence: edge.confidence * HISTORY_DISCOUNT,
            source: PredictionSource::History,
        });
    }

    let mut best: HashMap<(String, String, i64), Prediction> = HashMap::new();
    for candidate in candidates {
        let key = (
            candidate.event_type.clone(),
            candidate.service_id.clone(),
            candidate.timestamp.div_euclid(DEDUP_SLOT_MS),
        );
        match best.get(&key) {
            Some(existing) if existing.confidence >= candidate.confidence => {}
            _ => {
                best.insert(key, candidate);
            }
        }
    }

    let predictions = best
        .into_values()
        .filter(|p| p.confidence >= min_confidence)
        .sorted_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.timestamp.cmp(&b.timestamp))
                .then_with(|| a.event_type.cmp(&b.event_type))
                .then_with(|| a.service_id.cmp(&b.service_id))
        })
        .collect();

    Ok(predictions)
}
