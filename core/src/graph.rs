use crate::error::EngineError;
use crate::event::{EdgeKind, EdgeMeta, EventNode, EventRecord};
use serde::Serialize;
use std::collections::HashMap;

/// Result of proposing an edge to the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeOutcome {
    /// First time this (from, to) pair was seen; `causality:detected` fires.
    Created,
    /// The pair existed and confidence or type precedence improved.
    Upgraded,
    /// The proposal lost to the existing edge.
    Unchanged,
    /// Self-edge or confidence out of range; dropped.
    Rejected,
}

/// Directed event graph with confidence-weighted edges.
///
/// Adjacency lives on the nodes themselves, keyed by peer event id, and the
/// two directions are kept mirror-consistent: every entry in `a.causes[b]`
/// has an identical entry in `b.caused_by[a]`.
#[derive(Debug, Default)]
pub struct EventGraph {
    nodes: HashMap<String, EventNode>,
    edge_count: usize,
}

/// Point-in-time counters, serialized into engine stats.
#[derive(Debug, Clone, Serialize)]
pub struct GraphCounts {
    pub nodes: usize,
    pub edges: usize,
}

impl EventGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node for the record. Fails if the event id is already known.
    pub fn insert(&mut self, record: EventRecord) -> Result<&EventNode, EngineError> {
        if self.nodes.contains_key(&record.event_id) {
            return Err(EngineError::InvalidEvent(format!(
                "duplicate event_id: {}",
                record.event_id
            )));
        }

        let id = record.event_id.clone();
        self.nodes.insert(id.clone(), EventNode::new(record));
        Ok(&self.nodes[&id])
    }

    pub fn get(&self, event_id: &str) -> Option<&EventNode> {
        self.nodes.get(event_id)
    }

    pub fn get_mut(&mut self, event_id: &str) -> Option<&mut EventNode> {
        self.nodes.get_mut(event_id)
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.nodes.contains_key(event_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    pub fn nodes(&self) -> impl Iterator<Item = &EventNode> {
        self.nodes.values()
    }

    pub fn counts(&self) -> GraphCounts {
        GraphCounts {
            nodes: self.nodes.len(),
            edges: self.edge_count,
        }
    }

    /// Create or upgrade the edge `from -> to`.
    ///
    /// Uniqueness is by the (from, to) pair: re-detection keeps the maximum
    /// confidence and the highest-precedence kind seen so far. Self-edges
    /// are never created.
    pub fn add_edge(
        &mut self,
        from: &str,
        to: &str,
        confidence: f64,
        kind: EdgeKind,
    ) -> Result<EdgeOutcome, EngineError> {
        if from == to {
            return Ok(EdgeOutcome::Rejected);
        }
        if !(confidence > 0.0 && confidence <= 1.0) {
            tracing::warn!(from, to, confidence, "dropping edge with out-of-range confidence");
            return Ok(EdgeOutcome::Rejected);
        }
        if !self.nodes.contains_key(from) {
            return Err(EngineError::NotFound(from.to_string()));
        }

        let target_timestamp = match self.nodes.get(to) {
            Some(node) => node.timestamp(),
            None => return Err(EngineError::NotFound(to.to_string())),
        };

        let existing = self
            .nodes
            .get(from)
            .and_then(|node| node.causes.get(to).copied());

        let merged = match existing {
            None => EdgeMeta {
                confidence,
                kind,
                target_timestamp,
            },
            Some(old) => {
                let kind = if kind.precedence() > old.kind.precedence() {
                    kind
                } else {
                    old.kind
                };
                EdgeMeta {
                    confidence: old.confidence.max(confidence),
                    kind,
                    target_timestamp: old.target_timestamp,
                }
            }
        };

        let outcome = match existing {
            None => EdgeOutcome::Created,
            Some(old) if merged != old => EdgeOutcome::Upgraded,
            Some(_) => return Ok(EdgeOutcome::Unchanged),
        };

        if let Some(node) = self.nodes.get_mut(from) {
            node.causes.insert(to.to_string(), merged);
        }
        if let Some(node) = self.nodes.get_mut(to) {
            node.caused_by.insert(from.to_string(), merged);
        }
        if outcome == EdgeOutcome::Created {
            self.edge_count += 1;
        }

        Ok(outcome)
    }

    /// Remove every node with `timestamp < timestamp_lo` together with its
    /// incident edges. Returns the evicted records so the caller can cascade
    /// index removals.
    pub fn evict_before(&mut self, timestamp_lo: i64) -> Vec<EventRecord> {
        let doomed: Vec<String> = self
            .nodes
            .values()
            .filter(|node| node.timestamp() < timestamp_lo)
            .map(|node| node.event_id().to_string())
            .collect();

        let mut evicted = Vec::with_capacity(doomed.len());
        for id in doomed {
            if let Some(node) = self.nodes.remove(&id) {
                for peer in node.causes.keys() {
                    if let Some(peer_node) = self.nodes.get_mut(peer) {
                        if peer_node.caused_by.remove(&id).is_some() {
                            self.edge_count -= 1;
                        }
                    }
                }
                for peer in node.caused_by.keys() {
                    if let Some(peer_node) = self.nodes.get_mut(peer) {
                        if peer_node.causes.remove(&id).is_some() {
                            self.edge_count -= 1;
                        }
                    }
                }
                evicted.push(node.event);
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn record(id: &str, ts: i64) -> EventRecord {
        EventRecord {
            event_id: id.to_string(),
            timestamp: ts,
            service_id: "svc".to_string(),
            service_name: None,
            trace_id: None,
            span_id: None,
            parent_span_id: None,
            event_type: "custom".to_string(),
            data: HashMap::new(),
            metadata: HashMap::new(),
            tenant_id: "default".to_string(),
        }
    }

    #[test]
    fn test_insert_rejects_duplicates() {
        let mut graph = EventGraph::new();
        graph.insert(record("a", 1)).unwrap();
        let err = graph.insert(record("a", 2)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidEvent(_)));
    }

    #[test]
    fn test_edges_are_mirror_consistent() {
        let mut graph = EventGraph::new();
        graph.insert(record("a", 1)).unwrap();
        graph.insert(record("b", 2)).unwrap();

        let outcome = graph.add_edge("a", "b", 0.8, EdgeKind::Temporal).unwrap();
        assert_eq!(outcome, EdgeOutcome::Created);

        let forward = graph.get("a").unwrap().causes.get("b").copied().unwrap();
        let backward = graph.get("b").unwrap().caused_by.get("a").copied().unwrap();
        assert_eq!(forward, backward);
        assert_eq!(forward.target_timestamp, 2);
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn test_edge_upgrade_keeps_max_confidence_and_precedence() {
        let mut graph = EventGraph::new();
        graph.insert(record("a", 1)).unwrap();
        graph.insert(record("b", 2)).unwrap();

        graph.add_edge("a", "b", 0.8, EdgeKind::Temporal).unwrap();

        // Weaker confidence but stronger kind: type upgrades, confidence stays.
        let outcome = graph.add_edge("a", "b", 0.5, EdgeKind::Trace).unwrap();
        assert_eq!(outcome, EdgeOutcome::Upgraded);
        let edge = *graph.get("a").unwrap().causes.get("b").unwrap();
        assert_eq!(edge.kind, EdgeKind::Trace);
        assert!((edge.confidence - 0.8).abs() < 1e-9);

        // Strictly weaker proposal changes nothing.
        let outcome = graph.add_edge("a", "b", 0.4, EdgeKind::Temporal).unwrap();
        assert_eq!(outcome, EdgeOutcome::Unchanged);
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn test_no_self_edges() {
        let mut graph = EventGraph::new();
        graph.insert(record("a", 1)).unwrap();
        let outcome = graph.add_edge("a", "a", 0.9, EdgeKind::Trace).unwrap();
        assert_eq!(outcome, EdgeOutcome::Rejected);
        assert!(graph.get("a").unwrap().causes.is_empty());
    }

    #[test]
    fn test_evict_before_cascades_edges() {
        let mut graph = EventGraph::new();
        graph.insert(record("old", 10)).unwrap();
        graph.insert(record("mid", 20)).unwrap();
        graph.insert(record("new", 30)).unwrap();
        graph.add_edge("old", "mid", 0.9, EdgeKind::Temporal).unwrap();
        graph.add_edge("mid", "new", 0.9, EdgeKind::Temporal).unwrap();

        let evicted = graph.evict_before(15);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].event_id, "old");
        assert!(!graph.contains("old"));
        assert!(graph.get("mid").unwrap().caused_by.is_empty());
        assert_eq!(graph.edge_count(), 1);
    }
}
