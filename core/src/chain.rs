use crate::error::EngineError;
use crate::event::EdgeKind;
use crate::graph::EventGraph;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

/// Which adjacency a traversal follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Backward,
    Forward,
    Both,
}

/// One event on a traversed chain.
#[derive(Debug, Clone, Serialize)]
pub struct ChainEvent {
    pub event_id: String,
    pub timestamp: i64,
    pub service_id: String,
    pub event_type: String,
    /// Hops from the traversal root.
    pub depth: usize,
    /// Product of edge confidences along the discovery path.
    pub path_confidence: f64,
}

/// One traversed edge.
#[derive(Debug, Clone, Serialize)]
pub struct ChainEdge {
    pub from: String,
    pub to: String,
    pub confidence: f64,
    pub kind: EdgeKind,
}

/// A connected, acyclic slice of the graph produced by a traversal.
#[derive(Debug, Clone, Serialize)]
pub struct CausalChain {
    pub chain_id: String,
    pub root_event: String,
    pub direction: Direction,
    /// Sorted by timestamp ascending.
    pub events: Vec<ChainEvent>,
    pub edges: Vec<ChainEdge>,
    pub start_time: i64,
    pub end_time: i64,
    /// Aggregate confidence over the traversed edges.
    pub confidence: f64,
}

impl CausalChain {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// The outcome of a root-cause search.
#[derive(Debug, Clone, Serialize)]
pub struct RootCause {
    pub event_id: String,
    pub timestamp: i64,
    pub service_id: String,
    pub event_type: String,
    pub path_confidence: f64,
    /// Ranking score; equals `path_confidence` for true roots.
    pub score: f64,
    pub is_true_root: bool,
}

/// Breadth-first traversal over the causal adjacency.
///
/// Only edges at or above `confidence_threshold` are followed; a visited set
/// keeps the output acyclic even though the underlying graph is not
/// guaranteed to be. When `tenant_id` is set, nodes of other tenants are
/// invisible to the walk.
pub fn trace(
    graph: &EventGraph,
    root: &str,
    direction: Direction,
    max_depth: usize,
    confidence_threshold: f64,
    tenant_id: Option<&str>,
) -> Result<CausalChain, EngineError> {
    let root_node = graph
        .get(root)
        .filter(|node| tenant_id.map_or(true, |t| node.event.tenant_id == t))
        .ok_or_else(|| EngineError::NotFound(root.to_string()))?;

    let mut events = Vec::new();
    let mut edges = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<(String, usize, f64)> = VecDeque::new();

    visited.insert(root_node.event_id().to_string());
    queue.push_back((root_node.event_id().to_string(), 0, 1.0));

    while let Some((event_id, depth, path_confidence)) = queue.pop_front() {
        let Some(node) = graph.get(&event_id) else {
            continue;
        };

        events.push(ChainEvent {
            event_id: event_id.clone(),
            timestamp: node.timestamp(),
            service_id: node.event.service_id.clone(),
            event_type: node.event.event_type.clone(),
            depth,
            path_confidence,
        });

        if depth > max_depth {
            continue;
        }

        let mut neighbors: Vec<(&String, crate::event::EdgeMeta, bool)> = Vec::new();
        if matches!(direction, Direction::Backward | Direction::Both) {
            neighbors.extend(node.caused_by.iter().map(|(id, meta)| (id, *meta, false)));
        }
        if matches!(direction, Direction::Forward | Direction::Both) {
            neighbors.extend(node.causes.iter().map(|(id, meta)| (id, *meta, true)));
        }
        // Deterministic expansion order regardless of hash-map iteration.
        neighbors.sort_by(|a, b| a.0.cmp(b.0));

        for (peer_id, meta, outgoing) in neighbors {
            if meta.confidence < confidence_threshold {
                continue;
            }
            let Some(peer) = graph.get(peer_id) else {
                continue;
            };
            if tenant_id.is_some_and(|t| peer.event.tenant_id != t) {
                continue;
            }
            if !visited.insert(peer_id.clone()) {
                continue;
            }

            let (from, to) = if outgoing {
                (event_id.clone(), peer_id.clone())
            } else {
                (peer_id.clone(), event_id.clone())
            };
            edges.push(ChainEdge {
                from,
                to,
                confidence: meta.confidence,
                kind: meta.kind,
            });
            queue.push_back((peer_id.clone(), depth + 1, path_confidence * meta.confidence));
        }
    }

    events.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.event_id.cmp(&b.event_id))
    });

    let start_time = events.first().map_or(0, |e| e.timestamp);
    let end_time = events.last().map_or(0, |e| e.timestamp);
    let confidence = aggregate_confidence(&edges);

    Ok(CausalChain {
        chain_id: Uuid::new_v4().to_string(),
        root_event: root.to_string(),
        direction,
        events,
        edges,
        start_time,
        end_time,
        confidence,
    })
}

/// `0.7 * mean + 0.3 * min` over edge confidences; 1.0 for edge-less chains.
fn aggregate_confidence(edges: &[ChainEdge]) -> f64 {
    if edges.is_empty() {
        return 1.0;
    }
    let mean = edges.iter().map(|e| e.confidence).sum::<f64>() / edges.len() as f64;
    let min = edges
        .iter()
        .map(|e| e.confidence)
        .fold(f64::INFINITY, f64::min);
    0.7 * mean + 0.3 * min
}

/// Search the backward chain from `event_id` for the most plausible origin.
///
/// True roots (chain events with no incoming edges at all) win outright,
/// ranked by path confidence then earliest timestamp. Failing that, every
/// chain event is scored by confidence, error-ness, anomaly, and proximity
/// to the root of the walk.
pub fn find_root(
    graph: &EventGraph,
    event_id: &str,
    max_depth: usize,
    confidence_threshold: f64,
) -> Result<RootCause, EngineError> {
    let chain = trace(
        graph,
        event_id,
        Direction::Backward,
        max_depth,
        confidence_threshold,
        None,
    )?;

    let true_roots: Vec<&ChainEvent> = chain
        .events
        .iter()
        .filter(|ev| graph.get(&ev.event_id).is_some_and(|n| n.caused_by.is_empty()))
        .collect();

    if let Some(best) = true_roots.into_iter().min_by(|a, b| {
        b.path_confidence
            .partial_cmp(&a.path_confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.timestamp.cmp(&b.timestamp))
    }) {
        return Ok(RootCause {
            event_id: best.event_id.clone(),
            timestamp: best.timestamp,
            service_id: best.service_id.clone(),
            event_type: best.event_type.clone(),
            path_confidence: best.path_confidence,
            score: best.path_confidence,
            is_true_root: true,
        });
    }

    let chain_len = chain.len().max(1) as f64;
    chain
        .events
        .iter()
        .map(|ev| {
            let node = graph.get(&ev.event_id);
            let error_boost = node
                .map(|n| if n.event.is_error() { 1.5 } else { 1.0 })
                .unwrap_or(1.0);
            let anomaly = node.map(|n| n.anomaly_score).unwrap_or(0.0);
            let depth_penalty = 1.0 - 0.5 * (ev.depth as f64 / chain_len);
            let score = ev.path_confidence * error_boost * (1.0 + anomaly) * depth_penalty;
            (ev, score)
        })
        .max_by(|(a, sa), (b, sb)| {
            sa.partial_cmp(sb)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
        })
        .map(|(ev, score)| RootCause {
            event_id: ev.event_id.clone(),
            timestamp: ev.timestamp,
            service_id: ev.service_id.clone(),
            event_type: ev.event_type.clone(),
            path_confidence: ev.path_confidence,
            score,
            is_true_root: false,
        })
        .ok_or_else(|| EngineError::Internal("root-cause search over empty chain".into()))
}
