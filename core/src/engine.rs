use crate::anomaly::{self, ScoreContext};
use crate::bus::{BusMessage, EventBus};
use crate::chain::{self, CausalChain, Direction, RootCause};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::detect;
use crate::error::EngineError;
use crate::event::{EventNode, EventRecord};
use crate::graph::{EdgeOutcome, EventGraph, GraphCounts};
use crate::index::{ServiceIndex, TemporalIndex};
use crate::pattern::{PatternObservation, PatternSignature, PatternStore};
use crate::predict::{self, Prediction};
use crate::storage::{CausalityStore, PersistedEdge};
use dashmap::DashMap;
use futures::StreamExt;
use lru::LruCache;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard};

/// Chains whose end sits within this window of the newest event are still
/// feeding pattern extraction. Event-time domain, like the chains themselves.
const CHAIN_RECENCY_MS: i64 = 60_000;

/// Everything the engine mutates, behind one writer lock so detectors always
/// observe a point-in-time snapshot of the indexes.
pub(crate) struct EngineState {
    pub(crate) graph: EventGraph,
    pub(crate) temporal: TemporalIndex,
    pub(crate) services: ServiceIndex,
    /// (trace_id, span_id) -> event ids carrying that span.
    pub(crate) spans: HashMap<(String, String), Vec<String>>,
    pub(crate) patterns: PatternStore,
    pub(crate) chains: LruCache<String, CausalChain>,
    pub(crate) newest_ts: i64,
    pub(crate) evicted_nodes: u64,
    pub(crate) tenant_counts: BTreeMap<String, usize>,
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub graph: GraphCounts,
    pub patterns: usize,
    pub active_chains: usize,
    pub evicted_nodes: u64,
    pub newest_timestamp: i64,
    pub tenants: BTreeMap<String, usize>,
}

/// Outcome of a bulk ingest: how many records landed, and which failed.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub ingested: usize,
    pub failures: Vec<(String, EngineError)>,
}

/// The streaming causality engine.
///
/// Owns the event graph, its secondary indexes, the pattern store, and the
/// materialized chains; every operation is a method so tests instantiate
/// fresh engines. Ingest runs under the single write lock; queries share the
/// read lock and never mutate.
pub struct CausalityEngine {
    state: RwLock<EngineState>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    bus: Arc<EventBus>,
    store: Option<Arc<dyn CausalityStore>>,
    /// Expected inter-arrival overrides per (service_id, event_type).
    expected_intervals: DashMap<(String, String), i64>,
}

impl CausalityEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_parts(config, Arc::new(SystemClock), Arc::new(EventBus::new()), None)
    }

    pub fn with_parts(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        bus: Arc<EventBus>,
        store: Option<Arc<dyn CausalityStore>>,
    ) -> Self {
        tracing::info!(
            correlation_window_ms = config.correlation_window_ms,
            confidence_threshold = config.confidence_threshold,
            retention_window_ms = config.retention_window_ms,
            "causality engine ready"
        );

        let state = EngineState {
            graph: EventGraph::new(),
            temporal: TemporalIndex::new(),
            services: ServiceIndex::new(),
            spans: HashMap::new(),
            patterns: PatternStore::new(config.pattern_cap),
            chains: LruCache::new(
                NonZeroUsize::new(config.active_chains_cap.max(1))
                    .expect("active chains cap must be > 0"),
            ),
            newest_ts: i64::MIN,
            evicted_nodes: 0,
            tenant_counts: BTreeMap::new(),
        };

        Self {
            state: RwLock::new(state),
            config,
            clock,
            bus,
            store,

            expected_intervals: DashMap::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The bus this engine publishes on. Subscribe before ingesting.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Override the expected inter-arrival time for one (service, type).
    pub fn set_expected_interval(&self, service_id: &str, event_type: &str, interval_ms: i64) {
        self.expected_intervals
            .insert((service_id.to_string(), event_type.to_string()), interval_ms);
    }

    fn expected_interval(&self, service_id: &str, event_type: &str) -> i64 {
        self.expected_intervals
            .get(&(service_id.to_string(), event_type.to_string()))
            .map(|entry| *entry.value())
            .unwrap_or(self.config.expected_interval_ms)
    }

    /// Ingest one event: insert, index, detect relations, score, update
    /// patterns, publish. Returns a snapshot of the stored node.
    pub async fn ingest(&self, record: EventRecord) -> Result<EventNode, EngineError> {
        self.ingest_inner(record, true).await
    }

    /// Bulk ingest, timestamp order, collecting failures instead of
    /// aborting. Used by hosts draining a backlog.
    pub async fn ingest_batch(&self, mut records: Vec<EventRecord>) -> BatchOutcome {
        records.sort_by_key(|r| r.timestamp);

        let mut outcome = BatchOutcome::default();
        for record in records {
            let event_id = record.event_id.clone();
            match self.ingest(record).await {
                Ok(_) => outcome.ingested += 1,
                Err(e) => {
                    tracing::warn!(event_id = %event_id, "batch ingest failure: {}", e);
                    outcome.failures.push((event_id, e));
                }
            }
        }
        outcome
    }

    async fn ingest_inner(
        &self,
        record: EventRecord,
        persist: bool,
    ) -> Result<EventNode, EngineError> {
        record.validate()?;

        let mut state = self.state.write().await;

        state.graph.insert(record.clone())?;

        let event_id = record.event_id.clone();
        let timestamp = record.timestamp;

        state.newest_ts = state.newest_ts.max(timestamp);
        state.temporal.put(timestamp, &event_id);
        let previous_same_type = state
            .services
            .record(&record.service_id, &record.event_type, &event_id);
        if let (Some(trace_id), Some(span_id)) = (&record.trace_id, &record.span_id) {
            state
                .spans
                .entry((trace_id.clone(), span_id.clone()))
                .or_default()
                .push(event_id.clone());
        }
        *state
            .tenant_counts
            .entry(record.tenant_id.clone())
            .or_insert(0) += 1;

        // Relation detectors, strongest first. Their results feed each other
        // only through the graph, so they run sequentially on the snapshot.
        let mut proposals = detect::detect_trace(&state.graph, &state.spans, &record);
        proposals.extend(detect::detect_temporal(
            &state.graph,
            &state.temporal,
            &record,
            self.config.correlation_window_ms,
            self.config.confidence_threshold,
        ));
        proposals.extend(detect::detect_service_trigger(&state.graph, &record));
        proposals.extend(detect::detect_data_flow(
            &state.graph,
            &state.temporal,
            &record,
        ));

        let mut created = Vec::new();
        for proposal in proposals {
            match state
                .graph
                .add_edge(&proposal.from, &proposal.to, proposal.confidence, proposal.kind)
            {
                Ok(EdgeOutcome::Created) => {
                    tracing::debug!(
                        from = %proposal.from,
                        to = %proposal.to,
                        confidence = proposal.confidence,
                        "causality edge created"
                    );
                    created.push(proposal);
                }
                Ok(_) => {}
                Err(e) => {
                    // Detector errors are non-fatal; partial analysis beats
                    // a failed ingest.
                    tracing::warn!(
                        from = %proposal.from,
                        to = %proposal.to,
                        "edge application failed: {}",
                        e
                    );
                }
            }
        }

        // Anomaly scoring, after edges are in place.
        let previous_ts =
            previous_same_type.and_then(|id| state.graph.get(&id).map(|n| n.timestamp()));
        let score_ctx = ScoreContext {
            previous_ts,
            expected_interval_ms: self.expected_interval(&record.service_id, &record.event_type),
            expected_causes: self.config.expected_causes,
        };
        let score = state
            .graph
            .get(&event_id)
            .map(|node| anomaly::score(node, score_ctx))
            .unwrap_or(0.0);
        if let Some(node) = state.graph.get_mut(&event_id) {
            node.anomaly_score = score;
        }

        // Materialize the backward chain ending at this node and fold every
        // recently touched chain into the pattern store.
        let mut pattern_matches = Vec::new();
        match chain::trace(
            &state.graph,
            &event_id,
            Direction::Backward,
            self.config.max_chain_depth,
            self.config.confidence_threshold,
            None,
        ) {
            Ok(new_chain) if new_chain.len() > 1 => {
                state.chains.put(new_chain.chain_id.clone(), new_chain);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(event_id = %event_id, "chain materialization failed: {}", e),
        }

        let recency_floor = state.newest_ts - CHAIN_RECENCY_MS;
        let recent_signatures: Vec<PatternSignature> = state
            .chains
            .iter()
            .filter(|(_, chain)| chain.end_time > recency_floor)
            .map(|(_, chain)| PatternSignature::from_chain(chain))
            .collect();
        let wall_now = self.clock.now_ms();
        for signature in recent_signatures {
            if let PatternObservation::Matched(pattern) =
                state.patterns.observe(signature, wall_now)
            {
                if pattern.accepts(&record.service_id, &record.event_type) {
                    pattern_matches.push(pattern);
                }
            }
        }

        // Opportunistic eviction once the graph outgrows the high-water mark.
        if state.graph.len() > self.config.node_high_water {
            let cutoff = state.newest_ts - self.config.retention_window_ms;
            self.evict_locked(&mut state, cutoff);
        }

        let node_snapshot = state
            .graph
            .get(&event_id)
            .cloned()
            .ok_or_else(|| EngineError::Internal(format!("node {} vanished mid-ingest", event_id)))?;

        // Publications happen under the write lock so everything for this
        // ingest precedes the next one's. event:processed goes last.
        for proposal in &created {
            self.bus.publish(BusMessage::CausalityDetected {
                cause_id: proposal.from.clone(),
                effect_id: proposal.to.clone(),
                confidence: proposal.confidence,
                kind: proposal.kind,
            });
        }
        if score > self.config.anomaly_threshold {
            self.bus.publish(BusMessage::AnomalyDetected {
                node: node_snapshot.clone(),
                score,
                classification: anomaly::classify(&record, score),
            });
        }
        for pattern in pattern_matches {
            self.bus.publish(BusMessage::PatternMatched {
                node: node_snapshot.clone(),
                pattern,
            });
        }
        self.bus.publish(BusMessage::EventProcessed {
            node: node_snapshot.clone(),
        });

        drop(state);

        if persist {
            if let Some(store) = &self.store {
                if let Err(e) = store.persist_node(&node_snapshot).await {
                    tracing::warn!(event_id = %event_id, "persist_node failed: {}", e);
                }
                for proposal in &created {
                    let meta = crate::event::EdgeMeta {
                        confidence: proposal.confidence,
                        kind: proposal.kind,
                        target_timestamp: timestamp,
                    };
                    if let Err(e) = store
                        .persist_edge(PersistedEdge::new(&proposal.from, &proposal.to, meta))
                        .await
                    {
                        tracing::warn!(event_id = %event_id, "persist_edge failed: {}", e);
                    }
                }
            }
        }

        Ok(node_snapshot)
    }

    fn evict_locked(&self, state: &mut EngineState, cutoff_ts: i64) {
        let evicted = state.graph.evict_before(cutoff_ts);
        if evicted.is_empty() {
            return;
        }

        for record in &evicted {
            state.temporal.remove(record.timestamp, &record.event_id);
            state
                .services
                .remove(&record.service_id, &record.event_type, &record.event_id);
            if let (Some(trace_id), Some(span_id)) = (&record.trace_id, &record.span_id) {
                let key = (trace_id.clone(), span_id.clone());
                if let Some(ids) = state.spans.get_mut(&key) {
                    ids.retain(|id| id != &record.event_id);
                    if ids.is_empty() {
                        state.spans.remove(&key);
                    }
                }
            }
            if let Some(count) = state.tenant_counts.get_mut(&record.tenant_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.tenant_counts.remove(&record.tenant_id);
                }
            }
        }

        state.evicted_nodes += evicted.len() as u64;
        tracing::debug!(
            evicted = evicted.len(),
            cutoff_ts,
            "retention eviction completed"
        );
    }

    /// Force an eviction pass with the configured retention window.
    pub async fn evict_expired(&self) -> u64 {
        let mut state = self.state.write().await;
        if state.graph.is_empty() {
            return 0;
        }
        let before = state.evicted_nodes;
        let cutoff = state.newest_ts - self.config.retention_window_ms;
        self.evict_locked(&mut state, cutoff);
        state.evicted_nodes - before
    }

    pub async fn get_event(&self, event_id: &str) -> Option<EventNode> {
        let state = self.state.read().await;
        state.graph.get(event_id).cloned()
    }

    pub async fn stats(&self) -> EngineStats {
        let state = self.state.read().await;
        EngineStats {
            graph: state.graph.counts(),
            patterns: state.patterns.len(),
            active_chains: state.chains.len(),
            evicted_nodes: state.evicted_nodes,
            newest_timestamp: state.newest_ts,
            tenants: state.tenant_counts.clone(),
        }
    }

    /// Traverse the causal chain from `root` with the configured bounds.
    pub async fn trace_chain(
        &self,
        root: &str,
        direction: Direction,
    ) -> Result<CausalChain, EngineError> {
        let state = self.state.read().await;
        chain::trace(
            &state.graph,
            root,
            direction,
            self.config.max_chain_depth,
            self.config.confidence_threshold,
            None,
        )
    }

    /// Ranked root-cause search over the backward chain from `event_id`.
    pub async fn find_root(&self, event_id: &str) -> Result<RootCause, EngineError> {
        let state = self.state.read().await;
        chain::find_root(
            &state.graph,
            event_id,
            self.config.max_chain_depth,
            self.config.confidence_threshold,
        )
    }

    /// Likely next events after `event_id` within the horizon.
    pub async fn predict(
        &self,
        event_id: &str,
        horizon_ms: i64,
        min_confidence: f64,
    ) -> Result<Vec<Prediction>, EngineError> {
        let state = self.state.read().await;
        predict::predict(
            &state.graph,
            &state.patterns,
            event_id,
            horizon_ms,
            min_confidence,
            None,
        )
    }

    /// Rebuild in-memory state from the durable store through the normal
    /// ingest path. Returns how many events were replayed.
    pub async fn replay_from_store(&self, since_ts: i64) -> Result<usize, EngineError> {
        let Some(store) = self.store.clone() else {
            return Ok(0);
        };

        let mut stream = store.replay(since_ts).await.map_err(|e| {
            EngineError::Internal(format!("replay stream unavailable: {e}"))
        })?;

        let mut replayed = 0usize;
        while let Some(record) = stream.next().await {
            let event_id = record.event_id.clone();
            match self.ingest_inner(record, false).await {
                Ok(_) => replayed += 1,
                Err(e) => tracing::warn!(event_id = %event_id, "replay skipped event: {}", e),
            }
        }

        tracing::info!(replayed, since_ts, "replay complete");
        Ok(replayed)
    }

    pub(crate) async fn read_state(&self) -> RwLockReadGuard<'_, EngineState> {
        self.state.read().await
    }
}
