use super::ast::{CompareOp, CondValue, Condition, Statement, TimeExpr};
use super::cache::ResultCache;
use super::parser::{self, DEFAULT_PATTERN_WINDOW_MS};
use crate::chain::{self, CausalChain};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::engine::{CausalityEngine, EngineState};
use crate::error::EngineError;
use crate::event::{canonical, EventRecord};
use crate::predict::{self, Prediction};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// PREDICT filters candidates below this confidence.
const PREDICT_MIN_CONFIDENCE: f64 = 0.3;

/// PREDICT returns at most this many candidates.
const PREDICT_TOP_N: usize = 10;

/// Health ladder bounds.
const HEALTHY_ACTIVE_BOUND: usize = 100;
const DEGRADED_ERROR_BOUND: usize = 5;
const DEGRADED_ACTIVE_BOUND: usize = 200;

// ---------------------------------------------------------------------------
// Cancellation and deadlines
// ---------------------------------------------------------------------------

/// Cooperative cancellation signal for a running query.
#[derive(Debug, Clone, Default)]
pub struct QueryHandle {
    cancelled: Arc<AtomicBool>,
}

impl QueryHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Per-call knobs.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Deadline override; the engine default applies when absent.
    pub timeout: Option<Duration>,
    /// Cancellation handle the caller keeps.
    pub handle: Option<QueryHandle>,
}

/// Checked at every index-scan iteration and pattern-match boundary.
struct QueryCtx {
    handle: Option<QueryHandle>,
    deadline: Instant,
}

impl QueryCtx {
    fn check(&self) -> Result<(), EngineError> {
        if self.handle.as_ref().is_some_and(QueryHandle::is_cancelled) {
            return Err(EngineError::Cancelled);
        }
        if Instant::now() > self.deadline {
            return Err(EngineError::Timeout);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Result shapes
// ---------------------------------------------------------------------------

/// Envelope common to every statement kind.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    #[serde(rename = "type")]
    pub kind: String,
    pub tenant_id: String,
    pub executed_at_ms: i64,
    pub elapsed_ms: f64,
    #[serde(flatten)]
    pub payload: QueryPayload,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum QueryPayload {
    State(SystemState),
    Traverse(TraverseResult),
    Matches(MatchResult),
    Timeline(TimelineResult),
    Compare(CompareResult),
    Predict(PredictResult),
}

/// Compact event projection used in query results.
#[derive(Debug, Clone, Serialize)]
pub struct EventSummary {
    pub event_id: String,
    pub timestamp: i64,
    pub service_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, Value>,
}

impl EventSummary {
    fn from_record(record: &EventRecord) -> Self {
        Self {
            event_id: record.event_id.clone(),
            timestamp: record.timestamp,
            service_id: record.service_id.clone(),
            service_name: record.service_name.clone(),
            event_type: record.event_type.clone(),
            trace_id: record.trace_id.clone(),
            span_id: record.span_id.clone(),
            data: record.data.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemState {
    pub at_ms: i64,
    pub services: BTreeMap<String, ServiceState>,
    pub errors: Vec<ErrorEntry>,
    pub active_requests: Vec<ActiveRequest>,
    pub metrics: BTreeMap<String, Value>,
    pub summary: StateSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceState {
    pub service_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    pub event_count: usize,
    pub error_count: usize,
    pub first_ts: i64,
    pub last_ts: i64,
    /// Ids of this service's events at or before the query time, ascending.
    pub event_ids: Vec<String>,
    pub last_event: EventSummary,
    /// `"ok"` or `"error"`; the unit of COMPARE's status diff.
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub event_id: String,
    pub service_id: String,
    pub timestamp: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveRequest {
    pub event_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    pub service_id: String,
    pub event_type: String,
    pub started_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSummary {
    pub health: String,
    pub error_count: usize,
    pub active_request_count: usize,
    pub service_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraverseResult {
    pub chain: CausalChain,
    /// Whether an UNTIL condition cut the walk short.
    pub until_hit: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub count: usize,
    pub window_ms: i64,
    pub within_ms: i64,
    pub matches: Vec<PatternMatch>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PatternMatch {
    pub events: Vec<EventSummary>,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimelineResult {
    pub start_ms: i64,
    pub end_ms: i64,
    pub count: usize,
    pub events: Vec<TimelineEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    #[serde(flatten)]
    pub event: EventSummary,
    pub relative_time: i64,
    pub time_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompareResult {
    pub first_ms: i64,
    pub second_ms: i64,
    pub services_added: Vec<String>,
    pub services_removed: Vec<String>,
    pub services_changed: Vec<ServiceStatusChange>,
    pub metrics: Vec<MetricDelta>,
    pub errors_added: Vec<String>,
    pub errors_resolved: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatusChange {
    pub service_id: String,
    pub before: String,
    pub after: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricDelta {
    pub metric: String,
    pub before: Option<f64>,
    pub after: Option<f64>,
    pub change: Option<f64>,
    pub change_percent: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor: Option<EventSummary>,
    pub horizon_ms: i64,
    pub predictions: Vec<AnnotatedPrediction>,
    /// Mean confidence of the emitted predictions.
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnnotatedPrediction {
    #[serde(flatten)]
    pub prediction: Prediction,
    pub predicted_time: String,
    pub time_from_now: i64,
    pub likelihood: String,
}

// ---------------------------------------------------------------------------
// Query engine
// ---------------------------------------------------------------------------

/// Executes TimeQL against a causality engine. Read-only: queries share the
/// engine's read lock and never mutate graph state.
pub struct TemporalQueryEngine {
    engine: Arc<CausalityEngine>,
    cache: ResultCache,
    default_timeout: Duration,
}

impl TemporalQueryEngine {
    pub fn new(engine: Arc<CausalityEngine>) -> Self {
        let config = engine.config();
        Self {
            cache: ResultCache::new(config.query_cache_cap, config.query_cache_ttl_ms),
            default_timeout: Duration::from_millis(config.query_default_timeout_ms),
            engine,
        }
    }

    pub async fn query(&self, tenant_id: &str, text: &str) -> Result<QueryResult, EngineError> {
        self.query_with(tenant_id, text, QueryOptions::default())
            .await
    }

    pub async fn query_with(
        &self,
        tenant_id: &str,
        text: &str,
        options: QueryOptions,
    ) -> Result<QueryResult, EngineError> {
        let started = Instant::now();
        let statement = parser::parse(text)?;
        let statement_json = serde_json::to_string(&statement)
            .map_err(|e| EngineError::Internal(format!("statement serialization: {e}")))?;
        let key = ResultCache::key(&statement_json, tenant_id);
        let now_ms = self.engine.clock().now_ms();

        let payload = match self.cache.get(&key, now_ms) {
            Some(hit) => {
                tracing::debug!(tenant_id, kind = statement.kind(), "query cache hit");
                hit
            }
            None => {
                let ctx = QueryCtx {
                    handle: options.handle.clone(),
                    deadline: started + options.timeout.unwrap_or(self.default_timeout),
                };
                let state = self.engine.read_state().await;
                let payload = execute(
                    &state,
                    self.engine.config(),
                    self.engine.clock().as_ref(),
                    tenant_id,
                    &statement,
                    &ctx,
                )?;
                drop(state);
                self.cache.put(key, payload.clone(), now_ms);
                payload
            }
        };

        Ok(QueryResult {
            kind: statement.kind().to_string(),
            tenant_id: tenant_id.to_string(),
            executed_at_ms: now_ms,
            elapsed_ms: started.elapsed().as_secs_f64() * 1_000.0,
            payload,
        })
    }
}

fn execute(
    state: &EngineState,
    config: &EngineConfig,
    clock: &dyn Clock,
    tenant_id: &str,
    statement: &Statement,
    ctx: &QueryCtx,
) -> Result<QueryPayload, EngineError> {
    let now_ms = clock.now_ms();
    match statement {
        Statement::StateAt { at, filter } => {
            let at_ms = at.resolve(now_ms);
            let mut system = build_state(state, tenant_id, at_ms, ctx)?;
            if !filter.is_empty() {
                apply_state_filter(state, &mut system, filter)?;
            }
            Ok(QueryPayload::State(system))
        }
        Statement::Traverse {
            event_id,
            direction,
            until,
        } => {
            let mut chain = chain::trace(
                &state.graph,
                event_id,
                *direction,
                config.max_chain_depth,
                config.confidence_threshold,
                Some(tenant_id),
            )?;

            let mut until_hit = false;
            if !until.is_empty() {
                let mut cut = None;
                for (i, event) in chain.events.iter().enumerate() {
                    ctx.check()?;
                    let Some(node) = state.graph.get(&event.event_id) else {
                        continue;
                    };
                    if event_matches(&node.event, until)? {
                        cut = Some(i);
                        break;
                    }
                }
                if let Some(i) = cut {
                    until_hit = true;
                    chain.events.truncate(i + 1);
                    let kept: HashSet<&str> =
                        chain.events.iter().map(|e| e.event_id.as_str()).collect();
                    chain
                        .edges
                        .retain(|e| kept.contains(e.from.as_str()) && kept.contains(e.to.as_str()));
                    chain.start_time = chain.events.first().map_or(0, |e| e.timestamp);
                    chain.end_time = chain.events.last().map_or(0, |e| e.timestamp);
                }
            }

            Ok(QueryPayload::Traverse(TraverseResult { chain, until_hit }))
        }
        Statement::MatchPattern {
            first,
            followed_by,
            within_ms,
            in_last_ms,
        } => {
            let window_ms = (*in_last_ms).unwrap_or(DEFAULT_PATTERN_WINDOW_MS);
            exec_match_pattern(
                state,
                tenant_id,
                first,
                followed_by.as_deref(),
                *within_ms,
                window_ms,
                ctx,
            )
        }
        Statement::Timeline { start, end, filter } => {
            let start_ms = start.resolve(now_ms);
            let end_ms = end.resolve(now_ms);
            exec_timeline(state, tenant_id, start_ms, end_ms, filter, ctx)
        }
        Statement::Compare {
            left,
            right,
            metrics,
        } => {
            let first_ms = left.resolve(now_ms);
            let second_ms = right.resolve(now_ms);
            let before = build_state(state, tenant_id, first_ms, ctx)?;
            let after = build_state(state, tenant_id, second_ms, ctx)?;
            Ok(QueryPayload::Compare(diff_states(
                first_ms, second_ms, &before, &after, metrics,
            )))
        }
        Statement::Predict { horizon_ms, from } => {
            let at_ms = (*from).unwrap_or(TimeExpr::Now).resolve(now_ms);
            exec_predict(state, tenant_id, at_ms, *horizon_ms, ctx)
        }
    }
}

// ---------------------------------------------------------------------------
// STATE AT
// ---------------------------------------------------------------------------

struct ServiceAccum {
    service_name: Option<String>,
    event_count: usize,
    error_count: usize,
    first_ts: i64,
    last_ts: i64,
    event_ids: Vec<String>,
    last_record: EventRecord,
}

fn build_state(
    state: &EngineState,
    tenant_id: &str,
    at_ms: i64,
    ctx: &QueryCtx,
) -> Result<SystemState, EngineError> {
    let mut services: BTreeMap<String, ServiceAccum> = BTreeMap::new();
    let mut errors = Vec::new();
    let mut opened: Vec<EventRecord> = Vec::new();
    let mut closed_spans: HashSet<String> = HashSet::new();
    let mut metrics: BTreeMap<String, Value> = BTreeMap::new();

    for event_id in state.temporal.up_to(at_ms) {
        ctx.check()?;
        let Some(node) = state.graph.get(event_id) else {
            continue;
        };
        let record = &node.event;
        if record.tenant_id != tenant_id {
            continue;
        }

        let accum = services
            .entry(record.service_id.clone())
            .or_insert_with(|| ServiceAccum {
                service_name: record.service_name.clone(),
                event_count: 0,
                error_count: 0,
                first_ts: record.timestamp,
                last_ts: record.timestamp,
                event_ids: Vec::new(),
                last_record: record.clone(),
            });
        accum.event_count += 1;
        accum.last_ts = record.timestamp;
        accum.event_ids.push(record.event_id.clone());
        accum.last_record = record.clone();
        if accum.service_name.is_none() {
            accum.service_name = record.service_name.clone();
        }

        if record.is_error() {
            accum.error_count += 1;
            errors.push(ErrorEntry {
                event_id: record.event_id.clone(),
                service_id: record.service_id.clone(),
                timestamp: record.timestamp,
                message: error_message(record),
            });
        }

        match record.event_type.as_str() {
            "span:start" | "http:request" => opened.push(record.clone()),
            "span:end" | "http:response" => {
                if let Some(span_id) = &record.span_id {
                    closed_spans.insert(span_id.clone());
                }
            }
            "system:metrics" => {
                // Scan order is timestamp-ascending, so plain inserts give
                // last-write-wins.
                for (key, value) in &record.data {
                    metrics.insert(key.clone(), value.clone());
                }
            }
            _ => {}
        }
    }

    let active_requests: Vec<ActiveRequest> = opened
        .iter()
        .filter(|record| {
            record
                .span_id
                .as_ref()
                .map_or(true, |span| !closed_spans.contains(span))
        })
        .map(|record| ActiveRequest {
            event_id: record.event_id.clone(),
            span_id: record.span_id.clone(),
            service_id: record.service_id.clone(),
            event_type: record.event_type.clone(),
            started_at: record.timestamp,
        })
        .collect();

    let services: BTreeMap<String, ServiceState> = services
        .into_iter()
        .map(|(service_id, accum)| {
            let status = if accum.error_count > 0 { "error" } else { "ok" };
            (
                service_id.clone(),
                ServiceState {
                    service_id,
                    service_name: accum.service_name,
                    event_count: accum.event_count,
                    error_count: accum.error_count,
                    first_ts: accum.first_ts,
                    last_ts: accum.last_ts,
                    event_ids: accum.event_ids,
                    last_event: EventSummary::from_record(&accum.last_record),
                    status: status.to_string(),
                },
            )
        })
        .collect();

    let summary = StateSummary {
        health: health_of(errors.len(), active_requests.len()).to_string(),
        error_count: errors.len(),
        active_request_count: active_requests.len(),
        service_count: services.len(),
    };

    Ok(SystemState {
        at_ms,
        services,
        errors,
        active_requests,
        metrics,
        summary,
    })
}

fn health_of(error_count: usize, active_requests: usize) -> &'static str {
    if error_count == 0 && active_requests < HEALTHY_ACTIVE_BOUND {
        "healthy"
    } else if error_count < DEGRADED_ERROR_BOUND && active_requests < DEGRADED_ACTIVE_BOUND {
        "degraded"
    } else {
        "critical"
    }
}

fn error_message(record: &EventRecord) -> String {
    if let Some(message) = record.data.get("message").and_then(Value::as_str) {
        return message.to_string();
    }
    if let Some(error) = record.data.get("error") {
        return error
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| canonical(error));
    }
    record.event_type.clone()
}

/// WHERE on STATE AT narrows the service map, and only the service map.
/// Conditions are evaluated against each service's last event.
fn apply_state_filter(
    state: &EngineState,
    system: &mut SystemState,
    filter: &[Condition],
) -> Result<(), EngineError> {
    let mut keep: BTreeMap<String, ServiceState> = BTreeMap::new();
    for (service_id, service) in std::mem::take(&mut system.services) {
        let matched = match state.graph.get(&service.last_event.event_id) {
            Some(node) => event_matches(&node.event, filter)?,
            None => false,
        };
        if matched {
            keep.insert(service_id, service);
        }
    }
    system.services = keep;
    system.summary.service_count = system.services.len();
    Ok(())
}

// ---------------------------------------------------------------------------
// MATCH PATTERN
// ---------------------------------------------------------------------------

fn exec_match_pattern(
    state: &EngineState,
    tenant_id: &str,
    first: &[Condition],
    followed_by: Option<&[Condition]>,
    within_ms: i64,
    window_ms: i64,
    ctx: &QueryCtx,
) -> Result<QueryPayload, EngineError> {
    let mut matches = Vec::new();

    if !state.graph.is_empty() {
        let anchor = state.newest_ts;
        let lo = anchor.saturating_sub(window_ms);

        let mut candidates: Vec<&EventRecord> = Vec::new();
        for event_id in state.temporal.range(lo, anchor) {
            ctx.check()?;
            if let Some(node) = state.graph.get(event_id) {
                if node.event.tenant_id == tenant_id {
                    candidates.push(&node.event);
                }
            }
        }

        for (i, a) in candidates.iter().enumerate() {
            ctx.check()?;
            if !event_matches(a, first)? {
                continue;
            }

            match followed_by {
                None => matches.push(PatternMatch {
                    events: vec![EventSummary::from_record(a)],
                    duration_ms: 0,
                }),
                Some(second) => {
                    for b in &candidates[i + 1..] {
                        ctx.check()?;
                        if b.timestamp <= a.timestamp {
                            continue;
                        }
                        if b.timestamp > a.timestamp + within_ms {
                            break;
                        }
                        if event_matches(b, second)? {
                            matches.push(PatternMatch {
                                events: vec![
                                    EventSummary::from_record(a),
                                    EventSummary::from_record(b),
                                ],
                                duration_ms: b.timestamp - a.timestamp,
                            });
                            break;
                        }
                    }
                }
            }
        }
    }

    Ok(QueryPayload::Matches(MatchResult {
        count: matches.len(),
        window_ms,
        within_ms,
        matches,
    }))
}

// ---------------------------------------------------------------------------
// TIMELINE
// ---------------------------------------------------------------------------

fn exec_timeline(
    state: &EngineState,
    tenant_id: &str,
    start_ms: i64,
    end_ms: i64,
    filter: &[Condition],
    ctx: &QueryCtx,
) -> Result<QueryPayload, EngineError> {
    let span = end_ms - start_ms;
    let mut events = Vec::new();

    for event_id in state.temporal.range(start_ms, end_ms) {
        ctx.check()?;
        let Some(node) = state.graph.get(event_id) else {
            continue;
        };
        let record = &node.event;
        if record.tenant_id != tenant_id || !event_matches(record, filter)? {
            continue;
        }

        let relative_time = record.timestamp - start_ms;
        let time_percent = if span > 0 {
            relative_time as f64 / span as f64 * 100.0
        } else {
            0.0
        };
        events.push(TimelineEntry {
            event: EventSummary::from_record(record),
            relative_time,
            time_percent,
        });
    }

    Ok(QueryPayload::Timeline(TimelineResult {
        start_ms,
        end_ms,
        count: events.len(),
        events,
    }))
}

// ---------------------------------------------------------------------------
// COMPARE
// ---------------------------------------------------------------------------

fn diff_states(
    first_ms: i64,
    second_ms: i64,
    before: &SystemState,
    after: &SystemState,
    requested_metrics: &[String],
) -> CompareResult {
    let services_added: Vec<String> = after
        .services
        .keys()
        .filter(|id| !before.services.contains_key(*id))
        .cloned()
        .collect();
    let services_removed: Vec<String> = before
        .services
        .keys()
        .filter(|id| !after.services.contains_key(*id))
        .cloned()
        .collect();
    let services_changed: Vec<ServiceStatusChange> = before
        .services
        .iter()
        .filter_map(|(id, b)| {
            after.services.get(id).and_then(|a| {
                (a.status != b.status).then(|| ServiceStatusChange {
                    service_id: id.clone(),
                    before: b.status.clone(),
                    after: a.status.clone(),
                })
            })
        })
        .collect();

    let metric_paths: Vec<String> = if requested_metrics.is_empty() {
        before
            .metrics
            .keys()
            .chain(after.metrics.keys())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    } else {
        requested_metrics.to_vec()
    };

    let metrics = metric_paths
        .into_iter()
        .map(|path| {
            let b = metric_value(&before.metrics, &path);
            let a = metric_value(&after.metrics, &path);
            let change = match (b, a) {
                (Some(b), Some(a)) => Some(a - b),
                _ => None,
            };
            let change_percent = match (b, change) {
                (Some(b), Some(c)) if b != 0.0 => Some(c / b * 100.0),
                _ => None,
            };
            MetricDelta {
                metric: path,
                before: b,
                after: a,
                change,
                change_percent,
            }
        })
        .collect();

    let before_errors: BTreeSet<&str> = before.errors.iter().map(|e| e.message.as_str()).collect();
    let after_errors: BTreeSet<&str> = after.errors.iter().map(|e| e.message.as_str()).collect();

    CompareResult {
        first_ms,
        second_ms,
        services_added,
        services_removed,
        services_changed,
        metrics,
        errors_added: after_errors
            .difference(&before_errors)
            .map(|m| m.to_string())
            .collect(),
        errors_resolved: before_errors
            .difference(&after_errors)
            .map(|m| m.to_string())
            .collect(),
    }
}

fn metric_value(metrics: &BTreeMap<String, Value>, path: &str) -> Option<f64> {
    let mut parts = path.split('.');
    let mut current = metrics.get(parts.next()?)?;
    for part in parts {
        current = current.get(part)?;
    }
    value_number(current)
}

// ---------------------------------------------------------------------------
// PREDICT
// ---------------------------------------------------------------------------

fn exec_predict(
    state: &EngineState,
    tenant_id: &str,
    at_ms: i64,
    horizon_ms: i64,
    ctx: &QueryCtx,
) -> Result<QueryPayload, EngineError> {
    // The anchor is the most recent event at or before the FROM time.
    let mut anchor: Option<&EventRecord> = None;
    for event_id in state.temporal.up_to(at_ms) {
        ctx.check()?;
        if let Some(node) = state.graph.get(event_id) {
            if node.event.tenant_id == tenant_id {
                anchor = Some(&node.event);
            }
        }
    }

    let Some(anchor) = anchor else {
        return Ok(QueryPayload::Predict(PredictResult {
            anchor: None,
            horizon_ms,
            predictions: Vec::new(),
            confidence: 0.0,
        }));
    };

    let predictions = predict::predict(
        &state.graph,
        &state.patterns,
        &anchor.event_id,
        horizon_ms,
        PREDICT_MIN_CONFIDENCE,
        Some(tenant_id),
    )?;

    let annotated: Vec<AnnotatedPrediction> = predictions
        .into_iter()
        .take(PREDICT_TOP_N)
        .map(|prediction| AnnotatedPrediction {
            predicted_time: iso_time(prediction.timestamp),
            time_from_now: prediction.timestamp - at_ms,
            likelihood: likelihood_of(prediction.confidence).to_string(),
            prediction,
        })
        .collect();

    let confidence = if annotated.is_empty() {
        0.0
    } else {
        annotated.iter().map(|p| p.prediction.confidence).sum::<f64>() / annotated.len() as f64
    };

    Ok(QueryPayload::Predict(PredictResult {
        anchor: Some(EventSummary::from_record(anchor)),
        horizon_ms,
        predictions: annotated,
        confidence,
    }))
}

fn likelihood_of(confidence: f64) -> &'static str {
    if confidence > 0.8 {
        "very likely"
    } else if confidence > 0.6 {
        "likely"
    } else if confidence > 0.4 {
        "possible"
    } else if confidence > 0.2 {
        "unlikely"
    } else {
        "very unlikely"
    }
}

fn iso_time(timestamp_ms: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(timestamp_ms)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_else(|| timestamp_ms.to_string())
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

fn event_matches(record: &EventRecord, conditions: &[Condition]) -> Result<bool, EngineError> {
    for condition in conditions {
        let Some(actual) = resolve_field(record, &condition.field)? else {
            return Ok(false);
        };
        if !compare(&actual, condition.op, &condition.value) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Resolve a dotted field path on an event. Unknown head segments are an
/// error; a known map path that is simply absent resolves to `None`.
fn resolve_field(record: &EventRecord, field: &str) -> Result<Option<Value>, EngineError> {
    let (head, rest) = match field.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (field, None),
    };

    let scalar = |v: Value| Ok(Some(v));
    let optional = |v: &Option<String>| Ok(v.clone().map(Value::String));

    match head {
        "event_id" | "eventId" | "id" => scalar(Value::String(record.event_id.clone())),
        "event_type" | "eventType" | "type" => scalar(Value::String(record.event_type.clone())),
        "service_id" | "serviceId" | "service" => {
            scalar(Value::String(record.service_id.clone()))
        }
        "service_name" | "serviceName" => optional(&record.service_name),
        "trace_id" | "traceId" => optional(&record.trace_id),
        "span_id" | "spanId" => optional(&record.span_id),
        "parent_span_id" | "parentSpanId" => optional(&record.parent_span_id),
        "timestamp" | "ts" => scalar(Value::from(record.timestamp)),
        "tenant_id" | "tenantId" => scalar(Value::String(record.tenant_id.clone())),
        "data" => Ok(rest.and_then(|path| lookup_path(&record.data, path))),
        "metadata" => Ok(rest.and_then(|path| lookup_path(&record.metadata, path))),
        _ => Err(EngineError::UnknownField(field.to_string())),
    }
}

fn lookup_path(map: &HashMap<String, Value>, path: &str) -> Option<Value> {
    let mut parts = path.split('.');
    let mut current = map.get(parts.next()?)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current.clone())
}

fn compare(actual: &Value, op: CompareOp, expected: &CondValue) -> bool {
    match op {
        CompareOp::Eq => values_equal(actual, expected),
        CompareOp::Ne => !values_equal(actual, expected),
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            let (Some(a), Some(b)) = (value_number(actual), expected.as_number()) else {
                return false;
            };
            match op {
                CompareOp::Lt => a < b,
                CompareOp::Le => a <= b,
                CompareOp::Gt => a > b,
                CompareOp::Ge => a >= b,
                _ => unreachable!(),
            }
        }
    }
}

fn values_equal(actual: &Value, expected: &CondValue) -> bool {
    match expected {
        CondValue::Str(s) => match actual.as_str() {
            Some(a) => a == s,
            // Comparisons against non-string values go through the
            // canonical serialization, not host equality.
            None => canonical(actual) == *s,
        },
        _ => match (value_number(actual), expected.as_number()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

fn value_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}
