use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Metadata key producers use to assert an explicit trigger relationship.
pub const TRIGGERED_BY_KEY: &str = "triggered_by";

/// One immutable observation from a producer service.
///
/// `data` and `metadata` are open maps of JSON scalars; all equality checks
/// against their values go through [`canonical`] so two producers that
/// serialize the same value differently still compare equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    /// Milliseconds since the Unix epoch, supplied by the producer. The
    /// engine never rewrites it.
    pub timestamp: i64,
    pub service_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub event_type: String,
    #[serde(default)]
    pub data: HashMap<String, Value>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
}

fn default_tenant() -> String {
    "default".to_string()
}

impl EventRecord {
    /// Check the required fields. Producers are free to omit everything
    /// optional; `tenant_id` falls back to `"default"` at deserialization.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.event_id.is_empty() {
            return Err(EngineError::InvalidEvent("missing event_id".into()));
        }
        if self.service_id.is_empty() {
            return Err(EngineError::InvalidEvent("missing service_id".into()));
        }
        if self.event_type.is_empty() {
            return Err(EngineError::InvalidEvent("missing event_type".into()));
        }
        if self.timestamp < 0 {
            return Err(EngineError::InvalidEvent(format!(
                "timestamp must not be negative, got {}",
                self.timestamp
            )));
        }
        Ok(())
    }

    /// The event id named by `metadata.triggered_by`, if any.
    pub fn triggered_by(&self) -> Option<&str> {
        self.metadata.get(TRIGGERED_BY_KEY).and_then(Value::as_str)
    }

    pub fn is_error(&self) -> bool {
        self.event_type == "error" || self.data.contains_key("error")
    }
}

/// Kind of causal relationship an edge asserts, ordered by how much we trust
/// the detector that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Trace,
    Service,
    DataFlow,
    Temporal,
}

impl EdgeKind {
    /// trace > service > dataflow > temporal
    pub fn precedence(self) -> u8 {
        match self {
            EdgeKind::Trace => 3,
            EdgeKind::Service => 2,
            EdgeKind::DataFlow => 1,
            EdgeKind::Temporal => 0,
        }
    }
}

/// Edge payload, stored identically on both endpoints of the relation:
/// in `causes` of the cause and `caused_by` of the effect.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EdgeMeta {
    pub confidence: f64,
    pub kind: EdgeKind,
    /// Timestamp of the effect node.
    pub target_timestamp: i64,
}

/// A node in the event graph: the ingested event plus confidence-weighted
/// adjacency. Adjacency is keyed by peer event id so a re-detected edge
/// upgrades in place instead of duplicating.
#[derive(Debug, Clone, Serialize)]
pub struct EventNode {
    pub event: EventRecord,
    /// Outgoing edges: this event plausibly led to the keyed events.
    pub causes: HashMap<String, EdgeMeta>,
    /// Incoming edges, mirror-consistent with the peers' `causes`.
    pub caused_by: HashMap<String, EdgeMeta>,
    /// How unusual this event is, in `[0, 1]`.
    pub anomaly_score: f64,
    /// Creation confidence; 1.0 for directly ingested events.
    pub confidence: f64,
}

impl EventNode {
    pub fn new(event: EventRecord) -> Self {
        Self {
            event,
            causes: HashMap::new(),
            caused_by: HashMap::new(),
            anomaly_score: 0.0,
            confidence: 1.0,
        }
    }

    pub fn event_id(&self) -> &str {
        &self.event.event_id
    }

    pub fn timestamp(&self) -> i64 {
        self.event.timestamp
    }
}

/// Canonical serialization of a JSON value, used for all data comparisons.
///
/// `serde_json` maps are ordered by key, so object serialization is stable
/// regardless of producer insertion order.
pub fn canonical(value: &Value) -> String {
    value.to_string()
}

/// Key-overlap similarity between two data bags: the share of keys whose
/// canonical values agree, over the larger bag.
pub fn data_similarity(a: &HashMap<String, Value>, b: &HashMap<String, Value>) -> f64 {
    let denom = a.len().max(b.len());
    if denom == 0 {
        return 0.0;
    }

    let matching = a
        .iter()
        .filter(|(key, value)| {
            b.get(*key)
                .is_some_and(|other| canonical(other) == canonical(value))
        })
        .count();

    matching as f64 / denom as f64
}
