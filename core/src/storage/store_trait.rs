use crate::event::{EdgeMeta, EventNode, EventRecord};
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// An edge as handed to the durable store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEdge {
    pub cause_id: String,
    pub effect_id: String,
    pub confidence: f64,
    pub kind: crate::event::EdgeKind,
}

impl PersistedEdge {
    pub fn new(cause_id: &str, effect_id: &str, meta: EdgeMeta) -> Self {
        Self {
            cause_id: cause_id.to_string(),
            effect_id: effect_id.to_string(),
            confidence: meta.confidence,
            kind: meta.kind,
        }
    }
}

/// Durable-store contract the host may supply.
///
/// The engine treats persistence as best-effort: failures are logged and
/// never surfaced to producers. `replay` feeds the normal ingest path on
/// startup, ordered by timestamp ascending.
#[async_trait]
pub trait CausalityStore: Send + Sync {
    async fn persist_node(&self, node: &EventNode) -> Result<()>;

    async fn persist_edge(&self, edge: PersistedEdge) -> Result<()>;

    /// Stream back every persisted event with `timestamp >= since_ts`,
    /// ordered by timestamp ascending.
    async fn replay(&self, since_ts: i64) -> Result<BoxStream<'static, EventRecord>>;
}
