use super::store_trait::{CausalityStore, PersistedEdge};
use crate::event::{EventNode, EventRecord};
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// In-memory durable store, used by tests and as the reference
/// implementation of the replay ordering contract.
#[derive(Default)]
pub struct MemoryStore {
    // Keyed by (timestamp, event_id) so replay order falls out of the map.
    events: Mutex<BTreeMap<(i64, String), EventRecord>>,
    edges: Mutex<Vec<PersistedEdge>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().expect("store poisoned").len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.lock().expect("store poisoned").len()
    }
}

#[async_trait]
impl CausalityStore for MemoryStore {
    async fn persist_node(&self, node: &EventNode) -> Result<()> {
        let record = node.event.clone();
        self.events
            .lock()
            .expect("store poisoned")
            .insert((record.timestamp, record.event_id.clone()), record);
        Ok(())
    }

    async fn persist_edge(&self, edge: PersistedEdge) -> Result<()> {
        self.edges.lock().expect("store poisoned").push(edge);
        Ok(())
    }

    async fn replay(&self, since_ts: i64) -> Result<BoxStream<'static, EventRecord>> {
        let events: Vec<EventRecord> = self
            .events
            .lock()
            .expect("store poisoned")
            .range((since_ts, String::new())..)
            .map(|(_, record)| record.clone())
            .collect();

        Ok(stream::iter(events).boxed())
    }
}
