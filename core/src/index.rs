use std::collections::{BTreeMap, HashMap};

/// Time-bucketed index of event ids, keyed by event timestamp (ms).
///
/// Backed by an ordered map so range scans cost O(log n + k); several events
/// may share a millisecond, so each key holds an insertion-ordered bucket.
#[derive(Debug, Default)]
pub struct TemporalIndex {
    buckets: BTreeMap<i64, Vec<String>>,
    len: usize,
}

impl TemporalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, timestamp: i64, event_id: &str) {
        self.buckets
            .entry(timestamp)
            .or_default()
            .push(event_id.to_string());
        self.len += 1;
    }

    /// All event ids with `t_lo <= timestamp <= t_hi`, in timestamp order.
    /// An inverted range is empty, not a panic.
    pub fn range(&self, t_lo: i64, t_hi: i64) -> impl Iterator<Item = &str> {
        (t_lo <= t_hi)
            .then(|| self.buckets.range(t_lo..=t_hi))
            .into_iter()
            .flatten()
            .flat_map(|(_, ids)| ids.iter().map(String::as_str))
    }

    /// Event ids at or before `t_hi`, in timestamp order.
    pub fn up_to(&self, t_hi: i64) -> impl Iterator<Item = &str> {
        self.buckets
            .range(..=t_hi)
            .flat_map(|(_, ids)| ids.iter().map(String::as_str))
    }

    pub fn remove(&mut self, timestamp: i64, event_id: &str) {
        if let Some(bucket) = self.buckets.get_mut(&timestamp) {
            if let Some(pos) = bucket.iter().position(|id| id == event_id) {
                bucket.remove(pos);
                self.len -= 1;
            }
            if bucket.is_empty() {
                self.buckets.remove(&timestamp);
            }
        }
    }

    /// Drop all buckets strictly before `t_lo`, returning the evicted ids.
    pub fn drain_before(&mut self, t_lo: i64) -> Vec<String> {
        let keep = self.buckets.split_off(&t_lo);
        let drained: Vec<String> = std::mem::replace(&mut self.buckets, keep)
            .into_values()
            .flatten()
            .collect();
        self.len -= drained.len();
        drained
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Per-service index: insertion-ordered event ids plus cached
/// last-per-(service, event type) pointers, refreshed on every ingest.
#[derive(Debug, Default)]
pub struct ServiceIndex {
    events: HashMap<String, Vec<String>>,
    last_by_type: HashMap<(String, String), String>,
}

impl ServiceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an ingested event. Returns the previous last-event pointer for
    /// the same (service, event type), which the anomaly scorer needs before
    /// it is overwritten.
    pub fn record(&mut self, service_id: &str, event_type: &str, event_id: &str) -> Option<String> {
        self.events
            .entry(service_id.to_string())
            .or_default()
            .push(event_id.to_string());

        self.last_by_type.insert(
            (service_id.to_string(), event_type.to_string()),
            event_id.to_string(),
        )
    }

    pub fn ids(&self, service_id: &str) -> &[String] {
        self.events.get(service_id).map_or(&[], Vec::as_slice)
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.events.keys().map(String::as_str)
    }

    /// Cached last event of the given type for a service.
    pub fn last_of(&self, service_id: &str, event_type: &str) -> Option<&str> {
        self.last_by_type
            .get(&(service_id.to_string(), event_type.to_string()))
            .map(String::as_str)
    }

    pub fn remove(&mut self, service_id: &str, event_type: &str, event_id: &str) {
        if let Some(ids) = self.events.get_mut(service_id) {
            if let Some(pos) = ids.iter().position(|id| id == event_id) {
                ids.remove(pos);
            }
            if ids.is_empty() {
                self.events.remove(service_id);
            }
        }

        let key = (service_id.to_string(), event_type.to_string());
        if self.last_by_type.get(&key).is_some_and(|id| id == event_id) {
            self.last_by_type.remove(&key);
        }
    }
}
