use super::exec::QueryPayload;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Bounded TTL cache of query payloads.
///
/// Keys are the canonical serialization of the parsed statement plus the
/// tenant id, so textually different but structurally identical queries
/// share an entry and tenants never share anything. Entries expire by TTL
/// only; there is no invalidation on ingest.
pub(crate) struct ResultCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    ttl_ms: i64,
}

struct CacheEntry {
    payload: QueryPayload,
    inserted_at_ms: i64,
}

impl ResultCache {
    pub(crate) fn new(cap: usize, ttl_ms: i64) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(cap.max(1)).expect("cache cap must be > 0"),
            )),
            ttl_ms,
        }
    }

    pub(crate) fn key(statement_json: &str, tenant_id: &str) -> String {
        format!("{tenant_id}\u{1}{statement_json}")
    }

    pub(crate) fn get(&self, key: &str, now_ms: i64) -> Option<QueryPayload> {
        let mut entries = self.entries.lock().expect("result cache poisoned");
        match entries.get(key) {
            Some(entry) if now_ms - entry.inserted_at_ms < self.ttl_ms => {
                Some(entry.payload.clone())
            }
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    pub(crate) fn put(&self, key: String, payload: QueryPayload, now_ms: i64) {
        self.entries.lock().expect("result cache poisoned").put(
            key,
            CacheEntry {
                payload,
                inserted_at_ms: now_ms,
            },
        );
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().expect("result cache poisoned").len()
    }
}
