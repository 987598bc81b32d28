use crate::chain::CausalChain;
use crate::event::EdgeKind;
use lru::LruCache;
use serde::Serialize;
use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use uuid::Uuid;

/// Two signatures with the same event-type sequence are considered the same
/// pattern when their durations differ by less than this.
const DURATION_TOLERANCE_MS: i64 = 1_000;

/// The shape of a recurring chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatternSignature {
    /// Event types in timestamp order.
    pub event_types: Vec<String>,
    pub services: BTreeSet<String>,
    pub duration_ms: i64,
    pub edge_types: BTreeSet<EdgeKind>,
}

impl PatternSignature {
    pub fn from_chain(chain: &CausalChain) -> Self {
        Self {
            event_types: chain.events.iter().map(|e| e.event_type.clone()).collect(),
            services: chain
                .events
                .iter()
                .map(|e| e.service_id.clone())
                .collect(),
            duration_ms: chain.end_time - chain.start_time,
            edge_types: chain.edges.iter().map(|e| e.kind).collect(),
        }
    }

    fn similar_to(&self, other: &Self) -> bool {
        self.event_types == other.event_types
            && (self.duration_ms - other.duration_ms).abs() < DURATION_TOLERANCE_MS
    }

    /// Content-derived id: stable for identical signatures.
    fn derive_id(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        Uuid::new_v5(&Uuid::NAMESPACE_OID, canonical.as_bytes()).to_string()
    }
}

/// A recurring chain signature with occurrence bookkeeping. `first_seen` and
/// `last_seen` are wall-clock milliseconds; pattern aging is the one place
/// the engine consults the clock rather than event time.
#[derive(Debug, Clone, Serialize)]
pub struct Pattern {
    pub pattern_id: String,
    pub signature: PatternSignature,
    pub occurrences: u64,
    pub first_seen: i64,
    pub last_seen: i64,
}

impl Pattern {
    /// Does this event belong to the population the pattern describes?
    pub fn accepts(&self, service_id: &str, event_type: &str) -> bool {
        self.signature.services.contains(service_id)
            && self.signature.event_types.iter().any(|t| t == event_type)
    }
}

/// What happened when a chain signature was folded into the store.
#[derive(Debug, Clone)]
pub enum PatternObservation {
    /// An existing similar pattern absorbed the observation.
    Matched(Pattern),
    /// A brand-new pattern was recorded.
    Inserted(Pattern),
}

impl PatternObservation {
    pub fn pattern(&self) -> &Pattern {
        match self {
            PatternObservation::Matched(p) | PatternObservation::Inserted(p) => p,
        }
    }
}

/// Bounded store of recurring patterns, least-recently-seen out first.
pub struct PatternStore {
    patterns: LruCache<String, Pattern>,
}

impl PatternStore {
    pub fn new(cap: usize) -> Self {
        Self {
            patterns: LruCache::new(
                NonZeroUsize::new(cap.max(1)).expect("pattern cap must be > 0"),
            ),
        }
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pattern> {
        self.patterns.iter().map(|(_, p)| p)
    }

    pub fn get(&mut self, pattern_id: &str) -> Option<&Pattern> {
        self.patterns.get(pattern_id)
    }

    /// Fold one chain signature into the store.
    pub fn observe(&mut self, signature: PatternSignature, now_ms: i64) -> PatternObservation {
        let similar = self
            .patterns
            .iter()
            .find(|(_, p)| p.signature.similar_to(&signature))
            .map(|(id, _)| id.clone());

        if let Some(id) = similar {
            // get_mut promotes the entry, which is what keeps the LRU order
            // aligned with last_seen.
            let pattern = self.patterns.get_mut(&id).expect("pattern just found");
            pattern.occurrences += 1;
            pattern.last_seen = now_ms;
            return PatternObservation::Matched(pattern.clone());
        }

        let pattern = Pattern {
            pattern_id: signature.derive_id(),
            signature,
            occurrences: 1,
            first_seen: now_ms,
            last_seen: now_ms,
        };
        self.patterns.put(pattern.pattern_id.clone(), pattern.clone());
        PatternObservation::Inserted(pattern)
    }
}
