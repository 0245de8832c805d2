//! Decision cache
//!
//! Memoizes recent decisions keyed by (identity, action, resource, scope,
//! context fingerprint) with a short TTL, absorbing bursts of identical
//! checks (a UI listing 50 resources probes read permission on each). The
//! TTL bounds how long a policy change can stay invisible without active
//! invalidation; LRU eviction bounds memory.

use crate::engine::Decision;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Cache key over the full evaluation input
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecisionKey {
    pub identity: String,
    pub action: String,
    pub resource: String,
    pub scope: String,
    pub context_fingerprint: u64,
}

struct Entry {
    decision: Decision,
    expires_at: Instant,
}

/// Bounded TTL'd LRU cache of decisions
///
/// Staleness beyond the TTL is acceptable, corrupted reads are not: the map
/// is guarded by a single mutex, which is cheap next to an uncached
/// evaluation.
pub struct DecisionCache {
    entries: Mutex<LruCache<DecisionKey, Entry>>,
    ttl: Duration,
}

impl DecisionCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        DecisionCache {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Get a live cached decision; expired entries are removed on probe
    pub fn get(&self, key: &DecisionKey) -> Option<Decision> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.decision.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    /// Insert a decision; a full cache evicts the least recently used entry
    pub fn put(&self, key: DecisionKey, decision: Decision) {
        let entry = Entry {
            decision,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.lock().put(key, entry);
    }

    /// Drop all entries (used on policy reload)
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
