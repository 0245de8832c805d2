//! Sliding-window rate limiting
//!
//! Tracks request counts per `(identity, action_class)` over three horizons:
//! burst (1s), per-minute (60s) and per-hour (3600s). Each horizon is split
//! into fixed buckets; a check sums the trailing buckets covering the window,
//! which avoids the boundary double-counting of naive fixed windows.
//!
//! Counters live behind the [`CounterStore`] trait so a networked store with
//! atomic increment-and-expire (e.g. Redis) can stand in for the in-memory
//! implementation. A brief overshoot under concurrent races is acceptable
//! (soft limit); the fetch-and-add primitive guarantees no undercount.

use crate::config::{EngineConfig, RateLimitConfig};
use ahash::AHashMap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Rate-limiter backing-store failure
///
/// The engine decides between fail-open and fail-closed; the limiter itself
/// only reports the outage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LimiterError {
    #[error("rate-limiter store unavailable: {0}")]
    Unavailable(String),
}

/// Window horizons, from shortest to longest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Horizon {
    Burst,
    Minute,
    Hour,
}

impl Horizon {
    const ALL: [Horizon; 3] = [Horizon::Burst, Horizon::Minute, Horizon::Hour];

    /// Width of one bucket in milliseconds
    fn bucket_width_ms(&self) -> i64 {
        match self {
            Horizon::Burst => 100,
            Horizon::Minute => 1_000,
            Horizon::Hour => 60_000,
        }
    }

    /// Number of trailing buckets that make up the window
    fn bucket_count(&self) -> i64 {
        match self {
            Horizon::Burst => 10,
            Horizon::Minute => 60,
            Horizon::Hour => 60,
        }
    }

    fn window_ms(&self) -> i64 {
        self.bucket_width_ms() * self.bucket_count()
    }

    fn limit(&self, limits: &RateLimitConfig) -> u64 {
        match self {
            Horizon::Burst => limits.burst_limit as u64,
            Horizon::Minute => limits.per_minute_limit as u64,
            Horizon::Hour => limits.per_hour_limit as u64,
        }
    }
}

/// Key for one counter bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub identity: String,
    pub action_class: String,
    pub horizon: Horizon,
    pub bucket: i64,
}

/// Atomic counter boundary: increment-and-get with expiry
pub trait CounterStore: Send + Sync {
    /// Atomically add `delta` to the bucket and return the new value.
    /// The entry may be discarded once `ttl` has elapsed.
    fn fetch_add(&self, key: &CounterKey, delta: u64, ttl: Duration) -> Result<u64, LimiterError>;

    /// Current bucket value; zero for unknown buckets.
    fn get(&self, key: &CounterKey) -> Result<u64, LimiterError>;
}

/// Outcome of a rate check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateCheck {
    pub allowed: bool,
    /// How long until retrying could succeed; only set when denied
    pub retry_after: Option<Duration>,
}

impl RateCheck {
    fn allowed() -> Self {
        RateCheck {
            allowed: true,
            retry_after: None,
        }
    }
}

/// Sliding-window rate limiter over an injectable counter store
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    default_limits: RateLimitConfig,
    overrides: HashMap<String, RateLimitConfig>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: &EngineConfig) -> Self {
        RateLimiter {
            store,
            default_limits: RateLimitConfig {
                burst_limit: config.burst_limit,
                per_minute_limit: config.per_minute_limit,
                per_hour_limit: config.per_hour_limit,
            },
            overrides: config.limits.clone(),
        }
    }

    fn limits_for(&self, action_class: &str) -> RateLimitConfig {
        self.overrides
            .get(action_class)
            .copied()
            .unwrap_or(self.default_limits)
    }

    /// Check quota for one call
    ///
    /// All three horizons are evaluated read-only first; only when every one
    /// passes are the current buckets charged, so a denied call never
    /// consumes quota (no partial charging). On violation the longest
    /// applicable retry-after is reported.
    pub fn check(
        &self,
        identity: &str,
        action_class: &str,
        now: DateTime<Utc>,
    ) -> Result<RateCheck, LimiterError> {
        let limits = self.limits_for(action_class);
        let now_ms = now.timestamp_millis();
        let mut longest_retry: Option<Duration> = None;

        for horizon in Horizon::ALL {
            let limit = horizon.limit(&limits);
            let total = self.window_total(identity, action_class, horizon, now_ms)?;
            if total + 1 > limit {
                let retry = self.retry_after(identity, action_class, horizon, now_ms)?;
                tracing::debug!(
                    identity = %identity,
                    action_class = %action_class,
                    horizon = ?horizon,
                    total,
                    limit,
                    "rate limit exceeded"
                );
                if longest_retry.map_or(true, |current| retry > current) {
                    longest_retry = Some(retry);
                }
            }
        }

        if let Some(retry_after) = longest_retry {
            return Ok(RateCheck {
                allowed: false,
                retry_after: Some(retry_after),
            });
        }

        // Charge the current bucket of each horizon. Keeping entries for two
        // window lengths leaves slack for clock skew between instances.
        for horizon in Horizon::ALL {
            let key = self.key(identity, action_class, horizon, now_ms);
            let ttl = Duration::from_millis(horizon.window_ms() as u64 * 2);
            self.store.fetch_add(&key, 1, ttl)?;
        }

        Ok(RateCheck::allowed())
    }

    fn key(&self, identity: &str, action_class: &str, horizon: Horizon, now_ms: i64) -> CounterKey {
        CounterKey {
            identity: identity.to_string(),
            action_class: action_class.to_string(),
            horizon,
            bucket: now_ms.div_euclid(horizon.bucket_width_ms()),
        }
    }

    /// Sum of the trailing buckets covering the window ending at `now_ms`
    fn window_total(
        &self,
        identity: &str,
        action_class: &str,
        horizon: Horizon,
        now_ms: i64,
    ) -> Result<u64, LimiterError> {
        let current = now_ms.div_euclid(horizon.bucket_width_ms());
        let mut total = 0u64;
        for bucket in (current - horizon.bucket_count() + 1)..=current {
            let key = CounterKey {
                identity: identity.to_string(),
                action_class: action_class.to_string(),
                horizon,
                bucket,
            };
            total += self.store.get(&key)?;
        }
        Ok(total)
    }

    /// Time until the oldest occupied bucket in the window slides out
    fn retry_after(
        &self,
        identity: &str,
        action_class: &str,
        horizon: Horizon,
        now_ms: i64,
    ) -> Result<Duration, LimiterError> {
        let width = horizon.bucket_width_ms();
        let current = now_ms.div_euclid(width);
        for bucket in (current - horizon.bucket_count() + 1)..=current {
            let key = CounterKey {
                identity: identity.to_string(),
                action_class: action_class.to_string(),
                horizon,
                bucket,
            };
            if self.store.get(&key)? > 0 {
                let expires_at_ms = (bucket + horizon.bucket_count()) * width;
                let wait_ms = (expires_at_ms - now_ms).max(1);
                return Ok(Duration::from_millis(wait_ms as u64));
            }
        }
        // No occupied bucket found (limit of zero): the full window applies.
        Ok(Duration::from_millis(horizon.window_ms() as u64))
    }
}

/// In-memory counter store
///
/// Suitable for a single engine instance; a distributed deployment swaps in
/// a store backed by shared atomic counters with expiry.
#[derive(Default)]
pub struct InMemoryCounterStore {
    counters: RwLock<AHashMap<CounterKey, CounterEntry>>,
}

struct CounterEntry {
    count: u64,
    expires_at: Instant,
}

impl InMemoryCounterStore {
    /// Prune threshold; expired entries are swept when the map grows past it
    const PRUNE_AT: usize = 16_384;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.counters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.read().is_empty()
    }
}

impl CounterStore for InMemoryCounterStore {
    fn fetch_add(&self, key: &CounterKey, delta: u64, ttl: Duration) -> Result<u64, LimiterError> {
        let mut counters = self.counters.write();
        if counters.len() >= Self::PRUNE_AT {
            let now = Instant::now();
            counters.retain(|_, entry| entry.expires_at > now);
        }
        let entry = counters.entry(key.clone()).or_insert(CounterEntry {
            count: 0,
            expires_at: Instant::now() + ttl,
        });
        entry.count += delta;
        Ok(entry.count)
    }

    fn get(&self, key: &CounterKey) -> Result<u64, LimiterError> {
        Ok(self.counters.read().get(key).map_or(0, |e| e.count))
    }
}

/// Counter store that always fails; exercises fail-open/fail-closed paths
pub struct UnavailableCounterStore;

impl CounterStore for UnavailableCounterStore {
    fn fetch_add(&self, _key: &CounterKey, _delta: u64, _ttl: Duration) -> Result<u64, LimiterError> {
        Err(LimiterError::Unavailable("counter store offline".to_string()))
    }

    fn get(&self, _key: &CounterKey) -> Result<u64, LimiterError> {
        Err(LimiterError::Unavailable("counter store offline".to_string()))
    }
}
