//! Engine configuration
//!
//! All limits, TTLs and fail-open behavior are injected at construction and
//! immutable for the lifetime of an engine instance. Configuration can be
//! built in code or loaded from TOML:
//!
//! ```toml
//! burst_limit = 10
//! per_minute_limit = 60
//! per_hour_limit = 1000
//! decision_cache_ttl_ms = 5000
//! evaluation_timeout_ms = 200
//! limiter_fail_open = false
//!
//! [limits."pipeline:create"]
//! per_minute_limit = 10
//! ```

use crate::error::{Result, SamError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Rate limits for one action class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sliding 1s window limit
    #[serde(default = "default_burst_limit")]
    pub burst_limit: u32,
    /// Sliding 60s window limit
    #[serde(default = "default_per_minute_limit")]
    pub per_minute_limit: u32,
    /// Sliding 3600s window limit
    #[serde(default = "default_per_hour_limit")]
    pub per_hour_limit: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            burst_limit: default_burst_limit(),
            per_minute_limit: default_per_minute_limit(),
            per_hour_limit: default_per_hour_limit(),
        }
    }
}

/// Engine-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sliding 1s window limit (global default)
    pub burst_limit: u32,
    /// Sliding 60s window limit (global default)
    pub per_minute_limit: u32,
    /// Sliding 3600s window limit (global default)
    pub per_hour_limit: u32,
    /// Decision cache entry TTL in milliseconds
    pub decision_cache_ttl_ms: u64,
    /// Decision cache capacity (entries)
    pub decision_cache_size: usize,
    /// Evaluation latency budget in milliseconds
    pub evaluation_timeout_ms: u64,
    /// Allow requests through when the rate-limiter backing store is down
    pub limiter_fail_open: bool,
    /// Audit channel capacity; overflow drops events and counts them
    pub audit_queue_size: usize,
    /// Per-action-class rate limit overrides
    pub limits: HashMap<String, RateLimitConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            burst_limit: default_burst_limit(),
            per_minute_limit: default_per_minute_limit(),
            per_hour_limit: default_per_hour_limit(),
            decision_cache_ttl_ms: 5_000,
            decision_cache_size: 1024,
            evaluation_timeout_ms: 200,
            limiter_fail_open: false,
            audit_queue_size: 1024,
            limits: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Parse configuration from a TOML string, filling defaults for omitted keys
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate limits and sizes
    pub fn validate(&self) -> Result<()> {
        if self.decision_cache_size == 0 {
            return Err(SamError::InvalidConfig(
                "decision_cache_size must be non-zero".to_string(),
            ));
        }
        if self.audit_queue_size == 0 {
            return Err(SamError::InvalidConfig(
                "audit_queue_size must be non-zero".to_string(),
            ));
        }
        if self.evaluation_timeout_ms == 0 {
            return Err(SamError::InvalidConfig(
                "evaluation_timeout_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the limits for an action class, applying any override
    pub fn limits_for(&self, action_class: &str) -> RateLimitConfig {
        self.limits
            .get(action_class)
            .copied()
            .unwrap_or(RateLimitConfig {
                burst_limit: self.burst_limit,
                per_minute_limit: self.per_minute_limit,
                per_hour_limit: self.per_hour_limit,
            })
    }

    pub fn decision_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.decision_cache_ttl_ms)
    }

    pub fn evaluation_timeout(&self) -> Duration {
        Duration::from_millis(self.evaluation_timeout_ms)
    }
}

fn default_burst_limit() -> u32 {
    10
}

fn default_per_minute_limit() -> u32 {
    60
}

fn default_per_hour_limit() -> u32 {
    1000
}
