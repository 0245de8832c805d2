//! SAM — Secure Access Management engine for SecurePipe
//!
//! The component that decides, for every action a caller attempts against a
//! resource, whether that action is permitted. It combines:
//!
//! - **Role-based grants**: roles attach policies; policies carry ordered
//!   allow/deny statements with `action:resource` patterns
//! - **Context conditions**: time windows, IP/geo allowlists, device
//!   classification, risk-score thresholds
//! - **Rate limiting**: sliding burst/minute/hour windows per
//!   (identity, action class)
//! - **Decision caching**: short-TTL LRU memoization of repeated checks
//! - **Audit emission**: one structured record per evaluation, handed off
//!   asynchronously so the decision path never blocks
//!
//! ## Semantics
//!
//! Explicit deny always wins; no match means default deny; infrastructure
//! failures fail closed. Every decision carries exactly one reason, so an
//! operator can tell "you lack permission" apart from "the system degraded
//! to deny".
//!
//! ## Example
//!
//! ```
//! use sam_engine::{
//!     AccessRequest, Effect, EngineConfig, Identity, InMemoryPolicyStore,
//!     PermissionEngine, Policy, RequestContext, Statement,
//! };
//!
//! let store = InMemoryPolicyStore::new();
//! store.publish_policy(Policy::new("p-read", 1).with_statement(Statement::new(
//!     Effect::Allow,
//!     vec!["pipeline:read"],
//!     vec!["pipeline:*"],
//! )));
//!
//! let engine = PermissionEngine::new(EngineConfig::default(), store);
//! let identity = Identity::new("u1").with_policy("p-read");
//!
//! let decision = engine.check_permission(&AccessRequest::new(
//!     identity,
//!     "pipeline:read",
//!     "pipeline:42",
//!     "acct-1",
//!     RequestContext::now(),
//! ));
//! assert!(decision.allowed);
//! ```
//!
//! Persistence of roles, policies and audit records is an external
//! responsibility; this crate evaluates, caches and decides in memory. The
//! [`PolicyStore`], [`CounterStore`] and [`AuditBackend`] traits are the
//! seams to the outside world.

pub mod audit;
pub mod cache;
pub mod condition;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod limiter;
pub mod pattern;
pub mod policy;
pub mod store;

// Re-export commonly used types
pub use audit::{
    AuditBackend, AuditEvent, AuditSink, CollectingBackend, MetricsSnapshot, TracingBackend,
};
pub use cache::{DecisionCache, DecisionKey};
pub use condition::{Condition, ConditionError, ConditionOutcome};
pub use config::{EngineConfig, RateLimitConfig};
pub use context::{DeviceKind, RequestContext};
pub use engine::{AccessRequest, Decision, DecisionReason, PermissionEngine};
pub use error::{Result, SamError};
pub use limiter::{
    CounterKey, CounterStore, InMemoryCounterStore, LimiterError, RateCheck, RateLimiter,
};
pub use pattern::PatternMatcher;
pub use policy::{Effect, Identity, Policy, Role, Statement, StatementRef};
pub use store::{InMemoryPolicyStore, PolicyStore, ResolvedStatement, StatementSet, StoreError};

/// Engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
