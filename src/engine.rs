//! Permission evaluation engine
//!
//! Combines resolved statements, condition results and rate-limit status
//! into a single allow/deny decision:
//! - Explicit deny always wins over any number of allows
//! - No matching statement means default deny
//! - Statements whose conditions fail (or are malformed) are excluded;
//!   they neither allow nor deny
//! - Store failures are fail-closed, never fail-open
//! - Rate limiting runs for would-be allows and is the only check that can
//!   turn one into a deny
//!
//! Evaluation always returns a `Decision`; collaborator faults are folded
//! into deny reasons rather than escaping as errors.

use crate::audit::{AuditBackend, AuditEvent, AuditSink, MetricsSnapshot, TracingBackend};
use crate::cache::{DecisionCache, DecisionKey};
use crate::condition::evaluate_all;
use crate::config::EngineConfig;
use crate::context::RequestContext;
use crate::limiter::{CounterStore, InMemoryCounterStore, RateLimiter};
use crate::policy::{Effect, Identity, StatementRef};
use crate::store::PolicyStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why a decision came out the way it did; exactly one per decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionReason {
    Allowed,
    ExplicitDeny,
    DefaultDeny,
    RateLimited,
    StoreUnavailable,
    Timeout,
}

/// Outcome of one evaluation
///
/// Cached briefly, then discarded; the audit sink is the system of record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: DecisionReason,
    /// The statement that decided an allow or explicit deny
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_statement: Option<StatementRef>,
    /// Set on rate-limited denials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
}

impl Decision {
    pub fn allow(matched_statement: Option<StatementRef>) -> Self {
        Decision {
            allowed: true,
            reason: DecisionReason::Allowed,
            matched_statement,
            retry_after: None,
        }
    }

    pub fn deny(reason: DecisionReason) -> Self {
        debug_assert!(reason != DecisionReason::Allowed);
        Decision {
            allowed: false,
            reason,
            matched_statement: None,
            retry_after: None,
        }
    }

    pub fn explicit_deny(matched_statement: StatementRef) -> Self {
        Decision {
            allowed: false,
            reason: DecisionReason::ExplicitDeny,
            matched_statement: Some(matched_statement),
            retry_after: None,
        }
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Decision {
            allowed: false,
            reason: DecisionReason::RateLimited,
            matched_statement: None,
            retry_after,
        }
    }
}

/// Input to one permission check
#[derive(Debug, Clone)]
pub struct AccessRequest {
    pub identity: Identity,
    pub action: String,
    pub resource: String,
    pub scope: String,
    pub context: RequestContext,
}

impl AccessRequest {
    pub fn new(
        identity: Identity,
        action: impl Into<String>,
        resource: impl Into<String>,
        scope: impl Into<String>,
        context: RequestContext,
    ) -> Self {
        AccessRequest {
            identity,
            action: action.into(),
            resource: resource.into(),
            scope: scope.into(),
            context,
        }
    }

    fn cache_key(&self) -> DecisionKey {
        DecisionKey {
            identity: self.identity.id.clone(),
            action: self.action.clone(),
            resource: self.resource.clone(),
            scope: self.scope.clone(),
            context_fingerprint: self.context.fingerprint(),
        }
    }
}

/// The SAM evaluation engine
///
/// Stateless across calls except for the decision cache and the rate
/// counters. Configuration is immutable for the engine's lifetime.
pub struct PermissionEngine<S: PolicyStore> {
    config: EngineConfig,
    store: S,
    limiter: RateLimiter,
    cache: DecisionCache,
    audit: AuditSink,
}

impl<S: PolicyStore> PermissionEngine<S> {
    /// Engine with in-memory rate counters and tracing-based audit
    pub fn new(config: EngineConfig, store: S) -> Self {
        Self::with_components(
            config,
            store,
            Arc::new(InMemoryCounterStore::new()),
            Arc::new(TracingBackend),
        )
    }

    /// Engine with injected counter store and audit backend
    pub fn with_components(
        config: EngineConfig,
        store: S,
        counters: Arc<dyn CounterStore>,
        audit_backend: Arc<dyn AuditBackend>,
    ) -> Self {
        let limiter = RateLimiter::new(counters, &config);
        let cache = DecisionCache::new(config.decision_cache_size, config.decision_cache_ttl());
        let audit = AuditSink::new(config.audit_queue_size, audit_backend);
        PermissionEngine {
            config,
            store,
            limiter,
            cache,
            audit,
        }
    }

    /// Decide whether `action` on `resource` is permitted for the identity
    ///
    /// Always returns a decision; never panics or propagates collaborator
    /// errors. One audit event is emitted per call, cache hit or not.
    pub fn check_permission(&self, request: &AccessRequest) -> Decision {
        let started = Instant::now();
        let budget = self.config.evaluation_timeout();
        let key = request.cache_key();

        if let Some(decision) = self.cache.get(&key) {
            tracing::debug!(
                identity = %request.identity.id,
                action = %request.action,
                "decision cache hit"
            );
            self.emit(request, &decision, started, true, 0);
            return decision;
        }

        let statements = match self.store.resolve(&request.identity, &request.scope) {
            Ok(statements) => statements,
            Err(error) => {
                tracing::warn!(
                    identity = %request.identity.id,
                    error = %error,
                    "policy store failure, failing closed"
                );
                let decision = Decision::deny(DecisionReason::StoreUnavailable);
                self.emit(request, &decision, started, false, 0);
                return decision;
            }
        };

        if started.elapsed() > budget {
            let decision = Decision::deny(DecisionReason::Timeout);
            self.emit(request, &decision, started, false, 0);
            return decision;
        }

        // Filter to matching statements and gate each on its conditions.
        // A malformed condition excludes only its own statement.
        let mut condition_errors = 0u32;
        let mut matched_allow: Option<StatementRef> = None;
        let mut matched_deny: Option<StatementRef> = None;

        for resolved in &statements.statements {
            if !resolved
                .statement
                .applies_to(&request.action, &request.resource)
            {
                continue;
            }
            match evaluate_all(&resolved.statement.conditions, &request.context) {
                Ok(outcome) if outcome.satisfied => match resolved.statement.effect {
                    Effect::Deny => {
                        matched_deny = Some(resolved.reference.clone());
                        break;
                    }
                    Effect::Allow => {
                        if matched_allow.is_none() {
                            matched_allow = Some(resolved.reference.clone());
                        }
                    }
                },
                Ok(_) => {}
                Err(error) => {
                    condition_errors += 1;
                    tracing::warn!(
                        policy_id = %resolved.reference.policy_id,
                        index = resolved.reference.index,
                        error = %error,
                        "malformed condition, excluding statement"
                    );
                }
            }
        }

        if started.elapsed() > budget {
            let decision = Decision::deny(DecisionReason::Timeout);
            self.emit(request, &decision, started, false, condition_errors);
            return decision;
        }

        let decision = if let Some(reference) = matched_deny {
            Decision::explicit_deny(reference)
        } else if let Some(reference) = matched_allow {
            self.rate_check(request, reference)
        } else {
            Decision::deny(DecisionReason::DefaultDeny)
        };

        // Only policy-derived outcomes are memoized: rate-limit denials may
        // clear before the cache TTL does, and infrastructure denials must
        // not outlive the outage by a TTL.
        if matches!(
            decision.reason,
            DecisionReason::Allowed | DecisionReason::ExplicitDeny | DecisionReason::DefaultDeny
        ) {
            self.cache.put(key, decision.clone());
        }

        self.emit(request, &decision, started, false, condition_errors);
        decision
    }

    /// Rate check for a would-be allow
    fn rate_check(&self, request: &AccessRequest, reference: StatementRef) -> Decision {
        match self.limiter.check(
            &request.identity.id,
            &request.action,
            request.context.timestamp,
        ) {
            Ok(check) if check.allowed => Decision::allow(Some(reference)),
            Ok(check) => Decision::rate_limited(check.retry_after),
            Err(error) => {
                if self.config.limiter_fail_open {
                    tracing::warn!(
                        error = %error,
                        "rate-limiter store down, failing open per configuration"
                    );
                    Decision::allow(Some(reference))
                } else {
                    tracing::warn!(error = %error, "rate-limiter store down, failing closed");
                    Decision::rate_limited(None)
                }
            }
        }
    }

    fn emit(
        &self,
        request: &AccessRequest,
        decision: &Decision,
        started: Instant,
        cache_hit: bool,
        condition_errors: u32,
    ) {
        let latency = started.elapsed();
        let event = AuditEvent {
            timestamp: request.context.timestamp,
            identity: request.identity.id.clone(),
            action: request.action.clone(),
            resource: request.resource.clone(),
            scope: request.scope.clone(),
            allowed: decision.allowed,
            reason: decision.reason,
            matched_statement: decision.matched_statement.clone(),
            retry_after_ms: decision.retry_after.map(|d| d.as_millis() as u64),
            latency_us: latency.as_micros() as u64,
            cache_hit,
            condition_errors,
        };
        self.audit.record(event, latency);
    }

    /// Snapshot of the evaluation metrics
    pub fn metrics(&self) -> MetricsSnapshot {
        self.audit.metrics()
    }

    /// Drop all cached decisions (e.g. after a policy change that must be
    /// visible before the TTL elapses)
    pub fn invalidate_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::CollectingBackend;
    use crate::condition::Condition;
    use crate::limiter::UnavailableCounterStore;
    use crate::policy::{Policy, Statement};
    use crate::store::{InMemoryPolicyStore, StatementSet, StoreError, UnavailableStore};
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    fn ctx() -> RequestContext {
        RequestContext::at(Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap())
    }

    fn engine_with(store: InMemoryPolicyStore) -> PermissionEngine<InMemoryPolicyStore> {
        PermissionEngine::with_components(
            EngineConfig::default(),
            store,
            Arc::new(InMemoryCounterStore::new()),
            Arc::new(CollectingBackend::new()),
        )
    }

    fn reader_store() -> InMemoryPolicyStore {
        let store = InMemoryPolicyStore::new();
        store.publish_policy(Policy::new("p-read", 1).with_statement(Statement::new(
            Effect::Allow,
            vec!["pipeline:read"],
            vec!["pipeline:*"],
        )));
        store
    }

    fn request(identity: Identity, action: &str, resource: &str) -> AccessRequest {
        AccessRequest::new(identity, action, resource, "acct-1", ctx())
    }

    #[test]
    fn test_allow_with_matched_statement() {
        let store = reader_store();
        let engine = engine_with(store);
        let identity = Identity::new("u1").with_policy("p-read");

        let decision = engine.check_permission(&request(identity, "pipeline:read", "pipeline:1"));
        assert!(decision.allowed);
        assert_eq!(decision.reason, DecisionReason::Allowed);
        let matched = decision.matched_statement.unwrap();
        assert_eq!(matched.policy_id, "p-read");
        assert_eq!(matched.index, 0);
    }

    #[test]
    fn test_default_deny_when_nothing_matches() {
        let engine = engine_with(reader_store());
        let identity = Identity::new("u1").with_policy("p-read");

        let decision =
            engine.check_permission(&request(identity, "pipeline:delete", "pipeline:1"));
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::DefaultDeny);
        assert!(decision.matched_statement.is_none());
    }

    #[test]
    fn test_explicit_deny_wins_over_allow() {
        let store = InMemoryPolicyStore::new();
        store.publish_policy(
            Policy::new("p-mixed", 1)
                .with_statement(Statement::new(
                    Effect::Allow,
                    vec!["account:*"],
                    vec!["account:*"],
                ))
                .with_statement(
                    Statement::new(Effect::Deny, vec!["account:*"], vec!["account:123"])
                        .with_sid("deny-123"),
                ),
        );
        let engine = engine_with(store);
        let identity = Identity::new("u2").with_policy("p-mixed");

        let decision =
            engine.check_permission(&request(identity, "account:delete", "account:123"));
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::ExplicitDeny);
        assert_eq!(
            decision.matched_statement.unwrap().sid,
            Some("deny-123".to_string())
        );
    }

    #[test]
    fn test_failed_condition_excludes_statement() {
        let store = InMemoryPolicyStore::new();
        store.publish_policy(Policy::new("p-risky", 1).with_statement(
            Statement::new(Effect::Allow, vec!["pipeline:read"], vec!["pipeline:*"])
                .with_condition(Condition::RiskBelow { threshold: 0.5 }),
        ));
        let engine = engine_with(store);
        let identity = Identity::new("u1").with_policy("p-risky");

        let mut req = request(identity, "pipeline:read", "pipeline:1");
        req.context = req.context.with_risk_score(0.9);

        // The allow statement's condition fails, so nothing matches
        let decision = engine.check_permission(&req);
        assert_eq!(decision.reason, DecisionReason::DefaultDeny);
    }

    #[test]
    fn test_failed_condition_on_deny_does_not_deny() {
        let store = InMemoryPolicyStore::new();
        store.publish_policy(
            Policy::new("p", 1)
                .with_statement(Statement::new(
                    Effect::Allow,
                    vec!["pipeline:read"],
                    vec!["pipeline:*"],
                ))
                .with_statement(
                    Statement::new(Effect::Deny, vec!["pipeline:read"], vec!["pipeline:*"])
                        .with_condition(Condition::RiskBelow { threshold: 0.5 }),
                ),
        );
        let engine = engine_with(store);
        let identity = Identity::new("u1").with_policy("p");

        // Risk 0.9 fails the deny statement's risk_below(0.5), excluding it
        let mut req = request(identity, "pipeline:read", "pipeline:1");
        req.context = req.context.with_risk_score(0.9);

        let decision = engine.check_permission(&req);
        assert!(decision.allowed);
    }

    #[test]
    fn test_store_failure_fails_closed() {
        let engine = PermissionEngine::with_components(
            EngineConfig::default(),
            UnavailableStore,
            Arc::new(InMemoryCounterStore::new()),
            Arc::new(CollectingBackend::new()),
        );

        let decision =
            engine.check_permission(&request(Identity::new("u1"), "pipeline:read", "pipeline:1"));
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::StoreUnavailable);
    }

    #[test]
    fn test_malformed_condition_excludes_only_that_statement() {
        let store = InMemoryPolicyStore::new();
        // Bypass Policy::validate to simulate a malformed published policy
        store.publish_policy(
            Policy::new("p", 1)
                .with_statement(
                    Statement::new(Effect::Allow, vec!["pipeline:read"], vec!["pipeline:*"])
                        .with_condition(Condition::RiskBelow {
                            threshold: f64::NAN,
                        }),
                )
                .with_statement(Statement::new(
                    Effect::Allow,
                    vec!["pipeline:read"],
                    vec!["pipeline:*"],
                )),
        );
        let engine = engine_with(store);
        let identity = Identity::new("u1").with_policy("p");

        let mut req = request(identity, "pipeline:read", "pipeline:1");
        req.context = req.context.with_risk_score(0.1);

        // First statement is malformed and excluded; second one allows
        let decision = engine.check_permission(&req);
        assert!(decision.allowed);
        assert_eq!(decision.matched_statement.unwrap().index, 1);
    }

    #[test]
    fn test_limiter_outage_fails_closed_by_default() {
        let engine = PermissionEngine::with_components(
            EngineConfig::default(),
            reader_store(),
            Arc::new(UnavailableCounterStore),
            Arc::new(CollectingBackend::new()),
        );
        let identity = Identity::new("u1").with_policy("p-read");

        let decision = engine.check_permission(&request(identity, "pipeline:read", "pipeline:1"));
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::RateLimited);
        assert!(decision.retry_after.is_none());
    }

    #[test]
    fn test_limiter_outage_fail_open_when_configured() {
        let config = EngineConfig {
            limiter_fail_open: true,
            ..EngineConfig::default()
        };
        let engine = PermissionEngine::with_components(
            config,
            reader_store(),
            Arc::new(UnavailableCounterStore),
            Arc::new(CollectingBackend::new()),
        );
        let identity = Identity::new("u1").with_policy("p-read");

        let decision = engine.check_permission(&request(identity, "pipeline:read", "pipeline:1"));
        assert!(decision.allowed);
    }

    #[test]
    fn test_limiter_outage_never_overrides_explicit_deny() {
        let store = InMemoryPolicyStore::new();
        store.publish_policy(
            Policy::new("p", 1)
                .with_statement(Statement::new(
                    Effect::Allow,
                    vec!["pipeline:*"],
                    vec!["pipeline:*"],
                ))
                .with_statement(Statement::new(
                    Effect::Deny,
                    vec!["pipeline:delete"],
                    vec!["pipeline:*"],
                )),
        );
        let engine = PermissionEngine::with_components(
            EngineConfig::default(),
            store,
            Arc::new(UnavailableCounterStore),
            Arc::new(CollectingBackend::new()),
        );
        let identity = Identity::new("u1").with_policy("p");

        // The limiter is down, but the explicit deny is reported, not
        // RATE_LIMITED: policy authority outranks throttling.
        let decision =
            engine.check_permission(&request(identity, "pipeline:delete", "pipeline:1"));
        assert_eq!(decision.reason, DecisionReason::ExplicitDeny);
    }

    #[test]
    fn test_cache_hit_returns_identical_decision() {
        let engine = engine_with(reader_store());
        let identity = Identity::new("u1").with_policy("p-read");
        let req = request(identity, "pipeline:read", "pipeline:1");

        let first = engine.check_permission(&req);
        assert_eq!(engine.cache_len(), 1);
        let second = engine.check_permission(&req);
        assert_eq!(first, second);

        // Both evaluations audited, one cache hit
        let metrics = engine.metrics();
        assert_eq!(metrics.evaluations, 2);
        assert_eq!(metrics.cache_hits, 1);
    }

    #[test]
    fn test_rate_limited_not_cached() {
        let config = EngineConfig {
            burst_limit: 1,
            ..EngineConfig::default()
        };
        let engine = PermissionEngine::with_components(
            config,
            reader_store(),
            Arc::new(InMemoryCounterStore::new()),
            Arc::new(CollectingBackend::new()),
        );
        let identity = Identity::new("u1").with_policy("p-read");

        // Distinct fingerprints so the cache does not absorb the burst
        for i in 0..2 {
            let mut req = request(identity.clone(), "pipeline:read", "pipeline:1");
            req.context = req.context.with_extension("request_id", i.to_string());
            let decision = engine.check_permission(&req);
            if i == 0 {
                assert!(decision.allowed);
            } else {
                assert_eq!(decision.reason, DecisionReason::RateLimited);
            }
        }
        // Only the allow was cached
        assert_eq!(engine.cache_len(), 1);
    }

    #[test]
    fn test_timeout_fails_closed() {
        struct SlowStore;
        impl PolicyStore for SlowStore {
            fn resolve(
                &self,
                _identity: &Identity,
                _scope: &str,
            ) -> Result<StatementSet, StoreError> {
                std::thread::sleep(Duration::from_millis(20));
                Ok(StatementSet::default())
            }
        }

        let config = EngineConfig {
            evaluation_timeout_ms: 5,
            ..EngineConfig::default()
        };
        let engine = PermissionEngine::with_components(
            config,
            SlowStore,
            Arc::new(InMemoryCounterStore::new()),
            Arc::new(CollectingBackend::new()),
        );

        let decision =
            engine.check_permission(&request(Identity::new("u1"), "pipeline:read", "pipeline:1"));
        assert_eq!(decision.reason, DecisionReason::Timeout);
    }

    #[test]
    fn test_invalidate_cache_sees_new_policy() {
        let store = reader_store();
        let engine = engine_with(store);
        let identity = Identity::new("u1").with_policy("p-read");
        let req = request(identity, "pipeline:read", "pipeline:1");

        assert!(engine.check_permission(&req).allowed);

        engine.store().publish_policy(Policy::new("p-read", 2).with_statement(
            Statement::new(Effect::Deny, vec!["pipeline:read"], vec!["pipeline:*"]),
        ));
        // Cached allow still serves until invalidated
        assert!(engine.check_permission(&req).allowed);
        engine.invalidate_cache();
        assert!(!engine.check_permission(&req).allowed);
    }

    proptest! {
        #[test]
        fn prop_any_matching_deny_forces_explicit_deny(
            allow_count in 0usize..5,
            deny_count in 1usize..5,
        ) {
            let store = InMemoryPolicyStore::new();
            let mut policy = Policy::new("p", 1);
            for _ in 0..allow_count {
                policy.add_statement(Statement::new(
                    Effect::Allow,
                    vec!["pipeline:*"],
                    vec!["pipeline:*"],
                ));
            }
            for _ in 0..deny_count {
                policy.add_statement(Statement::new(
                    Effect::Deny,
                    vec!["pipeline:*"],
                    vec!["pipeline:*"],
                ));
            }
            store.publish_policy(policy);
            let engine = engine_with(store);
            let identity = Identity::new("u1").with_policy("p");

            let decision = engine.check_permission(&request(
                identity,
                "pipeline:read",
                "pipeline:1",
            ));
            prop_assert!(!decision.allowed);
            prop_assert_eq!(decision.reason, DecisionReason::ExplicitDeny);
        }

        #[test]
        fn prop_no_statements_means_default_deny(action in "[a-z]{1,8}:[a-z]{1,8}") {
            let engine = engine_with(InMemoryPolicyStore::new());
            let decision = engine.check_permission(&request(
                Identity::new("u1"),
                action.as_str(),
                "pipeline:1",
            ));
            prop_assert_eq!(decision.reason, DecisionReason::DefaultDeny);
        }
    }
}
