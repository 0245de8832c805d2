//! Audit and metrics emission
//!
//! Every evaluation produces exactly one audit event and a set of metric
//! samples. Emission never blocks the decision path: events go through a
//! bounded crossbeam channel to a background worker; when the queue is full
//! the event is dropped and counted rather than stalling the caller. Queued
//! events are drained before the worker shuts down, so a decision already
//! handed to the sink is never retracted.

use crate::engine::DecisionReason;
use crate::policy::StatementRef;
use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// One structured audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub identity: String,
    pub action: String,
    pub resource: String,
    pub scope: String,
    pub allowed: bool,
    pub reason: DecisionReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_statement: Option<StatementRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    /// Evaluation latency in microseconds
    pub latency_us: u64,
    /// Whether the decision was served from the cache
    pub cache_hit: bool,
    /// Statements excluded because their conditions were malformed
    pub condition_errors: u32,
}

/// Downstream append-only audit storage
pub trait AuditBackend: Send + Sync {
    fn append(&self, event: &AuditEvent);
}

/// Default backend: emits each event as a structured tracing record
pub struct TracingBackend;

impl AuditBackend for TracingBackend {
    fn append(&self, event: &AuditEvent) {
        tracing::info!(
            target: "sam_audit",
            identity = %event.identity,
            action = %event.action,
            resource = %event.resource,
            scope = %event.scope,
            allowed = event.allowed,
            reason = ?event.reason,
            latency_us = event.latency_us,
            cache_hit = event.cache_hit,
            "access decision"
        );
    }
}

/// Backend that collects events in memory; used by tests
#[derive(Default)]
pub struct CollectingBackend {
    events: Mutex<Vec<AuditEvent>>,
}

impl CollectingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl AuditBackend for CollectingBackend {
    fn append(&self, event: &AuditEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Numeric counters for aggregation
#[derive(Default)]
pub struct Metrics {
    allowed: AtomicU64,
    explicit_deny: AtomicU64,
    default_deny: AtomicU64,
    rate_limited: AtomicU64,
    store_unavailable: AtomicU64,
    timeout: AtomicU64,
    cache_hits: AtomicU64,
    evaluations: AtomicU64,
    latency_us_total: AtomicU64,
    audit_dropped: AtomicU64,
}

/// Point-in-time copy of the metric counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub allowed: u64,
    pub explicit_deny: u64,
    pub default_deny: u64,
    pub rate_limited: u64,
    pub store_unavailable: u64,
    pub timeout: u64,
    pub cache_hits: u64,
    pub evaluations: u64,
    pub latency_us_total: u64,
    pub audit_dropped: u64,
}

impl Metrics {
    fn record(&self, reason: DecisionReason, latency: Duration, cache_hit: bool) {
        let counter = match reason {
            DecisionReason::Allowed => &self.allowed,
            DecisionReason::ExplicitDeny => &self.explicit_deny,
            DecisionReason::DefaultDeny => &self.default_deny,
            DecisionReason::RateLimited => &self.rate_limited,
            DecisionReason::StoreUnavailable => &self.store_unavailable,
            DecisionReason::Timeout => &self.timeout,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        self.latency_us_total
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        if cache_hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allowed: self.allowed.load(Ordering::Relaxed),
            explicit_deny: self.explicit_deny.load(Ordering::Relaxed),
            default_deny: self.default_deny.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            store_unavailable: self.store_unavailable.load(Ordering::Relaxed),
            timeout: self.timeout.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            evaluations: self.evaluations.load(Ordering::Relaxed),
            latency_us_total: self.latency_us_total.load(Ordering::Relaxed),
            audit_dropped: self.audit_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Asynchronous audit sink with bounded hand-off
pub struct AuditSink {
    sender: Option<Sender<AuditEvent>>,
    worker: Option<JoinHandle<()>>,
    metrics: Arc<Metrics>,
}

impl AuditSink {
    /// Spawn the sink with its background worker
    pub fn new(queue_size: usize, backend: Arc<dyn AuditBackend>) -> Self {
        let (sender, receiver) = channel::bounded::<AuditEvent>(queue_size);
        let worker = std::thread::Builder::new()
            .name("sam-audit".to_string())
            .spawn(move || {
                // Runs until every sender is dropped, draining what remains.
                for event in receiver {
                    backend.append(&event);
                }
            })
            .expect("failed to spawn audit worker");

        AuditSink {
            sender: Some(sender),
            worker: Some(worker),
            metrics: Arc::new(Metrics::default()),
        }
    }

    /// Record one evaluation outcome; never blocks, never fails the caller
    pub fn record(&self, event: AuditEvent, latency: Duration) {
        self.metrics.record(event.reason, latency, event.cache_hit);

        let Some(sender) = &self.sender else {
            return;
        };
        match sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.metrics.audit_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    identity = %event.identity,
                    action = %event.action,
                    "audit queue full, dropping event"
                );
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::warn!("audit worker gone, dropping event");
            }
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn dropped(&self) -> u64 {
        self.metrics.audit_dropped.load(Ordering::Relaxed)
    }

    /// Close the channel and wait for queued events to be delivered
    pub fn shutdown(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for AuditSink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(identity: &str, allowed: bool, reason: DecisionReason) -> AuditEvent {
        AuditEvent {
            timestamp: Utc::now(),
            identity: identity.to_string(),
            action: "pipeline:read".to_string(),
            resource: "pipeline:1".to_string(),
            scope: "acct-1".to_string(),
            allowed,
            reason,
            matched_statement: None,
            retry_after_ms: None,
            latency_us: 42,
            cache_hit: false,
            condition_errors: 0,
        }
    }

    #[test]
    fn test_events_delivered() {
        let backend = Arc::new(CollectingBackend::new());
        let mut sink = AuditSink::new(64, backend.clone());

        for i in 0..10 {
            sink.record(
                event(&format!("u{i}"), true, DecisionReason::Allowed),
                Duration::from_micros(50),
            );
        }
        sink.shutdown();

        assert_eq!(backend.len(), 10);
        assert_eq!(sink.metrics().allowed, 10);
        assert_eq!(sink.metrics().audit_dropped, 0);
    }

    #[test]
    fn test_queue_overflow_drops_and_counts() {
        // A backend that blocks until released, so the queue fills up
        struct BlockingBackend {
            gate: Mutex<()>,
        }
        impl AuditBackend for BlockingBackend {
            fn append(&self, _event: &AuditEvent) {
                let _hold = self.gate.lock();
            }
        }

        let backend = Arc::new(BlockingBackend {
            gate: Mutex::new(()),
        });
        let gate = backend.gate.lock();

        let mut sink = AuditSink::new(2, backend.clone());
        // Fill the channel (plus possibly one event held by the worker),
        // then overflow it.
        for _ in 0..20 {
            sink.record(
                event("u1", false, DecisionReason::ExplicitDeny),
                Duration::from_micros(10),
            );
        }
        assert!(sink.dropped() > 0);
        // record() returned every time; the caller never blocked.

        drop(gate);
        sink.shutdown();
    }

    #[test]
    fn test_metrics_by_reason() {
        let backend = Arc::new(CollectingBackend::new());
        let sink = AuditSink::new(64, backend);

        sink.record(event("u1", true, DecisionReason::Allowed), Duration::ZERO);
        sink.record(
            event("u1", false, DecisionReason::ExplicitDeny),
            Duration::ZERO,
        );
        sink.record(
            event("u1", false, DecisionReason::RateLimited),
            Duration::ZERO,
        );
        sink.record(
            event("u1", false, DecisionReason::DefaultDeny),
            Duration::ZERO,
        );

        let snapshot = sink.metrics();
        assert_eq!(snapshot.allowed, 1);
        assert_eq!(snapshot.explicit_deny, 1);
        assert_eq!(snapshot.rate_limited, 1);
        assert_eq!(snapshot.default_deny, 1);
        assert_eq!(snapshot.evaluations, 4);
    }

    #[test]
    fn test_queued_events_survive_shutdown() {
        let backend = Arc::new(CollectingBackend::new());
        let mut sink = AuditSink::new(1024, backend.clone());

        for _ in 0..100 {
            sink.record(event("u1", true, DecisionReason::Allowed), Duration::ZERO);
        }
        // Shutdown drains the queue before joining the worker
        sink.shutdown();
        assert_eq!(backend.len(), 100);
    }
}
