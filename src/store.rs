//! Policy store adapter
//!
//! Read-only lookup of the statements attached to an identity within an
//! account scope. The adapter owns the query strategy against the backing
//! persistence layer; the engine only sees immutable snapshots, so policy
//! mutations never affect an in-flight evaluation.

use crate::policy::{Identity, Policy, Role, Statement, StatementRef};
use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;

/// Store-adapter failure; the engine folds these into DENY(STORE_UNAVAILABLE)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("policy store unavailable: {0}")]
    Unavailable(String),

    #[error("policy store timed out after {0}ms")]
    Timeout(u64),
}

/// One resolved statement plus its provenance
#[derive(Debug, Clone)]
pub struct ResolvedStatement {
    pub statement: Statement,
    pub reference: StatementRef,
}

/// Immutable snapshot of everything attached to an identity in a scope
///
/// Statement order is role order, then policy attachment order, then
/// statement order within the policy, which keeps evaluation deterministic.
#[derive(Debug, Clone, Default)]
pub struct StatementSet {
    pub statements: Vec<ResolvedStatement>,
}

impl StatementSet {
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

/// Read boundary to the external persistence layer
pub trait PolicyStore: Send + Sync {
    /// Merge all statements from all policies attached to the identity
    /// (directly or via role) within the account scope.
    fn resolve(&self, identity: &Identity, account_scope: &str) -> Result<StatementSet, StoreError>;
}

/// In-memory policy store
///
/// Serves as the local snapshot cache in front of the real persistence layer
/// and as the substitute store in tests. Published policies are held behind
/// `Arc` and never mutated; publishing a new version replaces the map entry.
#[derive(Default)]
pub struct InMemoryPolicyStore {
    inner: RwLock<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    roles: AHashMap<String, Role>,
    policies: AHashMap<String, Arc<Policy>>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a policy version. Replaces any previous version of the same id.
    pub fn publish_policy(&self, policy: Policy) {
        let mut inner = self.inner.write();
        inner.policies.insert(policy.id.clone(), Arc::new(policy));
    }

    pub fn upsert_role(&self, role: Role) {
        let mut inner = self.inner.write();
        inner.roles.insert(role.id.clone(), role);
    }

    pub fn policy_version(&self, policy_id: &str) -> Option<u32> {
        self.inner.read().policies.get(policy_id).map(|p| p.version)
    }

    fn append_policy(policy: &Policy, out: &mut Vec<ResolvedStatement>) {
        for (index, statement) in policy.statements.iter().enumerate() {
            out.push(ResolvedStatement {
                statement: statement.clone(),
                reference: StatementRef {
                    policy_id: policy.id.clone(),
                    policy_version: policy.version,
                    index,
                    sid: statement.sid.clone(),
                },
            });
        }
    }
}

impl PolicyStore for InMemoryPolicyStore {
    fn resolve(
        &self,
        identity: &Identity,
        _account_scope: &str,
    ) -> Result<StatementSet, StoreError> {
        let inner = self.inner.read();
        let mut statements = Vec::new();

        // Role-attached policies first, in role order
        for role_id in &identity.role_ids {
            let Some(role) = inner.roles.get(role_id) else {
                // A dangling role reference resolves to nothing rather than
                // failing the evaluation; default deny covers the gap.
                tracing::warn!(role_id = %role_id, "identity references unknown role");
                continue;
            };
            for policy_id in &role.policy_ids {
                if let Some(policy) = inner.policies.get(policy_id) {
                    Self::append_policy(policy, &mut statements);
                } else {
                    tracing::warn!(policy_id = %policy_id, "role references unknown policy");
                }
            }
        }

        // Then directly attached policies
        for policy_id in &identity.policy_ids {
            if let Some(policy) = inner.policies.get(policy_id) {
                Self::append_policy(policy, &mut statements);
            } else {
                tracing::warn!(policy_id = %policy_id, "identity references unknown policy");
            }
        }

        Ok(StatementSet { statements })
    }
}

/// Store stub that always fails; used to exercise fail-closed paths in tests
pub struct UnavailableStore;

impl PolicyStore for UnavailableStore {
    fn resolve(
        &self,
        _identity: &Identity,
        _account_scope: &str,
    ) -> Result<StatementSet, StoreError> {
        Err(StoreError::Unavailable("backing store offline".to_string()))
    }
}
