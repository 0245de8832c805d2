//! Policy document model
//!
//! Policies are JSON documents of allow/deny statements with action and
//! resource patterns plus optional conditions, in the style of AWS IAM but
//! restricted to SecurePipe's fixed action/resource/condition model.
//!
//! A policy is immutable once published: updates create a new version, so a
//! decision recorded against `(policy_id, version)` stays reproducible for
//! audit replay.

use crate::condition::Condition;
use crate::error::{Result, SamError};
use crate::pattern::PatternMatcher;
use serde::{Deserialize, Serialize};

/// Effect of a policy statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    /// Allow the action
    Allow,
    /// Deny the action (takes precedence over Allow)
    Deny,
}

/// A single allow/deny rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    /// Statement ID (optional, surfaces in audit records)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,

    pub effect: Effect,

    /// Action patterns this statement applies to (e.g. `pipeline:*`)
    pub actions: Vec<String>,

    /// Resource patterns this statement applies to
    pub resources: Vec<String>,

    /// Conditions; all must hold for the statement to take effect
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Statement {
    pub fn new(effect: Effect, actions: Vec<&str>, resources: Vec<&str>) -> Self {
        Statement {
            sid: None,
            effect,
            actions: actions.into_iter().map(String::from).collect(),
            resources: resources.into_iter().map(String::from).collect(),
            conditions: Vec::new(),
        }
    }

    pub fn with_sid(mut self, sid: impl Into<String>) -> Self {
        self.sid = Some(sid.into());
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Check if this statement's patterns cover the given action and resource
    pub fn applies_to(&self, action: &str, resource: &str) -> bool {
        let action_matches = self
            .actions
            .iter()
            .any(|pattern| PatternMatcher::matches(pattern, action));
        if !action_matches {
            return false;
        }
        self.resources
            .iter()
            .any(|pattern| PatternMatcher::matches(pattern, resource))
    }
}

/// A published policy: an ordered sequence of statements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    /// Monotonically increasing publication version
    pub version: u32,
    pub statements: Vec<Statement>,
}

impl Policy {
    pub fn new(id: impl Into<String>, version: u32) -> Self {
        Policy {
            id: id.into(),
            version,
            statements: Vec::new(),
        }
    }

    pub fn add_statement(&mut self, statement: Statement) {
        self.statements.push(statement);
    }

    pub fn with_statement(mut self, statement: Statement) -> Self {
        self.statements.push(statement);
        self
    }

    /// Parse a policy from its JSON document form
    pub fn from_json(json: &str) -> Result<Self> {
        let policy: Policy = serde_json::from_str(json)?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validate structure at load time
    ///
    /// Rejects empty statements, illegal wildcard placement and malformed
    /// condition parameters, so evaluation never sees an unloadable policy.
    pub fn validate(&self) -> Result<()> {
        if self.statements.is_empty() {
            return Err(SamError::PolicyValidation(format!(
                "policy {} has no statements",
                self.id
            )));
        }
        for (index, statement) in self.statements.iter().enumerate() {
            if statement.actions.is_empty() {
                return Err(SamError::PolicyValidation(format!(
                    "policy {} statement {} has no actions",
                    self.id, index
                )));
            }
            if statement.resources.is_empty() {
                return Err(SamError::PolicyValidation(format!(
                    "policy {} statement {} has no resources",
                    self.id, index
                )));
            }
            for pattern in statement.actions.iter().chain(statement.resources.iter()) {
                PatternMatcher::validate(pattern)?;
            }
            for condition in &statement.conditions {
                condition
                    .validate()
                    .map_err(|e| SamError::MalformedCondition {
                        policy_id: self.id.clone(),
                        index,
                        detail: e.to_string(),
                    })?;
            }
        }
        Ok(())
    }
}

/// Stable reference to a statement within a published policy version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementRef {
    pub policy_id: String,
    pub policy_version: u32,
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
}

/// An account-scoped role: a named, ordered set of attached policies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    pub name: String,
    pub policy_ids: Vec<String>,
}

impl Role {
    pub fn new(id: impl Into<String>, name: impl Into<String>, policy_ids: Vec<&str>) -> Self {
        Role {
            id: id.into(),
            name: name.into(),
            policy_ids: policy_ids.into_iter().map(String::from).collect(),
        }
    }
}

/// Resolved principal, supplied by the external auth layer
///
/// Immutable per request. Carries the roles valid within the account scope
/// plus any directly attached policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    #[serde(default)]
    pub role_ids: Vec<String>,
    #[serde(default)]
    pub policy_ids: Vec<String>,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Identity {
            id: id.into(),
            role_ids: Vec::new(),
            policy_ids: Vec::new(),
        }
    }

    pub fn with_role(mut self, role_id: impl Into<String>) -> Self {
        self.role_ids.push(role_id.into());
        self
    }

    pub fn with_policy(mut self, policy_id: impl Into<String>) -> Self {
        self.policy_ids.push(policy_id.into());
        self
    }
}
