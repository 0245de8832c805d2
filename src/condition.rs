//! Condition evaluation for policy statements
//!
//! Conditions are a closed set of named predicates over the request context:
//! - `time_window` — timestamp falls within [start, end) in a fixed UTC
//!   offset, optionally restricted to days of the week
//! - `ip_allowlist` / `geo_allowlist` — source IP / derived country is in the
//!   given set; unknown or unparseable input is never satisfied (fail-closed)
//! - `device_class` — user-agent classification is not in a blocked set
//! - `risk_below` — caller-supplied risk score is strictly below a threshold
//!
//! Unknown condition kinds are rejected at policy-load time by serde's closed
//! enum. All conditions on a statement are AND-ed by the evaluator.

use crate::context::{DeviceKind, RequestContext};
use chrono::{Datelike, FixedOffset, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use thiserror::Error;

/// Statement-local condition failure
///
/// Malformed parameters exclude the statement they belong to; they never
/// fail the whole evaluation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConditionError {
    #[error("malformed condition parameters: {0}")]
    Malformed(String),
}

/// One named predicate with typed parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// Timestamp within [start, end) after shifting to the given UTC offset.
    /// `start == end` is an empty window; `start > end` spans midnight.
    TimeWindow {
        start: NaiveTime,
        end: NaiveTime,
        #[serde(default)]
        utc_offset_minutes: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        days: Option<Vec<Weekday>>,
    },
    /// Source IP is one of the listed addresses
    IpAllowlist { ips: Vec<String> },
    /// Derived country code is one of the listed codes
    GeoAllowlist { countries: Vec<String> },
    /// Device classification is not one of the blocked kinds
    DeviceClass { blocked: Vec<DeviceKind> },
    /// Risk score is strictly below the threshold
    RiskBelow { threshold: f64 },
}

/// Result of evaluating one statement's condition set
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionOutcome {
    pub satisfied: bool,
    /// First failing condition, if any
    pub failing: Option<Condition>,
}

impl ConditionOutcome {
    fn satisfied() -> Self {
        ConditionOutcome {
            satisfied: true,
            failing: None,
        }
    }

    fn failed(condition: &Condition) -> Self {
        ConditionOutcome {
            satisfied: false,
            failing: Some(condition.clone()),
        }
    }
}

impl Condition {
    /// Validate static parameters at policy-load time
    pub fn validate(&self) -> Result<(), ConditionError> {
        match self {
            Condition::TimeWindow {
                utc_offset_minutes, ..
            } => {
                // FixedOffset accepts at most +/- 24h
                if utc_offset_minutes.abs() >= 24 * 60 {
                    return Err(ConditionError::Malformed(format!(
                        "utc_offset_minutes out of range: {utc_offset_minutes}"
                    )));
                }
                Ok(())
            }
            Condition::RiskBelow { threshold } => {
                if !threshold.is_finite() {
                    return Err(ConditionError::Malformed(
                        "risk_below threshold must be finite".to_string(),
                    ));
                }
                Ok(())
            }
            Condition::IpAllowlist { ips } => {
                if ips.is_empty() {
                    return Err(ConditionError::Malformed(
                        "ip_allowlist must not be empty".to_string(),
                    ));
                }
                Ok(())
            }
            Condition::GeoAllowlist { countries } => {
                if countries.is_empty() {
                    return Err(ConditionError::Malformed(
                        "geo_allowlist must not be empty".to_string(),
                    ));
                }
                Ok(())
            }
            Condition::DeviceClass { .. } => Ok(()),
        }
    }

    /// Evaluate this condition against a context
    pub fn evaluate(&self, context: &RequestContext) -> Result<bool, ConditionError> {
        match self {
            Condition::TimeWindow {
                start,
                end,
                utc_offset_minutes,
                days,
            } => {
                let offset = FixedOffset::east_opt(utc_offset_minutes * 60).ok_or_else(|| {
                    ConditionError::Malformed(format!(
                        "utc_offset_minutes out of range: {utc_offset_minutes}"
                    ))
                })?;
                let local = context.timestamp.with_timezone(&offset);
                if let Some(days) = days {
                    if !days.contains(&local.weekday()) {
                        return Ok(false);
                    }
                }
                let t = local.time();
                Ok(if start <= end {
                    // [start, end); start == end is an empty window
                    *start <= t && t < *end
                } else {
                    // Overnight window, e.g. 22:00-06:00
                    t >= *start || t < *end
                })
            }
            Condition::IpAllowlist { ips } => {
                // Unparseable context IP is never satisfied; unparseable
                // allowlist entries are skipped so one typo does not take
                // down the statement.
                let source: IpAddr = match context.source_ip.as_deref().map(str::parse) {
                    Some(Ok(ip)) => ip,
                    _ => return Ok(false),
                };
                Ok(ips.iter().any(|entry| match entry.parse::<IpAddr>() {
                    Ok(allowed) => allowed == source,
                    Err(_) => {
                        tracing::warn!(entry = %entry, "skipping unparseable ip_allowlist entry");
                        false
                    }
                }))
            }
            Condition::GeoAllowlist { countries } => Ok(match &context.country {
                Some(country) => countries.iter().any(|c| c.eq_ignore_ascii_case(country)),
                None => false,
            }),
            Condition::DeviceClass { blocked } => Ok(!blocked.contains(&context.device)),
            Condition::RiskBelow { threshold } => {
                if !threshold.is_finite() {
                    return Err(ConditionError::Malformed(
                        "risk_below threshold must be finite".to_string(),
                    ));
                }
                // Missing risk score is fail-closed.
                Ok(match context.risk_score {
                    Some(score) => score < *threshold,
                    None => false,
                })
            }
        }
    }
}

/// Evaluate a statement's conditions (AND semantics)
///
/// An empty set is unconditionally satisfied. The first malformed condition
/// aborts evaluation of this set with an error; the engine treats that as
/// the statement being excluded.
pub fn evaluate_all(
    conditions: &[Condition],
    context: &RequestContext,
) -> Result<ConditionOutcome, ConditionError> {
    for condition in conditions {
        if !condition.evaluate(context)? {
            return Ok(ConditionOutcome::failed(condition));
        }
    }
    Ok(ConditionOutcome::satisfied())
}
