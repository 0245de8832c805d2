//! Pattern matching for action and resource strings
//!
//! Patterns are colon-separated segments with an optional trailing `*`:
//! - `pipeline:123` matches only the exact string
//! - `pipeline:*` matches `pipeline:123`, `pipeline:123:runs`, ...
//! - `*` matches everything
//!
//! Matching is explicit segment comparison, never regex, so its cost and
//! security behavior stay predictable.

use crate::error::{Result, SamError};

/// Matcher for action/resource patterns
pub struct PatternMatcher;

impl PatternMatcher {
    /// Check if a value matches a pattern
    ///
    /// # Examples
    /// ```
    /// use sam_engine::PatternMatcher;
    ///
    /// assert!(PatternMatcher::matches("pipeline:*", "pipeline:123"));
    /// assert!(PatternMatcher::matches("pipeline:123", "pipeline:123"));
    /// assert!(!PatternMatcher::matches("pipeline:*", "workspace:123"));
    /// ```
    pub fn matches(pattern: &str, value: &str) -> bool {
        let pattern_parts: Vec<&str> = pattern.split(':').collect();
        let value_parts: Vec<&str> = value.split(':').collect();

        for (i, pat) in pattern_parts.iter().enumerate() {
            if *pat == "*" && i == pattern_parts.len() - 1 {
                // Trailing wildcard matches any remaining suffix, including
                // further segments. The wildcard position itself must exist
                // in the value: `pipeline:*` does not match bare `pipeline`.
                return value_parts.len() >= pattern_parts.len();
            }
            match value_parts.get(i) {
                Some(val) if val == pat => continue,
                _ => return false,
            }
        }

        // All pattern segments were literals; value must not have extras.
        pattern_parts.len() == value_parts.len()
    }

    /// Validate a pattern at policy-load time
    ///
    /// A `*` segment is only legal as the final segment. Rejecting interior
    /// wildcards here keeps evaluation-time matching a straight segment walk.
    pub fn validate(pattern: &str) -> Result<()> {
        if pattern.is_empty() {
            return Err(SamError::InvalidPattern(pattern.to_string()));
        }
        let parts: Vec<&str> = pattern.split(':').collect();
        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() {
                return Err(SamError::InvalidPattern(pattern.to_string()));
            }
            if part.contains('*') && (*part != "*" || i != parts.len() - 1) {
                return Err(SamError::InvalidPattern(pattern.to_string()));
            }
        }
        Ok(())
    }
}
