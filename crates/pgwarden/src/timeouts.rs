//! Per-query timeout selection.
//!
//! Rules are matched against the raw SQL text in declaration order; the
//! first match wins, otherwise the default applies.

use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::{GatewayError, Result};

/// One timeout rule: a regex over the raw SQL and the timeout to apply.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutRule {
    /// Rule name, reported in the pipeline log event when the rule matches.
    pub name: String,
    /// Regex tested against the raw SQL text.
    pub pattern: String,
    /// Timeout applied when the pattern matches. Must be positive.
    pub timeout: Duration,
}

struct CompiledTimeoutRule {
    name: String,
    pattern: Regex,
    timeout: Duration,
}

/// Ordered first-match timeout resolver.
pub struct TimeoutResolver {
    rules: Vec<CompiledTimeoutRule>,
    default_timeout: Duration,
}

impl TimeoutResolver {
    /// Compiles the rule list. Invalid regexes and non-positive timeouts
    /// are construction failures.
    pub fn new(rules: &[TimeoutRule], default_timeout: Duration) -> Result<Self> {
        if default_timeout.is_zero() {
            return Err(GatewayError::Config(
                "default query timeout must be positive".to_string(),
            ));
        }

        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if rule.timeout.is_zero() {
                return Err(GatewayError::Config(format!(
                    "timeout rule '{}' has a non-positive timeout",
                    rule.name
                )));
            }
            let pattern = Regex::new(&rule.pattern).map_err(|e| {
                GatewayError::Config(format!(
                    "timeout rule '{}' has an invalid pattern: {}",
                    rule.name, e
                ))
            })?;
            compiled.push(CompiledTimeoutRule {
                name: rule.name.clone(),
                pattern,
                timeout: rule.timeout,
            });
        }

        Ok(Self {
            rules: compiled,
            default_timeout,
        })
    }

    /// Returns the timeout for a SQL string and the name of the rule that
    /// selected it, or an empty name when the default applies.
    pub fn resolve(&self, sql: &str) -> (Duration, &str) {
        for rule in &self.rules {
            if rule.pattern.is_match(sql) {
                return (rule.timeout, &rule.name);
            }
        }
        (self.default_timeout, "")
    }
}
