//! Error-prompt steering.
//!
//! When a query fails, every rule whose pattern matches the error text
//! contributes its message; the concatenation is appended to the error the
//! caller sees, steering the agent toward a fix (add a LIMIT, narrow the
//! WHERE clause, and so on).

use regex::Regex;
use serde::Deserialize;

use crate::{GatewayError, Result};

/// One steering rule: a regex over the error text and the message to add.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorPromptRule {
    pub pattern: String,
    pub message: String,
}

struct CompiledPromptRule {
    source: String,
    pattern: Regex,
    message: String,
}

/// Ordered error-prompt matcher.
pub struct ErrorPromptMatcher {
    rules: Vec<CompiledPromptRule>,
}

impl ErrorPromptMatcher {
    /// Compiles the rule list; invalid regexes are construction failures.
    pub fn new(rules: &[ErrorPromptRule]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let pattern = Regex::new(&rule.pattern).map_err(|e| {
                GatewayError::Config(format!(
                    "error prompt pattern '{}' is invalid: {}",
                    rule.pattern, e
                ))
            })?;
            compiled.push(CompiledPromptRule {
                source: rule.pattern.clone(),
                pattern,
                message: rule.message.clone(),
            });
        }
        Ok(Self { rules: compiled })
    }

    /// Concatenated messages of every matching rule in declaration order,
    /// newline-separated, with no trailing newline. Empty when nothing
    /// matches.
    pub fn prompt_for(&self, error: &str) -> String {
        let mut messages = Vec::new();
        for rule in &self.rules {
            if rule.pattern.is_match(error) {
                messages.push(rule.message.as_str());
            }
        }
        messages.join("\n")
    }

    /// The patterns that matched, used for logging.
    pub fn matched_patterns(&self, error: &str) -> Vec<&str> {
        self.rules
            .iter()
            .filter(|rule| rule.pattern.is_match(error))
            .map(|rule| rule.source.as_str())
            .collect()
    }
}
