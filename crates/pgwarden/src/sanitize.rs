//! Result sanitization.
//!
//! Ordered regex substitution over every string leaf of a result set.
//! Rules apply top to bottom, so later rules see the replacements made by
//! earlier ones. Only strings are rewritten: numbers, booleans, and
//! arbitrary-precision number tokens pass through untouched, which keeps
//! numeric cells bit-exact through the pipeline.

use regex::Regex;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::{GatewayError, Result};

/// One sanitization rule.
///
/// `replacement` may reference capture groups with `${1}` or `${name}`.
#[derive(Debug, Clone, Deserialize)]
pub struct SanitizeRule {
    pub pattern: String,
    pub replacement: String,
    /// Free-text description carried for operator documentation.
    #[serde(default)]
    pub description: String,
}

struct CompiledSanitizeRule {
    pattern: Regex,
    replacement: String,
}

/// Ordered rule list applied recursively through JSON-shaped values.
pub struct Sanitizer {
    rules: Vec<CompiledSanitizeRule>,
}

impl Sanitizer {
    /// Compiles the rule list; invalid regexes are construction failures.
    pub fn new(rules: &[SanitizeRule]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let pattern = Regex::new(&rule.pattern).map_err(|e| {
                GatewayError::Config(format!(
                    "sanitization pattern '{}' is invalid: {}",
                    rule.pattern, e
                ))
            })?;
            compiled.push(CompiledSanitizeRule {
                pattern,
                replacement: rule.replacement.clone(),
            });
        }
        Ok(Self { rules: compiled })
    }

    /// True when at least one rule is configured.
    pub fn is_active(&self) -> bool {
        !self.rules.is_empty()
    }

    /// Sanitize one value, recursing through objects and arrays.
    pub fn sanitize_value(&self, value: JsonValue) -> JsonValue {
        match value {
            JsonValue::String(s) => JsonValue::String(self.apply_rules(s)),
            JsonValue::Object(map) => JsonValue::Object(
                map.into_iter()
                    .map(|(k, v)| (k, self.sanitize_value(v)))
                    .collect(),
            ),
            JsonValue::Array(items) => JsonValue::Array(
                items.into_iter().map(|v| self.sanitize_value(v)).collect(),
            ),
            // Null, numbers (including arbitrary-precision tokens), bools.
            other => other,
        }
    }

    /// Sanitize every cell of a row set in place.
    pub fn sanitize_rows(&self, rows: Vec<JsonValue>) -> Vec<JsonValue> {
        rows.into_iter().map(|row| self.sanitize_value(row)).collect()
    }

    fn apply_rules(&self, input: String) -> String {
        let mut current = input;
        for rule in &self.rules {
            if let std::borrow::Cow::Owned(replaced) =
                rule.pattern.replace_all(&current, rule.replacement.as_str())
            {
                current = replaced;
            }
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(pattern: &str, replacement: &str) -> SanitizeRule {
        SanitizeRule {
            pattern: pattern.to_string(),
            replacement: replacement.to_string(),
            description: String::new(),
        }
    }

    #[test]
    fn test_phone_number_masking() {
        let sanitizer = Sanitizer::new(&[rule(r"\d{3}-\d{3}-\d{4}", "***-***-****")]).unwrap();
        let out = sanitizer.sanitize_value(json!("call 555-123-4567 today"));
        assert_eq!(out, json!("call ***-***-**** today"));
    }

    #[test]
    fn test_capture_group_replacement() {
        let sanitizer =
            Sanitizer::new(&[rule(r"(\w+)@[\w.]+", "${1}@redacted")]).unwrap();
        let out = sanitizer.sanitize_value(json!("alice@example.com"));
        assert_eq!(out, json!("alice@redacted"));
    }

    #[test]
    fn test_named_capture_group_replacement() {
        let sanitizer =
            Sanitizer::new(&[rule(r"(?P<user>\w+)@[\w.]+", "${user}@redacted")]).unwrap();
        let out = sanitizer.sanitize_value(json!("bob@example.com"));
        assert_eq!(out, json!("bob@redacted"));
    }

    #[test]
    fn test_rules_apply_in_order() {
        // The second rule sees the first rule's output.
        let sanitizer = Sanitizer::new(&[rule("secret", "hidden"), rule("hidden", "gone")])
            .unwrap();
        let out = sanitizer.sanitize_value(json!("secret"));
        assert_eq!(out, json!("gone"));
    }

    #[test]
    fn test_recursion_through_objects_and_arrays() {
        let sanitizer = Sanitizer::new(&[rule(r"\d{3}-\d{3}-\d{4}", "***")]).unwrap();
        let out = sanitizer.sanitize_value(json!({
            "contact": {"phone": "555-123-4567"},
            "history": ["555-999-0000", {"fax": "555-111-2222"}],
        }));
        assert_eq!(
            out,
            json!({
                "contact": {"phone": "***"},
                "history": ["***", {"fax": "***"}],
            })
        );
    }

    #[test]
    fn test_non_strings_untouched() {
        let sanitizer = Sanitizer::new(&[rule(r"\d+", "N")]).unwrap();
        assert_eq!(sanitizer.sanitize_value(json!(5551234567i64)), json!(5551234567i64));
        assert_eq!(sanitizer.sanitize_value(json!(true)), json!(true));
        assert_eq!(sanitizer.sanitize_value(JsonValue::Null), JsonValue::Null);
    }

    #[test]
    fn test_sanitize_rows() {
        let sanitizer = Sanitizer::new(&[rule(r"\d{3}-\d{3}-\d{4}", "***-***-****")]).unwrap();
        let rows = vec![json!({"phone": "555-123-4567"}), json!({"phone": "none"})];
        let out = sanitizer.sanitize_rows(rows);
        assert_eq!(out[0], json!({"phone": "***-***-****"}));
        assert_eq!(out[1], json!({"phone": "none"}));
    }

    #[test]
    fn test_idempotent_when_replacement_does_not_match() {
        let sanitizer = Sanitizer::new(&[rule(r"\d{3}-\d{3}-\d{4}", "***-***-****")]).unwrap();
        let once = sanitizer.sanitize_value(json!("555-123-4567"));
        let twice = sanitizer.sanitize_value(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_invalid_pattern_is_fatal() {
        let err = Sanitizer::new(&[rule("(", "x")]).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn test_is_active() {
        assert!(!Sanitizer::new(&[]).unwrap().is_active());
        assert!(Sanitizer::new(&[rule("x", "y")]).unwrap().is_active());
    }
}
