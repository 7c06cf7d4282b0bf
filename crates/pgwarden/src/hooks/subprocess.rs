//! Subprocess hook runner.
//!
//! Each hook is an external command spawned directly (no shell) with the
//! current value written to its standard input: the raw SQL for
//! before-hooks, the JSON-serialized result for after-hooks. The command
//! replies on standard output with a single JSON object; standard error is
//! captured and logged. A hook only runs when its regex matches the
//! current input, and the pattern is re-tested after each mutation.
//!
//! The payload never travels through command arguments or the environment.
//! A hook that chooses to invoke a shell internally owns the consequences.

use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::types::QueryOutput;
use crate::{GatewayError, Result};

/// Configuration for one subprocess hook.
#[derive(Debug, Clone, Deserialize)]
pub struct SubprocessHook {
    /// Regex the current input must match for the hook to run.
    pub pattern: String,
    /// Executable path or name, resolved by the operating system.
    pub command: String,
    /// Argument vector passed verbatim; never shell-interpreted.
    #[serde(default)]
    pub args: Vec<String>,
    /// Per-hook timeout; zero falls back to the runner's default.
    #[serde(default)]
    pub timeout: Duration,
}

/// Reply object a before-hook writes to standard output.
#[derive(Debug, Deserialize)]
struct BeforeReply {
    accept: bool,
    #[serde(default)]
    modified_query: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

/// Reply object an after-hook writes to standard output.
/// `modified_result` is a JSON-encoded [`QueryOutput`].
#[derive(Debug, Deserialize)]
struct AfterReply {
    accept: bool,
    #[serde(default)]
    modified_result: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

struct CompiledHook {
    pattern: Regex,
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

/// Middleware chain of subprocess hooks.
pub struct SubprocessHookRunner {
    before: Vec<CompiledHook>,
    after: Vec<CompiledHook>,
    default_timeout: Duration,
}

impl SubprocessHookRunner {
    /// Compiles every hook pattern. Invalid regexes and a missing default
    /// timeout are construction failures.
    pub fn new(
        before: &[SubprocessHook],
        after: &[SubprocessHook],
        default_timeout: Duration,
    ) -> Result<Self> {
        if (!before.is_empty() || !after.is_empty()) && default_timeout.is_zero() {
            return Err(GatewayError::Config(
                "default hook timeout must be positive when hooks are configured".to_string(),
            ));
        }
        Ok(Self {
            before: Self::compile(before)?,
            after: Self::compile(after)?,
            default_timeout,
        })
    }

    fn compile(hooks: &[SubprocessHook]) -> Result<Vec<CompiledHook>> {
        hooks
            .iter()
            .map(|hook| {
                let pattern = Regex::new(&hook.pattern).map_err(|e| {
                    GatewayError::Config(format!(
                        "hook pattern '{}' is invalid (command: {}): {}",
                        hook.pattern, hook.command, e
                    ))
                })?;
                Ok(CompiledHook {
                    pattern,
                    command: hook.command.clone(),
                    args: hook.args.clone(),
                    timeout: hook.timeout,
                })
            })
            .collect()
    }

    pub fn has_after_hooks(&self) -> bool {
        !self.after.is_empty()
    }

    /// Commands of the registered before-hooks, for logging.
    pub fn before_names(&self) -> Vec<&str> {
        self.before.iter().map(|h| h.command.as_str()).collect()
    }

    /// Commands of the registered after-hooks, for logging.
    pub fn after_names(&self) -> Vec<&str> {
        self.after.iter().map(|h| h.command.as_str()).collect()
    }

    /// Run the before chain over the SQL. Hooks whose pattern does not
    /// match the current SQL are skipped.
    pub async fn run_before(&self, sql: String) -> Result<String> {
        let mut current = sql;
        for hook in &self.before {
            if !hook.pattern.is_match(&current) {
                continue;
            }
            let stdout = self.invoke(hook, current.as_bytes(), "before").await?;
            let reply: BeforeReply = serde_json::from_str(&stdout).map_err(|e| {
                GatewayError::Hook(format!(
                    "before_query hook error: hook failed (command: {}): invalid reply: {}",
                    hook.command, e
                ))
            })?;

            if !reply.accept {
                let reason = reply
                    .error_message
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "query rejected by hook".to_string());
                return Err(GatewayError::Hook(format!(
                    "before_query hook error: {}",
                    reason
                )));
            }
            if let Some(modified) = reply.modified_query.filter(|m| !m.is_empty()) {
                debug!(command = %hook.command, "before_query hook rewrote the SQL");
                current = modified;
            }
        }
        Ok(current)
    }

    /// Run the after chain over the result. The result travels as JSON;
    /// decoding preserves arbitrary-precision numbers as opaque tokens.
    pub async fn run_after(&self, output: QueryOutput) -> Result<QueryOutput> {
        let mut current = serde_json::to_string(&output).map_err(|e| {
            GatewayError::Hook(format!(
                "after_query hook error: failed to encode result: {}",
                e
            ))
        })?;

        for hook in &self.after {
            if !hook.pattern.is_match(&current) {
                continue;
            }
            let stdout = self.invoke(hook, current.as_bytes(), "after").await?;
            let reply: AfterReply = serde_json::from_str(&stdout).map_err(|e| {
                GatewayError::Hook(format!(
                    "after_query hook error: hook failed (command: {}): invalid reply: {}",
                    hook.command, e
                ))
            })?;

            if !reply.accept {
                let reason = reply
                    .error_message
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "result rejected by hook".to_string());
                return Err(GatewayError::Hook(format!(
                    "after_query hook error: {}",
                    reason
                )));
            }
            if let Some(modified) = reply.modified_result.filter(|m| !m.is_empty()) {
                debug!(command = %hook.command, "after_query hook rewrote the result");
                current = modified;
            }
        }

        decode_query_output(&current)
    }

    /// Spawn the hook command, deliver the payload on stdin, and collect
    /// stdout within the hook's deadline. The child is killed if the
    /// deadline elapses.
    async fn invoke(&self, hook: &CompiledHook, payload: &[u8], phase: &str) -> Result<String> {
        let timeout = if hook.timeout.is_zero() {
            self.default_timeout
        } else {
            hook.timeout
        };

        let mut child = Command::new(&hook.command)
            .args(&hook.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GatewayError::Hook(format!(
                    "{}_query hook error: hook failed (command: {}): {}",
                    phase, hook.command, e
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(payload).await.map_err(|e| {
                GatewayError::Hook(format!(
                    "{}_query hook error: hook failed (command: {}): {}",
                    phase, hook.command, e
                ))
            })?;
            // Close stdin so the hook sees EOF.
            drop(stdin);
        }

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Err(_) => {
                return Err(GatewayError::Hook(format!(
                    "{}_query hook error: hook timed out: {}",
                    phase, hook.command
                )));
            }
            Ok(Err(e)) => {
                return Err(GatewayError::Hook(format!(
                    "{}_query hook error: hook failed (command: {}): {}",
                    phase, hook.command, e
                )));
            }
            Ok(Ok(output)) => output,
        };

        if !output.stderr.is_empty() {
            warn!(
                command = %hook.command,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "hook wrote to stderr"
            );
        }

        if !output.status.success() {
            return Err(GatewayError::Hook(format!(
                "{}_query hook error: hook failed (command: {}): {}",
                phase, hook.command, output.status
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Decode a JSON-encoded [`QueryOutput`] without losing numeric precision.
///
/// serde_json is built with `arbitrary_precision`, so numbers materialize
/// as opaque tokens instead of being forced through an IEEE-754 double;
/// a bigint column survives the subprocess round-trip bit-exact.
pub fn decode_query_output(json: &str) -> Result<QueryOutput> {
    serde_json::from_str(json).map_err(|e| {
        GatewayError::Hook(format!(
            "after_query hook error: failed to decode modified result: {}",
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook(pattern: &str, command: &str, args: &[&str], timeout_ms: u64) -> SubprocessHook {
        SubprocessHook {
            pattern: pattern.to_string(),
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    fn runner(before: Vec<SubprocessHook>, after: Vec<SubprocessHook>) -> SubprocessHookRunner {
        SubprocessHookRunner::new(&before, &after, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_accepting_hook_leaves_sql_unchanged() {
        let runner = runner(vec![hook(".*", "echo", &[r#"{"accept": true}"#], 0)], vec![]);
        let out = runner.run_before("SELECT 1".to_string()).await.unwrap();
        assert_eq!(out, "SELECT 1");
    }

    #[tokio::test]
    async fn test_hook_rewrites_sql() {
        let reply = r#"{"accept": true, "modified_query": "SELECT 2"}"#;
        let runner = runner(vec![hook(".*", "echo", &[reply], 0)], vec![]);
        let out = runner.run_before("SELECT 1".to_string()).await.unwrap();
        assert_eq!(out, "SELECT 2");
    }

    #[tokio::test]
    async fn test_hook_rejects_with_message() {
        let reply = r#"{"accept": false, "error_message": "writes are frozen"}"#;
        let runner = runner(vec![hook(".*", "echo", &[reply], 0)], vec![]);
        let err = runner.run_before("SELECT 1".to_string()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "before_query hook error: writes are frozen"
        );
    }

    #[tokio::test]
    async fn test_hook_rejects_with_default_message() {
        let reply = r#"{"accept": false}"#;
        let runner = runner(vec![hook(".*", "echo", &[reply], 0)], vec![]);
        let err = runner.run_before("SELECT 1".to_string()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "before_query hook error: query rejected by hook"
        );
    }

    #[tokio::test]
    async fn test_non_matching_pattern_skips_hook() {
        // The command would fail if it ever ran.
        let runner = runner(vec![hook("^DROP", "false", &[], 0)], vec![]);
        let out = runner.run_before("SELECT 1".to_string()).await.unwrap();
        assert_eq!(out, "SELECT 1");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_hook_failure() {
        let runner = runner(vec![hook(".*", "false", &[], 0)], vec![]);
        let err = runner.run_before("SELECT 1".to_string()).await.unwrap_err();
        let msg = err.to_string();
        assert!(
            msg.starts_with("before_query hook error: hook failed (command: false)"),
            "unexpected: {msg}"
        );
    }

    #[tokio::test]
    async fn test_unparseable_reply_is_hook_failure() {
        let runner = runner(vec![hook(".*", "echo", &["not json"], 0)], vec![]);
        let err = runner.run_before("SELECT 1".to_string()).await.unwrap_err();
        assert!(err.to_string().contains("invalid reply"));
    }

    #[tokio::test]
    async fn test_timeout_kills_hook() {
        let runner = runner(vec![hook(".*", "sleep", &["30"], 50)], vec![]);
        let err = runner.run_before("SELECT 1".to_string()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "before_query hook error: hook timed out: sleep"
        );
    }

    #[tokio::test]
    async fn test_after_hook_passthrough_round_trips() {
        let runner = runner(vec![], vec![hook(".*", "echo", &[r#"{"accept": true}"#], 0)]);
        let mut row = serde_json::Map::new();
        row.insert("n".to_string(), serde_json::json!(1));
        let output = QueryOutput {
            columns: vec!["n".to_string()],
            rows: Some(vec![row]),
            rows_affected: 1,
            error: String::new(),
        };
        let out = runner.run_after(output.clone()).await.unwrap();
        assert_eq!(out, output);
    }

    #[tokio::test]
    async fn test_after_hook_rejection() {
        let reply = r#"{"accept": false, "error_message": "result blocked"}"#;
        let runner = runner(vec![], vec![hook(".*", "echo", &[reply], 0)]);
        let err = runner.run_after(QueryOutput::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "after_query hook error: result blocked");
    }

    #[test]
    fn test_invalid_pattern_is_fatal() {
        let err =
            SubprocessHookRunner::new(&[hook("(", "true", &[], 0)], &[], Duration::from_secs(1))
                .unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn test_missing_default_timeout_is_fatal() {
        let err = SubprocessHookRunner::new(&[hook(".*", "true", &[], 0)], &[], Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn test_decode_preserves_large_integers() {
        let big = "9007199254740993123456789";
        let json = format!(
            r#"{{"columns":["n"],"rows":[{{"n":{big}}}],"rows_affected":1,"error":""}}"#
        );
        let output = decode_query_output(&json).unwrap();
        let rows = output.rows.unwrap();
        let encoded = serde_json::to_string(&rows[0]["n"]).unwrap();
        assert_eq!(encoded, big);
    }
}
