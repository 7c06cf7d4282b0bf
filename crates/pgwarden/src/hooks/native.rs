//! In-process hook runner.
//!
//! Hooks are typed async callbacks chained in registration order; each
//! step's output feeds the next. There is no pattern gating here: every
//! hook runs for every call and the callback itself decides whether to
//! act. Values stay native through the chain, so numeric precision is
//! never lost to a serialization round-trip.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use crate::types::QueryOutput;
use crate::{GatewayError, Result};

/// Before-hook callable: current SQL in, replacement SQL out, or a
/// rejection message.
pub type BeforeHookFn =
    Arc<dyn Fn(String) -> BoxFuture<'static, std::result::Result<String, String>> + Send + Sync>;

/// After-hook callable: current result in, replacement result out, or a
/// rejection message.
pub type AfterHookFn = Arc<
    dyn Fn(QueryOutput) -> BoxFuture<'static, std::result::Result<QueryOutput, String>>
        + Send
        + Sync,
>;

/// One registered in-process hook.
#[derive(Clone)]
pub struct NativeHook<F> {
    pub name: String,
    /// Per-hook timeout; zero falls back to the runner's default.
    pub timeout: Duration,
    pub callback: F,
}

impl<F> NativeHook<F> {
    pub fn new(name: impl Into<String>, timeout: Duration, callback: F) -> Self {
        Self {
            name: name.into(),
            timeout,
            callback,
        }
    }
}

/// Middleware chain of in-process hooks.
pub struct NativeHookRunner {
    before: Vec<NativeHook<BeforeHookFn>>,
    after: Vec<NativeHook<AfterHookFn>>,
    default_timeout: Duration,
}

impl NativeHookRunner {
    pub fn new(
        before: Vec<NativeHook<BeforeHookFn>>,
        after: Vec<NativeHook<AfterHookFn>>,
        default_timeout: Duration,
    ) -> Result<Self> {
        if (!before.is_empty() || !after.is_empty()) && default_timeout.is_zero() {
            return Err(GatewayError::Config(
                "default hook timeout must be positive when hooks are configured".to_string(),
            ));
        }
        Ok(Self {
            before,
            after,
            default_timeout,
        })
    }

    pub fn has_after_hooks(&self) -> bool {
        !self.after.is_empty()
    }

    /// Names of the registered before-hooks, for logging.
    pub fn before_names(&self) -> Vec<&str> {
        self.before.iter().map(|h| h.name.as_str()).collect()
    }

    /// Names of the registered after-hooks, for logging.
    pub fn after_names(&self) -> Vec<&str> {
        self.after.iter().map(|h| h.name.as_str()).collect()
    }

    /// Run every before-hook over the SQL, in order.
    pub async fn run_before(&self, sql: String) -> Result<String> {
        let mut current = sql;
        for hook in &self.before {
            let timeout = self.effective_timeout(hook.timeout);
            debug!(hook = %hook.name, "running before_query hook");
            match tokio::time::timeout(timeout, (hook.callback)(current.clone())).await {
                Err(_) => {
                    return Err(GatewayError::Hook(format!(
                        "before_query hook error: hook timed out (name: {}, timeout: {:?})",
                        hook.name, timeout
                    )));
                }
                Ok(Err(reason)) => {
                    return Err(GatewayError::Hook(format!(
                        "before_query hook error: hook rejected query (name: {}): {}",
                        hook.name, reason
                    )));
                }
                Ok(Ok(next)) => current = next,
            }
        }
        Ok(current)
    }

    /// Run every after-hook over the result, in order.
    pub async fn run_after(&self, output: QueryOutput) -> Result<QueryOutput> {
        let mut current = output;
        for hook in &self.after {
            let timeout = self.effective_timeout(hook.timeout);
            debug!(hook = %hook.name, "running after_query hook");
            match tokio::time::timeout(timeout, (hook.callback)(current.clone())).await {
                Err(_) => {
                    return Err(GatewayError::Hook(format!(
                        "after_query hook error: hook timed out (name: {}, timeout: {:?})",
                        hook.name, timeout
                    )));
                }
                Ok(Err(reason)) => {
                    return Err(GatewayError::Hook(format!(
                        "after_query hook error: hook rejected result (name: {}): {}",
                        hook.name, reason
                    )));
                }
                Ok(Ok(next)) => current = next,
            }
        }
        Ok(current)
    }

    fn effective_timeout(&self, per_hook: Duration) -> Duration {
        if per_hook.is_zero() {
            self.default_timeout
        } else {
            per_hook
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn before_hook(
        name: &str,
        timeout: Duration,
        f: impl Fn(String) -> std::result::Result<String, String> + Send + Sync + 'static,
    ) -> NativeHook<BeforeHookFn> {
        let f = Arc::new(f);
        NativeHook::new(
            name,
            timeout,
            Arc::new(move |sql: String| {
                let f = Arc::clone(&f);
                Box::pin(async move { f(sql) }) as BoxFuture<'static, _>
            }) as BeforeHookFn,
        )
    }

    fn runner(before: Vec<NativeHook<BeforeHookFn>>) -> NativeHookRunner {
        NativeHookRunner::new(before, Vec::new(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_before_hooks_chain_in_order() {
        let hooks = vec![
            before_hook("comment", Duration::ZERO, |sql| {
                Ok(format!("/* audited */ {sql}"))
            }),
            before_hook("upper", Duration::ZERO, |sql| Ok(sql.to_uppercase())),
        ];
        let out = runner(hooks).run_before("select 1".to_string()).await.unwrap();
        assert_eq!(out, "/* AUDITED */ SELECT 1");
    }

    #[tokio::test]
    async fn test_before_hook_rejection_stops_chain() {
        let hooks = vec![
            before_hook("deny", Duration::ZERO, |_| Err("policy says no".to_string())),
            before_hook("never", Duration::ZERO, |_| {
                panic!("must not run after a rejection")
            }),
        ];
        let err = runner(hooks)
            .run_before("SELECT 1".to_string())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "before_query hook error: hook rejected query (name: deny): policy says no"
        );
    }

    #[tokio::test]
    async fn test_before_hook_timeout() {
        let slow: BeforeHookFn = Arc::new(|sql: String| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(sql)
            })
        });
        let runner = NativeHookRunner::new(
            vec![NativeHook::new("slow", Duration::from_millis(20), slow)],
            Vec::new(),
            Duration::from_secs(5),
        )
        .unwrap();

        let err = runner.run_before("SELECT 1".to_string()).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("before_query hook error: hook timed out (name: slow"));
    }

    #[tokio::test]
    async fn test_after_hook_mutates_result() {
        let mask: AfterHookFn = Arc::new(|mut output: QueryOutput| {
            Box::pin(async move {
                output.error = "masked".to_string();
                Ok(output)
            })
        });
        let runner = NativeHookRunner::new(
            Vec::new(),
            vec![NativeHook::new("mask", Duration::ZERO, mask)],
            Duration::from_secs(5),
        )
        .unwrap();

        let out = runner.run_after(QueryOutput::default()).await.unwrap();
        assert_eq!(out.error, "masked");
    }

    #[tokio::test]
    async fn test_after_hook_rejection_message() {
        let deny: AfterHookFn =
            Arc::new(|_| Box::pin(async move { Err("too many rows".to_string()) }));
        let runner = NativeHookRunner::new(
            Vec::new(),
            vec![NativeHook::new("deny", Duration::ZERO, deny)],
            Duration::from_secs(5),
        )
        .unwrap();

        let err = runner.run_after(QueryOutput::default()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "after_query hook error: hook rejected result (name: deny): too many rows"
        );
    }

    #[test]
    fn test_missing_default_timeout_is_fatal() {
        let hooks = vec![before_hook("x", Duration::ZERO, Ok)];
        let err = NativeHookRunner::new(hooks, Vec::new(), Duration::ZERO).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn test_hook_names_for_logging() {
        let hooks = vec![
            before_hook("first", Duration::ZERO, Ok),
            before_hook("second", Duration::ZERO, Ok),
        ];
        let runner = runner(hooks);
        assert_eq!(runner.before_names(), vec!["first", "second"]);
        assert!(runner.after_names().is_empty());
    }
}
