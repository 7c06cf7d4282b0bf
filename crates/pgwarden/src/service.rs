//! The gateway service and its query pipeline.
//!
//! [`Gateway`] owns every long-lived component: the connection pool, the
//! admission semaphore, the protection checker, the rule engines, and the
//! hook runner. Each query travels a fixed pipeline:
//!
//! ```text
//! acquire slot -> length gate -> before-hooks -> parse+protect ->
//! resolve timeout -> begin tx -> execute -> collect ->
//! (read: rollback) -> after-hooks -> (write: commit) ->
//! sanitize -> truncate -> error prompts -> log -> release slot
//! ```
//!
//! The semaphore has exactly as many permits as the pool has connections,
//! so hook subprocesses and queries alike are bounded end-to-end and no
//! two in-flight calls ever contend on a pool acquire.
//!
//! Failures anywhere in the chain short-circuit to an error output, which
//! still passes through truncation, error-prompt augmentation, and logging
//! so every response is shaped uniformly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::TryStreamExt;
use serde_json::{Map as JsonMap, Value as JsonValue};
use sqlx::postgres::PgRow;
use sqlx::{Column, Either, Postgres, Row as SqlxRow, Transaction};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::connection::{Connection, PoolConfig, SessionSetup};
use crate::guard::{is_read_only_statement, Guard, GuardPolicy};
use crate::hooks::native::{AfterHookFn, BeforeHookFn, NativeHook, NativeHookRunner};
use crate::hooks::subprocess::{SubprocessHook, SubprocessHookRunner};
use crate::prompts::{ErrorPromptMatcher, ErrorPromptRule};
use crate::sanitize::{SanitizeRule, Sanitizer};
use crate::schema::{SchemaInspector, TableDescription, TableEntry};
use crate::timeouts::{TimeoutResolver, TimeoutRule};
use crate::types::{row_to_json, QueryInput, QueryOutput};
use crate::{GatewayError, Result};

/// Hook registrations. The in-process and subprocess transports are
/// mutually exclusive; configuring both is a construction error.
#[derive(Default)]
pub struct HookSettings {
    pub native_before: Vec<NativeHook<BeforeHookFn>>,
    pub native_after: Vec<NativeHook<AfterHookFn>>,
    pub subprocess_before: Vec<SubprocessHook>,
    pub subprocess_after: Vec<SubprocessHook>,
}

impl HookSettings {
    fn has_native(&self) -> bool {
        !self.native_before.is_empty() || !self.native_after.is_empty()
    }

    fn has_subprocess(&self) -> bool {
        !self.subprocess_before.is_empty() || !self.subprocess_after.is_empty()
    }
}

/// Everything the gateway needs at construction. The surrounding CLI
/// layer fills this in from its configuration file.
pub struct GatewayConfig {
    pub database_url: String,
    pub pool: PoolConfig,
    pub policy: GuardPolicy,
    pub timeout_rules: Vec<TimeoutRule>,
    pub default_query_timeout: Duration,
    pub sanitize_rules: Vec<SanitizeRule>,
    pub error_prompt_rules: Vec<ErrorPromptRule>,
    pub hooks: HookSettings,
    pub default_hook_timeout: Duration,
    /// Maximum accepted SQL length in bytes.
    pub max_sql_length: usize,
    /// Maximum serialized result length in characters before truncation.
    pub max_result_chars: usize,
    pub list_tables_timeout: Duration,
    pub describe_table_timeout: Duration,
    /// Pipeline executions slower than this log at warn level.
    pub slow_query_threshold: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            pool: PoolConfig::default(),
            policy: GuardPolicy::default(),
            timeout_rules: Vec::new(),
            default_query_timeout: Duration::from_secs(30),
            sanitize_rules: Vec::new(),
            error_prompt_rules: Vec::new(),
            hooks: HookSettings::default(),
            default_hook_timeout: Duration::from_secs(30),
            max_sql_length: 100_000,
            max_result_chars: 100_000,
            list_tables_timeout: Duration::from_secs(30),
            describe_table_timeout: Duration::from_secs(30),
            slow_query_threshold: Duration::from_secs(1),
        }
    }
}

enum HookRunner {
    None,
    Native(NativeHookRunner),
    Subprocess(SubprocessHookRunner),
}

impl HookRunner {
    fn before_names(&self) -> Vec<&str> {
        match self {
            HookRunner::None => Vec::new(),
            HookRunner::Native(r) => r.before_names(),
            HookRunner::Subprocess(r) => r.before_names(),
        }
    }

    fn after_names(&self) -> Vec<&str> {
        match self {
            HookRunner::None => Vec::new(),
            HookRunner::Native(r) => r.after_names(),
            HookRunner::Subprocess(r) => r.after_names(),
        }
    }
}

/// The guarded PostgreSQL gateway.
///
/// All internal state is immutable after construction; the service is
/// safe to share across tasks behind an `Arc`.
pub struct Gateway {
    conn: Connection,
    semaphore: Arc<Semaphore>,
    max_connections: u32,
    guard: Guard,
    timeouts: TimeoutResolver,
    sanitizer: Sanitizer,
    prompts: ErrorPromptMatcher,
    hooks: HookRunner,
    inspector: SchemaInspector,
    max_sql_length: usize,
    max_result_chars: usize,
    list_tables_timeout: Duration,
    describe_table_timeout: Duration,
    slow_query_threshold: Duration,
}

impl Gateway {
    /// Validates the configuration, compiles every rule, connects the
    /// pool, and returns a ready gateway. Any invalid configuration is
    /// fatal here; nothing is re-validated per call.
    pub async fn connect(config: GatewayConfig) -> Result<Self> {
        let hooks = Self::build_hooks(&config)?;
        let guard = Guard::new(config.policy.clone());
        let timeouts = TimeoutResolver::new(&config.timeout_rules, config.default_query_timeout)?;
        let sanitizer = Sanitizer::new(&config.sanitize_rules)?;
        let prompts = ErrorPromptMatcher::new(&config.error_prompt_rules)?;

        let session = SessionSetup {
            read_only: config.policy.read_only,
            timezone: config.policy.timezone.clone(),
        };
        let conn = Connection::new(&config.database_url, config.pool.clone(), session).await?;
        let inspector = SchemaInspector::new(conn.clone());

        let max_connections = config.pool.max_connections;
        Ok(Self {
            conn,
            semaphore: Arc::new(Semaphore::new(max_connections as usize)),
            max_connections,
            guard,
            timeouts,
            sanitizer,
            prompts,
            hooks,
            inspector,
            max_sql_length: config.max_sql_length,
            max_result_chars: config.max_result_chars,
            list_tables_timeout: config.list_tables_timeout,
            describe_table_timeout: config.describe_table_timeout,
            slow_query_threshold: config.slow_query_threshold,
        })
    }

    fn build_hooks(config: &GatewayConfig) -> Result<HookRunner> {
        let settings = &config.hooks;
        if settings.has_native() && settings.has_subprocess() {
            return Err(GatewayError::Config(
                "in-process and subprocess hook runners are mutually exclusive".to_string(),
            ));
        }
        if settings.has_native() {
            let runner = NativeHookRunner::new(
                settings.native_before.clone(),
                settings.native_after.clone(),
                config.default_hook_timeout,
            )?;
            return Ok(HookRunner::Native(runner));
        }
        if settings.has_subprocess() {
            let runner = SubprocessHookRunner::new(
                &settings.subprocess_before,
                &settings.subprocess_after,
                config.default_hook_timeout,
            )?;
            return Ok(HookRunner::Subprocess(runner));
        }
        Ok(HookRunner::None)
    }

    /// The underlying connection, for diagnostics.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Closes the connection pool.
    pub async fn close(&self) {
        self.conn.close().await;
    }

    /// Execute one SQL statement through the full pipeline.
    ///
    /// Errors are carried in-band: the returned output's `error` field is
    /// non-empty and `rows` is absent. The call holds one admission permit
    /// from start to finish.
    #[instrument(skip(self, ctx, input), fields(sql_preview = %input.sql.chars().take(100).collect::<String>()))]
    pub async fn query(&self, ctx: &CancellationToken, input: QueryInput) -> QueryOutput {
        let started = Instant::now();

        let _permit = match self.acquire_slot(ctx).await {
            Ok(permit) => permit,
            Err(e) => return self.finish(&input.sql, started, Err(e), String::new()),
        };

        let mut timeout_rule = String::new();
        let result = self.run_pipeline(ctx, &input.sql, &mut timeout_rule).await;
        self.finish(&input.sql, started, result, timeout_rule)
    }

    /// List every table-like object visible to the current role.
    ///
    /// Introspection bypasses the protection checker, hooks, sanitizer,
    /// and error prompts; infrastructure failures surface as `Err`.
    pub async fn list_tables(&self, ctx: &CancellationToken) -> Result<Vec<TableEntry>> {
        let _permit = self.acquire_slot(ctx).await?;
        self.with_deadline(ctx, self.list_tables_timeout, "list_tables", async {
            self.inspector.list_tables().await
        })
        .await
    }

    /// Describe one relation by schema and name.
    pub async fn describe_table(
        &self,
        ctx: &CancellationToken,
        schema: &str,
        name: &str,
    ) -> Result<TableDescription> {
        let _permit = self.acquire_slot(ctx).await?;
        self.with_deadline(ctx, self.describe_table_timeout, "describe_table", async {
            self.inspector.describe_table(schema, name).await
        })
        .await
    }

    /// Steps 2-13: everything that can short-circuit with an error before
    /// result shaping. Returns the raw output before sanitization.
    async fn run_pipeline(
        &self,
        ctx: &CancellationToken,
        sql: &str,
        timeout_rule: &mut String,
    ) -> Result<QueryOutput> {
        // Step 2: length gate. No hooks run for an over-long query.
        if sql.len() > self.max_sql_length {
            return Err(GatewayError::Rejected(format!(
                "SQL query too long: {} bytes exceeds maximum of {} bytes",
                sql.len(),
                self.max_sql_length
            )));
        }

        // Step 3: before-hooks may rewrite or reject the SQL.
        let sql = match &self.hooks {
            HookRunner::None => sql.to_string(),
            HookRunner::Native(runner) => runner.run_before(sql.to_string()).await?,
            HookRunner::Subprocess(runner) => runner.run_before(sql.to_string()).await?,
        };

        // Step 4: parse and check the (possibly rewritten) SQL.
        self.guard.check(&sql)?;

        // Step 5: pick the query timeout.
        let (timeout, rule) = self.timeouts.resolve(&sql);
        *timeout_rule = rule.to_string();

        // Steps 6-13 run under the query deadline. Dropping the future on
        // timeout or caller cancellation aborts the transaction; SQLx then
        // rolls it back on the connection's way home to the pool, outside
        // the expired deadline.
        let execute = async {
            let mut tx = self.conn.pool().begin().await?;
            let (columns, rows, rows_affected) = collect_result(&mut tx, &sql).await?;

            // Step 10: classify; read paths roll back before after-hooks
            // so hooks can inspect but never persist anything.
            let read_only = is_read_only_statement(&sql);
            if read_only {
                tx.rollback().await?;
            }

            let output = QueryOutput {
                columns,
                rows: Some(rows),
                rows_affected,
                error: String::new(),
            };

            // Step 12: after-hooks may mutate or reject the result. On the
            // write path a rejection drops the transaction uncommitted.
            let output = match &self.hooks {
                HookRunner::None => output,
                HookRunner::Native(runner) => runner.run_after(output).await?,
                HookRunner::Subprocess(runner) if runner.has_after_hooks() => {
                    runner.run_after(output).await?
                }
                HookRunner::Subprocess(_) => output,
            };

            // Step 13: commit writes only after the hooks approve.
            if !read_only {
                tx.commit().await?;
            }
            Ok(output)
        };

        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(GatewayError::Timeout(
                "query cancelled by caller; transaction rolled back".to_string(),
            )),
            result = tokio::time::timeout(timeout, execute) => match result {
                Err(_) => Err(GatewayError::Timeout(format!(
                    "query timed out after {:?}; transaction rolled back",
                    timeout
                ))),
                Ok(output) => output,
            },
        }
    }

    /// Steps 14-17: sanitize, truncate, augment, log. Runs for success and
    /// failure alike so every output is shaped the same way.
    fn finish(
        &self,
        sql: &str,
        started: Instant,
        result: Result<QueryOutput>,
        timeout_rule: String,
    ) -> QueryOutput {
        let mut output = match result {
            Ok(output) => output,
            Err(e) => QueryOutput::from_error(e.to_string()),
        };

        // Step 14: sanitize every cell.
        let mut sanitized = false;
        if self.sanitizer.is_active() {
            if let Some(rows) = output.rows.take() {
                sanitized = true;
                output.rows = Some(
                    rows.into_iter()
                        .map(|row| {
                            row.into_iter()
                                .map(|(k, v)| (k, self.sanitizer.sanitize_value(v)))
                                .collect()
                        })
                        .collect(),
                );
            }
        }

        // Step 15: truncate oversized results.
        apply_truncation(&mut output, self.max_result_chars);

        // Step 16: steer the agent on errors.
        let mut matched_prompts: Vec<String> = Vec::new();
        if !output.error.is_empty() {
            matched_prompts = self
                .prompts
                .matched_patterns(&output.error)
                .into_iter()
                .map(str::to_string)
                .collect();
            let prompt = self.prompts.prompt_for(&output.error);
            if !prompt.is_empty() {
                output.error = format!("{}\n\n{}", output.error, prompt);
            }
        }

        // Step 17: one structured event per call.
        let elapsed = started.elapsed();
        let sql_preview: String = sql.chars().take(200).collect();
        let row_count = output.rows.as_ref().map(|r| r.len()).unwrap_or(0);
        if output.error.is_empty() {
            if elapsed >= self.slow_query_threshold {
                warn!(
                    sql = %sql_preview,
                    elapsed_ms = elapsed.as_millis() as u64,
                    rows = row_count,
                    rows_affected = output.rows_affected,
                    before_hooks = ?self.hooks.before_names(),
                    after_hooks = ?self.hooks.after_names(),
                    timeout_rule = %timeout_rule,
                    sanitized = sanitized,
                    "Slow query completed"
                );
            } else {
                info!(
                    sql = %sql_preview,
                    elapsed_ms = elapsed.as_millis() as u64,
                    rows = row_count,
                    rows_affected = output.rows_affected,
                    before_hooks = ?self.hooks.before_names(),
                    after_hooks = ?self.hooks.after_names(),
                    timeout_rule = %timeout_rule,
                    sanitized = sanitized,
                    "Query completed"
                );
            }
        } else {
            error!(
                sql = %sql_preview,
                elapsed_ms = elapsed.as_millis() as u64,
                error = %output.error,
                matched_prompts = ?matched_prompts,
                "Query failed"
            );
        }

        output
    }

    /// Step 1: take one admission permit, honoring caller cancellation.
    async fn acquire_slot(&self, ctx: &CancellationToken) -> Result<SemaphorePermit<'_>> {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(GatewayError::Timeout(format!(
                "failed to acquire query slot: all {} connection slots are in use, \
                 context cancelled while waiting: operation cancelled",
                self.max_connections
            ))),
            permit = self.semaphore.acquire() => {
                debug!(available = self.semaphore.available_permits(), "acquired query slot");
                permit.map_err(|_| GatewayError::Internal("admission semaphore closed".to_string()))
            }
        }
    }

    async fn with_deadline<T>(
        &self,
        ctx: &CancellationToken,
        timeout: Duration,
        operation: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(GatewayError::Timeout(format!(
                "{} cancelled by caller",
                operation
            ))),
            result = tokio::time::timeout(timeout, fut) => match result {
                Err(_) => Err(GatewayError::Timeout(format!(
                    "{} timed out after {:?}",
                    operation, timeout
                ))),
                Ok(r) => r,
            },
        }
    }
}

/// Steps 8-9: execute in the driver's single-statement mode and collect
/// rows and the command tag's rows-affected count.
async fn collect_result(
    tx: &mut Transaction<'static, Postgres>,
    sql: &str,
) -> Result<(Vec<String>, Vec<JsonMap<String, JsonValue>>, i64)> {
    let mut columns: Vec<String> = Vec::new();
    let mut rows = Vec::new();
    let mut rows_affected = 0i64;

    let mut stream = sqlx::query(sql).fetch_many(&mut **tx);
    while let Some(item) = stream.try_next().await? {
        match item {
            Either::Left(result) => {
                rows_affected = result.rows_affected() as i64;
            }
            Either::Right(row) => {
                if columns.is_empty() {
                    columns = column_names(&row);
                }
                rows.push(row_to_json(&row)?);
            }
        }
    }

    Ok((columns, rows, rows_affected))
}

fn column_names(row: &PgRow) -> Vec<String> {
    row.columns().iter().map(|c| c.name().to_string()).collect()
}

/// Step 15: replace an oversized row set with a bounded prefix of its
/// JSON rendering plus the truncation marker. Prefix length is measured
/// in characters, so a multi-byte boundary can never split.
fn apply_truncation(output: &mut QueryOutput, max_chars: usize) {
    let Some(rows) = &output.rows else {
        return;
    };
    let json = match serde_json::to_string(rows) {
        Ok(json) => json,
        Err(e) => {
            output.rows = None;
            output.error = format!("failed to encode result rows: {}", e);
            return;
        }
    };
    if json.chars().count() <= max_chars {
        return;
    }
    let prefix: String = json.chars().take(max_chars).collect();
    output.rows = None;
    output.error =
        format!("{}...[truncated] Result is too long! Add limits in your query!", prefix);
}
