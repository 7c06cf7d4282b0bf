//! Integration tests for the query pipeline.
//!
//! These tests require a PostgreSQL database to be running.
//! Set DATABASE_URL environment variable before running.
//!
//! Run with: cargo test -p pgwarden test_query_pipeline -- --ignored

use std::time::{Duration, Instant};

use pgwarden::{
    Gateway, GatewayConfig, GuardPolicy, HookSettings, QueryInput, SanitizeRule, SubprocessHook,
};
use tokio_util::sync::CancellationToken;

/// Helper to get database URL from environment
fn get_database_url() -> String {
    std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgresql://localhost/test_db".to_string())
}

async fn plain_pool() -> sqlx::PgPool {
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(2)
        .connect(&get_database_url())
        .await
        .expect("test database must be reachable")
}

async fn setup_users_table(pool: &sqlx::PgPool, table: &str) {
    sqlx::query(&format!("DROP TABLE IF EXISTS {} CASCADE", table))
        .execute(pool)
        .await
        .unwrap();
    sqlx::query(&format!(
        "CREATE TABLE {} (
            id BIGSERIAL PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT
        )",
        table
    ))
    .execute(pool)
    .await
    .unwrap();
}

async fn cleanup_table(pool: &sqlx::PgPool, table: &str) {
    sqlx::query(&format!("DROP TABLE IF EXISTS {} CASCADE", table))
        .execute(pool)
        .await
        .unwrap();
}

async fn connect_gateway(config: GatewayConfig) -> Gateway {
    Gateway::connect(GatewayConfig {
        database_url: get_database_url(),
        ..config
    })
    .await
    .expect("gateway must connect")
}

fn ctx() -> CancellationToken {
    CancellationToken::new()
}

// =============================================================================
// Basic execution
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_basic_select_returns_ordered_rows() {
    let pool = plain_pool().await;
    let table = "pipeline_basic_select";
    setup_users_table(&pool, table).await;
    sqlx::query(&format!(
        "INSERT INTO {} (name, email) VALUES ('Alice', 'alice@example.com'), ('Bob', 'bob@example.com')",
        table
    ))
    .execute(&pool)
    .await
    .unwrap();

    let gateway = connect_gateway(GatewayConfig::default()).await;
    let output = gateway
        .query(
            &ctx(),
            QueryInput::new(format!("SELECT id, name, email FROM {} ORDER BY id", table)),
        )
        .await;

    assert_eq!(output.error, "");
    assert_eq!(output.columns, vec!["id", "name", "email"]);
    let rows = output.rows.expect("rows present");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["name"], "Alice");
    assert_eq!(rows[1]["name"], "Bob");

    cleanup_table(&pool, table).await;
}

#[tokio::test]
#[ignore]
async fn test_select_leaves_database_unchanged() {
    // Read paths roll back; an INSERT inside a CTE of a SELECT would be
    // caught by the checker, so this just confirms the read path is clean.
    let pool = plain_pool().await;
    let table = "pipeline_read_only_rollback";
    setup_users_table(&pool, table).await;

    let gateway = connect_gateway(GatewayConfig::default()).await;
    let output = gateway
        .query(&ctx(), QueryInput::new(format!("SELECT count(*) FROM {}", table)))
        .await;
    assert_eq!(output.error, "");

    cleanup_table(&pool, table).await;
}

// =============================================================================
// Protection
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_drop_blocked_by_default_policy() {
    let gateway = connect_gateway(GatewayConfig::default()).await;
    let output = gateway
        .query(&ctx(), QueryInput::new("DROP TABLE users"))
        .await;
    assert!(output.error.contains("DROP statements are not allowed"));
    assert!(output.rows.is_none());
}

#[tokio::test]
#[ignore]
async fn test_cte_delete_without_where_under_explain_analyze() {
    let pool = plain_pool().await;
    let table = "pipeline_cte_delete";
    setup_users_table(&pool, table).await;

    let gateway = connect_gateway(GatewayConfig::default()).await;
    let output = gateway
        .query(
            &ctx(),
            QueryInput::new(format!(
                "EXPLAIN ANALYZE WITH d AS (DELETE FROM {} RETURNING *) SELECT * FROM d",
                table
            )),
        )
        .await;
    assert!(output
        .error
        .contains("DELETE without WHERE clause is not allowed"));

    cleanup_table(&pool, table).await;
}

#[tokio::test]
#[ignore]
async fn test_multi_statement_rejected_at_pipeline_level() {
    let gateway = connect_gateway(GatewayConfig::default()).await;
    let output = gateway
        .query(&ctx(), QueryInput::new("SELECT 1; SELECT 2"))
        .await;
    assert!(output.error.contains("multi-statement queries are not allowed"));
}

#[tokio::test]
#[ignore]
async fn test_read_only_set_enforcement() {
    let gateway = connect_gateway(GatewayConfig {
        policy: GuardPolicy {
            allow_set: true,
            read_only: true,
            ..Default::default()
        },
        ..Default::default()
    })
    .await;

    let output = gateway
        .query(
            &ctx(),
            QueryInput::new("SET default_transaction_read_only = off"),
        )
        .await;
    assert!(output.error.contains("default_transaction_read_only"));
}

#[tokio::test]
#[ignore]
async fn test_read_only_session_blocks_writes_server_side() {
    // Even if a write class slipped past the checker, the session pins
    // default_transaction_read_only=on. INSERT is allowed by the policy
    // table, so this exercises the session-level defense directly.
    let pool = plain_pool().await;
    let table = "pipeline_read_only_session";
    setup_users_table(&pool, table).await;

    let gateway = connect_gateway(GatewayConfig {
        policy: GuardPolicy {
            read_only: true,
            ..Default::default()
        },
        ..Default::default()
    })
    .await;

    let output = gateway
        .query(
            &ctx(),
            QueryInput::new(format!("INSERT INTO {} (name) VALUES ('x')", table)),
        )
        .await;
    assert!(
        output.error.contains("read-only"),
        "expected a read-only transaction error, got: {}",
        output.error
    );

    cleanup_table(&pool, table).await;
}

// =============================================================================
// Sanitization / truncation / error prompts
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_sanitization_masks_phone_numbers() {
    let pool = plain_pool().await;
    let table = "pipeline_sanitize_contacts";
    sqlx::query(&format!("DROP TABLE IF EXISTS {} CASCADE", table))
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(&format!("CREATE TABLE {} (phone TEXT)", table))
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(&format!("INSERT INTO {} VALUES ('555-123-4567')", table))
        .execute(&pool)
        .await
        .unwrap();

    let gateway = connect_gateway(GatewayConfig {
        sanitize_rules: vec![SanitizeRule {
            pattern: r"\d{3}-\d{3}-\d{4}".to_string(),
            replacement: "***-***-****".to_string(),
            description: "mask phone numbers".to_string(),
        }],
        ..Default::default()
    })
    .await;

    let output = gateway
        .query(&ctx(), QueryInput::new(format!("SELECT phone FROM {}", table)))
        .await;
    assert_eq!(output.error, "");
    let rows = output.rows.unwrap();
    assert_eq!(rows[0]["phone"], "***-***-****");

    cleanup_table(&pool, table).await;
}

#[tokio::test]
#[ignore]
async fn test_truncation_replaces_rows_and_appends_marker() {
    let gateway = connect_gateway(GatewayConfig {
        max_result_chars: 100,
        ..Default::default()
    })
    .await;

    let output = gateway
        .query(
            &ctx(),
            QueryInput::new("SELECT repeat('x', 500) AS filler FROM generate_series(1, 10)"),
        )
        .await;

    assert!(output.rows.is_none());
    assert!(output.error.starts_with("["));
    assert!(output
        .error
        .contains("[truncated] Result is too long! Add limits in your query!"));
}

#[tokio::test]
#[ignore]
async fn test_error_prompt_augmentation() {
    let gateway = connect_gateway(GatewayConfig {
        error_prompt_rules: vec![pgwarden::ErrorPromptRule {
            pattern: "not allowed".to_string(),
            message: "Ask the operator to raise the policy flag.".to_string(),
        }],
        ..Default::default()
    })
    .await;

    let output = gateway
        .query(&ctx(), QueryInput::new("DROP TABLE users"))
        .await;
    assert!(output.error.contains("DROP statements are not allowed"));
    assert!(output
        .error
        .ends_with("\n\nAsk the operator to raise the policy flag."));
}

// =============================================================================
// Hooks
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_subprocess_after_hook_reject_rolls_back_write() {
    let pool = plain_pool().await;
    let table = "pipeline_hook_rollback";
    setup_users_table(&pool, table).await;

    let gateway = connect_gateway(GatewayConfig {
        hooks: HookSettings {
            subprocess_after: vec![SubprocessHook {
                pattern: ".*".to_string(),
                command: "echo".to_string(),
                args: vec![r#"{"accept": false, "error_message": "blocked by test hook"}"#
                    .to_string()],
                timeout: Duration::from_secs(5),
            }],
            ..Default::default()
        },
        ..Default::default()
    })
    .await;

    let output = gateway
        .query(
            &ctx(),
            QueryInput::new(format!(
                "INSERT INTO {} (name) VALUES ('rejected_row') RETURNING *",
                table
            )),
        )
        .await;
    assert!(output.error.contains("blocked by test hook"));

    // The write must not have committed.
    let (count,): (i64,) = sqlx::query_as(&format!(
        "SELECT count(*) FROM {} WHERE name = 'rejected_row'",
        table
    ))
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(count, 0);

    cleanup_table(&pool, table).await;
}

#[tokio::test]
#[ignore]
async fn test_subprocess_before_hook_rewrites_sql() {
    let gateway = connect_gateway(GatewayConfig {
        hooks: HookSettings {
            subprocess_before: vec![SubprocessHook {
                pattern: "^SELECT 1$".to_string(),
                command: "echo".to_string(),
                args: vec![r#"{"accept": true, "modified_query": "SELECT 2 AS n"}"#.to_string()],
                timeout: Duration::from_secs(5),
            }],
            ..Default::default()
        },
        ..Default::default()
    })
    .await;

    let output = gateway.query(&ctx(), QueryInput::new("SELECT 1")).await;
    assert_eq!(output.error, "");
    let rows = output.rows.unwrap();
    assert_eq!(rows[0]["n"], 2);
}

// =============================================================================
// Concurrency and cancellation
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_semaphore_bounds_concurrent_pipelines() {
    let gateway = std::sync::Arc::new(
        connect_gateway(GatewayConfig {
            pool: pgwarden::PoolConfig {
                max_connections: 1,
                ..Default::default()
            },
            ..Default::default()
        })
        .await,
    );

    // With one permit, four 200ms sleeps must serialize.
    let started = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..4 {
        let gateway = std::sync::Arc::clone(&gateway);
        handles.push(tokio::spawn(async move {
            gateway
                .query(&CancellationToken::new(), QueryInput::new("SELECT pg_sleep(0.2)"))
                .await
        }));
    }
    for handle in handles {
        let output = handle.await.unwrap();
        assert_eq!(output.error, "");
    }
    assert!(
        started.elapsed() >= Duration::from_millis(800),
        "queries overlapped past the semaphore bound"
    );
}

#[tokio::test]
#[ignore]
async fn test_cancelled_caller_fails_slot_acquisition() {
    let gateway = connect_gateway(GatewayConfig::default()).await;
    let token = CancellationToken::new();
    token.cancel();

    let output = gateway.query(&token, QueryInput::new("SELECT 1")).await;
    assert!(output.error.contains("failed to acquire query slot"));
}

#[tokio::test]
#[ignore]
async fn test_query_timeout_rolls_back() {
    let gateway = connect_gateway(GatewayConfig {
        timeout_rules: vec![pgwarden::TimeoutRule {
            name: "sleepers".to_string(),
            pattern: "pg_sleep".to_string(),
            timeout: Duration::from_millis(100),
        }],
        ..Default::default()
    })
    .await;

    let output = gateway
        .query(&ctx(), QueryInput::new("SELECT pg_sleep(5)"))
        .await;
    assert!(output.error.contains("timed out"));

    // The pool connection is reusable afterwards.
    let output = gateway.query(&ctx(), QueryInput::new("SELECT 1 AS n")).await;
    assert_eq!(output.error, "");
}

#[tokio::test]
#[ignore]
async fn test_sql_length_gate() {
    let gateway = connect_gateway(GatewayConfig {
        max_sql_length: 32,
        ..Default::default()
    })
    .await;

    let output = gateway
        .query(
            &ctx(),
            QueryInput::new("SELECT 'this statement is far longer than the gate allows'"),
        )
        .await;
    assert!(output.error.contains("SQL query too long"));
}
