//! Guarded PostgreSQL gateway for untrusted AI-agent SQL.
//!
//! pgwarden executes SQL from an untrusted agent client against a
//! PostgreSQL database while enforcing a configurable safety policy. The
//! value is the pipeline wrapped around every query: a deterministic chain
//! of validation, interception, execution under a managed transaction,
//! result shaping, and dynamic response steering, plus a catalog-driven
//! introspection surface that bypasses that pipeline.
//!
//! # Architecture
//!
//! ```text
//! Tool caller (MCP transport, out of scope)
//!           |
//!      Gateway (service.rs)
//!      |    |    |
//!   Guard  Hooks  SchemaInspector
//!      |    |
//!     SQLx (PostgreSQL driver)
//! ```
//!
//! # Key properties
//!
//! - **Grammar-accurate validation**: statements are parsed with the real
//!   PostgreSQL grammar and checked as ASTs, so DML hidden in CTEs or
//!   behind EXPLAIN cannot slip past a keyword filter.
//! - **Always-on hard rules**: multi-statement strings and transaction
//!   control are rejected under every policy.
//! - **One managed transaction per call**: read paths roll back before
//!   after-hooks run; write paths commit only after after-hooks approve.
//! - **Bounded concurrency**: an admission semaphore sized to the pool
//!   caps in-flight pipelines end-to-end, hook subprocesses included.
//! - **Precision-preserving results**: NUMERIC and 64-bit integers travel
//!   as arbitrary-precision JSON number tokens, never IEEE-754 doubles.
//!
//! # Usage
//!
//! ```rust,ignore
//! use pgwarden::{Gateway, GatewayConfig, GuardPolicy, QueryInput};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> pgwarden::Result<()> {
//! let config = GatewayConfig {
//!     database_url: "postgresql://app@localhost/db".to_string(),
//!     policy: GuardPolicy {
//!         read_only: true,
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! let gateway = Gateway::connect(config).await?;
//!
//! let ctx = CancellationToken::new();
//! let output = gateway
//!     .query(&ctx, QueryInput::new("SELECT id, name FROM users ORDER BY id"))
//!     .await;
//! assert!(output.error.is_empty());
//! # Ok(())
//! # }
//! ```
//!
//! # Thread safety
//!
//! Every component is immutable after construction; share the [`Gateway`]
//! behind an `Arc` and call it from any number of tasks.

/// SQL parsing through the PostgreSQL grammar.
pub mod ast;

/// Database connection management with connection pooling.
pub mod connection;

/// Statement protection policy and the AST-walking checker.
pub mod guard;

/// Query hook middleware (in-process and subprocess transports).
pub mod hooks;

/// Error-prompt steering for failed queries.
pub mod prompts;

/// Result sanitization through ordered regex rules.
pub mod sanitize;

/// Catalog-driven schema introspection.
pub mod schema;

/// The gateway service and its query pipeline.
pub mod service;

/// Per-query timeout selection.
pub mod timeouts;

/// Query output model and PostgreSQL value conversion.
pub mod types;

pub use connection::{Connection, PoolConfig, RetryConfig, SessionSetup};
pub use guard::{Guard, GuardPolicy};
pub use hooks::{
    AfterHookFn, BeforeHookFn, NativeHook, NativeHookRunner, SubprocessHook, SubprocessHookRunner,
};
pub use prompts::{ErrorPromptMatcher, ErrorPromptRule};
pub use sanitize::{SanitizeRule, Sanitizer};
pub use schema::{
    ColumnInfo, ConstraintInfo, ForeignKeyInfo, IndexInfo, PartitionInfo, SchemaInspector,
    TableDescription, TableEntry, TableKind,
};
pub use service::{Gateway, GatewayConfig, HookSettings};
pub use timeouts::{TimeoutResolver, TimeoutRule};
pub use types::{CellValue, QueryInput, QueryOutput};

pub use pgwarden_common::{GatewayError, Result};
