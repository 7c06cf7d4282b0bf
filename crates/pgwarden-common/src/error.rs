//! Error types for pgwarden

use thiserror::Error;

/// Result type alias for pgwarden operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Unified error type for all pgwarden operations
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// SQL failed to parse under the PostgreSQL grammar
    #[error("SQL parse error: {0}")]
    Parse(String),

    /// Statement rejected by the protection policy
    #[error("{0}")]
    Rejected(String),

    /// A before/after hook rejected, timed out, or failed
    #[error("{0}")]
    Hook(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid construction-time configuration; fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    // PostgreSQL-specific error classes surfaced for logging and callers

    /// Unique or exclusion constraint violation (SQLSTATE 23505, 23P01)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Deadlock detected (SQLSTATE 40P01)
    #[error("Deadlock detected: {0}")]
    Deadlock(String),

    /// Transient failure that may succeed on retry (class 40, class 57)
    #[error("Transient error: {0}")]
    Transient(String),
}

impl GatewayError {
    /// Returns true if this error is potentially retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Deadlock(_) | GatewayError::Timeout(_) | GatewayError::Transient(_)
        )
    }

    /// Returns true if the error occurred before any statement was executed
    /// (validation and hook failures never touch the database).
    pub fn is_pre_execution(&self) -> bool {
        matches!(
            self,
            GatewayError::Parse(_) | GatewayError::Rejected(_) | GatewayError::Hook(_)
        )
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Serialization(err.to_string())
    }
}

// PostgreSQL-specific error conversions (when postgres-errors feature is enabled)
#[cfg(feature = "postgres-errors")]
impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::Error;
        match &err {
            Error::Configuration(_) => GatewayError::Connection(err.to_string()),
            Error::Database(db_err) => {
                // Classify based on PostgreSQL SQLSTATE codes
                // See: https://www.postgresql.org/docs/current/errcodes-appendix.html
                if let Some(code) = db_err.code() {
                    let code_str: &str = &code;
                    match code_str {
                        // Unique constraint violation
                        "23505" => return GatewayError::Conflict(err.to_string()),
                        // Exclusion constraint violation
                        "23P01" => return GatewayError::Conflict(err.to_string()),
                        // Deadlock detected
                        "40P01" => return GatewayError::Deadlock(err.to_string()),
                        // Query cancelled (statement timeout or caller cancellation)
                        "57014" => return GatewayError::Timeout(err.to_string()),
                        // Transaction rollback - serialization failure and friends
                        code if code.starts_with("40") => {
                            return GatewayError::Transient(err.to_string())
                        }
                        // Connection errors (class 08)
                        code if code.starts_with("08") => {
                            return GatewayError::Connection(err.to_string())
                        }
                        // Operator intervention / admin shutdown (class 57)
                        "57P01" | "57P02" | "57P03" => {
                            return GatewayError::Transient(err.to_string())
                        }
                        _ => {}
                    }
                }
                GatewayError::Query(err.to_string())
            }
            Error::Io(_) => GatewayError::Connection(err.to_string()),
            Error::Tls(_) => GatewayError::Connection(err.to_string()),
            Error::Protocol(_) => GatewayError::Connection(err.to_string()),
            Error::RowNotFound => GatewayError::Query("Row not found".to_string()),
            Error::TypeNotFound { .. } => GatewayError::Serialization(err.to_string()),
            Error::ColumnIndexOutOfBounds { .. } => GatewayError::Query(err.to_string()),
            Error::ColumnNotFound(_) => GatewayError::Query(err.to_string()),
            Error::ColumnDecode { .. } => GatewayError::Serialization(err.to_string()),
            Error::Decode(_) => GatewayError::Serialization(err.to_string()),
            Error::PoolTimedOut => GatewayError::Timeout("Connection pool timed out".to_string()),
            Error::PoolClosed => GatewayError::Connection("Connection pool closed".to_string()),
            Error::WorkerCrashed => GatewayError::Internal("Worker thread crashed".to_string()),
            _ => GatewayError::Query(err.to_string()),
        }
    }
}
