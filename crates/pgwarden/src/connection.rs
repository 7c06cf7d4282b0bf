//! PostgreSQL connection management with connection pooling.
//!
//! Connection pooling uses SQLx's built-in pool manager, with exponential
//! backoff retries while the pool is first established. Every new
//! connection runs the gateway's session setup: read-only mode pins
//! `default_transaction_read_only = on`, and a configured timezone is
//! applied with single-quote escaping.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::Executor;
use tracing::{info, instrument, warn};

use crate::{GatewayError, Result};

/// Retry configuration for connection establishment.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries)
    pub max_retries: u32,
    /// Initial delay between retries in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each retry)
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Creates a retry config with no retries (immediate failure).
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Calculates the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay_ms = (self.initial_delay_ms as f64) * self.backoff_multiplier.powi(attempt as i32);

        Duration::from_millis((delay_ms as u64).min(self.max_delay_ms))
    }
}

/// Connection pool configuration.
///
/// `max_connections` doubles as the gateway's concurrency bound: the
/// pipeline semaphore is sized to it, so no two in-flight calls ever
/// contend on a pool acquire.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum number of idle connections to keep open.
    pub min_connections: u32,
    /// Maximum number of connections in the pool. Must be positive.
    pub max_connections: u32,
    /// Connection acquire timeout in seconds.
    pub connect_timeout: u64,
    /// Maximum lifetime of a connection in seconds.
    pub max_lifetime: Option<u64>,
    /// Idle timeout in seconds.
    pub idle_timeout: Option<u64>,
    /// Health-check connections before handing them out.
    pub test_before_acquire: bool,
    /// Retry configuration for connection establishment.
    pub retry: RetryConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            connect_timeout: 30,
            max_lifetime: Some(1800), // 30 minutes
            idle_timeout: Some(600),  // 10 minutes
            test_before_acquire: true,
            retry: RetryConfig::default(),
        }
    }
}

/// Session options applied to every newly established connection.
#[derive(Debug, Clone, Default)]
pub struct SessionSetup {
    /// Pin `default_transaction_read_only = on` for the session.
    pub read_only: bool,
    /// Session timezone; empty leaves the server default in place.
    pub timezone: String,
}

impl SessionSetup {
    /// The statements to run on connect, in order.
    fn statements(&self) -> Vec<String> {
        let mut stmts = Vec::new();
        if self.read_only {
            stmts.push("SET default_transaction_read_only = on".to_string());
        }
        if !self.timezone.is_empty() {
            // Static configuration, but quotes still need escaping for
            // values that legitimately contain them.
            stmts.push(format!("SET timezone = '{}'", self.timezone.replace('\'', "''")));
        }
        stmts
    }
}

/// PostgreSQL connection wrapper with connection pooling.
#[derive(Clone)]
pub struct Connection {
    pool: PgPool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("size", &self.pool.size())
            .field("num_idle", &self.pool.num_idle())
            .finish()
    }
}

impl Connection {
    /// Creates a new connection pool with retry logic and per-connection
    /// session setup.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the connection
    /// fails after all retries.
    #[instrument(skip(uri, session), fields(
        min_connections = config.min_connections,
        max_connections = config.max_connections,
        max_retries = config.retry.max_retries
    ))]
    pub async fn new(uri: &str, config: PoolConfig, session: SessionSetup) -> Result<Self> {
        if uri.is_empty() {
            return Err(GatewayError::Connection(
                "Connection URI cannot be empty".to_string(),
            ));
        }
        if config.max_connections == 0 {
            return Err(GatewayError::Config(
                "max_connections must be positive".to_string(),
            ));
        }

        info!("Initializing connection pool");

        let setup = Arc::new(session.statements());
        let mut pool_options = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout))
            .test_before_acquire(config.test_before_acquire)
            .after_connect(move |conn, _meta| {
                let setup = Arc::clone(&setup);
                Box::pin(async move {
                    for sql in setup.iter() {
                        conn.execute(sql.as_str()).await?;
                    }
                    Ok(())
                })
            });

        if let Some(max_lifetime_secs) = config.max_lifetime {
            pool_options = pool_options.max_lifetime(Duration::from_secs(max_lifetime_secs));
        }
        if let Some(idle_timeout_secs) = config.idle_timeout {
            pool_options = pool_options.idle_timeout(Duration::from_secs(idle_timeout_secs));
        }

        let pool = Self::connect_with_retry(uri, pool_options, &config.retry).await?;

        // Verify the pool with a simple ping before accepting traffic.
        sqlx::query("SELECT 1").execute(&pool).await.map_err(|e| {
            GatewayError::Connection(format!("Failed to verify connection: {}", e))
        })?;

        info!("Connection pool initialized successfully");
        Ok(Self { pool })
    }

    /// Attempts to connect with exponential backoff retry.
    async fn connect_with_retry(
        uri: &str,
        pool_options: PgPoolOptions,
        retry_config: &RetryConfig,
    ) -> Result<PgPool> {
        let mut last_error = None;

        let connect_options = PgConnectOptions::from_str(uri)
            .map_err(|e| GatewayError::Connection(format!("Invalid connection URI: {}", e)))?;

        for attempt in 0..=retry_config.max_retries {
            match pool_options
                .clone()
                .connect_with(connect_options.clone())
                .await
            {
                Ok(pool) => {
                    if attempt > 0 {
                        info!(attempt = attempt, "Connection established after retry");
                    }
                    return Ok(pool);
                }
                Err(e) => {
                    last_error = Some(e);

                    if attempt < retry_config.max_retries {
                        let delay = retry_config.delay_for_attempt(attempt);
                        warn!(
                            attempt = attempt,
                            max_retries = retry_config.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            error = %last_error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                            "Connection failed, retrying after delay"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(last_error
            .map(GatewayError::from)
            .unwrap_or_else(|| GatewayError::Connection("Connection failed".to_string())))
    }

    /// Gets a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Current pool size, for diagnostics.
    pub fn size(&self) -> u32 {
        self.pool.size()
    }

    /// Idle connections currently pooled, for diagnostics.
    pub fn num_idle(&self) -> usize {
        self.pool.num_idle()
    }

    /// Closes the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Pings the database to verify connectivity.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
