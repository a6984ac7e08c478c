//! `PostgreSQL` adapters for the modsub pipeline.
//!
//! Two adapters share one connection pool:
//!
//! - [`PostgresProjectionStore`]: the `subscription_projections` table
//!   with composite `(mod_id, user_id)` key, monotonic `last_event_id`
//!   and soft-delete timestamps;
//! - [`PostgresEventLog`]: an append-only `subscription_events` table
//!   (global `BIGSERIAL` position, per-stream sequence) plus durable
//!   named cursors in `subscription_cursors`, advanced only by ACK.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod log;
mod store;

pub use crate::log::PostgresEventLog;
pub use crate::store::PostgresProjectionStore;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use thiserror::Error;

/// Failure to establish the connection pool.
#[derive(Debug, Error)]
pub enum PostgresError {
    /// The pool could not be created or the server is unreachable.
    #[error("failed to create postgres connection pool: {0}")]
    ConnectionFailed(#[source] sqlx::Error),
}

/// Connection pool and polling configuration.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10).
    pub max_connections: u32,
    /// Timeout for acquiring a connection from the pool (default: 30s).
    pub acquire_timeout: Duration,
    /// Idle timeout for pooled connections (default: 10 minutes).
    pub idle_timeout: Duration,
    /// How long a connected cursor stream sleeps between polls when no
    /// event is pending (default: 100ms).
    pub poll_interval: Duration,
    /// How many events one poll reads ahead (default: 100).
    pub read_batch_size: i64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_millis(100),
            read_batch_size: 100,
        }
    }
}

/// Creates a connection pool with the given configuration.
pub async fn connect(url: &str, config: &PostgresConfig) -> Result<PgPool, PostgresError> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect(url)
        .await
        .map_err(PostgresError::ConnectionFailed)
}
