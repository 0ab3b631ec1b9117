//! Durable storage for usage records.
//!
//! The tracker never writes to storage directly. Records are handed to a
//! bounded queue ([`UsageQueue`]) and a background worker appends them to a
//! [`UsageSink`], retrying with backoff. A slow or failing sink therefore
//! never blocks request handling.

pub mod usage;
pub mod worker;

pub use usage::SqliteUsageSink;
pub use worker::{spawn_usage_worker, UsageQueue};

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;

use crate::tracker::UsageRecord;

/// Failure to persist a usage record.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("database write failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Append-only destination for usage records.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Persist one record. Must be idempotent on `record.id`.
    async fn append(&self, record: &UsageRecord) -> Result<(), SinkError>;
}

/// Initialize the SQLite connection pool and run migrations.
///
/// The database file is created automatically if it doesn't exist.
/// WAL journal mode is used for concurrent read/write performance.
pub async fn init_pool(db_path: &str) -> Result<SqlitePool, sqlx::Error> {
    let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path))?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(opts)
        .await?;

    // Apply embedded migrations
    sqlx::migrate!().run(&pool).await?;

    Ok(pool)
}
