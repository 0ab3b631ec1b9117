//! SQLite persistence for usage records.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{SinkError, UsageSink};
use crate::tracker::UsageRecord;

/// Timestamps are stored in one fixed RFC 3339 shape so that text order
/// matches time order.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Insert a record. Re-inserting the same id is a no-op, so retries are safe.
pub async fn insert(pool: &SqlitePool, record: &UsageRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT OR IGNORE INTO usage_records (
            id, timestamp, provider, model, caller,
            input_tokens, output_tokens, cost, cancelled
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(record.id.to_string())
    .bind(format_timestamp(&record.timestamp))
    .bind(&record.provider)
    .bind(&record.model)
    .bind(&record.caller)
    .bind(record.input_tokens as i64)
    .bind(record.output_tokens as i64)
    .bind(record.cost)
    .bind(record.cancelled)
    .execute(pool)
    .await?;
    Ok(())
}

/// Load records at or after `since` (everything when `None`), oldest first.
///
/// Rows that cannot be decoded are skipped with a warning.
pub async fn load_since(
    pool: &SqlitePool,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<UsageRecord>, sqlx::Error> {
    let since = since
        .map(|ts| format_timestamp(&ts))
        .unwrap_or_default();

    let rows = sqlx::query(
        "SELECT id, timestamp, provider, model, caller,
                input_tokens, output_tokens, cost, cancelled
         FROM usage_records
         WHERE timestamp >= ?
         ORDER BY timestamp ASC",
    )
    .bind(since)
    .fetch_all(pool)
    .await?;

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let id: String = row.try_get("id")?;
        let timestamp: String = row.try_get("timestamp")?;

        let (Ok(uuid), Ok(ts)) = (
            Uuid::parse_str(&id),
            DateTime::parse_from_rfc3339(&timestamp),
        ) else {
            tracing::warn!(id = %id, timestamp = %timestamp, "skipping malformed usage row");
            continue;
        };

        records.push(UsageRecord {
            id: uuid,
            timestamp: ts.with_timezone(&Utc),
            provider: row.try_get("provider")?,
            model: row.try_get("model")?,
            caller: row.try_get("caller")?,
            input_tokens: row.try_get::<i64, _>("input_tokens")? as u32,
            output_tokens: row.try_get::<i64, _>("output_tokens")? as u32,
            cost: row.try_get("cost")?,
            cancelled: row.try_get("cancelled")?,
        });
    }
    Ok(records)
}

/// [`UsageSink`] writing to the `usage_records` table.
#[derive(Clone)]
pub struct SqliteUsageSink {
    pool: SqlitePool,
}

impl SqliteUsageSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl UsageSink for SqliteUsageSink {
    async fn append(&self, record: &UsageRecord) -> Result<(), SinkError> {
        insert(&self.pool, record).await?;
        Ok(())
    }
}
