//! Redis-backed shared cache tier.
//!
//! Entries are stored as JSON strings with a native TTL (`SET key value EX
//! ttl`). A single multiplexed connection is opened lazily and reused; it is
//! dropped after any command error so the next operation reconnects. The
//! connection slot is only locked to read or replace it, never while
//! connecting, so concurrent callers each pay at most one `op_timeout`.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};

use super::{CacheBackend, CacheError, CachedResponse};

pub struct RedisBackend {
    client: Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    key_prefix: String,
    op_timeout: Duration,
}

impl RedisBackend {
    /// Create a backend for `url` (e.g. `redis://127.0.0.1:6379`). No
    /// connection is made until the first operation.
    pub fn new(url: &str, key_prefix: &str, op_timeout: Duration) -> Result<Self, CacheError> {
        let client = Client::open(url)
            .map_err(|e| CacheError::Unavailable(format!("invalid redis url: {}", e)))?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
            key_prefix: key_prefix.to_string(),
            op_timeout,
        })
    }

    fn key(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.key_prefix, key)
        }
    }

    async fn connection(&self) -> redis::RedisResult<MultiplexedConnection> {
        let cached = self.connection.lock().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        // Racing connects are harmless: the last one stored wins
        *self.connection.lock() = Some(conn.clone());
        Ok(conn)
    }

    /// Connect if needed and run `op`, all within one `op_timeout`. The
    /// cached connection is dropped if anything fails.
    async fn run<T, F, Fut>(&self, op: F) -> Result<T, CacheError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let attempt = async {
            let conn = self.connection().await?;
            op(conn).await
        };
        let result = match tokio::time::timeout(self.op_timeout, attempt).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(CacheError::Unavailable(e.to_string())),
            Err(_) => Err(CacheError::Unavailable(format!(
                "redis operation timed out after {}ms",
                self.op_timeout.as_millis()
            ))),
        };
        if result.is_err() {
            *self.connection.lock() = None;
        }
        result
    }
}

/// Decode a stored value. Anything that is not a valid entry is a miss.
fn decode_entry(key: &str, raw: &str) -> Option<CachedResponse> {
    match serde_json::from_str(raw) {
        Ok(entry) => Some(entry),
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "discarding undecodable cache entry");
            None
        }
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<CachedResponse>, CacheError> {
        let full_key = self.key(key);
        let lookup = full_key.clone();
        let raw: Option<String> = self
            .run(|mut conn| async move { conn.get::<_, Option<String>>(lookup).await })
            .await?;
        Ok(raw.and_then(|raw| decode_entry(&full_key, &raw)))
    }

    async fn set(&self, key: &str, value: &CachedResponse, ttl: Duration) -> Result<(), CacheError> {
        let payload = serde_json::to_string(value)?;
        let full_key = self.key(key);
        // EX must be at least one second
        let seconds = ttl.as_secs().max(1);
        self.run(|mut conn| async move { conn.set_ex::<_, _, ()>(full_key, payload, seconds).await })
            .await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let full_key = self.key(key);
        self.run(|mut conn| async move { conn.del::<_, ()>(full_key).await })
            .await
    }
}
