//! Response cache with a shared primary store and a process-local fallback.
//!
//! Reads and writes go to the primary backend (Redis) when one is
//! configured. Any primary failure is logged as a degradation and the same
//! operation is served by the local store instead, so callers never see a
//! cache error: the worst case is a miss. After a failure the primary is
//! skipped for a short cooldown so a dead store costs one timeout, not one
//! per request.

mod fingerprint;
mod local;
mod redis_store;

pub use fingerprint::{fingerprint, normalize_prompt};
pub use local::LocalBackend;
pub use redis_store::RedisBackend;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::{CacheBackendKind, CacheConfig};

/// A cached upstream response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub text: String,
    pub provider: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Cost of the call that produced this entry.
    pub cost: f64,
    pub created_at: DateTime<Utc>,
}

/// Backend failure. Never escapes [`ResponseCache`].
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cache entry could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A key/value store for cached responses.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<CachedResponse>, CacheError>;

    async fn set(&self, key: &str, value: &CachedResponse, ttl: Duration)
        -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Hit/miss counters and backend state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    /// Operations that fell back to the local store.
    pub degraded_ops: u64,
    pub backend: &'static str,
    /// The primary is being skipped after a recent failure.
    pub primary_cooling_down: bool,
    pub local_entries: usize,
}

const DEFAULT_DEGRADED_COOLDOWN: Duration = Duration::from_secs(5);

/// Two-tier response cache.
pub struct ResponseCache {
    primary: Option<Arc<dyn CacheBackend>>,
    local: LocalBackend,
    default_ttl: Duration,
    enabled: bool,
    degraded_cooldown: Duration,
    primary_retry_at: Mutex<Option<Instant>>,
    hits: AtomicU64,
    misses: AtomicU64,
    degraded: AtomicU64,
}

impl ResponseCache {
    /// Local-only cache.
    pub fn local(default_ttl: Duration, max_entries: usize) -> Self {
        Self {
            primary: None,
            local: LocalBackend::new(max_entries),
            default_ttl,
            enabled: true,
            degraded_cooldown: DEFAULT_DEGRADED_COOLDOWN,
            primary_retry_at: Mutex::new(None),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            degraded: AtomicU64::new(0),
        }
    }

    /// Cache with a shared primary backend in front of the local store.
    pub fn with_primary(
        primary: Arc<dyn CacheBackend>,
        default_ttl: Duration,
        max_entries: usize,
    ) -> Self {
        Self {
            primary: Some(primary),
            ..Self::local(default_ttl, max_entries)
        }
    }

    /// Skip the primary for `cooldown` after it fails. Zero retries it on
    /// every operation.
    pub fn with_degraded_cooldown(mut self, cooldown: Duration) -> Self {
        self.degraded_cooldown = cooldown;
        self
    }

    /// A cache that never stores anything and never counts lookups.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::local(Duration::ZERO, 0)
        }
    }

    /// Build from configuration. A Redis URL that cannot be parsed disables
    /// the primary and leaves the local store in charge.
    pub fn from_config(config: &CacheConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        let ttl = Duration::from_secs(config.ttl_secs);

        match (&config.backend, &config.redis_url) {
            (CacheBackendKind::Redis, Some(url)) => {
                match RedisBackend::new(
                    url,
                    &config.key_prefix,
                    Duration::from_millis(config.op_timeout_ms),
                ) {
                    Ok(backend) => {
                        tracing::info!(prefix = %config.key_prefix, "response cache using redis");
                        Self::with_primary(Arc::new(backend), ttl, config.max_local_entries)
                            .with_degraded_cooldown(Duration::from_millis(
                                config.degraded_cooldown_ms,
                            ))
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "redis cache unavailable, using local cache only");
                        Self::local(ttl, config.max_local_entries)
                    }
                }
            }
            _ => Self::local(ttl, config.max_local_entries),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn degrade(&self, backend: &str, op: &str, err: &CacheError) {
        self.degraded.fetch_add(1, Ordering::Relaxed);
        if !self.degraded_cooldown.is_zero() {
            *self.primary_retry_at.lock() = Some(Instant::now() + self.degraded_cooldown);
        }
        tracing::warn!(
            backend = %backend,
            op = %op,
            error = %err,
            cooldown_ms = self.degraded_cooldown.as_millis() as u64,
            "cache degraded to local store"
        );
    }

    /// The primary to use for this operation, or `None` while it is
    /// cooling down. Skipped operations still count as degraded.
    fn live_primary(&self) -> Option<&Arc<dyn CacheBackend>> {
        let primary = self.primary.as_ref()?;
        if self.cooling_down() {
            self.degraded.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        Some(primary)
    }

    fn cooling_down(&self) -> bool {
        let mut retry_at = self.primary_retry_at.lock();
        match *retry_at {
            Some(at) if Instant::now() < at => true,
            Some(_) => {
                *retry_at = None;
                tracing::debug!("cache cooldown over, retrying primary");
                false
            }
            None => false,
        }
    }

    pub async fn get(&self, key: &str) -> Option<CachedResponse> {
        if !self.enabled {
            return None;
        }

        let found = match self.live_primary() {
            Some(primary) => match primary.get(key).await {
                Ok(found) => found,
                Err(e) => {
                    self.degrade(primary.name(), "get", &e);
                    self.local.get_entry(key)
                }
            },
            None => self.local.get_entry(key),
        };

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %key, "cache hit");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %key, "cache miss");
        }
        found
    }

    /// Store `value` under `key`, overwriting any previous entry.
    pub async fn set(&self, key: &str, value: &CachedResponse, ttl: Option<Duration>) {
        if !self.enabled {
            return;
        }
        let ttl = ttl.unwrap_or(self.default_ttl);

        match self.live_primary() {
            Some(primary) => {
                if let Err(e) = primary.set(key, value, ttl).await {
                    self.degrade(primary.name(), "set", &e);
                    self.local.set_entry(key, value.clone(), ttl);
                }
            }
            None => self.local.set_entry(key, value.clone(), ttl),
        }
    }

    pub async fn delete(&self, key: &str) {
        if let Some(primary) = self.live_primary() {
            if let Err(e) = primary.delete(key).await {
                self.degrade(primary.name(), "delete", &e);
            }
        }
        self.local.remove(key);
    }

    /// Drop every entry in the local store. The shared store is left alone.
    pub fn clear_local(&self) {
        self.local.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            degraded_ops: self.degraded.load(Ordering::Relaxed),
            backend: match (&self.primary, self.enabled) {
                (_, false) => "disabled",
                (Some(primary), true) => primary.name(),
                (None, true) => self.local.name(),
            },
            primary_cooling_down: self.primary.is_some() && self.cooling_down(),
            local_entries: self.local.len(),
        }
    }
}
