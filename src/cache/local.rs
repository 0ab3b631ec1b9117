//! Process-local cache store with per-entry expiry.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{CacheBackend, CacheError, CachedResponse};

struct LocalEntry {
    value: CachedResponse,
    expires_at: Instant,
}

/// In-memory store used as the fallback tier, or as the only tier when no
/// shared store is configured.
///
/// Expired entries are dropped when read. When the store is full, expired
/// entries are swept before inserting; if it is still full the write is
/// skipped.
pub struct LocalBackend {
    entries: DashMap<String, LocalEntry>,
    max_entries: usize,
}

impl LocalBackend {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
        }
    }

    pub fn get_entry(&self, key: &str) -> Option<CachedResponse> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        }
        None
    }

    pub fn set_entry(&self, key: &str, value: CachedResponse, ttl: Duration) {
        if self.max_entries == 0 {
            return;
        }
        if !self.entries.contains_key(key) && self.entries.len() >= self.max_entries {
            self.purge_expired();
            if self.entries.len() >= self.max_entries {
                tracing::debug!(key = %key, max_entries = self.max_entries, "local cache full, skipping write");
                return;
            }
        }
        self.entries.insert(
            key.to_string(),
            LocalEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn get(&self, key: &str) -> Result<Option<CachedResponse>, CacheError> {
        Ok(self.get_entry(key))
    }

    async fn set(&self, key: &str, value: &CachedResponse, ttl: Duration) -> Result<(), CacheError> {
        self.set_entry(key, value.clone(), ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.remove(key);
        Ok(())
    }
}
