use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use super::{CacheStore, glob_match};
use crate::error::AppResult;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Entry cap used by [`MemoryStore::new`].
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

/// In-process store backed by `DashMap`.
///
/// Expired entries are evicted lazily on access, during `keys` scans and by
/// [`CacheStore::purge_expired`], which the application state runs on an
/// interval. Inserting a new key into a full store first purges expired
/// entries, then evicts the entry closest to expiry.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    max_entries: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_max_entries(DEFAULT_MAX_ENTRIES)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Number of entries held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Make room for one new key.
    fn ensure_capacity(&self) {
        if self.entries.len() < self.max_entries {
            return;
        }
        let purged = self.remove_expired();
        if self.entries.len() < self.max_entries {
            debug!(purged, "Memory store full, purged expired entries");
            return;
        }

        let victim = self
            .entries
            .iter()
            .min_by_key(|e| e.expires_at)
            .map(|e| e.key().clone());
        if let Some(key) = victim {
            warn!(key = %key, max_entries = self.max_entries, "Memory store full, evicting soonest-expiring entry");
            self.entries.remove(&key);
        }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let now = Instant::now();
        // Drop the read guard before removing to avoid deadlocking the shard
        let hit = self
            .entries
            .get(key)
            .map(|e| (e.is_expired(now), e.value.clone()));

        match hit {
            Some((false, value)) => Ok(Some(value)),
            Some((true, _)) => {
                self.entries.remove_if(key, |_, e| e.is_expired(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        if !self.entries.contains_key(key) {
            self.ensure_capacity();
        }
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> AppResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> AppResult<Vec<String>> {
        self.remove_expired();

        Ok(self
            .entries
            .iter()
            .filter(|e| glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect())
    }

    fn purge_expired(&self) -> usize {
        self.remove_expired()
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
