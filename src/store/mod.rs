//! Shared key-value store with TTL.
//!
//! Every piece of persisted state (rate-limit buckets, processed markers,
//! refreshed marketplace entities, recovery summaries) lives behind
//! [`CacheStore`]. No component assumes exclusive access: all writes are
//! last-write-wins overwrites keyed by a stable id.
//!
//! Two backends are provided:
//!
//! - [`MemoryStore`] - in-process `DashMap`, used in development and tests
//! - [`RedisStore`] - Redis via a reconnecting `ConnectionManager`

mod memory;
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::AppResult;

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Generic key-value store with per-key TTL. No transactions are assumed.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch a value. Expired keys read as `None`.
    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    /// Overwrite a value, expiring it after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn del(&self, key: &str) -> AppResult<()>;

    /// List keys matching a glob pattern where `*` matches any run of characters.
    async fn keys(&self, pattern: &str) -> AppResult<Vec<String>>;

    /// Drop expired entries, returning how many were removed. Backends with
    /// native expiry have nothing to do.
    fn purge_expired(&self) -> usize {
        0
    }

    /// Cheap liveness probe used by the readiness endpoint.
    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }

    /// Backend name for logs and health output.
    fn backend(&self) -> &'static str;
}

/// Shared handle to the configured store.
pub type SharedStore = Arc<dyn CacheStore>;

/// Typed JSON access layered over any [`CacheStore`].
#[async_trait]
pub trait JsonStoreExt {
    /// Read and decode a JSON value.
    async fn get_json<T>(&self, key: &str) -> AppResult<Option<T>>
    where
        T: DeserializeOwned + Send;

    /// Encode and write a JSON value.
    async fn set_json<T>(&self, key: &str, value: &T, ttl: Duration) -> AppResult<()>
    where
        T: Serialize + Sync;
}

#[async_trait]
impl<S> JsonStoreExt for S
where
    S: CacheStore + ?Sized,
{
    async fn get_json<T>(&self, key: &str) -> AppResult<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T>(&self, key: &str, value: &T, ttl: Duration) -> AppResult<()>
    where
        T: Serialize + Sync,
    {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw, ttl).await
    }
}

/// Match `key` against a glob `pattern` supporting only `*`.
///
/// Mirrors the subset of Redis `KEYS` syntax the application uses.
pub fn glob_match(pattern: &str, key: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return key.is_empty();
    };
    let Some(mut rest) = key.strip_prefix(first) else {
        return false;
    };

    let segments: Vec<&str> = parts.collect();
    let Some((last, middle)) = segments.split_last() else {
        // No '*' in the pattern: exact match
        return rest.is_empty();
    };

    for segment in middle {
        match rest.split_once(segment) {
            Some((_, after)) => rest = after,
            None => return false,
        }
    }

    rest.ends_with(last)
}
