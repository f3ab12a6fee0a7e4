use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use tracing::info;

use super::CacheStore;
use crate::error::{AppError, AppResult};

/// Redis-backed store.
///
/// `ConnectionManager` reconnects transparently, so a clone is taken per
/// command instead of holding a lock across awaits.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
}

impl RedisStore {
    /// Open a client for `url` and establish the managed connection.
    ///
    /// Every command fails after `response_timeout`, so a stalled server
    /// surfaces as a store error instead of a hung request.
    pub async fn connect(
        url: &str,
        response_timeout: Duration,
        connect_timeout: Duration,
    ) -> AppResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| AppError::StoreError(format!("Failed to create Redis client: {e}")))?;

        let config = ConnectionManagerConfig::new()
            .set_response_timeout(response_timeout)
            .set_connection_timeout(connect_timeout);
        let connection = ConnectionManager::new_with_config(client, config)
            .await
            .map_err(|e| AppError::StoreError(format!("Failed to connect to Redis: {e}")))?;

        info!(
            response_timeout_ms = response_timeout.as_millis() as u64,
            "Connected to Redis store"
        );
        Ok(Self { connection })
    }
}

fn store_err(op: &str, e: redis::RedisError) -> AppError {
    AppError::StoreError(format!("Redis {op} error: {e}"))
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut conn = self.connection.clone();
        conn.get(key).await.map_err(|e| store_err("get", e))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        let mut conn = self.connection.clone();
        // EX takes whole seconds and rejects zero
        let secs = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, value, secs)
            .await
            .map_err(|e| store_err("set", e))
    }

    async fn del(&self, key: &str) -> AppResult<()> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(key).await.map_err(|e| store_err("del", e))
    }

    async fn keys(&self, pattern: &str) -> AppResult<Vec<String>> {
        let mut conn = self.connection.clone();
        conn.keys(pattern).await.map_err(|e| store_err("keys", e))
    }

    async fn ping(&self) -> AppResult<()> {
        let mut conn = self.connection.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| store_err("ping", e))
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
