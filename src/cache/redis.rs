//! Redis cache implementation
//!
//! Shares the ephemeral store between several instances.
//!
//! # Features
//! - TTL-based expiration via `SET .. PX`
//! - Lock acquisition via `SET .. NX PX`
//! - Owner-checked release via a Lua compare-and-delete script

use super::CacheLayer;
use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

/// Default upper bound for entry lifetime (1 hour)
const DEFAULT_MAX_TTL: Duration = Duration::from_secs(3600);

/// Deletes KEYS[1] only while it still holds ARGV[1]
static COMPARE_AND_DELETE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call("GET", KEYS[1]) == ARGV[1] then
            return redis.call("DEL", KEYS[1])
        end
        return 0
        "#,
    )
});

/// Redis cache implementation
///
/// Values are stored as JSON strings to support generic types.
pub struct RedisCache {
    /// Multiplexed connection for async operations
    connection: MultiplexedConnection,
    max_ttl: Duration,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("max_ttl", &self.max_ttl)
            .finish_non_exhaustive()
    }
}

impl RedisCache {
    /// Create a new Redis cache with the given connection URL
    ///
    /// # Errors
    /// Returns an error if the connection cannot be established.
    pub async fn new(redis_url: &str) -> Result<Self> {
        Self::with_ttl(redis_url, DEFAULT_MAX_TTL).await
    }

    /// Create a new Redis cache with a custom lifetime cap
    ///
    /// # Errors
    /// Returns an error if the connection cannot be established.
    pub async fn with_ttl(redis_url: &str, max_ttl: Duration) -> Result<Self> {
        let client = Client::open(redis_url).context("Failed to create Redis client")?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to Redis")?;

        Ok(Self { connection, max_ttl })
    }

    /// Expiry in milliseconds, at least one
    fn ttl_millis(&self, ttl: Duration) -> u64 {
        (ttl.min(self.max_ttl).as_millis() as u64).max(1)
    }
}

#[async_trait]
impl CacheLayer for RedisCache {
    async fn get<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.connection.clone();

        let result: Option<String> = conn
            .get(key)
            .await
            .context("Failed to get value from Redis")?;

        match result {
            Some(json) => {
                let value =
                    serde_json::from_str(&json).context("Failed to deserialize cached value")?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set<T: Serialize + Send + Sync>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        let json = serde_json::to_string(value).context("Failed to serialize cache value")?;

        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(json)
            .arg("PX")
            .arg(self.ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .context("Failed to set value in Redis")?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();

        let _: () = conn
            .del(key)
            .await
            .context("Failed to delete key from Redis")?;

        Ok(())
    }

    async fn set_if_absent<T: Serialize + Send + Sync>(&self, key: &str, value: &T, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let json = serde_json::to_string(value).context("Failed to serialize cache value")?;

        // Reply is OK when written, nil when the key already exists
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(json)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .context("Failed to set value in Redis")?;

        Ok(reply.is_some())
    }

    async fn delete_if_eq<T: Serialize + Send + Sync>(&self, key: &str, expected: &T) -> Result<bool> {
        let mut conn = self.connection.clone();
        let expected = serde_json::to_string(expected).context("Failed to serialize cache value")?;

        let deleted: i64 = COMPARE_AND_DELETE
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .context("Failed to delete key from Redis")?;

        Ok(deleted > 0)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis ping failed")?;

        Ok(())
    }
}
