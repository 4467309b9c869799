//! Cache layer
//!
//! Backing store for ephemeral session state. It supports:
//! - In-memory cache (moka) - default, for single-instance deployment
//! - Redis cache - optional, shared between instances
//!
//! The cache driver is selected based on configuration. On top of the raw
//! key/value layer, [`EphemeralSessionCache`] adds session keys, expiry and
//! the per-session lock.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tandem::cache::{create_cache, CacheLayer};
//! use tandem::config::CacheConfig;
//!
//! let cache = create_cache(&CacheConfig::default()).await?;
//! cache.set("key", &"value", Duration::from_secs(60)).await?;
//! ```

pub mod memory;
#[cfg(feature = "redis-cache")]
pub mod redis;
pub mod session;

use anyhow::Result;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{CacheConfig, CacheDriver};

/// Cache layer trait
///
/// Note: Due to Rust's object safety rules, this trait cannot be used
/// as a trait object (`dyn CacheLayer`). Use the `Cache` enum instead
/// for runtime polymorphism.
#[async_trait]
pub trait CacheLayer: Send + Sync {
    /// Get a value from cache
    async fn get<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>>;

    /// Set a value in cache with TTL
    async fn set<T: Serialize + Send + Sync>(&self, key: &str, value: &T, ttl: Duration) -> Result<()>;

    /// Delete a value from cache
    async fn delete(&self, key: &str) -> Result<()>;

    /// Store `value` only if `key` holds nothing, atomically.
    ///
    /// Returns whether the value was written.
    async fn set_if_absent<T: Serialize + Send + Sync>(&self, key: &str, value: &T, ttl: Duration) -> Result<bool>;

    /// Delete `key` only while it still holds `expected`, atomically.
    ///
    /// Returns whether the key was deleted.
    async fn delete_if_eq<T: Serialize + Send + Sync>(&self, key: &str, expected: &T) -> Result<bool>;

    /// Check that the backing store is reachable
    async fn ping(&self) -> Result<()>;
}

pub use memory::MemoryCache;
#[cfg(feature = "redis-cache")]
pub use redis::RedisCache;
pub use session::{EphemeralSessionCache, EndMarker, LockLease, OpenedSession, SessionCacheError};

/// Key prefixes of entries that must never be dropped to make room
pub(crate) const PINNED_PREFIXES: &[&str] = &[session::LOCK_PREFIX, session::ENDED_PREFIX];

/// Unified cache enum for runtime polymorphism
///
/// Since `CacheLayer` trait has generic methods, it cannot be used as a trait object.
/// This enum provides runtime polymorphism by wrapping concrete cache implementations.
#[derive(Debug)]
pub enum Cache {
    /// In-memory cache using moka
    Memory(MemoryCache),
    /// Redis cache for multi-instance deployment
    #[cfg(feature = "redis-cache")]
    Redis(RedisCache),
}

#[async_trait]
impl CacheLayer for Cache {
    async fn get<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>> {
        match self {
            Cache::Memory(cache) => cache.get(key).await,
            #[cfg(feature = "redis-cache")]
            Cache::Redis(cache) => cache.get(key).await,
        }
    }

    async fn set<T: Serialize + Send + Sync>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        match self {
            Cache::Memory(cache) => cache.set(key, value, ttl).await,
            #[cfg(feature = "redis-cache")]
            Cache::Redis(cache) => cache.set(key, value, ttl).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self {
            Cache::Memory(cache) => cache.delete(key).await,
            #[cfg(feature = "redis-cache")]
            Cache::Redis(cache) => cache.delete(key).await,
        }
    }

    async fn set_if_absent<T: Serialize + Send + Sync>(&self, key: &str, value: &T, ttl: Duration) -> Result<bool> {
        match self {
            Cache::Memory(cache) => cache.set_if_absent(key, value, ttl).await,
            #[cfg(feature = "redis-cache")]
            Cache::Redis(cache) => cache.set_if_absent(key, value, ttl).await,
        }
    }

    async fn delete_if_eq<T: Serialize + Send + Sync>(&self, key: &str, expected: &T) -> Result<bool> {
        match self {
            Cache::Memory(cache) => cache.delete_if_eq(key, expected).await,
            #[cfg(feature = "redis-cache")]
            Cache::Redis(cache) => cache.delete_if_eq(key, expected).await,
        }
    }

    async fn ping(&self) -> Result<()> {
        match self {
            Cache::Memory(cache) => cache.ping().await,
            #[cfg(feature = "redis-cache")]
            Cache::Redis(cache) => cache.ping().await,
        }
    }
}

/// Create a cache instance based on configuration
///
/// - `CacheDriver::Memory` - Creates an in-memory cache using moka
/// - `CacheDriver::Redis` - Creates a Redis cache (requires `redis-cache` feature)
///
/// # Errors
/// - Returns an error if Redis is configured but the `redis-cache` feature is not enabled
/// - Returns an error if Redis connection fails
pub async fn create_cache(config: &CacheConfig) -> Result<Arc<Cache>> {
    let ttl = Duration::from_secs(config.ttl_seconds);

    match config.driver {
        CacheDriver::Memory => {
            let cache = MemoryCache::with_capacity_and_ttl(config.max_capacity, ttl);
            Ok(Arc::new(Cache::Memory(cache)))
        }
        CacheDriver::Redis => {
            #[cfg(feature = "redis-cache")]
            {
                let redis_url = config.redis_url.as_ref().ok_or_else(|| {
                    anyhow::anyhow!(
                        "Redis URL is required when using Redis cache driver. \
                         Set 'redis_url' in cache configuration or use TANDEM_CACHE_REDIS_URL environment variable."
                    )
                })?;

                let cache = RedisCache::with_ttl(redis_url, ttl).await?;
                Ok(Arc::new(Cache::Redis(cache)))
            }

            #[cfg(not(feature = "redis-cache"))]
            {
                anyhow::bail!(
                    "Redis cache driver is configured but the 'redis-cache' feature is not enabled. \
                     Either enable the feature with `--features redis-cache` or use 'memory' cache driver."
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_memory_cache() {
        let config = CacheConfig::default();
        let cache = create_cache(&config).await.unwrap();

        cache.ping().await.unwrap();
        cache
            .set("test_key", &"test_value".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        let result: Option<String> = cache.get("test_key").await.unwrap();
        assert_eq!(result, Some("test_value".to_string()));
    }

    #[tokio::test]
    async fn test_enum_dispatches_lock_primitives() {
        let cache = create_cache(&CacheConfig::default()).await.unwrap();

        assert!(cache.set_if_absent("l", &"t", Duration::from_secs(60)).await.unwrap());
        assert!(!cache.set_if_absent("l", &"u", Duration::from_secs(60)).await.unwrap());
        assert!(cache.delete_if_eq("l", &"t").await.unwrap());
    }

    #[cfg(not(feature = "redis-cache"))]
    #[tokio::test]
    async fn test_create_redis_cache_without_feature() {
        let config = CacheConfig {
            driver: CacheDriver::Redis,
            redis_url: Some("redis://localhost:6379".to_string()),
            ..CacheConfig::default()
        };

        let result = create_cache(&config).await;
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("redis-cache") && err.contains("feature"));
    }

    #[cfg(feature = "redis-cache")]
    #[tokio::test]
    async fn test_create_redis_cache_without_url() {
        let config = CacheConfig {
            driver: CacheDriver::Redis,
            redis_url: None,
            ..CacheConfig::default()
        };

        let result = create_cache(&config).await;
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Redis URL"));
    }
}
