//! In-memory cache implementation using moka
//!
//! Each entry carries its own time-to-live, capped by the configured maximum.
//! Conditional writes go through moka's entry API, which serializes
//! concurrent updates of the same key.
//!
//! Keys under [`PINNED_PREFIXES`] (session locks and end markers) live in a
//! second cache without a size bound, so they only ever leave by expiry or
//! an explicit delete. The capacity limit applies to the other entries only.

use super::{CacheLayer, PINNED_PREFIXES};
use anyhow::{Context, Result};
use async_trait::async_trait;
use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};
use moka::Expiry;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default maximum cache capacity (number of entries)
const DEFAULT_MAX_CAPACITY: u64 = 10_000;

/// Default upper bound for entry lifetime (1 hour)
const DEFAULT_MAX_TTL: Duration = Duration::from_secs(3600);

/// JSON-serialized value plus the lifetime it was written with
#[derive(Clone)]
struct CacheEntry {
    data: Arc<String>,
    ttl: Duration,
}

impl CacheEntry {
    fn new<T: Serialize>(value: &T, ttl: Duration) -> Result<Self> {
        let json = serde_json::to_string(value).context("Failed to serialize cache value")?;
        Ok(Self {
            data: Arc::new(json),
            ttl,
        })
    }

    fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.data).context("Failed to deserialize cache value")
    }
}

/// Per-entry expiration policy
struct EntryExpiry;

impl Expiry<String, CacheEntry> for EntryExpiry {
    fn expire_after_create(&self, _key: &String, value: &CacheEntry, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

fn is_pinned(key: &str) -> bool {
    PINNED_PREFIXES.iter().any(|prefix| key.starts_with(prefix))
}

/// In-memory cache using moka
pub struct MemoryCache {
    cache: Cache<String, CacheEntry>,
    pinned: Cache<String, CacheEntry>,
    max_ttl: Duration,
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entry_count", &self.cache.entry_count())
            .field("pinned_count", &self.pinned.entry_count())
            .field("max_ttl", &self.max_ttl)
            .finish()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    /// Create a new memory cache with default settings
    ///
    /// Default configuration:
    /// - Max capacity: 10,000 entries
    /// - Max TTL: 1 hour
    pub fn new() -> Self {
        Self::with_capacity_and_ttl(DEFAULT_MAX_CAPACITY, DEFAULT_MAX_TTL)
    }

    /// Create a new memory cache with custom capacity and lifetime cap
    ///
    /// # Arguments
    /// * `max_capacity` - Maximum number of entries the cache can hold
    /// * `max_ttl` - No entry outlives this, whatever TTL it was written with
    pub fn with_capacity_and_ttl(max_capacity: u64, max_ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(EntryExpiry)
            .build();
        let pinned = Cache::builder().expire_after(EntryExpiry).build();

        Self {
            cache,
            pinned,
            max_ttl,
        }
    }

    /// Get the current number of entries in the cache
    ///
    /// The count is eventually consistent with pending writes.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count() + self.pinned.entry_count()
    }

    fn store(&self, key: &str) -> &Cache<String, CacheEntry> {
        if is_pinned(key) {
            &self.pinned
        } else {
            &self.cache
        }
    }

    fn entry<T: Serialize>(&self, value: &T, ttl: Duration) -> Result<CacheEntry> {
        CacheEntry::new(value, ttl.min(self.max_ttl))
    }
}

#[async_trait]
impl CacheLayer for MemoryCache {
    async fn get<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>> {
        match self.store(key).get(key).await {
            Some(entry) => entry.deserialize().map(Some),
            None => Ok(None),
        }
    }

    async fn set<T: Serialize + Send + Sync>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let entry = self.entry(value, ttl)?;
        self.store(key).insert(key.to_string(), entry).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store(key).invalidate(key).await;
        Ok(())
    }

    async fn set_if_absent<T: Serialize + Send + Sync>(&self, key: &str, value: &T, ttl: Duration) -> Result<bool> {
        let entry = self.entry(value, ttl)?;
        let result = self
            .store(key)
            .entry(key.to_string())
            .or_insert_with(async move { entry })
            .await;
        Ok(result.is_fresh())
    }

    async fn delete_if_eq<T: Serialize + Send + Sync>(&self, key: &str, expected: &T) -> Result<bool> {
        let expected = serde_json::to_string(expected).context("Failed to serialize cache value")?;
        let result = self
            .store(key)
            .entry(key.to_string())
            .and_compute_with(|current| {
                let op = match current {
                    Some(entry) if *entry.value().data == expected => Op::Remove,
                    _ => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;
        Ok(matches!(result, CompResult::Removed(_)))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
