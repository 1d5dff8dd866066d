use async_trait::async_trait;
use moka::{future::Cache, Expiry};
use std::time::{Duration, Instant};

use crate::{
    error::Result,
    redis::RedisClient,
    window::{Admission, TenantLimitConfig, UsageWindow},
};

/// Key-value cache holding windows, resolved limits and block records.
///
/// Values are JSON strings. `delete` reports whether the key was present.
#[async_trait]
pub trait KeyValueCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// Apply the admission rule to a window in one atomic step.
    ///
    /// Backends without such a primitive return `Ok(None)` and the limiter
    /// serializes the read-decide-write under a key lock instead.
    async fn admit_atomic(
        &self,
        _key: &str,
        _limits: &TenantLimitConfig,
        _now: i64,
        _window_secs: u64,
    ) -> Result<Option<(Admission, UsageWindow)>> {
        Ok(None)
    }

    /// Undo one admission granted by [`KeyValueCache::admit_atomic`] when the
    /// request it admitted could not be served. A window that has since reset
    /// is left alone.
    async fn release_atomic(&self, _key: &str, _admission: Admission, _reset_at: i64) -> Result<bool> {
        Ok(false)
    }

    /// Health check for the cache
    async fn health_check(&self) -> Result<()>;
}

/// Cached value with the TTL it was written with
#[derive(Clone, Debug)]
struct Entry {
    ttl: Duration,
    value: String,
}

struct EntryExpiry;

impl Expiry<String, Entry> for EntryExpiry {
    fn expire_after_create(&self, _key: &String, value: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    // A set on an existing key restarts its TTL, like SET EX
    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process cache with per-entry expiry
pub struct MemoryCache {
    entries: Cache<String, Entry>,
}

impl MemoryCache {
    pub fn new(max_capacity: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(EntryExpiry)
            .build();

        Self { entries }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl KeyValueCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).await.map(|entry| entry.value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries
            .insert(
                key.to_string(),
                Entry {
                    ttl,
                    value: value.to_string(),
                },
            )
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).await.is_some())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Redis-backed cache shared by every limiter process
pub struct RedisCache {
    client: RedisClient,
}

impl RedisCache {
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KeyValueCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.client.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.client.set_ex(key, value, ttl.as_secs()).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.client.delete(key).await
    }

    async fn admit_atomic(
        &self,
        key: &str,
        limits: &TenantLimitConfig,
        now: i64,
        window_secs: u64,
    ) -> Result<Option<(Admission, UsageWindow)>> {
        self.client
            .admit_window(key, limits, now, window_secs)
            .await
            .map(Some)
    }

    async fn release_atomic(&self, key: &str, admission: Admission, reset_at: i64) -> Result<bool> {
        self.client.release_window(key, admission, reset_at).await
    }

    async fn health_check(&self) -> Result<()> {
        self.client.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_cache_roundtrip() {
        let cache = MemoryCache::new(100);
        assert_eq!(cache.get("k").await.unwrap(), None);

        cache.set("k", "v1", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v1"));

        cache.set("k", "v2", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_memory_cache_delete_reports_presence() {
        let cache = MemoryCache::new(100);
        cache.set("k", "v", Duration::from_secs(60)).await.unwrap();

        assert!(cache.delete("k").await.unwrap());
        assert!(!cache.delete("k").await.unwrap());
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_cache_entry_expires() {
        let cache = MemoryCache::new(100);
        cache.set("short", "v", Duration::from_millis(50)).await.unwrap();
        cache.set("long", "v", Duration::from_secs(60)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(cache.get("short").await.unwrap(), None);
        assert!(cache.get("long").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_memory_cache_has_no_atomic_admission() {
        let cache = MemoryCache::default();
        let result = cache
            .admit_atomic("rate_limit:1", &TenantLimitConfig::default(), 0, 3600)
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
