//! Two-level read-through cache.
//!
//! ```text
//! get(key) ──► L1 (per-process LRU, short TTL)
//!                 │ miss
//!                 ▼
//!              L2 (shared cache, longer TTL) ──hit──► populate L1
//! ```
//!
//! Shared-cache failures are logged and treated as misses; writes still land
//! in L1. Invalidation removes matching keys from both levels, scanning the
//! shared cache with a cursor so a large keyspace never blocks it.

use super::lru::LruCache;
use chrono::{DateTime, Utc};
use seatline_core::cache::SharedCache;
use seatline_core::environment::Clock;
use seatline_runtime::metrics::CacheMetrics;
use serde::{Serialize, de::DeserializeOwned};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Cache sizing and lifetimes.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// L1 capacity.
    pub l1_items: usize,
    /// Upper bound on an L1 entry's lifetime.
    pub l1_ttl: Duration,
    /// Default L2 lifetime.
    pub l2_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_items: 10_000,
            l1_ttl: Duration::from_secs(60),
            l2_ttl: Duration::from_secs(300),
        }
    }
}

/// Per-process LRU layered over the shared cache.
pub struct MultiLevelCache {
    local: Mutex<LruCache>,
    shared: Arc<dyn SharedCache>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
}

impl MultiLevelCache {
    /// Create a cache over `shared`.
    #[must_use]
    pub fn new(shared: Arc<dyn SharedCache>, clock: Arc<dyn Clock>, config: CacheConfig) -> Self {
        Self {
            local: Mutex::new(LruCache::new(config.l1_items)),
            shared,
            clock,
            config,
        }
    }

    /// The shared level, for callers that need its primitives directly.
    #[must_use]
    pub fn shared(&self) -> &Arc<dyn SharedCache> {
        &self.shared
    }

    /// Look `key` up in L1, then L2.
    pub async fn get(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        let local_hit = self.local().get(key, now);
        if let Some(value) = local_hit {
            CacheMetrics::record_hit("l1");
            return Some(value);
        }

        match self.shared.get(key).await {
            Ok(Some(value)) => {
                CacheMetrics::record_hit("l2");
                let expires = self.l1_expiry(now, self.config.l2_ttl);
                self.local().put(key, value.clone(), expires);
                Some(value)
            }
            Ok(None) => {
                CacheMetrics::record_miss();
                None
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "Shared cache read failed, treating as miss");
                CacheMetrics::record_miss();
                None
            }
        }
    }

    /// Typed [`get`](Self::get). Undecodable entries are dropped from both levels.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(key, error = %e, "Corrupt cache entry, evicting");
                self.delete(key).await;
                None
            }
        }
    }

    /// Write both levels. `ttl` overrides the L2 lifetime; L1 never outlives
    /// either bound.
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let l2_ttl = ttl.unwrap_or(self.config.l2_ttl);
        let expires = self.l1_expiry(self.clock.now(), l2_ttl);
        self.local().put(key, value.to_string(), expires);

        if let Err(e) = self.shared.set(key, value, l2_ttl).await {
            tracing::warn!(key, error = %e, "Shared cache write failed, skipping");
        }
    }

    /// Typed [`set`](Self::set).
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(key, &raw, ttl).await,
            Err(e) => tracing::error!(key, error = %e, "Failed to encode cache entry"),
        }
    }

    /// Remove one key from both levels.
    pub async fn delete(&self, key: &str) {
        self.local().remove(key);
        if let Err(e) = self.shared.delete(key).await {
            tracing::warn!(key, error = %e, "Shared cache delete failed");
        }
    }

    /// Remove every key matching a glob pattern from both levels. Returns the
    /// number of shared keys deleted.
    pub async fn invalidate(&self, pattern: &str) -> usize {
        self.invalidate_local(pattern);

        let keys = match self.shared.scan_keys(pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(pattern, error = %e, "Shared cache scan failed, skipping invalidation");
                return 0;
            }
        };

        let mut deleted = 0;
        for key in keys {
            match self.shared.delete(&key).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(key, error = %e, "Shared cache delete failed"),
            }
        }
        deleted
    }

    /// Remove matching keys from this process's L1 only.
    pub fn invalidate_local(&self, pattern: &str) -> usize {
        self.local().remove_matching(pattern)
    }

    fn l1_expiry(&self, now: DateTime<Utc>, l2_ttl: Duration) -> DateTime<Utc> {
        let ttl = self.config.l1_ttl.min(l2_ttl);
        now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero())
    }

    fn local(&self) -> std::sync::MutexGuard<'_, LruCache> {
        self.local.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use seatline_testing::{InMemoryCache, MockClock};

    fn cache_pair() -> (MultiLevelCache, Arc<InMemoryCache>, MockClock) {
        let clock = MockClock::at_test_epoch();
        let shared = Arc::new(InMemoryCache::with_clock(Arc::new(clock.clone())));
        let cache = MultiLevelCache::new(
            shared.clone(),
            Arc::new(clock.clone()),
            CacheConfig {
                l1_items: 16,
                l1_ttl: Duration::from_secs(60),
                l2_ttl: Duration::from_secs(300),
            },
        );
        (cache, shared, clock)
    }

    #[tokio::test]
    async fn test_set_writes_both_levels() {
        let (cache, shared, _) = cache_pair();
        cache.set("k", "v", None).await;
        assert_eq!(shared.peek("k").as_deref(), Some("v"));
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_l2_hit_populates_l1() {
        let (cache, shared, _) = cache_pair();
        shared.set("k", "v", Duration::from_secs(300)).await.unwrap();

        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
        shared.set_unavailable(true);
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_l1_expires_before_l2() {
        let (cache, shared, clock) = cache_pair();
        cache.set("k", "v", None).await;
        clock.advance(chrono::Duration::seconds(61));

        shared.set_unavailable(true);
        assert!(cache.get("k").await.is_none());
        shared.set_unavailable(false);
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_short_ttl_bounds_l1() {
        let (cache, shared, clock) = cache_pair();
        cache.set("seatmap", "snapshot", Some(Duration::from_secs(5))).await;
        clock.advance(chrono::Duration::seconds(6));
        assert!(cache.get("seatmap").await.is_none());
        assert!(shared.peek("seatmap").is_none());
    }

    #[tokio::test]
    async fn test_shared_outage_is_a_miss_not_an_error() {
        let (cache, shared, _) = cache_pair();
        shared.set_unavailable(true);
        assert!(cache.get("missing").await.is_none());
        cache.set("k", "v", None).await;
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_invalidate_pattern_clears_both_levels() {
        let (cache, shared, _) = cache_pair();
        cache.set("seatmap:org-1:t1", "a", None).await;
        cache.set("seatmap:org-1:t2", "b", None).await;
        cache.set("seatmap:org-2:t1", "c", None).await;

        assert_eq!(cache.invalidate("seatmap:org-1:*").await, 2);
        assert!(cache.get("seatmap:org-1:t1").await.is_none());
        assert!(shared.peek("seatmap:org-1:t2").is_none());
        assert_eq!(cache.get("seatmap:org-2:t1").await.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_corrupt_json_is_evicted() {
        let (cache, shared, _) = cache_pair();
        cache.set("k", "{not json", None).await;
        assert!(cache.get_json::<Vec<u32>>("k").await.is_none());
        assert!(shared.peek("k").is_none());
    }
}
