//! Adaptive, TTL-extending caches (spec §4.1.5, §5).
//!
//! Generalizes `mockforge-core::cache::Cache`'s TTL/eviction bookkeeping
//! with the hit-count-driven TTL extension spec §5 calls out: "under the
//! cache write lock, if the entry has not expired and `HitCount >= 10`
//! and `CurrentTTL < MaxTTL`, set `CurrentTTL <- min(MaxTTL, CurrentTTL *
//! 1.2)`, reset `HitCount`, push `ExpiresAt = now + CurrentTTL`." Unlike
//! the teacher's generic LRU cache, there is no max-size/eviction here —
//! the two caches this core needs (group list, key stats) are both
//! naturally bounded by the number of groups.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::config::AdaptiveCacheConfig;

struct Entry<V> {
    value: V,
    expires_at: Instant,
    current_ttl: Duration,
    hit_count: u64,
}

/// A single-key-space adaptive cache: TTL extends itself under sustained
/// read pressure, and stale entries can be served back to callers on
/// transient upstream failure (spec §5: "transient errors may legitimately
/// return stale cache for read paths").
pub struct AdaptiveCache<K, V> {
    storage: RwLock<HashMap<K, Entry<V>>>,
    config: AdaptiveCacheConfig,
}

/// Outcome of a cache lookup distinguishing a live hit from a stale
/// fallback value a caller may choose to serve on transient error.
pub enum Lookup<V> {
    Fresh(V),
    Stale(V),
    Miss,
}

impl<K: Hash + Eq + Clone, V: Clone> AdaptiveCache<K, V> {
    pub fn new(config: AdaptiveCacheConfig) -> Self {
        Self {
            storage: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Looks up `key`. If found and unexpired, applies the adaptive-TTL
    /// rule under the write lock and returns [`Lookup::Fresh`]. If found
    /// but expired, the stale value is still returned as [`Lookup::Stale`]
    /// so the caller can decide (per spec §5) whether a concurrent
    /// transient failure warrants serving it anyway; otherwise the caller
    /// should re-fetch and call [`Self::insert`].
    pub async fn get(&self, key: &K) -> Lookup<V> {
        let mut storage = self.storage.write().await;
        let Some(entry) = storage.get_mut(key) else {
            return Lookup::Miss;
        };
        let now = Instant::now();
        if now > entry.expires_at {
            return Lookup::Stale(entry.value.clone());
        }

        entry.hit_count += 1;
        if entry.hit_count >= self.config.hit_threshold && entry.current_ttl < self.config.max_ttl {
            let scaled = entry.current_ttl.mul_f64(self.config.ttl_multiplier);
            entry.current_ttl = scaled.min(self.config.max_ttl);
            entry.hit_count = 0;
            entry.expires_at = now + entry.current_ttl;
        }
        Lookup::Fresh(entry.value.clone())
    }

    /// Returns the stale value for `key` regardless of expiry, without
    /// touching hit accounting. Used by read paths on transient DB error.
    pub async fn get_stale(&self, key: &K) -> Option<V> {
        let storage = self.storage.read().await;
        storage.get(key).map(|e| e.value.clone())
    }

    /// Inserts or replaces `key` with a fresh entry at the base TTL.
    pub async fn insert(&self, key: K, value: V) {
        let mut storage = self.storage.write().await;
        storage.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + self.config.base_ttl,
                current_ttl: self.config.base_ttl,
                hit_count: 0,
            },
        );
    }

    /// Removes `key`, used on cross-subsystem invalidation (spec §4.1.1,
    /// §4.2's `CacheInvalidationCallback`).
    pub async fn invalidate(&self, key: &K) {
        self.storage.write().await.remove(key);
    }

    /// Clears the whole cache.
    pub async fn invalidate_all(&self) {
        self.storage.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast_config() -> AdaptiveCacheConfig {
        AdaptiveCacheConfig {
            base_ttl: Duration::from_millis(40),
            max_ttl: Duration::from_millis(200),
            hit_threshold: 3,
            ttl_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn extends_ttl_after_hit_threshold() {
        let cache: AdaptiveCache<&str, i32> = AdaptiveCache::new(fast_config());
        cache.insert("k", 1).await;

        for _ in 0..3 {
            assert!(matches!(cache.get(&"k").await, Lookup::Fresh(1)));
        }
        // 40ms * 2.0 = 80ms; sleeping 50ms should still be fresh if extension applied.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(cache.get(&"k").await, Lookup::Fresh(1)));
    }

    #[tokio::test]
    async fn expires_without_reaching_hit_threshold() {
        let cache: AdaptiveCache<&str, i32> = AdaptiveCache::new(fast_config());
        cache.insert("k", 1).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(cache.get(&"k").await, Lookup::Stale(1)));
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let cache: AdaptiveCache<&str, i32> = AdaptiveCache::new(fast_config());
        cache.insert("k", 1).await;
        cache.invalidate(&"k").await;
        assert!(matches!(cache.get(&"k").await, Lookup::Miss));
    }
}
