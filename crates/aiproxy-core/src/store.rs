//! Store (spec §2 item 1): an abstract key/value + set interface used for
//! ephemeral queues and caches.
//!
//! `InMemoryStore` is grounded on `mockforge-core::cache::Cache`'s TTL
//! bookkeeping, generalized with the set operations (`SAdd`/`SPopN`/`SCard`)
//! the Request Log Service needs for its pending-log queue (spec §4.4).

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Abstract key/value + set store. Implementations may be in-memory or an
/// external system (e.g. Redis); this core only depends on the trait.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Option<Vec<u8>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration);
    async fn del(&self, keys: &[String]);
    async fn sadd(&self, set_key: &str, member: &str) -> bool;
    /// Atomically pops up to `n` members from the set, returning them.
    async fn spop_n(&self, set_key: &str, n: usize) -> Vec<String>;
    async fn scard(&self, set_key: &str) -> u64;
}

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// Default in-memory [`Store`] implementation.
#[derive(Default)]
pub struct InMemoryStore {
    values: RwLock<HashMap<String, Entry>>,
    sets: RwLock<HashMap<String, HashSet<String>>>,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let values = self.values.read().await;
        let entry = values.get(key)?;
        if entry.expires_at < Instant::now() {
            return None;
        }
        Some(entry.value.clone())
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        let mut values = self.values.write().await;
        values.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    async fn del(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        let mut values = self.values.write().await;
        for key in keys {
            values.remove(key);
        }
    }

    async fn sadd(&self, set_key: &str, member: &str) -> bool {
        let mut sets = self.sets.write().await;
        sets.entry(set_key.to_string())
            .or_default()
            .insert(member.to_string())
    }

    async fn spop_n(&self, set_key: &str, n: usize) -> Vec<String> {
        let mut sets = self.sets.write().await;
        let Some(set) = sets.get_mut(set_key) else {
            return Vec::new();
        };
        let popped: Vec<String> = set.iter().take(n).cloned().collect();
        for member in &popped {
            set.remove(member);
        }
        popped
    }

    async fn scard(&self, set_key: &str) -> u64 {
        let sets = self.sets.read().await;
        sets.get(set_key).map_or(0, |s| s.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_roundtrip_respects_ttl() {
        let store = InMemoryStore::new();
        store.set("k", b"v".to_vec(), Duration::from_millis(20)).await;
        assert_eq!(store.get("k").await, Some(b"v".to_vec()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await, None);
    }

    #[tokio::test]
    async fn set_ops_are_atomic_pop() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            store.sadd("pending", &format!("key-{i}")).await;
        }
        assert_eq!(store.scard("pending").await, 5);
        let popped = store.spop_n("pending", 3).await;
        assert_eq!(popped.len(), 3);
        assert_eq!(store.scard("pending").await, 2);
    }

    #[tokio::test]
    async fn sadd_is_idempotent_for_existing_member() {
        let store = InMemoryStore::new();
        assert!(store.sadd("s", "a").await);
        assert!(!store.sadd("s", "a").await);
        assert_eq!(store.scard("s").await, 1);
    }
}
