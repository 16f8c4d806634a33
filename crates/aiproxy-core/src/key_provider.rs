//! Key Provider (spec §2 item 5): an in-memory pool of active keys per
//! group with rotation, mass-removal, and store-synchronization.
//!
//! `FetchGroupModels` (§4.1.6) and the hot request path both select a key
//! via rotation from this pool rather than a DB query, per spec's
//! "in-memory pool" wording. Mutations (`load_group`, `remove_keys`,
//! `remove_all_keys`) keep the pool and the relational store coherent;
//! callers that add keys to the store must also call `load_group` (or
//! `add_keys`) to keep this pool warm.

use crate::error::Result;
use crate::model::ApiKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

struct GroupPool {
    keys: Vec<ApiKey>,
    cursor: AtomicUsize,
}

impl GroupPool {
    fn new(keys: Vec<ApiKey>) -> Self {
        Self {
            keys,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Round-robin pick among active keys; `None` if the pool is empty or
    /// every key is invalid.
    fn next_active(&self) -> Option<ApiKey> {
        let active: Vec<&ApiKey> = self
            .keys
            .iter()
            .filter(|k| matches!(k.status, crate::model::KeyStatus::Active))
            .collect();
        if active.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % active.len();
        Some(active[idx].clone())
    }
}

/// Progress callback invoked during `remove_all_keys` chunked deletion
/// (spec §4.1.3 Medium tier: "`KeyProvider.RemoveAllKeys` with progress
/// callback and inter-chunk sleep").
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// In-memory per-group active-key pool.
#[derive(Default)]
pub struct KeyProvider {
    pools: RwLock<HashMap<i64, GroupPool>>,
}

impl KeyProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replaces the whole in-memory pool for `group_id` (e.g. after a
    /// bulk-copy or cache-warm load from the relational store).
    pub async fn load_group(&self, group_id: i64, keys: Vec<ApiKey>) {
        self.pools.write().await.insert(group_id, GroupPool::new(keys));
    }

    /// Adds keys to an existing pool (creating one if absent), used after
    /// a small/medium-tier key import completes.
    pub async fn add_keys(&self, group_id: i64, mut keys: Vec<ApiKey>) {
        let mut pools = self.pools.write().await;
        pools
            .entry(group_id)
            .or_insert_with(|| GroupPool::new(Vec::new()))
            .keys
            .append(&mut keys);
    }

    /// Picks the next active key for `group_id` by rotation (spec §2 item
    /// 5, §4.1.6).
    pub async fn next_active_key(&self, group_id: i64) -> Option<ApiKey> {
        let pools = self.pools.read().await;
        pools.get(&group_id)?.next_active()
    }

    /// Number of keys currently held in the in-memory pool for `group_id`.
    pub async fn len(&self, group_id: i64) -> usize {
        let pools = self.pools.read().await;
        pools.get(&group_id).map_or(0, |p| p.keys.len())
    }

    /// Removes specific keys (by id) from the in-memory pool; the caller
    /// is responsible for the corresponding DB delete.
    pub async fn remove_keys(&self, group_id: i64, key_ids: &[i64]) {
        let mut pools = self.pools.write().await;
        if let Some(pool) = pools.get_mut(&group_id) {
            pool.keys.retain(|k| !key_ids.contains(&k.id));
        }
    }

    /// Removes all keys for `group_id` in chunks, invoking `progress`
    /// after each chunk and sleeping briefly between chunks (spec §4.1.3
    /// Medium tier). The relational-store deletion itself is the caller's
    /// responsibility — this only empties the in-memory view, chunked to
    /// match the pace of the caller's DB chunking.
    pub async fn remove_all_keys(
        &self,
        group_id: i64,
        chunk_size: usize,
        inter_chunk_delay: std::time::Duration,
        progress: Option<ProgressCallback>,
    ) -> Result<u64> {
        let total = self.len(group_id).await as u64;
        let mut removed = 0u64;
        loop {
            let chunk_ids: Vec<i64> = {
                let pools = self.pools.read().await;
                pools
                    .get(&group_id)
                    .map(|p| p.keys.iter().take(chunk_size).map(|k| k.id).collect())
                    .unwrap_or_default()
            };
            if chunk_ids.is_empty() {
                break;
            }
            self.remove_keys(group_id, &chunk_ids).await;
            removed += chunk_ids.len() as u64;
            if let Some(cb) = &progress {
                cb(removed, total);
            }
            if !inter_chunk_delay.is_zero() {
                tokio::time::sleep(inter_chunk_delay).await;
            }
        }
        self.pools.write().await.remove(&group_id);
        Ok(removed)
    }

    /// Drops the whole pool for `group_id` without chunking (used after a
    /// small-tier synchronous delete already removed the rows in one
    /// transaction).
    pub async fn drop_group(&self, group_id: i64) {
        self.pools.write().await.remove(&group_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::KeyStatus;

    fn key(id: i64, group_id: i64, status: KeyStatus) -> ApiKey {
        ApiKey {
            id,
            group_id,
            key_hash: format!("hash-{id}"),
            key_value: vec![],
            status,
            request_count: 0,
            last_used_at: None,
        }
    }

    #[tokio::test]
    async fn rotates_across_active_keys_only() {
        let provider = KeyProvider::new();
        provider
            .load_group(
                1,
                vec![
                    key(1, 1, KeyStatus::Active),
                    key(2, 1, KeyStatus::Invalid),
                    key(3, 1, KeyStatus::Active),
                ],
            )
            .await;

        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            seen.insert(provider.next_active_key(1).await.unwrap().id);
        }
        assert_eq!(seen, [1, 3].into_iter().collect());
    }

    #[tokio::test]
    async fn empty_pool_returns_none() {
        let provider = KeyProvider::new();
        assert!(provider.next_active_key(42).await.is_none());
    }

    #[tokio::test]
    async fn remove_all_keys_chunks_and_reports_progress() {
        let provider = KeyProvider::new();
        let keys: Vec<_> = (0..10).map(|i| key(i, 1, KeyStatus::Active)).collect();
        provider.load_group(1, keys).await;

        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let calls_clone = calls.clone();
        let cb: ProgressCallback = Arc::new(move |done, total| {
            calls_clone.lock().unwrap().push((done, total));
        });

        let removed = provider
            .remove_all_keys(1, 3, std::time::Duration::ZERO, Some(cb))
            .await
            .unwrap();
        assert_eq!(removed, 10);
        assert_eq!(provider.len(1).await, 0);
        let progression = calls.lock().unwrap().clone();
        assert_eq!(progression.last().unwrap().0, 10);
    }
}
