//! Group Manager (spec §4.2): a cached resolver from `group_id`/`group_name`
//! to the fully-resolved [`Group`] record, invalidated on any group
//! mutation.
//!
//! Backed by the same [`AdaptiveCache`] used for key/request stats (spec
//! §5: "Two caches protected by a reader/writer lock each: group list and
//! key-stats map") so repeated resolution under sustained traffic gets
//! the same TTL-extension behavior. A background syncer task periodically
//! refreshes stale entries from the store; a `CacheInvalidationCallback`
//! lets the Group Service invalidate its own dependent caches whenever
//! this manager's cache is invalidated (spec §9's callback-to-capability
//! re-architecture note — modeled here as a plain closure since the
//! manager has no need of the richer capability interfaces).

use crate::cache::{AdaptiveCache, Lookup};
use crate::config::AdaptiveCacheConfig;
use crate::db::RelationalStore;
use crate::error::Result;
use crate::model::Group;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Invoked whenever the manager invalidates cached state, so dependent
/// caches (e.g. the Group Service's group-list cache) can be kept
/// coherent without a direct dependency cycle.
pub type CacheInvalidationCallback = Arc<dyn Fn(i64) + Send + Sync>;

/// Cached resolver from `group_id`/`group_name` -> [`Group`] (spec §4.2).
pub struct GroupManager {
    store: Arc<RelationalStore>,
    by_id: AdaptiveCache<i64, Group>,
    by_name: AdaptiveCache<String, Group>,
    on_invalidate: std::sync::Mutex<Option<CacheInvalidationCallback>>,
    syncing: AtomicBool,
}

impl GroupManager {
    pub fn new(store: Arc<RelationalStore>, cache_config: AdaptiveCacheConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            by_id: AdaptiveCache::new(cache_config),
            by_name: AdaptiveCache::new(cache_config),
            on_invalidate: std::sync::Mutex::new(None),
            syncing: AtomicBool::new(false),
        })
    }

    /// Registers the callback fired on every invalidation (spec §9).
    pub fn set_invalidation_callback(&self, callback: CacheInvalidationCallback) {
        *self.on_invalidate.lock().unwrap() = Some(callback);
    }

    pub async fn get_group_by_id(&self, id: i64) -> Result<Option<Group>> {
        match self.by_id.get(&id).await {
            Lookup::Fresh(group) => return Ok(Some(group)),
            Lookup::Stale(group) => {
                match self.store.get_group_by_id(id).await {
                    Ok(Some(fresh)) => {
                        self.warm(fresh.clone()).await;
                        return Ok(Some(fresh));
                    }
                    Ok(None) => return Ok(None),
                    Err(e) if e.is_transient() => {
                        // transient DB error: serve the stale cache (spec §5).
                        return Ok(Some(group));
                    }
                    Err(e) => return Err(e),
                }
            }
            Lookup::Miss => {}
        }
        let Some(group) = self.store.get_group_by_id(id).await? else {
            return Ok(None);
        };
        self.warm(group.clone()).await;
        Ok(Some(group))
    }

    pub async fn get_group_by_name(&self, name: &str) -> Result<Option<Group>> {
        match self.by_name.get(&name.to_string()).await {
            Lookup::Fresh(group) => return Ok(Some(group)),
            Lookup::Stale(group) => match self.store.get_group_by_name(name).await {
                Ok(Some(fresh)) => {
                    self.warm(fresh.clone()).await;
                    return Ok(Some(fresh));
                }
                Ok(None) => return Ok(None),
                Err(e) if e.is_transient() => return Ok(Some(group)),
                Err(e) => return Err(e),
            },
            Lookup::Miss => {}
        }
        let Some(group) = self.store.get_group_by_name(name).await? else {
            return Ok(None);
        };
        self.warm(group.clone()).await;
        Ok(Some(group))
    }

    /// Lists every group sorted by the manager's single deterministic
    /// clause (spec §4.2: `sort asc, id desc`).
    pub async fn list_groups(&self) -> Result<Vec<Group>> {
        let groups = self.store.list_groups().await?;
        for group in &groups {
            self.warm(group.clone()).await;
        }
        Ok(groups)
    }

    async fn warm(&self, group: Group) {
        self.by_id.insert(group.id, group.clone()).await;
        self.by_name.insert(group.name.clone(), group).await;
    }

    /// Invalidates both cache entries for `id`/`name` and fires the
    /// registered callback (spec §4.1.1: "the Group Manager cache is
    /// invalidated").
    pub async fn invalidate(&self, id: i64, name: &str) {
        self.by_id.invalidate(&id).await;
        self.by_name.invalidate(&name.to_string()).await;
        if let Some(cb) = self.on_invalidate.lock().unwrap().clone() {
            cb(id);
        }
    }

    pub async fn invalidate_all(&self) {
        self.by_id.invalidate_all().await;
        self.by_name.invalidate_all().await;
    }

    /// Spawns the background refresh loop; intended to be called once at
    /// startup. Subsequent calls are no-ops while a syncer is active.
    pub fn spawn_background_sync(self: &Arc<Self>, interval: Duration) {
        if self.syncing.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(error) = manager.refresh_all().await {
                    tracing::warn!(%error, "group manager background sync failed");
                }
            }
        });
    }

    async fn refresh_all(&self) -> Result<()> {
        let groups = self.store.list_groups().await?;
        for group in groups {
            self.warm(group).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbPool;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store() -> Arc<RelationalStore> {
        let pool = SqlitePoolOptions::new()
            .connect(":memory:")
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE groups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT UNIQUE NOT NULL,
                display_name TEXT NOT NULL,
                group_type TEXT NOT NULL,
                channel_type TEXT NOT NULL,
                sort INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                test_model TEXT NOT NULL,
                validation_endpoint TEXT NOT NULL DEFAULT '',
                upstreams_json TEXT NOT NULL,
                config_json TEXT NOT NULL,
                param_overrides_json TEXT NOT NULL,
                header_rules_json TEXT NOT NULL,
                model_redirect_rules_v2_json TEXT NOT NULL,
                model_redirect_strict INTEGER NOT NULL DEFAULT 0,
                path_redirects_json TEXT NOT NULL,
                proxy_keys TEXT NOT NULL DEFAULT '',
                parent_group_id INTEGER,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        Arc::new(RelationalStore::new(DbPool::Sqlite(pool)))
    }

    fn write_row(name: &str) -> crate::db::GroupWriteRow {
        crate::db::GroupWriteRow {
            name: name.to_string(),
            display_name: name.to_string(),
            group_type: "standard",
            channel_type: "openai".to_string(),
            sort: 0,
            enabled: true,
            test_model: "gpt-4".to_string(),
            validation_endpoint: String::new(),
            upstreams_json: "[]".to_string(),
            config_json: "{}".to_string(),
            param_overrides_json: "{}".to_string(),
            header_rules_json: "[]".to_string(),
            model_redirect_rules_v2_json: "{}".to_string(),
            model_redirect_strict: false,
            path_redirects_json: "[]".to_string(),
            proxy_keys: String::new(),
            parent_group_id: None,
        }
    }

    #[tokio::test]
    async fn resolves_by_id_and_name_after_warm() {
        let store = test_store().await;
        let id = store.insert_group(&write_row("alpha")).await.unwrap();
        let manager = GroupManager::new(store, AdaptiveCacheConfig::default());

        let by_id = manager.get_group_by_id(id).await.unwrap().unwrap();
        assert_eq!(by_id.name, "alpha");
        let by_name = manager.get_group_by_name("alpha").await.unwrap().unwrap();
        assert_eq!(by_name.id, id);
    }

    #[tokio::test]
    async fn invalidate_fires_callback() {
        let store = test_store().await;
        let id = store.insert_group(&write_row("beta")).await.unwrap();
        let manager = GroupManager::new(store, AdaptiveCacheConfig::default());
        manager.get_group_by_id(id).await.unwrap();

        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired_clone = fired.clone();
        manager.set_invalidation_callback(Arc::new(move |_id| {
            fired_clone.store(true, Ordering::SeqCst);
        }));
        manager.invalidate(id, "beta").await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn missing_group_resolves_to_none() {
        let store = test_store().await;
        let manager = GroupManager::new(store, AdaptiveCacheConfig::default());
        assert!(manager.get_group_by_id(999).await.unwrap().is_none());
    }
}
