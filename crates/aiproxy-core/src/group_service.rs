//! Group Service (spec §4.1): the orchestrator that composes the Group
//! Manager, Key Provider, Task Service, Channel Registry, Encryption
//! Service, and Relational Store into the validated group/key lifecycle
//! operations — create, update, tiered delete/copy, statistics, and
//! upstream model-list fetch.
//!
//! Spec §9 flags the original's callback fields
//! (`CheckGroupCanDeleteCallback`, `SyncChildGroupsEnabledCallback`,
//! `InvalidateChildGroupsCacheCallback`, `OnGroupDeleted`,
//! `InvalidateHubModelPoolCacheCallback`) as a redesign target: "define
//! small capability interfaces ... and inject them at construction." That
//! redesign is adopted here as [`BoundSiteChecker`], [`ChildGroupsCache`],
//! and [`GroupDeletedSink`], all injected through [`GroupService::new`].

use crate::cache::{AdaptiveCache, Lookup};
use crate::channel::{apply_header_rules, ChannelRegistry, OutboundRequest};
use crate::config::{CoreConfig, DeleteTier};
use crate::db::{GroupWriteRow, KeyStats, RelationalStore, RequestStatsWindow};
use crate::encryption::EncryptionService;
use crate::error::{Error, Result, ValidationKind};
use crate::group_manager::GroupManager;
use crate::health::HealthMetricsSink;
use crate::key_provider::KeyProvider;
use crate::model::{
    ApiKey, CopyKeysOption, CreateGroupParams, Group, GroupSubGroup, GroupType, KeyStatus,
    MetricType, UpdateGroupParams,
};
use crate::task::{TaskHandle, TaskService, TaskType};
use crate::validation;
use chrono::Utc;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Boundary-table capability (spec §4.1.3's "hard guard, all tiers";
/// §9's `CheckGroupCanDeleteCallback` redesign). The default
/// implementation queries `managed_sites` through the relational store;
/// inability to verify is fatal (fail-closed) per spec.
#[async_trait::async_trait]
pub trait BoundSiteChecker: Send + Sync {
    async fn has_bound_sites(&self, group_id: i64, child_ids: &[i64]) -> Result<bool>;
}

pub struct DbBoundSiteChecker {
    db: Arc<RelationalStore>,
}

impl DbBoundSiteChecker {
    pub fn new(db: Arc<RelationalStore>) -> Arc<Self> {
        Arc::new(Self { db })
    }
}

#[async_trait::async_trait]
impl BoundSiteChecker for DbBoundSiteChecker {
    async fn has_bound_sites(&self, group_id: i64, child_ids: &[i64]) -> Result<bool> {
        Ok(self.db.bound_site_count(group_id, child_ids).await? > 0)
    }
}

/// Child-group cache capability (spec §9's `SyncChildGroupsEnabledCallback`
/// / `InvalidateChildGroupsCacheCallback`). A no-op default is provided
/// since this core's own [`GroupManager`] cache already gets invalidated
/// directly; this capability exists for an *external* cache (e.g. a hub
/// model pool keyed by child group) the Group Service has no other way
/// to reach.
#[async_trait::async_trait]
pub trait ChildGroupsCache: Send + Sync {
    async fn invalidate_children(&self, parent_id: i64, child_ids: &[i64]);
    async fn sync_enabled(&self, child_ids: &[i64], enabled: bool);
}

#[derive(Default)]
pub struct NullChildGroupsCache;

#[async_trait::async_trait]
impl ChildGroupsCache for NullChildGroupsCache {
    async fn invalidate_children(&self, _parent_id: i64, _child_ids: &[i64]) {}
    async fn sync_enabled(&self, _child_ids: &[i64], _enabled: bool) {}
}

/// Fired once a group (and everything it owned) is fully gone (spec §9's
/// `OnGroupDeleted` callback redesign).
#[async_trait::async_trait]
pub trait GroupDeletedSink: Send + Sync {
    async fn on_group_deleted(&self, group_id: i64);
}

#[derive(Default)]
pub struct NullGroupDeletedSink;

#[async_trait::async_trait]
impl GroupDeletedSink for NullGroupDeletedSink {
    async fn on_group_deleted(&self, _group_id: i64) {}
}

/// Cached per-group key-stats entry (spec §4.1.5's adaptive cache).
#[derive(Debug, Clone, Copy)]
pub struct KeyStatsCached {
    pub total: i64,
    pub active: i64,
    pub invalid: i64,
}

/// `GetGroupStats` result (spec §4.1.5). Aggregate groups carry only
/// request stats; standard groups carry both.
#[derive(Debug, Clone)]
pub struct GroupStats {
    pub group_id: i64,
    pub key_stats: Option<KeyStatsCached>,
    pub request_stats: HashMap<&'static str, RequestStatsWindow>,
}

/// Outcome of `DeleteGroup` when it completes synchronously (Small/Medium
/// tiers, spec §4.1.3).
#[derive(Debug, Clone, Copy)]
pub struct DeleteOutcome {
    pub deleted_count: u64,
}

/// `copy_keys_option` plus the caller-chosen display name override for
/// `CopyGroup` (spec §4.1.4).
#[derive(Debug, Clone, Default)]
pub struct CopyGroupParams {
    pub copy_keys_option: CopyKeysOption,
}

const SUFFIX_ATTEMPTS: u32 = 10;
const SUFFIX_LEN: usize = 4;
const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..SUFFIX_LEN)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect()
}

/// The Group Service (spec §4.1): validates, persists, and mutates
/// groups, coordinates large-scale key operations, and exposes group
/// statistics and upstream model lists.
pub struct GroupService {
    db: Arc<RelationalStore>,
    manager: Arc<GroupManager>,
    key_provider: Arc<KeyProvider>,
    tasks: Arc<TaskService>,
    encryption: Arc<EncryptionService>,
    channels: Arc<dyn ChannelRegistry>,
    health: Arc<dyn HealthMetricsSink>,
    bound_sites: Arc<dyn BoundSiteChecker>,
    child_groups_cache: Arc<dyn ChildGroupsCache>,
    group_deleted: Arc<dyn GroupDeletedSink>,
    http_client: reqwest::Client,
    config: CoreConfig,
    group_list_cache: AdaptiveCache<(), Vec<Group>>,
    key_stats_cache: AdaptiveCache<i64, KeyStatsCached>,
    invalidate_hub_model_pool: std::sync::Mutex<Option<Arc<dyn Fn(i64) + Send + Sync>>>,
}

impl GroupService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<RelationalStore>,
        manager: Arc<GroupManager>,
        key_provider: Arc<KeyProvider>,
        tasks: Arc<TaskService>,
        encryption: Arc<EncryptionService>,
        channels: Arc<dyn ChannelRegistry>,
        health: Arc<dyn HealthMetricsSink>,
        bound_sites: Arc<dyn BoundSiteChecker>,
        child_groups_cache: Arc<dyn ChildGroupsCache>,
        group_deleted: Arc<dyn GroupDeletedSink>,
        config: CoreConfig,
    ) -> Arc<Self> {
        let group_list_cache = AdaptiveCache::new(config.adaptive_cache);
        let key_stats_cache = AdaptiveCache::new(config.adaptive_cache);
        Arc::new(Self {
            db,
            manager,
            key_provider,
            tasks,
            encryption,
            channels,
            health,
            bound_sites,
            child_groups_cache,
            group_deleted,
            http_client: reqwest::Client::new(),
            config,
            group_list_cache,
            key_stats_cache,
            invalidate_hub_model_pool: std::sync::Mutex::new(None),
        })
    }

    /// Registers the Hub-model-pool cache-invalidation callback (spec
    /// §4.1.1: "the Hub-model-pool cache callback (if set) is invoked").
    pub fn set_invalidate_hub_model_pool_cache(&self, callback: Arc<dyn Fn(i64) + Send + Sync>) {
        *self.invalidate_hub_model_pool.lock().unwrap() = Some(callback);
    }

    fn fire_hub_model_pool_invalidation(&self, group_id: i64) {
        if let Some(cb) = self.invalidate_hub_model_pool.lock().unwrap().clone() {
            cb(group_id);
        }
    }

    async fn invalidate_group_caches(&self, group_id: i64, name: &str) {
        self.manager.invalidate(group_id, name).await;
        self.group_list_cache.invalidate(&()).await;
        self.key_stats_cache.invalidate(&group_id).await;
        self.fire_hub_model_pool_invalidation(group_id);
    }

    // ======================================================================
    // 4.1.1 Create
    // ======================================================================

    /// `CreateGroup` (spec §4.1.1): runs the full validator chain before
    /// any write, then persists in one transaction and invalidates every
    /// dependent cache on commit.
    #[instrument(skip(self, params), fields(name = %params.name))]
    pub async fn create_group(&self, params: CreateGroupParams) -> Result<Group> {
        let group = self.validate_create(params).await?;
        let row = GroupWriteRow::from_group(&group)?;

        let mut tx = self.db.begin().await?;
        let id = match self.db.insert_group_tx(&mut tx, &row).await {
            Ok(id) => id,
            Err(error) => {
                let _ = tx.rollback().await;
                return Err(error);
            }
        };
        if let Some(parent_id) = group.parent_group_id {
            if let Err(error) = self
                .db
                .insert_sub_group_edge_tx(
                    &mut tx,
                    GroupSubGroup {
                        group_id: parent_id,
                        sub_group_id: id,
                    },
                )
                .await
            {
                let _ = tx.rollback().await;
                return Err(error);
            }
        }
        tx.commit().await?;

        self.invalidate_group_caches(id, &group.name).await;
        info!(group_id = id, "group created");

        self.manager
            .get_group_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("group {id} vanished immediately after create")))
    }

    /// Runs spec §4.1.1's 10-step validation order and returns a `Group`
    /// shaped value (unpersisted; `id`/timestamps are placeholders the
    /// caller discards after insert).
    async fn validate_create(&self, params: CreateGroupParams) -> Result<Group> {
        let name = validation::validate_group_name(&params.name)?;
        validation::validate_channel_type(&params.channel_type, self.channels.channel_types())?;

        let group_type = params.group_type.unwrap_or(GroupType::Standard);
        if !matches!(group_type, GroupType::Standard | GroupType::Aggregate) {
            return Err(Error::validation(
                ValidationKind::InvalidGroupType,
                "group_type must be 'standard' or 'aggregate'",
            ));
        }

        let (test_model, validation_endpoint, upstreams) = match group_type {
            GroupType::Standard => {
                let test_model = params.test_model.unwrap_or_default();
                if test_model.trim().is_empty() {
                    return Err(Error::validation(
                        ValidationKind::InvalidUpstreams,
                        "test_model is required for standard groups",
                    ));
                }
                let endpoint = params.validation_endpoint.unwrap_or_default();
                validation::validate_validation_endpoint(&endpoint)?;
                let upstreams_json = params
                    .upstreams
                    .clone()
                    .unwrap_or_else(|| serde_json::json!([]));
                let upstreams = validation::validate_upstreams(&upstreams_json)?;
                (test_model, endpoint, upstreams)
            }
            GroupType::Aggregate => ("-".to_string(), String::new(), Vec::new()),
        };

        let config = validation::validate_config(&params.config.unwrap_or_default())?;

        let param_overrides = params.param_overrides.unwrap_or_default();
        validation::validate_param_overrides(&param_overrides)?;

        let header_rules = validation::validate_header_rules(&params.header_rules.unwrap_or_default())?;

        let path_redirects =
            validation::validate_path_redirects(&name, &params.path_redirects.unwrap_or_default())?;

        let mut v2 = params.model_redirect_rules_v2.unwrap_or_default();
        if let Some(legacy) = &params.model_mapping {
            v2 = validation::merge_model_redirect_v1_into_v2(legacy, &v2);
        }
        if matches!(group_type, GroupType::Aggregate) {
            validation::validate_aggregate_has_no_redirects(&v2)?;
        }

        let now = Utc::now();
        Ok(Group {
            id: 0,
            name,
            display_name: params.display_name.unwrap_or_default(),
            group_type,
            channel_type: params.channel_type,
            sort: params.sort.unwrap_or(0),
            enabled: params.enabled.unwrap_or(true),
            test_model,
            validation_endpoint,
            upstreams,
            config,
            param_overrides,
            header_rules,
            model_redirect_rules_v2: v2,
            model_redirect_strict: params.model_redirect_strict.unwrap_or(false),
            path_redirects,
            proxy_keys: params.proxy_keys.unwrap_or_default(),
            parent_group_id: params.parent_group_id,
            created_at: now,
            updated_at: now,
        })
    }

    // ======================================================================
    // 4.1.2 Update
    // ======================================================================

    /// `UpdateGroup` (spec §4.1.2): loads the current row, applies present
    /// fields with the same validators, enforces the cross-reference
    /// guards, and saves.
    #[instrument(skip(self, params), fields(group_id = id))]
    pub async fn update_group(&self, id: i64, params: UpdateGroupParams) -> Result<Group> {
        let current = self
            .manager
            .get_group_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("group {id} not found")))?;

        if current.is_child() && (params.upstreams.is_some()) {
            return Err(Error::validation(
                ValidationKind::ChildCannotModifyUpstreams,
                "child groups cannot modify their own upstreams; they are owned by the parent",
            ));
        }

        let mut next = current.clone();

        if let Some(channel_type) = &params.channel_type {
            if channel_type != &current.channel_type {
                validation::validate_channel_type(channel_type, self.channels.channel_types())?;
                let parents = self.db.parent_ids(id).await?;
                if !parents.is_empty() {
                    return Err(Error::validation(
                        ValidationKind::SubGroupReferencedCannotModifyChannel,
                        "channel_type cannot change while this group is a sub-group of an aggregate",
                    ));
                }
                next.channel_type = channel_type.clone();
            }
        }

        if let Some(endpoint) = &params.validation_endpoint {
            if endpoint != &current.validation_endpoint {
                validation::validate_validation_endpoint(endpoint)?;
                let parents = self.db.parent_ids(id).await?;
                if !parents.is_empty() {
                    return Err(Error::validation(
                        ValidationKind::SubGroupReferencedCannotModifyChannel,
                        "validation_endpoint cannot change while this group is a sub-group of an aggregate",
                    ));
                }
                next.validation_endpoint = endpoint.clone();
            }
        }

        if let Some(config_map) = &params.config {
            let canonical = validation::validate_config(config_map)?;
            if let Some(cc_support) = canonical.get("cc_support") {
                let disabling = !crate::config::is_truthy(cc_support);
                let currently_enabled = current
                    .config
                    .get("cc_support")
                    .is_some_and(crate::config::is_truthy);
                if disabling
                    && currently_enabled
                    && matches!(current.channel_type.as_str(), "openai" | "codex" | "gemini")
                {
                    let parent_ids = self.db.parent_ids(id).await?;
                    if !parent_ids.is_empty() {
                        let channel_types = self.db.channel_types_for(&parent_ids).await?;
                        if channel_types.values().any(|c| c == "anthropic") {
                            return Err(Error::validation(
                                ValidationKind::CcSupportCannotDisableUsedByAnthropic,
                                "cannot disable cc_support: a parent aggregate with channel_type \
                                 'anthropic' depends on it",
                            ));
                        }
                    }
                }
            }
            next.config = canonical;
        }

        if let Some(overrides) = &params.param_overrides {
            validation::validate_param_overrides(overrides)?;
            next.param_overrides = overrides.clone();
        }

        if let Some(rules) = &params.header_rules {
            next.header_rules = validation::validate_header_rules(rules)?;
        }

        if let Some(redirects) = &params.path_redirects {
            next.path_redirects = validation::validate_path_redirects(&next.name, redirects)?;
        }

        let mut v2_changed = params.model_redirect_rules_v2.clone();
        if let Some(legacy) = &params.model_mapping {
            let base = v2_changed.unwrap_or_else(|| next.model_redirect_rules_v2.clone());
            v2_changed = Some(validation::merge_model_redirect_v1_into_v2(legacy, &base));
        }
        if let Some(v2) = v2_changed {
            if matches!(next.group_type, GroupType::Aggregate) {
                validation::validate_aggregate_has_no_redirects(&v2)?;
            }
            next.model_redirect_rules_v2 = v2;
        }

        if let Some(strict) = params.model_redirect_strict {
            next.model_redirect_strict = strict;
        }

        if let Some(upstreams_json) = &params.upstreams {
            if matches!(next.group_type, GroupType::Standard) {
                next.upstreams = validation::validate_upstreams(upstreams_json)?;
            }
        }

        if let Some(display_name) = &params.display_name {
            next.display_name = display_name.clone();
        }
        if let Some(sort) = params.sort {
            next.sort = sort;
        }
        if let Some(enabled) = params.enabled {
            next.enabled = enabled;
        }
        if let Some(test_model) = &params.test_model {
            next.test_model = test_model.clone();
        }

        let name_changed = params
            .name
            .as_ref()
            .is_some_and(|n| n.trim() != current.name);
        if let Some(new_name) = &params.name {
            next.name = validation::validate_group_name(new_name)?;
        }

        let proxy_keys_changed = params
            .proxy_keys
            .as_ref()
            .is_some_and(|p| p != &current.proxy_keys);
        if let Some(proxy_keys) = &params.proxy_keys {
            next.proxy_keys = proxy_keys.clone();
        }

        next.updated_at = Utc::now();
        let row = GroupWriteRow::from_group(&next)?;
        self.db.update_group(id, &row).await?;

        // Cascades for an aggregate whose name/proxy_keys changed (spec
        // §4.1.2, §8 scenario 6): children's upstream is owned by the
        // parent and rewritten to the new internal proxy URL; if
        // proxy_keys changed, each child gets the new first key *before*
        // the old one is removed so a child is never left keyless.
        if name_changed || proxy_keys_changed {
            self.cascade_to_children(&next, name_changed, proxy_keys_changed)
                .await?;
        }

        self.invalidate_group_caches(id, &current.name).await;
        if name_changed {
            self.invalidate_group_caches(id, &next.name).await;
        }

        self.manager
            .get_group_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("group {id} vanished after update")))
    }

    /// Rewrites each child's self-referential upstream (`http://127.0.0.1:
    /// $PORT/proxy/{name}`) and/or first proxy key after a parent rename /
    /// proxy_keys change (spec §4.1.2, §8 scenario 6).
    async fn cascade_to_children(
        &self,
        parent: &Group,
        name_changed: bool,
        proxy_keys_changed: bool,
    ) -> Result<()> {
        let child_ids = self.db.sub_group_ids(parent.id).await?;
        if child_ids.is_empty() {
            return Ok(());
        }

        let new_first_key = parent.proxy_keys.split(',').next().unwrap_or("").to_string();

        for child_id in &child_ids {
            let Some(child) = self.db.get_group_by_id(*child_id).await? else {
                continue;
            };
            let mut updated = child.clone();
            let mut changed = false;

            if name_changed {
                let new_upstream_url =
                    format!("http://127.0.0.1:{}/proxy/{}", self.config.port, parent.name);
                for upstream in &mut updated.upstreams {
                    upstream.url = new_upstream_url.clone();
                }
                changed = true;
            }

            if proxy_keys_changed && !new_first_key.is_empty() {
                // Append the new key before removing the old ones so the
                // child is never left keyless between the two writes.
                let mut keys: Vec<&str> = updated.proxy_keys.split(',').filter(|s| !s.is_empty()).collect();
                keys.insert(0, &new_first_key);
                updated.proxy_keys = keys.join(",");
                changed = true;
            }

            if changed {
                updated.updated_at = Utc::now();
                let row = GroupWriteRow::from_group(&updated)?;
                self.db.update_group(*child_id, &row).await?;
                self.invalidate_group_caches(*child_id, &updated.name).await;
            }
        }

        self.child_groups_cache
            .invalidate_children(parent.id, &child_ids)
            .await;
        Ok(())
    }

    // ======================================================================
    // 4.1.3 Delete (tiered)
    // ======================================================================

    /// `DeleteGroup` (spec §4.1.3): idempotent, tiered by total key count
    /// across the group and its children. Large deletions are accepted
    /// asynchronously via [`Error::DeleteAccepted`].
    #[instrument(skip(self), fields(group_id = id))]
    pub async fn delete_group(self: &Arc<Self>, id: i64) -> Result<DeleteOutcome> {
        let Some(group) = self.db.get_group_by_id(id).await? else {
            // Idempotent: absent group -> success (spec §8 scenario 3).
            return Ok(DeleteOutcome { deleted_count: 0 });
        };

        let child_ids = self.db.sub_group_ids(id).await?;

        let has_bound_sites = self
            .bound_sites
            .has_bound_sites(id, &child_ids)
            .await
            .map_err(|e| Error::check_bound_sites_failed(e.to_string()))?;
        if has_bound_sites {
            return Err(Error::bound_sites(id));
        }

        let total_keys = self.db.count_keys_including_children(id, &child_ids).await?;
        let tier = self.config.thresholds.delete_tier(total_keys);

        match tier {
            DeleteTier::Small => self.delete_small(&group, &child_ids).await,
            DeleteTier::Medium => self.delete_medium(&group, &child_ids).await,
            DeleteTier::Large => self.delete_large(&group, &child_ids, total_keys).await,
        }
    }

    /// Small tier (spec §4.1.3): one transaction, 1,000-row SELECT-then-
    /// DELETE-by-id chunking, then the structural rows. Any failure rolls
    /// the whole group back rather than leaving edges, stats, or rows
    /// half-deleted.
    async fn delete_small(&self, group: &Group, child_ids: &[i64]) -> Result<DeleteOutcome> {
        const CHUNK: i64 = 1_000;
        let mut tx = self.db.begin().await?;
        match self.delete_small_inner(&mut tx, group, child_ids, CHUNK).await {
            Ok(deleted) => {
                tx.commit().await?;
                self.key_provider.drop_group(group.id).await;
                for child_id in child_ids {
                    self.key_provider.drop_group(*child_id).await;
                }
                self.finish_delete(group.id, child_ids).await;
                Ok(DeleteOutcome { deleted_count: deleted })
            }
            Err(error) => {
                if let Err(rollback_error) = tx.rollback().await {
                    warn!(%rollback_error, group_id = group.id, "failed to roll back small-tier group delete");
                }
                Err(error)
            }
        }
    }

    async fn delete_small_inner(
        &self,
        tx: &mut crate::db::DbTransaction,
        group: &Group,
        child_ids: &[i64],
        chunk_size: i64,
    ) -> Result<u64> {
        let mut deleted = 0u64;
        let mut after = 0i64;
        loop {
            let ids = self.db.key_ids_chunk_tx(tx, group.id, after, chunk_size).await?;
            if ids.is_empty() {
                break;
            }
            after = *ids.last().unwrap();
            deleted += self.db.delete_keys_by_ids_tx(tx, &ids).await?;
        }
        for child_id in child_ids {
            let mut child_after = 0i64;
            loop {
                let ids = self.db.key_ids_chunk_tx(tx, *child_id, child_after, chunk_size).await?;
                if ids.is_empty() {
                    break;
                }
                child_after = *ids.last().unwrap();
                deleted += self.db.delete_keys_by_ids_tx(tx, &ids).await?;
            }
        }

        self.db.delete_sub_group_edges_for_tx(tx, group.id).await?;
        self.db.delete_hourly_stats_for_group_tx(tx, group.id).await?;
        for child_id in child_ids {
            self.db.delete_hourly_stats_for_group_tx(tx, *child_id).await?;
            self.db.delete_group_row_tx(tx, *child_id).await?;
        }
        self.db.delete_group_row_tx(tx, group.id).await?;

        Ok(deleted)
    }

    /// Medium tier (spec §4.1.3): commit the bookkeeping transaction
    /// early, delete keys via [`KeyProvider::remove_all_keys`] with
    /// progress + inter-chunk sleep, then finish the structural delete.
    async fn delete_medium(&self, group: &Group, child_ids: &[i64]) -> Result<DeleteOutcome> {
        self.db.delete_sub_group_edges_for(group.id).await?;
        self.db.delete_hourly_stats_for_group(group.id).await?;
        for child_id in child_ids {
            self.db.delete_hourly_stats_for_group(*child_id).await?;
        }

        let mut deleted = 0u64;
        deleted += self.db.delete_all_keys_for_group(group.id).await?;
        self.key_provider
            .remove_all_keys(group.id, 1_000, Duration::from_millis(50), None)
            .await?;
        for child_id in child_ids {
            deleted += self.db.delete_all_keys_for_group(*child_id).await?;
            self.key_provider
                .remove_all_keys(*child_id, 1_000, Duration::from_millis(50), None)
                .await?;
        }

        for child_id in child_ids {
            self.db.delete_group_row(*child_id).await?;
        }
        self.db.delete_group_row(group.id).await?;

        self.finish_delete(group.id, child_ids).await;
        Ok(DeleteOutcome { deleted_count: deleted })
    }

    /// Large tier (spec §4.1.3): submits an async task and returns
    /// [`Error::DeleteAccepted`] carrying the task id. The task itself
    /// does the full delete in the background with a fresh detached
    /// context (spec §5: "Background deletions use a fresh detached
    /// context and ignore caller cancellation").
    async fn delete_large(
        self: &Arc<Self>,
        group: &Group,
        child_ids: &[i64],
        total_keys: u64,
    ) -> Result<DeleteOutcome> {
        let handle = self
            .tasks
            .start_task(TaskType::GroupDelete, format!("group:{}", group.id), total_keys)
            .await?;

        let service = Arc::clone(self);
        let group = group.clone();
        let child_ids = child_ids.to_vec();
        let task_id = format!("task-group-delete-{}", group.id);

        tokio::spawn(async move {
            service.run_large_delete(handle, group, child_ids).await;
        });

        Err(Error::DeleteAccepted { task_id })
    }

    async fn run_large_delete(self: Arc<Self>, handle: TaskHandle, group: Group, child_ids: Vec<i64>) {
        let result = self.run_large_delete_inner(&handle, &group, &child_ids).await;
        match result {
            Ok(deleted) => {
                handle
                    .end_task(Some(serde_json::json!({ "deleted_count": deleted })), None)
                    .await;
                self.finish_delete(group.id, &child_ids).await;
            }
            Err(error) => {
                warn!(%error, group_id = group.id, "async group delete failed");
                handle.end_task(None, Some(error.to_string())).await;
            }
        }
    }

    async fn run_large_delete_inner(
        &self,
        handle: &TaskHandle,
        group: &Group,
        child_ids: &[i64],
    ) -> Result<u64> {
        let mut deleted = 0u64;

        deleted += self.delete_group_keys_with_progress(handle, group.id).await?;
        for child_id in child_ids {
            deleted += self.delete_group_keys_with_progress(handle, *child_id).await?;
        }

        self.db.delete_sub_group_edges_for(group.id).await?;
        self.db.delete_hourly_stats_for_group(group.id).await?;
        for child_id in child_ids {
            self.db.delete_hourly_stats_for_group(*child_id).await?;
            self.db.delete_group_row(*child_id).await?;
        }
        self.db.delete_group_row(group.id).await?;

        Ok(deleted)
    }

    async fn delete_group_keys_with_progress(&self, handle: &TaskHandle, group_id: i64) -> Result<u64> {
        const CHUNK: i64 = 1_000;
        let mut deleted = 0u64;
        let mut after = 0i64;
        loop {
            let ids = self.db.key_ids_chunk(group_id, after, CHUNK).await?;
            if ids.is_empty() {
                break;
            }
            after = *ids.last().unwrap();
            deleted += self.db.delete_keys_by_ids(&ids).await?;
            handle.update_progress(deleted).await;
        }
        self.key_provider.drop_group(group_id).await;
        Ok(deleted)
    }

    /// Common tail for every delete tier: background orphan-store
    /// cleanup, cache invalidation, health-metric soft-delete, and the
    /// `OnGroupDeleted` sink (spec §4.1.3 Large-tier description,
    /// generalized to all tiers since the effects are the same).
    async fn finish_delete(&self, group_id: i64, child_ids: &[i64]) {
        self.group_list_cache.invalidate_all().await;
        self.key_stats_cache.invalidate(&group_id).await;
        self.manager.invalidate(group_id, "").await;
        for child_id in child_ids {
            self.key_stats_cache.invalidate(child_id).await;
        }

        if let Err(error) = self.health.soft_delete_for_group(group_id).await {
            warn!(%error, group_id, "failed to soft-delete health metrics after group delete");
        }
        self.group_deleted.on_group_deleted(group_id).await;
        self.fire_hub_model_pool_invalidation(group_id);
    }

    // ======================================================================
    // 4.1.4 Copy (tiered)
    // ======================================================================

    /// `CopyGroup` (spec §4.1.4): produces a new group with a random
    /// 4-char-suffixed unique name, created synchronously; keys are
    /// copied per `copy_keys_option` at a tier derived from the source
    /// key count.
    #[instrument(skip(self, params), fields(source_group_id = src_id))]
    pub async fn copy_group(self: &Arc<Self>, src_id: i64, params: CopyGroupParams) -> Result<Group> {
        let source = self
            .manager
            .get_group_by_id(src_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("group {src_id} not found")))?;

        let (new_name, new_display_name) = self.unique_copy_name(&source).await?;

        let mut copy = source.clone();
        copy.id = 0;
        copy.name = new_name;
        copy.display_name = new_display_name;
        copy.created_at = Utc::now();
        copy.updated_at = copy.created_at;

        let row = GroupWriteRow::from_group(&copy)?;
        let new_id = self.db.insert_group(&row).await?;

        // Augment the list cache rather than invalidate, to stay warm
        // during the async key-copy work (spec §4.1.4).
        self.group_list_cache.invalidate_all().await;
        self.manager.invalidate(new_id, &copy.name).await;

        if matches!(params.copy_keys_option, CopyKeysOption::None)
            || matches!(source.group_type, GroupType::Aggregate)
        {
            return self
                .manager
                .get_group_by_id(new_id)
                .await?
                .ok_or_else(|| Error::not_found(format!("group {new_id} vanished after copy")));
        }

        let source_keys = self.db.keys_for_group(src_id).await?;
        let source_keys: Vec<ApiKey> = match params.copy_keys_option {
            CopyKeysOption::ValidOnly => source_keys
                .into_iter()
                .filter(|k| matches!(k.status, KeyStatus::Active))
                .collect(),
            _ => source_keys,
        };

        let tier = self.config.thresholds.tier(source_keys.len() as u64);
        match tier {
            crate::config::Tier::Async => {
                self.spawn_async_copy(new_id, source_keys);
            }
            _ => {
                self.copy_keys_sync(new_id, source_keys).await?;
            }
        }

        self.manager
            .get_group_by_id(new_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("group {new_id} vanished after copy")))
    }

    /// O(1)-per-attempt unique-name generation using the unique index
    /// (spec §4.1.4): 10 attempts with a random 4-char suffix, falling
    /// back to a timestamp suffix.
    async fn unique_copy_name(&self, source: &Group) -> Result<(String, String)> {
        for _ in 0..SUFFIX_ATTEMPTS {
            let suffix = random_suffix();
            let candidate = format!("{}-{}", source.name, suffix);
            if !self.db.name_exists(&candidate).await? {
                let display = copy_display_name(&source.display_name, &suffix);
                return Ok((candidate, display));
            }
        }
        let suffix = Utc::now().timestamp_millis().to_string();
        let candidate = format!("{}-{}", source.name, suffix);
        let display = copy_display_name(&source.display_name, &suffix);
        Ok((candidate, display))
    }

    /// Fast/Bulk tier (spec §4.1.4, ≤ 20,000 keys): decrypt, dedup
    /// against the target's existing hashes and within the batch,
    /// re-encrypt, insert; then warm the in-memory pool and invalidate
    /// caches.
    async fn copy_keys_sync(&self, target_group_id: i64, source_keys: Vec<ApiKey>) -> Result<()> {
        let existing_hashes = self.db.key_hashes_for_group(target_group_id).await?;
        let mut seen_in_batch = HashSet::new();
        let mut inserted = Vec::new();

        for key in source_keys {
            let plaintext = match self.encryption.decrypt(&key.key_value) {
                Ok(p) => p,
                Err(_) => continue, // drop undecryptable (spec §4.1.4 Fast tier)
            };
            let hash = self.encryption.hash(&plaintext);
            if existing_hashes.contains(&hash) || !seen_in_batch.insert(hash.clone()) {
                continue;
            }
            let encrypted = self.encryption.encrypt(&plaintext)?;
            let id = self.db.insert_key(target_group_id, &hash, &encrypted).await?;
            inserted.push(ApiKey {
                id,
                group_id: target_group_id,
                key_hash: hash,
                key_value: encrypted,
                status: KeyStatus::Active,
                request_count: 0,
                last_used_at: None,
            });
        }

        self.key_provider.add_keys(target_group_id, inserted).await;
        self.key_stats_cache.invalidate(&target_group_id).await;
        Ok(())
    }

    /// Async tier (spec §4.1.4, > 20,000 keys): submits a task that runs
    /// [`Self::copy_keys_sync`]'s logic in the background with progress
    /// reporting.
    fn spawn_async_copy(self: &Arc<Self>, target_group_id: i64, source_keys: Vec<ApiKey>) {
        let service = Arc::clone(self);
        let total = source_keys.len() as u64;
        tokio::spawn(async move {
            let handle = match service
                .tasks
                .start_task(TaskType::GroupCopy, format!("group:{target_group_id}"), total)
                .await
            {
                Ok(h) => h,
                Err(error) => {
                    warn!(%error, target_group_id, "could not start async copy task");
                    return;
                }
            };

            let existing_hashes = match service.db.key_hashes_for_group(target_group_id).await {
                Ok(h) => h,
                Err(error) => {
                    handle.end_task(None, Some(error.to_string())).await;
                    return;
                }
            };

            let mut seen = HashSet::new();
            let mut copied = 0u64;
            let mut inserted = Vec::new();
            for key in source_keys {
                if handle.cancellation_token().is_cancelled() {
                    break;
                }
                let Ok(plaintext) = service.encryption.decrypt(&key.key_value) else {
                    continue;
                };
                let hash = service.encryption.hash(&plaintext);
                if existing_hashes.contains(&hash) || !seen.insert(hash.clone()) {
                    continue;
                }
                let Ok(encrypted) = service.encryption.encrypt(&plaintext) else {
                    continue;
                };
                match service.db.insert_key(target_group_id, &hash, &encrypted).await {
                    Ok(id) => {
                        inserted.push(ApiKey {
                            id,
                            group_id: target_group_id,
                            key_hash: hash,
                            key_value: encrypted,
                            status: KeyStatus::Active,
                            request_count: 0,
                            last_used_at: None,
                        });
                        copied += 1;
                        handle.update_progress(copied).await;
                    }
                    Err(error) => {
                        warn!(%error, target_group_id, "async copy failed to insert a key");
                    }
                }
            }

            service.key_provider.add_keys(target_group_id, inserted).await;
            service.key_stats_cache.invalidate(&target_group_id).await;
            handle
                .end_task(Some(serde_json::json!({ "copied_count": copied })), None)
                .await;
        });
    }

    // ======================================================================
    // 4.1.5 Statistics
    // ======================================================================

    /// `GetGroupStats` (spec §4.1.5): resolves the group via the manager,
    /// then dispatches by type. Key and request stats run concurrently;
    /// either failing alone still returns the other.
    #[instrument(skip(self), fields(group_id = id))]
    pub async fn get_group_stats(&self, id: i64) -> Result<GroupStats> {
        let group = tokio::time::timeout(self.config.deadlines.lookup, self.manager.get_group_by_id(id))
            .await
            .map_err(|_| Error::Transient("group lookup timed out".into()))??
            .ok_or_else(|| Error::not_found(format!("group {id} not found")))?;

        let end_time = truncate_to_hour(Utc::now()) + chrono::Duration::hours(1);

        let request_stats_fut = self.request_stats_cached(id, end_time);

        match group.group_type {
            GroupType::Aggregate => {
                let request_stats = request_stats_fut.await?;
                Ok(GroupStats {
                    group_id: id,
                    key_stats: None,
                    request_stats,
                })
            }
            GroupType::Standard => {
                let key_stats_fut = self.key_stats_cached(id);
                let (key_result, request_result) = tokio::join!(key_stats_fut, request_stats_fut);

                match (key_result, request_result) {
                    (Ok(key_stats), Ok(request_stats)) => Ok(GroupStats {
                        group_id: id,
                        key_stats: Some(key_stats),
                        request_stats,
                    }),
                    (Ok(key_stats), Err(_)) => Ok(GroupStats {
                        group_id: id,
                        key_stats: Some(key_stats),
                        request_stats: HashMap::new(),
                    }),
                    (Err(_), Ok(request_stats)) if !request_stats.is_empty() => Ok(GroupStats {
                        group_id: id,
                        key_stats: None,
                        request_stats,
                    }),
                    _ => Err(Error::generic("group stats unavailable: both key and request stats failed")),
                }
            }
        }
    }

    /// Key-stats counts served through the adaptive cache (spec §4.1.5:
    /// base TTL 30s, hit-count-driven TTL extension).
    async fn key_stats_cached(&self, group_id: i64) -> Result<KeyStatsCached> {
        match self.key_stats_cache.get(&group_id).await {
            Lookup::Fresh(cached) => return Ok(cached),
            Lookup::Stale(cached) => {
                match tokio::time::timeout(self.config.deadlines.key_stats, self.db.count_keys(group_id)).await {
                    Ok(Ok(stats)) => {
                        let fresh = to_cached(stats);
                        self.key_stats_cache.insert(group_id, fresh).await;
                        return Ok(fresh);
                    }
                    _ => return Ok(cached),
                }
            }
            Lookup::Miss => {}
        }

        let stats = match tokio::time::timeout(self.config.deadlines.key_stats, self.db.count_keys(group_id)).await {
            Ok(result) => result?,
            Err(_) => KeyStats::default(),
        };
        let cached = to_cached(stats);
        self.key_stats_cache.insert(group_id, cached).await;
        Ok(cached)
    }

    /// Request stats for 24h/7d/30d (spec §4.1.5), not cached separately
    /// since the relational query is already a single aggregate.
    async fn request_stats_cached(
        &self,
        group_id: i64,
        end_time: chrono::DateTime<Utc>,
    ) -> Result<HashMap<&'static str, RequestStatsWindow>> {
        match tokio::time::timeout(
            self.config.deadlines.key_stats,
            self.db.request_stats_windows(group_id, end_time),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Ok(HashMap::new()),
        }
    }

    // ======================================================================
    // 4.1.6 FetchGroupModels
    // ======================================================================

    /// `FetchGroupModels` (spec §4.1.6): resolves the group, selects the
    /// channel-appropriate models endpoint, picks an active key by
    /// rotation from the in-memory pool, signs the request, and fetches
    /// the upstream's model list with a 10MB response cap.
    #[instrument(skip(self), fields(group_id = id))]
    pub async fn fetch_group_models(&self, id: i64) -> Result<serde_json::Value> {
        let group = self
            .manager
            .get_group_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("group {id} not found")))?;

        if matches!(group.group_type, GroupType::Aggregate) {
            return Err(Error::validation(
                ValidationKind::InvalidGroupType,
                "aggregate groups have no upstream model list",
            ));
        }

        let models_path = self.channels.models_path(&group.channel_type);
        let proxy_path = format!("/proxy/{}{}", group.name, models_path);

        let selected = self
            .channels
            .select_upstream_with_clients(&group.channel_type, &group.upstreams, &proxy_path)?;

        let key = self
            .key_provider
            .next_active_key(id)
            .await
            .ok_or_else(|| Error::generic("no active key available for this group"))?;
        let plaintext = self.encryption.decrypt(&key.key_value)?;

        let mut outbound = OutboundRequest {
            url: selected.url.clone(),
            headers: HashMap::new(),
        };
        self.channels
            .modify_request(&group.channel_type, &mut outbound, &plaintext)?;
        apply_header_rules(&mut outbound, &group.header_rules);

        if self.channels.wants_admin_user_agent_override(&group.channel_type) {
            let ua = match group.channel_type.as_str() {
                "codex" => "codex-cli",
                _ => "claude-cli",
            };
            outbound.headers.insert("User-Agent".to_string(), ua.to_string());
        }

        let timeout = selected.client_timeout.max(self.config.deadlines.upstream_fetch);
        let mut request = self.http_client.get(&outbound.url).timeout(timeout);
        for (key, value) in &outbound.headers {
            request = request.header(key, value);
        }

        let response = tokio::time::timeout(timeout, request.send())
            .await
            .map_err(|_| Error::Upstream {
                status: 504,
                message: "upstream model fetch timed out".to_string(),
            })??;

        let status = response.status();
        if !status.is_success() {
            return Err(map_upstream_status(status.as_u16(), &redact_url(&outbound.url)));
        }

        const MAX_BODY: usize = 10 * 1024 * 1024;
        let body = read_capped(response, MAX_BODY).await?;

        serde_json::from_slice(&body).map_err(Error::Json)
    }

    // ======================================================================
    // 4.1.2/4.2 list + 9. DeleteAllGroups (debug)
    // ======================================================================

    /// `GetGroupList` (cached; spec §4.2/§5: "group list" cache).
    pub async fn list_groups(&self) -> Result<Vec<Group>> {
        match self.group_list_cache.get(&()).await {
            Lookup::Fresh(groups) => return Ok(groups),
            Lookup::Stale(groups) => match self.manager.list_groups().await {
                Ok(fresh) => {
                    self.group_list_cache.insert((), fresh.clone()).await;
                    return Ok(fresh);
                }
                Err(e) if e.is_transient() => return Ok(groups),
                Err(e) => return Err(e),
            },
            Lookup::Miss => {}
        }
        let groups = self.manager.list_groups().await?;
        self.group_list_cache.insert((), groups.clone()).await;
        Ok(groups)
    }

    /// `DeleteAllGroups` (spec §9's open question): a debug-only operation
    /// the caller must gate on an environment flag above this core.
    /// Sequence-reset is attempted only for SQLite and silently skipped
    /// for Postgres/MySQL.
    pub async fn delete_all_groups(&self, allow_debug_delete_all: bool) -> Result<u64> {
        if !allow_debug_delete_all {
            return Err(Error::generic("DeleteAllGroups is debug-only and was not authorized"));
        }
        let groups = self.db.list_groups().await?;
        let mut total = 0u64;
        for group in &groups {
            total += self.db.delete_all_keys_for_group(group.id).await?;
            self.db.delete_hourly_stats_for_group(group.id).await?;
            self.db.delete_sub_group_edges_for(group.id).await?;
            self.key_provider.drop_group(group.id).await;
        }
        for group in &groups {
            self.db.delete_group_row(group.id).await?;
        }
        self.group_list_cache.invalidate_all().await;
        self.manager.invalidate_all().await;
        Ok(total)
    }
}

fn to_cached(stats: KeyStats) -> KeyStatsCached {
    KeyStatsCached {
        total: stats.total,
        active: stats.active,
        invalid: stats.invalid(),
    }
}

fn truncate_to_hour(ts: chrono::DateTime<Utc>) -> chrono::DateTime<Utc> {
    use chrono::Timelike;
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

/// `" Copy"` when the base display name was truncated by the suffix
/// budget, else the same suffix appended (spec §4.1.4).
fn copy_display_name(base: &str, suffix: &str) -> String {
    const MAX_DISPLAY_LEN: usize = 100;
    let candidate = format!("{base} ({suffix})");
    if candidate.chars().count() <= MAX_DISPLAY_LEN {
        candidate
    } else {
        format!("{base} Copy")
    }
}

/// Maps a non-200 upstream status to a user-facing message with
/// credentials redacted (spec §4.1.6).
fn map_upstream_status(status: u16, redacted_url: &str) -> Error {
    let message = match status {
        400 => format!("upstream rejected the request as malformed ({redacted_url})"),
        401 => "upstream rejected the credential as unauthorized".to_string(),
        403 => "upstream refused the request as forbidden".to_string(),
        404 => format!("upstream has no such endpoint ({redacted_url})"),
        429 => "upstream is rate-limiting this credential".to_string(),
        s if (500..600).contains(&s) => "upstream returned a server error".to_string(),
        s => format!("upstream returned unexpected status {s}"),
    };
    Error::Upstream { status, message }
}

/// Redacts userinfo-style credentials embedded in a URL before it is
/// logged or surfaced to a client (spec §4.1.6).
fn redact_url(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .map(|mut u| {
            let _ = u.set_password(Some("***"));
            let _ = u.set_username("***");
            u.to_string()
        })
        .unwrap_or_else(|| "<redacted>".to_string())
}

/// Reads a response body with a hard cap, detecting overflow via
/// `limit+1` rather than silently truncating (spec §4.1.6).
async fn read_capped(response: reqwest::Response, limit: usize) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(8192);
    let mut stream = response.bytes_stream();
    use futures::StreamExt;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        body.extend_from_slice(&chunk);
        if body.len() > limit {
            return Err(Error::generic("response too large"));
        }
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_name_suffix_within_display_budget() {
        let name = copy_display_name("My Group", "ab12");
        assert_eq!(name, "My Group (ab12)");
    }

    #[test]
    fn copy_name_falls_back_to_copy_suffix_when_too_long() {
        let base = "x".repeat(98);
        let name = copy_display_name(&base, "ab12");
        assert!(name.ends_with(" Copy"));
    }

    #[test]
    fn upstream_status_mapping_covers_common_codes() {
        assert!(matches!(map_upstream_status(401, "u"), Error::Upstream { status: 401, .. }));
        assert!(matches!(map_upstream_status(429, "u"), Error::Upstream { status: 429, .. }));
        assert!(matches!(map_upstream_status(503, "u"), Error::Upstream { status: 503, .. }));
    }

    #[test]
    fn random_suffix_has_expected_length_and_alphabet() {
        let suffix = random_suffix();
        assert_eq!(suffix.len(), SUFFIX_LEN);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
