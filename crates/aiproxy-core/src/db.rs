//! Relational Store (spec §2 item 2): the transactional SQL backend that
//! owns durable state — groups, keys, per-hour stats, request logs,
//! health metrics, and the `managed_sites` boundary table.
//!
//! Three dialects are supported (Postgres, MySQL, SQLite), per spec §4.6's
//! dialect ceiling table and §4.4.4's per-dialect upsert syntax. `sqlx`'s
//! compile-time query macros require a concrete pool type at build time
//! and don't support the dialect-agnostic `Any` driver, so this module
//! uses a small internal [`DbPool`] enum of concrete pools and dispatches
//! per dialect with the [`dispatch`] macro, keeping the *semantics*
//! (batch sizes, conflict columns) aligned with spec §4.4.4 exactly per
//! dialect while sharing Rust-level row mapping via `sqlx::FromRow`,
//! which is generic over the wire format.

use crate::error::{Error, Result};
use crate::model::{
    ApiKey, DynamicWeightMetric, Group, GroupHourlyStat, GroupSubGroup, GroupType, HeaderRule,
    KeyStatus, ModelRedirectRuleV2, PathRedirect, RequestLog, RequestType, Upstream,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{MySqlPool, PgPool, SqlitePool};
use std::collections::HashMap;

/// The three supported SQL dialects (spec §2 item 2, §4.4.4, §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    MySql,
    Sqlite,
}

impl Dialect {
    /// Per-dialect bulk-insert row ceiling (spec §4.6).
    pub fn bulk_insert_ceiling(self) -> usize {
        match self {
            Self::MySql => 5_000,
            Self::Postgres => 3_000,
            Self::Sqlite => 50,
        }
    }

    /// Per-dialect hourly-stats upsert batch size (spec §4.4.4).
    pub fn hourly_stats_batch_size(self) -> usize {
        match self {
            Self::Postgres | Self::MySql => 500,
            Self::Sqlite => 50,
        }
    }

    /// `$1, $2, ...` for Postgres, `?, ?, ...` for MySQL/SQLite.
    fn placeholder(self, index: usize) -> String {
        match self {
            Self::Postgres => format!("${index}"),
            Self::MySql | Self::Sqlite => "?".to_string(),
        }
    }

    fn placeholders(self, count: usize, start: usize) -> String {
        (0..count)
            .map(|i| self.placeholder(start + i))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Internal pool enum (spec's redesign note in `SPEC_FULL.md` §4.0:
/// "a thin internal enum of pools ... because sqlx's compile-time query
/// macros don't support `Any`").
#[derive(Clone)]
pub enum DbPool {
    Postgres(PgPool),
    MySql(MySqlPool),
    Sqlite(SqlitePool),
}

impl DbPool {
    pub fn dialect(&self) -> Dialect {
        match self {
            Self::Postgres(_) => Dialect::Postgres,
            Self::MySql(_) => Dialect::MySql,
            Self::Sqlite(_) => Dialect::Sqlite,
        }
    }
}

/// Dispatches a pool-bound expression across the three dialects. `$pool`
/// is bound to the concrete pool reference inside each arm so SQL text
/// can differ per dialect while sharing the surrounding Rust.
macro_rules! dispatch {
    ($self:expr, $pool:ident => $body:expr) => {
        match $self {
            DbPool::Postgres($pool) => $body,
            DbPool::MySql($pool) => $body,
            DbPool::Sqlite($pool) => $body,
        }
    };
}

/// A single in-progress transaction, the `DbPool` counterpart used
/// wherever spec §4.1.1/§4.1.3/§4.4.4 require several writes to commit or
/// roll back together instead of landing as independent auto-committed
/// statements. `sqlx::Pool<DB>: Acquire<'static>`, so `pool.begin()` yields
/// a `Transaction<'static, DB>` that can be held without borrowing `self`.
pub enum DbTransaction {
    Postgres(sqlx::Transaction<'static, sqlx::Postgres>),
    MySql(sqlx::Transaction<'static, sqlx::MySql>),
    Sqlite(sqlx::Transaction<'static, sqlx::Sqlite>),
}

impl DbTransaction {
    pub fn dialect(&self) -> Dialect {
        match self {
            Self::Postgres(_) => Dialect::Postgres,
            Self::MySql(_) => Dialect::MySql,
            Self::Sqlite(_) => Dialect::Sqlite,
        }
    }

    pub async fn commit(self) -> Result<()> {
        match self {
            Self::Postgres(tx) => tx.commit().await?,
            Self::MySql(tx) => tx.commit().await?,
            Self::Sqlite(tx) => tx.commit().await?,
        }
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        match self {
            Self::Postgres(tx) => tx.rollback().await?,
            Self::MySql(tx) => tx.rollback().await?,
            Self::Sqlite(tx) => tx.rollback().await?,
        }
        Ok(())
    }
}

/// Dispatches a transaction-bound expression across the three dialects,
/// the `DbTransaction` counterpart of [`dispatch!`].
macro_rules! dispatch_tx {
    ($tx:expr, $conn:ident => $body:expr) => {
        match $tx {
            DbTransaction::Postgres($conn) => $body,
            DbTransaction::MySql($conn) => $body,
            DbTransaction::Sqlite($conn) => $body,
        }
    };
}

/// Row shape for the `groups` table; structured columns (`upstreams`,
/// `config`, ...) are stored as JSON text and converted to/from the
/// domain [`Group`] type at the boundary.
#[derive(Debug, sqlx::FromRow)]
struct GroupRow {
    id: i64,
    name: String,
    display_name: String,
    group_type: String,
    channel_type: String,
    sort: i32,
    enabled: bool,
    test_model: String,
    validation_endpoint: String,
    upstreams_json: String,
    config_json: String,
    param_overrides_json: String,
    header_rules_json: String,
    model_redirect_rules_v2_json: String,
    model_redirect_strict: bool,
    path_redirects_json: String,
    proxy_keys: String,
    parent_group_id: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl GroupRow {
    fn into_group(self) -> Result<Group> {
        Ok(Group {
            id: self.id,
            name: self.name,
            display_name: self.display_name,
            group_type: if self.group_type == "aggregate" {
                GroupType::Aggregate
            } else {
                GroupType::Standard
            },
            channel_type: self.channel_type,
            sort: self.sort,
            enabled: self.enabled,
            test_model: self.test_model,
            validation_endpoint: self.validation_endpoint,
            upstreams: serde_json::from_str::<Vec<Upstream>>(&self.upstreams_json)?,
            config: serde_json::from_str::<HashMap<String, serde_json::Value>>(&self.config_json)?,
            param_overrides: serde_json::from_str::<HashMap<String, serde_json::Value>>(
                &self.param_overrides_json,
            )?,
            header_rules: serde_json::from_str::<Vec<HeaderRule>>(&self.header_rules_json)?,
            model_redirect_rules_v2: serde_json::from_str::<HashMap<String, ModelRedirectRuleV2>>(
                &self.model_redirect_rules_v2_json,
            )?,
            model_redirect_strict: self.model_redirect_strict,
            path_redirects: serde_json::from_str::<Vec<PathRedirect>>(&self.path_redirects_json)?,
            proxy_keys: self.proxy_keys,
            parent_group_id: self.parent_group_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Insert/update payload derived from a validated [`Group`]; separated
/// from [`Group`] so callers can't accidentally skip JSON encoding.
#[derive(Debug, Clone)]
pub struct GroupWriteRow {
    pub name: String,
    pub display_name: String,
    pub group_type: &'static str,
    pub channel_type: String,
    pub sort: i32,
    pub enabled: bool,
    pub test_model: String,
    pub validation_endpoint: String,
    pub upstreams_json: String,
    pub config_json: String,
    pub param_overrides_json: String,
    pub header_rules_json: String,
    pub model_redirect_rules_v2_json: String,
    pub model_redirect_strict: bool,
    pub path_redirects_json: String,
    pub proxy_keys: String,
    pub parent_group_id: Option<i64>,
}

impl GroupWriteRow {
    pub fn from_group(g: &Group) -> Result<Self> {
        Ok(Self {
            name: g.name.clone(),
            display_name: g.display_name.clone(),
            group_type: match g.group_type {
                GroupType::Standard => "standard",
                GroupType::Aggregate => "aggregate",
            },
            channel_type: g.channel_type.clone(),
            sort: g.sort,
            enabled: g.enabled,
            test_model: g.test_model.clone(),
            validation_endpoint: g.validation_endpoint.clone(),
            upstreams_json: serde_json::to_string(&g.upstreams)?,
            config_json: serde_json::to_string(&g.config)?,
            param_overrides_json: serde_json::to_string(&g.param_overrides)?,
            header_rules_json: serde_json::to_string(&g.header_rules)?,
            model_redirect_rules_v2_json: serde_json::to_string(&g.model_redirect_rules_v2)?,
            model_redirect_strict: g.model_redirect_strict,
            path_redirects_json: serde_json::to_string(&g.path_redirects)?,
            proxy_keys: g.proxy_keys.clone(),
            parent_group_id: g.parent_group_id,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct KeyRow {
    id: i64,
    group_id: i64,
    key_hash: String,
    key_value: Vec<u8>,
    status: String,
    request_count: i64,
    last_used_at: Option<DateTime<Utc>>,
}

impl KeyRow {
    fn into_api_key(self) -> ApiKey {
        ApiKey {
            id: self.id,
            group_id: self.group_id,
            key_hash: self.key_hash,
            key_value: self.key_value,
            status: if self.status == "invalid" {
                KeyStatus::Invalid
            } else {
                KeyStatus::Active
            },
            request_count: self.request_count,
            last_used_at: self.last_used_at,
        }
    }
}

/// Key/value/active counts for `GetGroupStats` (spec §4.1.5).
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyStats {
    pub total: i64,
    pub active: i64,
}

impl KeyStats {
    pub fn invalid(&self) -> i64 {
        self.total - self.active
    }
}

/// Request-count rollup for `GetGroupStats` (spec §4.1.5).
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestStatsWindow {
    pub total: i64,
    pub failed: i64,
}

impl RequestStatsWindow {
    /// `round(failed/total, 4)`, `0.0` when `total == 0` (spec §4.1.5).
    pub fn failure_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.failed as f64 / self.total as f64 * 10_000.0).round() / 10_000.0
        }
    }
}

/// A batch of aggregated counters to upsert into `group_hourly_stats`
/// (spec §4.4.4 step 3).
#[derive(Debug, Clone)]
pub struct HourlyStatDelta {
    pub time: DateTime<Utc>,
    pub group_id: i64,
    pub success_delta: i64,
    pub failure_delta: i64,
}

/// The Relational Store capability this core depends on.
pub struct RelationalStore {
    pool: DbPool,
}

impl RelationalStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn dialect(&self) -> Dialect {
        self.pool.dialect()
    }

    // ---- groups --------------------------------------------------------

    pub async fn insert_group(&self, row: &GroupWriteRow) -> Result<i64> {
        let sql_pg = "INSERT INTO groups (name, display_name, group_type, channel_type, sort, \
             enabled, test_model, validation_endpoint, upstreams_json, config_json, \
             param_overrides_json, header_rules_json, model_redirect_rules_v2_json, \
             model_redirect_strict, path_redirects_json, proxy_keys, parent_group_id, \
             created_at, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,now(),now()) \
             RETURNING id";
        let sql_other = "INSERT INTO groups (name, display_name, group_type, channel_type, sort, \
             enabled, test_model, validation_endpoint, upstreams_json, config_json, \
             param_overrides_json, header_rules_json, model_redirect_rules_v2_json, \
             model_redirect_strict, path_redirects_json, proxy_keys, parent_group_id, \
             created_at, updated_at) \
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,CURRENT_TIMESTAMP,CURRENT_TIMESTAMP)";

        match &self.pool {
            DbPool::Postgres(pool) => {
                let id: (i64,) = sqlx::query_as(sql_pg)
                    .bind(&row.name)
                    .bind(&row.display_name)
                    .bind(row.group_type)
                    .bind(&row.channel_type)
                    .bind(row.sort)
                    .bind(row.enabled)
                    .bind(&row.test_model)
                    .bind(&row.validation_endpoint)
                    .bind(&row.upstreams_json)
                    .bind(&row.config_json)
                    .bind(&row.param_overrides_json)
                    .bind(&row.header_rules_json)
                    .bind(&row.model_redirect_rules_v2_json)
                    .bind(row.model_redirect_strict)
                    .bind(&row.path_redirects_json)
                    .bind(&row.proxy_keys)
                    .bind(row.parent_group_id)
                    .fetch_one(pool)
                    .await?;
                Ok(id.0)
            }
            DbPool::MySql(pool) => {
                let result = sqlx::query(sql_other)
                    .bind(&row.name)
                    .bind(&row.display_name)
                    .bind(row.group_type)
                    .bind(&row.channel_type)
                    .bind(row.sort)
                    .bind(row.enabled)
                    .bind(&row.test_model)
                    .bind(&row.validation_endpoint)
                    .bind(&row.upstreams_json)
                    .bind(&row.config_json)
                    .bind(&row.param_overrides_json)
                    .bind(&row.header_rules_json)
                    .bind(&row.model_redirect_rules_v2_json)
                    .bind(row.model_redirect_strict)
                    .bind(&row.path_redirects_json)
                    .bind(&row.proxy_keys)
                    .bind(row.parent_group_id)
                    .execute(pool)
                    .await?;
                Ok(result.last_insert_id() as i64)
            }
            DbPool::Sqlite(pool) => {
                let result = sqlx::query(sql_other)
                    .bind(&row.name)
                    .bind(&row.display_name)
                    .bind(row.group_type)
                    .bind(&row.channel_type)
                    .bind(row.sort)
                    .bind(row.enabled)
                    .bind(&row.test_model)
                    .bind(&row.validation_endpoint)
                    .bind(&row.upstreams_json)
                    .bind(&row.config_json)
                    .bind(&row.param_overrides_json)
                    .bind(&row.header_rules_json)
                    .bind(&row.model_redirect_rules_v2_json)
                    .bind(row.model_redirect_strict)
                    .bind(&row.path_redirects_json)
                    .bind(&row.proxy_keys)
                    .bind(row.parent_group_id)
                    .execute(pool)
                    .await?;
                Ok(result.last_insert_rowid())
            }
        }
    }

    pub async fn update_group(&self, id: i64, row: &GroupWriteRow) -> Result<()> {
        let dialect = self.dialect();
        let assignments = [
            "name", "display_name", "group_type", "channel_type", "sort", "enabled",
            "test_model", "validation_endpoint", "upstreams_json", "config_json",
            "param_overrides_json", "header_rules_json", "model_redirect_rules_v2_json",
            "model_redirect_strict", "path_redirects_json", "proxy_keys", "parent_group_id",
        ];
        let set_clause = assignments
            .iter()
            .enumerate()
            .map(|(i, col)| format!("{col} = {}", dialect.placeholder(i + 1)))
            .collect::<Vec<_>>()
            .join(", ");
        let updated_at_col = match dialect {
            Dialect::Postgres => "updated_at = now()",
            _ => "updated_at = CURRENT_TIMESTAMP",
        };
        let where_clause = dialect.placeholder(assignments.len() + 1);
        let sql = format!("UPDATE groups SET {set_clause}, {updated_at_col} WHERE id = {where_clause}");

        macro_rules! bind_all {
            ($q:expr) => {
                $q.bind(&row.name)
                    .bind(&row.display_name)
                    .bind(row.group_type)
                    .bind(&row.channel_type)
                    .bind(row.sort)
                    .bind(row.enabled)
                    .bind(&row.test_model)
                    .bind(&row.validation_endpoint)
                    .bind(&row.upstreams_json)
                    .bind(&row.config_json)
                    .bind(&row.param_overrides_json)
                    .bind(&row.header_rules_json)
                    .bind(&row.model_redirect_rules_v2_json)
                    .bind(row.model_redirect_strict)
                    .bind(&row.path_redirects_json)
                    .bind(&row.proxy_keys)
                    .bind(row.parent_group_id)
                    .bind(id)
            };
        }
        match &self.pool {
            DbPool::Postgres(pool) => {
                bind_all!(sqlx::query(&sql)).execute(pool).await?;
            }
            DbPool::MySql(pool) => {
                bind_all!(sqlx::query(&sql)).execute(pool).await?;
            }
            DbPool::Sqlite(pool) => {
                bind_all!(sqlx::query(&sql)).execute(pool).await?;
            }
        }
        Ok(())
    }

    pub async fn get_group_by_id(&self, id: i64) -> Result<Option<Group>> {
        let sql = match self.dialect() {
            Dialect::Postgres => "SELECT * FROM groups WHERE id = $1",
            _ => "SELECT * FROM groups WHERE id = ?",
        };
        let row: Option<GroupRow> = dispatch!(&self.pool, pool => {
            sqlx::query_as(sql).bind(id).fetch_optional(pool).await?
        });
        row.map(GroupRow::into_group).transpose()
    }

    pub async fn get_group_by_name(&self, name: &str) -> Result<Option<Group>> {
        let sql = match self.dialect() {
            Dialect::Postgres => "SELECT * FROM groups WHERE name = $1",
            _ => "SELECT * FROM groups WHERE name = ?",
        };
        let row: Option<GroupRow> = dispatch!(&self.pool, pool => {
            sqlx::query_as(sql).bind(name).fetch_optional(pool).await?
        });
        row.map(GroupRow::into_group).transpose()
    }

    /// Lists all groups, sorted by the manager's single deterministic
    /// clause (spec §4.2: `sort asc, id desc`).
    pub async fn list_groups(&self) -> Result<Vec<Group>> {
        let sql = "SELECT * FROM groups ORDER BY sort ASC, id DESC";
        let rows: Vec<GroupRow> = dispatch!(&self.pool, pool => {
            sqlx::query_as(sql).fetch_all(pool).await?
        });
        rows.into_iter().map(GroupRow::into_group).collect()
    }

    pub async fn delete_group_row(&self, id: i64) -> Result<()> {
        let sql = match self.dialect() {
            Dialect::Postgres => "DELETE FROM groups WHERE id = $1",
            _ => "DELETE FROM groups WHERE id = ?",
        };
        dispatch!(&self.pool, pool => {
            sqlx::query(sql).bind(id).execute(pool).await?;
        });
        Ok(())
    }

    pub async fn name_exists(&self, name: &str) -> Result<bool> {
        Ok(self.get_group_by_name(name).await?.is_some())
    }

    // ---- group_sub_groups -----------------------------------------------

    pub async fn insert_sub_group_edge(&self, edge: GroupSubGroup) -> Result<()> {
        let sql = match self.dialect() {
            Dialect::Postgres => {
                "INSERT INTO group_sub_groups (group_id, sub_group_id) VALUES ($1, $2)"
            }
            _ => "INSERT INTO group_sub_groups (group_id, sub_group_id) VALUES (?, ?)",
        };
        dispatch!(&self.pool, pool => {
            sqlx::query(sql)
                .bind(edge.group_id)
                .bind(edge.sub_group_id)
                .execute(pool)
                .await?;
        });
        Ok(())
    }

    /// Deletes every sub-group edge where `group_id` appears on either
    /// side (spec §3: "Deleted with either endpoint").
    pub async fn delete_sub_group_edges_for(&self, group_id: i64) -> Result<()> {
        let sql = match self.dialect() {
            Dialect::Postgres => {
                "DELETE FROM group_sub_groups WHERE group_id = $1 OR sub_group_id = $1"
            }
            _ => "DELETE FROM group_sub_groups WHERE group_id = ? OR sub_group_id = ?",
        };
        match &self.pool {
            DbPool::Postgres(pool) => {
                sqlx::query(sql).bind(group_id).execute(pool).await?;
            }
            DbPool::MySql(pool) => {
                sqlx::query(sql).bind(group_id).bind(group_id).execute(pool).await?;
            }
            DbPool::Sqlite(pool) => {
                sqlx::query(sql).bind(group_id).bind(group_id).execute(pool).await?;
            }
        }
        Ok(())
    }

    pub async fn sub_group_ids(&self, aggregate_id: i64) -> Result<Vec<i64>> {
        let sql = match self.dialect() {
            Dialect::Postgres => "SELECT sub_group_id FROM group_sub_groups WHERE group_id = $1",
            _ => "SELECT sub_group_id FROM group_sub_groups WHERE group_id = ?",
        };
        let rows: Vec<(i64,)> = dispatch!(&self.pool, pool => {
            sqlx::query_as(sql).bind(aggregate_id).fetch_all(pool).await?
        });
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Parent aggregate ids that reference `sub_group_id` (spec §4.1.2's
    /// cross-reference guards need this to batch-resolve parents).
    pub async fn parent_ids(&self, sub_group_id: i64) -> Result<Vec<i64>> {
        let sql = match self.dialect() {
            Dialect::Postgres => "SELECT group_id FROM group_sub_groups WHERE sub_group_id = $1",
            _ => "SELECT group_id FROM group_sub_groups WHERE sub_group_id = ?",
        };
        let rows: Vec<(i64,)> = dispatch!(&self.pool, pool => {
            sqlx::query_as(sql).bind(sub_group_id).fetch_all(pool).await?
        });
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Batch-fetches `channel_type` for a set of group ids in one query,
    /// avoiding the N+1 spec §4.1.2 calls out.
    pub async fn channel_types_for(&self, ids: &[i64]) -> Result<HashMap<i64, String>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let dialect = self.dialect();
        let placeholders = dialect.placeholders(ids.len(), 1);
        let sql = format!("SELECT id, channel_type FROM groups WHERE id IN ({placeholders})");
        let rows: Vec<(i64, String)> = match &self.pool {
            DbPool::Postgres(pool) => {
                let mut q = sqlx::query_as(&sql);
                for id in ids {
                    q = q.bind(id);
                }
                q.fetch_all(pool).await?
            }
            DbPool::MySql(pool) => {
                let mut q = sqlx::query_as(&sql);
                for id in ids {
                    q = q.bind(id);
                }
                q.fetch_all(pool).await?
            }
            DbPool::Sqlite(pool) => {
                let mut q = sqlx::query_as(&sql);
                for id in ids {
                    q = q.bind(id);
                }
                q.fetch_all(pool).await?
            }
        };
        Ok(rows.into_iter().collect())
    }

    // ---- api_keys --------------------------------------------------------

    pub async fn insert_key(&self, group_id: i64, key_hash: &str, key_value: &[u8]) -> Result<i64> {
        let sql_pg = "INSERT INTO api_keys (group_id, key_hash, key_value, status, request_count) \
             VALUES ($1, $2, $3, 'active', 0) RETURNING id";
        let sql_other = "INSERT INTO api_keys (group_id, key_hash, key_value, status, request_count) \
             VALUES (?, ?, ?, 'active', 0)";
        match &self.pool {
            DbPool::Postgres(pool) => {
                let id: (i64,) = sqlx::query_as(sql_pg)
                    .bind(group_id)
                    .bind(key_hash)
                    .bind(key_value)
                    .fetch_one(pool)
                    .await?;
                Ok(id.0)
            }
            DbPool::MySql(pool) => {
                let result = sqlx::query(sql_other)
                    .bind(group_id)
                    .bind(key_hash)
                    .bind(key_value)
                    .execute(pool)
                    .await?;
                Ok(result.last_insert_id() as i64)
            }
            DbPool::Sqlite(pool) => {
                let result = sqlx::query(sql_other)
                    .bind(group_id)
                    .bind(key_hash)
                    .bind(key_value)
                    .execute(pool)
                    .await?;
                Ok(result.last_insert_rowid())
            }
        }
    }

    /// Key-stats counts (spec §4.1.5): total and active, run as two
    /// parallel index-friendly `COUNT`s by the caller.
    pub async fn count_keys(&self, group_id: i64) -> Result<KeyStats> {
        let total_sql = match self.dialect() {
            Dialect::Postgres => "SELECT COUNT(*) FROM api_keys WHERE group_id = $1",
            _ => "SELECT COUNT(*) FROM api_keys WHERE group_id = ?",
        };
        let active_sql = match self.dialect() {
            Dialect::Postgres => "SELECT COUNT(*) FROM api_keys WHERE group_id = $1 AND status = 'active'",
            _ => "SELECT COUNT(*) FROM api_keys WHERE group_id = ? AND status = 'active'",
        };
        let total: (i64,) = dispatch!(&self.pool, pool => {
            sqlx::query_as(total_sql).bind(group_id).fetch_one(pool).await?
        });
        let active: (i64,) = dispatch!(&self.pool, pool => {
            sqlx::query_as(active_sql).bind(group_id).fetch_one(pool).await?
        });
        Ok(KeyStats {
            total: total.0,
            active: active.0,
        })
    }

    /// Total key count across a group and every child (spec §4.1.3's tier
    /// computation).
    pub async fn count_keys_including_children(&self, group_id: i64, child_ids: &[i64]) -> Result<u64> {
        let mut total = self.count_keys(group_id).await?.total;
        for child in child_ids {
            total += self.count_keys(*child).await?.total;
        }
        Ok(total.max(0) as u64)
    }

    /// SELECT-then-DELETE-by-id chunking portable across dialects (spec
    /// §4.1.3 Small tier): fetches up to `limit` ids greater than `after`.
    pub async fn key_ids_chunk(&self, group_id: i64, after: i64, limit: i64) -> Result<Vec<i64>> {
        let sql = match self.dialect() {
            Dialect::Postgres => {
                "SELECT id FROM api_keys WHERE group_id = $1 AND id > $2 ORDER BY id ASC LIMIT $3"
            }
            _ => "SELECT id FROM api_keys WHERE group_id = ? AND id > ? ORDER BY id ASC LIMIT ?",
        };
        let rows: Vec<(i64,)> = dispatch!(&self.pool, pool => {
            sqlx::query_as(sql)
                .bind(group_id)
                .bind(after)
                .bind(limit)
                .fetch_all(pool)
                .await?
        });
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    pub async fn delete_keys_by_ids(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let dialect = self.dialect();
        let placeholders = dialect.placeholders(ids.len(), 1);
        let sql = format!("DELETE FROM api_keys WHERE id IN ({placeholders})");
        let affected = match &self.pool {
            DbPool::Postgres(pool) => {
                let mut q = sqlx::query(&sql);
                for id in ids {
                    q = q.bind(id);
                }
                q.execute(pool).await?.rows_affected()
            }
            DbPool::MySql(pool) => {
                let mut q = sqlx::query(&sql);
                for id in ids {
                    q = q.bind(id);
                }
                q.execute(pool).await?.rows_affected()
            }
            DbPool::Sqlite(pool) => {
                let mut q = sqlx::query(&sql);
                for id in ids {
                    q = q.bind(id);
                }
                q.execute(pool).await?.rows_affected()
            }
        };
        Ok(affected)
    }

    pub async fn delete_all_keys_for_group(&self, group_id: i64) -> Result<u64> {
        let sql = match self.dialect() {
            Dialect::Postgres => "DELETE FROM api_keys WHERE group_id = $1",
            _ => "DELETE FROM api_keys WHERE group_id = ?",
        };
        let affected = dispatch!(&self.pool, pool => {
            sqlx::query(sql).bind(group_id).execute(pool).await?.rows_affected()
        });
        Ok(affected)
    }

    pub async fn keys_for_group(&self, group_id: i64) -> Result<Vec<ApiKey>> {
        let sql = match self.dialect() {
            Dialect::Postgres => "SELECT * FROM api_keys WHERE group_id = $1",
            _ => "SELECT * FROM api_keys WHERE group_id = ?",
        };
        let rows: Vec<KeyRow> = dispatch!(&self.pool, pool => {
            sqlx::query_as(sql).bind(group_id).fetch_all(pool).await?
        });
        Ok(rows.into_iter().map(KeyRow::into_api_key).collect())
    }

    /// Existing `key_hash`es for a group, used to dedup a copy against the
    /// target (spec §4.1.4 Bulk tier).
    pub async fn key_hashes_for_group(&self, group_id: i64) -> Result<std::collections::HashSet<String>> {
        let sql = match self.dialect() {
            Dialect::Postgres => "SELECT key_hash FROM api_keys WHERE group_id = $1",
            _ => "SELECT key_hash FROM api_keys WHERE group_id = ?",
        };
        let rows: Vec<(String,)> = dispatch!(&self.pool, pool => {
            sqlx::query_as(sql).bind(group_id).fetch_all(pool).await?
        });
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    // ---- group_hourly_stats ---------------------------------------------

    /// Batched upsert into `group_hourly_stats`, chunked per dialect (spec
    /// §4.4.4 step 3): Postgres/MySQL 500, SQLite 50, each with the
    /// dialect's own conflict syntax adding to the existing counts.
    pub async fn upsert_hourly_stats(&self, deltas: &[HourlyStatDelta]) -> Result<()> {
        let dialect = self.dialect();
        let batch_size = dialect.hourly_stats_batch_size();
        for chunk in deltas.chunks(batch_size) {
            self.upsert_hourly_stats_chunk(chunk).await?;
        }
        Ok(())
    }

    async fn upsert_hourly_stats_chunk(&self, chunk: &[HourlyStatDelta]) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let dialect = self.dialect();
        let values_per_row = 4;
        let mut idx = 1;
        let mut value_clauses = Vec::with_capacity(chunk.len());
        for _ in chunk {
            value_clauses.push(format!("({})", dialect.placeholders(values_per_row, idx)));
            idx += values_per_row;
        }
        let values_sql = value_clauses.join(", ");

        let sql = match dialect {
            Dialect::Postgres => format!(
                "INSERT INTO group_hourly_stats (time, group_id, success_count, failure_count) \
                 VALUES {values_sql} \
                 ON CONFLICT (time, group_id) DO UPDATE SET \
                 success_count = group_hourly_stats.success_count + EXCLUDED.success_count, \
                 failure_count = group_hourly_stats.failure_count + EXCLUDED.failure_count, \
                 updated_at = now()"
            ),
            Dialect::MySql => format!(
                "INSERT INTO group_hourly_stats (time, group_id, success_count, failure_count) \
                 VALUES {values_sql} \
                 ON DUPLICATE KEY UPDATE \
                 success_count = success_count + VALUES(success_count), \
                 failure_count = failure_count + VALUES(failure_count), \
                 updated_at = CURRENT_TIMESTAMP"
            ),
            Dialect::Sqlite => format!(
                "INSERT INTO group_hourly_stats (time, group_id, success_count, failure_count) \
                 VALUES {values_sql} \
                 ON CONFLICT (time, group_id) DO UPDATE SET \
                 success_count = group_hourly_stats.success_count + excluded.success_count, \
                 failure_count = group_hourly_stats.failure_count + excluded.failure_count, \
                 updated_at = CURRENT_TIMESTAMP"
            ),
        };

        macro_rules! bind_chunk {
            ($q:expr) => {{
                let mut q = $q;
                for delta in chunk {
                    q = q
                        .bind(delta.time)
                        .bind(delta.group_id)
                        .bind(delta.success_delta)
                        .bind(delta.failure_delta);
                }
                q
            }};
        }
        match &self.pool {
            DbPool::Postgres(pool) => {
                bind_chunk!(sqlx::query(&sql)).execute(pool).await?;
            }
            DbPool::MySql(pool) => {
                bind_chunk!(sqlx::query(&sql)).execute(pool).await?;
            }
            DbPool::Sqlite(pool) => {
                bind_chunk!(sqlx::query(&sql)).execute(pool).await?;
            }
        }
        Ok(())
    }

    pub async fn delete_hourly_stats_for_group(&self, group_id: i64) -> Result<()> {
        let sql = match self.dialect() {
            Dialect::Postgres => "DELETE FROM group_hourly_stats WHERE group_id = $1",
            _ => "DELETE FROM group_hourly_stats WHERE group_id = ?",
        };
        dispatch!(&self.pool, pool => {
            sqlx::query(sql).bind(group_id).execute(pool).await?;
        });
        Ok(())
    }

    /// Request stats for 24h/7d/30d in one query (spec §4.1.5):
    /// `SUM(CASE WHEN time >= ... THEN ...)` bounded by
    /// `[end_time - 30d, end_time)`.
    pub async fn request_stats_windows(
        &self,
        group_id: i64,
        end_time: DateTime<Utc>,
    ) -> Result<HashMap<&'static str, RequestStatsWindow>> {
        let start_time = end_time - chrono::Duration::days(30);
        let since_24h = end_time - chrono::Duration::hours(24);
        let since_7d = end_time - chrono::Duration::days(7);

        let sql = match self.dialect() {
            Dialect::Postgres => {
                "SELECT \
                 COALESCE(SUM(CASE WHEN time >= $2 THEN success_count + failure_count ELSE 0 END), 0) AS total_24h, \
                 COALESCE(SUM(CASE WHEN time >= $2 THEN failure_count ELSE 0 END), 0) AS failed_24h, \
                 COALESCE(SUM(CASE WHEN time >= $3 THEN success_count + failure_count ELSE 0 END), 0) AS total_7d, \
                 COALESCE(SUM(CASE WHEN time >= $3 THEN failure_count ELSE 0 END), 0) AS failed_7d, \
                 COALESCE(SUM(success_count + failure_count), 0) AS total_30d, \
                 COALESCE(SUM(failure_count), 0) AS failed_30d \
                 FROM group_hourly_stats WHERE group_id = $1 AND time >= $4 AND time < $5"
            }
            _ => {
                "SELECT \
                 COALESCE(SUM(CASE WHEN time >= ? THEN success_count + failure_count ELSE 0 END), 0) AS total_24h, \
                 COALESCE(SUM(CASE WHEN time >= ? THEN failure_count ELSE 0 END), 0) AS failed_24h, \
                 COALESCE(SUM(CASE WHEN time >= ? THEN success_count + failure_count ELSE 0 END), 0) AS total_7d, \
                 COALESCE(SUM(CASE WHEN time >= ? THEN failure_count ELSE 0 END), 0) AS failed_7d, \
                 COALESCE(SUM(success_count + failure_count), 0) AS total_30d, \
                 COALESCE(SUM(failure_count), 0) AS failed_30d \
                 FROM group_hourly_stats WHERE group_id = ? AND time >= ? AND time < ?"
            }
        };

        let row: (i64, i64, i64, i64, i64, i64) = match &self.pool {
            DbPool::Postgres(pool) => {
                sqlx::query_as(sql)
                    .bind(group_id)
                    .bind(since_24h)
                    .bind(since_7d)
                    .bind(start_time)
                    .bind(end_time)
                    .fetch_one(pool)
                    .await?
            }
            DbPool::MySql(pool) => {
                // Positional `?` placeholders can't be reused like Postgres'
                // `$n`, so each repeated occurrence needs its own bind.
                sqlx::query_as(sql)
                    .bind(since_24h)
                    .bind(since_24h)
                    .bind(since_7d)
                    .bind(since_7d)
                    .bind(group_id)
                    .bind(start_time)
                    .bind(end_time)
                    .fetch_one(pool)
                    .await?
            }
            DbPool::Sqlite(pool) => {
                sqlx::query_as(sql)
                    .bind(since_24h)
                    .bind(since_24h)
                    .bind(since_7d)
                    .bind(since_7d)
                    .bind(group_id)
                    .bind(start_time)
                    .bind(end_time)
                    .fetch_one(pool)
                    .await?
            }
        };

        let mut out = HashMap::new();
        out.insert(
            "24h",
            RequestStatsWindow {
                total: row.0,
                failed: row.1,
            },
        );
        out.insert(
            "7d",
            RequestStatsWindow {
                total: row.2,
                failed: row.3,
            },
        );
        out.insert(
            "30d",
            RequestStatsWindow {
                total: row.4,
                failed: row.5,
            },
        );
        Ok(out)
    }

    // ---- request_logs -----------------------------------------------------

    pub async fn insert_logs(&self, logs: &[RequestLog]) -> Result<()> {
        if logs.is_empty() {
            return Ok(());
        }
        let dialect = self.dialect();
        for chunk in logs.chunks(dialect.bulk_insert_ceiling()) {
            self.insert_logs_chunk(chunk).await?;
        }
        Ok(())
    }

    async fn insert_logs_chunk(&self, chunk: &[RequestLog]) -> Result<()> {
        let dialect = self.dialect();
        let cols = 16;
        let mut idx = 1;
        let mut value_clauses = Vec::with_capacity(chunk.len());
        for _ in chunk {
            value_clauses.push(format!("({})", dialect.placeholders(cols, idx)));
            idx += cols;
        }
        let sql = format!(
            "INSERT INTO request_logs (id, timestamp, group_id, parent_group_id, group_name, \
             parent_group_name, key_hash, is_success, status_code, request_type, is_stream, \
             model, source_ip, request_path, duration_ms, error_message) VALUES {}",
            value_clauses.join(", ")
        );

        macro_rules! bind_chunk {
            ($q:expr) => {{
                let mut q = $q;
                for log in chunk {
                    q = q
                        .bind(&log.id)
                        .bind(log.timestamp)
                        .bind(log.group_id)
                        .bind(log.parent_group_id)
                        .bind(&log.group_name)
                        .bind(&log.parent_group_name)
                        .bind(&log.key_hash)
                        .bind(log.is_success)
                        .bind(log.status_code)
                        .bind(match log.request_type {
                            RequestType::Final => "final",
                            RequestType::Retry => "retry",
                        })
                        .bind(log.is_stream)
                        .bind(&log.model)
                        .bind(&log.source_ip)
                        .bind(&log.request_path)
                        .bind(log.duration_ms)
                        .bind(&log.error_message);
                }
                q
            }};
        }
        match &self.pool {
            DbPool::Postgres(pool) => {
                bind_chunk!(sqlx::query(&sql)).execute(pool).await?;
            }
            DbPool::MySql(pool) => {
                bind_chunk!(sqlx::query(&sql)).execute(pool).await?;
            }
            DbPool::Sqlite(pool) => {
                bind_chunk!(sqlx::query(&sql)).execute(pool).await?;
            }
        }
        Ok(())
    }

    /// Bumps `request_count`/`last_used_at` for every affected key hash in
    /// a single `CASE key_hash WHEN ... THEN request_count + n ...` update
    /// (spec §4.4.4 step 2), built with a pooled string builder by the
    /// caller ([`crate::request_log`]).
    pub async fn bump_key_usage(&self, increments: &HashMap<String, i64>) -> Result<()> {
        if increments.is_empty() {
            return Ok(());
        }
        let dialect = self.dialect();
        let mut case_sql = String::with_capacity(increments.len() * 32);
        case_sql.push_str("CASE key_hash ");
        let mut idx = 1;
        let mut hash_binds = Vec::with_capacity(increments.len());
        for (hash, n) in increments {
            case_sql.push_str(&format!("WHEN {} THEN request_count + {} ", dialect.placeholder(idx), n));
            hash_binds.push(hash.clone());
            idx += 1;
        }
        case_sql.push_str("ELSE request_count END");

        let in_placeholders = dialect.placeholders(increments.len(), idx);
        let now_expr = match dialect {
            Dialect::Postgres => "now()",
            _ => "CURRENT_TIMESTAMP",
        };
        let sql = format!(
            "UPDATE api_keys SET request_count = {case_sql}, last_used_at = {now_expr} \
             WHERE key_hash IN ({in_placeholders})"
        );

        macro_rules! bind_all {
            ($q:expr) => {{
                let mut q = $q;
                for hash in &hash_binds {
                    q = q.bind(hash);
                }
                for hash in &hash_binds {
                    q = q.bind(hash);
                }
                q
            }};
        }
        match &self.pool {
            DbPool::Postgres(pool) => {
                bind_all!(sqlx::query(&sql)).execute(pool).await?;
            }
            DbPool::MySql(pool) => {
                bind_all!(sqlx::query(&sql)).execute(pool).await?;
            }
            DbPool::Sqlite(pool) => {
                bind_all!(sqlx::query(&sql)).execute(pool).await?;
            }
        }
        Ok(())
    }

    // ---- managed_sites (boundary table) ------------------------------------

    /// Count of managed sites bound to `group_id` or any of `child_ids`
    /// (spec §4.1.3's "hard guard, all tiers").
    pub async fn bound_site_count(&self, group_id: i64, child_ids: &[i64]) -> Result<i64> {
        let mut all_ids = vec![group_id];
        all_ids.extend_from_slice(child_ids);
        let dialect = self.dialect();
        let placeholders = dialect.placeholders(all_ids.len(), 1);
        let sql = format!("SELECT COUNT(*) FROM managed_sites WHERE group_id IN ({placeholders})");
        let row: (i64,) = match &self.pool {
            DbPool::Postgres(pool) => {
                let mut q = sqlx::query_as(&sql);
                for id in &all_ids {
                    q = q.bind(id);
                }
                q.fetch_one(pool).await?
            }
            DbPool::MySql(pool) => {
                let mut q = sqlx::query_as(&sql);
                for id in &all_ids {
                    q = q.bind(id);
                }
                q.fetch_one(pool).await?
            }
            DbPool::Sqlite(pool) => {
                let mut q = sqlx::query_as(&sql);
                for id in &all_ids {
                    q = q.bind(id);
                }
                q.fetch_one(pool).await?
            }
        };
        Ok(row.0)
    }

    // ---- dynamic_weight_metrics --------------------------------------------

    /// Soft-deletes health metrics referencing `group_id` (aggregate
    /// member / model-redirect metrics, spec §3 "Ownership").
    pub async fn soft_delete_health_metrics(&self, group_id: i64) -> Result<()> {
        let sql = match self.dialect() {
            Dialect::Postgres => {
                "UPDATE dynamic_weight_metrics SET deleted_at = now() \
                 WHERE subject_key LIKE $1 AND deleted_at IS NULL"
            }
            _ => {
                "UPDATE dynamic_weight_metrics SET deleted_at = CURRENT_TIMESTAMP \
                 WHERE subject_key LIKE ? AND deleted_at IS NULL"
            }
        };
        let pattern = format!("%:{group_id}%");
        dispatch!(&self.pool, pool => {
            sqlx::query(sql).bind(pattern).execute(pool).await?;
        });
        Ok(())
    }

    /// Physically removes soft-deleted rows older than `retention` (spec
    /// §3: "Soft-deleted rows older than retention are physically removed
    /// by periodic cleanup").
    pub async fn cleanup_health_metrics(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let sql = match self.dialect() {
            Dialect::Postgres => "DELETE FROM dynamic_weight_metrics WHERE deleted_at < $1",
            _ => "DELETE FROM dynamic_weight_metrics WHERE deleted_at < ?",
        };
        let affected = dispatch!(&self.pool, pool => {
            sqlx::query(sql).bind(cutoff).execute(pool).await?.rows_affected()
        });
        Ok(affected)
    }

    /// Fetches one non-deleted metric row by its composite subject key
    /// (spec §3 `DynamicWeightMetric`), used by [`crate::health`] to load
    /// the counters to decay-and-sample.
    pub async fn get_metric(&self, subject_key: &str) -> Result<Option<DynamicWeightMetric>> {
        let sql = match self.dialect() {
            Dialect::Postgres => {
                "SELECT * FROM dynamic_weight_metrics WHERE subject_key = $1 AND deleted_at IS NULL"
            }
            _ => "SELECT * FROM dynamic_weight_metrics WHERE subject_key = ? AND deleted_at IS NULL",
        };
        let row: Option<MetricRow> = dispatch!(&self.pool, pool => {
            sqlx::query_as(sql).bind(subject_key).fetch_optional(pool).await?
        });
        row.map(MetricRow::into_metric).transpose()
    }

    /// Inserts or overwrites the row for `metric.subject_key` (spec §3:
    /// the decayed counters are recomputed by the caller on each sample
    /// and the whole row replaced, avoiding per-window `UPDATE` races).
    pub async fn upsert_metric(&self, metric: &DynamicWeightMetric) -> Result<()> {
        let row = MetricRow::from_metric(metric)?;
        let dialect = self.dialect();
        let sql = match dialect {
            Dialect::Postgres => {
                "INSERT INTO dynamic_weight_metrics \
                 (subject_key, metric_type, window_7d_json, window_14d_json, window_30d_json, \
                  window_90d_json, window_180d_json, consecutive_failures, deleted_at, updated_at) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10) \
                 ON CONFLICT (subject_key) DO UPDATE SET \
                 metric_type = EXCLUDED.metric_type, window_7d_json = EXCLUDED.window_7d_json, \
                 window_14d_json = EXCLUDED.window_14d_json, window_30d_json = EXCLUDED.window_30d_json, \
                 window_90d_json = EXCLUDED.window_90d_json, window_180d_json = EXCLUDED.window_180d_json, \
                 consecutive_failures = EXCLUDED.consecutive_failures, deleted_at = EXCLUDED.deleted_at, \
                 updated_at = EXCLUDED.updated_at"
            }
            Dialect::MySql => {
                "INSERT INTO dynamic_weight_metrics \
                 (subject_key, metric_type, window_7d_json, window_14d_json, window_30d_json, \
                  window_90d_json, window_180d_json, consecutive_failures, deleted_at, updated_at) \
                 VALUES (?,?,?,?,?,?,?,?,?,?) \
                 ON DUPLICATE KEY UPDATE \
                 metric_type = VALUES(metric_type), window_7d_json = VALUES(window_7d_json), \
                 window_14d_json = VALUES(window_14d_json), window_30d_json = VALUES(window_30d_json), \
                 window_90d_json = VALUES(window_90d_json), window_180d_json = VALUES(window_180d_json), \
                 consecutive_failures = VALUES(consecutive_failures), deleted_at = VALUES(deleted_at), \
                 updated_at = VALUES(updated_at)"
            }
            Dialect::Sqlite => {
                "INSERT INTO dynamic_weight_metrics \
                 (subject_key, metric_type, window_7d_json, window_14d_json, window_30d_json, \
                  window_90d_json, window_180d_json, consecutive_failures, deleted_at, updated_at) \
                 VALUES (?,?,?,?,?,?,?,?,?,?) \
                 ON CONFLICT (subject_key) DO UPDATE SET \
                 metric_type = excluded.metric_type, window_7d_json = excluded.window_7d_json, \
                 window_14d_json = excluded.window_14d_json, window_30d_json = excluded.window_30d_json, \
                 window_90d_json = excluded.window_90d_json, window_180d_json = excluded.window_180d_json, \
                 consecutive_failures = excluded.consecutive_failures, deleted_at = excluded.deleted_at, \
                 updated_at = excluded.updated_at"
            }
        };
        macro_rules! bind_all {
            ($q:expr) => {
                $q.bind(&row.subject_key)
                    .bind(&row.metric_type)
                    .bind(&row.window_7d_json)
                    .bind(&row.window_14d_json)
                    .bind(&row.window_30d_json)
                    .bind(&row.window_90d_json)
                    .bind(&row.window_180d_json)
                    .bind(row.consecutive_failures)
                    .bind(row.deleted_at)
                    .bind(row.updated_at)
            };
        }
        match &self.pool {
            DbPool::Postgres(pool) => {
                bind_all!(sqlx::query(sql)).execute(pool).await?;
            }
            DbPool::MySql(pool) => {
                bind_all!(sqlx::query(sql)).execute(pool).await?;
            }
            DbPool::Sqlite(pool) => {
                bind_all!(sqlx::query(sql)).execute(pool).await?;
            }
        }
        Ok(())
    }

    // ---- request_logs: filter-and-export (spec §4.5) ----------------------

    /// Streams the export rows for the Log Service (spec §4.5): one row
    /// per `key_hash`, the latest by `(timestamp DESC, id DESC)`, via a
    /// `ROW_NUMBER() OVER (PARTITION BY key_hash ...)` window function
    /// wrapped around the filter subquery. Identical SQL across dialects
    /// today (kept as a per-dialect dispatch point per spec: "kept
    /// separate to allow future divergence").
    pub async fn export_logs(&self, filter: &crate::log_service::LogFilter) -> Result<Vec<ExportedLogRow>> {
        let dialect = self.dialect();
        let mut conditions = Vec::new();
        let mut idx = 1;
        macro_rules! push_cond {
            ($sql:expr) => {{
                conditions.push(format!($sql, dialect.placeholder(idx)));
                idx += 1;
            }};
        }
        if filter.parent_group_name.is_some() {
            push_cond!("rl.parent_group_name = {}");
        }
        if filter.group_name.is_some() {
            push_cond!("rl.group_name = {}");
        }
        if filter.key_hash.is_some() {
            push_cond!("rl.key_hash = {}");
        }
        if filter.model.is_some() {
            push_cond!("rl.model = {}");
        }
        if filter.is_success.is_some() {
            push_cond!("rl.is_success = {}");
        }
        if filter.request_type.is_some() {
            push_cond!("rl.request_type = {}");
        }
        if filter.status_code.is_some() {
            push_cond!("rl.status_code = {}");
        }
        if filter.source_ip.is_some() {
            push_cond!("rl.source_ip = {}");
        }
        if filter.error_contains.is_some() {
            push_cond!("rl.error_message LIKE {} ESCAPE '!'");
        }
        if filter.start_time.is_some() {
            push_cond!("rl.timestamp >= {}");
        }
        if filter.end_time.is_some() {
            push_cond!("rl.timestamp < {}");
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        // `key_value` is the encrypted credential, which lives on `api_keys`
        // (unique per `group_id, key_hash`), not on `request_logs` itself.
        let sql = format!(
            "SELECT key_hash, key_value, group_name, model, is_success, status_code, timestamp FROM ( \
             SELECT rl.key_hash AS key_hash, ak.key_value AS key_value, rl.group_name AS group_name, \
             rl.model AS model, rl.is_success AS is_success, rl.status_code AS status_code, \
             rl.timestamp AS timestamp, rl.id AS id, \
             ROW_NUMBER() OVER (PARTITION BY rl.key_hash ORDER BY rl.timestamp DESC, rl.id DESC) AS rn \
             FROM request_logs rl \
             LEFT JOIN api_keys ak ON ak.group_id = rl.group_id AND ak.key_hash = rl.key_hash \
             {where_clause}) ranked WHERE rn = 1 ORDER BY timestamp DESC"
        );

        macro_rules! bind_filter {
            ($q:expr) => {{
                let mut q = $q;
                if let Some(v) = &filter.parent_group_name {
                    q = q.bind(v);
                }
                if let Some(v) = &filter.group_name {
                    q = q.bind(v);
                }
                if let Some(v) = &filter.key_hash {
                    q = q.bind(v);
                }
                if let Some(v) = &filter.model {
                    q = q.bind(v);
                }
                if let Some(v) = filter.is_success {
                    q = q.bind(v);
                }
                if let Some(v) = &filter.request_type {
                    q = q.bind(match v {
                        RequestType::Final => "final",
                        RequestType::Retry => "retry",
                    });
                }
                if let Some(v) = filter.status_code {
                    q = q.bind(v);
                }
                if let Some(v) = &filter.source_ip {
                    q = q.bind(v);
                }
                if let Some(v) = &filter.error_contains {
                    q = q.bind(crate::log_service::escape_like_pattern(v));
                }
                if let Some(v) = filter.start_time {
                    q = q.bind(v);
                }
                if let Some(v) = filter.end_time {
                    q = q.bind(v);
                }
                q
            }};
        }
        let rows: Vec<ExportedLogRow> = match &self.pool {
            DbPool::Postgres(pool) => bind_filter!(sqlx::query_as(&sql)).fetch_all(pool).await?,
            DbPool::MySql(pool) => bind_filter!(sqlx::query_as(&sql)).fetch_all(pool).await?,
            DbPool::Sqlite(pool) => bind_filter!(sqlx::query_as(&sql)).fetch_all(pool).await?,
        };
        Ok(rows)
    }

    // ---- transactions (spec §4.1.1 create, §4.1.3 Small-tier delete,
    // §4.4.4 "one transaction does three things atomically") ---------------

    /// Begins a transaction. Callers drive it through the `_tx`-suffixed
    /// methods below and must call [`DbTransaction::commit`] themselves;
    /// dropping it without committing rolls back.
    pub async fn begin(&self) -> Result<DbTransaction> {
        Ok(match &self.pool {
            DbPool::Postgres(pool) => DbTransaction::Postgres(pool.begin().await?),
            DbPool::MySql(pool) => DbTransaction::MySql(pool.begin().await?),
            DbPool::Sqlite(pool) => DbTransaction::Sqlite(pool.begin().await?),
        })
    }

    /// Transactional [`Self::insert_group`] (spec §4.1.1: "one transaction
    /// creates the group").
    pub async fn insert_group_tx(&self, tx: &mut DbTransaction, row: &GroupWriteRow) -> Result<i64> {
        let sql_pg = "INSERT INTO groups (name, display_name, group_type, channel_type, sort, \
             enabled, test_model, validation_endpoint, upstreams_json, config_json, \
             param_overrides_json, header_rules_json, model_redirect_rules_v2_json, \
             model_redirect_strict, path_redirects_json, proxy_keys, parent_group_id, \
             created_at, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,now(),now()) \
             RETURNING id";
        let sql_other = "INSERT INTO groups (name, display_name, group_type, channel_type, sort, \
             enabled, test_model, validation_endpoint, upstreams_json, config_json, \
             param_overrides_json, header_rules_json, model_redirect_rules_v2_json, \
             model_redirect_strict, path_redirects_json, proxy_keys, parent_group_id, \
             created_at, updated_at) \
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,CURRENT_TIMESTAMP,CURRENT_TIMESTAMP)";
        match tx {
            DbTransaction::Postgres(conn) => {
                let id: (i64,) = sqlx::query_as(sql_pg)
                    .bind(&row.name)
                    .bind(&row.display_name)
                    .bind(row.group_type)
                    .bind(&row.channel_type)
                    .bind(row.sort)
                    .bind(row.enabled)
                    .bind(&row.test_model)
                    .bind(&row.validation_endpoint)
                    .bind(&row.upstreams_json)
                    .bind(&row.config_json)
                    .bind(&row.param_overrides_json)
                    .bind(&row.header_rules_json)
                    .bind(&row.model_redirect_rules_v2_json)
                    .bind(row.model_redirect_strict)
                    .bind(&row.path_redirects_json)
                    .bind(&row.proxy_keys)
                    .bind(row.parent_group_id)
                    .fetch_one(&mut *conn)
                    .await?;
                Ok(id.0)
            }
            DbTransaction::MySql(conn) => {
                let result = sqlx::query(sql_other)
                    .bind(&row.name)
                    .bind(&row.display_name)
                    .bind(row.group_type)
                    .bind(&row.channel_type)
                    .bind(row.sort)
                    .bind(row.enabled)
                    .bind(&row.test_model)
                    .bind(&row.validation_endpoint)
                    .bind(&row.upstreams_json)
                    .bind(&row.config_json)
                    .bind(&row.param_overrides_json)
                    .bind(&row.header_rules_json)
                    .bind(&row.model_redirect_rules_v2_json)
                    .bind(row.model_redirect_strict)
                    .bind(&row.path_redirects_json)
                    .bind(&row.proxy_keys)
                    .bind(row.parent_group_id)
                    .execute(&mut *conn)
                    .await?;
                Ok(result.last_insert_id() as i64)
            }
            DbTransaction::Sqlite(conn) => {
                let result = sqlx::query(sql_other)
                    .bind(&row.name)
                    .bind(&row.display_name)
                    .bind(row.group_type)
                    .bind(&row.channel_type)
                    .bind(row.sort)
                    .bind(row.enabled)
                    .bind(&row.test_model)
                    .bind(&row.validation_endpoint)
                    .bind(&row.upstreams_json)
                    .bind(&row.config_json)
                    .bind(&row.param_overrides_json)
                    .bind(&row.header_rules_json)
                    .bind(&row.model_redirect_rules_v2_json)
                    .bind(row.model_redirect_strict)
                    .bind(&row.path_redirects_json)
                    .bind(&row.proxy_keys)
                    .bind(row.parent_group_id)
                    .execute(&mut *conn)
                    .await?;
                Ok(result.last_insert_rowid())
            }
        }
    }

    /// Transactional [`Self::insert_sub_group_edge`].
    pub async fn insert_sub_group_edge_tx(&self, tx: &mut DbTransaction, edge: GroupSubGroup) -> Result<()> {
        let sql = match tx.dialect() {
            Dialect::Postgres => "INSERT INTO group_sub_groups (group_id, sub_group_id) VALUES ($1, $2)",
            _ => "INSERT INTO group_sub_groups (group_id, sub_group_id) VALUES (?, ?)",
        };
        dispatch_tx!(tx, conn => {
            sqlx::query(sql)
                .bind(edge.group_id)
                .bind(edge.sub_group_id)
                .execute(&mut *conn)
                .await?;
        });
        Ok(())
    }

    /// Transactional [`Self::delete_sub_group_edges_for`].
    pub async fn delete_sub_group_edges_for_tx(&self, tx: &mut DbTransaction, group_id: i64) -> Result<()> {
        let sql = match tx.dialect() {
            Dialect::Postgres => {
                "DELETE FROM group_sub_groups WHERE group_id = $1 OR sub_group_id = $1"
            }
            _ => "DELETE FROM group_sub_groups WHERE group_id = ? OR sub_group_id = ?",
        };
        match tx {
            DbTransaction::Postgres(conn) => {
                sqlx::query(sql).bind(group_id).execute(&mut *conn).await?;
            }
            DbTransaction::MySql(conn) => {
                sqlx::query(sql).bind(group_id).bind(group_id).execute(&mut *conn).await?;
            }
            DbTransaction::Sqlite(conn) => {
                sqlx::query(sql).bind(group_id).bind(group_id).execute(&mut *conn).await?;
            }
        }
        Ok(())
    }

    /// Transactional [`Self::key_ids_chunk`].
    pub async fn key_ids_chunk_tx(
        &self,
        tx: &mut DbTransaction,
        group_id: i64,
        after: i64,
        limit: i64,
    ) -> Result<Vec<i64>> {
        let sql = match tx.dialect() {
            Dialect::Postgres => {
                "SELECT id FROM api_keys WHERE group_id = $1 AND id > $2 ORDER BY id ASC LIMIT $3"
            }
            _ => "SELECT id FROM api_keys WHERE group_id = ? AND id > ? ORDER BY id ASC LIMIT ?",
        };
        let rows: Vec<(i64,)> = dispatch_tx!(tx, conn => {
            sqlx::query_as(sql)
                .bind(group_id)
                .bind(after)
                .bind(limit)
                .fetch_all(&mut *conn)
                .await?
        });
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Transactional [`Self::delete_keys_by_ids`].
    pub async fn delete_keys_by_ids_tx(&self, tx: &mut DbTransaction, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = tx.dialect().placeholders(ids.len(), 1);
        let sql = format!("DELETE FROM api_keys WHERE id IN ({placeholders})");
        let affected = dispatch_tx!(tx, conn => {
            {
                let mut q = sqlx::query(&sql);
                for id in ids {
                    q = q.bind(id);
                }
                q.execute(&mut *conn).await?.rows_affected()
            }
        });
        Ok(affected)
    }

    /// Transactional [`Self::delete_hourly_stats_for_group`].
    pub async fn delete_hourly_stats_for_group_tx(&self, tx: &mut DbTransaction, group_id: i64) -> Result<()> {
        let sql = match tx.dialect() {
            Dialect::Postgres => "DELETE FROM group_hourly_stats WHERE group_id = $1",
            _ => "DELETE FROM group_hourly_stats WHERE group_id = ?",
        };
        dispatch_tx!(tx, conn => {
            sqlx::query(sql).bind(group_id).execute(&mut *conn).await?;
        });
        Ok(())
    }

    /// Transactional [`Self::delete_group_row`].
    pub async fn delete_group_row_tx(&self, tx: &mut DbTransaction, id: i64) -> Result<()> {
        let sql = match tx.dialect() {
            Dialect::Postgres => "DELETE FROM groups WHERE id = $1",
            _ => "DELETE FROM groups WHERE id = ?",
        };
        dispatch_tx!(tx, conn => {
            sqlx::query(sql).bind(id).execute(&mut *conn).await?;
        });
        Ok(())
    }

    /// Transactional [`Self::insert_logs`] (spec §4.4.4 step 1).
    pub async fn insert_logs_tx(&self, tx: &mut DbTransaction, logs: &[RequestLog]) -> Result<()> {
        if logs.is_empty() {
            return Ok(());
        }
        let ceiling = tx.dialect().bulk_insert_ceiling();
        for chunk in logs.chunks(ceiling) {
            self.insert_logs_chunk_tx(tx, chunk).await?;
        }
        Ok(())
    }

    async fn insert_logs_chunk_tx(&self, tx: &mut DbTransaction, chunk: &[RequestLog]) -> Result<()> {
        let dialect = tx.dialect();
        let cols = 16;
        let mut idx = 1;
        let mut value_clauses = Vec::with_capacity(chunk.len());
        for _ in chunk {
            value_clauses.push(format!("({})", dialect.placeholders(cols, idx)));
            idx += cols;
        }
        let sql = format!(
            "INSERT INTO request_logs (id, timestamp, group_id, parent_group_id, group_name, \
             parent_group_name, key_hash, is_success, status_code, request_type, is_stream, \
             model, source_ip, request_path, duration_ms, error_message) VALUES {}",
            value_clauses.join(", ")
        );

        macro_rules! bind_chunk {
            ($q:expr) => {{
                let mut q = $q;
                for log in chunk {
                    q = q
                        .bind(&log.id)
                        .bind(log.timestamp)
                        .bind(log.group_id)
                        .bind(log.parent_group_id)
                        .bind(&log.group_name)
                        .bind(&log.parent_group_name)
                        .bind(&log.key_hash)
                        .bind(log.is_success)
                        .bind(log.status_code)
                        .bind(match log.request_type {
                            RequestType::Final => "final",
                            RequestType::Retry => "retry",
                        })
                        .bind(log.is_stream)
                        .bind(&log.model)
                        .bind(&log.source_ip)
                        .bind(&log.request_path)
                        .bind(log.duration_ms)
                        .bind(&log.error_message);
                }
                q
            }};
        }
        dispatch_tx!(tx, conn => {
            bind_chunk!(sqlx::query(&sql)).execute(&mut *conn).await?;
        });
        Ok(())
    }

    /// Transactional [`Self::bump_key_usage`] (spec §4.4.4 step 2).
    pub async fn bump_key_usage_tx(&self, tx: &mut DbTransaction, increments: &HashMap<String, i64>) -> Result<()> {
        if increments.is_empty() {
            return Ok(());
        }
        let dialect = tx.dialect();
        let mut case_sql = String::with_capacity(increments.len() * 32);
        case_sql.push_str("CASE key_hash ");
        let mut idx = 1;
        let mut hash_binds = Vec::with_capacity(increments.len());
        for (hash, n) in increments {
            case_sql.push_str(&format!("WHEN {} THEN request_count + {} ", dialect.placeholder(idx), n));
            hash_binds.push(hash.clone());
            idx += 1;
        }
        case_sql.push_str("ELSE request_count END");

        let in_placeholders = dialect.placeholders(increments.len(), idx);
        let now_expr = match dialect {
            Dialect::Postgres => "now()",
            _ => "CURRENT_TIMESTAMP",
        };
        let sql = format!(
            "UPDATE api_keys SET request_count = {case_sql}, last_used_at = {now_expr} \
             WHERE key_hash IN ({in_placeholders})"
        );

        macro_rules! bind_all {
            ($q:expr) => {{
                let mut q = $q;
                for hash in &hash_binds {
                    q = q.bind(hash);
                }
                for hash in &hash_binds {
                    q = q.bind(hash);
                }
                q
            }};
        }
        dispatch_tx!(tx, conn => {
            bind_all!(sqlx::query(&sql)).execute(&mut *conn).await?;
        });
        Ok(())
    }

    /// Transactional [`Self::upsert_hourly_stats`] (spec §4.4.4 step 3).
    pub async fn upsert_hourly_stats_tx(&self, tx: &mut DbTransaction, deltas: &[HourlyStatDelta]) -> Result<()> {
        let batch_size = tx.dialect().hourly_stats_batch_size();
        for chunk in deltas.chunks(batch_size) {
            self.upsert_hourly_stats_chunk_tx(tx, chunk).await?;
        }
        Ok(())
    }

    async fn upsert_hourly_stats_chunk_tx(&self, tx: &mut DbTransaction, chunk: &[HourlyStatDelta]) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let dialect = tx.dialect();
        let values_per_row = 4;
        let mut idx = 1;
        let mut value_clauses = Vec::with_capacity(chunk.len());
        for _ in chunk {
            value_clauses.push(format!("({})", dialect.placeholders(values_per_row, idx)));
            idx += values_per_row;
        }
        let values_sql = value_clauses.join(", ");

        let sql = match dialect {
            Dialect::Postgres => format!(
                "INSERT INTO group_hourly_stats (time, group_id, success_count, failure_count) \
                 VALUES {values_sql} \
                 ON CONFLICT (time, group_id) DO UPDATE SET \
                 success_count = group_hourly_stats.success_count + EXCLUDED.success_count, \
                 failure_count = group_hourly_stats.failure_count + EXCLUDED.failure_count, \
                 updated_at = now()"
            ),
            Dialect::MySql => format!(
                "INSERT INTO group_hourly_stats (time, group_id, success_count, failure_count) \
                 VALUES {values_sql} \
                 ON DUPLICATE KEY UPDATE \
                 success_count = success_count + VALUES(success_count), \
                 failure_count = failure_count + VALUES(failure_count), \
                 updated_at = CURRENT_TIMESTAMP"
            ),
            Dialect::Sqlite => format!(
                "INSERT INTO group_hourly_stats (time, group_id, success_count, failure_count) \
                 VALUES {values_sql} \
                 ON CONFLICT (time, group_id) DO UPDATE SET \
                 success_count = group_hourly_stats.success_count + excluded.success_count, \
                 failure_count = group_hourly_stats.failure_count + excluded.failure_count, \
                 updated_at = CURRENT_TIMESTAMP"
            ),
        };

        macro_rules! bind_chunk {
            ($q:expr) => {{
                let mut q = $q;
                for delta in chunk {
                    q = q
                        .bind(delta.time)
                        .bind(delta.group_id)
                        .bind(delta.success_delta)
                        .bind(delta.failure_delta);
                }
                q
            }};
        }
        dispatch_tx!(tx, conn => {
            bind_chunk!(sqlx::query(&sql)).execute(&mut *conn).await?;
        });
        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MetricRow {
    subject_key: String,
    metric_type: String,
    window_7d_json: String,
    window_14d_json: String,
    window_30d_json: String,
    window_90d_json: String,
    window_180d_json: String,
    consecutive_failures: i64,
    deleted_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl MetricRow {
    fn from_metric(m: &DynamicWeightMetric) -> Result<Self> {
        Ok(Self {
            subject_key: m.subject_key.clone(),
            metric_type: match m.metric_type {
                crate::model::MetricType::Group => "group".to_string(),
                crate::model::MetricType::SubGroup => "sub_group".to_string(),
                crate::model::MetricType::ModelRedirect => "model_redirect".to_string(),
            },
            window_7d_json: serde_json::to_string(&m.window_7d)?,
            window_14d_json: serde_json::to_string(&m.window_14d)?,
            window_30d_json: serde_json::to_string(&m.window_30d)?,
            window_90d_json: serde_json::to_string(&m.window_90d)?,
            window_180d_json: serde_json::to_string(&m.window_180d)?,
            consecutive_failures: m.consecutive_failures as i64,
            deleted_at: m.deleted_at,
            updated_at: m.updated_at,
        })
    }

    fn into_metric(self) -> Result<DynamicWeightMetric> {
        Ok(DynamicWeightMetric {
            metric_type: match self.metric_type.as_str() {
                "sub_group" => crate::model::MetricType::SubGroup,
                "model_redirect" => crate::model::MetricType::ModelRedirect,
                _ => crate::model::MetricType::Group,
            },
            subject_key: self.subject_key,
            window_7d: serde_json::from_str(&self.window_7d_json)?,
            window_14d: serde_json::from_str(&self.window_14d_json)?,
            window_30d: serde_json::from_str(&self.window_30d_json)?,
            window_90d: serde_json::from_str(&self.window_90d_json)?,
            window_180d: serde_json::from_str(&self.window_180d_json)?,
            consecutive_failures: self.consecutive_failures.max(0) as u32,
            deleted_at: self.deleted_at,
            updated_at: self.updated_at,
        })
    }
}

/// One row of the log-export stream (spec §4.5): the latest row per
/// `key_hash`, `key_value` already decrypted by the caller.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ExportedLogRow {
    pub key_hash: String,
    /// `None` when the originating key was since deleted; the caller emits
    /// `"failed-to-decrypt"` for those rows the same as an actual decrypt
    /// failure.
    pub key_value: Option<Vec<u8>>,
    pub group_name: String,
    pub model: Option<String>,
    pub is_success: bool,
    pub status_code: i32,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_placeholder_syntax() {
        assert_eq!(Dialect::Postgres.placeholder(3), "$3");
        assert_eq!(Dialect::MySql.placeholder(3), "?");
        assert_eq!(Dialect::Sqlite.placeholder(3), "?");
        assert_eq!(Dialect::Postgres.placeholders(3, 1), "$1, $2, $3");
        assert_eq!(Dialect::MySql.placeholders(3, 1), "?, ?, ?");
    }

    #[test]
    fn dialect_batch_ceilings_match_spec() {
        assert_eq!(Dialect::MySql.bulk_insert_ceiling(), 5_000);
        assert_eq!(Dialect::Postgres.bulk_insert_ceiling(), 3_000);
        assert_eq!(Dialect::Sqlite.bulk_insert_ceiling(), 50);
        assert_eq!(Dialect::Postgres.hourly_stats_batch_size(), 500);
        assert_eq!(Dialect::MySql.hourly_stats_batch_size(), 500);
        assert_eq!(Dialect::Sqlite.hourly_stats_batch_size(), 50);
    }

    #[test]
    fn request_stats_window_failure_rate_rounds_to_4_places() {
        let w = RequestStatsWindow {
            total: 3,
            failed: 1,
        };
        assert_eq!(w.failure_rate(), 0.3333);
        assert_eq!(RequestStatsWindow::default().failure_rate(), 0.0);
    }
}
