//! Persisted and in-flight data entities shared across the core.
//!
//! Mirrors `spec.md` §3 (DATA MODEL) exactly; field names match the
//! wording of the specification so the mapping between spec and code is
//! obvious on inspection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `group_type` discriminant (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupType {
    /// Owns keys and upstreams, forwards requests directly.
    Standard,
    /// Routes to member sub-groups; owns no keys/upstreams/redirects.
    Aggregate,
}

/// `status` of an [`ApiKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Invalid,
}

/// One `{url, weight, proxy_url?}` destination within a group (spec §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upstream {
    pub url: String,
    pub weight: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
}

/// Header-rule action (append/replace/remove are the common cases; kept
/// open-ended since the concrete rewriting behavior is an external
/// collaborator per spec §1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderAction {
    Set,
    Append,
    Remove,
}

/// One entry of `header_rules` (spec §6). `key` is stored in HTTP
/// canonical case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderRule {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub action: HeaderAction,
}

/// One entry of `path_redirects` (spec §6): `from` is normalized at
/// validation time and again at lookup time via the same function so the
/// two never drift.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathRedirect {
    pub from: String,
    pub to: String,
}

/// Redirect strategy for `model_redirect_rules_v2` (spec §6 GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectStrategy {
    /// Always redirect to the first target.
    First,
    /// Round-robin across targets.
    RoundRobin,
    /// Pick uniformly at random among targets.
    Random,
}

/// One `source_model -> {targets, strategy}` entry of the V2 model
/// redirect map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRedirectRuleV2 {
    pub targets: Vec<String>,
    pub strategy: RedirectStrategy,
}

/// `copy_keys_option` accepted by `CopyGroup` (spec §4.1.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyKeysOption {
    #[default]
    None,
    ValidOnly,
    All,
}

/// A routing unit (spec §3, table row "Group").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub display_name: String,
    pub group_type: GroupType,
    pub channel_type: String,
    pub sort: i32,
    pub enabled: bool,
    pub test_model: String,
    pub validation_endpoint: String,
    pub upstreams: Vec<Upstream>,
    pub config: HashMap<String, serde_json::Value>,
    pub param_overrides: HashMap<String, serde_json::Value>,
    pub header_rules: Vec<HeaderRule>,
    pub model_redirect_rules_v2: HashMap<String, ModelRedirectRuleV2>,
    pub model_redirect_strict: bool,
    pub path_redirects: Vec<PathRedirect>,
    pub proxy_keys: String,
    pub parent_group_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Group {
    /// `true` for sub-groups owned by an aggregate parent.
    pub fn is_child(&self) -> bool {
        self.parent_group_id.is_some()
    }
}

/// A credential belonging to exactly one group (spec §3, table row "APIKey").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: i64,
    pub group_id: i64,
    /// Deterministic fingerprint of the plaintext key, unique within `group_id`.
    pub key_hash: String,
    /// Encrypted credential; never logged or serialized in cleartext.
    pub key_value: Vec<u8>,
    pub status: KeyStatus,
    pub request_count: i64,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Edge from an aggregate group to one of its standard member groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSubGroup {
    pub group_id: i64,
    pub sub_group_id: i64,
}

/// Aggregated per-hour request counters keyed by `(time, group_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupHourlyStat {
    pub time: DateTime<Utc>,
    pub group_id: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub updated_at: DateTime<Utc>,
}

/// `request_type` of a [`RequestLog`] entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Final,
    Retry,
}

/// One forwarded-request record (spec §3, table row "RequestLog").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLog {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub group_id: i64,
    pub parent_group_id: Option<i64>,
    pub group_name: String,
    /// Denormalized name of `parent_group_id`'s group, if any; carried so
    /// the Log Service's `parent_group_name` filter (spec §4.5) doesn't
    /// need a join against a group that may since have been deleted.
    #[serde(default)]
    pub parent_group_name: Option<String>,
    #[serde(default)]
    pub key_hash: Option<String>,
    pub is_success: bool,
    pub status_code: i32,
    pub request_type: RequestType,
    pub is_stream: bool,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub source_ip: Option<String>,
    pub request_path: String,
    pub duration_ms: i64,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// `metric_type` discriminant for [`DynamicWeightMetric`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Group,
    SubGroup,
    ModelRedirect,
}

/// Per-subject rolling health sample (spec §3, table row "DynamicWeightMetric").
///
/// The decay windows are carried as separate fields rather than a map to
/// keep the hot update path (a single successes/failures increment) free
/// of hashing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicWeightMetric {
    pub metric_type: MetricType,
    /// Composite subject key, e.g. `group:<id>`, `sub_group:<agg_id>:<sub_id>`,
    /// `model_redirect:<group_id>:<source_model>`.
    pub subject_key: String,
    pub window_7d: DecayedCounters,
    pub window_14d: DecayedCounters,
    pub window_30d: DecayedCounters,
    pub window_90d: DecayedCounters,
    pub window_180d: DecayedCounters,
    pub consecutive_failures: u32,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Timestamp of the last sample folded into the decayed counters;
    /// used to compute elapsed time for the next decay step.
    pub updated_at: DateTime<Utc>,
}

/// Rolling success/failure counters for one decay window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DecayedCounters {
    pub success: f64,
    pub failure: f64,
}

/// A boundary row (external to this core) recording that some managed
/// site binds to a group; only its existence is checked (spec §4.1.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagedSiteBinding {
    pub group_id: i64,
}

/// Parameters accepted by `CreateGroup` (spec §4.1.1). Optional fields
/// default the same way the validators in `validation.rs` expect.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateGroupParams {
    pub name: String,
    pub display_name: Option<String>,
    pub channel_type: String,
    pub group_type: Option<GroupType>,
    pub sort: Option<i32>,
    pub enabled: Option<bool>,
    pub test_model: Option<String>,
    pub validation_endpoint: Option<String>,
    pub upstreams: Option<serde_json::Value>,
    pub config: Option<HashMap<String, serde_json::Value>>,
    pub param_overrides: Option<HashMap<String, serde_json::Value>>,
    pub header_rules: Option<Vec<HeaderRule>>,
    pub model_redirect_rules_v2: Option<HashMap<String, ModelRedirectRuleV2>>,
    pub model_redirect_strict: Option<bool>,
    /// Legacy flat `source -> target` map, merged into V2 on create (spec §4.1.1 step 10).
    pub model_mapping: Option<HashMap<String, String>>,
    pub path_redirects: Option<Vec<PathRedirect>>,
    pub proxy_keys: Option<String>,
    pub parent_group_id: Option<i64>,
}

/// Parameters accepted by `UpdateGroup` (spec §4.1.2). `None` means "leave
/// unchanged"; every `Some` field is re-validated with the same rules as
/// create.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateGroupParams {
    pub display_name: Option<String>,
    pub channel_type: Option<String>,
    pub sort: Option<i32>,
    pub enabled: Option<bool>,
    pub test_model: Option<String>,
    pub validation_endpoint: Option<String>,
    pub upstreams: Option<serde_json::Value>,
    pub config: Option<HashMap<String, serde_json::Value>>,
    pub param_overrides: Option<HashMap<String, serde_json::Value>>,
    pub header_rules: Option<Vec<HeaderRule>>,
    pub model_redirect_rules_v2: Option<HashMap<String, ModelRedirectRuleV2>>,
    pub model_redirect_strict: Option<bool>,
    pub model_mapping: Option<HashMap<String, String>>,
    pub path_redirects: Option<Vec<PathRedirect>>,
    pub proxy_keys: Option<String>,
    pub name: Option<String>,
}
