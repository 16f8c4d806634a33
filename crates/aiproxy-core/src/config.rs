//! Tunable thresholds and the `GroupConfig` option schema.
//!
//! Spec §9 flags the original's runtime reflection over a settings struct
//! as a redesign target: "ship a static schema table ... drive both
//! round-trip and metadata from that table." This module is that table.

use serde_json::Value;
use std::time::Duration;

/// Operation-size tier thresholds (spec §4.6, §4.1.3, §4.1.4).
///
/// The constants are heuristic per spec §9's note on the adaptive-TTL
/// multiplier; implementers may tune them without changing behavior.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub fast_sync: u64,
    pub bulk_sync: u64,
    pub large_sync: u64,
    pub optimized_sync: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            fast_sync: 1_000,
            bulk_sync: 5_000,
            large_sync: 10_000,
            optimized_sync: 20_000,
        }
    }
}

/// Operation tier derived from a key count (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    FastSync,
    BulkSync,
    LargeSync,
    OptimizedSync,
    Async,
}

impl Thresholds {
    /// `spec.md` §4.1.3's delete tier: only three buckets (small/medium/large),
    /// computed from `BulkSyncThreshold`/`OptimizedSyncThreshold`.
    pub fn delete_tier(&self, key_count: u64) -> DeleteTier {
        if key_count <= self.bulk_sync {
            DeleteTier::Small
        } else if key_count <= self.optimized_sync {
            DeleteTier::Medium
        } else {
            DeleteTier::Large
        }
    }

    /// `spec.md` §4.1.4's copy tier and §4.6's general operation tier.
    pub fn tier(&self, count: u64) -> Tier {
        if count <= self.fast_sync {
            Tier::FastSync
        } else if count <= self.bulk_sync {
            Tier::BulkSync
        } else if count <= self.large_sync {
            Tier::LargeSync
        } else if count <= self.optimized_sync {
            Tier::OptimizedSync
        } else {
            Tier::Async
        }
    }
}

/// Group-deletion tier (spec §4.1.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteTier {
    Small,
    Medium,
    Large,
}

/// Per-dialect batch ceilings (spec §4.6) and hourly-stats chunk sizes
/// (spec §4.4.4).
#[derive(Debug, Clone, Copy)]
pub struct DialectLimits {
    pub bulk_insert_ceiling: u32,
    pub hourly_stats_batch_size: u32,
}

/// Deadlines for the suspension points named in spec §5.
#[derive(Debug, Clone, Copy)]
pub struct Deadlines {
    /// Group list and short lookups; default ≈300ms, configurable.
    pub lookup: Duration,
    /// Key-stats counts; 2x `lookup`.
    pub key_stats: Duration,
    /// Background key-deletion cleanup.
    pub background_cleanup: Duration,
    /// Upstream model fetch, unless overridden per-channel.
    pub upstream_fetch: Duration,
}

impl Default for Deadlines {
    fn default() -> Self {
        let lookup = Duration::from_millis(300);
        Self {
            lookup,
            key_stats: lookup * 2,
            background_cleanup: Duration::from_secs(30),
            upstream_fetch: Duration::from_secs(30),
        }
    }
}

/// Adaptive-cache tuning (spec §4.1.5, §5).
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveCacheConfig {
    pub base_ttl: Duration,
    pub max_ttl: Duration,
    pub hit_threshold: u64,
    pub ttl_multiplier: f64,
}

impl Default for AdaptiveCacheConfig {
    fn default() -> Self {
        Self {
            base_ttl: Duration::from_secs(30),
            max_ttl: Duration::from_secs(120),
            hit_threshold: 10,
            ttl_multiplier: 1.2,
        }
    }
}

/// Request-log buffering/flush tuning (spec §4.4).
#[derive(Debug, Clone, Copy)]
pub struct RequestLogConfig {
    pub max_pending_logs: u64,
    pub write_interval: Duration,
    pub emergency_interval: Duration,
    pub flush_batch_size: usize,
}

impl Default for RequestLogConfig {
    fn default() -> Self {
        Self {
            max_pending_logs: 10_000,
            write_interval: Duration::from_secs(60),
            emergency_interval: Duration::from_secs(30),
            flush_batch_size: 200,
        }
    }
}

/// Top-level tunable configuration composing the above, analogous to
/// `mockforge-core::Config`.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub thresholds: Thresholds,
    pub deadlines: Deadlines,
    pub adaptive_cache: AdaptiveCacheConfig,
    pub request_log: RequestLogConfig,
    /// Port this process listens on; only used to compose a child
    /// group's self-referential proxy URL (spec §6).
    pub port: u16,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            deadlines: Deadlines::default(),
            adaptive_cache: AdaptiveCacheConfig::default(),
            request_log: RequestLogConfig::default(),
            port: 3001,
        }
    }
}

impl CoreConfig {
    /// Reads `PORT` from the environment, defaulting to 3001 (spec §6).
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3001);
        Self {
            port,
            ..Self::default()
        }
    }
}

/// The type a [`ConfigOptionSpec`] validates against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigValueType {
    Bool,
    Integer,
    String,
}

/// Metadata for one recognized `config` key (spec §6's `GetGroupConfigOptions`).
#[derive(Debug, Clone, Copy)]
pub struct ConfigOptionSpec {
    pub key: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub value_type: ConfigValueType,
    pub default: &'static str,
}

/// Backward-compat rename applied before validation (spec §4.1.1 step 5).
pub fn canonicalize_config_key(key: &str) -> String {
    if key == "force_function_calling" {
        "force_function_call".to_string()
    } else {
        key.to_string()
    }
}

/// Truthy values accepted for `cc_support` (spec §6): `true`/`1`/`yes`/`on`
/// or any non-zero number.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on"),
        _ => false,
    }
}

/// Static allow-list of recognized `config` keys, replacing the original's
/// runtime reflection over a settings struct (spec §9 redesign note).
pub const CONFIG_OPTIONS: &[ConfigOptionSpec] = &[
    ConfigOptionSpec {
        key: "connect_timeout",
        name: "Connect timeout",
        description: "Maximum time, in seconds, to establish a TCP connection to an upstream.",
        value_type: ConfigValueType::Integer,
        default: "10",
    },
    ConfigOptionSpec {
        key: "request_timeout",
        name: "Request timeout",
        description: "Maximum time, in seconds, to wait for an upstream response.",
        value_type: ConfigValueType::Integer,
        default: "120",
    },
    ConfigOptionSpec {
        key: "cc_support",
        name: "Claude Code support",
        description: "Whether this group advertises Claude-Code-compatible behavior.",
        value_type: ConfigValueType::Bool,
        default: "false",
    },
    ConfigOptionSpec {
        key: "force_function_call",
        name: "Force function calling",
        description: "Rewrite requests to force tool/function-call mode where supported.",
        value_type: ConfigValueType::Bool,
        default: "false",
    },
];

/// Returns the spec for a recognized `config` key, applying the
/// `force_function_calling` -> `force_function_call` rename first.
pub fn lookup_config_option(key: &str) -> Option<&'static ConfigOptionSpec> {
    let canonical = canonicalize_config_key(key);
    CONFIG_OPTIONS.iter().find(|o| o.key == canonical)
}
