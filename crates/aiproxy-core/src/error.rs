//! Error taxonomy for `aiproxy-core`.
//!
//! Every variant maps to the boundary shape spec §6 requires: an HTTP
//! status, a short stable code, and a human message. The enum itself
//! follows `mockforge-core::error`'s shape (a flat `thiserror` enum with
//! `From` impls for the usual suspects), generalized with the
//! `(status, code)` pair the spec's error taxonomy (§7) needs.

use std::fmt;

/// Result type alias for `aiproxy-core` operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A validator rejected the request before any write occurred (spec §7 *Validation*).
    #[error("validation error: {message}")]
    Validation {
        kind: ValidationKind,
        message: String,
    },

    /// The target group/key/task does not exist.
    #[error("not found: {message}")]
    NotFound { message: String },

    /// A conflicting state prevents the operation (spec §7 *Conflict*).
    #[error("conflict: {code}: {message}")]
    Conflict { code: &'static str, message: String },

    /// A deadline-exceeded/cancelled/lock-busy database error. The only
    /// error kind on which read paths may serve a stale cache (spec §5, §7).
    #[error("transient database error: {0}")]
    Transient(String),

    /// Group deletion was accepted and moved to the async task service
    /// (spec §4.1.3 Large tier, §6 `GROUP_DELETE_ASYNC`).
    #[error("delete accepted asynchronously, task_id={task_id}")]
    DeleteAccepted { task_id: String },

    /// The task service has a task running already (spec §4.3 `TASK_SERVICE_UNAVAILABLE`).
    #[error("task service unavailable: another task is running")]
    TaskServiceUnavailable,

    /// Upstream model-list fetch failed with a mapped status (spec §4.1.6).
    #[error("upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    /// Database error that is not classified as transient (spec §7 *Permanent DB*).
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("encryption error: {0}")]
    Encryption(#[from] crate::encryption::EncryptionError),

    #[error("{message}")]
    Generic { message: String },
}

/// The distinct validation-error kinds spec §7 enumerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationKind {
    InvalidGroupName,
    UnknownChannelType,
    InvalidGroupType,
    InvalidUpstreams,
    InvalidValidationEndpoint,
    UnknownConfigField,
    ConfigValueTypeMismatch,
    ParamOverrideTypeMismatch,
    InvalidModelMapping,
    AggregateNoModelRedirect,
    DuplicateHeaderRule,
    ChildCannotModifyUpstreams,
    SubGroupReferencedCannotModifyChannel,
    CcSupportCannotDisableUsedByAnthropic,
    InvalidCopyKeysOption,
}

impl fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidGroupName => "invalid_group_name",
            Self::UnknownChannelType => "unknown_channel_type",
            Self::InvalidGroupType => "invalid_group_type",
            Self::InvalidUpstreams => "invalid_upstreams",
            Self::InvalidValidationEndpoint => "invalid_validation_endpoint",
            Self::UnknownConfigField => "unknown_config_field",
            Self::ConfigValueTypeMismatch => "config_value_type_mismatch",
            Self::ParamOverrideTypeMismatch => "param_override_type_mismatch",
            Self::InvalidModelMapping => "invalid_model_mapping",
            Self::AggregateNoModelRedirect => "aggregate_no_model_redirect",
            Self::DuplicateHeaderRule => "duplicate_header_rule",
            Self::ChildCannotModifyUpstreams => "child_cannot_modify_upstreams",
            Self::SubGroupReferencedCannotModifyChannel => {
                "sub_group_referenced_cannot_modify_channel"
            }
            Self::CcSupportCannotDisableUsedByAnthropic => {
                "cc_support_cannot_disable_used_by_anthropic"
            }
            Self::InvalidCopyKeysOption => "invalid_copy_keys_option",
        };
        f.write_str(s)
    }
}

/// The `(http_status, code)` boundary pair spec §6 requires every error to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Boundary {
    pub status: u16,
    pub code: &'static str,
}

impl Error {
    pub fn validation(kind: ValidationKind, message: impl Into<String>) -> Self {
        Self::Validation {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::Generic {
            message: message.into(),
        }
    }

    pub fn bound_sites(group_id: i64) -> Self {
        Self::Conflict {
            code: "GROUP_HAS_BOUND_SITES",
            message: format!(
                "group {group_id} has bound sites; unbind them before deleting"
            ),
        }
    }

    pub fn check_bound_sites_failed(message: impl Into<String>) -> Self {
        Self::Conflict {
            code: "CHECK_BOUND_SITES_FAILED",
            message: message.into(),
        }
    }

    pub fn key_delete_failed(message: impl Into<String>) -> Self {
        Self::Conflict {
            code: "KEY_DELETE_FAILED",
            message: message.into(),
        }
    }

    /// Classify whether this error is "transient" per spec §5/§7 — the
    /// only class on which read paths may serve stale cache.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
            || matches!(
                self,
                Self::Database(e) if matches!(
                    e,
                    sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)
                )
            )
    }

    /// The `(status, code)` pair for this error, per spec §6.
    pub fn boundary(&self) -> Boundary {
        match self {
            Self::Validation { .. } => Boundary {
                status: 400,
                code: "VALIDATION_ERROR",
            },
            Self::NotFound { .. } => Boundary {
                status: 404,
                code: "NOT_FOUND",
            },
            Self::Conflict { code, .. } => Boundary { status: 409, code },
            Self::Transient(_) => Boundary {
                status: 503,
                code: "TRANSIENT_DB_ERROR",
            },
            Self::DeleteAccepted { .. } => Boundary {
                status: 202,
                code: "GROUP_DELETE_ASYNC",
            },
            Self::TaskServiceUnavailable => Boundary {
                status: 503,
                code: "TASK_SERVICE_UNAVAILABLE",
            },
            Self::Upstream { .. } => Boundary {
                status: 502,
                code: "UPSTREAM_ERROR",
            },
            Self::Database(_) => Boundary {
                status: 500,
                code: "DATABASE_ERROR",
            },
            Self::Json(_) | Self::Io(_) | Self::Http(_) | Self::Encryption(_) | Self::Generic { .. } => {
                Boundary {
                    status: 500,
                    code: "INTERNAL_ERROR",
                }
            }
        }
    }

    /// Task id carried by a [`Error::DeleteAccepted`], if any.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::DeleteAccepted { task_id } => Some(task_id),
            _ => None,
        }
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Self::Generic { message }
    }
}
