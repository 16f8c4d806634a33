//! Validators for group creation/update (spec §4.1.1, §4.1.2).
//!
//! Each function returns a distinct [`ValidationKind`] on failure, matching
//! the spec's requirement that "each failure yield[s] a distinct validation
//! error kind." Validators never touch the database — they run strictly
//! before any write, per spec §7's propagation policy.

use crate::error::{Error, Result, ValidationKind};
use crate::model::{
    HeaderAction, HeaderRule, ModelRedirectRuleV2, PathRedirect, Upstream,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

static GROUP_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9_-]{1,100}$").unwrap());

/// `isValidGroupName` (spec §8 invariant).
pub fn is_valid_group_name(name: &str) -> bool {
    GROUP_NAME_RE.is_match(name)
}

/// Trims and validates a group name (spec §4.1.1 step 1).
pub fn validate_group_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if !is_valid_group_name(trimmed) {
        return Err(Error::validation(
            ValidationKind::InvalidGroupName,
            format!("group name {trimmed:?} must match ^[a-z0-9_-]{{1,100}}$"),
        ));
    }
    Ok(trimmed.to_string())
}

/// `channel_type` must be a known registry value (spec §4.1.1 step 2).
pub fn validate_channel_type(channel_type: &str, registry: &[&str]) -> Result<()> {
    if registry.contains(&channel_type) {
        Ok(())
    } else {
        Err(Error::validation(
            ValidationKind::UnknownChannelType,
            format!("unknown channel_type {channel_type:?}"),
        ))
    }
}

/// `validation_endpoint` empty or begins with `/` without a scheme
/// (spec §4.1.1 step 4).
pub fn validate_validation_endpoint(endpoint: &str) -> Result<()> {
    if endpoint.is_empty() {
        return Ok(());
    }
    if endpoint.starts_with("/") && !endpoint.contains("://") {
        Ok(())
    } else {
        Err(Error::validation(
            ValidationKind::InvalidValidationEndpoint,
            format!("validation_endpoint {endpoint:?} must be empty or start with '/'"),
        ))
    }
}

/// Parses and validates the `upstreams` JSON for a standard group
/// (spec §4.1.1 step 4, §6, §8 boundary case: weight 0 alone rejected,
/// `[0, 1]` accepted).
pub fn validate_upstreams(raw: &Value) -> Result<Vec<Upstream>> {
    let upstreams: Vec<Upstream> = serde_json::from_value(raw.clone()).map_err(|e| {
        Error::validation(
            ValidationKind::InvalidUpstreams,
            format!("upstreams did not parse: {e}"),
        )
    })?;

    if upstreams.is_empty() {
        return Err(Error::validation(
            ValidationKind::InvalidUpstreams,
            "upstreams must be a non-empty list",
        ));
    }

    let mut any_positive_weight = false;
    for u in &upstreams {
        if !(u.url.starts_with("http://") || u.url.starts_with("https://")) {
            return Err(Error::validation(
                ValidationKind::InvalidUpstreams,
                format!("upstream url {:?} must be http(s)", u.url),
            ));
        }
        // Upstream::weight is u32 so it can never be negative at the type
        // level; a negative JSON number fails to deserialize above.
        if u.weight > 0 {
            any_positive_weight = true;
        }
    }
    if !any_positive_weight {
        return Err(Error::validation(
            ValidationKind::InvalidUpstreams,
            "at least one upstream must have weight > 0",
        ));
    }
    Ok(upstreams)
}

/// Recognized `param_overrides` keys and their expected JSON shape
/// (spec §4.1.1 step 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamType {
    Bool,
    Number,
    Integer,
    StringOrStringArray,
}

fn recognized_param_type(key: &str) -> Option<ParamType> {
    match key {
        "stream" => Some(ParamType::Bool),
        "temperature" | "top_p" | "presence_penalty" | "frequency_penalty" => {
            Some(ParamType::Number)
        }
        "max_tokens" | "max_tokens_to_sample" | "max_output_tokens" | "n" | "seed" => {
            Some(ParamType::Integer)
        }
        "stop" => Some(ParamType::StringOrStringArray),
        _ => None,
    }
}

/// A JSON number is "integer" iff `value == trunc(value)` (spec §4.1.1
/// step 6, §8 boundary: `3.0` accepted, `3.1` rejected).
fn is_integer_valued(n: &serde_json::Number) -> bool {
    n.as_f64().is_some_and(|f| f == f.trunc())
}

/// Validates `param_overrides` against the typed contract. Unrecognized
/// keys are passed through untouched (only the listed keys are type-checked).
pub fn validate_param_overrides(overrides: &HashMap<String, Value>) -> Result<()> {
    for (key, value) in overrides {
        let Some(expected) = recognized_param_type(key) else {
            continue;
        };
        let ok = match (expected, value) {
            (ParamType::Bool, Value::Bool(_)) => true,
            (ParamType::Number, Value::Number(_)) => true,
            (ParamType::Integer, Value::Number(n)) => is_integer_valued(n),
            (ParamType::StringOrStringArray, Value::String(_)) => true,
            (ParamType::StringOrStringArray, Value::Array(items)) => {
                items.iter().all(|v| v.is_string())
            }
            _ => false,
        };
        if !ok {
            return Err(Error::validation(
                ValidationKind::ParamOverrideTypeMismatch,
                format!("param_overrides[{key}] has the wrong type for value {value}"),
            ));
        }
    }
    Ok(())
}

/// Whether `value` round-trips through `expected` (spec §4.1.1 step 5:
/// "values round-trip through the typed GroupConfig schema"). `cc_support`
/// is special-cased per spec §6: it accepts its declared `Bool` type plus
/// the truthy string/number forms `is_truthy` recognizes, not bool alone.
fn config_value_matches_type(key: &str, expected: crate::config::ConfigValueType, value: &Value) -> bool {
    use crate::config::ConfigValueType;
    if key == "cc_support" {
        return matches!(value, Value::Bool(_) | Value::Number(_) | Value::String(_));
    }
    match (expected, value) {
        (ConfigValueType::Bool, Value::Bool(_)) => true,
        (ConfigValueType::Integer, Value::Number(n)) => is_integer_valued(n),
        (ConfigValueType::String, Value::String(_)) => true,
        _ => false,
    }
}

/// Validates the `config` map: keys restricted to the known set, with the
/// `force_function_calling` -> `force_function_call` rename applied first,
/// and each value type-checked against its `ConfigOption.value_type` (spec
/// §4.1.1 step 5). Returns the canonicalized map.
pub fn validate_config(config: &HashMap<String, Value>) -> Result<HashMap<String, Value>> {
    let mut canonical = HashMap::with_capacity(config.len());
    for (key, value) in config {
        let canonical_key = crate::config::canonicalize_config_key(key);
        let Some(spec) = crate::config::lookup_config_option(&canonical_key) else {
            return Err(Error::validation(
                ValidationKind::UnknownConfigField,
                format!("unknown config field {key:?}"),
            ));
        };
        if !config_value_matches_type(&canonical_key, spec.value_type, value) {
            return Err(Error::validation(
                ValidationKind::ConfigValueTypeMismatch,
                format!("config[{canonical_key}] has the wrong type for value {value}"),
            ));
        }
        canonical.insert(canonical_key, value.clone());
    }
    Ok(canonical)
}

/// Canonicalizes an HTTP header name to canonical case (`Foo-Bar`), the
/// same normalization `http::HeaderName` display uses.
pub fn canonical_header_case(key: &str) -> String {
    key.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str().to_ascii_lowercase().as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Canonicalizes header keys and rejects duplicates, case-insensitively
/// (spec §4.1.1 step 7, §6, §8 invariant).
pub fn validate_header_rules(rules: &[HeaderRule]) -> Result<Vec<HeaderRule>> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(rules.len());
    for rule in rules {
        let canonical_key = canonical_header_case(&rule.key);
        let lower = canonical_key.to_ascii_lowercase();
        if !seen.insert(lower) {
            return Err(Error::validation(
                ValidationKind::DuplicateHeaderRule,
                format!("duplicate header rule for {canonical_key:?}"),
            ));
        }
        out.push(HeaderRule {
            key: canonical_key,
            value: rule.value.clone(),
            action: rule.action,
        });
    }
    Ok(out)
}

const PATH_REDIRECT_MAX_LEN: usize = 512;

/// Normalizes a `from`/`to` path the same way at validation time and at
/// runtime lookup time (spec §4.1.1 step 8, §6): strip scheme/host, drop a
/// leading `/proxy/{group}/` prefix, ensure a leading `/`.
pub fn normalize_redirect_path(group_name: &str, raw: &str) -> String {
    let without_scheme = raw
        .split("://")
        .last()
        .unwrap_or(raw);
    // Drop a leading "host" component if one is present (only applies when
    // a scheme was stripped above, i.e. the input was a full URL).
    let without_host = if raw.contains("://") {
        without_scheme.splitn(2, '/').nth(1).unwrap_or("")
    } else {
        without_scheme
    };
    let prefix = format!("/proxy/{group_name}/");
    let stripped = without_host
        .strip_prefix(prefix.trim_start_matches('/'))
        .or_else(|| without_host.strip_prefix(&prefix))
        .unwrap_or(without_host);
    if stripped.starts_with('/') {
        stripped.to_string()
    } else {
        format!("/{stripped}")
    }
}

/// Trims, drops empty pairs, caps each side at 512 chars, and dedups by
/// normalized `from` (spec §4.1.1 step 8).
pub fn validate_path_redirects(
    group_name: &str,
    redirects: &[PathRedirect],
) -> Result<Vec<PathRedirect>> {
    let mut seen_from = HashSet::new();
    let mut out = Vec::new();
    for r in redirects {
        let from = r.from.trim();
        let to = r.to.trim();
        if from.is_empty() || to.is_empty() {
            continue;
        }
        if from.len() > PATH_REDIRECT_MAX_LEN || to.len() > PATH_REDIRECT_MAX_LEN {
            return Err(Error::validation(
                ValidationKind::InvalidUpstreams,
                "path_redirect entries must be <= 512 characters",
            ));
        }
        let normalized_from = normalize_redirect_path(group_name, from);
        if !seen_from.insert(normalized_from.clone()) {
            continue;
        }
        out.push(PathRedirect {
            from: normalized_from,
            to: to.to_string(),
        });
    }
    Ok(out)
}

/// Merges a legacy flat V1 `source -> target` map into the V2 map,
/// with V2 winning on key collision (spec §4.1.1 step 10, §8 round-trip
/// property).
pub fn merge_model_redirect_v1_into_v2(
    v1: &HashMap<String, String>,
    v2: &HashMap<String, ModelRedirectRuleV2>,
) -> HashMap<String, ModelRedirectRuleV2> {
    let mut merged = v2.clone();
    for (source, target) in v1 {
        merged.entry(source.clone()).or_insert_with(|| ModelRedirectRuleV2 {
            targets: vec![target.clone()],
            strategy: crate::model::RedirectStrategy::First,
        });
    }
    merged
}

/// Rejects any model-redirect rules on an aggregate group (spec §4.1.1
/// step 4, §8 scenario 2).
pub fn validate_aggregate_has_no_redirects(
    rules: &HashMap<String, ModelRedirectRuleV2>,
) -> Result<()> {
    if rules.is_empty() {
        Ok(())
    } else {
        Err(Error::validation(
            ValidationKind::AggregateNoModelRedirect,
            "aggregate groups cannot have model_redirect_rules",
        ))
    }
}

/// Default canonical header-rule action used when constructing a rule
/// programmatically (tests, migrations).
pub fn default_header_action() -> HeaderAction {
    HeaderAction::Set
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_name_boundaries() {
        assert!(is_valid_group_name(&"a".repeat(100)));
        assert!(!is_valid_group_name(&"a".repeat(101)));
        assert!(is_valid_group_name("my-group_1"));
        assert!(!is_valid_group_name("Bad Name"));
    }

    #[test]
    fn upstream_weight_zero_alone_rejected_pair_accepted() {
        let zero_only = serde_json::json!([{"url": "https://a", "weight": 0}]);
        assert!(validate_upstreams(&zero_only).is_err());

        let pair = serde_json::json!([
            {"url": "https://a", "weight": 0},
            {"url": "https://b", "weight": 1}
        ]);
        assert!(validate_upstreams(&pair).is_ok());
    }

    #[test]
    fn max_tokens_integer_boundary() {
        let mut overrides = HashMap::new();
        overrides.insert("max_tokens".to_string(), serde_json::json!(3.0));
        assert!(validate_param_overrides(&overrides).is_ok());

        overrides.insert("max_tokens".to_string(), serde_json::json!(3.1));
        assert!(validate_param_overrides(&overrides).is_err());
    }

    #[test]
    fn config_rejects_wrong_value_type() {
        let mut config = HashMap::new();
        config.insert("connect_timeout".to_string(), serde_json::json!("10"));
        assert!(validate_config(&config).is_err());

        config.insert("connect_timeout".to_string(), serde_json::json!(10));
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn cc_support_accepts_truthy_forms_beyond_bool() {
        for value in [
            serde_json::json!(true),
            serde_json::json!("yes"),
            serde_json::json!(1),
        ] {
            let mut config = HashMap::new();
            config.insert("cc_support".to_string(), value);
            assert!(validate_config(&config).is_ok());
        }

        let mut config = HashMap::new();
        config.insert("cc_support".to_string(), serde_json::json!(["nope"]));
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn duplicate_header_rules_case_insensitive() {
        let rules = vec![
            HeaderRule {
                key: "x-api-key".into(),
                value: "a".into(),
                action: HeaderAction::Set,
            },
            HeaderRule {
                key: "X-Api-Key".into(),
                value: "b".into(),
                action: HeaderAction::Set,
            },
        ];
        assert!(validate_header_rules(&rules).is_err());
    }

    #[test]
    fn header_rules_canonicalized_to_http_case() {
        let rules = vec![HeaderRule {
            key: "x-api-key".into(),
            value: "a".into(),
            action: HeaderAction::Set,
        }];
        let out = validate_header_rules(&rules).unwrap();
        assert_eq!(out[0].key, "X-Api-Key");
    }

    #[test]
    fn v2_wins_over_v1_on_collision() {
        let mut v1 = HashMap::new();
        v1.insert("gpt-4".to_string(), "gpt-4-legacy".to_string());
        let mut v2 = HashMap::new();
        v2.insert(
            "gpt-4".to_string(),
            ModelRedirectRuleV2 {
                targets: vec!["gpt-4-turbo".to_string()],
                strategy: crate::model::RedirectStrategy::First,
            },
        );
        let merged = merge_model_redirect_v1_into_v2(&v1, &v2);
        assert_eq!(merged["gpt-4"].targets, vec!["gpt-4-turbo".to_string()]);
    }

    #[test]
    fn path_redirect_dedup_by_normalized_from() {
        let redirects = vec![
            PathRedirect {
                from: "/proxy/mygroup/v1/chat".into(),
                to: "/v1/chat/completions".into(),
            },
            PathRedirect {
                from: "/v1/chat".into(),
                to: "/other".into(),
            },
        ];
        let out = validate_path_redirects("mygroup", &redirects).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].from, "/v1/chat");
    }
}
