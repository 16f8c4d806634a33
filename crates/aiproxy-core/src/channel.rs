//! Channel Registry (spec §2 item 4): a set of named upstream adapters.
//!
//! Per-provider request rewriting is explicitly out of scope (spec §1):
//! this module only models the *shape* of the collaborator the Group
//! Service calls into for upstream selection, request signing, and the
//! admin model-list fetch (§4.1.6). `StaticChannelRegistry` recognizes
//! exactly the four channels spec §6 requires meaningful behavior for
//! (`openai`, `codex`, `gemini`, `anthropic`) plus a catch-all `generic`
//! channel, with no real wire-format knowledge of any provider.

use crate::error::{Error, Result};
use crate::model::{HeaderRule, Upstream};
use std::collections::HashMap;
use std::time::Duration;

/// An upstream chosen for one outbound call, along with the HTTP client
/// that should be used to make it (spec §4.1.6: "use the upstream-specific
/// HTTP client (fall back to channel-level then a 30s default)").
#[derive(Debug, Clone)]
pub struct SelectedUpstream {
    pub url: String,
    pub proxy_url: Option<String>,
    pub client_timeout: Duration,
}

/// A request about to be sent upstream; `ModifyRequest` mutates headers
/// and/or the URL in place to apply channel-specific authentication.
#[derive(Debug, Clone, Default)]
pub struct OutboundRequest {
    pub url: String,
    pub headers: HashMap<String, String>,
}

/// Per-provider upstream adapter capability (spec §2 item 4, §4.1.6).
///
/// Implementations are external collaborators per spec §1's scope note;
/// this core only depends on the trait.
pub trait ChannelRegistry: Send + Sync {
    /// Channel identifiers this registry recognizes.
    fn channel_types(&self) -> &[&'static str];

    /// Picks one upstream (by weighted rotation) plus its client config,
    /// consistently applying the group's `path_redirects` (spec §4.1.6:
    /// "delegate to the Channel Registry's `SelectUpstreamWithClients` so
    /// per-upstream proxy and path-redirects apply consistently").
    fn select_upstream_with_clients(
        &self,
        channel: &str,
        upstreams: &[Upstream],
        path: &str,
    ) -> Result<SelectedUpstream>;

    /// Applies channel-specific auth (e.g. bearer header, query param) to
    /// an outbound request in place, using the given plaintext key.
    fn modify_request(&self, channel: &str, req: &mut OutboundRequest, api_key: &str) -> Result<()>;

    /// The admin "list models" path for this channel (spec §4.1.6: `openai`
    /// and `anthropic` use `/v1/models`, `gemini` uses `/v1beta/models`,
    /// anything else falls back to `/v1/models`).
    fn models_path(&self, channel: &str) -> &'static str {
        match channel {
            "gemini" => "/v1beta/models",
            _ => "/v1/models",
        }
    }

    /// Whether this administrative fetch should set a codex/anthropic user
    /// agent override (spec §4.1.6: "only for this administrative fetch").
    fn wants_admin_user_agent_override(&self, channel: &str) -> bool {
        matches!(channel, "codex" | "anthropic")
    }
}

/// Default registry recognizing the four channels spec §6 names plus a
/// `generic` catch-all.
pub struct StaticChannelRegistry {
    channels: Vec<&'static str>,
}

impl Default for StaticChannelRegistry {
    fn default() -> Self {
        Self {
            channels: vec!["openai", "codex", "gemini", "anthropic", "generic"],
        }
    }
}

impl StaticChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChannelRegistry for StaticChannelRegistry {
    fn channel_types(&self) -> &[&'static str] {
        &self.channels
    }

    fn select_upstream_with_clients(
        &self,
        _channel: &str,
        upstreams: &[Upstream],
        path: &str,
    ) -> Result<SelectedUpstream> {
        let total_weight: u64 = upstreams.iter().map(|u| u.weight as u64).sum();
        if total_weight == 0 {
            return Err(Error::generic("group has no upstream with positive weight"));
        }
        // Deterministic weighted pick favoring the first upstream that
        // crosses a running-total threshold; callers needing randomized
        // rotation should shuffle `upstreams` before calling.
        let mut running = 0u64;
        let pick = upstreams
            .iter()
            .find(|u| {
                running += u.weight as u64;
                u.weight > 0 && running >= total_weight / 2 + 1
            })
            .or_else(|| upstreams.iter().find(|u| u.weight > 0))
            .ok_or_else(|| Error::generic("no upstream with positive weight"))?;

        let url = format!("{}{}", pick.url.trim_end_matches('/'), path);
        Ok(SelectedUpstream {
            url,
            proxy_url: pick.proxy_url.clone(),
            client_timeout: Duration::from_secs(30),
        })
    }

    fn modify_request(&self, channel: &str, req: &mut OutboundRequest, api_key: &str) -> Result<()> {
        match channel {
            "anthropic" => {
                req.headers.insert("x-api-key".to_string(), api_key.to_string());
                req.headers
                    .insert("anthropic-version".to_string(), "2023-06-01".to_string());
            }
            "gemini" => {
                let sep = if req.url.contains('?') { '&' } else { '?' };
                req.url = format!("{}{}key={}", req.url, sep, api_key);
            }
            _ => {
                req.headers
                    .insert("Authorization".to_string(), format!("Bearer {api_key}"));
            }
        }
        Ok(())
    }
}

/// Applies a group's `header_rules` to an outbound request (spec §4.1.6:
/// "apply the group's header rules").
pub fn apply_header_rules(req: &mut OutboundRequest, rules: &[HeaderRule]) {
    use crate::model::HeaderAction;
    for rule in rules {
        match rule.action {
            HeaderAction::Remove => {
                req.headers.remove(&rule.key);
            }
            HeaderAction::Set => {
                req.headers.insert(rule.key.clone(), rule.value.clone());
            }
            HeaderAction::Append => {
                req.headers
                    .entry(rule.key.clone())
                    .and_modify(|v| {
                        v.push_str(", ");
                        v.push_str(&rule.value);
                    })
                    .or_insert_with(|| rule.value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HeaderAction;

    fn upstream(url: &str, weight: u32) -> Upstream {
        Upstream {
            url: url.to_string(),
            weight,
            proxy_url: None,
        }
    }

    #[test]
    fn selects_only_positive_weight_upstream() {
        let registry = StaticChannelRegistry::new();
        let upstreams = vec![upstream("https://a.example", 0), upstream("https://b.example", 1)];
        let selected = registry
            .select_upstream_with_clients("openai", &upstreams, "/v1/models")
            .unwrap();
        assert_eq!(selected.url, "https://b.example/v1/models");
    }

    #[test]
    fn rejects_all_zero_weight() {
        let registry = StaticChannelRegistry::new();
        let upstreams = vec![upstream("https://a.example", 0)];
        assert!(registry
            .select_upstream_with_clients("openai", &upstreams, "/v1/models")
            .is_err());
    }

    #[test]
    fn models_path_by_channel() {
        let registry = StaticChannelRegistry::new();
        assert_eq!(registry.models_path("gemini"), "/v1beta/models");
        assert_eq!(registry.models_path("openai"), "/v1/models");
        assert_eq!(registry.models_path("anthropic"), "/v1/models");
        assert_eq!(registry.models_path("unknown"), "/v1/models");
    }

    #[test]
    fn header_rules_set_append_remove() {
        let mut req = OutboundRequest::default();
        req.headers.insert("X-Foo".into(), "a".into());
        let rules = vec![
            HeaderRule {
                key: "X-Foo".into(),
                value: "b".into(),
                action: HeaderAction::Append,
            },
            HeaderRule {
                key: "X-Bar".into(),
                value: "c".into(),
                action: HeaderAction::Set,
            },
        ];
        apply_header_rules(&mut req, &rules);
        assert_eq!(req.headers.get("X-Foo").unwrap(), "a, b");
        assert_eq!(req.headers.get("X-Bar").unwrap(), "c");

        let remove = vec![HeaderRule {
            key: "X-Bar".into(),
            value: String::new(),
            action: HeaderAction::Remove,
        }];
        apply_header_rules(&mut req, &remove);
        assert!(!req.headers.contains_key("X-Bar"));
    }
}
