// ABOUTME: Send policy - ordered allow/deny rules evaluated before admission.
// ABOUTME: Matches on provider, chat type, and session key prefix; first match wins.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Allow,
    Deny,
}

/// One policy rule. Absent fields match anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub action: PolicyAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_prefix: Option<String>,
}

impl PolicyRule {
    fn matches(&self, route: &RouteInfo) -> bool {
        if let Some(ref provider) = self.provider {
            if route.provider.as_deref() != Some(provider.as_str()) {
                return false;
            }
        }
        if let Some(ref chat_type) = self.chat_type {
            if route.chat_type.as_deref() != Some(chat_type.as_str()) {
                return false;
            }
        }
        if let Some(ref prefix) = self.key_prefix {
            if !route.session_key.starts_with(prefix.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Route facts a send is matched against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    pub session_key: String,
    pub provider: Option<String>,
    pub chat_type: Option<String>,
}

impl RouteInfo {
    /// Derive route facts from a `provider:chat_type:rest` session key,
    /// falling back to the session's last recorded provider.
    pub fn derive(session_key: &str, last_provider: Option<&str>) -> Self {
        let mut parts = session_key.splitn(3, ':');
        let provider = parts.next().filter(|s| !s.is_empty());
        let chat_type = parts.next().filter(|s| !s.is_empty());
        // A key without all three segments carries no route information.
        let structured = parts.next().is_some();

        Self {
            session_key: session_key.to_string(),
            provider: if structured {
                provider.map(str::to_string)
            } else {
                last_provider.map(str::to_string)
            },
            chat_type: if structured {
                chat_type.map(str::to_string)
            } else {
                None
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    /// Denied; carries a human-readable description of the matching rule.
    Deny(String),
}

/// Ordered rule set; first matching rule wins, default allow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendPolicy {
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl SendPolicy {
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self { rules }
    }

    pub fn evaluate(&self, route: &RouteInfo) -> PolicyDecision {
        for rule in &self.rules {
            if rule.matches(route) {
                return match rule.action {
                    PolicyAction::Allow => PolicyDecision::Allow,
                    PolicyAction::Deny => PolicyDecision::Deny(format!(
                        "send blocked by policy (provider={}, chat_type={}, key_prefix={})",
                        rule.provider.as_deref().unwrap_or("*"),
                        rule.chat_type.as_deref().unwrap_or("*"),
                        rule.key_prefix.as_deref().unwrap_or("*"),
                    )),
                };
            }
        }
        PolicyDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deny_discord_group() -> SendPolicy {
        SendPolicy::new(vec![PolicyRule {
            action: PolicyAction::Deny,
            provider: Some("discord".to_string()),
            chat_type: Some("group".to_string()),
            key_prefix: None,
        }])
    }

    #[test]
    fn test_deny_rule_matches_structured_key() {
        let policy = deny_discord_group();
        let route = RouteInfo::derive("discord:group:general", None);
        assert!(matches!(policy.evaluate(&route), PolicyDecision::Deny(_)));
    }

    #[test]
    fn test_deny_rule_skips_other_chat_type() {
        let policy = deny_discord_group();
        let route = RouteInfo::derive("discord:dm:alice", None);
        assert_eq!(policy.evaluate(&route), PolicyDecision::Allow);
    }

    #[test]
    fn test_unstructured_key_uses_last_route() {
        let policy = SendPolicy::new(vec![PolicyRule {
            action: PolicyAction::Deny,
            provider: Some("telegram".to_string()),
            chat_type: None,
            key_prefix: None,
        }]);
        let route = RouteInfo::derive("mysession", Some("telegram"));
        assert!(matches!(policy.evaluate(&route), PolicyDecision::Deny(_)));
    }

    #[test]
    fn test_first_match_wins() {
        let policy = SendPolicy::new(vec![
            PolicyRule {
                action: PolicyAction::Allow,
                provider: None,
                chat_type: None,
                key_prefix: Some("discord:group:ops".to_string()),
            },
            PolicyRule {
                action: PolicyAction::Deny,
                provider: Some("discord".to_string()),
                chat_type: Some("group".to_string()),
                key_prefix: None,
            },
        ]);
        let allowed = RouteInfo::derive("discord:group:ops-room", None);
        assert_eq!(policy.evaluate(&allowed), PolicyDecision::Allow);

        let denied = RouteInfo::derive("discord:group:general", None);
        assert!(matches!(policy.evaluate(&denied), PolicyDecision::Deny(_)));
    }

    #[test]
    fn test_default_allow() {
        let policy = SendPolicy::default();
        let route = RouteInfo::derive("anything", None);
        assert_eq!(policy.evaluate(&route), PolicyDecision::Allow);
    }
}
