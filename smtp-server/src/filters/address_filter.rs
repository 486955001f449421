use serde::Deserialize;
use tracing::{debug, error};

use super::glob::Pattern;

/// What to do with an address that matches neither list. Only the exact
/// values `allow` and `deny` are recognized.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum DefaultAction {
    Allow,
    Deny,
    /// Anything else found in configuration. Evaluates as deny.
    Unrecognized(String),
}

impl From<String> for DefaultAction {
    fn from(value: String) -> Self {
        match value.as_str() {
            "allow" => DefaultAction::Allow,
            "deny" => DefaultAction::Deny,
            _ => DefaultAction::Unrecognized(value),
        }
    }
}

/// Allow and deny glob lists for one address role.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyRuleSet {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    pub default_action: DefaultAction,
}

impl PolicyRuleSet {
    pub fn is_allowed(&self, address: &str) -> bool {
        is_address_allowed(address, &self.allow, &self.deny, &self.default_action)
    }
}

/// Sender (`from`) and recipient (`to`) rule sets.
#[derive(Debug, Clone, Deserialize)]
pub struct Policies {
    pub from: PolicyRuleSet,
    pub to: PolicyRuleSet,
}

/// Decides whether `address` passes the given lists. Any deny match rejects,
/// then any allow match accepts, otherwise `default_action` applies.
/// Malformed patterns never match.
pub fn is_address_allowed(
    address: &str,
    allow: &[String],
    deny: &[String],
    default_action: &DefaultAction,
) -> bool {
    debug!(%address, ?allow, ?deny, ?default_action, "checking address against policy");

    if let Some(pattern) = first_match(address, deny, "deny") {
        debug!(%address, %pattern, "address matched deny pattern, rejecting");
        return false;
    }

    if let Some(pattern) = first_match(address, allow, "allow") {
        debug!(%address, %pattern, "address matched allow pattern, accepting");
        return true;
    }

    match default_action {
        DefaultAction::Allow => {
            debug!(%address, "default action is allow, accepting");
            true
        }
        DefaultAction::Deny => {
            debug!(%address, "default action is deny, rejecting");
            false
        }
        DefaultAction::Unrecognized(action) => {
            debug!(%address, %action, "unrecognized default action, rejecting");
            false
        }
    }
}

fn first_match<'a>(address: &str, patterns: &'a [String], list: &str) -> Option<&'a str> {
    patterns
        .iter()
        .find(|pattern| match Pattern::new(pattern) {
            Ok(compiled) => compiled.matches(address),
            Err(e) => {
                error!(%pattern, list, error = %e, "invalid glob pattern, ignoring");
                false
            }
        })
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(allow: &[&str], deny: &[&str], default_action: &str) -> PolicyRuleSet {
        PolicyRuleSet {
            allow: allow.iter().map(|s| s.to_string()).collect(),
            deny: deny.iter().map(|s| s.to_string()).collect(),
            default_action: DefaultAction::from(default_action.to_string()),
        }
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let addresses = ["user@example.com", "USER@EXAMPLE.COM", "x@y.z"];
        for address in addresses {
            let set = rules(&[address, "*"], &[address], "allow");
            assert!(!set.is_allowed(address), "{address} should be denied");
        }

        let set = rules(&["*@example.com"], &["*@example.com"], "allow");
        assert!(!set.is_allowed("a@example.com"));
    }

    #[test]
    fn test_default_action() {
        let deny = rules(&["*@example.com"], &[], "deny");
        assert!(!deny.is_allowed("someone@other.org"));
        assert!(deny.is_allowed("someone@example.com"));

        let allow = rules(&[], &["*@spam.com"], "allow");
        assert!(allow.is_allowed("someone@other.org"));
        assert!(!allow.is_allowed("bot@spam.com"));
    }

    #[test]
    fn test_unrecognized_default_fails_closed() {
        for action in ["", "maybe", "accept", "Allow", " deny", "ALLOW"] {
            let set = rules(&["*@example.com"], &[], action);
            assert_eq!(
                set.default_action,
                DefaultAction::Unrecognized(action.to_string())
            );
            assert!(!set.is_allowed("someone@other.org"));
            assert!(set.is_allowed("someone@example.com"));
        }
    }

    #[test]
    fn test_allow_deny_scenario() {
        let set = rules(&["*@example.com"], &["bad@example.com"], "deny");
        assert!(set.is_allowed("good@example.com"));
        assert!(!set.is_allowed("bad@example.com"));
        assert!(!set.is_allowed("other@other.com"));
    }

    #[test]
    fn test_invalid_patterns_are_skipped() {
        let set = rules(&["[", "*@example.com"], &["[", "bad@example.com"], "deny");
        assert!(set.is_allowed("good@example.com"));
        assert!(!set.is_allowed("bad@example.com"));

        let set = rules(&[], &["["], "allow");
        assert!(set.is_allowed("someone@example.com"));

        let set = rules(&["["], &[], "deny");
        assert!(!set.is_allowed("someone@example.com"));
    }

    #[test]
    fn test_evaluation_is_idempotent() {
        let set = rules(&["*@example.com", "ops-?@corp.io"], &["root@*"], "deny");
        let addresses = [
            "a@example.com",
            "ops-1@corp.io",
            "root@example.com",
            "x@y.z",
        ];
        let first: Vec<bool> = addresses.iter().map(|a| set.is_allowed(a)).collect();
        for _ in 0..10 {
            let again: Vec<bool> = addresses.iter().map(|a| set.is_allowed(a)).collect();
            assert_eq!(first, again);
        }
        assert_eq!(first, vec![true, true, false, false]);
    }

    #[test]
    fn test_deserialize_rule_set() {
        #[derive(Deserialize)]
        struct Wrapper {
            policies: Policies,
        }

        let cfg = config::Config::builder()
            .add_source(config::File::from_str(
                r#"
[policies.from]
default_action = "allow"

[policies.to]
allow = ["*@example.com"]
deny = ["bad@example.com"]
default_action = "bogus"
"#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let wrapper: Wrapper = cfg.try_deserialize().unwrap();

        assert!(wrapper.policies.from.allow.is_empty());
        assert_eq!(wrapper.policies.from.default_action, DefaultAction::Allow);
        assert_eq!(wrapper.policies.to.deny, vec!["bad@example.com"]);
        assert_eq!(
            wrapper.policies.to.default_action,
            DefaultAction::Unrecognized("bogus".to_string())
        );
    }
}
