//! Mention text for new announcements.
//!
//! Configuration maps a streamer to a default mention and per-group overrides.
//! Values are a broadcast token (`everyone`/`here`, optionally `@`-prefixed),
//! the literal `none` for explicit suppression, or a role name resolved
//! through the group's [`RoleDirectory`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::Destination;
use crate::transport::RoleDirectory;

/// Mention settings for one streamer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawMentionRule")]
pub struct MentionRule {
    pub default: Option<String>,
    /// Overrides keyed by group id.
    pub server_specific: HashMap<String, String>,
}

/// Accepted shapes: a bare string (streamer-wide default) or the full object.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawMentionRule {
    Plain(String),
    Detailed {
        #[serde(default)]
        default: Option<String>,
        #[serde(default, alias = "serverSpecific")]
        server_specific: HashMap<String, String>,
    },
}

impl From<RawMentionRule> for MentionRule {
    fn from(raw: RawMentionRule) -> Self {
        match raw {
            RawMentionRule::Plain(default) => Self {
                default: Some(default),
                server_specific: HashMap::new(),
            },
            RawMentionRule::Detailed {
                default,
                server_specific,
            } => Self {
                default,
                server_specific,
            },
        }
    }
}

/// Streamer id to [`MentionRule`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MentionConfig {
    rules: HashMap<String, MentionRule>,
}

impl MentionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, streamer_id: impl Into<String>, rule: MentionRule) -> Self {
        self.rules.insert(streamer_id.into(), rule);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn rule_for(&self, streamer_id: &str) -> Option<&MentionRule> {
        self.rules.get(streamer_id).or_else(|| {
            self.rules
                .iter()
                .find(|(id, _)| id.eq_ignore_ascii_case(streamer_id))
                .map(|(_, rule)| rule)
        })
    }

    /// Configured value for a streamer in a group: override, then default.
    pub fn lookup(&self, streamer_id: &str, group_id: &str) -> Option<&str> {
        let rule = self.rule_for(streamer_id)?;
        rule.server_specific
            .get(group_id)
            .or(rule.default.as_ref())
            .map(String::as_str)
    }
}

/// Interpreted mention value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MentionTarget<'a> {
    Everyone,
    Here,
    Role(&'a str),
    Suppressed,
}

impl<'a> MentionTarget<'a> {
    pub fn parse(raw: &'a str) -> Self {
        let trimmed = raw.trim();
        let bare = trimmed.strip_prefix('@').unwrap_or(trimmed);

        if bare.eq_ignore_ascii_case("everyone") {
            Self::Everyone
        } else if bare.eq_ignore_ascii_case("here") {
            Self::Here
        } else if bare.is_empty() || bare.eq_ignore_ascii_case("none") {
            Self::Suppressed
        } else {
            Self::Role(bare)
        }
    }
}

/// Resolves the mention text attached to new notifications.
pub struct MentionResolver {
    roles: Arc<dyn RoleDirectory>,
    config: RwLock<Arc<MentionConfig>>,
}

impl MentionResolver {
    pub fn new(roles: Arc<dyn RoleDirectory>, config: MentionConfig) -> Self {
        Self {
            roles,
            config: RwLock::new(Arc::new(config)),
        }
    }

    /// Swap the configuration at runtime.
    pub fn set_config(&self, config: MentionConfig) {
        *self.config.write() = Arc::new(config);
    }

    pub fn config(&self) -> Arc<MentionConfig> {
        self.config.read().clone()
    }

    /// Mention for `streamer_id` at `destination` under the current configuration.
    pub async fn resolve(&self, streamer_id: &str, destination: &Destination) -> Option<String> {
        let config = self.config();
        self.resolve_with(streamer_id, destination, &config).await
    }

    /// Mention for `streamer_id` at `destination` under `config`.
    ///
    /// Lookup failures degrade to no mention.
    pub async fn resolve_with(
        &self,
        streamer_id: &str,
        destination: &Destination,
        config: &MentionConfig,
    ) -> Option<String> {
        let raw = config.lookup(streamer_id, &destination.group_id)?;

        let mention = match MentionTarget::parse(raw) {
            MentionTarget::Everyone => Some("@everyone".to_string()),
            MentionTarget::Here => Some("@here".to_string()),
            MentionTarget::Suppressed => None,
            MentionTarget::Role(name) => {
                match self.roles.find_role(&destination.group_id, name).await {
                    Ok(Some(role_id)) => Some(format!("<@&{role_id}>")),
                    Ok(None) => {
                        warn!(
                            streamer = %streamer_id,
                            group = %destination.group_id,
                            role = %name,
                            "Mention role not found, announcing without mention"
                        );
                        None
                    }
                    Err(e) => {
                        warn!(
                            streamer = %streamer_id,
                            group = %destination.group_id,
                            role = %name,
                            error = %e,
                            "Role lookup failed, announcing without mention"
                        );
                        None
                    }
                }
            }
        };

        if let Some(mention) = &mention {
            debug!(streamer = %streamer_id, %mention, "Resolved mention");
        }
        mention
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use async_trait::async_trait;

    struct StaticRoles;

    #[async_trait]
    impl RoleDirectory for StaticRoles {
        async fn find_role(
            &self,
            group_id: &str,
            role_name: &str,
        ) -> Result<Option<String>, TransportError> {
            match (group_id, role_name) {
                ("G1", "Live Alerts") => Ok(Some("555".to_string())),
                ("G3", _) => Err(TransportError::Timeout),
                _ => Ok(None),
            }
        }
    }

    fn destination(group: &str) -> Destination {
        Destination {
            group_id: group.to_string(),
            destination_id: "chan".to_string(),
            display_name: "#live".to_string(),
            can_post: true,
        }
    }

    fn resolver(config: MentionConfig) -> MentionResolver {
        MentionResolver::new(Arc::new(StaticRoles), config)
    }

    #[test]
    fn test_parse_target() {
        assert_eq!(MentionTarget::parse("everyone"), MentionTarget::Everyone);
        assert_eq!(MentionTarget::parse("@here"), MentionTarget::Here);
        assert_eq!(MentionTarget::parse("None"), MentionTarget::Suppressed);
        assert_eq!(MentionTarget::parse("@Mods"), MentionTarget::Role("Mods"));
    }

    #[test]
    fn test_config_shapes() {
        let raw = r#"{
            "Nova": "everyone",
            "orbit": {"default": "here", "serverSpecific": {"G2": "none"}}
        }"#;
        let config: MentionConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(config.lookup("nova", "G1"), Some("everyone"));
        assert_eq!(config.lookup("orbit", "G1"), Some("here"));
        assert_eq!(config.lookup("orbit", "G2"), Some("none"));
        assert_eq!(config.lookup("comet", "G1"), None);
    }

    #[tokio::test]
    async fn test_lookup_order() {
        let config = MentionConfig::new().with_rule(
            "nova",
            MentionRule {
                default: Some("@everyone".to_string()),
                server_specific: HashMap::from([
                    ("G1".to_string(), "Live Alerts".to_string()),
                    ("G2".to_string(), "none".to_string()),
                ]),
            },
        );
        let resolver = resolver(config);

        assert_eq!(
            resolver.resolve("NOVA", &destination("G1")).await,
            Some("<@&555>".to_string())
        );
        assert_eq!(resolver.resolve("nova", &destination("G2")).await, None);
        assert_eq!(
            resolver.resolve("nova", &destination("G9")).await,
            Some("@everyone".to_string())
        );
        assert_eq!(resolver.resolve("orbit", &destination("G1")).await, None);
    }

    #[tokio::test]
    async fn test_role_failures_degrade() {
        let config = MentionConfig::new().with_rule(
            "nova",
            MentionRule {
                default: Some("Subscribers".to_string()),
                server_specific: HashMap::new(),
            },
        );
        let resolver = resolver(config);

        assert_eq!(resolver.resolve("nova", &destination("G1")).await, None);
        assert_eq!(resolver.resolve("nova", &destination("G3")).await, None);
    }

    #[tokio::test]
    async fn test_set_config_replaces_rules() {
        let resolver = resolver(MentionConfig::new());
        assert_eq!(resolver.resolve("nova", &destination("G1")).await, None);

        resolver.set_config(MentionConfig::new().with_rule(
            "nova",
            MentionRule {
                default: Some("here".to_string()),
                server_specific: HashMap::new(),
            },
        ));
        assert_eq!(
            resolver.resolve("nova", &destination("G1")).await,
            Some("@here".to_string())
        );
    }
}
