//! Application configuration.
//!
//! Read from a JSON file, then overridden from the environment for secrets
//! and deployment settings.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::notifier::{MentionConfig, NotifierConfig};
use crate::transport::DiscordConfig;
use crate::monitor::TwitchConfig;
use crate::{Error, Result};

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub discord: DiscordConfig,
    pub twitch: TwitchConfig,
    pub notifier: NotifierConfig,
    /// Streamer id to mention rule.
    pub mentions: MentionConfig,
    pub database_url: String,
    pub log_dir: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            discord: DiscordConfig::default(),
            twitch: TwitchConfig::default(),
            notifier: NotifierConfig::default(),
            mentions: MentionConfig::default(),
            database_url: "sqlite:herald.db?mode=rwc".to_string(),
            log_dir: "logs".to_string(),
        }
    }
}

impl AppConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => {
                let config = serde_json::from_str(&raw).map_err(|e| {
                    Error::config(format!("invalid config file {}: {e}", path.display()))
                })?;
                info!(path = %path.display(), "Loaded configuration");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load from `HERALD_CONFIG` (or the default path), apply environment
    /// overrides and validate.
    pub async fn from_env() -> Result<Self> {
        let path =
            std::env::var("HERALD_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::load(path).await?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup. Blank values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(token) = var("DISCORD_BOT_TOKEN") {
            self.discord.bot_token = token;
        }
        if let Some(channel) = var("DISCORD_ANNOUNCE_CHANNEL") {
            self.discord.announce_channel = channel;
        }
        if let Some(client_id) = var("TWITCH_CLIENT_ID") {
            self.twitch.client_id = client_id;
        }
        if let Some(secret) = var("TWITCH_CLIENT_SECRET") {
            self.twitch.client_secret = secret;
        }
        if let Some(channels) = var("TWITCH_CHANNELS") {
            self.twitch.channels = channels
                .split(',')
                .map(|c| c.trim().to_lowercase())
                .filter(|c| !c.is_empty())
                .collect();
        }
        if let Some(url) = var("DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(dir) = var("LOG_DIR") {
            self.log_dir = dir;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.discord.bot_token.trim().is_empty() {
            return Err(Error::config("discord.bot_token is required"));
        }
        if self.discord.announce_channel.trim().is_empty() {
            return Err(Error::config("discord.announce_channel is required"));
        }
        if self.twitch.channels.is_empty() {
            return Err(Error::config("twitch.channels must list at least one channel"));
        }
        if self.twitch.client_id.trim().is_empty() || self.twitch.client_secret.trim().is_empty()
        {
            return Err(Error::config(
                "twitch.client_id and twitch.client_secret are required",
            ));
        }
        if self.twitch.poll_interval_secs == 0 {
            return Err(Error::config("twitch.poll_interval_secs must be greater than 0"));
        }
        if self.twitch.poll_interval_secs <= self.notifier.debounce_secs {
            return Err(Error::config(format!(
                "twitch.poll_interval_secs ({}) must be greater than notifier.debounce_secs ({})",
                self.twitch.poll_interval_secs, self.notifier.debounce_secs
            )));
        }
        self.notifier.validate()
    }
}
