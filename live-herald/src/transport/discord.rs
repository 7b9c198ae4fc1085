//! Discord REST client.
//!
//! Implements [`MessageTransport`], [`DestinationDirectory`] and
//! [`RoleDirectory`] on top of the v10 HTTP API with a bot token.
//!
//! Rate limit handling follows Discord's recommendations:
//! - No hardcoded rate limits
//! - Retries on 429 responses respecting the Retry-After header

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{
    Announcement, AnnouncementPhase, DestinationDirectory, DiscoveryError, FetchedMessage,
    MessageTransport, RoleDirectory, TransportError,
};
use crate::domain::{Destination, DestinationQuery, MessageRef};
use crate::utils::http_client::build_client;

/// Maximum number of attempts for rate-limited requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Channel type of a guild text channel.
const GUILD_TEXT_CHANNEL: u8 = 0;

const COLOR_LIVE: u32 = 0x9146ff;
const COLOR_ENDED: u32 = 0x808080;

// JSON error codes returned by the API.
const UNKNOWN_CHANNEL: u64 = 10003;
const UNKNOWN_MESSAGE: u64 = 10008;
const MISSING_ACCESS: u64 = 50001;
const MISSING_PERMISSIONS: u64 = 50013;

/// Discord connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    /// Bot token, without the `Bot ` prefix.
    pub bot_token: String,
    /// Name of the text channel to announce in, in every guild.
    pub announce_channel: String,
    /// Restrict announcements to these guilds. Empty means every joined guild.
    pub guild_ids: Vec<String>,
    pub api_base_url: String,
    /// HTTP request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            announce_channel: "live".to_string(),
            guild_ids: Vec::new(),
            api_base_url: "https://discord.com/api/v10".to_string(),
            request_timeout_secs: 15,
        }
    }
}

impl DiscordConfig {
    /// Discovery query derived from the configured channel and guild filter.
    pub fn destination_query(&self) -> DestinationQuery {
        DestinationQuery {
            channel_name: self.announce_channel.clone(),
            group_ids: (!self.guild_ids.is_empty())
                .then(|| self.guild_ids.iter().cloned().collect()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GuildSummary {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ChannelSummary {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type")]
    kind: u8,
}

#[derive(Debug, Deserialize)]
struct RoleSummary {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    id: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: Option<u64>,
    message: Option<String>,
}

/// Discord bot client.
pub struct DiscordClient {
    config: DiscordConfig,
    client: Client,
    ready: AtomicBool,
}

impl DiscordClient {
    pub fn new(config: DiscordConfig) -> Self {
        let client = build_client(Duration::from_secs(config.request_timeout_secs));
        Self {
            config,
            client,
            ready: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &DiscordConfig {
        &self.config
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Verify the bot token. Discovery reports `NotReady` until this succeeds.
    pub async fn connect(&self) -> Result<(), TransportError> {
        #[derive(Deserialize)]
        struct CurrentUser {
            id: String,
            username: String,
        }

        let response = self.request(Method::GET, "/users/@me", None).await?;
        let user: CurrentUser = decode(response).await?;
        info!(user_id = %user.id, "Connected to Discord as {}", user.username);
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base_url.trim_end_matches('/'), path)
    }

    /// Send one API request, retrying on 429.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, TransportError> {
        let mut attempts = 0;

        loop {
            attempts += 1;

            let mut builder = self
                .client
                .request(method.clone(), self.url(path))
                .header("Authorization", format!("Bot {}", self.config.bot_token));
            if let Some(body) = body {
                builder = builder.json(body);
            }

            let response = builder.send().await.map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::other(format!("Discord request failed: {e}"))
                }
            })?;

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = parse_retry_after(&response);

                if attempts >= MAX_RATE_LIMIT_RETRIES {
                    warn!(
                        "Discord rate limit: max retries ({}) exceeded, last retry_after was {:?}",
                        MAX_RATE_LIMIT_RETRIES, retry_after
                    );
                    return Err(TransportError::RateLimited);
                }

                let wait_duration = retry_after.unwrap_or(Duration::from_secs(1));
                debug!(
                    "Discord rate limited (429), waiting {:?} before retry (attempt {}/{})",
                    wait_duration, attempts, MAX_RATE_LIMIT_RETRIES
                );
                tokio::time::sleep(wait_duration).await;
                continue;
            }

            if status == StatusCode::UNAUTHORIZED {
                self.ready.store(false, Ordering::Release);
            }

            let text = response.text().await.unwrap_or_default();
            let parsed: Option<ApiErrorBody> = serde_json::from_str(&text).ok();
            let code = parsed.as_ref().and_then(|b| b.code);
            let message = parsed
                .and_then(|b| b.message)
                .unwrap_or_else(|| text.clone());

            debug!(%status, ?code, path, "Discord request failed: {}", message);
            return Err(classify_error(status, code, &message));
        }
    }

    async fn list_guilds(&self) -> Result<Vec<GuildSummary>, TransportError> {
        let response = self
            .request(Method::GET, "/users/@me/guilds", None)
            .await?;
        decode(response).await
    }

    async fn find_announce_channel(
        &self,
        guild: &GuildSummary,
        channel_name: &str,
    ) -> Result<Option<ChannelSummary>, TransportError> {
        let response = self
            .request(Method::GET, &format!("/guilds/{}/channels", guild.id), None)
            .await?;
        let channels: Vec<ChannelSummary> = decode(response).await?;

        Ok(channels.into_iter().find(|c| {
            c.kind == GUILD_TEXT_CHANNEL && c.name.as_deref() == Some(channel_name)
        }))
    }
}

/// Map a failed response to a transport error.
fn classify_error(status: StatusCode, code: Option<u64>, message: &str) -> TransportError {
    match code {
        Some(UNKNOWN_MESSAGE) => return TransportError::NotFound,
        Some(MISSING_PERMISSIONS | MISSING_ACCESS | UNKNOWN_CHANNEL) => {
            return TransportError::PermissionDenied(message.to_string());
        }
        _ => {}
    }

    match status {
        StatusCode::FORBIDDEN => TransportError::PermissionDenied(message.to_string()),
        StatusCode::NOT_FOUND => TransportError::NotFound,
        StatusCode::TOO_MANY_REQUESTS => TransportError::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => TransportError::Timeout,
        _ => TransportError::other(format!("Discord API error {status}: {message}")),
    }
}

/// Parse the Retry-After duration from a 429 response.
fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    for header in ["Retry-After", "X-RateLimit-Reset-After"] {
        if let Some(value) = response.headers().get(header)
            && let Some(secs) = value.to_str().ok().and_then(|v| v.parse::<f64>().ok())
            && secs.is_finite()
            && secs >= 0.0
        {
            return Some(Duration::from_secs_f64(secs));
        }
    }
    None
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, TransportError> {
    response
        .json()
        .await
        .map_err(|e| TransportError::other(format!("invalid Discord response: {e}")))
}

/// Human-readable uptime with the two largest units, e.g. `1 hour, 30 minutes`.
fn format_uptime(uptime: chrono::Duration) -> String {
    let total_minutes = (uptime.num_seconds() + 30).max(0) / 60;
    let days = total_minutes / (24 * 60);
    let hours = (total_minutes / 60) % 24;
    let minutes = total_minutes % 60;

    let parts: Vec<String> = [(days, "day"), (hours, "hour"), (minutes, "minute")]
        .into_iter()
        .skip_while(|(n, _)| *n == 0)
        .take(2)
        .filter(|(n, _)| *n > 0)
        .map(|(n, unit)| format!("{n} {unit}{}", if n == 1 { "" } else { "s" }))
        .collect();

    if parts.is_empty() {
        "0 minutes".to_string()
    } else {
        parts.join(", ")
    }
}

/// Build the message payload (content plus one embed) for an announcement.
fn build_payload(announcement: &Announcement) -> Value {
    let stream = &announcement.stream;
    let is_live = announcement.phase == AnnouncementPhase::Live;

    let mut fields = Vec::new();
    let mut embed = if is_live {
        fields.push(json!({"name": "Title", "value": stream.title, "inline": false}));
        json!({
            "title": format!(":red_circle: **{} is live on Twitch!**", stream.display_name),
            "color": COLOR_LIVE,
        })
    } else {
        fields.push(json!({"name": "Title", "value": stream.title, "inline": true}));
        json!({
            "title": format!(":white_circle: {} was live on Twitch.", stream.display_name),
            "description": "The stream has now ended.",
            "color": COLOR_ENDED,
        })
    };
    embed["url"] = json!(stream.channel_url());

    if let Some(game) = &stream.game_name {
        fields.push(json!({"name": "Game", "value": game, "inline": false}));
    }

    if is_live {
        fields.push(json!({
            "name": "Status",
            "value": format!("Live with {} viewers", stream.viewer_count),
            "inline": true,
        }));
        if let Some(uptime) = stream.uptime() {
            fields.push(json!({"name": "Uptime", "value": format_uptime(uptime), "inline": true}));
        }
        if let Some(thumbnail) = &stream.thumbnail_ref {
            // Cache-bust so clients reload the preview on every edit.
            let image = format!(
                "{}?t={}",
                thumbnail
                    .replace("{width}", "1280")
                    .replace("{height}", "720"),
                stream.observed_at.timestamp()
            );
            embed["image"] = json!({"url": image});
        }
    }
    embed["fields"] = Value::Array(fields);

    json!({
        "content": announcement.content(),
        "embeds": [embed],
        "allowed_mentions": {"parse": ["everyone", "roles"]},
    })
}

#[async_trait]
impl MessageTransport for DiscordClient {
    async fn send(
        &self,
        destination: &Destination,
        announcement: &Announcement,
    ) -> Result<MessageRef, TransportError> {
        let payload = build_payload(announcement);
        let response = self
            .request(
                Method::POST,
                &format!("/channels/{}/messages", destination.destination_id),
                Some(&payload),
            )
            .await?;
        let message: MessageResponse = decode(response).await?;

        debug!(
            channel = %destination.destination_id,
            message_id = %message.id,
            "Sent announcement to {}",
            destination.display_name
        );
        Ok(MessageRef::new(message.id))
    }

    async fn edit(
        &self,
        destination: &Destination,
        message_ref: &MessageRef,
        announcement: &Announcement,
    ) -> Result<(), TransportError> {
        let payload = build_payload(announcement);
        self.request(
            Method::PATCH,
            &format!(
                "/channels/{}/messages/{}",
                destination.destination_id, message_ref
            ),
            Some(&payload),
        )
        .await?;
        Ok(())
    }

    async fn fetch(
        &self,
        destination: &Destination,
        message_ref: &MessageRef,
    ) -> Result<FetchedMessage, TransportError> {
        let response = self
            .request(
                Method::GET,
                &format!(
                    "/channels/{}/messages/{}",
                    destination.destination_id, message_ref
                ),
                None,
            )
            .await?;
        let message: MessageResponse = decode(response).await?;
        Ok(FetchedMessage {
            message_ref: MessageRef::new(message.id),
            content: message.content,
        })
    }
}

#[async_trait]
impl DestinationDirectory for DiscordClient {
    async fn list_destinations(
        &self,
        query: &DestinationQuery,
    ) -> Result<Vec<Destination>, DiscoveryError> {
        if !self.is_ready() && self.connect().await.is_err() {
            return Err(DiscoveryError::NotReady);
        }

        let guilds = self.list_guilds().await.map_err(|e| match e {
            TransportError::PermissionDenied(_) => DiscoveryError::NotReady,
            other => DiscoveryError::Other(other.to_string()),
        })?;

        let mut destinations = Vec::new();
        for guild in guilds.iter().filter(|g| query.includes_group(&g.id)) {
            match self.find_announce_channel(guild, &query.channel_name).await {
                Ok(Some(channel)) => destinations.push(Destination {
                    group_id: guild.id.clone(),
                    destination_id: channel.id,
                    display_name: format!("#{} on {}", query.channel_name, guild.name),
                    // Posting permission is verified by the send itself.
                    can_post: true,
                }),
                Ok(None) => {
                    debug!(
                        guild = %guild.id,
                        "Guild {} has no #{} channel", guild.name, query.channel_name
                    );
                }
                Err(e) => {
                    warn!(guild = %guild.id, error = %e, "Failed to list channels of {}", guild.name);
                }
            }
        }

        debug!(
            count = destinations.len(),
            "Discovered announce channels for #{}", query.channel_name
        );
        Ok(destinations)
    }
}

#[async_trait]
impl RoleDirectory for DiscordClient {
    async fn find_role(
        &self,
        group_id: &str,
        role_name: &str,
    ) -> Result<Option<String>, TransportError> {
        let response = self
            .request(Method::GET, &format!("/guilds/{group_id}/roles"), None)
            .await?;
        let roles: Vec<RoleSummary> = decode(response).await?;

        Ok(roles
            .into_iter()
            .find(|r| r.name.eq_ignore_ascii_case(role_name))
            .map(|r| r.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StreamEvent;
    use chrono::Utc;

    fn stream() -> StreamEvent {
        let now = Utc::now();
        StreamEvent {
            streamer_id: "nova".to_string(),
            display_name: "Nova".to_string(),
            is_live: true,
            title: "Ranked queue".to_string(),
            game_name: Some("Valorant".to_string()),
            viewer_count: 120,
            thumbnail_ref: Some(
                "https://cdn.example/preview-nova-{width}x{height}.jpg".to_string(),
            ),
            started_at: Some(now - chrono::Duration::minutes(90)),
            observed_at: now,
        }
    }

    #[test]
    fn test_config_default_and_query() {
        let config = DiscordConfig::default();
        assert_eq!(config.announce_channel, "live");
        assert!(config.destination_query().group_ids.is_none());

        let config = DiscordConfig {
            guild_ids: vec!["G1".to_string()],
            ..Default::default()
        };
        let query = config.destination_query();
        assert!(query.includes_group("G1"));
        assert!(!query.includes_group("G2"));
    }

    #[test]
    fn test_classify_error() {
        assert_eq!(
            classify_error(StatusCode::NOT_FOUND, Some(UNKNOWN_MESSAGE), "Unknown Message"),
            TransportError::NotFound
        );
        assert_eq!(
            classify_error(StatusCode::NOT_FOUND, None, ""),
            TransportError::NotFound
        );
        assert!(matches!(
            classify_error(StatusCode::FORBIDDEN, Some(MISSING_PERMISSIONS), "Missing Permissions"),
            TransportError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_error(StatusCode::NOT_FOUND, Some(UNKNOWN_CHANNEL), "Unknown Channel"),
            TransportError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_error(StatusCode::FORBIDDEN, None, "nope"),
            TransportError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_error(StatusCode::INTERNAL_SERVER_ERROR, None, "boom"),
            TransportError::Other(_)
        ));
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(chrono::Duration::minutes(90)), "1 hour, 30 minutes");
        assert_eq!(format_uptime(chrono::Duration::minutes(1)), "1 minute");
        assert_eq!(format_uptime(chrono::Duration::seconds(10)), "0 minutes");
        assert_eq!(format_uptime(chrono::Duration::hours(49)), "2 days, 1 hour");
        assert_eq!(format_uptime(chrono::Duration::hours(24)), "1 day");
    }

    #[test]
    fn test_build_live_payload() {
        let stream = stream();
        let announcement = Announcement::live(&stream, Some("@here".to_string()));
        let payload = build_payload(&announcement);

        assert_eq!(payload["content"], "Nova went live on Twitch! @here");
        let embed = &payload["embeds"][0];
        assert_eq!(embed["color"], COLOR_LIVE);
        assert_eq!(embed["url"], "https://twitch.tv/nova");
        assert!(embed["title"].as_str().unwrap().contains("is live"));

        let fields = embed["fields"].as_array().unwrap();
        let names: Vec<_> = fields.iter().map(|f| f["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["Title", "Game", "Status", "Uptime"]);
        assert_eq!(fields[2]["value"], "Live with 120 viewers");
        assert_eq!(fields[3]["value"], "1 hour, 30 minutes");

        let image = embed["image"]["url"].as_str().unwrap();
        assert!(image.starts_with("https://cdn.example/preview-nova-1280x720.jpg?t="));
    }

    #[test]
    fn test_build_ended_payload() {
        let stream = stream().to_offline(Utc::now());
        let payload = build_payload(&Announcement::ended(&stream));

        assert_eq!(payload["content"], "Nova was live on Twitch.");
        let embed = &payload["embeds"][0];
        assert_eq!(embed["color"], COLOR_ENDED);
        assert_eq!(embed["description"], "The stream has now ended.");
        assert!(embed.get("image").is_none());

        let names: Vec<_> = embed["fields"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["Title", "Game"]);
    }

    #[tokio::test]
    async fn test_discovery_not_ready_without_connection() {
        let client = DiscordClient::new(DiscordConfig {
            bot_token: "invalid".to_string(),
            api_base_url: "http://127.0.0.1:9".to_string(),
            request_timeout_secs: 2,
            ..Default::default()
        });

        let result = client
            .list_destinations(&DestinationQuery::for_channel("live"))
            .await;
        assert_eq!(result, Err(DiscoveryError::NotReady));
        assert!(!client.is_ready());
    }
}
