//! Twitch Helix poller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::StreamEventBroadcaster;
use crate::domain::StreamEvent;
use crate::utils::http_client::build_client;
use crate::{Error, Result};

/// Helix accepts at most this many `user_login` parameters per request.
const MAX_LOGINS_PER_REQUEST: usize = 100;

/// Twitch polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TwitchConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Channel logins to monitor.
    pub channels: Vec<String>,
    /// Must exceed the notifier's debounce window or live updates are dropped.
    pub poll_interval_secs: u64,
    pub api_base_url: String,
    pub token_url: String,
    pub request_timeout_secs: u64,
}

impl Default for TwitchConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            channels: Vec::new(),
            poll_interval_secs: 90,
            api_base_url: "https://api.twitch.tv/helix".to_string(),
            token_url: "https://id.twitch.tv/oauth2/token".to_string(),
            request_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct StreamsResponse {
    data: Vec<HelixStream>,
}

#[derive(Debug, Clone, Deserialize)]
struct HelixStream {
    user_login: String,
    user_name: String,
    #[serde(default)]
    game_name: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    viewer_count: u64,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    thumbnail_url: Option<String>,
    #[serde(rename = "type", default)]
    kind: String,
}

impl HelixStream {
    fn into_event(self, observed_at: DateTime<Utc>) -> StreamEvent {
        StreamEvent {
            streamer_id: self.user_login.to_lowercase(),
            display_name: self.user_name,
            is_live: true,
            title: self.title,
            game_name: (!self.game_name.is_empty()).then_some(self.game_name),
            viewer_count: self.viewer_count,
            thumbnail_ref: self.thumbnail_url.filter(|url| !url.is_empty()),
            started_at: self.started_at,
            observed_at,
        }
    }
}

/// Compare a fresh snapshot of live streams against the previous one.
///
/// Every currently live stream yields a live update; every stream that was
/// live before and is missing now yields an offline event carrying its last
/// known metadata.
pub fn diff_snapshot(
    previous: &HashMap<String, StreamEvent>,
    current: Vec<StreamEvent>,
    now: DateTime<Utc>,
) -> (Vec<StreamEvent>, HashMap<String, StreamEvent>) {
    let snapshot: HashMap<String, StreamEvent> = current
        .into_iter()
        .map(|event| (event.streamer_id.clone(), event))
        .collect();

    let mut events: Vec<StreamEvent> = previous
        .iter()
        .filter(|(id, _)| !snapshot.contains_key(*id))
        .map(|(_, last)| last.to_offline(now))
        .collect();
    events.extend(snapshot.values().cloned());
    events.sort_by(|a, b| {
        a.is_live
            .cmp(&b.is_live)
            .then_with(|| a.streamer_id.cmp(&b.streamer_id))
    });

    (events, snapshot)
}

/// Polls Helix for the configured channels and publishes stream events.
pub struct TwitchPoller {
    config: TwitchConfig,
    client: Client,
    token: Mutex<Option<String>>,
    live: Mutex<HashMap<String, StreamEvent>>,
    broadcaster: StreamEventBroadcaster,
}

impl TwitchPoller {
    pub fn new(config: TwitchConfig, broadcaster: StreamEventBroadcaster) -> Self {
        let client = build_client(Duration::from_secs(config.request_timeout_secs));
        Self {
            config,
            client,
            token: Mutex::new(None),
            live: Mutex::new(HashMap::new()),
            broadcaster,
        }
    }

    async fn fetch_token(&self) -> Result<String> {
        let response = self
            .client
            .post(&self.config.token_url)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .map_err(|e| Error::Other(format!("Twitch token request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Other(format!(
                "Twitch token request failed: {}",
                response.status()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Other(format!("invalid Twitch token response: {e}")))?;
        debug!("Obtained Twitch app access token");
        Ok(token.access_token)
    }

    async fn access_token(&self, refresh: bool) -> Result<String> {
        let mut token = self.token.lock().await;
        if !refresh && let Some(existing) = token.as_ref() {
            return Ok(existing.clone());
        }
        let fresh = self.fetch_token().await?;
        *token = Some(fresh.clone());
        Ok(fresh)
    }

    async fn fetch_chunk(&self, logins: &[String]) -> Result<Vec<HelixStream>> {
        let query: Vec<(&str, &str)> = logins
            .iter()
            .map(|login| ("user_login", login.as_str()))
            .collect();
        let url = format!("{}/streams", self.config.api_base_url.trim_end_matches('/'));

        let mut refreshed = false;
        loop {
            let token = self.access_token(refreshed).await?;
            let response = self
                .client
                .get(&url)
                .header("Client-ID", &self.config.client_id)
                .bearer_auth(&token)
                .query(&query)
                .send()
                .await
                .map_err(|e| Error::Other(format!("Twitch streams request failed: {e}")))?;

            if response.status() == StatusCode::UNAUTHORIZED && !refreshed {
                debug!("Twitch token rejected, refreshing");
                refreshed = true;
                continue;
            }
            if !response.status().is_success() {
                return Err(Error::Other(format!(
                    "Twitch streams request failed: {}",
                    response.status()
                )));
            }

            let body: StreamsResponse = response
                .json()
                .await
                .map_err(|e| Error::Other(format!("invalid Twitch streams response: {e}")))?;
            return Ok(body.data);
        }
    }

    /// Fetch the currently live streams among the configured channels.
    async fn fetch_live(&self, now: DateTime<Utc>) -> Result<Vec<StreamEvent>> {
        let logins: Vec<String> = self
            .config
            .channels
            .iter()
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .collect();

        let mut live = Vec::new();
        for chunk in logins.chunks(MAX_LOGINS_PER_REQUEST) {
            for stream in self.fetch_chunk(chunk).await? {
                if stream.kind.is_empty() || stream.kind == "live" {
                    live.push(stream.into_event(now));
                }
            }
        }
        Ok(live)
    }

    /// Poll once and publish the resulting events.
    ///
    /// A failed poll publishes nothing and keeps the previous snapshot, so a
    /// transient API error never looks like every stream ending.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<Vec<StreamEvent>> {
        let current = self.fetch_live(now).await?;

        let events = {
            let mut live = self.live.lock().await;
            let (events, snapshot) = diff_snapshot(&live, current, now);
            *live = snapshot;
            events
        };

        for event in &events {
            if !event.is_live {
                info!(streamer = %event.streamer_id, "Stream went offline");
            }
            if self.broadcaster.publish(event.clone()).is_err() {
                debug!(streamer = %event.streamer_id, "No subscribers for stream event");
            }
        }
        Ok(events)
    }

    /// Poll on the configured interval until cancelled.
    pub fn spawn(self: &Arc<Self>, cancellation_token: CancellationToken) -> JoinHandle<()> {
        let poller = Arc::clone(self);
        let interval = Duration::from_secs(self.config.poll_interval_secs.max(1));

        tokio::spawn(async move {
            info!(
                channels = poller.config.channels.len(),
                "Twitch poller started, polling every {:?}", interval
            );
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        debug!("Twitch poller shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = poller.poll_once(Utc::now()).await {
                            warn!(error = %e, "Twitch poll failed");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live(id: &str, viewers: u64, now: DateTime<Utc>) -> StreamEvent {
        StreamEvent {
            streamer_id: id.to_string(),
            display_name: id.to_uppercase(),
            is_live: true,
            title: format!("{id} stream"),
            game_name: None,
            viewer_count: viewers,
            thumbnail_ref: None,
            started_at: Some(now),
            observed_at: now,
        }
    }

    #[test]
    fn test_diff_emits_updates_and_offline() {
        let t0 = Utc::now();
        let (events, snapshot) = diff_snapshot(
            &HashMap::new(),
            vec![live("nova", 120, t0), live("orbit", 8, t0)],
            t0,
        );
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.is_live));

        let t1 = t0 + chrono::Duration::seconds(60);
        let (events, snapshot) = diff_snapshot(&snapshot, vec![live("nova", 150, t1)], t1);
        assert_eq!(events.len(), 2);

        let offline = &events[0];
        assert_eq!(offline.streamer_id, "orbit");
        assert!(!offline.is_live);
        assert_eq!(offline.title, "orbit stream");
        assert_eq!(offline.observed_at, t1);

        let update = &events[1];
        assert_eq!(update.streamer_id, "nova");
        assert_eq!(update.viewer_count, 150);

        let t2 = t1 + chrono::Duration::seconds(60);
        let (events, snapshot) = diff_snapshot(&snapshot, Vec::new(), t2);
        assert_eq!(events.len(), 1);
        assert!(!events[0].is_live);
        assert!(snapshot.is_empty());

        let (events, _) = diff_snapshot(&snapshot, Vec::new(), t2);
        assert!(events.is_empty());
    }

    #[test]
    fn test_helix_stream_mapping() {
        let raw = r#"{
            "data": [{
                "id": "1",
                "user_login": "Nova",
                "user_name": "Nova",
                "game_name": "",
                "type": "live",
                "title": "Ranked queue",
                "viewer_count": 120,
                "started_at": "2024-05-01T10:00:00Z",
                "thumbnail_url": "https://cdn.example/nova-{width}x{height}.jpg"
            }]
        }"#;
        let response: StreamsResponse = serde_json::from_str(raw).unwrap();
        let event = response.data[0].clone().into_event(Utc::now());

        assert_eq!(event.streamer_id, "nova");
        assert_eq!(event.game_name, None);
        assert_eq!(event.viewer_count, 120);
        assert!(event.is_live);
        assert!(event.thumbnail_ref.unwrap().contains("{width}"));
    }
}
