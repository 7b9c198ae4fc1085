//! Normalized stream observations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One normalized live/offline observation for a monitored streamer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Stable streamer identifier (platform login, lowercase).
    pub streamer_id: String,
    pub display_name: String,
    pub is_live: bool,
    pub title: String,
    pub game_name: Option<String>,
    pub viewer_count: u64,
    /// Preview image template or URL as reported by the platform.
    pub thumbnail_ref: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
}

impl StreamEvent {
    /// Derive the offline counterpart of a live observation.
    ///
    /// Keeps the last known metadata so the terminal edit can still show it.
    pub fn to_offline(&self, observed_at: DateTime<Utc>) -> Self {
        Self {
            is_live: false,
            viewer_count: 0,
            observed_at,
            ..self.clone()
        }
    }

    /// Public channel URL.
    pub fn channel_url(&self) -> String {
        format!("https://twitch.tv/{}", self.streamer_id.to_lowercase())
    }

    /// How long the stream has been running at observation time.
    pub fn uptime(&self) -> Option<chrono::Duration> {
        let started_at = self.started_at?;
        let uptime = self.observed_at.signed_duration_since(started_at);
        (uptime >= chrono::Duration::zero()).then_some(uptime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_event() -> StreamEvent {
        let now = Utc::now();
        StreamEvent {
            streamer_id: "nova".to_string(),
            display_name: "Nova".to_string(),
            is_live: true,
            title: "Ranked queue".to_string(),
            game_name: Some("Valorant".to_string()),
            viewer_count: 120,
            thumbnail_ref: None,
            started_at: Some(now - chrono::Duration::minutes(90)),
            observed_at: now,
        }
    }

    #[test]
    fn test_to_offline_keeps_metadata() {
        let event = live_event();
        let later = event.observed_at + chrono::Duration::minutes(5);
        let offline = event.to_offline(later);

        assert!(!offline.is_live);
        assert_eq!(offline.viewer_count, 0);
        assert_eq!(offline.title, "Ranked queue");
        assert_eq!(offline.observed_at, later);
    }

    #[test]
    fn test_uptime() {
        let event = live_event();
        assert_eq!(event.uptime(), Some(chrono::Duration::minutes(90)));

        let mut skewed = live_event();
        skewed.started_at = Some(skewed.observed_at + chrono::Duration::minutes(1));
        assert_eq!(skewed.uptime(), None);
    }

    #[test]
    fn test_channel_url() {
        let mut event = live_event();
        event.streamer_id = "Nova".to_string();
        assert_eq!(event.channel_url(), "https://twitch.tv/nova");
    }
}
