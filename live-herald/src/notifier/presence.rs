//! Process-wide "now showing" indicator.
//!
//! Tracks the currently-live streamers in first-registration order and pushes
//! the most recently registered one to a [`PresenceSink`] on every change and
//! on a fixed refresh timer.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::StreamEvent;
use crate::transport::PresenceSink;

/// Default sink refresh interval.
pub const DEFAULT_PRESENCE_REFRESH: Duration = Duration::from_secs(5 * 60);

/// What an offline event does to the tracked set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceOfflinePolicy {
    /// Remove only the streamer that went offline.
    #[default]
    RemoveStreamer,
    /// Clear every entry (legacy behavior).
    ClearAll,
}

pub struct PresenceTracker {
    online: Mutex<Vec<StreamEvent>>,
    policy: PresenceOfflinePolicy,
    sink: Arc<dyn PresenceSink>,
}

impl PresenceTracker {
    pub fn new(sink: Arc<dyn PresenceSink>, policy: PresenceOfflinePolicy) -> Self {
        Self {
            online: Mutex::new(Vec::new()),
            policy,
            sink,
        }
    }

    pub fn policy(&self) -> PresenceOfflinePolicy {
        self.policy
    }

    /// Register or update a live streamer. Re-registration keeps the position.
    pub async fn set_online(&self, streamer_id: &str, event: &StreamEvent) {
        {
            let mut online = self.online.lock();
            match online.iter_mut().find(|e| e.streamer_id == streamer_id) {
                Some(existing) => *existing = event.clone(),
                None => online.push(event.clone()),
            }
        }
        self.refresh().await;
    }

    pub async fn set_offline(&self, streamer_id: &str) {
        {
            let mut online = self.online.lock();
            match self.policy {
                PresenceOfflinePolicy::RemoveStreamer => {
                    online.retain(|e| e.streamer_id != streamer_id)
                }
                PresenceOfflinePolicy::ClearAll => online.clear(),
            }
        }
        self.refresh().await;
    }

    pub async fn clear_all(&self) {
        self.online.lock().clear();
        self.refresh().await;
    }

    /// Most recently registered live streamer.
    pub fn current_display(&self) -> Option<StreamEvent> {
        self.online.lock().last().cloned()
    }

    pub fn online_count(&self) -> usize {
        self.online.lock().len()
    }

    /// Push the current display entry to the sink.
    pub async fn refresh(&self) {
        let current = self.current_display();
        if let Err(e) = self.sink.show(current.as_ref()).await {
            warn!(error = %e, "Failed to update presence indicator");
        }
    }

    /// Refresh the sink every `interval` until cancelled.
    pub fn spawn_refresh_timer(
        self: &Arc<Self>,
        interval: Duration,
        cancellation_token: CancellationToken,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        debug!("Presence refresh timer shutting down");
                        break;
                    }
                    _ = ticker.tick() => tracker.refresh().await,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use chrono::Utc;

    #[derive(Default)]
    struct RecordingSink {
        shown: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl PresenceSink for RecordingSink {
        async fn show(&self, current: Option<&StreamEvent>) -> Result<(), TransportError> {
            self.shown
                .lock()
                .push(current.map(|e| e.streamer_id.clone()));
            Ok(())
        }
    }

    fn event(id: &str, viewers: u64) -> StreamEvent {
        StreamEvent {
            streamer_id: id.to_string(),
            display_name: id.to_uppercase(),
            is_live: true,
            title: "title".to_string(),
            game_name: None,
            viewer_count: viewers,
            thumbnail_ref: None,
            started_at: None,
            observed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_display_is_latest_registered() {
        let sink = Arc::new(RecordingSink::default());
        let tracker = PresenceTracker::new(sink.clone(), PresenceOfflinePolicy::RemoveStreamer);

        tracker.set_online("nova", &event("nova", 10)).await;
        tracker.set_online("orbit", &event("orbit", 5)).await;
        // Update keeps nova in first position.
        tracker.set_online("nova", &event("nova", 20)).await;

        let current = tracker.current_display().unwrap();
        assert_eq!(current.streamer_id, "orbit");
        assert_eq!(tracker.online_count(), 2);

        tracker.set_offline("orbit").await;
        let current = tracker.current_display().unwrap();
        assert_eq!(current.streamer_id, "nova");
        assert_eq!(current.viewer_count, 20);

        assert_eq!(
            *sink.shown.lock(),
            vec![
                Some("nova".to_string()),
                Some("orbit".to_string()),
                Some("orbit".to_string()),
                Some("nova".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_clear_all_policy() {
        let sink = Arc::new(RecordingSink::default());
        let tracker = PresenceTracker::new(sink.clone(), PresenceOfflinePolicy::ClearAll);

        tracker.set_online("nova", &event("nova", 10)).await;
        tracker.set_online("orbit", &event("orbit", 5)).await;
        tracker.set_offline("nova").await;

        assert!(tracker.current_display().is_none());
        assert_eq!(sink.shown.lock().last(), Some(&None));
    }

    #[tokio::test]
    async fn test_refresh_timer_stops_on_cancel() {
        let sink = Arc::new(RecordingSink::default());
        let tracker = Arc::new(PresenceTracker::new(sink.clone(), PresenceOfflinePolicy::default()));
        let token = CancellationToken::new();

        let handle = tracker.spawn_refresh_timer(Duration::from_millis(10), token.clone());
        tokio::time::sleep(Duration::from_millis(35)).await;
        token.cancel();
        handle.await.unwrap();

        assert!(!sink.shown.lock().is_empty());
    }
}
