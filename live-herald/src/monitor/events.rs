use tokio::sync::broadcast;

use crate::domain::StreamEvent;

/// Broadcaster for stream events.
#[derive(Clone)]
pub struct StreamEventBroadcaster {
    sender: broadcast::Sender<StreamEvent>,
}

impl StreamEventBroadcaster {
    /// Create a new broadcaster with default capacity (256).
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Returns the number of receivers it reached.
    pub fn publish(
        &self,
        event: StreamEvent,
    ) -> Result<usize, broadcast::error::SendError<StreamEvent>> {
        self.sender.send(event)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for StreamEventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let broadcaster = StreamEventBroadcaster::new();
        assert!(
            broadcaster
                .publish(StreamEvent {
                    streamer_id: "nova".to_string(),
                    display_name: "Nova".to_string(),
                    is_live: false,
                    title: String::new(),
                    game_name: None,
                    viewer_count: 0,
                    thumbnail_ref: None,
                    started_at: None,
                    observed_at: Utc::now(),
                })
                .is_err()
        );

        let mut rx = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 1);

        let event = StreamEvent {
            streamer_id: "orbit".to_string(),
            display_name: "Orbit".to_string(),
            is_live: true,
            title: "Speedruns".to_string(),
            game_name: None,
            viewer_count: 3,
            thumbnail_ref: None,
            started_at: None,
            observed_at: Utc::now(),
        };
        broadcaster.publish(event.clone()).unwrap();
        assert_eq!(rx.recv().await.unwrap(), event);
    }
}
