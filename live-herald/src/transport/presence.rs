use async_trait::async_trait;
use tracing::info;

use super::{PresenceSink, TransportError};
use crate::domain::StreamEvent;

/// Presence sink that writes the indicator to the log.
#[derive(Debug, Default, Clone)]
pub struct LogPresenceSink;

#[async_trait]
impl PresenceSink for LogPresenceSink {
    async fn show(&self, current: Option<&StreamEvent>) -> Result<(), TransportError> {
        match current {
            Some(event) => info!(
                streamer = %event.streamer_id,
                url = %event.channel_url(),
                "Now showing {}",
                event.display_name
            ),
            None => info!("Cleared presence indicator"),
        }
        Ok(())
    }
}
