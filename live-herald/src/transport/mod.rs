//! Collaborators the engine talks to.
//!
//! The engine only sees these traits; concrete implementations are injected
//! at construction time:
//! - [`MessageTransport`]: create/edit/fetch messages by opaque reference
//! - [`DestinationDirectory`]: discover where announcements go
//! - [`RoleDirectory`]: resolve role names to mention ids
//! - [`PresenceSink`]: the process-wide "now showing" indicator

pub mod discord;
mod presence;

pub use discord::{DiscordClient, DiscordConfig};
pub use presence::LogPresenceSink;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Destination, DestinationQuery, MessageRef, StreamEvent};

/// Classified failure of a transport call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("message not found")]
    NotFound,

    #[error("request timed out")]
    Timeout,

    #[error("rate limited by remote")]
    RateLimited,

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

/// Failure of destination discovery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("connection not ready")]
    NotReady,

    #[error("{0}")]
    Other(String),
}

/// Which form of the announcement is being rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnouncementPhase {
    Live,
    Ended,
}

/// Everything a transport needs to render one notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Announcement {
    pub phase: AnnouncementPhase,
    pub text: String,
    /// Mention text; only ever set on creation.
    pub mention: Option<String>,
    pub stream: StreamEvent,
}

impl Announcement {
    pub fn live(stream: &StreamEvent, mention: Option<String>) -> Self {
        Self {
            phase: AnnouncementPhase::Live,
            text: format!("{} went live on Twitch!", stream.display_name),
            mention,
            stream: stream.clone(),
        }
    }

    pub fn ended(stream: &StreamEvent) -> Self {
        Self {
            phase: AnnouncementPhase::Ended,
            text: format!("{} was live on Twitch.", stream.display_name),
            mention: None,
            stream: stream.clone(),
        }
    }

    /// Plain message content: the text followed by the mention, if any.
    pub fn content(&self) -> String {
        match &self.mention {
            Some(mention) => format!("{} {}", self.text, mention),
            None => self.text.clone(),
        }
    }
}

/// A message as returned by [`MessageTransport::fetch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMessage {
    pub message_ref: MessageRef,
    pub content: String,
}

/// Creates, edits and looks up messages at a destination.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(
        &self,
        destination: &Destination,
        announcement: &Announcement,
    ) -> Result<MessageRef, TransportError>;

    /// Replace the message content. [`TransportError::NotFound`] if it is gone.
    async fn edit(
        &self,
        destination: &Destination,
        message_ref: &MessageRef,
        announcement: &Announcement,
    ) -> Result<(), TransportError>;

    async fn fetch(
        &self,
        destination: &Destination,
        message_ref: &MessageRef,
    ) -> Result<FetchedMessage, TransportError>;
}

/// Lists the destinations currently eligible for announcements.
#[async_trait]
pub trait DestinationDirectory: Send + Sync {
    /// Ordered destinations. An empty list means "no destinations".
    async fn list_destinations(
        &self,
        query: &DestinationQuery,
    ) -> Result<Vec<Destination>, DiscoveryError>;
}

/// Resolves role names inside a group.
#[async_trait]
pub trait RoleDirectory: Send + Sync {
    /// Id of the role named `role_name` in `group_id`, if any.
    async fn find_role(
        &self,
        group_id: &str,
        role_name: &str,
    ) -> Result<Option<String>, TransportError>;
}

/// Receives the presence display entry whenever it is refreshed.
#[async_trait]
pub trait PresenceSink: Send + Sync {
    /// `None` clears the indicator.
    async fn show(&self, current: Option<&StreamEvent>) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event() -> StreamEvent {
        StreamEvent {
            streamer_id: "nova".to_string(),
            display_name: "Nova".to_string(),
            is_live: true,
            title: "Ranked queue".to_string(),
            game_name: None,
            viewer_count: 120,
            thumbnail_ref: None,
            started_at: None,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_announcement_content() {
        let live = Announcement::live(&event(), Some("@everyone".to_string()));
        assert_eq!(live.content(), "Nova went live on Twitch! @everyone");

        let plain = Announcement::live(&event(), None);
        assert_eq!(plain.content(), "Nova went live on Twitch!");

        let ended = Announcement::ended(&event());
        assert_eq!(ended.phase, AnnouncementPhase::Ended);
        assert_eq!(ended.content(), "Nova was live on Twitch.");
    }
}
