//! Stream state polling.
//!
//! The poller turns platform snapshots into [`StreamEvent`]s (live updates
//! while a stream is up, one offline event when it disappears) and publishes
//! them through a [`StreamEventBroadcaster`].
//!
//! [`StreamEvent`]: crate::domain::StreamEvent

mod events;
pub mod twitch;

pub use events::StreamEventBroadcaster;
pub use twitch::{TwitchConfig, TwitchPoller};
