//! Stream-announcement reconciliation engine.
//!
//! [`StreamNotifier`] receives normalized stream events and keeps exactly one
//! evolving announcement per (destination, streamer) pair:
//! - [`DebounceGate`] drops repeated live events
//! - [`PresenceTracker`] drives the "now showing" indicator
//! - [`LifecycleManager`] creates, edits and retires announcements
//! - [`NotificationRateLimiter`] caps new announcements per group
//! - [`MentionResolver`] picks the mention attached to new announcements
//! - [`HistorySweeper`] evicts idle records

mod debounce;
mod gc;
mod lifecycle;
mod locks;
mod mention;
mod presence;
mod rate_limiter;
mod service;
mod stats;

pub use debounce::DebounceGate;
pub use gc::{HistorySweeper, SweepReport};
pub use lifecycle::{DestinationOutcome, DestinationReport, LifecycleManager, PassReport};
pub use locks::StreamerLocks;
pub use mention::{MentionConfig, MentionResolver, MentionRule, MentionTarget};
pub use presence::{PresenceOfflinePolicy, PresenceTracker};
pub use rate_limiter::{NotificationRateLimiter, RateLimitConfig, RatePermit};
pub use service::{NotifierConfig, NotifierDeps, StreamNotifier};
pub use stats::{NotifierStats, NotifierStatsSnapshot};
