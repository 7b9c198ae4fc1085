//! Short-window suppression of repeated stream events.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// Default debounce window in seconds.
pub const DEFAULT_DEBOUNCE_SECS: u64 = 60;

/// Rejects a repeated event for the same streamer within the window.
#[derive(Debug)]
pub struct DebounceGate {
    window: Duration,
    /// Last accepted timestamp per streamer.
    entries: DashMap<String, DateTime<Utc>>,
}

impl DebounceGate {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: DashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Accept the event unless one was accepted for `streamer_id` within the
    /// window. The stored timestamp only moves on acceptance.
    pub fn accept(&self, streamer_id: &str, now: DateTime<Utc>) -> bool {
        match self.entries.entry(streamer_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if now.signed_duration_since(*entry.get()) < self.window {
                    return false;
                }
                entry.insert(now);
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    /// Drop entries that can no longer reject anything.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, accepted_at| now.signed_duration_since(*accepted_at) < self.window);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DebounceGate {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_DEBOUNCE_SECS as i64))
    }
}
