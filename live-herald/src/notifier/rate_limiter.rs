//! Ceiling on new notifications per destination group.
//!
//! The count is derived from the persisted history on every check: records of
//! the group created within the rolling window, plus creations currently in
//! flight. Edits never go through the limiter.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::Result;
use crate::store::NotificationHistory;

/// Default rolling window in seconds.
pub const DEFAULT_WINDOW_SECS: u64 = 60;

/// Default number of new notifications per group per window.
pub const DEFAULT_MAX_PER_WINDOW: usize = 5;

/// Configuration for the notification rate limiter.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_per_window: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::seconds(DEFAULT_WINDOW_SECS as i64),
            max_per_window: DEFAULT_MAX_PER_WINDOW,
        }
    }
}

type InFlight = Arc<Mutex<HashMap<String, usize>>>;

/// A claimed creation slot.
///
/// Counts toward the group's ceiling until dropped; hold it until the created
/// record is stored or the send has failed.
#[derive(Debug)]
pub struct RatePermit {
    group_id: String,
    in_flight: InFlight,
}

impl RatePermit {
    pub fn group_id(&self) -> &str {
        &self.group_id
    }
}

impl Drop for RatePermit {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock();
        if let Some(count) = in_flight.get_mut(&self.group_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                in_flight.remove(&self.group_id);
            }
        }
    }
}

/// Per-group limiter for notification creation.
pub struct NotificationRateLimiter {
    config: RateLimitConfig,
    in_flight: InFlight,
    /// Serializes check-and-claim across concurrent destinations.
    gate: tokio::sync::Mutex<()>,
}

impl NotificationRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    fn pending(&self, group_id: &str) -> usize {
        self.in_flight.lock().get(group_id).copied().unwrap_or(0)
    }

    async fn used(
        &self,
        history: &NotificationHistory,
        group_id: &str,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let since = now - self.config.window;
        let stored = history.count_created_since(group_id, since).await?;
        Ok(stored + self.pending(group_id))
    }

    /// Whether a new notification for `group_id` would currently be allowed.
    pub async fn allow_new_notification(
        &self,
        history: &NotificationHistory,
        group_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let used = self.used(history, group_id, now).await?;
        Ok(used < self.config.max_per_window)
    }

    /// Atomically check the ceiling and claim a creation slot.
    ///
    /// Returns `None` when the group is at its ceiling.
    pub async fn try_acquire(
        &self,
        history: &NotificationHistory,
        group_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<RatePermit>> {
        let _gate = self.gate.lock().await;

        let used = self.used(history, group_id, now).await?;
        if used >= self.config.max_per_window {
            debug!(
                group = %group_id,
                used,
                max = self.config.max_per_window,
                "New notification rate limited"
            );
            return Ok(None);
        }

        *self
            .in_flight
            .lock()
            .entry(group_id.to_string())
            .or_insert(0) += 1;
        trace!(group = %group_id, used = used + 1, "Claimed notification slot");

        Ok(Some(RatePermit {
            group_id: group_id.to_string(),
            in_flight: self.in_flight.clone(),
        }))
    }
}

impl Default for NotificationRateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MessageRef, NotificationRecord, RecordKey};
    use crate::store::MemoryStateStore;

    fn history() -> NotificationHistory {
        NotificationHistory::new(Arc::new(MemoryStateStore::new()))
    }

    async fn store_created(history: &NotificationHistory, group: &str, dest: &str, at: DateTime<Utc>) {
        history
            .upsert(
                RecordKey::new(group, dest, "nova"),
                NotificationRecord::active(MessageRef::new(dest), at),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ceiling_counts_stored_records() {
        let history = history();
        let limiter = NotificationRateLimiter::default();
        let now = Utc::now();

        for i in 0..5 {
            store_created(&history, "G1", &format!("c{i}"), now).await;
        }

        assert!(!limiter.allow_new_notification(&history, "G1", now).await.unwrap());
        assert!(limiter.try_acquire(&history, "G1", now).await.unwrap().is_none());
        assert!(limiter.allow_new_notification(&history, "G2", now).await.unwrap());

        // Window rolls over.
        let later = now + Duration::seconds(61);
        assert!(limiter.allow_new_notification(&history, "G1", later).await.unwrap());
    }

    #[tokio::test]
    async fn test_in_flight_permits_count() {
        let history = history();
        let limiter = NotificationRateLimiter::new(RateLimitConfig {
            window: Duration::seconds(60),
            max_per_window: 2,
        });
        let now = Utc::now();

        let first = limiter.try_acquire(&history, "G1", now).await.unwrap();
        let second = limiter.try_acquire(&history, "G1", now).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_some());
        assert!(limiter.try_acquire(&history, "G1", now).await.unwrap().is_none());

        // A failed send releases its slot.
        drop(second);
        let third = limiter.try_acquire(&history, "G1", now).await.unwrap();
        assert!(third.is_some());
        assert_eq!(third.as_ref().map(|p| p.group_id()), Some("G1"));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_respects_ceiling() {
        let history = Arc::new(history());
        let limiter = Arc::new(NotificationRateLimiter::default());
        let now = Utc::now();

        let attempts = (0..12).map(|_| {
            let history = history.clone();
            let limiter = limiter.clone();
            async move { limiter.try_acquire(&history, "G1", now).await.unwrap() }
        });
        let permits = futures::future::join_all(attempts).await;

        assert_eq!(permits.iter().filter(|p| p.is_some()).count(), 5);
    }
}
