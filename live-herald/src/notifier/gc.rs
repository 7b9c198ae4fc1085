//! Retention sweep over the notification history.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

use super::locks::StreamerLocks;
use crate::Result;
use crate::domain::RecordKey;
use crate::store::NotificationHistory;

/// Default retention of notification records in hours.
pub const DEFAULT_RETENTION_HOURS: u64 = 24;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<RecordKey>,
    /// Expired records left in place because their streamer was busy.
    pub skipped_busy: usize,
}

/// Removes records whose last activity is older than the retention window.
pub struct HistorySweeper {
    history: Arc<NotificationHistory>,
    locks: Arc<StreamerLocks>,
    retention: Duration,
}

impl HistorySweeper {
    pub fn new(
        history: Arc<NotificationHistory>,
        locks: Arc<StreamerLocks>,
        retention: Duration,
    ) -> Self {
        Self {
            history,
            locks,
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Evict every record idle for at least the retention window, whatever
    /// its state. Streamers with a pass in flight are skipped and picked up by
    /// a later sweep. The pruned map is written once.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let cutoff = now - self.retention;
        let mut guards: HashMap<String, Option<OwnedMutexGuard<()>>> = HashMap::new();
        let mut skipped_busy = 0;

        let removed = self
            .history
            .retain(|key, record| {
                if record.last_activity() > cutoff {
                    return true;
                }
                let acquired = match guards.entry(key.streamer_id.clone()) {
                    Entry::Occupied(entry) => entry.get().is_some(),
                    Entry::Vacant(entry) => {
                        entry.insert(self.locks.try_lock(&key.streamer_id)).is_some()
                    }
                };
                if !acquired {
                    skipped_busy += 1;
                }
                !acquired
            })
            .await?;
        drop(guards);

        if removed.is_empty() {
            debug!(skipped_busy, "History sweep found nothing to evict");
        } else {
            info!(
                removed = removed.len(),
                skipped_busy, "Evicted expired notification records"
            );
        }

        Ok(SweepReport {
            removed,
            skipped_busy,
        })
    }
}
