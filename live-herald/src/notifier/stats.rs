use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::lifecycle::DestinationOutcome;

/// Running counters of the notifier.
#[derive(Debug, Default)]
pub struct NotifierStats {
    passes: AtomicU64,
    debounced: AtomicU64,
    created: AtomicU64,
    edited: AtomicU64,
    retired: AtomicU64,
    evicted: AtomicU64,
    rate_limited: AtomicU64,
    permission_failures: AtomicU64,
    transport_failures: AtomicU64,
    stale_recoveries: AtomicU64,
    swept_records: AtomicU64,
}

/// Point-in-time copy of [`NotifierStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifierStatsSnapshot {
    pub passes: u64,
    pub debounced: u64,
    pub created: u64,
    pub edited: u64,
    pub retired: u64,
    pub evicted: u64,
    pub rate_limited: u64,
    pub permission_failures: u64,
    pub transport_failures: u64,
    pub stale_recoveries: u64,
    pub swept_records: u64,
}

impl NotifierStats {
    pub fn record_pass(&self) {
        self.passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_debounced(&self) {
        self.debounced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_recovery(&self) {
        self.stale_recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_swept(&self, count: usize) {
        self.swept_records.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, outcome: DestinationOutcome) {
        let counter = match outcome {
            DestinationOutcome::Created | DestinationOutcome::Recreated => &self.created,
            DestinationOutcome::Edited => &self.edited,
            DestinationOutcome::Retired => &self.retired,
            DestinationOutcome::Evicted => &self.evicted,
            DestinationOutcome::RateLimited => &self.rate_limited,
            DestinationOutcome::PermissionDenied => &self.permission_failures,
            DestinationOutcome::Failed => &self.transport_failures,
            DestinationOutcome::Unchanged => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> NotifierStatsSnapshot {
        NotifierStatsSnapshot {
            passes: self.passes.load(Ordering::Relaxed),
            debounced: self.debounced.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            edited: self.edited.load(Ordering::Relaxed),
            retired: self.retired.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            permission_failures: self.permission_failures.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
            stale_recoveries: self.stale_recoveries.load(Ordering::Relaxed),
            swept_records: self.swept_records.load(Ordering::Relaxed),
        }
    }
}
