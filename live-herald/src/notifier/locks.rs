//! Per-streamer pass serialization.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Async mutex per streamer id.
///
/// Passes for one streamer hold the guard for their whole duration; the
/// sweeper only ever `try_lock`s so it never waits behind a pass.
#[derive(Debug, Default)]
pub struct StreamerLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl StreamerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_lock(&self, streamer_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(streamer_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn lock(&self, streamer_id: &str) -> OwnedMutexGuard<()> {
        self.get_lock(streamer_id).lock_owned().await
    }

    /// `None` while a pass for `streamer_id` is in flight.
    pub fn try_lock(&self, streamer_id: &str) -> Option<OwnedMutexGuard<()>> {
        self.get_lock(streamer_id).try_lock_owned().ok()
    }

    /// Forget locks nobody holds or waits on.
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_try_lock_reports_busy() {
        let locks = StreamerLocks::new();
        let guard = locks.lock("nova").await;

        assert!(locks.try_lock("nova").is_none());
        assert!(locks.try_lock("orbit").is_some());

        drop(guard);
        assert!(locks.try_lock("nova").is_some());
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let locks = StreamerLocks::new();
        let guard = locks.lock("nova").await;
        drop(locks.lock("orbit").await);

        locks.prune();
        assert_eq!(locks.len(), 1);
        assert!(locks.try_lock("nova").is_none());

        drop(guard);
        locks.prune();
        assert!(locks.is_empty());
    }
}
