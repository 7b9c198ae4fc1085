//! Per-destination notification state machine.
//!
//! For each (destination, streamer) pair the persisted record decides the
//! action; message content is never compared:
//!
//! | record   | live | action                                            |
//! |----------|------|---------------------------------------------------|
//! | absent   | yes  | rate limit, resolve mention, send, store          |
//! | absent   | no   | nothing                                           |
//! | active   | yes  | fetch + edit in place; recreate if the message is gone |
//! | active   | no   | terminal edit, mark offline; evict if gone        |
//! | retiring | no   | nothing                                           |
//! | retiring | yes  | leave the ended message, send a fresh one         |

use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::mention::MentionResolver;
use super::rate_limiter::NotificationRateLimiter;
use super::stats::NotifierStats;
use crate::domain::{
    Destination, MessageRef, NotificationRecord, RecordKey, RecordState, StreamEvent,
};
use crate::store::NotificationHistory;
use crate::transport::{Announcement, MessageTransport, TransportError};

/// Default bound on a single transport call.
pub const DEFAULT_TRANSPORT_TIMEOUT: Duration = Duration::from_secs(20);

/// What a pass did at one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationOutcome {
    /// New notification sent.
    Created,
    /// Previous message was gone or ended; a fresh one was sent.
    Recreated,
    Edited,
    /// Terminal "ended" edit done.
    Retired,
    /// Record removed because the message no longer exists.
    Evicted,
    Unchanged,
    RateLimited,
    PermissionDenied,
    /// Transport or persistence failure; the pair is left as it was.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationReport {
    pub key: RecordKey,
    pub outcome: DestinationOutcome,
}

/// Result of reconciling one event across a destination snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub streamer_id: String,
    pub is_live: bool,
    pub destinations: Vec<DestinationReport>,
    /// `(group_id, destination_id)` of destinations dropped for this pass.
    pub failed_this_pass: BTreeSet<(String, String)>,
}

impl PassReport {
    fn new(event: &StreamEvent) -> Self {
        Self {
            streamer_id: event.streamer_id.clone(),
            is_live: event.is_live,
            ..Default::default()
        }
    }

    pub fn count(&self, outcome: DestinationOutcome) -> usize {
        self.destinations
            .iter()
            .filter(|d| d.outcome == outcome)
            .count()
    }

    pub fn outcome_for(&self, group_id: &str, destination_id: &str) -> Option<DestinationOutcome> {
        self.destinations
            .iter()
            .find(|d| d.key.group_id == group_id && d.key.destination_id == destination_id)
            .map(|d| d.outcome)
    }

    pub fn is_failed(&self, destination: &Destination) -> bool {
        self.failed_this_pass.contains(&(
            destination.group_id.clone(),
            destination.destination_id.clone(),
        ))
    }
}

/// Decides and performs create/edit/retire per destination.
pub struct LifecycleManager {
    history: Arc<NotificationHistory>,
    transport: Arc<dyn MessageTransport>,
    limiter: Arc<NotificationRateLimiter>,
    mentions: Arc<MentionResolver>,
    stats: Arc<NotifierStats>,
    call_timeout: Duration,
}

impl LifecycleManager {
    pub fn new(
        history: Arc<NotificationHistory>,
        transport: Arc<dyn MessageTransport>,
        limiter: Arc<NotificationRateLimiter>,
        mentions: Arc<MentionResolver>,
        stats: Arc<NotifierStats>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            history,
            transport,
            limiter,
            mentions,
            stats,
            call_timeout,
        }
    }

    /// Reconcile `event` against every destination of the snapshot.
    ///
    /// Destinations are processed concurrently; a slow or failing destination
    /// never holds up the others. Duplicate destinations are processed once.
    pub async fn reconcile(
        &self,
        event: &StreamEvent,
        destinations: &[Destination],
        now: DateTime<Utc>,
    ) -> PassReport {
        let mut seen = HashSet::new();
        let unique: Vec<&Destination> = destinations
            .iter()
            .filter(|d| seen.insert((d.group_id.as_str(), d.destination_id.as_str())))
            .collect();

        let outcomes = join_all(
            unique
                .iter()
                .map(|destination| self.reconcile_destination(event, destination, now)),
        )
        .await;

        let mut report = PassReport::new(event);
        for (destination, outcome) in unique.into_iter().zip(outcomes) {
            self.stats.record_outcome(outcome);
            if outcome == DestinationOutcome::PermissionDenied {
                report.failed_this_pass.insert((
                    destination.group_id.clone(),
                    destination.destination_id.clone(),
                ));
            }
            report.destinations.push(DestinationReport {
                key: record_key(destination, event),
                outcome,
            });
        }
        report
    }

    async fn reconcile_destination(
        &self,
        event: &StreamEvent,
        destination: &Destination,
        now: DateTime<Utc>,
    ) -> DestinationOutcome {
        if !destination.can_post {
            debug!(
                destination = %destination.display_name,
                "Skipping destination without post permission"
            );
            return DestinationOutcome::PermissionDenied;
        }

        let key = record_key(destination, event);
        let record = match self.history.get(&key).await {
            Ok(record) => record,
            Err(e) => {
                error!(key = %key, error = %e, "Failed to load notification record");
                return DestinationOutcome::Failed;
            }
        };

        let existing = record.and_then(|record| {
            let message_ref = record.message_ref.clone()?;
            Some((record, message_ref))
        });

        match (existing, event.is_live) {
            (None, true) => {
                self.create(event, destination, key, now, DestinationOutcome::Created)
                    .await
            }
            (None, false) => DestinationOutcome::Unchanged,
            (Some((record, message_ref)), true) => match record.state() {
                RecordState::Active => {
                    self.update_live(event, destination, key, record, message_ref, now)
                        .await
                }
                RecordState::Retiring => {
                    debug!(key = %key, "New session after ended announcement");
                    self.create(event, destination, key, now, DestinationOutcome::Recreated)
                        .await
                }
            },
            (Some((record, message_ref)), false) => match record.state() {
                RecordState::Active => {
                    self.retire(event, destination, key, record, message_ref, now)
                        .await
                }
                RecordState::Retiring => DestinationOutcome::Unchanged,
            },
        }
    }

    /// Claim a rate slot, send a new announcement and store its record.
    async fn create(
        &self,
        event: &StreamEvent,
        destination: &Destination,
        key: RecordKey,
        now: DateTime<Utc>,
        outcome: DestinationOutcome,
    ) -> DestinationOutcome {
        let permit = match self
            .limiter
            .try_acquire(&self.history, &destination.group_id, now)
            .await
        {
            Ok(Some(permit)) => permit,
            Ok(None) => {
                info!(
                    key = %key,
                    "Rate limit reached for group {}, skipping new announcement",
                    destination.group_id
                );
                return DestinationOutcome::RateLimited;
            }
            Err(e) => {
                error!(key = %key, error = %e, "Failed to evaluate rate limit");
                return DestinationOutcome::Failed;
            }
        };

        let mention = self.mentions.resolve(&event.streamer_id, destination).await;
        let announcement = Announcement::live(event, mention);

        let message_ref = match self
            .call(self.transport.send(destination, &announcement))
            .await
        {
            Ok(message_ref) => message_ref,
            Err(e) => return self.transport_failure(&key, destination, "send", e),
        };

        let result = self
            .history
            .upsert(key.clone(), NotificationRecord::active(message_ref.clone(), now))
            .await;
        drop(permit);

        match result {
            Ok(()) => {
                info!(
                    key = %key,
                    message = %message_ref,
                    "Sent announcement to {}",
                    destination.display_name
                );
                outcome
            }
            Err(e) => {
                error!(key = %key, error = %e, "Failed to store notification record");
                DestinationOutcome::Failed
            }
        }
    }

    /// Edit an active announcement in place with fresh metadata.
    async fn update_live(
        &self,
        event: &StreamEvent,
        destination: &Destination,
        key: RecordKey,
        mut record: NotificationRecord,
        message_ref: MessageRef,
        now: DateTime<Utc>,
    ) -> DestinationOutcome {
        if let Err(e) = self
            .call(self.transport.fetch(destination, &message_ref))
            .await
        {
            return match e {
                TransportError::NotFound => {
                    self.recover_stale(event, destination, key, now).await
                }
                other => self.transport_failure(&key, destination, "fetch", other),
            };
        }

        let announcement = Announcement::live(event, None);
        if let Err(e) = self
            .call(self.transport.edit(destination, &message_ref, &announcement))
            .await
        {
            return match e {
                TransportError::NotFound => {
                    self.recover_stale(event, destination, key, now).await
                }
                other => self.transport_failure(&key, destination, "edit", other),
            };
        }

        record.touch(now);
        match self.history.upsert(key.clone(), record).await {
            Ok(()) => {
                debug!(key = %key, message = %message_ref, "Updated announcement");
                DestinationOutcome::Edited
            }
            Err(e) => {
                error!(key = %key, error = %e, "Failed to store notification record");
                DestinationOutcome::Failed
            }
        }
    }

    /// Drop a record whose message is gone and announce afresh.
    async fn recover_stale(
        &self,
        event: &StreamEvent,
        destination: &Destination,
        key: RecordKey,
        now: DateTime<Utc>,
    ) -> DestinationOutcome {
        warn!(key = %key, "Announcement message is gone, recreating");
        if let Err(e) = self.history.remove(&key).await {
            error!(key = %key, error = %e, "Failed to remove stale record");
            return DestinationOutcome::Failed;
        }
        self.stats.record_stale_recovery();
        self.create(event, destination, key, now, DestinationOutcome::Recreated)
            .await
    }

    /// Apply the terminal "ended" edit.
    async fn retire(
        &self,
        event: &StreamEvent,
        destination: &Destination,
        key: RecordKey,
        mut record: NotificationRecord,
        message_ref: MessageRef,
        now: DateTime<Utc>,
    ) -> DestinationOutcome {
        let announcement = Announcement::ended(event);
        match self
            .call(self.transport.edit(destination, &message_ref, &announcement))
            .await
        {
            Ok(()) => {}
            Err(TransportError::NotFound) => {
                return match self.history.remove(&key).await {
                    Ok(_) => {
                        info!(key = %key, "Ended announcement is gone, record evicted");
                        DestinationOutcome::Evicted
                    }
                    Err(e) => {
                        error!(key = %key, error = %e, "Failed to evict notification record");
                        DestinationOutcome::Failed
                    }
                };
            }
            Err(e) => return self.transport_failure(&key, destination, "edit", e),
        }

        record.retire(now);
        match self.history.upsert(key.clone(), record).await {
            Ok(()) => {
                info!(key = %key, "Marked announcement as ended");
                DestinationOutcome::Retired
            }
            Err(e) => {
                error!(key = %key, error = %e, "Failed to store notification record");
                DestinationOutcome::Failed
            }
        }
    }

    fn transport_failure(
        &self,
        key: &RecordKey,
        destination: &Destination,
        operation: &str,
        error: TransportError,
    ) -> DestinationOutcome {
        match error {
            TransportError::PermissionDenied(reason) => {
                warn!(
                    key = %key,
                    operation,
                    "Permission denied at {}: {}",
                    destination.display_name,
                    reason
                );
                DestinationOutcome::PermissionDenied
            }
            other => {
                warn!(
                    key = %key,
                    operation,
                    error = %other,
                    "Transport call failed at {}",
                    destination.display_name
                );
                DestinationOutcome::Failed
            }
        }
    }

    /// Bound a transport call by the configured timeout.
    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, TransportError>>,
    ) -> Result<T, TransportError> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

fn record_key(destination: &Destination, event: &StreamEvent) -> RecordKey {
    RecordKey::new(
        destination.group_id.clone(),
        destination.destination_id.clone(),
        event.streamer_id.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::mention::MentionConfig;
    use crate::store::MemoryStateStore;
    use crate::transport::{FetchedMessage, RoleDirectory};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoRoles;

    #[async_trait]
    impl RoleDirectory for NoRoles {
        async fn find_role(&self, _: &str, _: &str) -> Result<Option<String>, TransportError> {
            Ok(None)
        }
    }

    /// Sends succeed; every other call hangs forever.
    #[derive(Default)]
    struct HangingEdits {
        sends: AtomicUsize,
    }

    #[async_trait]
    impl MessageTransport for HangingEdits {
        async fn send(&self, _: &Destination, _: &Announcement) -> Result<MessageRef, TransportError> {
            let n = self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(MessageRef::new(format!("m{n}")))
        }

        async fn edit(&self, _: &Destination, _: &MessageRef, _: &Announcement) -> Result<(), TransportError> {
            futures::future::pending().await
        }

        async fn fetch(&self, _: &Destination, _: &MessageRef) -> Result<FetchedMessage, TransportError> {
            futures::future::pending().await
        }
    }

    fn destination(id: &str, can_post: bool) -> Destination {
        Destination {
            group_id: "G1".to_string(),
            destination_id: id.to_string(),
            display_name: format!("#{id}"),
            can_post,
        }
    }

    fn event(is_live: bool) -> StreamEvent {
        StreamEvent {
            streamer_id: "nova".to_string(),
            display_name: "Nova".to_string(),
            is_live,
            title: "Ranked queue".to_string(),
            game_name: None,
            viewer_count: 120,
            thumbnail_ref: None,
            started_at: None,
            observed_at: Utc::now(),
        }
    }

    fn manager(transport: Arc<HangingEdits>) -> (Arc<NotificationHistory>, LifecycleManager) {
        let history = Arc::new(NotificationHistory::new(Arc::new(MemoryStateStore::new())));
        let manager = LifecycleManager::new(
            history.clone(),
            transport,
            Arc::new(NotificationRateLimiter::default()),
            Arc::new(MentionResolver::new(Arc::new(NoRoles), MentionConfig::new())),
            Arc::new(NotifierStats::default()),
            Duration::from_millis(50),
        );
        (history, manager)
    }

    #[tokio::test]
    async fn test_cannot_post_is_permission_denied_without_calls() {
        let transport = Arc::new(HangingEdits::default());
        let (history, manager) = manager(transport.clone());
        let blocked = destination("chanA", false);

        let report = manager.reconcile(&event(true), &[blocked.clone()], Utc::now()).await;

        assert_eq!(report.count(DestinationOutcome::PermissionDenied), 1);
        assert!(report.is_failed(&blocked));
        assert_eq!(transport.sends.load(Ordering::SeqCst), 0);
        assert!(history.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_call_timeout_leaves_record_untouched() {
        let transport = Arc::new(HangingEdits::default());
        let (history, manager) = manager(transport.clone());
        let dest = destination("chanA", true);
        let now = Utc::now();

        let report = manager.reconcile(&event(true), &[dest.clone()], now).await;
        assert_eq!(report.outcome_for("G1", "chanA"), Some(DestinationOutcome::Created));
        let before = history.load().await.unwrap();

        let later = now + chrono::Duration::seconds(10);
        let report = manager.reconcile(&event(true), &[dest], later).await;
        assert_eq!(report.outcome_for("G1", "chanA"), Some(DestinationOutcome::Failed));
        assert!(report.failed_this_pass.is_empty());
        assert_eq!(history.load().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_duplicate_destinations_processed_once() {
        let transport = Arc::new(HangingEdits::default());
        let (_history, manager) = manager(transport.clone());
        let dest = destination("chanA", true);

        let report = manager
            .reconcile(&event(true), &[dest.clone(), dest], Utc::now())
            .await;

        assert_eq!(report.destinations.len(), 1);
        assert_eq!(transport.sends.load(Ordering::SeqCst), 1);
    }
}
