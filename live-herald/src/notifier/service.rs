//! The stream notifier service.
//!
//! Owns every piece of engine state (debounce map, presence, per-streamer
//! locks, rate limiter, history handle) and wires one pass:
//! debounce, presence update, fresh destination snapshot, reconcile, sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::debounce::{DEFAULT_DEBOUNCE_SECS, DebounceGate};
use super::gc::{DEFAULT_RETENTION_HOURS, HistorySweeper, SweepReport};
use super::lifecycle::{DEFAULT_TRANSPORT_TIMEOUT, LifecycleManager, PassReport};
use super::locks::StreamerLocks;
use super::mention::{MentionConfig, MentionResolver};
use super::presence::{DEFAULT_PRESENCE_REFRESH, PresenceOfflinePolicy, PresenceTracker};
use super::rate_limiter::{
    DEFAULT_MAX_PER_WINDOW, DEFAULT_WINDOW_SECS, NotificationRateLimiter, RateLimitConfig,
};
use super::stats::{NotifierStats, NotifierStatsSnapshot};
use crate::domain::{DestinationQuery, StreamEvent};
use crate::store::{NotificationHistory, StateStore};
use crate::transport::{DestinationDirectory, MessageTransport, PresenceSink, RoleDirectory};
use crate::{Error, Result};

/// Configuration for the notifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Debounce window for live events in seconds.
    pub debounce_secs: u64,
    /// Rolling window of the creation rate limit in seconds.
    pub rate_limit_window_secs: u64,
    /// New notifications allowed per group per window.
    pub rate_limit_max_new: usize,
    /// Records idle this long are evicted.
    pub retention_hours: u64,
    /// Interval of the background history sweep in seconds.
    pub sweep_interval_secs: u64,
    /// Interval of the presence indicator refresh in seconds.
    pub presence_refresh_secs: u64,
    /// Bound on each transport call in seconds.
    pub transport_timeout_secs: u64,
    pub presence_offline: PresenceOfflinePolicy,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            debounce_secs: DEFAULT_DEBOUNCE_SECS,
            rate_limit_window_secs: DEFAULT_WINDOW_SECS,
            rate_limit_max_new: DEFAULT_MAX_PER_WINDOW,
            retention_hours: DEFAULT_RETENTION_HOURS,
            sweep_interval_secs: 600,
            presence_refresh_secs: DEFAULT_PRESENCE_REFRESH.as_secs(),
            transport_timeout_secs: DEFAULT_TRANSPORT_TIMEOUT.as_secs(),
            presence_offline: PresenceOfflinePolicy::default(),
        }
    }
}

impl NotifierConfig {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("debounce_secs", self.debounce_secs),
            ("rate_limit_window_secs", self.rate_limit_window_secs),
            ("rate_limit_max_new", self.rate_limit_max_new as u64),
            ("retention_hours", self.retention_hours),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("presence_refresh_secs", self.presence_refresh_secs),
            ("transport_timeout_secs", self.transport_timeout_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::config(format!("notifier.{name} must be greater than 0")));
            }
        }
        Ok(())
    }

    fn seconds(value: u64) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1000))
    }
}

/// Collaborators injected into the notifier.
pub struct NotifierDeps {
    pub store: Arc<dyn StateStore>,
    pub transport: Arc<dyn MessageTransport>,
    pub directory: Arc<dyn DestinationDirectory>,
    pub roles: Arc<dyn RoleDirectory>,
    pub presence: Arc<dyn PresenceSink>,
}

pub struct StreamNotifier {
    config: NotifierConfig,
    query: DestinationQuery,
    directory: Arc<dyn DestinationDirectory>,
    debounce: DebounceGate,
    presence: Arc<PresenceTracker>,
    locks: Arc<StreamerLocks>,
    history: Arc<NotificationHistory>,
    mentions: Arc<MentionResolver>,
    lifecycle: LifecycleManager,
    sweeper: HistorySweeper,
    stats: Arc<NotifierStats>,
    /// Per-streamer event queues; keeps each streamer's events in order.
    workers: DashMap<String, mpsc::UnboundedSender<StreamEvent>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancellation_token: CancellationToken,
}

impl StreamNotifier {
    pub fn new(
        config: NotifierConfig,
        query: DestinationQuery,
        mentions: MentionConfig,
        deps: NotifierDeps,
    ) -> Self {
        let history = Arc::new(NotificationHistory::new(deps.store));
        let locks = Arc::new(StreamerLocks::new());
        let stats = Arc::new(NotifierStats::default());
        let mentions = Arc::new(MentionResolver::new(deps.roles, mentions));
        let limiter = Arc::new(NotificationRateLimiter::new(RateLimitConfig {
            window: NotifierConfig::seconds(config.rate_limit_window_secs),
            max_per_window: config.rate_limit_max_new,
        }));

        let lifecycle = LifecycleManager::new(
            history.clone(),
            deps.transport,
            limiter,
            mentions.clone(),
            stats.clone(),
            Duration::from_secs(config.transport_timeout_secs),
        );
        let sweeper = HistorySweeper::new(
            history.clone(),
            locks.clone(),
            NotifierConfig::seconds(config.retention_hours.saturating_mul(3600)),
        );

        Self {
            debounce: DebounceGate::new(NotifierConfig::seconds(config.debounce_secs)),
            presence: Arc::new(PresenceTracker::new(deps.presence, config.presence_offline)),
            directory: deps.directory,
            query,
            locks,
            history,
            mentions,
            lifecycle,
            sweeper,
            stats,
            workers: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
            cancellation_token: CancellationToken::new(),
            config,
        }
    }

    pub fn config(&self) -> &NotifierConfig {
        &self.config
    }

    pub fn history(&self) -> &Arc<NotificationHistory> {
        &self.history
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn stats(&self) -> NotifierStatsSnapshot {
        self.stats.snapshot()
    }

    /// Replace the mention configuration at runtime.
    pub fn set_mention_config(&self, config: MentionConfig) {
        self.mentions.set_config(config);
        info!("Mention configuration updated");
    }

    /// Run one pass for `event` at the current time.
    pub async fn handle_event(&self, event: &StreamEvent) -> Result<Option<PassReport>> {
        self.process_at(event, Utc::now()).await
    }

    /// Run one pass for `event` as of `now`.
    ///
    /// Returns `None` when the event was debounced. Only live events are
    /// debounced; offline events are terminal and always processed. The gate
    /// compares observation times, not processing times.
    pub async fn process_at(
        &self,
        event: &StreamEvent,
        now: DateTime<Utc>,
    ) -> Result<Option<PassReport>> {
        if event.is_live && !self.debounce.accept(&event.streamer_id, event.observed_at) {
            self.stats.record_debounced();
            debug!(streamer = %event.streamer_id, "Debounced live event");
            return Ok(None);
        }

        if event.is_live {
            self.presence.set_online(&event.streamer_id, event).await;
        } else {
            self.presence.set_offline(&event.streamer_id).await;
        }

        let report = {
            let _guard = self.locks.lock(&event.streamer_id).await;

            let destinations = self.directory.list_destinations(&self.query).await?;
            if destinations.is_empty() {
                debug!(streamer = %event.streamer_id, "No destinations to announce to");
            }

            let report = self.lifecycle.reconcile(event, &destinations, now).await;
            self.stats.record_pass();
            report
        };

        info!(
            streamer = %report.streamer_id,
            live = report.is_live,
            destinations = report.destinations.len(),
            failed = report.failed_this_pass.len(),
            "Pass complete"
        );

        if let Err(e) = self.sweep(now).await {
            warn!(error = %e, "History sweep after pass failed");
        }

        Ok(Some(report))
    }

    /// Evict expired records and drop stale process-local state.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let report = self.sweeper.sweep(now).await?;
        self.stats.record_swept(report.removed.len());
        self.debounce.purge_expired(now);
        self.locks.prune();
        Ok(report)
    }

    /// Start the event listener and background timers.
    pub fn start(self: &Arc<Self>, rx: broadcast::Receiver<StreamEvent>) {
        let mut tasks = self.tasks.lock();
        tasks.push(self.listen_for_stream_events(rx));
        tasks.push(self.spawn_sweep_timer());
        tasks.push(self.presence.spawn_refresh_timer(
            Duration::from_secs(self.config.presence_refresh_secs),
            self.cancellation_token.child_token(),
        ));
        info!("Stream notifier started");
    }

    /// Stop all background tasks and wait for them to finish.
    pub async fn stop(&self) {
        self.cancellation_token.cancel();
        self.workers.clear();

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!("Notifier task ended abnormally: {}", e);
            }
        }
        info!("Stream notifier stopped");
    }

    fn listen_for_stream_events(
        self: &Arc<Self>,
        mut rx: broadcast::Receiver<StreamEvent>,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let cancellation_token = self.cancellation_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        debug!("Stream event listener shutting down");
                        break;
                    }
                    result = rx.recv() => {
                        match result {
                            Ok(event) => service.dispatch(event),
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!("Stream event listener lagged by {} events", n);
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                debug!("Stream event channel closed");
                                break;
                            }
                        }
                    }
                }
            }
        })
    }

    /// Queue `event` on its streamer's worker, spawning the worker if needed.
    fn dispatch(self: &Arc<Self>, event: StreamEvent) {
        let streamer_id = event.streamer_id.clone();
        let mut event = Some(event);

        if let Some(sender) = self.workers.get(&streamer_id)
            && let Some(pending) = event.take()
            && let Err(mpsc::error::SendError(returned)) = sender.send(pending)
        {
            event = Some(returned);
        }

        let Some(event) = event else {
            return;
        };

        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(event).is_err() {
            return;
        }
        self.workers.insert(streamer_id.clone(), tx);

        let handle = self.spawn_worker(streamer_id, rx);
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    fn spawn_worker(
        self: &Arc<Self>,
        streamer_id: String,
        mut rx: mpsc::UnboundedReceiver<StreamEvent>,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let cancellation_token = self.cancellation_token.clone();

        tokio::spawn(async move {
            debug!(streamer = %streamer_id, "Stream worker started");
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    next = rx.recv() => {
                        let Some(event) = next else { break };
                        if let Err(e) = service.handle_event(&event).await {
                            error!(
                                streamer = %event.streamer_id,
                                error = %e,
                                "Failed to process stream event"
                            );
                        }
                    }
                }
            }
            debug!(streamer = %streamer_id, "Stream worker stopped");
        })
    }

    fn spawn_sweep_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let cancellation_token = self.cancellation_token.clone();
        let interval = Duration::from_secs(self.config.sweep_interval_secs);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; sweep leftovers from a previous run.
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        debug!("History sweep timer shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = service.sweep(Utc::now()).await {
                            warn!(error = %e, "Scheduled history sweep failed");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notifier_config_default() {
        let config = NotifierConfig::default();
        assert_eq!(config.debounce_secs, 60);
        assert_eq!(config.rate_limit_window_secs, 60);
        assert_eq!(config.rate_limit_max_new, 5);
        assert_eq!(config.retention_hours, 24);
        assert_eq!(config.presence_refresh_secs, 300);
        assert_eq!(config.presence_offline, PresenceOfflinePolicy::RemoveStreamer);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_notifier_config_rejects_zero() {
        let config = NotifierConfig {
            rate_limit_max_new: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_notifier_config_partial_json() {
        let config: NotifierConfig =
            serde_json::from_str(r#"{"debounce_secs": 30, "presence_offline": "clear_all"}"#)
                .unwrap();
        assert_eq!(config.debounce_secs, 30);
        assert_eq!(config.presence_offline, PresenceOfflinePolicy::ClearAll);
        assert_eq!(config.retention_hours, 24);
    }
}
