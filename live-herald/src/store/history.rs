//! Persisted notification history.
//!
//! All records live under one [`StateStore`] key as a JSON object keyed by
//! [`RecordKey::to_storage_key`]. Every mutation is a full read-modify-write
//! cycle performed under a single writer lock, so concurrent passes never
//! lose each other's updates.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::StateStore;
use crate::domain::{NotificationRecord, RecordKey};
use crate::{Error, Result};

/// State Store key holding the record map.
pub const HISTORY_KEY: &str = "history";

/// In-memory view of the persisted record map.
pub type HistoryMap = BTreeMap<RecordKey, NotificationRecord>;

/// Keyed access to notification records.
pub struct NotificationHistory {
    store: Arc<dyn StateStore>,
    write_lock: Mutex<()>,
}

impl NotificationHistory {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Load the full record map.
    ///
    /// Entries with an unparseable key or body, and entries without a message
    /// reference, are dropped with a warning.
    pub async fn load(&self) -> Result<HistoryMap> {
        let Some(value) = self.store.get(HISTORY_KEY).await? else {
            return Ok(HistoryMap::new());
        };

        let Value::Object(entries) = value else {
            return Err(Error::store(format!(
                "value under '{HISTORY_KEY}' is not an object"
            )));
        };

        let mut map = HistoryMap::new();
        for (raw_key, raw_record) in entries {
            let Some(key) = RecordKey::from_storage_key(&raw_key) else {
                warn!(key = %raw_key, "Dropping history entry with malformed key");
                continue;
            };
            let record: NotificationRecord = match serde_json::from_value(raw_record) {
                Ok(record) => record,
                Err(e) => {
                    warn!(key = %raw_key, error = %e, "Dropping undecodable history entry");
                    continue;
                }
            };
            if !record.is_meaningful() {
                debug!(key = %raw_key, "Dropping history entry without message reference");
                continue;
            }
            map.insert(key, record);
        }

        Ok(map)
    }

    pub async fn get(&self, key: &RecordKey) -> Result<Option<NotificationRecord>> {
        Ok(self.load().await?.remove(key))
    }

    /// Insert or replace one record.
    pub async fn upsert(&self, key: RecordKey, record: NotificationRecord) -> Result<()> {
        self.modify(|map| {
            map.insert(key, record);
            true
        })
        .await
        .map(|_| ())
    }

    /// Delete one record. Returns whether it existed.
    pub async fn remove(&self, key: &RecordKey) -> Result<bool> {
        self.modify(|map| map.remove(key).is_some()).await
    }

    /// Keep only the records matching `keep`, persisting with a single write.
    ///
    /// Returns the removed keys. Nothing is written when nothing was removed.
    pub async fn retain<F>(&self, mut keep: F) -> Result<Vec<RecordKey>>
    where
        F: FnMut(&RecordKey, &NotificationRecord) -> bool,
    {
        let _guard = self.write_lock.lock().await;
        let mut map = self.load().await?;

        let removed: Vec<RecordKey> = map
            .iter()
            .filter(|&(key, record)| !keep(key, record))
            .map(|(key, _)| key.clone())
            .collect();

        if removed.is_empty() {
            return Ok(removed);
        }

        for key in &removed {
            map.remove(key);
        }
        self.save(&map).await?;
        Ok(removed)
    }

    /// Number of the group's records created at or after `since`.
    pub async fn count_created_since(&self, group_id: &str, since: DateTime<Utc>) -> Result<usize> {
        Ok(self
            .load()
            .await?
            .iter()
            .filter(|(key, record)| key.group_id == group_id && record.created_at >= since)
            .count())
    }

    /// Run one read-modify-write cycle. `f` returns whether the map changed.
    async fn modify<F>(&self, f: F) -> Result<bool>
    where
        F: FnOnce(&mut HistoryMap) -> bool,
    {
        let _guard = self.write_lock.lock().await;
        let mut map = self.load().await?;
        let changed = f(&mut map);
        if changed {
            self.save(&map).await?;
        }
        Ok(changed)
    }

    async fn save(&self, map: &HistoryMap) -> Result<()> {
        let mut entries = Map::with_capacity(map.len());
        for (key, record) in map {
            entries.insert(key.to_storage_key(), serde_json::to_value(record)?);
        }
        self.store.put(HISTORY_KEY, Value::Object(entries)).await
    }
}
