//! Durable key/value state.
//!
//! The engine persists its working set as whole JSON values under a handful of
//! keys. Stores only need get/put with whole-value replacement semantics; the
//! read-modify-write discipline lives in [`NotificationHistory`].

pub mod history;
pub mod sqlite;

pub use history::{HISTORY_KEY, HistoryMap, NotificationHistory};
pub use sqlite::SqliteStateStore;

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::Result;

/// Key/value persistence used by the engine.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Replace the value stored under `key`.
    async fn put(&self, key: &str, value: Value) -> Result<()>;
}

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    values: RwLock<HashMap<String, Value>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.values.write().insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_replaces_whole_value() {
        let store = MemoryStateStore::new();
        assert!(store.get("history").await.unwrap().is_none());

        store.put("history", json!({"a": 1, "b": 2})).await.unwrap();
        store.put("history", json!({"c": 3})).await.unwrap();

        assert_eq!(store.get("history").await.unwrap(), Some(json!({"c": 3})));
        assert_eq!(store.len(), 1);
    }
}
