//! Persisted notification records and their identity.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Separator between key components in the persisted form.
const KEY_SEPARATOR: char = '_';

/// Opaque reference to a message created by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageRef(pub String);

impl MessageRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a notification record: one per (group, destination, streamer).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub group_id: String,
    pub destination_id: String,
    pub streamer_id: String,
}

impl RecordKey {
    pub fn new(
        group_id: impl Into<String>,
        destination_id: impl Into<String>,
        streamer_id: impl Into<String>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            destination_id: destination_id.into(),
            streamer_id: streamer_id.into(),
        }
    }

    /// Canonical persisted form: `group_destination_streamer`.
    ///
    /// `%` and `_` inside a component are percent-escaped so the separator is
    /// unambiguous.
    pub fn to_storage_key(&self) -> String {
        let mut out = String::with_capacity(
            self.group_id.len() + self.destination_id.len() + self.streamer_id.len() + 2,
        );
        escape_into(&mut out, &self.group_id);
        out.push(KEY_SEPARATOR);
        escape_into(&mut out, &self.destination_id);
        out.push(KEY_SEPARATOR);
        escape_into(&mut out, &self.streamer_id);
        out
    }

    /// Parse a key produced by [`RecordKey::to_storage_key`].
    pub fn from_storage_key(raw: &str) -> Option<Self> {
        let mut parts = raw.split(KEY_SEPARATOR);
        let group_id = unescape(parts.next()?)?;
        let destination_id = unescape(parts.next()?)?;
        let streamer_id = unescape(parts.next()?)?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            group_id,
            destination_id,
            streamer_id,
        })
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_storage_key())
    }
}

fn escape_into(out: &mut String, component: &str) {
    for c in component.chars() {
        match c {
            '%' => out.push_str("%25"),
            KEY_SEPARATOR => out.push_str("%5F"),
            other => out.push(other),
        }
    }
}

fn unescape(component: &str) -> Option<String> {
    let mut out = String::with_capacity(component.len());
    let mut chars = component.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let hi = chars.next()?;
        let lo = chars.next()?;
        match (hi, lo.to_ascii_uppercase()) {
            ('2', '5') => out.push('%'),
            ('5', 'F') => out.push(KEY_SEPARATOR),
            _ => return None,
        }
    }
    Some(out)
}

/// Lifecycle state of an existing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Announcement is live and kept up to date.
    Active,
    /// Terminal edit done; only waiting for eviction.
    Retiring,
}

/// Persisted reconciliation state for one destination and one streamer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub message_ref: Option<MessageRef>,
    #[serde(default)]
    pub is_offline: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl NotificationRecord {
    /// Record for a freshly sent announcement.
    pub fn active(message_ref: MessageRef, now: DateTime<Utc>) -> Self {
        Self {
            message_ref: Some(message_ref),
            is_offline: false,
            created_at: now,
            last_updated_at: Some(now),
        }
    }

    pub fn state(&self) -> RecordState {
        if self.is_offline {
            RecordState::Retiring
        } else {
            RecordState::Active
        }
    }

    /// Records without a message reference carry no information.
    pub fn is_meaningful(&self) -> bool {
        self.message_ref.is_some()
    }

    /// Refresh after a successful live edit.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_updated_at = Some(now);
    }

    /// Mark the terminal "stream ended" edit as done.
    pub fn retire(&mut self, now: DateTime<Utc>) {
        self.is_offline = true;
        self.last_updated_at = Some(now);
    }

    /// Timestamp used for retention decisions.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_updated_at.unwrap_or(self.created_at)
    }
}
