//! Announcement destinations.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// An addressable place notifications can be sent to.
///
/// Supplied fresh for every pass; permissions can change at any time, so
/// destinations are never cached beyond one pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Server / guild the destination belongs to.
    pub group_id: String,
    /// Channel identifier inside the group.
    pub destination_id: String,
    pub display_name: String,
    pub can_post: bool,
}

/// Filter passed to destination discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestinationQuery {
    /// Name of the announcement channel to look for in every group.
    pub channel_name: String,
    /// Restrict discovery to these groups. `None` means every joined group.
    pub group_ids: Option<HashSet<String>>,
}

impl DestinationQuery {
    pub fn for_channel(channel_name: impl Into<String>) -> Self {
        Self {
            channel_name: channel_name.into(),
            group_ids: None,
        }
    }

    /// Whether a group passes the optional group filter.
    pub fn includes_group(&self, group_id: &str) -> bool {
        self.group_ids
            .as_ref()
            .is_none_or(|groups| groups.contains(group_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_group_filter() {
        let open = DestinationQuery::for_channel("live");
        assert!(open.includes_group("G1"));

        let restricted = DestinationQuery {
            channel_name: "live".to_string(),
            group_ids: Some(HashSet::from(["G1".to_string()])),
        };
        assert!(restricted.includes_group("G1"));
        assert!(!restricted.includes_group("G2"));
    }
}
