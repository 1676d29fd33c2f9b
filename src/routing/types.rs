use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::connection_manager::UserIdentity;

/// A newly persisted chat message ready for live delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub sender_id: UserIdentity,
    pub chat_id: String,
    pub recipient_ids: HashSet<UserIdentity>,
    pub payload: serde_json::Value,
}

impl OutboundMessage {
    pub fn new(
        sender_id: impl Into<UserIdentity>,
        chat_id: impl Into<String>,
        recipient_ids: impl IntoIterator<Item = UserIdentity>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            recipient_ids: recipient_ids.into_iter().collect(),
            payload,
        }
    }
}

/// Result of routing one message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteReport {
    /// Connections the message was handed to
    pub delivered: usize,
    /// Connections whose writer was gone
    pub failed: usize,
    /// Recipients with no live connection
    pub offline_recipients: usize,
}

/// Statistics for the message router
#[derive(Debug, Default)]
pub struct RouterStats {
    pub messages_routed: AtomicU64,
    pub deliveries: AtomicU64,
    pub failures: AtomicU64,
    pub offline_recipients: AtomicU64,
}

impl RouterStats {
    pub fn record(&self, report: &RouteReport) {
        self.messages_routed.fetch_add(1, Ordering::Relaxed);
        self.deliveries
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.failures.fetch_add(report.failed as u64, Ordering::Relaxed);
        self.offline_recipients
            .fetch_add(report.offline_recipients as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            messages_routed: self.messages_routed.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            offline_recipients: self.offline_recipients.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of router statistics
#[derive(Debug, Clone, Serialize)]
pub struct RouterStatsSnapshot {
    pub messages_routed: u64,
    pub deliveries: u64,
    pub failures: u64,
    pub offline_recipients: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outbound_message_wire_names() {
        let msg: OutboundMessage = serde_json::from_value(json!({
            "senderId": "alice",
            "chatId": "c1",
            "recipientIds": ["bob", "bob"],
            "payload": {"content": "hi"}
        }))
        .unwrap();
        assert_eq!(msg.recipient_ids.len(), 1);
        assert_eq!(msg.sender_id, "alice");
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = RouterStats::default();
        stats.record(&RouteReport {
            delivered: 2,
            failed: 1,
            offline_recipients: 3,
        });
        stats.record(&RouteReport::default());

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.messages_routed, 2);
        assert_eq!(snapshot.deliveries, 2);
        assert_eq!(snapshot.failures, 1);
        assert_eq!(snapshot.offline_recipients, 3);
    }
}
