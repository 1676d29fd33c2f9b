use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::connection_manager::{ConnectionRegistry, PresenceDelivery};
use crate::metrics::PresenceMetrics;
use crate::websocket::{OutboundFrame, ServerMessage};

/// Outcome of one presence announcement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AnnounceReport {
    /// Users in the announced snapshot
    pub online: usize,
    /// Connections the update was handed to
    pub delivered: usize,
    /// Of those delivered, connections whose buffer was full and got the
    /// update parked in their presence slot instead
    pub parked: usize,
    /// Connections whose writer was already gone
    pub failed: usize,
}

/// Pushes the current online set to every connected client
pub struct PresenceBroadcaster {
    registry: Arc<ConnectionRegistry>,
    next_seq: AtomicU64,
}

impl PresenceBroadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Announce the current presence snapshot to all connections.
    ///
    /// The snapshot and the recipient list come from one registry lock, and
    /// every recipient gets the same serialized frame. Sends never wait: a
    /// full buffer parks the frame in the connection's presence slot, where
    /// it replaces any older snapshot. Only a closed connection fails.
    #[tracing::instrument(name = "presence.announce", skip(self))]
    pub fn announce(&self) -> AnnounceReport {
        let view = self.registry.presence_view();
        let online = view.snapshot.len();
        let message = ServerMessage::PresenceUpdate(view.snapshot);

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = match serde_json::to_string(&message) {
            Ok(text) => OutboundFrame::presence(seq, Arc::from(text)),
            Err(e) => {
                tracing::error!(error = %e, "Failed to pre-serialize presence update");
                OutboundFrame::Raw(message)
            }
        };

        let mut delivered = 0;
        let mut parked = 0;
        let mut failed = 0;

        for conn in &view.connections {
            match conn.offer_presence(frame.clone()) {
                PresenceDelivery::Queued => delivered += 1,
                PresenceDelivery::Parked => {
                    delivered += 1;
                    parked += 1;
                    tracing::debug!(
                        connection_id = %conn.id,
                        user_id = %conn.user_id,
                        seq = seq,
                        "Outbound buffer full, presence update parked"
                    );
                }
                PresenceDelivery::Closed => {
                    failed += 1;
                    tracing::debug!(
                        connection_id = %conn.id,
                        "Connection closed before presence update"
                    );
                }
            }
        }

        PresenceMetrics::record_announce(delivered as u64, parked as u64, failed as u64);

        tracing::debug!(
            online = online,
            delivered = delivered,
            parked = parked,
            failed = failed,
            "Presence announced"
        );

        AnnounceReport {
            online,
            delivered,
            parked,
            failed,
        }
    }
}
