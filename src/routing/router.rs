use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use thiserror::Error;

use crate::connection_manager::{ConnectionHandle, ConnectionRegistry};
use crate::metrics::RoutingMetrics;
use crate::websocket::{MessageDelivery, OutboundFrame, ServerMessage};

use super::{ChatDirectory, DirectoryError, OutboundMessage, RouteReport, RouterStats, RouterStatsSnapshot};

/// Maximum number of concurrent message sends
const MAX_CONCURRENT_SENDS: usize = 100;

/// Threshold for using pre-serialization
const PRESERIALIZATION_THRESHOLD: usize = 4;

/// How long one connection may hold up a delivery waiting for buffer space
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("Chat not found: {0}")]
    ChatNotFound(String),

    #[error("User {user_id} is not a participant of chat {chat_id}")]
    NotAParticipant { chat_id: String, user_id: String },

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// Delivers new chat messages to the live connections of their recipients
pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    directory: Arc<dyn ChatDirectory>,
    stats: RouterStats,
    send_timeout: Duration,
}

impl MessageRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, directory: Arc<dyn ChatDirectory>) -> Self {
        Self {
            registry,
            directory,
            stats: RouterStats::default(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn stats(&self) -> RouterStatsSnapshot {
        self.stats.snapshot()
    }

    /// Resolve a chat's participants and route the message to everyone but the sender
    #[tracing::instrument(
        name = "router.route_chat_message",
        skip(self, payload),
        fields(sender_id = %sender_id, chat_id = %chat_id)
    )]
    pub async fn route_chat_message(
        &self,
        sender_id: &str,
        chat_id: &str,
        payload: serde_json::Value,
    ) -> Result<RouteReport, RouteError> {
        let participants = self
            .directory
            .participants(chat_id)
            .await?
            .ok_or_else(|| RouteError::ChatNotFound(chat_id.to_string()))?;

        if !participants.contains(sender_id) {
            return Err(RouteError::NotAParticipant {
                chat_id: chat_id.to_string(),
                user_id: sender_id.to_string(),
            });
        }

        let message = OutboundMessage::new(sender_id, chat_id, participants, payload);
        Ok(self.route(message).await)
    }

    /// Deliver a message to every live connection of every recipient.
    ///
    /// Offline recipients are skipped. Handles are copied out of the registry
    /// before any send, so delivery never holds the registry lock. Never fails.
    #[tracing::instrument(
        name = "router.route",
        skip(self, message),
        fields(
            sender_id = %message.sender_id,
            chat_id = %message.chat_id,
            recipient_count = message.recipient_ids.len()
        )
    )]
    pub async fn route(&self, message: OutboundMessage) -> RouteReport {
        let OutboundMessage {
            sender_id,
            chat_id,
            recipient_ids,
            payload,
        } = message;

        let mut seen = HashSet::new();
        let mut connections: Vec<Arc<ConnectionHandle>> = Vec::new();
        let mut offline_recipients = 0;

        for recipient in recipient_ids.iter().filter(|r| **r != sender_id) {
            let handles = self.registry.connections_for(recipient);
            if handles.is_empty() {
                offline_recipients += 1;
                tracing::debug!(recipient_id = %recipient, "Recipient offline, live delivery skipped");
                continue;
            }
            connections.extend(handles.into_iter().filter(|h| seen.insert(h.id)));
        }

        let message = ServerMessage::MessageReceived(MessageDelivery {
            sender_id,
            chat_id,
            payload,
        });
        let (delivered, failed) = send_to_connections(&connections, message, self.send_timeout).await;

        let report = RouteReport {
            delivered,
            failed,
            offline_recipients,
        };

        self.stats.record(&report);
        RoutingMetrics::record_routed(delivered as u64, failed as u64, offline_recipients as u64);

        tracing::debug!(
            delivered = delivered,
            failed = failed,
            offline_recipients = offline_recipients,
            "Message routed"
        );

        report
    }
}

/// Send to a list of connections with bounded concurrency. A connection
/// whose buffer stays full past `send_timeout` counts as failed.
/// Returns (delivered, failed).
async fn send_to_connections(
    connections: &[Arc<ConnectionHandle>],
    message: ServerMessage,
    send_timeout: Duration,
) -> (usize, usize) {
    if connections.is_empty() {
        return (0, 0);
    }

    let frame = if connections.len() >= PRESERIALIZATION_THRESHOLD {
        match OutboundFrame::preserialized(&message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "Failed to pre-serialize message, falling back to per-connection serialization");
                OutboundFrame::Raw(message)
            }
        }
    } else {
        OutboundFrame::Raw(message)
    };

    let results: Vec<bool> = stream::iter(connections.iter().cloned())
        .map(|conn| {
            let frame = frame.clone();
            async move {
                match tokio::time::timeout(send_timeout, conn.send_frame(frame)).await {
                    Ok(Ok(())) => true,
                    Ok(Err(_)) => {
                        tracing::debug!(
                            connection_id = %conn.id,
                            user_id = %conn.user_id,
                            "Connection closed before message delivery"
                        );
                        false
                    }
                    Err(_) => {
                        tracing::debug!(
                            connection_id = %conn.id,
                            user_id = %conn.user_id,
                            timeout_ms = send_timeout.as_millis() as u64,
                            "Message send timed out"
                        );
                        false
                    }
                }
            }
        })
        .buffer_unordered(MAX_CONCURRENT_SENDS)
        .collect()
        .await;

    let delivered = results.iter().filter(|ok| **ok).count();
    (delivered, results.len() - delivered)
}
