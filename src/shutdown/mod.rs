//! Graceful shutdown.
//!
//! On shutdown the service:
//! 1. Notifies every connected client with a `shutdown` frame
//! 2. Signals background tasks and connection tasks to stop
//! 3. Waits for connections to close through their normal lifecycle
//! 4. Tears down whatever is left in the registry through the coordinator

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::config::ShutdownSettings;
use crate::connection_manager::ConnectionRegistry;
use crate::presence::PresenceHub;
use crate::websocket::ServerMessage;

/// Per-connection limit for delivering the shutdown notice
const NOTIFY_SEND_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for clients to be notified (default: 5 seconds)
    pub client_notification_timeout: Duration,
    /// Time to wait for connections to close (default: 10 seconds)
    pub drain_timeout: Duration,
    /// Suggested reconnect delay sent to clients (default: 5 seconds)
    pub reconnect_after_seconds: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self::from(&ShutdownSettings::default())
    }
}

impl From<&ShutdownSettings> for ShutdownConfig {
    fn from(settings: &ShutdownSettings) -> Self {
        Self {
            client_notification_timeout: Duration::from_secs(
                settings.client_notification_timeout_secs,
            ),
            drain_timeout: Duration::from_secs(settings.drain_timeout_secs),
            reconnect_after_seconds: settings.reconnect_after_seconds,
        }
    }
}

pub struct GracefulShutdown {
    hub: PresenceHub,
    registry: Arc<ConnectionRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(
        hub: PresenceHub,
        registry: Arc<ConnectionRegistry>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self::with_config(hub, registry, shutdown_tx, ShutdownConfig::default())
    }

    pub fn with_config(
        hub: PresenceHub,
        registry: Arc<ConnectionRegistry>,
        shutdown_tx: broadcast::Sender<()>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            hub,
            registry,
            shutdown_tx,
            config,
        }
    }

    /// Run the shutdown sequence
    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(total_connections = self.registry.stats().total_connections)
    )]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Notifying clients");
        result.clients_notified = self.notify_clients(reason).await;

        tracing::info!("Phase 2: Signaling tasks to stop");
        let _ = self.shutdown_tx.send(());

        tracing::info!("Phase 3: Waiting for connections to close");
        result.connections_closed = self.wait_for_connections_to_close().await;

        tracing::info!("Phase 4: Tearing down registry");
        result.connections_torn_down = match self.hub.teardown().await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(error = %e, "Presence coordinator unavailable, clearing registry directly");
                self.registry.clear()
            }
        };

        result.duration = start.elapsed();
        result.success = true;

        tracing::info!(
            clients_notified = result.clients_notified,
            connections_closed = result.connections_closed,
            connections_torn_down = result.connections_torn_down,
            duration_ms = result.duration.as_millis(),
            "Graceful shutdown completed"
        );

        result
    }

    async fn notify_clients(&self, reason: &str) -> usize {
        let connections = self.registry.all_connections();
        let total = connections.len();

        if total == 0 {
            return 0;
        }

        let message = ServerMessage::shutdown(reason, Some(self.config.reconnect_after_seconds));
        let mut futures = FuturesUnordered::new();
        let mut notified = 0;

        for conn in connections {
            let msg = message.clone();
            futures.push(async move {
                match timeout(NOTIFY_SEND_TIMEOUT, conn.send(msg)).await {
                    Ok(Ok(_)) => true,
                    Ok(Err(_)) => {
                        tracing::debug!(connection_id = %conn.id, "Connection gone before shutdown notice");
                        false
                    }
                    Err(_) => {
                        tracing::debug!(connection_id = %conn.id, "Timeout sending shutdown notification");
                        false
                    }
                }
            });
        }

        let notify_future = async {
            while let Some(success) = futures.next().await {
                if success {
                    notified += 1;
                }
            }
        };

        let _ = timeout(self.config.client_notification_timeout, notify_future).await;

        tracing::info!(notified = notified, total = total, "Shutdown notifications sent");

        notified
    }

    async fn wait_for_connections_to_close(&self) -> usize {
        let initial = self.registry.stats().total_connections;
        if initial == 0 {
            return 0;
        }

        let wait_future = async {
            while self.registry.stats().total_connections > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };

        let _ = timeout(self.config.drain_timeout, wait_future).await;

        let remaining = self.registry.stats().total_connections;
        if remaining > 0 {
            tracing::warn!(
                remaining_connections = remaining,
                "Some connections did not close gracefully"
            );
        }

        initial.saturating_sub(remaining)
    }
}

#[derive(Debug, Default)]
pub struct ShutdownResult {
    pub success: bool,
    /// Clients that received the shutdown notice
    pub clients_notified: usize,
    /// Connections that closed on their own before the drain timeout
    pub connections_closed: usize,
    /// Connections still registered after the drain and removed by teardown
    pub connections_torn_down: usize,
    pub duration: Duration,
}
