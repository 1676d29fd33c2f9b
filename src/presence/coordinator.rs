//! Single task that serializes every connection open/close.
//!
//! Lifecycle events arrive over a channel and are applied one at a time:
//! registry mutation first, then the presence announcement, so two
//! announcements never interleave and each reflects exactly one change.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::connection_manager::{ConnectionHandle, ConnectionId, ConnectionRegistry};
use crate::metrics::ConnectionMetrics;

use super::{AnnounceReport, PresenceBroadcaster};

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("Presence coordinator is not running")]
    CoordinatorUnavailable,
}

enum PresenceCommand {
    Open {
        handle: Arc<ConnectionHandle>,
        reply: oneshot::Sender<AnnounceReport>,
    },
    Close {
        connection_id: ConnectionId,
        reply: oneshot::Sender<Option<AnnounceReport>>,
    },
    Teardown {
        reply: oneshot::Sender<usize>,
    },
}

/// Cloneable entry point to the presence coordinator task
#[derive(Clone)]
pub struct PresenceHub {
    tx: mpsc::Sender<PresenceCommand>,
    registry: Arc<ConnectionRegistry>,
}

impl PresenceHub {
    /// Start the coordinator task. It stops once every hub clone is dropped.
    pub fn spawn(registry: Arc<ConnectionRegistry>, buffer: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let coordinator = PresenceCoordinator {
            broadcaster: PresenceBroadcaster::new(registry.clone()),
            registry: registry.clone(),
            rx,
        };
        let task = tokio::spawn(coordinator.run());

        (Self { tx, registry }, task)
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Register a connection and announce the new presence
    pub async fn open(&self, handle: Arc<ConnectionHandle>) -> Result<AnnounceReport, PresenceError> {
        let (reply, rx) = oneshot::channel();
        self.submit(PresenceCommand::Open { handle, reply }).await?;
        rx.await.map_err(|_| PresenceError::CoordinatorUnavailable)
    }

    /// Deregister a connection; announces only if it was registered
    pub async fn close(&self, connection_id: ConnectionId) -> Result<Option<AnnounceReport>, PresenceError> {
        let (reply, rx) = oneshot::channel();
        self.submit(PresenceCommand::Close { connection_id, reply }).await?;
        rx.await.map_err(|_| PresenceError::CoordinatorUnavailable)
    }

    /// Clear the registry at shutdown; returns the number of connections dropped
    pub async fn teardown(&self) -> Result<usize, PresenceError> {
        let (reply, rx) = oneshot::channel();
        self.submit(PresenceCommand::Teardown { reply }).await?;
        rx.await.map_err(|_| PresenceError::CoordinatorUnavailable)
    }

    async fn submit(&self, command: PresenceCommand) -> Result<(), PresenceError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| PresenceError::CoordinatorUnavailable)
    }
}

struct PresenceCoordinator {
    registry: Arc<ConnectionRegistry>,
    broadcaster: PresenceBroadcaster,
    rx: mpsc::Receiver<PresenceCommand>,
}

impl PresenceCoordinator {
    async fn run(mut self) {
        tracing::info!("Presence coordinator started");

        while let Some(command) = self.rx.recv().await {
            match command {
                PresenceCommand::Open { handle, reply } => {
                    self.registry.register(handle.user_id.clone(), handle);
                    let report = self.broadcaster.announce();
                    let _ = reply.send(report);
                }
                PresenceCommand::Close { connection_id, reply } => {
                    let report = if self.registry.deregister(connection_id) {
                        Some(self.broadcaster.announce())
                    } else {
                        None
                    };
                    let _ = reply.send(report);
                }
                PresenceCommand::Teardown { reply } => {
                    let removed = self.registry.clear();
                    tracing::info!(removed = removed, "Connection registry torn down");
                    let _ = reply.send(removed);
                }
            }

            ConnectionMetrics::update_gauges(&self.registry.stats());
        }

        tracing::info!("Presence coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_open_then_close() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (hub, _task) = PresenceHub::spawn(registry.clone(), 16);

        let (tx, mut rx) = mpsc::channel(8);
        let handle = Arc::new(ConnectionHandle::new(Uuid::new_v4(), "alice".into(), tx));

        let report = hub.open(handle.clone()).await.unwrap();
        assert_eq!(report.online, 1);
        assert_eq!(report.delivered, 1);
        assert!(rx.try_recv().is_ok());

        let report = hub.close(handle.id).await.unwrap();
        // The only connection is gone, so nobody hears about it
        assert_eq!(report, Some(AnnounceReport::default()));
        assert!(registry.snapshot().is_empty());

        // Second close is a no-op and does not announce
        assert_eq!(hub.close(handle.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_teardown_clears_registry() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (hub, _task) = PresenceHub::spawn(registry.clone(), 16);

        for user in ["alice", "bob"] {
            let (tx, _rx) = mpsc::channel(8);
            hub.open(Arc::new(ConnectionHandle::new(Uuid::new_v4(), user.into(), tx)))
                .await
                .unwrap();
        }

        assert_eq!(hub.teardown().await.unwrap(), 2);
        assert!(registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_coordinator_stops_when_hub_dropped() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (hub, task) = PresenceHub::spawn(registry, 4);
        drop(hub);

        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("coordinator should stop")
            .expect("coordinator should not panic");
    }
}
