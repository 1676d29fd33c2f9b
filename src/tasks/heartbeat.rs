use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::config::WebSocketConfig;
use crate::connection_manager::ConnectionRegistry;
use crate::websocket::OutboundFrame;

/// Timeout for individual heartbeat send operations
const HEARTBEAT_SEND_TIMEOUT_MS: u64 = 5000;

/// Maximum concurrent heartbeat sends to avoid overwhelming the system
const MAX_CONCURRENT_HEARTBEATS: usize = 1000;

/// Background task for heartbeat and stale connection cleanup
pub struct HeartbeatTask {
    config: WebSocketConfig,
    registry: Arc<ConnectionRegistry>,
    shutdown: broadcast::Receiver<()>,
}

impl HeartbeatTask {
    pub fn new(
        config: WebSocketConfig,
        registry: Arc<ConnectionRegistry>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            registry,
            shutdown,
        }
    }

    /// Run the heartbeat and cleanup loops until shutdown
    pub async fn run(mut self) {
        let heartbeat_interval = Duration::from_secs(self.config.heartbeat_interval);
        let cleanup_interval = Duration::from_secs(self.config.cleanup_interval);
        let connection_timeout = self.config.connection_timeout;

        let mut heartbeat_timer = tokio::time::interval(heartbeat_interval);
        let mut cleanup_timer = tokio::time::interval(cleanup_interval);

        // Skip immediate first tick
        heartbeat_timer.tick().await;
        cleanup_timer.tick().await;

        tracing::info!(
            heartbeat_interval_secs = self.config.heartbeat_interval,
            cleanup_interval_secs = self.config.cleanup_interval,
            connection_timeout_secs = connection_timeout,
            "Heartbeat task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Heartbeat task received shutdown signal");
                    break;
                }
                _ = heartbeat_timer.tick() => {
                    self.send_heartbeats().await;
                }
                _ = cleanup_timer.tick() => {
                    self.close_stale_connections(connection_timeout);
                }
            }
        }

        tracing::info!("Heartbeat task stopped");
    }

    /// Send a heartbeat to every open connection, in batches. The writer
    /// follows each one with a transport ping so that clients which only
    /// listen still answer with a pong and stay active.
    async fn send_heartbeats(&self) {
        let connections = self.registry.all_connections();
        let total_count = connections.len();

        if total_count == 0 {
            return;
        }

        let start = Instant::now();
        let sent = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let timed_out = Arc::new(AtomicUsize::new(0));

        for batch in connections.chunks(MAX_CONCURRENT_HEARTBEATS) {
            let futures: Vec<_> = batch
                .iter()
                .map(|handle| {
                    let sent = sent.clone();
                    let failed = failed.clone();
                    let timed_out = timed_out.clone();
                    let handle = handle.clone();

                    async move {
                        let send_timeout = Duration::from_millis(HEARTBEAT_SEND_TIMEOUT_MS);
                        match timeout(send_timeout, handle.send_frame(OutboundFrame::Heartbeat)).await {
                            Ok(Ok(_)) => {
                                sent.fetch_add(1, Ordering::Relaxed);
                            }
                            Ok(Err(_)) => {
                                failed.fetch_add(1, Ordering::Relaxed);
                                tracing::debug!(
                                    connection_id = %handle.id,
                                    "Failed to send heartbeat, connection may be dead"
                                );
                            }
                            Err(_) => {
                                timed_out.fetch_add(1, Ordering::Relaxed);
                                tracing::debug!(
                                    connection_id = %handle.id,
                                    timeout_ms = HEARTBEAT_SEND_TIMEOUT_MS,
                                    "Heartbeat send timed out"
                                );
                            }
                        }
                    }
                })
                .collect();

            join_all(futures).await;
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;

        tracing::debug!(
            total = total_count,
            sent = sent.load(Ordering::Relaxed),
            failed = failed.load(Ordering::Relaxed),
            timed_out = timed_out.load(Ordering::Relaxed),
            elapsed_ms = elapsed_ms,
            "Heartbeat round completed"
        );

        if elapsed_ms > (self.config.heartbeat_interval * 1000 / 2) {
            tracing::warn!(
                elapsed_ms = elapsed_ms,
                heartbeat_interval_ms = self.config.heartbeat_interval * 1000,
                connections = total_count,
                "Heartbeat round took more than 50% of interval"
            );
        }
    }

    /// Ask idle connections to close. Their own tasks run the close
    /// transition, so presence is announced the usual way.
    fn close_stale_connections(&self, timeout_secs: u64) -> usize {
        let stale = self.registry.find_stale(timeout_secs);

        for handle in &stale {
            tracing::debug!(
                connection_id = %handle.id,
                user_id = %handle.user_id,
                last_activity = %handle.last_activity(),
                "Closing stale connection"
            );
            handle.request_close();
        }

        if !stale.is_empty() {
            tracing::info!(
                stale = stale.len(),
                timeout_secs = timeout_secs,
                "Requested close of stale connections"
            );
        }

        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_manager::ConnectionHandle;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_heartbeat_task_shutdown() {
        let config = WebSocketConfig::default();
        let registry = Arc::new(ConnectionRegistry::new());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let task = HeartbeatTask::new(config, registry, shutdown_rx);

        let handle = tokio::spawn(async move {
            task.run().await;
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("Task should complete")
            .expect("Task should not panic");
    }

    #[tokio::test]
    async fn test_heartbeat_sends_to_connections() {
        let config = WebSocketConfig {
            heartbeat_interval: 1,
            connection_timeout: 60,
            cleanup_interval: 60,
            ..Default::default()
        };
        let registry = Arc::new(ConnectionRegistry::new());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let (tx, mut rx) = mpsc::channel::<OutboundFrame>(10);
        registry.register(
            "user1".to_string(),
            Arc::new(ConnectionHandle::new(Uuid::new_v4(), "user1".to_string(), tx)),
        );

        let task = HeartbeatTask::new(config, registry, shutdown_rx);
        let task_handle = tokio::spawn(async move {
            task.run().await;
        });

        let msg = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("Should receive heartbeat")
            .expect("Channel should not be closed");

        assert!(matches!(msg, OutboundFrame::Heartbeat));

        shutdown_tx.send(()).unwrap();
        let _ = task_handle.await;
    }

    #[tokio::test]
    async fn test_stale_connections_are_asked_to_close() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let (tx, _rx) = mpsc::channel::<OutboundFrame>(10);
        let handle = Arc::new(ConnectionHandle::new(Uuid::new_v4(), "user1".to_string(), tx));
        registry.register("user1".to_string(), handle.clone());

        let task = HeartbeatTask::new(WebSocketConfig::default(), registry.clone(), shutdown_rx);

        // Generous timeout: nothing is stale yet
        assert_eq!(task.close_stale_connections(3600), 0);

        // Zero timeout: anything not active in this very second is stale
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(task.close_stale_connections(0), 1);

        tokio::time::timeout(Duration::from_secs(1), handle.close_requested())
            .await
            .expect("stale handle should be asked to close");

        // The sweep never deregisters by itself
        assert!(registry.is_online("user1"));
    }
}
