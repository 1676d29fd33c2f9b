//! Per-connection lifecycle: `Connecting -> Opening -> Open -> Closed`.
//!
//! A connection is invisible to presence until the client announces its
//! identity. `Opening` covers the registration round trip through the
//! presence coordinator; a close that lands in that window is finished by
//! the announcing side once registration completes. Closing is guarded so that however many close signals a
//! connection produces (close frame, read error, stale sweep, shutdown),
//! deregistration and the follow-up announcement happen once.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::connection_manager::{ConnectionHandle, ConnectionId, ConnectionSignals, UserIdentity};
use crate::presence::{AnnounceReport, PresenceError, PresenceHub};
use crate::websocket::{OutboundFrame, ServerMessage};

const CONNECTING: u8 = 0;
const OPENING: u8 = 1;
const OPEN: u8 = 2;
const CLOSED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    /// Identity accepted, registration in flight
    Opening,
    Open,
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            CONNECTING => Self::Connecting,
            OPENING => Self::Opening,
            OPEN => Self::Open,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Identity must not be empty")]
    EmptyIdentity,

    #[error("Announced identity {announced} does not match authenticated user {authenticated}")]
    IdentityMismatch {
        announced: String,
        authenticated: String,
    },

    #[error("Identity can only be announced while connecting (connection is {0})")]
    InvalidState(ConnectionState),

    #[error(transparent)]
    Presence(#[from] PresenceError),
}

impl LifecycleError {
    /// Error code sent to the client
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyIdentity => "INVALID_IDENTITY",
            Self::IdentityMismatch { .. } => "IDENTITY_MISMATCH",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::Presence(_) => "UNAVAILABLE",
        }
    }
}

pub struct ConnectionLifecycle {
    id: ConnectionId,
    state: AtomicU8,
    authenticated_user: Option<UserIdentity>,
    sender: mpsc::Sender<OutboundFrame>,
    handle: OnceLock<Arc<ConnectionHandle>>,
    signals: ConnectionSignals,
    hub: PresenceHub,
}

impl ConnectionLifecycle {
    /// A fresh connection in `Connecting`.
    ///
    /// When `authenticated_user` is set, only that identity may be announced.
    pub fn new(
        hub: PresenceHub,
        sender: mpsc::Sender<OutboundFrame>,
        authenticated_user: Option<UserIdentity>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: AtomicU8::new(CONNECTING),
            authenticated_user,
            sender,
            handle: OnceLock::new(),
            signals: ConnectionSignals::new(),
            hub,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The registered handle, once the connection is open
    pub fn handle(&self) -> Option<&Arc<ConnectionHandle>> {
        self.handle.get()
    }

    /// Resolves once a close was requested through the registered handle
    pub async fn close_requested(&self) {
        self.signals.close_requested().await;
    }

    /// Presence frames parked while the outbound buffer was full
    pub fn presence_slot(&self) -> watch::Receiver<Option<OutboundFrame>> {
        self.signals.presence_slot()
    }

    /// Send directly to this connection's writer, in any state
    pub async fn send(&self, message: ServerMessage) -> bool {
        self.sender.send(OutboundFrame::Raw(message)).await.is_ok()
    }

    /// `Connecting -> Open`: register under `user_id` and announce presence.
    ///
    /// If the connection is closed while registration is in flight, the
    /// registration is undone here and the call fails with `InvalidState`.
    #[tracing::instrument(
        name = "lifecycle.announce_identity",
        skip(self),
        fields(connection_id = %self.id)
    )]
    pub async fn announce_identity(
        &self,
        user_id: String,
    ) -> Result<Arc<ConnectionHandle>, LifecycleError> {
        let user_id = user_id.trim().to_string();
        if user_id.is_empty() {
            return Err(LifecycleError::EmptyIdentity);
        }

        if let Some(ref authenticated) = self.authenticated_user {
            if *authenticated != user_id {
                return Err(LifecycleError::IdentityMismatch {
                    announced: user_id,
                    authenticated: authenticated.clone(),
                });
            }
        }

        self.state
            .compare_exchange(CONNECTING, OPENING, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|current| LifecycleError::InvalidState(ConnectionState::from_u8(current)))?;

        let handle = self
            .handle
            .get_or_init(|| {
                Arc::new(ConnectionHandle::with_signals(
                    self.id,
                    user_id,
                    self.sender.clone(),
                    self.signals.clone(),
                ))
            })
            .clone();

        match self.hub.open(handle.clone()).await {
            Ok(report) => {
                if self
                    .state
                    .compare_exchange(OPENING, OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // Closed while registering; the close left deregistration to us
                    tracing::debug!(user_id = %handle.user_id, "Connection closed during open");
                    if let Err(e) = self.hub.close(self.id).await {
                        tracing::warn!(error = %e, "Presence coordinator unavailable, deregistering directly");
                        self.hub.registry().deregister(self.id);
                    }
                    return Err(LifecycleError::InvalidState(ConnectionState::Closed));
                }

                tracing::info!(
                    user_id = %handle.user_id,
                    online = report.online,
                    "Connection open"
                );
                Ok(handle)
            }
            Err(e) => {
                self.state.store(CLOSED, Ordering::Release);
                tracing::error!(error = %e, "Failed to register connection");
                Err(e.into())
            }
        }
    }

    /// Move to `Closed`. Only the first call on an open connection
    /// deregisters and triggers an announcement; later calls are no-ops.
    #[tracing::instrument(
        name = "lifecycle.close",
        skip(self),
        fields(connection_id = %self.id)
    )]
    pub async fn close(&self) -> Option<AnnounceReport> {
        let previous = ConnectionState::from_u8(self.state.swap(CLOSED, Ordering::AcqRel));

        match previous {
            ConnectionState::Open => match self.hub.close(self.id).await {
                Ok(report) => report,
                Err(e) => {
                    tracing::warn!(error = %e, "Presence coordinator unavailable, deregistering directly");
                    self.hub.registry().deregister(self.id);
                    None
                }
            },
            ConnectionState::Connecting => {
                tracing::debug!("Connection closed before announcing identity");
                None
            }
            ConnectionState::Opening => {
                tracing::debug!("Connection closed while registering");
                None
            }
            ConnectionState::Closed => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_manager::ConnectionRegistry;

    fn setup() -> (PresenceHub, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let (hub, _task) = PresenceHub::spawn(registry.clone(), 16);
        (hub, registry)
    }

    #[tokio::test]
    async fn test_connecting_is_invisible() {
        let (hub, registry) = setup();
        let (tx, _rx) = mpsc::channel(8);
        let lifecycle = ConnectionLifecycle::new(hub, tx, None);

        assert_eq!(lifecycle.state(), ConnectionState::Connecting);
        assert!(lifecycle.handle().is_none());
        assert!(registry.snapshot().is_empty());

        // Closing before announcing never touches presence
        assert_eq!(lifecycle.close().await, None);
        assert_eq!(lifecycle.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_announce_registers() {
        let (hub, registry) = setup();
        let (tx, mut rx) = mpsc::channel(8);
        let lifecycle = ConnectionLifecycle::new(hub, tx, None);

        let handle = lifecycle.announce_identity("alice".into()).await.unwrap();
        assert_eq!(handle.id, lifecycle.id());
        assert_eq!(lifecycle.state(), ConnectionState::Open);
        assert!(registry.snapshot().contains("alice"));
        assert!(matches!(rx.try_recv(), Ok(OutboundFrame::Presence { .. })));
    }

    #[tokio::test]
    async fn test_second_announce_rejected() {
        let (hub, registry) = setup();
        let (tx, _rx) = mpsc::channel(8);
        let lifecycle = ConnectionLifecycle::new(hub, tx, None);

        lifecycle.announce_identity("alice".into()).await.unwrap();
        let result = lifecycle.announce_identity("bob".into()).await;

        assert!(matches!(result, Err(LifecycleError::InvalidState(ConnectionState::Open))));
        assert_eq!(registry.snapshot().into_vec(), vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_identity_must_match_token() {
        let (hub, registry) = setup();
        let (tx, _rx) = mpsc::channel(8);
        let lifecycle = ConnectionLifecycle::new(hub, tx, Some("alice".into()));

        let result = lifecycle.announce_identity("bob".into()).await;
        assert!(matches!(result, Err(LifecycleError::IdentityMismatch { .. })));
        assert_eq!(lifecycle.state(), ConnectionState::Connecting);
        assert!(registry.snapshot().is_empty());

        let result = lifecycle.announce_identity("   ".into()).await;
        assert!(matches!(result, Err(LifecycleError::EmptyIdentity)));

        assert!(lifecycle.announce_identity("alice".into()).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_runs_once() {
        let (hub, registry) = setup();

        let (tx_watch, mut rx_watch) = mpsc::channel(8);
        let watcher = ConnectionLifecycle::new(hub.clone(), tx_watch, None);
        watcher.announce_identity("bob".into()).await.unwrap();

        let (tx, _rx) = mpsc::channel(8);
        let lifecycle = ConnectionLifecycle::new(hub, tx, None);
        lifecycle.announce_identity("alice".into()).await.unwrap();

        // Drain the two open announcements seen by the watcher
        while rx_watch.try_recv().is_ok() {}

        let first = lifecycle.close().await;
        let second = lifecycle.close().await;

        assert!(first.is_some());
        assert!(second.is_none());
        assert!(!registry.snapshot().contains("alice"));

        // Exactly one post-close update reached the other user
        assert!(rx_watch.try_recv().is_ok());
        assert!(rx_watch.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_close_announces_once() {
        let (hub, registry) = setup();
        let (tx, _rx) = mpsc::channel(8);
        let lifecycle = Arc::new(ConnectionLifecycle::new(hub, tx, None));
        lifecycle.announce_identity("alice".into()).await.unwrap();

        let (a, b) = {
            let first = lifecycle.clone();
            let second = lifecycle.clone();
            tokio::join!(
                tokio::spawn(async move { first.close().await }),
                tokio::spawn(async move { second.close().await })
            )
        };
        let results = [a.unwrap(), b.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);
        assert_eq!(lifecycle.state(), ConnectionState::Closed);
        assert!(registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_close_during_registration() {
        let (hub, registry) = setup();
        let (tx_watch, mut rx_watch) = mpsc::channel(8);
        let watcher = ConnectionLifecycle::new(hub.clone(), tx_watch, None);
        watcher.announce_identity("bob".into()).await.unwrap();
        while rx_watch.try_recv().is_ok() {}

        let (tx, _rx) = mpsc::channel(8);
        let lifecycle = ConnectionLifecycle::new(hub, tx, None);

        // First poll queues the registration and parks on the coordinator's reply
        let mut announce = Box::pin(lifecycle.announce_identity("alice".into()));
        assert!(futures::poll!(&mut announce).is_pending());
        assert_eq!(lifecycle.state(), ConnectionState::Opening);

        assert_eq!(lifecycle.close().await, None);

        let result = announce.await;
        assert!(matches!(result, Err(LifecycleError::InvalidState(ConnectionState::Closed))));
        assert_eq!(lifecycle.state(), ConnectionState::Closed);
        assert!(!registry.snapshot().contains("alice"));

        // The watcher saw alice come and go, in that order
        let opened = rx_watch.try_recv().unwrap().to_json().unwrap();
        let closed = rx_watch.try_recv().unwrap().to_json().unwrap();
        assert!(opened.contains("alice"));
        assert!(!closed.contains("alice"));
        assert!(rx_watch.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_request_through_handle() {
        let (hub, _registry) = setup();
        let (tx, _rx) = mpsc::channel(8);
        let lifecycle = ConnectionLifecycle::new(hub, tx, None);
        let handle = lifecycle.announce_identity("alice".into()).await.unwrap();

        handle.request_close();
        tokio::time::timeout(std::time::Duration::from_secs(1), lifecycle.close_requested())
            .await
            .expect("lifecycle should observe the handle's close request");
    }

    #[tokio::test]
    async fn test_announce_after_close_rejected() {
        let (hub, registry) = setup();
        let (tx, _rx) = mpsc::channel(8);
        let lifecycle = ConnectionLifecycle::new(hub, tx, None);

        lifecycle.close().await;
        let result = lifecycle.announce_identity("alice".into()).await;

        assert!(matches!(result, Err(LifecycleError::InvalidState(ConnectionState::Closed))));
        assert!(registry.snapshot().is_empty());
    }
}
