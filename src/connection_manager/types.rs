//! Connection handle and related types

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify};
use uuid::Uuid;

use crate::websocket::{OutboundFrame, ServerMessage};

/// Opaque user identifier supplied by the authenticated session
pub type UserIdentity = String;

/// Identifier assigned to a connection when it is accepted; never reused
pub type ConnectionId = Uuid;

/// Signals shared between a connection's own task and its registered handle
#[derive(Clone)]
pub struct ConnectionSignals {
    close: Arc<Notify>,
    /// Latest presence frame that did not fit in the outbound buffer
    presence: Arc<watch::Sender<Option<OutboundFrame>>>,
}

impl ConnectionSignals {
    pub fn new() -> Self {
        let (presence, _) = watch::channel(None);
        Self {
            close: Arc::new(Notify::new()),
            presence: Arc::new(presence),
        }
    }

    /// Ask the task owning the connection to close it
    pub fn request_close(&self) {
        self.close.notify_one();
    }

    /// Resolves once `request_close` has been called
    pub async fn close_requested(&self) {
        self.close.notified().await;
    }

    /// Receiver for parked presence frames, read by the writer task
    pub fn presence_slot(&self) -> watch::Receiver<Option<OutboundFrame>> {
        self.presence.subscribe()
    }

    fn park_presence(&self, frame: OutboundFrame) {
        self.presence.send_replace(Some(frame));
    }

    fn parked_presence(&self) -> Option<OutboundFrame> {
        self.presence.borrow().clone()
    }
}

impl Default for ConnectionSignals {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of offering a presence frame to one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceDelivery {
    /// Queued behind earlier frames
    Queued,
    /// Buffer full; replaced whatever presence frame was parked before
    Parked,
    /// The writer is gone
    Closed,
}

/// Handle for a single live WebSocket connection
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user_id: UserIdentity,
    pub sender: mpsc::Sender<OutboundFrame>,
    pub connected_at: DateTime<Utc>,
    /// Last activity timestamp (Unix seconds)
    last_activity: AtomicI64,
    signals: ConnectionSignals,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, user_id: UserIdentity, sender: mpsc::Sender<OutboundFrame>) -> Self {
        Self::with_signals(id, user_id, sender, ConnectionSignals::new())
    }

    /// Build a handle wired to signals the connection task already listens on
    pub fn with_signals(
        id: ConnectionId,
        user_id: UserIdentity,
        sender: mpsc::Sender<OutboundFrame>,
        signals: ConnectionSignals,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            sender,
            connected_at: now,
            last_activity: AtomicI64::new(now.timestamp()),
            signals,
        }
    }

    pub fn update_activity(&self) {
        self.last_activity
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.last_activity.load(Ordering::Relaxed), 0)
            .unwrap_or_else(Utc::now)
    }

    /// Send a ServerMessage (serialized by the writer task)
    pub async fn send(
        &self,
        message: ServerMessage,
    ) -> Result<(), mpsc::error::SendError<OutboundFrame>> {
        self.sender.send(OutboundFrame::Raw(message)).await
    }

    /// Send a frame, waiting for buffer space
    pub async fn send_frame(
        &self,
        frame: OutboundFrame,
    ) -> Result<(), mpsc::error::SendError<OutboundFrame>> {
        self.sender.send(frame).await
    }

    /// Hand over a presence frame without waiting. A full buffer parks the
    /// frame in the presence slot, replacing any older parked snapshot.
    pub fn offer_presence(&self, frame: OutboundFrame) -> PresenceDelivery {
        match self.sender.try_send(frame) {
            Ok(()) => PresenceDelivery::Queued,
            Err(TrySendError::Full(frame)) => {
                self.signals.park_presence(frame);
                PresenceDelivery::Parked
            }
            Err(TrySendError::Closed(_)) => PresenceDelivery::Closed,
        }
    }

    /// The presence frame currently parked for this connection, if any
    pub fn parked_presence(&self) -> Option<OutboundFrame> {
        self.signals.parked_presence()
    }

    /// Ask the task owning this connection to close it
    pub fn request_close(&self) {
        self.signals.request_close();
    }

    /// Resolves once `request_close` has been called
    pub async fn close_requested(&self) {
        self.signals.close_requested().await;
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}

/// The set of identities holding at least one live connection, at one instant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PresenceSnapshot(BTreeSet<UserIdentity>);

impl PresenceSnapshot {
    pub fn contains(&self, user_id: &str) -> bool {
        self.0.contains(user_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UserIdentity> {
        self.0.iter()
    }

    pub fn into_vec(self) -> Vec<UserIdentity> {
        self.0.into_iter().collect()
    }
}

impl FromIterator<UserIdentity> for PresenceSnapshot {
    fn from_iter<I: IntoIterator<Item = UserIdentity>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
