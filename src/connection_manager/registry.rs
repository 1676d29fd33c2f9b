use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

use super::stats::{ConnectionStats, UserConnectionInfo};
use super::types::{ConnectionHandle, ConnectionId, PresenceSnapshot, UserIdentity};

/// A registered handle and the identity it was registered under
struct Entry {
    owner: UserIdentity,
    handle: Arc<ConnectionHandle>,
}

/// Both indexes live behind one lock so every operation sees a whole state.
#[derive(Default)]
struct RegistryInner {
    /// connection_id -> (owner, ConnectionHandle)
    connections: HashMap<ConnectionId, Entry>,
    /// user_id -> Set<connection_id> (supports multiple devices)
    user_index: HashMap<UserIdentity, HashSet<ConnectionId>>,
}

impl RegistryInner {
    /// Remove a connection from both indexes, keyed by its registered owner
    fn detach(&mut self, connection_id: ConnectionId) -> Option<Entry> {
        let entry = self.connections.remove(&connection_id)?;

        if let Some(user_conns) = self.user_index.get_mut(&entry.owner) {
            user_conns.remove(&connection_id);
            if user_conns.is_empty() {
                self.user_index.remove(&entry.owner);
            }
        }

        Some(entry)
    }

    fn handles(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.values().map(|e| e.handle.clone()).collect()
    }
}

/// A consistent view of presence and the handles to announce it to
pub struct PresenceView {
    pub snapshot: PresenceSnapshot,
    pub connections: Vec<Arc<ConnectionHandle>>,
}

/// Process-wide mapping from user identity to live connection handles
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under a user.
    ///
    /// A handle id already present under another user is moved, so a handle
    /// never belongs to two users.
    pub fn register(&self, user_id: UserIdentity, handle: Arc<ConnectionHandle>) {
        let conn_id = handle.id;
        let mut inner = self.inner.lock();

        if let Some(previous) = inner.detach(conn_id) {
            if previous.owner != user_id {
                tracing::warn!(
                    connection_id = %conn_id,
                    previous_user_id = %previous.owner,
                    user_id = %user_id,
                    "Connection re-registered under a different user"
                );
            }
        }

        inner.connections.insert(
            conn_id,
            Entry {
                owner: user_id.clone(),
                handle,
            },
        );
        inner.user_index.entry(user_id.clone()).or_default().insert(conn_id);
        drop(inner);

        tracing::info!(connection_id = %conn_id, user_id = %user_id, "Connection registered");
    }

    /// Remove a connection from whichever user owns it.
    ///
    /// Unknown ids are a no-op. Returns true if something was removed.
    pub fn deregister(&self, connection_id: ConnectionId) -> bool {
        let removed = self.inner.lock().detach(connection_id);

        match removed {
            Some(entry) => {
                tracing::info!(
                    connection_id = %connection_id,
                    user_id = %entry.owner,
                    "Connection deregistered"
                );
                true
            }
            None => {
                tracing::debug!(connection_id = %connection_id, "Deregister of unknown connection ignored");
                false
            }
        }
    }

    /// Identities that currently hold at least one connection
    pub fn snapshot(&self) -> PresenceSnapshot {
        self.inner.lock().user_index.keys().cloned().collect()
    }

    /// Live handles for a user (empty if offline)
    pub fn connections_for(&self, user_id: &str) -> Vec<Arc<ConnectionHandle>> {
        let inner = self.inner.lock();
        inner
            .user_index
            .get(user_id)
            .map(|conn_ids| {
                conn_ids
                    .iter()
                    .filter_map(|id| inner.connections.get(id).map(|e| e.handle.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot and every live handle, taken under a single lock acquisition
    pub fn presence_view(&self) -> PresenceView {
        let inner = self.inner.lock();
        PresenceView {
            snapshot: inner.user_index.keys().cloned().collect(),
            connections: inner.handles(),
        }
    }

    pub fn all_connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.inner.lock().handles()
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.inner
            .lock()
            .connections
            .get(&connection_id)
            .map(|e| e.handle.clone())
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.inner.lock().user_index.contains_key(user_id)
    }

    pub fn user_info(&self, user_id: &str) -> UserConnectionInfo {
        let connection_count = self
            .inner
            .lock()
            .user_index
            .get(user_id)
            .map(HashSet::len)
            .unwrap_or(0);

        UserConnectionInfo {
            user_id: user_id.to_string(),
            connection_count,
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        let inner = self.inner.lock();
        ConnectionStats {
            total_connections: inner.connections.len(),
            unique_users: inner.user_index.len(),
        }
    }

    /// Connections inactive for longer than the timeout
    pub fn find_stale(&self, timeout_secs: u64) -> Vec<Arc<ConnectionHandle>> {
        let now = Utc::now();
        let timeout = chrono::Duration::seconds(timeout_secs as i64);

        self.inner
            .lock()
            .connections
            .values()
            .filter(|e| now.signed_duration_since(e.handle.last_activity()) > timeout)
            .map(|e| e.handle.clone())
            .collect()
    }

    /// Drop every entry; returns the number of connections removed
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.connections.len();
        inner.connections.clear();
        inner.user_index.clear();
        count
    }
}
