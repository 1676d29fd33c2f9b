//! Connection registry for WebSocket connections
//!
//! This module provides:
//! - Connection handles and the presence snapshot type
//! - The user -> connections index with O(1) removal by connection id
//! - Connection statistics

mod registry;
mod stats;
mod types;

pub use registry::{ConnectionRegistry, PresenceView};
pub use stats::{ConnectionStats, UserConnectionInfo};
pub use types::{
    ConnectionHandle, ConnectionId, ConnectionSignals, PresenceDelivery, PresenceSnapshot,
    UserIdentity,
};
