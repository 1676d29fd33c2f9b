//! Presence tracking and broadcast
//!
//! - `PresenceBroadcaster` pushes the online set to every connection
//! - `PresenceHub` funnels connection open/close through one coordinator task

mod broadcaster;
mod coordinator;

pub use broadcaster::{AnnounceReport, PresenceBroadcaster};
pub use coordinator::{PresenceError, PresenceHub};
