//! Real-time message fan-out
//!
//! Routes newly persisted chat messages to the live connections of the
//! chat's other participants. Offline recipients pick the message up from
//! history on their next load; nothing is queued here.

mod directory;
mod router;
mod types;

pub use directory::{ChatDirectory, DirectoryError, InMemoryChatDirectory};
pub use router::{MessageRouter, RouteError};
pub use types::{OutboundMessage, RouteReport, RouterStats, RouterStatsSnapshot};
