//! Connection statistics

use serde::Serialize;

/// Registry statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub unique_users: usize,
}

/// Per-user connection information
#[derive(Debug, Clone, Serialize)]
pub struct UserConnectionInfo {
    pub user_id: String,
    pub connection_count: usize,
}
