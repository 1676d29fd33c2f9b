//! Prometheus metrics for the presence service.
//!
//! - Connection metrics (active connections, online users, lifecycle counters)
//! - Presence broadcast metrics
//! - Message routing metrics
//! - Inbound WebSocket event metrics

mod helpers;

pub use helpers::{encode_metrics, ConnectionMetrics, PresenceMetrics, RoutingMetrics, WsMessageMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "presence";

lazy_static! {
    // ============================================================================
    // Connection Metrics
    // ============================================================================

    /// Total number of registered WebSocket connections
    pub static ref CONNECTIONS_TOTAL: IntGauge = register_int_gauge!(
        format!("{}_connections_total", METRIC_PREFIX),
        "Total number of registered WebSocket connections"
    ).unwrap();

    /// Number of users currently online
    pub static ref USERS_ONLINE: IntGauge = register_int_gauge!(
        format!("{}_users_online", METRIC_PREFIX),
        "Number of users holding at least one connection"
    ).unwrap();

    pub static ref WS_CONNECTIONS_OPENED: IntCounter = register_int_counter!(
        format!("{}_ws_connections_opened_total", METRIC_PREFIX),
        "Total WebSocket connections accepted"
    ).unwrap();

    pub static ref WS_CONNECTIONS_CLOSED: IntCounter = register_int_counter!(
        format!("{}_ws_connections_closed_total", METRIC_PREFIX),
        "Total WebSocket connections closed"
    ).unwrap();

    pub static ref WS_CONNECTION_DURATION: Histogram = register_histogram!(
        format!("{}_ws_connection_duration_seconds", METRIC_PREFIX),
        "WebSocket connection duration in seconds",
        vec![1.0, 10.0, 60.0, 300.0, 900.0, 3600.0, 14400.0]
    ).unwrap();

    // ============================================================================
    // Presence Metrics
    // ============================================================================

    pub static ref PRESENCE_BROADCASTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_broadcasts_total", METRIC_PREFIX),
        "Total presence announcements"
    ).unwrap();

    pub static ref PRESENCE_DELIVERIES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_broadcast_deliveries_total", METRIC_PREFIX),
        "Presence updates handed to connections"
    ).unwrap();

    pub static ref PRESENCE_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_broadcast_failures_total", METRIC_PREFIX),
        "Presence updates that could not be handed to a connection"
    ).unwrap();

    pub static ref PRESENCE_PARKED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_broadcast_parked_total", METRIC_PREFIX),
        "Presence updates parked because the outbound buffer was full"
    ).unwrap();

    // ============================================================================
    // Routing Metrics
    // ============================================================================

    pub static ref MESSAGES_ROUTED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_routed_total", METRIC_PREFIX),
        "Total chat messages routed"
    ).unwrap();

    pub static ref MESSAGES_DELIVERED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_delivered_total", METRIC_PREFIX),
        "Chat messages delivered to connections"
    ).unwrap();

    pub static ref MESSAGES_FAILED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_failed_total", METRIC_PREFIX),
        "Chat message deliveries that failed"
    ).unwrap();

    pub static ref RECIPIENTS_OFFLINE_TOTAL: IntCounter = register_int_counter!(
        format!("{}_recipients_offline_total", METRIC_PREFIX),
        "Recipients skipped because they had no live connection"
    ).unwrap();

    // ============================================================================
    // WebSocket Message Metrics
    // ============================================================================

    pub static ref WS_MESSAGES_RECEIVED: IntCounterVec = register_int_counter_vec!(
        format!("{}_ws_messages_received_total", METRIC_PREFIX),
        "Inbound WebSocket events by type",
        &["type"]
    ).unwrap();
}
