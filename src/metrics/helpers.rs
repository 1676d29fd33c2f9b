//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use crate::connection_manager::ConnectionStats;

use super::{
    CONNECTIONS_TOTAL, MESSAGES_DELIVERED_TOTAL, MESSAGES_FAILED_TOTAL, MESSAGES_ROUTED_TOTAL,
    PRESENCE_BROADCASTS_TOTAL, PRESENCE_DELIVERIES_TOTAL, PRESENCE_FAILURES_TOTAL,
    PRESENCE_PARKED_TOTAL, RECIPIENTS_OFFLINE_TOTAL, USERS_ONLINE, WS_CONNECTIONS_CLOSED,
    WS_CONNECTIONS_OPENED, WS_CONNECTION_DURATION, WS_MESSAGES_RECEIVED,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

pub struct ConnectionMetrics;

impl ConnectionMetrics {
    pub fn record_opened() {
        WS_CONNECTIONS_OPENED.inc();
    }

    pub fn record_closed(duration_secs: f64) {
        WS_CONNECTIONS_CLOSED.inc();
        WS_CONNECTION_DURATION.observe(duration_secs);
    }

    /// Refresh the gauges from a registry stats snapshot
    pub fn update_gauges(stats: &ConnectionStats) {
        CONNECTIONS_TOTAL.set(stats.total_connections as i64);
        USERS_ONLINE.set(stats.unique_users as i64);
    }
}

pub struct PresenceMetrics;

impl PresenceMetrics {
    pub fn record_announce(delivered: u64, parked: u64, failed: u64) {
        PRESENCE_BROADCASTS_TOTAL.inc();
        PRESENCE_DELIVERIES_TOTAL.inc_by(delivered);
        PRESENCE_PARKED_TOTAL.inc_by(parked);
        PRESENCE_FAILURES_TOTAL.inc_by(failed);
    }
}

pub struct RoutingMetrics;

impl RoutingMetrics {
    pub fn record_routed(delivered: u64, failed: u64, offline: u64) {
        MESSAGES_ROUTED_TOTAL.inc();
        MESSAGES_DELIVERED_TOTAL.inc_by(delivered);
        MESSAGES_FAILED_TOTAL.inc_by(failed);
        RECIPIENTS_OFFLINE_TOTAL.inc_by(offline);
    }
}

pub struct WsMessageMetrics;

impl WsMessageMetrics {
    pub fn record(kind: &str) {
        WS_MESSAGES_RECEIVED.with_label_values(&[kind]).inc();
    }

    pub fn record_invalid() {
        WS_MESSAGES_RECEIVED.with_label_values(&["invalid"]).inc();
    }
}
