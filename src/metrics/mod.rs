//! Prometheus metrics for the realtime gateway.
//!
//! - Connection metrics (active connections, online users, rooms)
//! - Presence transitions
//! - Fan-out metrics (events sent by kind, delivery failures)
//! - WebSocket metrics (inbound frames, closes by reason, duration)

mod helpers;

pub use helpers::{
    encode_metrics, ConnectionMetrics, FanoutMetrics, HeartbeatMetrics, PresenceMetrics,
    WsMessageMetrics,
};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "chat";

lazy_static! {
    // ============================================================================
    // Connection Metrics
    // ============================================================================

    /// Total number of registered WebSocket connections
    pub static ref CONNECTIONS_TOTAL: IntGauge = register_int_gauge!(
        format!("{}_connections_total", METRIC_PREFIX),
        "Total number of registered WebSocket connections"
    ).unwrap();

    /// Number of users with at least one bound connection
    pub static ref USERS_ONLINE: IntGauge = register_int_gauge!(
        format!("{}_users_online", METRIC_PREFIX),
        "Number of users currently online"
    ).unwrap();

    /// Conversations with at least one joined connection
    pub static ref ROOMS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_rooms_active", METRIC_PREFIX),
        "Number of conversation rooms with at least one member"
    ).unwrap();

    /// Connections refused by limits or failed handshakes
    pub static ref CONNECTIONS_REJECTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_connections_rejected_total", METRIC_PREFIX),
        "Total connections rejected",
        &["code"]
    ).unwrap();

    // ============================================================================
    // Presence Metrics
    // ============================================================================

    /// Presence edges by direction
    pub static ref PRESENCE_TRANSITIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_presence_transitions_total", METRIC_PREFIX),
        "Total presence transitions",
        &["direction"]
    ).unwrap();

    // ============================================================================
    // Fan-out Metrics
    // ============================================================================

    /// Events enqueued to connections by kind
    pub static ref EVENTS_SENT_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_events_sent_total", METRIC_PREFIX),
        "Total events enqueued to connections",
        &["kind"]
    ).unwrap();

    /// Per-connection delivery failures
    pub static ref DELIVERY_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_delivery_failures_total", METRIC_PREFIX),
        "Total per-connection delivery failures"
    ).unwrap();

    /// Recipients per message fan-out
    pub static ref FANOUT_RECIPIENTS: Histogram = register_histogram!(
        format!("{}_fanout_recipients", METRIC_PREFIX),
        "Number of connections reached per message fan-out",
        vec![0.0, 1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 500.0]
    ).unwrap();

    // ============================================================================
    // WebSocket Metrics
    // ============================================================================

    /// WebSocket connections opened
    pub static ref WS_CONNECTIONS_OPENED: IntCounter = register_int_counter!(
        format!("{}_ws_connections_opened_total", METRIC_PREFIX),
        "Total WebSocket connections opened"
    ).unwrap();

    /// WebSocket connections closed by reason
    pub static ref WS_CONNECTIONS_CLOSED: IntCounterVec = register_int_counter_vec!(
        format!("{}_ws_connections_closed_total", METRIC_PREFIX),
        "Total WebSocket connections closed",
        &["reason"]
    ).unwrap();

    /// WebSocket messages received from clients
    pub static ref WS_MESSAGES_RECEIVED: IntCounterVec = register_int_counter_vec!(
        format!("{}_ws_messages_received_total", METRIC_PREFIX),
        "Total WebSocket messages received from clients",
        &["type"]
    ).unwrap();

    /// WebSocket connection duration
    pub static ref WS_CONNECTION_DURATION: Histogram = register_histogram!(
        format!("{}_ws_connection_duration_seconds", METRIC_PREFIX),
        "WebSocket connection duration in seconds",
        vec![1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0]
    ).unwrap();

    // ============================================================================
    // Heartbeat Metrics
    // ============================================================================

    /// Connections evicted by the cleanup sweep
    pub static ref HEARTBEAT_EVICTIONS: IntCounter = register_int_counter!(
        format!("{}_heartbeat_evictions_total", METRIC_PREFIX),
        "Total connections evicted by the cleanup sweep"
    ).unwrap();

    /// Heartbeat round duration in milliseconds
    pub static ref HEARTBEAT_DURATION_MS: Histogram = register_histogram!(
        format!("{}_heartbeat_duration_ms", METRIC_PREFIX),
        "Heartbeat round duration in milliseconds",
        vec![1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0]
    ).unwrap();
}
