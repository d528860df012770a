//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use super::{
    CONNECTIONS_REJECTED_TOTAL, CONNECTIONS_TOTAL, DELIVERY_FAILURES_TOTAL, EVENTS_SENT_TOTAL,
    FANOUT_RECIPIENTS, HEARTBEAT_DURATION_MS, HEARTBEAT_EVICTIONS, PRESENCE_TRANSITIONS_TOTAL,
    ROOMS_ACTIVE, USERS_ONLINE, WS_CONNECTIONS_CLOSED, WS_CONNECTIONS_OPENED,
    WS_CONNECTION_DURATION, WS_MESSAGES_RECEIVED,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for connection gauges and lifecycle counters
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    /// Refresh the point-in-time gauges
    pub fn set_gauges(connections: usize, users_online: usize, rooms: usize) {
        CONNECTIONS_TOTAL.set(connections as i64);
        USERS_ONLINE.set(users_online as i64);
        ROOMS_ACTIVE.set(rooms as i64);
    }

    pub fn record_opened() {
        WS_CONNECTIONS_OPENED.inc();
    }

    /// Record a close and how long the connection lived
    pub fn record_closed(reason: &str, duration_secs: f64) {
        WS_CONNECTIONS_CLOSED.with_label_values(&[reason]).inc();
        WS_CONNECTION_DURATION.observe(duration_secs);
    }

    pub fn record_rejected(code: &str) {
        CONNECTIONS_REJECTED_TOTAL.with_label_values(&[code]).inc();
    }
}

/// Helper struct for presence transitions
pub struct PresenceMetrics;

impl PresenceMetrics {
    pub fn record_transition(online: bool) {
        let direction = if online { "online" } else { "offline" };
        PRESENCE_TRANSITIONS_TOTAL
            .with_label_values(&[direction])
            .inc();
    }
}

/// Helper struct for recording fan-out metrics
pub struct FanoutMetrics;

impl FanoutMetrics {
    /// Record events enqueued for one kind
    pub fn record_sent(kind: &str, count: u64) {
        if count > 0 {
            EVENTS_SENT_TOTAL.with_label_values(&[kind]).inc_by(count);
        }
    }

    /// Record failed deliveries
    pub fn record_failed(count: u64) {
        if count > 0 {
            DELIVERY_FAILURES_TOTAL.inc_by(count);
        }
    }

    /// Record how many connections one message reached
    pub fn record_recipients(count: usize) {
        FANOUT_RECIPIENTS.observe(count as f64);
    }
}

/// Helper struct for recording WebSocket message metrics
pub struct WsMessageMetrics;

impl WsMessageMetrics {
    /// Record an inbound frame by its kind
    pub fn record(kind: &str) {
        WS_MESSAGES_RECEIVED.with_label_values(&[kind]).inc();
    }

    /// Record a frame that could not be parsed
    pub fn record_invalid() {
        WS_MESSAGES_RECEIVED.with_label_values(&["invalid"]).inc();
    }
}

/// Helper struct for heartbeat metrics
pub struct HeartbeatMetrics;

impl HeartbeatMetrics {
    /// Record heartbeat round duration
    pub fn record_duration_ms(duration_ms: u64) {
        HEARTBEAT_DURATION_MS.observe(duration_ms as f64);
    }

    /// Record connections evicted by one sweep
    pub fn record_evictions(count: usize) {
        HEARTBEAT_EVICTIONS.inc_by(count as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fanout_metrics() {
        FanoutMetrics::record_sent("message_created", 3);
        FanoutMetrics::record_sent("message_notification", 0);
        FanoutMetrics::record_failed(1);
        FanoutMetrics::record_recipients(4);
        // Just verify no panics
    }

    #[test]
    fn test_presence_metrics() {
        let before = PRESENCE_TRANSITIONS_TOTAL
            .with_label_values(&["offline"])
            .get();
        PresenceMetrics::record_transition(false);
        let after = PRESENCE_TRANSITIONS_TOTAL
            .with_label_values(&["offline"])
            .get();
        assert!(after > before);
    }

    #[test]
    fn test_ws_message_metrics() {
        WsMessageMetrics::record("join");
        WsMessageMetrics::record("typing");
        WsMessageMetrics::record_invalid();
        ConnectionMetrics::record_opened();
        ConnectionMetrics::record_closed("client_closed", 12.5);
        HeartbeatMetrics::record_evictions(2);
        HeartbeatMetrics::record_duration_ms(3);
        // Just verify no panics
    }
}
