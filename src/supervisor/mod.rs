//! Connection lifecycle: `Accepted -> Authenticating -> Active -> Closed`.
//!
//! Every path into `Closed` goes through [`ConnectionSupervisor::close`],
//! which relies on the registry's exactly-once removal so that cleanup and
//! the offline announcement happen once per connection no matter how many
//! close triggers race.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::auth::IdentityVerifier;
use crate::config::WebSocketConfig;
use crate::connection_manager::{ConnectionHandle, ConnectionRegistry, ConnectionState};
use crate::dispatcher::EventDispatcher;
use crate::domain::{ConnectionId, VerifiedIdentity};
use crate::error::GatewayError;
use crate::metrics::ConnectionMetrics;
use crate::websocket::{OutboundMessage, ServerMessage};

/// Why a connection was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    TransportFailure,
    Unauthenticated,
    AuthTimeout,
    ConnectionLimit,
    HeartbeatTimeout,
    SendQueueOverflow,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::TransportFailure => "transport_failure",
            Self::Unauthenticated => "unauthenticated",
            Self::AuthTimeout => "auth_timeout",
            Self::ConnectionLimit => "connection_limit",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::SendQueueOverflow => "send_queue_overflow",
            Self::Shutdown => "shutdown",
        }
    }

    /// Close reason for a failed handshake
    pub fn for_handshake_error(err: &GatewayError) -> Self {
        match err {
            GatewayError::Timeout(_) => Self::AuthTimeout,
            GatewayError::Limit(_) => Self::ConnectionLimit,
            GatewayError::TransportFailure(_) => Self::TransportFailure,
            _ => Self::Unauthenticated,
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Bound on identity verification, and on how long a connection may stay unauthenticated
    pub auth_timeout: Duration,
    /// Inbound silence after which an active connection is evicted
    pub heartbeat_timeout: Duration,
    /// Per-connection outbound queue capacity
    pub send_buffer_size: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from(&WebSocketConfig::default())
    }
}

impl From<&WebSocketConfig> for SupervisorConfig {
    fn from(config: &WebSocketConfig) -> Self {
        Self {
            auth_timeout: config.auth_timeout(),
            heartbeat_timeout: config.connection_timeout(),
            send_buffer_size: config.send_buffer_size.max(1),
        }
    }
}

/// Drives connections through their lifecycle
pub struct ConnectionSupervisor {
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<EventDispatcher>,
    verifier: Arc<dyn IdentityVerifier>,
    config: SupervisorConfig,
}

impl ConnectionSupervisor {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        dispatcher: Arc<EventDispatcher>,
        verifier: Arc<dyn IdentityVerifier>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            verifier,
            config,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Admit a new transport. The returned receiver is the connection's send queue.
    pub fn accept(&self) -> Result<(Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>), GatewayError> {
        let (tx, rx) = mpsc::channel(self.config.send_buffer_size);
        let handle = self.registry.register(tx).map_err(|e| {
            ConnectionMetrics::record_rejected("CONNECTION_LIMIT");
            GatewayError::from(e)
        })?;

        ConnectionMetrics::record_opened();
        tracing::debug!(connection_id = %handle.id, "Connection accepted");

        Ok((handle, rx))
    }

    /// Verify a token and make the connection active.
    ///
    /// Any failure closes the connection, after queueing an `error` event
    /// describing why. On success the client receives `authenticated`
    /// followed by `online_users_snapshot`.
    #[tracing::instrument(name = "supervisor.authenticate", skip(self, token))]
    pub async fn authenticate(
        &self,
        connection_id: ConnectionId,
        token: &str,
    ) -> Result<VerifiedIdentity, GatewayError> {
        let handle = self.registry.get(connection_id)?;

        if !handle.transition(ConnectionState::Accepted, ConnectionState::Authenticating) {
            return Err(GatewayError::InvalidMessage(format!(
                "connection is {}, cannot authenticate",
                handle.state().as_str()
            )));
        }

        match self.complete_handshake(&handle, token).await {
            Ok(identity) => Ok(identity),
            Err(err) => {
                tracing::warn!(
                    connection_id = %connection_id,
                    code = err.code(),
                    error = %err,
                    "Handshake failed"
                );
                ConnectionMetrics::record_rejected(err.code());
                let _ = handle.send(ServerMessage::from(&err));
                self.close(connection_id, CloseReason::for_handshake_error(&err));
                Err(err)
            }
        }
    }

    async fn complete_handshake(
        &self,
        handle: &ConnectionHandle,
        token: &str,
    ) -> Result<VerifiedIdentity, GatewayError> {
        let identity = tokio::time::timeout(self.config.auth_timeout, self.verifier.verify(token))
            .await
            .map_err(|_| GatewayError::Timeout("identity verification timed out".into()))??;

        let bound = self
            .registry
            .bind_identity(handle.id, identity, |change| self.dispatcher.queue_presence(change))?;

        if !handle.transition(ConnectionState::Authenticating, ConnectionState::Active) {
            return Err(GatewayError::TransportFailure(
                "connection closed during handshake".into(),
            ));
        }
        handle.update_activity();

        handle.send(ServerMessage::Authenticated {
            connection_id: handle.id,
            user_id: bound.identity.user_id.clone(),
        })?;
        self.dispatcher.notify_connected(handle.id);
        self.dispatcher.flush_presence();

        tracing::info!(
            connection_id = %handle.id,
            user_id = %bound.identity.user_id,
            came_online = bound.presence.is_some(),
            "Connection authenticated"
        );

        Ok(bound.identity)
    }

    /// Record inbound liveness
    pub fn touch(&self, connection_id: ConnectionId) {
        if let Some(handle) = self.registry.get_connection(connection_id) {
            handle.update_activity();
        }
    }

    /// Close a connection and clean up after it.
    ///
    /// Returns false if it was already closed.
    pub fn close(&self, connection_id: ConnectionId, reason: CloseReason) -> bool {
        let Some(outcome) = self
            .registry
            .unregister(connection_id, |change| self.dispatcher.queue_presence(change))
        else {
            return false;
        };

        // Wake the transport owner if it isn't the one closing
        outcome.handle.request_close();

        let duration_secs =
            (Utc::now() - outcome.handle.connected_at).num_milliseconds().max(0) as f64 / 1000.0;
        ConnectionMetrics::record_closed(reason.as_str(), duration_secs);

        // Also announces an online edge left queued by a handshake that failed after binding
        self.dispatcher.flush_presence();

        tracing::info!(
            connection_id = %connection_id,
            user_id = ?outcome.handle.user_id(),
            reason = %reason,
            duration_secs = duration_secs,
            "Connection closed"
        );

        true
    }

    /// Close every live connection
    pub fn close_all(&self, reason: CloseReason) -> usize {
        self.registry
            .all_connections()
            .iter()
            .filter(|handle| self.close(handle.id, reason))
            .count()
    }

    /// Evict connections that missed their heartbeat, never finished the
    /// handshake, or overflowed their send queue. Returns how many were closed.
    pub fn evict_stale(&self) -> usize {
        let now = Utc::now();
        let heartbeat_timeout = chrono::Duration::from_std(self.config.heartbeat_timeout)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let auth_timeout = chrono::Duration::from_std(self.config.auth_timeout)
            .unwrap_or_else(|_| chrono::Duration::MAX);

        let mut evicted = 0;
        for handle in self.registry.all_connections() {
            let reason = if handle.is_close_requested() {
                Some(CloseReason::SendQueueOverflow)
            } else {
                match handle.state() {
                    ConnectionState::Active
                        if now.signed_duration_since(handle.last_activity()) > heartbeat_timeout =>
                    {
                        Some(CloseReason::HeartbeatTimeout)
                    }
                    ConnectionState::Accepted | ConnectionState::Authenticating
                        if now.signed_duration_since(handle.connected_at) > auth_timeout =>
                    {
                        Some(CloseReason::AuthTimeout)
                    }
                    _ => None,
                }
            };

            if let Some(reason) = reason {
                tracing::info!(
                    connection_id = %handle.id,
                    reason = %reason,
                    "Evicting stale connection"
                );
                if self.close(handle.id, reason) {
                    evicted += 1;
                }
            }
        }

        evicted
    }
}
