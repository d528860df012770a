//! Connection handle and related types

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::domain::{ConnectionId, VerifiedIdentity};
use crate::error::GatewayError;
use crate::websocket::{OutboundMessage, ServerMessage};

/// Lifecycle of one connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Accepted = 0,
    Authenticating = 1,
    Active = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Accepted,
            1 => Self::Authenticating,
            2 => Self::Active,
            _ => Self::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Authenticating => "authenticating",
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }
}

/// Handle for a single WebSocket connection
pub struct ConnectionHandle {
    pub id: ConnectionId,
    sender: mpsc::Sender<OutboundMessage>,
    identity: OnceLock<VerifiedIdentity>,
    state: AtomicU8,
    pub connected_at: DateTime<Utc>,
    /// Last inbound activity (Unix millis) - AtomicI64 for lock-free updates
    last_activity: AtomicI64,
    close_requested: AtomicBool,
    close_notify: Notify,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::Sender<OutboundMessage>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            sender,
            identity: OnceLock::new(),
            state: AtomicU8::new(ConnectionState::Accepted as u8),
            connected_at: now,
            last_activity: AtomicI64::new(now.timestamp_millis()),
            close_requested: AtomicBool::new(false),
            close_notify: Notify::new(),
        }
    }

    pub fn identity(&self) -> Option<&VerifiedIdentity> {
        self.identity.get()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.identity.get().map(|identity| identity.user_id.as_str())
    }

    /// Bind the verified identity. Binding the same user again is a no-op;
    /// binding a different user fails.
    pub(crate) fn bind(&self, identity: VerifiedIdentity) -> Result<(), GatewayError> {
        let bound = self.identity.get_or_init(|| identity.clone());
        if bound.user_id == identity.user_id {
            Ok(())
        } else {
            Err(GatewayError::Unauthenticated(format!(
                "connection {} is already bound to another user",
                self.id
            )))
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`. Fails if the current state is not `from`.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Enter `Closed`. Returns true only for the caller that performed the transition.
    pub fn mark_closed(&self) -> bool {
        self.state.swap(ConnectionState::Closed as u8, Ordering::AcqRel) != ConnectionState::Closed as u8
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn update_activity(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_activity.load(Ordering::Relaxed))
            .unwrap_or_else(Utc::now)
    }

    /// Enqueue a message without waiting.
    ///
    /// A full or closed queue means the peer is not keeping up; the
    /// connection is flagged for closing and the send fails.
    pub fn send(&self, message: ServerMessage) -> Result<(), GatewayError> {
        self.send_outbound(OutboundMessage::Raw(message))
    }

    /// Send a pre-serialized message (for efficient multi-send scenarios)
    pub fn send_outbound(&self, message: OutboundMessage) -> Result<(), GatewayError> {
        match self.sender.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.request_close();
                Err(GatewayError::TransportFailure(format!(
                    "send queue full for connection {}",
                    self.id
                )))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.request_close();
                Err(GatewayError::TransportFailure(format!(
                    "connection {} is closed",
                    self.id
                )))
            }
        }
    }

    /// Ask whoever owns the transport to tear this connection down.
    pub fn request_close(&self) {
        if !self.close_requested.swap(true, Ordering::AcqRel) {
            self.close_notify.notify_waiters();
        }
    }

    pub fn is_close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    /// Resolves once `request_close` has been called.
    pub async fn closed(&self) {
        loop {
            let notified = self.close_notify.notified();
            if self.is_close_requested() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("user_id", &self.user_id())
            .field("state", &self.state())
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

/// Error returned when connection limits are exceeded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("Total connection limit exceeded ({current}/{max})")]
    TotalLimitExceeded { current: usize, max: usize },
    #[error("User {user_id} connection limit exceeded ({current}/{max})")]
    UserLimitExceeded { user_id: String, current: usize, max: usize },
}

/// Limits for connection management
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_connections: usize,
    pub max_connections_per_user: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_connections: 10000,
            max_connections_per_user: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn handle_with_capacity(capacity: usize) -> (ConnectionHandle, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (ConnectionHandle::new(tx), rx)
    }

    #[test]
    fn test_bind_is_once_per_user() {
        let (handle, _rx) = handle_with_capacity(1);
        assert!(handle.user_id().is_none());

        handle.bind(VerifiedIdentity::new("alice", "Alice")).unwrap();
        // Same user again is fine
        handle.bind(VerifiedIdentity::new("alice", "Alice")).unwrap();

        let err = handle.bind(VerifiedIdentity::new("bob", "Bob")).unwrap_err();
        assert!(matches!(err, GatewayError::Unauthenticated(_)));
        assert_eq!(handle.user_id(), Some("alice"));
    }

    #[test]
    fn test_state_transitions() {
        let (handle, _rx) = handle_with_capacity(1);
        assert_eq!(handle.state(), ConnectionState::Accepted);

        assert!(handle.transition(ConnectionState::Accepted, ConnectionState::Authenticating));
        assert!(!handle.transition(ConnectionState::Accepted, ConnectionState::Active));
        assert!(handle.transition(ConnectionState::Authenticating, ConnectionState::Active));
        assert!(handle.is_active());

        assert!(handle.mark_closed());
        assert!(!handle.mark_closed());
        assert_eq!(handle.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_full_queue_flags_connection() {
        let (handle, _rx) = handle_with_capacity(1);

        handle.send(ServerMessage::Heartbeat).unwrap();
        let err = handle.send(ServerMessage::Heartbeat).unwrap_err();

        assert!(matches!(err, GatewayError::TransportFailure(_)));
        assert!(handle.is_close_requested());
    }

    #[test]
    fn test_closed_receiver_flags_connection() {
        let (handle, rx) = handle_with_capacity(4);
        drop(rx);

        assert!(handle.send(ServerMessage::Heartbeat).is_err());
        assert!(handle.is_close_requested());
    }

    #[tokio::test]
    async fn test_closed_resolves_after_request() {
        let (handle, _rx) = handle_with_capacity(1);
        let handle = Arc::new(handle);

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.closed().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.request_close();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("closed() should resolve")
            .unwrap();

        // Already requested: resolves immediately
        handle.closed().await;
    }

    #[test]
    fn test_update_activity() {
        let (handle, _rx) = handle_with_capacity(1);
        let before = handle.last_activity();
        std::thread::sleep(Duration::from_millis(5));
        handle.update_activity();
        assert!(handle.last_activity() > before);
    }
}
