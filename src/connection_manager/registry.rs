use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::stats::ConnectionStats;
use super::types::{ConnectionError, ConnectionHandle, ConnectionLimits};
use crate::domain::{ConnectionId, ConversationId, UserId, VerifiedIdentity};
use crate::error::GatewayError;
use crate::presence::{PresenceChange, PresenceTracker};
use crate::rooms::{JoinOutcome, RoomIndex};
use crate::websocket::OutboundMessage;

/// Result of binding an identity to a connection
#[derive(Debug, Clone)]
pub struct BindOutcome {
    pub identity: VerifiedIdentity,
    /// Set when this connection took the user from offline to online
    pub presence: Option<PresenceChange>,
}

/// What was torn down when a connection left the registry
pub struct UnregisterOutcome {
    pub handle: Arc<ConnectionHandle>,
    pub left_room: Option<ConversationId>,
    /// Set when this was the user's last connection
    pub presence: Option<PresenceChange>,
}

/// Manages all live WebSocket connections.
///
/// Owns the connection table and keeps the room index and presence tracker
/// consistent with it: a connection appears in either only while it is
/// registered here.
pub struct ConnectionRegistry {
    /// connection_id -> ConnectionHandle
    connections: DashMap<Uuid, Arc<ConnectionHandle>>,
    rooms: Arc<RoomIndex>,
    presence: Arc<PresenceTracker>,
    limits: ConnectionLimits,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_limits(ConnectionLimits::default())
    }

    pub fn with_limits(limits: ConnectionLimits) -> Self {
        Self {
            connections: DashMap::new(),
            rooms: Arc::new(RoomIndex::new()),
            presence: Arc::new(PresenceTracker::new()),
            limits,
        }
    }

    pub fn rooms(&self) -> &Arc<RoomIndex> {
        &self.rooms
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn limits(&self) -> ConnectionLimits {
        self.limits
    }

    /// Register a new, not yet authenticated connection
    pub fn register(
        &self,
        sender: mpsc::Sender<OutboundMessage>,
    ) -> Result<Arc<ConnectionHandle>, ConnectionError> {
        let current = self.connections.len();
        if current >= self.limits.max_connections {
            tracing::warn!(
                current = current,
                max = self.limits.max_connections,
                "Connection rejected: total limit exceeded"
            );
            return Err(ConnectionError::TotalLimitExceeded {
                current,
                max: self.limits.max_connections,
            });
        }

        let handle = Arc::new(ConnectionHandle::new(sender));
        self.connections.insert(handle.id, handle.clone());

        tracing::debug!(connection_id = %handle.id, "Connection registered");

        Ok(handle)
    }

    /// Attach a verified identity to a registered connection.
    ///
    /// The connection entry stays locked for the duration, so a concurrent
    /// `unregister` either completes first (and this fails with `NotFound`)
    /// or waits and then sees the bound identity. `on_online` runs inside the
    /// user's presence critical section if this connection brings them online.
    pub fn bind_identity(
        &self,
        connection_id: ConnectionId,
        identity: VerifiedIdentity,
        on_online: impl FnOnce(&PresenceChange),
    ) -> Result<BindOutcome, GatewayError> {
        let handle = self
            .connections
            .get(&connection_id)
            .ok_or_else(|| GatewayError::NotFound(format!("connection {}", connection_id)))?;

        handle.bind(identity.clone())?;

        let presence = self
            .presence
            .try_add_connection(
                &identity.user_id,
                connection_id,
                self.limits.max_connections_per_user,
                on_online,
            )
            .map_err(|current| {
                tracing::warn!(
                    user_id = %identity.user_id,
                    current = current,
                    max = self.limits.max_connections_per_user,
                    "Connection rejected: per-user limit exceeded"
                );
                GatewayError::from(ConnectionError::UserLimitExceeded {
                    user_id: identity.user_id.clone(),
                    current,
                    max: self.limits.max_connections_per_user,
                })
            })?;

        tracing::info!(
            connection_id = %connection_id,
            user_id = %identity.user_id,
            "Connection bound to user"
        );

        Ok(BindOutcome { identity, presence })
    }

    /// Remove a connection and everything derived from it.
    ///
    /// Only the first call for a given id returns `Some`. `on_offline` runs
    /// inside the user's presence critical section if this was their last
    /// connection.
    pub fn unregister(
        &self,
        connection_id: ConnectionId,
        on_offline: impl FnOnce(&PresenceChange),
    ) -> Option<UnregisterOutcome> {
        let (_, handle) = self.connections.remove(&connection_id)?;
        handle.mark_closed();

        let left_room = self.rooms.remove_connection(connection_id);
        let presence = handle
            .user_id()
            .and_then(|user_id| self.presence.remove_connection(user_id, connection_id, on_offline));

        tracing::info!(
            connection_id = %connection_id,
            user_id = ?handle.user_id(),
            left_room = ?left_room,
            "Connection unregistered"
        );

        Some(UnregisterOutcome {
            handle,
            left_room,
            presence,
        })
    }

    /// Look up a connection, failing with `NotFound`
    pub fn get(&self, connection_id: ConnectionId) -> Result<Arc<ConnectionHandle>, GatewayError> {
        self.get_connection(connection_id)
            .ok_or_else(|| GatewayError::NotFound(format!("connection {}", connection_id)))
    }

    /// Get connection by ID
    pub fn get_connection(&self, connection_id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&connection_id).map(|h| h.clone())
    }

    pub fn connections_for_user(&self, user_id: &str) -> HashSet<ConnectionId> {
        self.presence.connections_for_user(user_id)
    }

    /// Get all connections for a user
    pub fn user_connections(&self, user_id: &str) -> Vec<Arc<ConnectionHandle>> {
        self.presence
            .connections_for_user(user_id)
            .iter()
            .filter_map(|id| self.get_connection(*id))
            .collect()
    }

    /// Put an authenticated connection into a conversation room
    pub fn join_room(
        &self,
        connection_id: ConnectionId,
        conversation_id: &str,
    ) -> Result<JoinOutcome, GatewayError> {
        // Held so the connection cannot be unregistered mid-join
        let handle = self
            .connections
            .get(&connection_id)
            .ok_or_else(|| GatewayError::NotFound(format!("connection {}", connection_id)))?;

        if !handle.is_active() {
            return Err(GatewayError::Unauthenticated(format!(
                "connection {} is not authenticated",
                connection_id
            )));
        }

        Ok(self.rooms.join(connection_id, conversation_id))
    }

    pub fn leave_room(&self, connection_id: ConnectionId, conversation_id: &str) -> bool {
        self.rooms.leave(connection_id, conversation_id)
    }

    /// Connections currently viewing a conversation
    pub fn room_connections(&self, conversation_id: &str) -> Vec<Arc<ConnectionHandle>> {
        self.rooms
            .members_of(conversation_id)
            .iter()
            .filter_map(|id| self.get_connection(*id))
            .collect()
    }

    /// Authenticated connections only
    pub fn active_connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .iter()
            .filter(|r| r.value().is_active())
            .map(|r| r.value().clone())
            .collect()
    }

    /// Get all connections
    pub fn all_connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.iter().map(|r| r.value().clone()).collect()
    }

    pub fn online_user_ids(&self) -> HashSet<UserId> {
        self.presence.online_user_ids()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Get statistics
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            total_connections: self.connections.len(),
            unique_users: self.presence.online_count(),
            rooms: self.rooms.room_sizes(),
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
