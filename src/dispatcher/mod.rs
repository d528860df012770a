//! Event fan-out for conversations and presence.
//!
//! The dispatcher holds no membership or presence state of its own. It reads
//! the registry, asks the conversation directory who may see what, and
//! enqueues events onto each recipient's bounded send queue. Enqueueing never
//! waits, so one slow or dead recipient cannot hold up the rest.
//!
//! Presence edges are queued from inside the tracker's per-user critical
//! section and announced strictly in that order, one announcement per edge.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::connection_manager::{ConnectionHandle, ConnectionRegistry};
use crate::domain::{ChatMessage, ConnectionId, UserId};
use crate::error::GatewayError;
use crate::metrics::FanoutMetrics;
use crate::presence::PresenceChange;
use crate::repository::ConversationDirectory;
use crate::rooms::JoinOutcome;
use crate::websocket::{OutboundMessage, ServerMessage};

/// Threshold for using pre-serialization (saves serialization overhead for larger sends)
const PRESERIALIZATION_THRESHOLD: usize = 4;

/// Delivery counts for one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// Connections the event was enqueued to
    pub delivered: usize,
    /// Connections whose queue was full or closed
    pub failed: usize,
}

impl DeliveryReport {
    fn merge(&mut self, other: DeliveryReport) {
        self.delivered += other.delivered;
        self.failed += other.failed;
    }
}

/// Result of `notify_message_created`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FanoutReport {
    pub message_id: String,
    /// Joined connections that received `message_created`
    pub delivered: usize,
    /// Other online participant connections that received `message_notification`
    pub notified: usize,
    pub failed: usize,
}

/// Statistics for the event dispatcher
#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub messages_dispatched: AtomicU64,
    pub total_delivered: AtomicU64,
    pub total_notified: AtomicU64,
    pub total_failed: AtomicU64,
    pub typing_relayed: AtomicU64,
    pub presence_broadcasts: AtomicU64,
    pub joins_rejected: AtomicU64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
            total_delivered: self.total_delivered.load(Ordering::Relaxed),
            total_notified: self.total_notified.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            typing_relayed: self.typing_relayed.load(Ordering::Relaxed),
            presence_broadcasts: self.presence_broadcasts.load(Ordering::Relaxed),
            joins_rejected: self.joins_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of dispatcher statistics
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStatsSnapshot {
    pub messages_dispatched: u64,
    pub total_delivered: u64,
    pub total_notified: u64,
    pub total_failed: u64,
    pub typing_relayed: u64,
    pub presence_broadcasts: u64,
    pub joins_rejected: u64,
}

/// Routes conversation and presence events to connected clients
pub struct EventDispatcher {
    registry: Arc<ConnectionRegistry>,
    conversations: Arc<dyn ConversationDirectory>,
    stats: DispatcherStats,
    /// Edges in the order the tracker produced them
    pending_presence: Mutex<VecDeque<PresenceChange>>,
    /// Held while announcing so edges leave in queue order
    announcing: Mutex<()>,
}

impl EventDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>, conversations: Arc<dyn ConversationDirectory>) -> Self {
        Self {
            registry,
            conversations,
            stats: DispatcherStats::default(),
            pending_presence: Mutex::new(VecDeque::new()),
            announcing: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Get dispatcher statistics
    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.stats.snapshot()
    }

    /// Join a conversation room after checking the user belongs to it.
    ///
    /// Membership is untouched on any error.
    #[tracing::instrument(name = "dispatcher.handle_join", skip(self))]
    pub async fn handle_join(
        &self,
        connection_id: ConnectionId,
        conversation_id: &str,
    ) -> Result<JoinOutcome, GatewayError> {
        let handle = self.registry.get(connection_id)?;
        let user_id = handle
            .user_id()
            .ok_or_else(|| GatewayError::Unauthenticated("connection is not authenticated".into()))?
            .to_string();

        if !self.conversations.is_participant(&user_id, conversation_id).await? {
            self.stats.joins_rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                connection_id = %connection_id,
                user_id = %user_id,
                conversation_id = %conversation_id,
                "Join rejected: not a participant"
            );
            return Err(GatewayError::Unauthorized(format!(
                "user {} is not a participant of conversation {}",
                user_id, conversation_id
            )));
        }

        self.registry.join_room(connection_id, conversation_id)
    }

    /// Leave a conversation room. Always succeeds.
    pub fn handle_leave(&self, connection_id: ConnectionId, conversation_id: &str) -> bool {
        self.registry.leave_room(connection_id, conversation_id)
    }

    /// Relay a typing indicator to the other people viewing the conversation.
    ///
    /// The sending connection must have joined the conversation.
    pub fn handle_typing(
        &self,
        connection_id: ConnectionId,
        conversation_id: &str,
        is_typing: bool,
    ) -> Result<DeliveryReport, GatewayError> {
        let handle = self.registry.get(connection_id)?;
        let identity = handle
            .identity()
            .cloned()
            .ok_or_else(|| GatewayError::Unauthenticated("connection is not authenticated".into()))?;

        if self.registry.rooms().current_room_of(connection_id).as_deref() != Some(conversation_id) {
            return Err(GatewayError::Unauthorized(format!(
                "connection has not joined conversation {}",
                conversation_id
            )));
        }

        let recipients: Vec<_> = self
            .registry
            .room_connections(conversation_id)
            .into_iter()
            .filter(|conn| conn.user_id() != Some(identity.user_id.as_str()))
            .collect();

        let message = ServerMessage::TypingChanged {
            conversation_id: conversation_id.to_string(),
            user_id: identity.user_id.clone(),
            username: identity.username.clone(),
            is_typing,
        };
        let report = self.send_to_connections(&recipients, &message);

        self.stats.typing_relayed.fetch_add(1, Ordering::Relaxed);
        self.record(&message, report);

        Ok(report)
    }

    /// Fan a freshly persisted message out to everyone who should see it.
    ///
    /// Joined connections of participants get `message_created`. Every other
    /// connection of an online participant gets `message_notification`.
    /// Offline participants get nothing.
    #[tracing::instrument(
        name = "dispatcher.notify_message_created",
        skip(self, message),
        fields(message_id = %message.id)
    )]
    pub async fn notify_message_created(
        &self,
        conversation_id: &str,
        message: ChatMessage,
    ) -> Result<FanoutReport, GatewayError> {
        if message.conversation_id != conversation_id {
            return Err(GatewayError::InvalidMessage(format!(
                "message {} belongs to conversation {}, not {}",
                message.id, message.conversation_id, conversation_id
            )));
        }

        let participants = self.conversations.participants_of(conversation_id).await?;

        let joined: Vec<Arc<ConnectionHandle>> = self
            .registry
            .room_connections(conversation_id)
            .into_iter()
            .filter(|conn| conn.user_id().is_some_and(|user| participants.contains(user)))
            .collect();
        let joined_ids: HashSet<ConnectionId> = joined.iter().map(|conn| conn.id).collect();

        let others: Vec<Arc<ConnectionHandle>> = participants
            .iter()
            .flat_map(|user_id| self.registry.user_connections(user_id))
            .filter(|conn| conn.is_active() && !joined_ids.contains(&conn.id))
            .collect();

        let created = ServerMessage::MessageCreated {
            conversation_id: conversation_id.to_string(),
            message: message.clone(),
        };
        let created_report = self.send_to_connections(&joined, &created);
        self.record(&created, created_report);

        let notification = ServerMessage::MessageNotification {
            conversation_id: conversation_id.to_string(),
            message: message.clone(),
        };
        let notified_report = self.send_to_connections(&others, &notification);
        self.record(&notification, notified_report);

        FanoutMetrics::record_recipients(created_report.delivered + notified_report.delivered);

        self.stats.messages_dispatched.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_delivered
            .fetch_add(created_report.delivered as u64, Ordering::Relaxed);
        self.stats
            .total_notified
            .fetch_add(notified_report.delivered as u64, Ordering::Relaxed);

        tracing::debug!(
            conversation_id = %conversation_id,
            delivered = created_report.delivered,
            notified = notified_report.delivered,
            failed = created_report.failed + notified_report.failed,
            "Dispatched message"
        );

        Ok(FanoutReport {
            message_id: message.id,
            delivered: created_report.delivered,
            notified: notified_report.delivered,
            failed: created_report.failed + notified_report.failed,
        })
    }

    /// Greet a newly authenticated connection with everyone who is online,
    /// its own user included.
    pub fn notify_connected(&self, connection_id: ConnectionId) -> DeliveryReport {
        let Some(handle) = self.registry.get_connection(connection_id) else {
            return DeliveryReport::default();
        };

        let mut user_ids: Vec<UserId> = self.registry.online_user_ids().into_iter().collect();
        user_ids.sort();
        let snapshot = ServerMessage::OnlineUsersSnapshot { user_ids };
        let report = self.send_to_connections(std::slice::from_ref(&handle), &snapshot);
        self.record(&snapshot, report);
        report
    }

    /// Queue a presence edge for announcement.
    ///
    /// Meant to run as the registry's presence hook, inside the user's
    /// critical section. Only takes the queue lock.
    pub fn queue_presence(&self, change: &PresenceChange) {
        self.pending_presence.lock().push_back(change.clone());
    }

    /// Announce every queued presence edge to all active connections, oldest
    /// first. Connections of the user the edge is about are left out; their
    /// greeting snapshot already lists that user.
    ///
    /// Must not be called while holding a registry or presence lock.
    pub fn flush_presence(&self) -> DeliveryReport {
        let _announcing = self.announcing.lock();
        let mut report = DeliveryReport::default();

        loop {
            let next = self.pending_presence.lock().pop_front();
            let Some(change) = next else {
                break;
            };
            report.merge(self.announce_presence(&change));
        }

        report
    }

    /// Send an event to every authenticated connection
    pub fn broadcast(&self, message: &ServerMessage) -> DeliveryReport {
        let connections = self.registry.active_connections();
        let report = self.send_to_connections(&connections, message);
        self.record(message, report);
        report
    }

    fn announce_presence(&self, change: &PresenceChange) -> DeliveryReport {
        let message = ServerMessage::PresenceChanged {
            user_id: change.user_id.clone(),
            online: change.online,
        };
        let recipients: Vec<_> = self
            .registry
            .active_connections()
            .into_iter()
            .filter(|conn| conn.user_id() != Some(change.user_id.as_str()))
            .collect();

        let report = self.send_to_connections(&recipients, &message);
        self.stats.presence_broadcasts.fetch_add(1, Ordering::Relaxed);
        self.record(&message, report);
        report
    }

    fn record(&self, message: &ServerMessage, report: DeliveryReport) {
        self.stats
            .total_failed
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        FanoutMetrics::record_sent(message.kind(), report.delivered as u64);
        FanoutMetrics::record_failed(report.failed as u64);
    }

    /// Enqueue one message to each connection, in order.
    ///
    /// Pre-serializes the message once for larger sends to avoid repeated
    /// serialization. A failed recipient is flagged for closing by its handle
    /// and does not affect the others.
    fn send_to_connections(
        &self,
        connections: &[Arc<ConnectionHandle>],
        message: &ServerMessage,
    ) -> DeliveryReport {
        if connections.is_empty() {
            return DeliveryReport::default();
        }

        let outbound = if connections.len() >= PRESERIALIZATION_THRESHOLD {
            match OutboundMessage::preserialized(message) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to pre-serialize message, falling back to per-connection serialization");
                    OutboundMessage::Raw(message.clone())
                }
            }
        } else {
            OutboundMessage::Raw(message.clone())
        };

        let mut report = DeliveryReport::default();
        for conn in connections {
            match conn.send_outbound(outbound.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        connection_id = %conn.id,
                        kind = message.kind(),
                        error = %e,
                        "Dropped event for unresponsive connection"
                    );
                }
            }
        }
        report
    }
}
