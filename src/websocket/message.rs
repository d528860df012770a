use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{ChatMessage, ConversationId, UserId};
use crate::error::GatewayError;

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    Authenticate { token: String },
    Join { conversation_id: ConversationId },
    Leave { conversation_id: ConversationId },
    Typing { conversation_id: ConversationId, is_typing: bool },
    Heartbeat,
}

impl ClientMessage {
    /// Kind label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::Typing { .. } => "typing",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    Authenticated { connection_id: Uuid, user_id: UserId },
    Joined { conversation_id: ConversationId },
    Left { conversation_id: ConversationId },
    MessageCreated { conversation_id: ConversationId, message: ChatMessage },
    MessageNotification { conversation_id: ConversationId, message: ChatMessage },
    TypingChanged {
        conversation_id: ConversationId,
        user_id: UserId,
        username: String,
        is_typing: bool,
    },
    PresenceChanged { user_id: UserId, online: bool },
    OnlineUsersSnapshot { user_ids: Vec<UserId> },
    Heartbeat,
    HeartbeatAck,
    Error { code: String, message: String },
    Shutdown { reason: String, reconnect_after_seconds: u64 },
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authenticated { .. } => "authenticated",
            Self::Joined { .. } => "joined",
            Self::Left { .. } => "left",
            Self::MessageCreated { .. } => "message_created",
            Self::MessageNotification { .. } => "message_notification",
            Self::TypingChanged { .. } => "typing_changed",
            Self::PresenceChanged { .. } => "presence_changed",
            Self::OnlineUsersSnapshot { .. } => "online_users_snapshot",
            Self::Heartbeat => "heartbeat",
            Self::HeartbeatAck => "heartbeat_ack",
            Self::Error { .. } => "error",
            Self::Shutdown { .. } => "shutdown",
        }
    }
}

impl From<&GatewayError> for ServerMessage {
    fn from(err: &GatewayError) -> Self {
        Self::error(err.code(), err.to_string())
    }
}

/// What actually travels through a connection's send queue.
///
/// Fan-out to many recipients serializes once and shares the text.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Raw(ServerMessage),
    Preserialized(Arc<str>),
}

impl OutboundMessage {
    pub fn preserialized(message: &ServerMessage) -> Result<Self, serde_json::Error> {
        let json = serde_json::to_string(message)?;
        Ok(Self::Preserialized(Arc::from(json)))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Raw(message) => serde_json::to_string(message),
            Self::Preserialized(json) => Ok(json.to_string()),
        }
    }

    /// Decode back into a `ServerMessage`, whichever form it is in
    pub fn to_server_message(&self) -> Result<ServerMessage, serde_json::Error> {
        match self {
            Self::Raw(message) => Ok(message.clone()),
            Self::Preserialized(json) => serde_json::from_str(json),
        }
    }
}

impl From<ServerMessage> for OutboundMessage {
    fn from(message: ServerMessage) -> Self {
        Self::Raw(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_client_messages() {
        let join: ClientMessage =
            serde_json::from_value(json!({"type": "join", "payload": {"conversationId": "conv1"}}))
                .unwrap();
        assert_eq!(join, ClientMessage::Join { conversation_id: "conv1".into() });

        let typing: ClientMessage = serde_json::from_value(
            json!({"type": "typing", "payload": {"conversationId": "conv1", "isTyping": true}}),
        )
        .unwrap();
        assert_eq!(
            typing,
            ClientMessage::Typing { conversation_id: "conv1".into(), is_typing: true }
        );

        let heartbeat: ClientMessage = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(heartbeat, ClientMessage::Heartbeat);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let result = serde_json::from_str::<ClientMessage>(r#"{"type":"subscribe","payload":{}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_server_message_envelope() {
        let msg = ServerMessage::PresenceChanged { user_id: "alice".into(), online: true };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"type": "presence_changed", "payload": {"userId": "alice", "online": true}})
        );

        let snapshot = ServerMessage::OnlineUsersSnapshot { user_ids: vec!["a".into()] };
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["payload"]["userIds"], json!(["a"]));
    }

    #[test]
    fn test_preserialized_matches_raw() {
        let msg = ServerMessage::TypingChanged {
            conversation_id: "conv1".into(),
            user_id: "alice".into(),
            username: "Alice".into(),
            is_typing: false,
        };
        let raw = OutboundMessage::Raw(msg.clone());
        let pre = OutboundMessage::preserialized(&msg).unwrap();

        assert_eq!(raw.to_json().unwrap(), pre.to_json().unwrap());
        assert_eq!(pre.to_server_message().unwrap(), msg);
    }

    #[test]
    fn test_error_from_gateway_error() {
        let msg = ServerMessage::from(&GatewayError::Unauthorized("conv1".into()));
        assert!(matches!(msg, ServerMessage::Error { ref code, .. } if code == "UNAUTHORIZED"));
    }
}
