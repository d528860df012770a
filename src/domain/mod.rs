//! Core identifiers and records shared across the realtime layer.
//!
//! Messages, users and conversations are owned by the CRUD service. This
//! crate only sees the persisted message record it is asked to fan out and
//! the identity established at handshake time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque id of one transport session. Generated on accept, never reused.
pub type ConnectionId = Uuid;

/// User id as issued by the authentication service (JWT `sub`).
pub type UserId = String;

/// Conversation id as stored by the conversation repository.
pub type ConversationId = String;

/// A message record that has already been durably persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Identity bound to a connection after successful token verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedIdentity {
    pub user_id: UserId,
    pub username: String,
}

impl VerifiedIdentity {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message_uses_camel_case() {
        let message = ChatMessage {
            id: "m1".to_string(),
            conversation_id: "conv1".to_string(),
            sender_id: "alice".to_string(),
            content: "hola".to_string(),
            created_at: Utc::now(),
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["conversationId"], "conv1");
        assert_eq!(json["senderId"], "alice");
        assert!(json.get("createdAt").is_some());
    }
}
