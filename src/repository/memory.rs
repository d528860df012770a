//! In-memory conversation directory using DashMap.
//!
//! The CRUD service keeps it in sync through the participants endpoint.
//! Contents are lost on restart and repopulated as conversations are synced.

use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::domain::{ConversationId, UserId};
use crate::error::GatewayError;

use super::ConversationDirectory;

#[derive(Default)]
pub struct InMemoryConversationDirectory {
    /// conversation_id -> participant user ids
    conversations: DashMap<ConversationId, HashSet<UserId>>,
}

impl InMemoryConversationDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the participant set of a conversation, creating it if needed
    pub fn upsert<I, S>(&self, conversation_id: impl Into<String>, participants: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let conversation_id = conversation_id.into();
        let participants: HashSet<UserId> = participants.into_iter().map(Into::into).collect();

        tracing::debug!(
            conversation_id = %conversation_id,
            participants = participants.len(),
            "Conversation participants updated"
        );

        self.conversations.insert(conversation_id, participants);
    }

    /// Forget a conversation. Returns false if it was unknown.
    pub fn remove(&self, conversation_id: &str) -> bool {
        self.conversations.remove(conversation_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}

#[async_trait]
impl ConversationDirectory for InMemoryConversationDirectory {
    async fn participants_of(&self, conversation_id: &str) -> Result<HashSet<UserId>, GatewayError> {
        self.conversations
            .get(conversation_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| GatewayError::NotFound(format!("conversation {}", conversation_id)))
    }

    async fn is_participant(&self, user_id: &str, conversation_id: &str) -> Result<bool, GatewayError> {
        self.conversations
            .get(conversation_id)
            .map(|entry| entry.value().contains(user_id))
            .ok_or_else(|| GatewayError::NotFound(format!("conversation {}", conversation_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_participants_lookup() {
        let directory = InMemoryConversationDirectory::new();
        directory.upsert("conv1", ["alice", "bob"]);

        let participants = directory.participants_of("conv1").await.unwrap();
        assert_eq!(participants.len(), 2);
        assert!(directory.is_participant("alice", "conv1").await.unwrap());
        assert!(!directory.is_participant("carol", "conv1").await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_conversation_is_not_found() {
        let directory = InMemoryConversationDirectory::new();

        assert!(matches!(
            directory.participants_of("missing").await,
            Err(GatewayError::NotFound(_))
        ));
        assert!(matches!(
            directory.is_participant("alice", "missing").await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_upsert_replaces_and_remove_forgets() {
        let directory = InMemoryConversationDirectory::new();
        directory.upsert("conv1", ["alice", "bob"]);
        directory.upsert("conv1", ["alice"]);

        assert!(!directory.is_participant("bob", "conv1").await.unwrap());

        assert!(directory.remove("conv1"));
        assert!(!directory.remove("conv1"));
        assert!(directory.is_empty());
    }
}
