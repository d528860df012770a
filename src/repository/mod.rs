//! Conversation repository seam.
//!
//! Conversations and their participants are owned by the CRUD service. The
//! realtime layer only asks two questions of it, through
//! [`ConversationDirectory`].

mod memory;

use std::collections::HashSet;

use async_trait::async_trait;

use crate::domain::UserId;
use crate::error::GatewayError;

pub use memory::InMemoryConversationDirectory;

/// Read-only view of conversation participation.
///
/// Unknown conversations are reported as `GatewayError::NotFound`; backend
/// failures as `GatewayError::Repository`.
#[async_trait]
pub trait ConversationDirectory: Send + Sync {
    /// All users taking part in the conversation
    async fn participants_of(&self, conversation_id: &str) -> Result<HashSet<UserId>, GatewayError>;

    /// Whether `user_id` takes part in the conversation
    async fn is_participant(&self, user_id: &str, conversation_id: &str) -> Result<bool, GatewayError> {
        Ok(self.participants_of(conversation_id).await?.contains(user_id))
    }
}
