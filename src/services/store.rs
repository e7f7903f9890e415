use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Conversation, ConversationPatch, Message};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Conversation not found")]
    NotFound,

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Persistence seam for conversations and their messages.
///
/// Implementations are not required to cascade deletes: callers remove a
/// conversation's messages before removing the conversation itself.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Fetch a conversation, failing with `NotFound` unless it is owned by `owner_id`.
    async fn get_conversation(&self, id: &str, owner_id: &str) -> Result<Conversation, StoreError>;

    /// All conversations of an owner, pinned first, then most recently updated first.
    async fn list_conversations(&self, owner_id: &str) -> Result<Vec<Conversation>, StoreError>;

    /// Messages of a conversation ordered by creation time, ties by insertion order.
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError>;

    async fn insert_message(&self, message: &Message) -> Result<(), StoreError>;

    async fn update_conversation(
        &self,
        id: &str,
        patch: &ConversationPatch,
    ) -> Result<(), StoreError>;

    async fn delete_messages(&self, conversation_id: &str) -> Result<(), StoreError>;

    async fn delete_conversation(&self, id: &str) -> Result<(), StoreError>;

    async fn create_conversation(&self, owner_id: &str, title: &str)
        -> Result<Conversation, StoreError>;
}
