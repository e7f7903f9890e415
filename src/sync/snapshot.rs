use crate::models::{Conversation, Message};
use crate::services::conversation::{group_messages, MessageGroup};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SyncStatus {
    #[default]
    Closed,
    Loading,
    Ready,
    /// The conversation disappeared from the store while open.
    Deleted,
    Failed(String),
}

/// Everything a view needs to render the open conversation. Replaced as a
/// whole on every fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub conversation: Option<Conversation>,
    pub messages: Vec<Message>,
    pub status: SyncStatus,
    /// A `send_message` is in flight; input should stay disabled.
    pub sending: bool,
}

impl Snapshot {
    pub fn loading() -> Self {
        Self {
            status: SyncStatus::Loading,
            ..Self::default()
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: SyncStatus::Failed(reason.into()),
            ..Self::default()
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation.as_ref().map(|c| c.id.as_str())
    }

    pub fn title(&self) -> Option<&str> {
        self.conversation.as_ref().map(|c| c.title.as_str())
    }

    pub fn is_ready(&self) -> bool {
        self.status == SyncStatus::Ready
    }

    pub fn groups(&self) -> Vec<MessageGroup<'_>> {
        group_messages(&self.messages)
    }

    pub(crate) fn replace_messages(&mut self, mut messages: Vec<Message>) {
        // Stable, so the store's tie order survives.
        messages.sort_by_key(|m| m.created_at);
        self.messages = messages;
    }
}
