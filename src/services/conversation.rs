use crate::config::{TITLE_ELLIPSIS, TITLE_MAX_CHARS};
use crate::models::{Message, Role};

/// Derive a conversation title from the text of its first message.
///
/// Text of at most 30 characters is returned unchanged; longer text keeps its
/// first 30 characters followed by an ellipsis. Applying it to its own output
/// yields the same title.
pub fn derive_title(text: &str) -> String {
    match text.char_indices().nth(TITLE_MAX_CHARS) {
        None => text.to_string(),
        Some((cut, _)) => format!("{}{}", &text[..cut], TITLE_ELLIPSIS),
    }
}

/// A maximal run of consecutive messages sharing a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageGroup<'a> {
    pub role: Role,
    pub messages: &'a [Message],
}

impl<'a> MessageGroup<'a> {
    /// The message rendered with the avatar.
    pub fn leader(&self) -> &'a Message {
        &self.messages[0]
    }

    /// Messages paired with whether they lead the group.
    pub fn iter(&self) -> impl Iterator<Item = (bool, &'a Message)> + 'a {
        self.messages.iter().enumerate().map(|(i, m)| (i == 0, m))
    }
}

pub fn group_messages(messages: &[Message]) -> Vec<MessageGroup<'_>> {
    messages
        .chunk_by(|a, b| a.role == b.role)
        .map(|run| MessageGroup {
            role: run[0].role,
            messages: run,
        })
        .collect()
}
