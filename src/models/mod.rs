pub mod conversation;
pub mod message;

pub use conversation::{Conversation, ConversationPatch};
pub use message::{Message, Role};
