pub mod conversation;
pub mod database;
pub mod directory;
pub mod notifier;
pub mod store;

pub use database::Database;
pub use directory::ConversationDirectory;
pub use notifier::{ChangeHub, ChangeNotifier};
pub use store::{ConversationStore, StoreError};
