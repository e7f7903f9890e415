use std::sync::Arc;

use chrono::{Local, NaiveDate};
use tokio::sync::watch;

use crate::config::DEFAULT_TITLE;
use crate::models::{Conversation, ConversationPatch};
use crate::services::notifier::{ChangeNotifier, ChangeSignal, OnChange, SubscriptionHandle};
use crate::services::store::ConversationStore;
use crate::sync::SyncError;

/// The per-user list of conversations shown next to the open one.
#[derive(Clone)]
pub struct ConversationDirectory {
    store: Arc<dyn ConversationStore>,
    notifier: Arc<dyn ChangeNotifier>,
}

/// A user's conversation list, re-listed on every conversation-row change.
/// Dropping it ends the subscription.
pub struct DirectoryWatch {
    rx: watch::Receiver<Vec<Conversation>>,
    notifier: Arc<dyn ChangeNotifier>,
    subscription: Option<SubscriptionHandle>,
}

impl DirectoryWatch {
    pub fn receiver(&self) -> watch::Receiver<Vec<Conversation>> {
        self.rx.clone()
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.rx.borrow().clone()
    }
}

impl Drop for DirectoryWatch {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            self.notifier.unsubscribe(subscription);
        }
    }
}

impl ConversationDirectory {
    pub fn new(store: Arc<dyn ConversationStore>, notifier: Arc<dyn ChangeNotifier>) -> Self {
        Self { store, notifier }
    }

    pub async fn new_conversation(&self, user_id: &str) -> Result<Conversation, SyncError> {
        let conversation = self
            .store
            .create_conversation(user_id, DEFAULT_TITLE)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create conversation: {}", e);
                SyncError::from(e)
            })?;
        tracing::info!(conversation_id = %conversation.id, "Created conversation");
        Ok(conversation)
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<Conversation>, SyncError> {
        Ok(self.store.list_conversations(user_id).await?)
    }

    /// Case-insensitive title filter over `list`.
    pub async fn search(&self, user_id: &str, query: &str) -> Result<Vec<Conversation>, SyncError> {
        let needle = query.trim().to_lowercase();
        let conversations = self.list(user_id).await?;
        if needle.is_empty() {
            return Ok(conversations);
        }
        Ok(conversations
            .into_iter()
            .filter(|c| c.title.to_lowercase().contains(&needle))
            .collect())
    }

    /// Fails with `NotFound` unless `user_id` owns the conversation.
    pub async fn set_pinned(
        &self,
        user_id: &str,
        conversation_id: &str,
        pinned: bool,
    ) -> Result<(), SyncError> {
        self.store.get_conversation(conversation_id, user_id).await?;
        self.store
            .update_conversation(conversation_id, &ConversationPatch::pinned(pinned))
            .await?;
        Ok(())
    }

    /// Live version of `list`. Subscribes first, then lists, so no change
    /// between the two is missed.
    pub async fn watch(&self, user_id: &str) -> Result<DirectoryWatch, SyncError> {
        let (tx, rx) = watch::channel(Vec::new());
        let tx = Arc::new(tx);
        let subscription = self
            .notifier
            .subscribe_owner(user_id, self.relist_callback(user_id, tx.clone()));
        let directory_watch = DirectoryWatch {
            rx,
            notifier: self.notifier.clone(),
            subscription: Some(subscription),
        };

        let conversations = self.list(user_id).await?;
        tx.send_replace(conversations);
        tracing::debug!(user_id, "Watching conversation list");
        Ok(directory_watch)
    }

    fn relist_callback(&self, user_id: &str, tx: Arc<watch::Sender<Vec<Conversation>>>) -> OnChange {
        let store = self.store.clone();
        let user_id = user_id.to_string();
        let runtime = tokio::runtime::Handle::try_current().ok();
        Arc::new(move |_signal: ChangeSignal| {
            let Some(runtime) = runtime.as_ref() else {
                tracing::warn!("Change received outside an async runtime, ignoring");
                return;
            };
            let store = store.clone();
            let user_id = user_id.clone();
            let tx = tx.clone();
            runtime.spawn(async move {
                match store.list_conversations(&user_id).await {
                    Ok(conversations) => {
                        tx.send_replace(conversations);
                    }
                    Err(e) => {
                        tracing::warn!(user_id = %user_id, "Failed to refresh conversation list: {}", e)
                    }
                }
            });
        })
    }
}

/// Bucket conversations by the local calendar day they were last updated,
/// keeping the incoming order both across and within buckets.
pub fn group_by_day(conversations: Vec<Conversation>) -> Vec<(NaiveDate, Vec<Conversation>)> {
    let mut groups: Vec<(NaiveDate, Vec<Conversation>)> = Vec::new();
    for conversation in conversations {
        let day = conversation.updated_at.with_timezone(&Local).date_naive();
        match groups.iter_mut().find(|(d, _)| *d == day) {
            Some((_, bucket)) => bucket.push(conversation),
            None => groups.push((day, vec![conversation])),
        }
    }
    groups
}
