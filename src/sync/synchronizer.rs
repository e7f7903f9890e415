use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Utc;
use tokio::sync::watch;

use crate::config::{DEFAULT_TITLE, EMPTY_REPLY_FALLBACK, RESPONDER_FAILURE_REPLY};
use crate::models::{ConversationPatch, Message, Role};
use crate::providers::{Responder, ResponderRequest};
use crate::services::conversation::derive_title;
use crate::services::notifier::{ChangeNotifier, ChangeSignal, OnChange, SubscriptionHandle};
use crate::services::store::{ConversationStore, StoreError};

use super::error::{SendOutcome, SyncError};
use super::snapshot::{Snapshot, SyncStatus};

/// Owns the snapshot of the open conversation and every write made to it.
///
/// Each `open` and `close` starts a new generation. Anything that completes
/// asynchronously (fetches, push callbacks, sends) remembers the generation
/// it started under and is dropped if that generation is no longer current.
#[derive(Clone)]
pub struct Synchronizer {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn ConversationStore>,
    notifier: Arc<dyn ChangeNotifier>,
    responder: Arc<dyn Responder>,
    state: Mutex<State>,
    snapshot: watch::Sender<Snapshot>,
}

#[derive(Default)]
struct State {
    generation: u64,
    binding: Option<Binding>,
}

struct Binding {
    conversation_id: String,
    user_id: String,
    subscription: Option<SubscriptionHandle>,
    sending: bool,
}

/// Identity of the bound conversation, captured when an operation starts.
#[derive(Debug, Clone)]
struct Bound {
    generation: u64,
    conversation_id: String,
    user_id: String,
}

impl Synchronizer {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        notifier: Arc<dyn ChangeNotifier>,
        responder: Arc<dyn Responder>,
    ) -> Self {
        let (snapshot, _) = watch::channel(Snapshot::default());
        Self {
            inner: Arc::new(Inner {
                store,
                notifier,
                responder,
                state: Mutex::new(State::default()),
                snapshot,
            }),
        }
    }

    /// Receiver that sees every published snapshot.
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn conversation_id(&self) -> Option<String> {
        self.inner
            .lock()
            .binding
            .as_ref()
            .map(|b| b.conversation_id.clone())
    }

    pub fn is_busy(&self) -> bool {
        self.inner
            .lock()
            .binding
            .as_ref()
            .is_some_and(|b| b.sending)
    }

    pub async fn open(&self, conversation_id: &str, user_id: &str) -> Result<Snapshot, SyncError> {
        let generation = self.inner.rebind(Snapshot::loading());
        tracing::debug!(conversation_id, generation, "Opening conversation");

        let conversation = match self.inner.store.get_conversation(conversation_id, user_id).await {
            Ok(conversation) => conversation,
            Err(e) => return Err(self.inner.fail_open(generation, e)),
        };

        let subscription = self
            .inner
            .notifier
            .subscribe(conversation_id, self.change_callback(generation));
        if let Err(stale) = self.inner.bind(generation, conversation_id, user_id, subscription) {
            self.inner.notifier.unsubscribe(stale);
            return Err(SyncError::Cancelled);
        }

        let messages = match self.inner.store.list_messages(conversation_id).await {
            Ok(messages) => messages,
            Err(e) => return Err(self.inner.fail_open(generation, e)),
        };

        let applied = self.inner.publish_if_current(generation, move |snapshot| {
            snapshot.conversation = Some(conversation);
            snapshot.replace_messages(messages);
            snapshot.status = SyncStatus::Ready;
        });
        if !applied {
            return Err(SyncError::Cancelled);
        }

        tracing::info!(conversation_id, "Conversation opened");
        Ok(self.snapshot())
    }

    /// Release the open conversation. Safe to call any number of times.
    pub fn close(&self) {
        self.inner.rebind(Snapshot::default());
    }

    pub async fn send_message(&self, text: &str) -> Result<SendOutcome, SyncError> {
        if text.trim().is_empty() {
            return Ok(SendOutcome::Ignored);
        }

        let (bound, needs_title) = self.inner.begin_send()?;
        let _guard = SendGuard {
            inner: self.inner.clone(),
            generation: bound.generation,
        };
        let store = &self.inner.store;
        let conversation_id = bound.conversation_id.as_str();

        let sent_at = Utc::now();
        let user_message = Message::new(conversation_id, Role::User, text, sent_at);
        store.insert_message(&user_message).await.map_err(|e| {
            tracing::error!(conversation_id, "Failed to store user message: {}", e);
            SyncError::from(e)
        })?;

        if let Err(e) = store
            .update_conversation(conversation_id, &ConversationPatch::touch(sent_at))
            .await
        {
            tracing::warn!(conversation_id, "Failed to bump conversation timestamp: {}", e);
        }

        if needs_title {
            let title = derive_title(text);
            match store
                .update_conversation(conversation_id, &ConversationPatch::title(title.clone()))
                .await
            {
                Ok(()) => {
                    self.inner.publish_if_current(bound.generation, move |snapshot| {
                        if let Some(conversation) = snapshot.conversation.as_mut() {
                            conversation.title = title;
                        }
                    });
                }
                Err(e) => tracing::warn!(conversation_id, "Failed to set derived title: {}", e),
            }
        }

        if let Err(e) = self.refetch(bound.generation, true).await {
            tracing::debug!(conversation_id, "Refresh after user message failed: {}", e);
        }

        let request = ResponderRequest {
            message: text.to_string(),
            conversation_id: bound.conversation_id.clone(),
            user_id: bound.user_id.clone(),
        };
        let (reply, outcome) = match self.inner.responder.respond(request).await {
            Ok(reply) if !reply.is_empty() => (reply, SendOutcome::Replied),
            Ok(_) => {
                tracing::debug!(conversation_id, "Responder returned an empty reply");
                (EMPTY_REPLY_FALLBACK.to_string(), SendOutcome::Replied)
            }
            Err(e) => {
                tracing::warn!(conversation_id, "Responder failed: {}", e);
                (RESPONDER_FAILURE_REPLY.to_string(), SendOutcome::Degraded(e))
            }
        };

        let replied_at = Utc::now().max(sent_at);
        let assistant_message = Message::new(conversation_id, Role::Assistant, reply, replied_at);
        store.insert_message(&assistant_message).await.map_err(|e| {
            tracing::error!(conversation_id, "Failed to store assistant message: {}", e);
            SyncError::from(e)
        })?;

        if let Err(e) = store
            .update_conversation(conversation_id, &ConversationPatch::touch(replied_at))
            .await
        {
            tracing::warn!(conversation_id, "Failed to bump conversation timestamp: {}", e);
        }

        if let Err(e) = self.refetch(bound.generation, true).await {
            tracing::debug!(conversation_id, "Refresh after reply failed: {}", e);
        }

        Ok(outcome)
    }

    pub async fn rename_conversation(&self, new_title: &str) -> Result<(), SyncError> {
        let title = new_title.trim();
        if title.is_empty() {
            return Err(SyncError::InvalidArgument(
                "Title cannot be empty".to_string(),
            ));
        }

        let bound = self.inner.bound()?;
        if self.inner.snapshot.borrow().title() == Some(title) {
            return Ok(());
        }

        self.inner
            .store
            .update_conversation(&bound.conversation_id, &ConversationPatch::title(title))
            .await
            .map_err(|e| {
                tracing::error!(
                    conversation_id = %bound.conversation_id,
                    "Failed to rename conversation: {}",
                    e
                );
                SyncError::from(e)
            })?;

        let title = title.to_string();
        self.inner.publish_if_current(bound.generation, move |snapshot| {
            if let Some(conversation) = snapshot.conversation.as_mut() {
                conversation.title = title;
            }
        });
        Ok(())
    }

    /// Remove the messages, then the conversation. A failure in the second
    /// step leaves an empty conversation behind and is reported, not retried.
    pub async fn delete_conversation(&self) -> Result<(), SyncError> {
        let bound = self.inner.bound()?;
        let conversation_id = bound.conversation_id.as_str();

        self.inner
            .store
            .delete_messages(conversation_id)
            .await
            .map_err(|e| {
                tracing::error!(conversation_id, "Failed to delete messages: {}", e);
                SyncError::from(e)
            })?;

        self.inner
            .store
            .delete_conversation(conversation_id)
            .await
            .map_err(|e| {
                tracing::error!(
                    conversation_id,
                    "Messages deleted but conversation remains: {}",
                    e
                );
                SyncError::from(e)
            })?;

        tracing::info!(conversation_id, "Conversation deleted");
        if self.inner.is_current(bound.generation) {
            self.close();
        }
        Ok(())
    }

    /// Reload the open conversation from the store and replace the snapshot.
    pub async fn refresh(&self) -> Result<(), SyncError> {
        let bound = self.inner.bound()?;
        self.refetch(bound.generation, true).await
    }

    async fn refetch(&self, generation: u64, include_conversation: bool) -> Result<(), SyncError> {
        let Some(bound) = self.inner.bound_at(generation) else {
            return Ok(());
        };
        let conversation_id = bound.conversation_id.as_str();

        let conversation = if include_conversation {
            match self
                .inner
                .store
                .get_conversation(conversation_id, &bound.user_id)
                .await
            {
                Ok(conversation) => Some(conversation),
                Err(StoreError::NotFound) => {
                    tracing::info!(conversation_id, "Open conversation was deleted elsewhere");
                    self.inner.publish_if_current(generation, |snapshot| {
                        snapshot.conversation = None;
                        snapshot.messages.clear();
                        snapshot.status = SyncStatus::Deleted;
                    });
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(conversation_id, "Failed to refetch conversation: {}", e);
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        let messages = self
            .inner
            .store
            .list_messages(conversation_id)
            .await
            .map_err(|e| {
                tracing::warn!(conversation_id, "Failed to refetch messages: {}", e);
                SyncError::from(e)
            })?;

        let applied = self.inner.publish_if_current(generation, move |snapshot| {
            if let Some(conversation) = conversation {
                snapshot.conversation = Some(conversation);
            }
            snapshot.replace_messages(messages);
            if snapshot.conversation.is_some() {
                snapshot.status = SyncStatus::Ready;
            }
        });
        if !applied {
            tracing::debug!(conversation_id, generation, "Dropped stale fetch");
        }
        Ok(())
    }

    fn change_callback(&self, generation: u64) -> OnChange {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let runtime = tokio::runtime::Handle::try_current().ok();
        Arc::new(move |signal: ChangeSignal| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if !inner.is_current(generation) {
                return;
            }
            let Some(runtime) = runtime.as_ref() else {
                tracing::warn!("Change received outside an async runtime, ignoring");
                return;
            };
            let sync = Synchronizer { inner };
            runtime.spawn(async move {
                if let Err(e) = sync.refetch(generation, signal.touches_conversation()).await {
                    tracing::debug!("Refetch after change failed: {}", e);
                }
            });
        })
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        let state = self.lock();
        state.generation == generation && state.binding.is_some()
    }

    /// Start a new generation showing `next`, releasing whatever was bound.
    fn rebind(&self, next: Snapshot) -> u64 {
        let (generation, released) = {
            let mut state = self.lock();
            state.generation += 1;
            let released = state.binding.take();
            self.snapshot.send_if_modified(|snapshot| {
                if *snapshot == next {
                    false
                } else {
                    *snapshot = next;
                    true
                }
            });
            (state.generation, released)
        };

        if let Some(binding) = released {
            tracing::debug!(conversation_id = %binding.conversation_id, "Released conversation");
            if let Some(subscription) = binding.subscription {
                self.notifier.unsubscribe(subscription);
            }
        }
        generation
    }

    /// Hands the subscription back when `generation` went stale meanwhile.
    fn bind(
        &self,
        generation: u64,
        conversation_id: &str,
        user_id: &str,
        subscription: SubscriptionHandle,
    ) -> Result<(), SubscriptionHandle> {
        let mut state = self.lock();
        if state.generation != generation {
            return Err(subscription);
        }
        state.binding = Some(Binding {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            subscription: Some(subscription),
            sending: false,
        });
        Ok(())
    }

    fn fail_open(&self, generation: u64, err: StoreError) -> SyncError {
        let err = SyncError::from(err);
        let released = {
            let mut state = self.lock();
            if state.generation != generation {
                return SyncError::Cancelled;
            }
            let released = state.binding.take();
            self.snapshot.send_replace(Snapshot::failed(err.to_string()));
            released
        };

        if let Some(subscription) = released.and_then(|b| b.subscription) {
            self.notifier.unsubscribe(subscription);
        }
        tracing::warn!("Failed to open conversation: {}", err);
        err
    }

    fn bound(&self) -> Result<Bound, SyncError> {
        let state = self.lock();
        state
            .binding
            .as_ref()
            .map(|b| Bound {
                generation: state.generation,
                conversation_id: b.conversation_id.clone(),
                user_id: b.user_id.clone(),
            })
            .ok_or(SyncError::NotOpen)
    }

    fn bound_at(&self, generation: u64) -> Option<Bound> {
        self.bound().ok().filter(|b| b.generation == generation)
    }

    fn publish_if_current<F>(&self, generation: u64, modify: F) -> bool
    where
        F: FnOnce(&mut Snapshot),
    {
        let state = self.lock();
        if state.generation != generation || state.binding.is_none() {
            return false;
        }
        self.snapshot.send_modify(modify);
        true
    }

    /// Claim the busy flag and decide whether this message names the conversation.
    fn begin_send(&self) -> Result<(Bound, bool), SyncError> {
        let mut state = self.lock();
        let generation = state.generation;
        let binding = state.binding.as_mut().ok_or(SyncError::NotOpen)?;
        if binding.sending {
            return Err(SyncError::Busy);
        }
        // Nothing is sent before the initial fetch has been published.
        if !self.snapshot.borrow().is_ready() {
            return Err(SyncError::NotOpen);
        }
        binding.sending = true;

        let bound = Bound {
            generation,
            conversation_id: binding.conversation_id.clone(),
            user_id: binding.user_id.clone(),
        };
        let needs_title = {
            let snapshot = self.snapshot.borrow();
            snapshot.messages.is_empty()
                || snapshot.title().map_or(true, |title| title == DEFAULT_TITLE)
        };
        self.snapshot.send_modify(|snapshot| snapshot.sending = true);
        Ok((bound, needs_title))
    }

    fn finish_send(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        if let Some(binding) = state.binding.as_mut() {
            binding.sending = false;
            self.snapshot.send_modify(|snapshot| snapshot.sending = false);
        }
    }
}

/// Clears the busy flag however the send ends, including cancellation.
struct SendGuard {
    inner: Arc<Inner>,
    generation: u64,
}

impl Drop for SendGuard {
    fn drop(&mut self) {
        self.inner.finish_send(self.generation);
    }
}
