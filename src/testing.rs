//! In-memory stand-ins for the store, the push channel and the responder.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, Semaphore};
use uuid::Uuid;

use crate::models::{Conversation, ConversationPatch, Message, Role};
use crate::providers::{GatewayError, Responder, ResponderRequest};
use crate::services::notifier::{ChangeNotifier, ChangeSignal, OnChange, SubscriptionHandle, Table};
use crate::services::store::{ConversationStore, StoreError};

/// Pauses a call until the test lets it continue.
pub struct Gate {
    entered: Notify,
    release: Semaphore,
}

impl Gate {
    fn new() -> Self {
        Self {
            entered: Notify::new(),
            release: Semaphore::new(0),
        }
    }

    /// Resolves once the held call has started.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.add_permits(1);
    }

    async fn pass(&self) {
        self.entered.notify_one();
        if let Ok(permit) = self.release.acquire().await {
            permit.forget();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    GetConversation(String),
    ListConversations(String),
    ListMessages(String),
    InsertMessage(Role, String),
    UpdateConversation(String, ConversationPatch),
    DeleteMessages(String),
    DeleteConversation(String),
    CreateConversation(String, String),
}

impl StoreCall {
    fn is_write(&self) -> bool {
        !matches!(
            self,
            StoreCall::GetConversation(_)
                | StoreCall::ListConversations(_)
                | StoreCall::ListMessages(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    GetConversation,
    ListMessages,
    InsertMessage,
    UpdateConversation,
    DeleteMessages,
    DeleteConversation,
}

#[derive(Default)]
struct FakeData {
    conversations: HashMap<String, Conversation>,
    messages: Vec<Message>,
    calls: Vec<StoreCall>,
    failing: HashSet<Op>,
    held_list: Option<(String, Arc<Gate>)>,
}

#[derive(Default)]
pub struct FakeStore {
    data: Mutex<FakeData>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn data(&self) -> std::sync::MutexGuard<'_, FakeData> {
        self.data.lock().unwrap()
    }

    pub fn seed_conversation(&self, user_id: &str, title: &str) -> Conversation {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            pinned: false,
            created_at: now,
            updated_at: now,
        };
        self.data()
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        conversation
    }

    pub fn seed_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> Message {
        let message = Message::new(conversation_id, role, content, created_at);
        self.data().messages.push(message.clone());
        message
    }

    pub fn set_title(&self, conversation_id: &str, title: &str) {
        if let Some(conversation) = self.data().conversations.get_mut(conversation_id) {
            conversation.title = title.to_string();
        }
    }

    /// Remove a conversation behind the synchronizer's back.
    pub fn remove_conversation(&self, conversation_id: &str) {
        self.data().conversations.remove(conversation_id);
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.data().conversations.get(conversation_id).cloned()
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.data()
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub fn fail(&self, op: Op) {
        self.data().failing.insert(op);
    }

    pub fn recover(&self, op: Op) {
        self.data().failing.remove(&op);
    }

    /// Hold the next `list_messages` for `conversation_id` until released.
    pub fn hold_list_messages(&self, conversation_id: &str) -> Arc<Gate> {
        let gate = Arc::new(Gate::new());
        self.data().held_list = Some((conversation_id.to_string(), gate.clone()));
        gate
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.data().calls.clone()
    }

    pub fn writes(&self) -> Vec<StoreCall> {
        self.data()
            .calls
            .iter()
            .filter(|c| c.is_write())
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.data().calls.clear();
    }

    fn record(&self, call: StoreCall, op: Option<Op>) -> Result<(), StoreError> {
        let mut data = self.data();
        data.calls.push(call);
        match op {
            Some(op) if data.failing.contains(&op) => {
                Err(StoreError::Backend(anyhow!("injected {:?} failure", op)))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ConversationStore for FakeStore {
    async fn get_conversation(&self, id: &str, owner_id: &str) -> Result<Conversation, StoreError> {
        self.record(StoreCall::GetConversation(id.to_string()), Some(Op::GetConversation))?;
        self.data()
            .conversations
            .get(id)
            .filter(|c| c.user_id == owner_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list_conversations(&self, owner_id: &str) -> Result<Vec<Conversation>, StoreError> {
        self.record(StoreCall::ListConversations(owner_id.to_string()), None)?;
        let mut conversations: Vec<Conversation> = self
            .data()
            .conversations
            .values()
            .filter(|c| c.user_id == owner_id)
            .cloned()
            .collect();
        conversations.sort_by(|a, b| {
            b.pinned
                .cmp(&a.pinned)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
        });
        Ok(conversations)
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        self.record(
            StoreCall::ListMessages(conversation_id.to_string()),
            Some(Op::ListMessages),
        )?;
        let held = {
            let mut data = self.data();
            let matches = data
                .held_list
                .as_ref()
                .is_some_and(|(id, _)| id == conversation_id);
            if matches {
                data.held_list.take().map(|(_, gate)| gate)
            } else {
                None
            }
        };
        let mut messages = self.messages(conversation_id);
        if let Some(gate) = held {
            gate.pass().await;
        }
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn insert_message(&self, message: &Message) -> Result<(), StoreError> {
        self.record(
            StoreCall::InsertMessage(message.role, message.content.clone()),
            Some(Op::InsertMessage),
        )?;
        self.data().messages.push(message.clone());
        Ok(())
    }

    async fn update_conversation(
        &self,
        id: &str,
        patch: &ConversationPatch,
    ) -> Result<(), StoreError> {
        self.record(
            StoreCall::UpdateConversation(id.to_string(), patch.clone()),
            Some(Op::UpdateConversation),
        )?;
        let mut data = self.data();
        let conversation = data.conversations.get_mut(id).ok_or(StoreError::NotFound)?;
        patch.apply_to(conversation);
        Ok(())
    }

    async fn delete_messages(&self, conversation_id: &str) -> Result<(), StoreError> {
        self.record(
            StoreCall::DeleteMessages(conversation_id.to_string()),
            Some(Op::DeleteMessages),
        )?;
        self.data()
            .messages
            .retain(|m| m.conversation_id != conversation_id);
        Ok(())
    }

    async fn delete_conversation(&self, id: &str) -> Result<(), StoreError> {
        self.record(
            StoreCall::DeleteConversation(id.to_string()),
            Some(Op::DeleteConversation),
        )?;
        self.data().conversations.remove(id);
        Ok(())
    }

    async fn create_conversation(
        &self,
        owner_id: &str,
        title: &str,
    ) -> Result<Conversation, StoreError> {
        self.record(
            StoreCall::CreateConversation(owner_id.to_string(), title.to_string()),
            None,
        )?;
        Ok(self.seed_conversation(owner_id, title))
    }
}

/// Push channel driven by hand: `fire` invokes the live callbacks directly.
#[derive(Default)]
pub struct ManualNotifier {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, (String, OnChange)>>,
    owners: Mutex<HashMap<u64, (String, OnChange)>>,
}

impl ManualNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn active_owners(&self) -> usize {
        self.owners.lock().unwrap().len()
    }

    pub fn fire_owner(&self, owner_id: &str) {
        let callbacks: Vec<OnChange> = self
            .owners
            .lock()
            .unwrap()
            .values()
            .filter(|(id, _)| id == owner_id)
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(ChangeSignal::new(Table::Conversations));
        }
    }

    pub fn callback_for(&self, conversation_id: &str) -> Option<OnChange> {
        self.live
            .lock()
            .unwrap()
            .values()
            .find(|(id, _)| id == conversation_id)
            .map(|(_, cb)| cb.clone())
    }

    pub fn fire(&self, conversation_id: &str, table: Table) {
        let callbacks: Vec<OnChange> = self
            .live
            .lock()
            .unwrap()
            .values()
            .filter(|(id, _)| id == conversation_id)
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(ChangeSignal::new(table));
        }
    }
}

impl ChangeNotifier for ManualNotifier {
    fn subscribe(&self, conversation_id: &str, on_change: OnChange) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live
            .lock()
            .unwrap()
            .insert(id, (conversation_id.to_string(), on_change));
        SubscriptionHandle::new(id, conversation_id)
    }

    fn subscribe_owner(&self, owner_id: &str, on_change: OnChange) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.owners
            .lock()
            .unwrap()
            .insert(id, (owner_id.to_string(), on_change));
        SubscriptionHandle::new(id, owner_id)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.live.lock().unwrap().remove(&handle.id());
        self.owners.lock().unwrap().remove(&handle.id());
    }
}

/// Replies from a queue, answering "ok" once it runs dry.
#[derive(Default)]
pub struct ScriptedResponder {
    replies: Mutex<VecDeque<Result<String, GatewayError>>>,
    requests: Mutex<Vec<ResponderRequest>>,
    held: Mutex<Option<Arc<Gate>>>,
}

impl ScriptedResponder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&self, reply: Result<String, GatewayError>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn requests(&self) -> Vec<ResponderRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Hold the next call until released.
    pub fn hold(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::new());
        *self.held.lock().unwrap() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl Responder for ScriptedResponder {
    async fn respond(&self, request: ResponderRequest) -> Result<String, GatewayError> {
        self.requests.lock().unwrap().push(request);
        let held = self.held.lock().unwrap().take();
        if let Some(gate) = held {
            gate.pass().await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("ok".to_string()))
    }
}
