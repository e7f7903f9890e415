use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tokio_util::sync::CancellationToken;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Conversations,
    Messages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row-level change, scoped to the conversation it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    pub conversation_id: String,
    /// Owner of the conversation row. Only set for `Table::Conversations`.
    pub owner_id: Option<String>,
}

/// What a subscription listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Scope {
    /// Every change to one conversation and its messages.
    Conversation(String),
    /// Conversation-row changes for every conversation of one owner.
    Owner(String),
}

impl Scope {
    fn matches(&self, event: &ChangeEvent) -> bool {
        match self {
            Scope::Conversation(id) => event.conversation_id == *id,
            Scope::Owner(owner) => {
                event.table == Table::Conversations
                    && event.owner_id.as_deref() == Some(owner.as_str())
            }
        }
    }

    fn key(&self) -> &str {
        match self {
            Scope::Conversation(key) | Scope::Owner(key) => key,
        }
    }
}

/// What a subscriber is told: which table moved, nothing about the rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeSignal {
    pub table: Table,
}

impl ChangeSignal {
    pub fn new(table: Table) -> Self {
        Self { table }
    }

    pub fn touches_conversation(&self) -> bool {
        self.table == Table::Conversations
    }

    fn merge(self, table: Table) -> Self {
        if self.touches_conversation() || table == Table::Conversations {
            Self::new(Table::Conversations)
        } else {
            self
        }
    }
}

pub type OnChange = Arc<dyn Fn(ChangeSignal) + Send + Sync>;

/// Live subscription. Dropping it (or passing it to `unsubscribe`) stops delivery.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: u64,
    scope: String,
    cancel: CancellationToken,
}

impl SubscriptionHandle {
    /// `scope` is the conversation or owner id the subscription listens to.
    pub fn new(id: u64, scope: &str) -> Self {
        Self {
            id,
            scope: scope.to_string(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub trait ChangeNotifier: Send + Sync {
    fn subscribe(&self, conversation_id: &str, on_change: OnChange) -> SubscriptionHandle;

    /// Conversation-row changes (create, update, delete) of every conversation
    /// owned by `owner_id`. Message changes are not delivered.
    fn subscribe_owner(&self, owner_id: &str, on_change: OnChange) -> SubscriptionHandle;

    /// Must be safe even when the subscription never finished starting.
    fn unsubscribe(&self, handle: SubscriptionHandle);
}

/// In-process push channel. Every write the `Database` commits is published
/// here, and each subscription forwards the events of its conversation.
#[derive(Debug, Clone)]
pub struct ChangeHub {
    tx: broadcast::Sender<ChangeEvent>,
    next_id: Arc<AtomicU64>,
}

impl ChangeHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn publish(&self, event: ChangeEvent) {
        // An error only means nobody is listening right now.
        let _ = self.tx.send(event);
    }

    /// Raw, unfiltered event stream.
    pub fn events(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    fn spawn_forward(&self, scope: Scope, on_change: OnChange) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = SubscriptionHandle::new(id, scope.key());
        let rx = self.tx.subscribe();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::debug!(subscription = id, scope = ?scope, "Subscribed to changes");
                runtime.spawn(forward_changes(rx, scope, on_change, handle.cancel_token()));
            }
            Err(_) => {
                tracing::warn!(
                    subscription = id,
                    scope = ?scope,
                    "No async runtime available, subscription will never fire"
                );
            }
        }

        handle
    }
}

impl Default for ChangeHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier for ChangeHub {
    fn subscribe(&self, conversation_id: &str, on_change: OnChange) -> SubscriptionHandle {
        self.spawn_forward(Scope::Conversation(conversation_id.to_string()), on_change)
    }

    fn subscribe_owner(&self, owner_id: &str, on_change: OnChange) -> SubscriptionHandle {
        self.spawn_forward(Scope::Owner(owner_id.to_string()), on_change)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        tracing::debug!(
            subscription = handle.id(),
            scope = handle.scope(),
            "Unsubscribed from changes"
        );
        drop(handle);
    }
}

async fn forward_changes(
    mut rx: broadcast::Receiver<ChangeEvent>,
    scope: Scope,
    on_change: OnChange,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = rx.recv() => received,
        };

        let mut signal = match received {
            Ok(event) if scope.matches(&event) => ChangeSignal::new(event.table),
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, scope = scope.key(), "Change stream lagged");
                ChangeSignal::new(Table::Conversations)
            }
            Err(RecvError::Closed) => break,
        };

        // Fold everything already queued into one signal.
        loop {
            match rx.try_recv() {
                Ok(event) if scope.matches(&event) => {
                    signal = signal.merge(event.table);
                }
                Ok(_) => {}
                Err(TryRecvError::Lagged(_)) => signal = ChangeSignal::new(Table::Conversations),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }

        if cancel.is_cancelled() {
            break;
        }
        on_change(signal);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;

    fn recorder() -> (OnChange, mpsc::UnboundedReceiver<ChangeSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let on_change: OnChange = Arc::new(move |signal| {
            let _ = tx.send(signal);
        });
        (on_change, rx)
    }

    fn event(table: Table, conversation_id: &str) -> ChangeEvent {
        ChangeEvent {
            table,
            kind: ChangeKind::Insert,
            conversation_id: conversation_id.to_string(),
            owner_id: (table == Table::Conversations).then(|| "u1".to_string()),
        }
    }

    fn owned(conversation_id: &str, owner_id: &str) -> ChangeEvent {
        ChangeEvent {
            owner_id: Some(owner_id.to_string()),
            ..event(Table::Conversations, conversation_id)
        }
    }

    #[tokio::test]
    async fn test_owner_scope_sees_only_own_conversation_rows() {
        let hub = ChangeHub::new();
        let (on_change, mut rx) = recorder();
        let handle = hub.subscribe_owner("u1", on_change);
        assert_eq!(handle.scope(), "u1");

        hub.publish(owned("a", "u2"));
        hub.publish(event(Table::Messages, "a"));
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        hub.publish(owned("b", "u1"));
        let signal = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert!(signal.touches_conversation());
    }

    #[tokio::test]
    async fn test_only_matching_conversation_is_forwarded() {
        let hub = ChangeHub::new();
        let (on_change, mut rx) = recorder();
        let _handle = hub.subscribe("a", on_change);

        hub.publish(event(Table::Conversations, "b"));
        tokio::task::yield_now().await;
        hub.publish(event(Table::Messages, "a"));

        let signal = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(signal, ChangeSignal::new(Table::Messages));
    }

    #[tokio::test]
    async fn test_burst_is_coalesced() {
        let hub = ChangeHub::new();
        let (on_change, mut rx) = recorder();
        let _handle = hub.subscribe("a", on_change);

        // Nothing runs until we yield, so all three are queued together.
        hub.publish(event(Table::Messages, "a"));
        hub.publish(event(Table::Conversations, "a"));
        hub.publish(event(Table::Messages, "a"));

        let signal = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert!(signal.touches_conversation());

        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_before_start_is_safe() {
        let hub = ChangeHub::new();
        let (on_change, mut rx) = recorder();
        let handle = hub.subscribe("a", on_change);
        hub.unsubscribe(handle);

        hub.publish(event(Table::Messages, "a"));

        // The forwarding task exits and drops the callback, closing the channel.
        let closed = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn test_dropping_handle_stops_delivery() {
        let hub = ChangeHub::new();
        let (on_change, mut rx) = recorder();
        let handle = hub.subscribe("a", on_change);

        hub.publish(event(Table::Messages, "a"));
        assert!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap().is_some());

        drop(handle);
        hub.publish(event(Table::Messages, "a"));
        let closed = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(closed.is_none());
    }

    #[test]
    fn test_subscribe_without_runtime_does_not_panic() {
        let hub = ChangeHub::new();
        let (on_change, _rx) = recorder();
        let handle = hub.subscribe("a", on_change);
        hub.unsubscribe(handle);
    }
}
