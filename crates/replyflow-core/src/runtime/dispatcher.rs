//! Message Update Dispatcher - Routes updates to per-message subscribers.
//!
//! Raw updates from the push channel go through the content buffer; flushed
//! updates come back on a channel and are delivered on the dispatcher's own
//! task. A subscriber may be registered under a provisional id while updates
//! carry the confirmed id (or the reverse); the alias table bridges the two.
//!
//! Each message-specific subscriber is tracked against the content it has
//! been shown. A flush that does not continue from that view (content flushed
//! before the subscriber could be resolved) reaches it as a REPLACE of the
//! full content, and replays it has already caught up past are skipped.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::aliases::IdentifierAliases;
use super::buffer::{BufferConfig, BufferEvent, ContentBuffer, SubscriberId};
use crate::channel::ConnectionManager;
use crate::models::{ContentUpdateMode, FlushedUpdate, IdentifierMapping, MessageUpdate};
use crate::subscription::Subscription;

/// Subscriber callback. Always invoked from the delivery task, never while
/// a dispatcher lock is held.
pub type UpdateHandler = Arc<dyn Fn(&FlushedUpdate) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum HandlerScope {
    Message(String),
    Global,
}

/// Content a subscriber has been shown, by buffer key.
type SeenContent = Arc<Mutex<HashMap<String, String>>>;

struct HandlerEntry {
    id: SubscriberId,
    handler: UpdateHandler,
    seen: SeenContent,
}

struct Resolved {
    handler: UpdateHandler,
    seen: SeenContent,
}

struct DispatcherInner {
    handlers: Mutex<HashMap<HandlerScope, Vec<HandlerEntry>>>,
    aliases: Mutex<IdentifierAliases>,
    buffer: ContentBuffer,
    /// Messages nobody follows any more, with their conversation. Frames for
    /// them are dropped until the terminal one.
    abandoned: Mutex<HashMap<String, Option<String>>>,
    next_subscriber: AtomicU64,
}

impl HandlerEntry {
    fn resolved(&self) -> Resolved {
        Resolved {
            handler: self.handler.clone(),
            seen: self.seen.clone(),
        }
    }
}

impl Resolved {
    /// Record that this subscriber is shown `update`. Returns the widened
    /// REPLACE to deliver instead when the update does not continue from
    /// what the subscriber has seen.
    fn catch_up(&self, update: &FlushedUpdate) -> Option<FlushedUpdate> {
        let mut seen = self.seen.lock();
        let shown = seen.entry(update.message_id.clone()).or_default();
        let continues = update.mode == ContentUpdateMode::Replace
            || update.content.strip_prefix(shown.as_str()) == Some(update.delta.as_str());
        shown.clone_from(&update.content);
        if continues {
            return None;
        }
        Some(FlushedUpdate {
            delta: update.content.clone(),
            mode: ContentUpdateMode::Replace,
            ..update.clone()
        })
    }

    /// A replay is redundant once the subscriber has been shown any flush of
    /// the message: that flush was queued no earlier than the replay's state.
    fn replay_is_redundant(&self, update: &FlushedUpdate) -> bool {
        let mut seen = self.seen.lock();
        if seen.contains_key(&update.message_id) {
            return true;
        }
        seen.insert(update.message_id.clone(), update.content.clone());
        false
    }
}

impl DispatcherInner {
    fn register(&self, scope: HandlerScope, handler: UpdateHandler) -> SubscriberId {
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.handlers
            .lock()
            .entry(scope)
            .or_default()
            .push(HandlerEntry {
                id,
                handler,
                seen: SeenContent::default(),
            });
        id
    }

    fn unregister(&self, scope: &HandlerScope, id: SubscriberId) {
        let mut handlers = self.handlers.lock();
        if let Some(entries) = handlers.get_mut(scope) {
            entries.retain(|entry| entry.id != id);
            if entries.is_empty() {
                handlers.remove(scope);
            }
        }
    }

    fn subscribers_of(&self, message_id: &str) -> Vec<SubscriberId> {
        self.handlers
            .lock()
            .get(&HandlerScope::Message(message_id.to_string()))
            .map(|entries| entries.iter().map(|entry| entry.id).collect())
            .unwrap_or_default()
    }

    /// Handlers for a message id: exact id, then alias, then global.
    /// Returns the handlers and how many were message-specific.
    fn resolve(&self, message_id: &str) -> (Vec<Resolved>, usize) {
        let keys = self.aliases.lock().resolve(message_id);
        let handlers = self.handlers.lock();
        let mut seen = HashSet::new();
        let mut resolved = Vec::new();

        for key in keys {
            if let Some(entries) = handlers.get(&HandlerScope::Message(key)) {
                for entry in entries {
                    if seen.insert(entry.id) {
                        resolved.push(entry.resolved());
                    }
                }
            }
        }
        let specific = resolved.len();

        if let Some(entries) = handlers.get(&HandlerScope::Global) {
            resolved.extend(entries.iter().map(HandlerEntry::resolved));
        }
        (resolved, specific)
    }

    fn find(&self, subscriber: SubscriberId) -> Option<Resolved> {
        self.handlers
            .lock()
            .values()
            .flatten()
            .find(|entry| entry.id == subscriber)
            .map(HandlerEntry::resolved)
    }

    fn deliver(&self, event: BufferEvent) {
        match event {
            BufferEvent::Flushed(update) => {
                let (handlers, specific) = self.resolve(&update.message_id);
                if handlers.is_empty() {
                    debug!(
                        message_id = %update.message_id,
                        "No subscriber yet, keeping buffered content"
                    );
                }
                for (index, resolved) in handlers.iter().enumerate() {
                    let widened = if index < specific {
                        resolved.catch_up(&update)
                    } else {
                        None
                    };
                    match widened {
                        Some(widened) => {
                            debug!(
                                message_id = %update.message_id,
                                "Subscriber behind on content, delivering full replace"
                            );
                            (resolved.handler)(&widened);
                        }
                        None => (resolved.handler)(&update),
                    }
                }
                if update.is_terminal() && specific > 0 {
                    self.buffer.discard(&update.message_id);
                    if let Some(mapping) = self.aliases.lock().remove(&update.message_id) {
                        debug!(
                            provisional_id = %mapping.provisional_id,
                            confirmed_id = %mapping.confirmed_id,
                            "Released identifier mapping"
                        );
                    }
                }
            }
            BufferEvent::Snapshot { subscriber, update } => {
                let Some(resolved) = self.find(subscriber) else {
                    return;
                };
                if resolved.replay_is_redundant(&update) {
                    trace!(message_id = %update.message_id, subscriber, "Skipping redundant replay");
                    return;
                }
                (resolved.handler)(&update);
            }
        }
    }
}

async fn run_delivery(inner: Weak<DispatcherInner>, mut events: mpsc::UnboundedReceiver<BufferEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.deliver(event);
    }
}

/// Fans inbound message updates out to registered subscribers.
///
/// Cheap to clone. Must be created inside a tokio runtime: construction
/// spawns the delivery task.
#[derive(Clone)]
pub struct MessageDispatcher {
    inner: Arc<DispatcherInner>,
}

impl MessageDispatcher {
    pub fn new(config: BufferConfig) -> Self {
        let (buffer, events) = ContentBuffer::new(config);
        let inner = Arc::new(DispatcherInner {
            handlers: Mutex::new(HashMap::new()),
            aliases: Mutex::new(IdentifierAliases::new()),
            buffer,
            abandoned: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
        });
        tokio::spawn(run_delivery(Arc::downgrade(&inner), events));
        Self { inner }
    }

    /// Subscribe to one message. Content already flushed for the id (or its
    /// alias) is replayed to the new subscriber first.
    pub fn register_handler(
        &self,
        message_id: &str,
        handler: impl Fn(&FlushedUpdate) + Send + Sync + 'static,
    ) -> Subscription {
        let scope = HandlerScope::Message(message_id.to_string());
        let id = self.inner.register(scope.clone(), Arc::new(handler));

        let keys = self.inner.aliases.lock().resolve(message_id);
        for key in keys {
            if self.inner.buffer.replay_to(&key, id) {
                break;
            }
        }
        self.unsubscribe_token(scope, id)
    }

    /// Subscribe to updates for every message.
    pub fn register_global_handler(
        &self,
        handler: impl Fn(&FlushedUpdate) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.register(HandlerScope::Global, Arc::new(handler));
        self.unsubscribe_token(HandlerScope::Global, id)
    }

    /// Link a provisional id to the confirmed id the backend assigned.
    ///
    /// Subscribers on either side immediately receive whatever was buffered
    /// under the other id before the mapping existed.
    pub fn register_identifier_mapping(
        &self,
        provisional_id: &str,
        confirmed_id: &str,
        conversation_id: Option<&str>,
    ) {
        self.inner.aliases.lock().register(IdentifierMapping {
            provisional_id: provisional_id.to_string(),
            confirmed_id: confirmed_id.to_string(),
            conversation_id: conversation_id.map(str::to_string),
        });
        debug!(provisional_id, confirmed_id, "Registered identifier mapping");

        for subscriber in self.inner.subscribers_of(provisional_id) {
            self.inner.buffer.replay_to(confirmed_id, subscriber);
        }
        for subscriber in self.inner.subscribers_of(confirmed_id) {
            self.inner.buffer.replay_to(provisional_id, subscriber);
        }
    }

    /// Entry point for raw updates from the push channel.
    pub fn on_raw_update(&self, mut update: MessageUpdate) {
        {
            let mut abandoned = self.inner.abandoned.lock();
            if abandoned.contains_key(&update.message_id) {
                if update.is_terminal() {
                    abandoned.remove(&update.message_id);
                }
                trace!(message_id = %update.message_id, "Dropping update for abandoned message");
                return;
            }
        }
        if update.conversation_id.is_none() {
            update.conversation_id = self
                .inner
                .aliases
                .lock()
                .conversation_of(&update.message_id)
                .map(str::to_string);
        }
        self.inner.buffer.ingest(update);
    }

    /// Feed every update the connection receives into this dispatcher.
    pub fn attach(&self, connection: &ConnectionManager) -> Subscription {
        let dispatcher = self.clone();
        connection.add_update_listener(move |update| dispatcher.on_raw_update(update))
    }

    pub fn flush_immediately(&self, message_id: &str) -> bool {
        self.inner.buffer.flush_immediately(message_id)
    }

    pub fn buffered_content(&self, message_id: &str) -> Option<String> {
        self.inner.buffer.buffered(message_id)
    }

    /// Confirmed id for a provisional id or the reverse.
    pub fn alias_of(&self, message_id: &str) -> Option<String> {
        self.inner
            .aliases
            .lock()
            .alias_of(message_id)
            .map(str::to_string)
    }

    /// Stop tracking a message whose follower went away before it finished.
    ///
    /// Its buffer and identifier mapping are dropped, and further frames for
    /// it are ignored until the terminal one arrives.
    pub fn abandon(&self, message_id: &str) {
        let mapping = self.inner.aliases.lock().remove(message_id);
        let mut settled = self.inner.buffer.discard(message_id);
        let mut conversation_id = None;
        if let Some(mapping) = mapping {
            let alias = if mapping.confirmed_id == message_id {
                &mapping.provisional_id
            } else {
                &mapping.confirmed_id
            };
            settled |= self.inner.buffer.discard(alias);
            conversation_id = mapping.conversation_id;
        }
        if !settled {
            self.inner
                .abandoned
                .lock()
                .insert(message_id.to_string(), conversation_id);
        }
        debug!(message_id, settled, "Abandoned message");
    }

    /// Drop buffers and identifier mappings of a conversation being torn down.
    pub fn clear_conversation(&self, conversation_id: &str) {
        let removed = self.inner.aliases.lock().remove_conversation(conversation_id);
        for mapping in &removed {
            self.inner.buffer.discard(&mapping.provisional_id);
            self.inner.buffer.discard(&mapping.confirmed_id);
        }
        let buffers = self.inner.buffer.discard_conversation(conversation_id);
        self.inner
            .abandoned
            .lock()
            .retain(|_, conversation| conversation.as_deref() != Some(conversation_id));
        debug!(
            conversation_id,
            mappings = removed.len(),
            buffers,
            "Cleared conversation state"
        );
    }

    fn unsubscribe_token(&self, scope: HandlerScope, id: SubscriberId) -> Subscription {
        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.unregister(&scope, id);
            }
        })
    }
}
