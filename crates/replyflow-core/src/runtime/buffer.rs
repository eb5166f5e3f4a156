//! Content Buffer - Coalesces rapid content fragments per message.
//!
//! Every fragment re-arms a short debounce timer. When the timer fires, the
//! buffered content is emitted as one update. Oversized buffers and terminal
//! updates skip the timer and flush at once, bounding latency on long
//! streams while still coalescing bursts.
//!
//! Flushes are not delivered by calling subscribers directly: they are queued
//! on a channel that the dispatcher drains on its own task, so a subscriber
//! can never re-enter `ingest` for the message being flushed.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::models::{ContentUpdateMode, FlushedUpdate, MessageStatus, MessageUpdate};

/// Identifier of one registered subscriber.
pub type SubscriberId = u64;

/// Buffer configuration. The two flush triggers are independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferConfig {
    /// Quiet period after the last fragment before a flush.
    pub debounce: Duration,
    /// Buffered size (bytes) that forces an immediate flush.
    pub max_buffer_bytes: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(50),
            max_buffer_bytes: 2048,
        }
    }
}

/// Output of the buffer, drained by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferEvent {
    /// A coalesced update for every subscriber of the message.
    Flushed(FlushedUpdate),
    /// Content already flushed, replayed to one late subscriber.
    Snapshot {
        subscriber: SubscriberId,
        update: FlushedUpdate,
    },
}

/// Per-message accumulation state.
struct ContentAccumulator {
    content: String,
    /// Bytes of `content` already emitted.
    flushed_len: usize,
    /// A REPLACE arrived since the last flush.
    replaced: bool,
    dirty: bool,
    status: MessageStatus,
    is_complete: bool,
    conversation_id: Option<String>,
    error: Option<String>,
    timer: Option<JoinHandle<()>>,
    /// Sequence of the most recently armed timer.
    timer_seq: u64,
}

impl ContentAccumulator {
    fn new() -> Self {
        Self {
            content: String::new(),
            flushed_len: 0,
            replaced: false,
            dirty: false,
            status: MessageStatus::Pending,
            is_complete: false,
            conversation_id: None,
            error: None,
            timer: None,
            timer_seq: 0,
        }
    }

    fn apply(&mut self, update: &MessageUpdate) {
        if let Some(fragment) = &update.content {
            match update.content_update_mode {
                ContentUpdateMode::Replace => {
                    self.content.clear();
                    self.content.push_str(fragment);
                    self.flushed_len = 0;
                    self.replaced = true;
                }
                ContentUpdateMode::Append => self.content.push_str(fragment),
            }
            self.dirty = true;
            if update.status.is_none() && !self.status.is_terminal() {
                self.status = MessageStatus::Streaming;
            }
        }

        if let Some(status) = update.status
            && status != self.status
        {
            self.status = status;
            self.dirty = true;
        }

        if update.is_complete && !self.is_complete {
            self.is_complete = true;
            self.dirty = true;
            if !self.status.is_terminal() {
                self.status = MessageStatus::Complete;
            }
        }

        if let Some(conversation_id) = &update.conversation_id {
            self.conversation_id = Some(conversation_id.clone());
        }
        if let Some(error) = &update.error {
            self.error = Some(error.clone());
            self.dirty = true;
        }
    }

    /// Size counter for the max-buffer trigger.
    fn unflushed_len(&self) -> usize {
        self.content.len() - self.flushed_len
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Take the pending part as a coalesced update, or `None` if nothing
    /// changed since the previous flush.
    fn take_flush(&mut self, message_id: &str) -> Option<FlushedUpdate> {
        self.cancel_timer();
        if !self.dirty {
            return None;
        }
        let (mode, delta) = if self.replaced {
            (ContentUpdateMode::Replace, self.content.clone())
        } else {
            (
                ContentUpdateMode::Append,
                self.content[self.flushed_len..].to_string(),
            )
        };
        self.flushed_len = self.content.len();
        self.replaced = false;
        self.dirty = false;
        Some(self.build(message_id, self.content.clone(), delta, mode))
    }

    /// Everything flushed so far, as a REPLACE.
    fn snapshot(&self, message_id: &str) -> Option<FlushedUpdate> {
        if self.flushed_len == 0 && self.status == MessageStatus::Pending && !self.is_complete {
            return None;
        }
        let content = self.content[..self.flushed_len].to_string();
        Some(self.build(message_id, content.clone(), content, ContentUpdateMode::Replace))
    }

    fn build(
        &self,
        message_id: &str,
        content: String,
        delta: String,
        mode: ContentUpdateMode,
    ) -> FlushedUpdate {
        FlushedUpdate {
            message_id: message_id.to_string(),
            conversation_id: self.conversation_id.clone(),
            content,
            delta,
            mode,
            status: self.status,
            is_complete: self.is_complete,
            error: self.error.clone(),
        }
    }
}

struct BufferInner {
    config: BufferConfig,
    entries: Mutex<HashMap<String, ContentAccumulator>>,
    events: mpsc::UnboundedSender<BufferEvent>,
}

impl BufferInner {
    fn flush_locked(&self, message_id: &str, accumulator: &mut ContentAccumulator) -> bool {
        match accumulator.take_flush(message_id) {
            Some(update) => {
                trace!(
                    message_id,
                    delta_len = update.delta.len(),
                    status = %update.status,
                    "Flushing buffered content"
                );
                let _ = self.events.send(BufferEvent::Flushed(update));
                true
            }
            None => false,
        }
    }

    /// Flush on behalf of timer `seq`. A timer re-armed since then owns the
    /// accumulator and is left alone.
    fn flush_from_timer(&self, message_id: &str, seq: u64) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(message_id) {
            Some(accumulator) if accumulator.timer_seq == seq => {
                accumulator.timer = None;
                self.flush_locked(message_id, accumulator)
            }
            _ => false,
        }
    }
}

/// Debouncing content buffer keyed by message id.
#[derive(Clone)]
pub struct ContentBuffer {
    inner: Arc<BufferInner>,
}

impl ContentBuffer {
    /// Create a buffer and the receiver its flushes are delivered on.
    pub fn new(config: BufferConfig) -> (Self, mpsc::UnboundedReceiver<BufferEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let buffer = Self {
            inner: Arc::new(BufferInner {
                config,
                entries: Mutex::new(HashMap::new()),
                events,
            }),
        };
        (buffer, receiver)
    }

    /// Apply one fragment. Flushes at once on completion or when the buffer
    /// reaches `max_buffer_bytes`; otherwise (re)arms the debounce timer.
    pub fn ingest(&self, update: MessageUpdate) {
        let mut entries = self.inner.entries.lock();
        let accumulator = entries
            .entry(update.message_id.clone())
            .or_insert_with(ContentAccumulator::new);
        accumulator.apply(&update);

        let oversized = accumulator.unflushed_len() >= self.inner.config.max_buffer_bytes;
        if update.is_terminal() || oversized {
            debug!(
                message_id = %update.message_id,
                terminal = update.is_terminal(),
                oversized,
                "Flushing without waiting for debounce"
            );
            self.inner.flush_locked(&update.message_id, accumulator);
            return;
        }

        accumulator.cancel_timer();
        accumulator.timer_seq += 1;
        let seq = accumulator.timer_seq;
        let inner = Arc::clone(&self.inner);
        let message_id = update.message_id.clone();
        let delay = self.inner.config.debounce;
        accumulator.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.flush_from_timer(&message_id, seq);
        }));
    }

    /// Flush pending content for a message now. Returns whether anything was
    /// emitted.
    pub fn flush_immediately(&self, message_id: &str) -> bool {
        let mut entries = self.inner.entries.lock();
        match entries.get_mut(message_id) {
            Some(accumulator) => self.inner.flush_locked(message_id, accumulator),
            None => false,
        }
    }

    /// Full buffered content, including fragments not yet flushed.
    pub fn buffered(&self, message_id: &str) -> Option<String> {
        self.inner
            .entries
            .lock()
            .get(message_id)
            .map(|accumulator| accumulator.content.clone())
    }

    /// Queue a replay of the flushed content of `message_id` for one
    /// subscriber. Returns false when there is nothing to replay.
    pub fn replay_to(&self, message_id: &str, subscriber: SubscriberId) -> bool {
        let entries = self.inner.entries.lock();
        let Some(update) = entries
            .get(message_id)
            .and_then(|accumulator| accumulator.snapshot(message_id))
        else {
            return false;
        };
        self.inner
            .events
            .send(BufferEvent::Snapshot { subscriber, update })
            .is_ok()
    }

    /// Drop a message's buffer and cancel its timer. Returns whether the
    /// dropped buffer had already seen its terminal update.
    pub fn discard(&self, message_id: &str) -> bool {
        match self.inner.entries.lock().remove(message_id) {
            Some(mut accumulator) => {
                accumulator.cancel_timer();
                accumulator.is_complete || accumulator.status.is_terminal()
            }
            None => false,
        }
    }

    /// Drop every buffer that belongs to a conversation.
    pub fn discard_conversation(&self, conversation_id: &str) -> usize {
        let mut entries = self.inner.entries.lock();
        let before = entries.len();
        entries.retain(|_, accumulator| {
            let keep = accumulator.conversation_id.as_deref() != Some(conversation_id);
            if !keep {
                accumulator.cancel_timer();
            }
            keep
        });
        before - entries.len()
    }
}
