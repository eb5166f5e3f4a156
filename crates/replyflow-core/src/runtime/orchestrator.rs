//! Message Send Orchestrator - Issues a send and follows its reply.
//!
//! A send picks its transport up front. With the push channel up, the reply
//! is registered with the dispatcher under a provisional id before the HTTP
//! request goes out, so tokens that race the response are not lost. Without
//! it, the reply is followed by the fallback poller. Either way the caller
//! sees the same [`ReplyObserver`] callbacks and gets a [`ReplyHandle`].

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dispatcher::MessageDispatcher;
use super::poller::{FallbackPoller, PollObserver};
use crate::api::ChatBackend;
use crate::channel::ConnectionManager;
use crate::error::{ConnectionError, ReplyError, Result};
use crate::models::{
    Attachment, ContentUpdateMode, FlushedUpdate, MessageStatus, SendMessageRequest,
    TransportMode,
};
use crate::services::{
    AuthFailureHandler, ConversationListRefresher, CredentialStore, NoopServices,
};
use crate::subscription::Subscription;

/// Lifecycle of one send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPhase {
    New,
    Sent,
    Streaming,
    Polling,
    Complete,
    Error,
}

impl SendPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

/// Receives reply progress regardless of transport.
///
/// Callbacks for one reply never overlap. `on_complete` or `on_error` is
/// called exactly once and nothing follows it.
pub trait ReplyObserver: Send + Sync {
    /// New content appended to the reply.
    fn on_token(&self, _token: &str) {}

    /// The backend rewrote the reply; `content` is the whole new text.
    fn on_replace(&self, _content: &str) {}

    fn on_status(&self, _status: MessageStatus) {}

    /// Conversation the reply belongs to. `created` is true for a
    /// conversation this send started.
    fn on_conversation(&self, _conversation_id: &str, _created: bool) {}

    /// `stopped` is true when the send was cancelled; `content` is what had
    /// arrived by then.
    fn on_complete(&self, _content: &str, _stopped: bool) {}

    fn on_error(&self, _error: &ReplyError) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl ReplyObserver for NullObserver {}

/// Parameters of one send.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub content: String,
    pub conversation_id: Option<String>,
    pub attachment: Option<Attachment>,
    pub cancel: CancellationToken,
    pub force_polling: bool,
}

impl SendRequest {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            conversation_id: None,
            attachment: None,
            cancel: CancellationToken::new(),
            force_polling: false,
        }
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Skip the push channel even when it is connected.
    pub fn force_polling(mut self) -> Self {
        self.force_polling = true;
        self
    }
}

struct ReplyState {
    phase: SendPhase,
    received: String,
    status: Option<MessageStatus>,
    stopped: bool,
    error: Option<String>,
}

/// Per-send reply state shared by the handle, the dispatcher handler and the
/// follow-up task. Terminal phases are sticky.
pub(crate) struct ReplyTracker {
    state: Mutex<ReplyState>,
    observer: Arc<dyn ReplyObserver>,
    phase_tx: watch::Sender<SendPhase>,
}

impl ReplyTracker {
    pub(crate) fn new(observer: Arc<dyn ReplyObserver>) -> Arc<Self> {
        let (phase_tx, _) = watch::channel(SendPhase::New);
        Arc::new(Self {
            state: Mutex::new(ReplyState {
                phase: SendPhase::New,
                received: String::new(),
                status: None,
                stopped: false,
                error: None,
            }),
            observer,
            phase_tx,
        })
    }

    fn phase(&self) -> SendPhase {
        self.state.lock().phase
    }

    fn content(&self) -> String {
        self.state.lock().received.clone()
    }

    fn subscribe(&self) -> watch::Receiver<SendPhase> {
        self.phase_tx.subscribe()
    }

    /// Move to a non-terminal phase unless the reply already ended.
    fn advance(&self, phase: SendPhase) -> bool {
        {
            let mut state = self.state.lock();
            if state.phase.is_terminal() {
                return false;
            }
            state.phase = phase;
        }
        self.phase_tx.send_replace(phase);
        true
    }

    fn complete(&self, stopped: bool) -> bool {
        let content = {
            let mut state = self.state.lock();
            if state.phase.is_terminal() {
                return false;
            }
            state.phase = SendPhase::Complete;
            state.stopped = stopped;
            state.received.clone()
        };
        self.observer.on_complete(&content, stopped);
        self.phase_tx.send_replace(SendPhase::Complete);
        true
    }

    fn fail(&self, error: &ReplyError) -> bool {
        {
            let mut state = self.state.lock();
            if state.phase.is_terminal() {
                return false;
            }
            state.phase = SendPhase::Error;
            state.error = Some(error.to_string());
        }
        self.observer.on_error(error);
        self.phase_tx.send_replace(SendPhase::Error);
        true
    }

    /// Apply a flushed push update. Replace updates that only extend what was
    /// already received are reported as tokens.
    pub(crate) fn apply_flush(&self, update: &FlushedUpdate) {
        let mut token = None;
        let mut replaced = None;
        let mut status = None;
        let entered_streaming;
        {
            let mut state = self.state.lock();
            if state.phase.is_terminal() {
                return;
            }
            match update.mode {
                ContentUpdateMode::Append => {
                    if !update.delta.is_empty() {
                        state.received.push_str(&update.delta);
                        token = Some(update.delta.clone());
                    }
                }
                ContentUpdateMode::Replace => {
                    match update.content.strip_prefix(state.received.as_str()) {
                        Some(suffix) => {
                            if !suffix.is_empty() {
                                token = Some(suffix.to_string());
                            }
                        }
                        None => replaced = Some(update.content.clone()),
                    }
                    state.received = update.content.clone();
                }
            }
            if state.status != Some(update.status) {
                state.status = Some(update.status);
                status = Some(update.status);
            }
            entered_streaming = matches!(state.phase, SendPhase::New | SendPhase::Sent);
            if entered_streaming {
                state.phase = SendPhase::Streaming;
            }
        }
        if entered_streaming {
            self.phase_tx.send_replace(SendPhase::Streaming);
        }

        if let Some(status) = status {
            self.observer.on_status(status);
        }
        if let Some(content) = replaced {
            self.observer.on_replace(&content);
        }
        if let Some(token) = token {
            self.observer.on_token(&token);
        }

        if update.status == MessageStatus::Error {
            let message = update
                .error
                .clone()
                .unwrap_or_else(|| "generation failed".to_string());
            self.fail(&ReplyError::Generation(message));
        } else if update.is_terminal() {
            self.complete(false);
        }
    }
}

impl PollObserver for ReplyTracker {
    fn on_token(&self, token: &str) {
        {
            let mut state = self.state.lock();
            if state.phase.is_terminal() {
                return;
            }
            state.received.push_str(token);
        }
        self.observer.on_token(token);
    }

    fn on_status(&self, status: MessageStatus) {
        {
            let mut state = self.state.lock();
            if state.phase.is_terminal() || state.status == Some(status) {
                return;
            }
            state.status = Some(status);
        }
        self.observer.on_status(status);
    }
}

/// Caller's view of an in-flight reply.
#[derive(Clone)]
pub struct ReplyHandle {
    tracker: Arc<ReplyTracker>,
    cancel: CancellationToken,
}

impl ReplyHandle {
    pub fn phase(&self) -> SendPhase {
        self.tracker.phase()
    }

    /// Content received so far.
    pub fn content(&self) -> String {
        self.tracker.content()
    }

    /// True once a cancelled reply has settled as complete-with-stopped.
    pub fn is_stopped(&self) -> bool {
        self.tracker.state.lock().stopped
    }

    pub fn error(&self) -> Option<String> {
        self.tracker.state.lock().error.clone()
    }

    /// Stop following the reply. Content received so far is kept.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the reply to reach a terminal phase.
    pub async fn wait(&self) -> SendPhase {
        let mut phase = self.tracker.subscribe();
        let result = phase.wait_for(|phase| phase.is_terminal()).await.map(|phase| *phase);
        result.unwrap_or_else(|_| self.tracker.phase())
    }
}

impl std::fmt::Debug for ReplyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyHandle")
            .field("phase", &self.phase())
            .finish()
    }
}

/// Result of a successful send.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub conversation_id: String,
    pub message_id: String,
    pub provisional_id: String,
    pub transport: TransportMode,
    pub reply: ReplyHandle,
}

enum PushOutcome {
    Finished,
    Cancelled,
    Dropped,
}

/// Sends user messages and follows their replies over push or polling.
#[derive(Clone)]
pub struct MessageOrchestrator {
    backend: Arc<dyn ChatBackend>,
    connection: ConnectionManager,
    dispatcher: MessageDispatcher,
    poller: FallbackPoller,
    credentials: Arc<dyn CredentialStore>,
    refresher: Arc<dyn ConversationListRefresher>,
    auth_failures: Arc<dyn AuthFailureHandler>,
}

impl MessageOrchestrator {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        connection: ConnectionManager,
        dispatcher: MessageDispatcher,
        poller: FallbackPoller,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            backend,
            connection,
            dispatcher,
            poller,
            credentials,
            refresher: Arc::new(NoopServices),
            auth_failures: Arc::new(NoopServices),
        }
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn ConversationListRefresher>) -> Self {
        self.refresher = refresher;
        self
    }

    pub fn with_auth_failure_handler(mut self, handler: Arc<dyn AuthFailureHandler>) -> Self {
        self.auth_failures = handler;
        self
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn dispatcher(&self) -> &MessageDispatcher {
        &self.dispatcher
    }

    /// Send a message and start following its reply.
    ///
    /// Returns once the backend has accepted the message. The reply keeps
    /// arriving through `observer` and the returned handle.
    pub async fn send(
        &self,
        request: SendRequest,
        observer: Arc<dyn ReplyObserver>,
    ) -> Result<SendOutcome> {
        let provisional_id = format!("temp-{}", Uuid::new_v4());
        let tracker = ReplyTracker::new(observer.clone());
        let cancel = request.cancel.clone();
        let transport = self.choose_transport(request.force_polling).await;
        debug!(
            provisional_id = %provisional_id,
            transport = transport.as_str(),
            "Sending message"
        );

        let subscription = match transport {
            TransportMode::WebSocket => {
                let tracker = tracker.clone();
                Some(
                    self.dispatcher
                        .register_handler(&provisional_id, move |update| {
                            tracker.apply_flush(update)
                        }),
                )
            }
            TransportMode::Polling => None,
        };

        let created = request.conversation_id.is_none();
        let outbound = SendMessageRequest {
            message: request.content,
            conversation_id: request.conversation_id,
            transport_mode: transport,
            file: request.attachment,
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ReplyError::Cancelled),
            result = self.backend.send_message(outbound) => result,
        };

        let response = match result {
            Ok(response) => response,
            Err(error) => {
                if let Some(subscription) = subscription {
                    subscription.unsubscribe();
                }
                match error {
                    ReplyError::Cancelled => {
                        info!(provisional_id = %provisional_id, "Send cancelled before acknowledgement");
                        tracker.complete(true);
                    }
                    ref error => {
                        warn!(provisional_id = %provisional_id, error = %error, "Send failed");
                        if error.is_auth_failure() {
                            self.auth_failures.on_auth_failure();
                        }
                        tracker.fail(error);
                    }
                }
                return Err(error);
            }
        };

        tracker.advance(SendPhase::Sent);
        info!(
            conversation_id = %response.conversation_id,
            message_id = %response.message_id,
            created,
            "Message accepted"
        );
        observer.on_conversation(&response.conversation_id, created);
        if created {
            self.refresher.refresh_conversations();
        }

        match subscription {
            Some(subscription) => {
                self.dispatcher.register_identifier_mapping(
                    &provisional_id,
                    &response.message_id,
                    Some(&response.conversation_id),
                );
                let orchestrator = self.clone();
                let tracker = tracker.clone();
                let message_id = response.message_id.clone();
                let conversation_id = response.conversation_id.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    orchestrator
                        .follow_push(tracker, subscription, message_id, conversation_id, cancel)
                        .await;
                });
            }
            None => {
                let orchestrator = self.clone();
                let tracker = tracker.clone();
                let message_id = response.message_id.clone();
                let conversation_id = response.conversation_id.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    orchestrator
                        .follow_poll(tracker, message_id, conversation_id, cancel)
                        .await;
                });
            }
        }

        Ok(SendOutcome {
            conversation_id: response.conversation_id,
            message_id: response.message_id,
            provisional_id,
            transport,
            reply: ReplyHandle { tracker, cancel },
        })
    }

    /// Follow an existing reply through the poller.
    pub fn follow(
        &self,
        message_id: &str,
        conversation_id: &str,
        observer: Arc<dyn ReplyObserver>,
        cancel: CancellationToken,
    ) -> ReplyHandle {
        let tracker = ReplyTracker::new(observer);
        let orchestrator = self.clone();
        let task_tracker = tracker.clone();
        let message_id = message_id.to_string();
        let conversation_id = conversation_id.to_string();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            orchestrator
                .follow_poll(task_tracker, message_id, conversation_id, task_cancel)
                .await;
        });
        ReplyHandle { tracker, cancel }
    }

    /// Push when the channel is up, or can be brought up with one awaited
    /// reconnect; polling otherwise.
    async fn choose_transport(&self, force_polling: bool) -> TransportMode {
        if force_polling {
            return TransportMode::Polling;
        }
        if self.connection.is_connected() {
            return TransportMode::WebSocket;
        }
        let Some(token) = self.credentials.bearer_token() else {
            return TransportMode::Polling;
        };
        match self.connection.connect(&token).await {
            Ok(()) => TransportMode::WebSocket,
            Err(ConnectionError::Unauthorized) => {
                warn!("Push channel rejected the credential");
                self.auth_failures.on_auth_failure();
                TransportMode::Polling
            }
            Err(error) => {
                warn!(error = %error, "Push channel unavailable, falling back to polling");
                TransportMode::Polling
            }
        }
    }

    async fn follow_push(
        &self,
        tracker: Arc<ReplyTracker>,
        subscription: Subscription,
        message_id: String,
        conversation_id: String,
        cancel: CancellationToken,
    ) {
        let dropped = Arc::new(Notify::new());
        let signal = dropped.clone();
        let listener = self.connection.add_listener(move |connected| {
            if !connected {
                signal.notify_one();
            }
        });
        if !self.connection.is_connected() {
            dropped.notify_one();
        }

        let mut phase = tracker.subscribe();
        let outcome = tokio::select! {
            biased;
            _ = phase.wait_for(|phase| phase.is_terminal()) => PushOutcome::Finished,
            _ = cancel.cancelled() => PushOutcome::Cancelled,
            _ = dropped.notified() => PushOutcome::Dropped,
        };
        listener.unsubscribe();
        subscription.unsubscribe();

        match outcome {
            PushOutcome::Finished => {}
            PushOutcome::Cancelled => {
                info!(message_id = %message_id, "Reply stopped by caller");
                self.dispatcher.abandon(&message_id);
                tracker.complete(true);
            }
            PushOutcome::Dropped => {
                if tracker.phase().is_terminal() {
                    return;
                }
                self.dispatcher.abandon(&message_id);
                warn!(
                    message_id = %message_id,
                    seen = tracker.content().len(),
                    "Push channel dropped mid-reply, switching to polling"
                );
                self.follow_poll(tracker, message_id, conversation_id, cancel)
                    .await;
            }
        }
    }

    async fn follow_poll(
        &self,
        tracker: Arc<ReplyTracker>,
        message_id: String,
        conversation_id: String,
        cancel: CancellationToken,
    ) {
        if !tracker.advance(SendPhase::Polling) {
            return;
        }
        let seen = tracker.content();
        let result = self
            .poller
            .poll_until_complete_from(&message_id, &conversation_id, &seen, tracker.as_ref(), &cancel)
            .await;
        match result {
            Ok(_) => {
                tracker.complete(false);
            }
            Err(ReplyError::Cancelled) => {
                info!(message_id = %message_id, "Reply stopped by caller");
                tracker.complete(true);
            }
            Err(error) => {
                if error.is_auth_failure() {
                    self.auth_failures.on_auth_failure();
                }
                tracker.fail(&error);
            }
        }
    }
}
