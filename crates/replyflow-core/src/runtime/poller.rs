//! Fallback Poller - Follows a reply through snapshot requests.
//!
//! Used when the push channel is unavailable. Each snapshot carries the full
//! content so far; the poller turns consecutive snapshots back into deltas.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::ChatBackend;
use crate::error::{ReplyError, Result};
use crate::models::{MessageSnapshot, MessageStatus};

/// Polling cadence and budget. The defaults allow ten minutes at 1 Hz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: 600,
        }
    }
}

/// Difference between the content already seen and a new snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotDelta {
    Unchanged,
    /// The snapshot extends what was seen by this suffix.
    Append(String),
    /// The snapshot is shorter or rewrites earlier content.
    Diverged(String),
}

pub fn compute_delta(previous: &str, snapshot: &str) -> SnapshotDelta {
    if snapshot == previous {
        SnapshotDelta::Unchanged
    } else if let Some(suffix) = snapshot.strip_prefix(previous) {
        SnapshotDelta::Append(suffix.to_string())
    } else {
        SnapshotDelta::Diverged(snapshot.to_string())
    }
}

/// Receives what the poller reconstructs.
pub trait PollObserver: Send + Sync {
    fn on_token(&self, token: &str);

    fn on_status(&self, _status: MessageStatus) {}
}

#[derive(Clone)]
pub struct FallbackPoller {
    backend: Arc<dyn ChatBackend>,
    config: PollerConfig,
}

impl FallbackPoller {
    pub fn new(backend: Arc<dyn ChatBackend>, config: PollerConfig) -> Self {
        Self { backend, config }
    }

    /// Poll until the message completes and return its final content.
    pub async fn poll_until_complete(
        &self,
        message_id: &str,
        conversation_id: &str,
        observer: &dyn PollObserver,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.poll_until_complete_from(message_id, conversation_id, "", observer, cancel)
            .await
    }

    /// Like [`Self::poll_until_complete`], treating `already_seen` as content
    /// the observer has received through another path.
    pub async fn poll_until_complete_from(
        &self,
        message_id: &str,
        conversation_id: &str,
        already_seen: &str,
        observer: &dyn PollObserver,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let mut seen = already_seen.to_string();
        let mut last_status: Option<MessageStatus> = None;

        for attempt in 1..=self.config.max_attempts {
            if cancel.is_cancelled() {
                return Err(ReplyError::Cancelled);
            }

            match self.fetch_snapshot(message_id, conversation_id).await {
                Ok(snapshot) => {
                    match compute_delta(&seen, &snapshot.content) {
                        SnapshotDelta::Unchanged => {}
                        SnapshotDelta::Append(suffix) => observer.on_token(&suffix),
                        SnapshotDelta::Diverged(content) => {
                            warn!(
                                message_id,
                                seen_len = seen.len(),
                                snapshot_len = content.len(),
                                "Snapshot diverged from seen content, re-sending it whole"
                            );
                            observer.on_token(&content);
                        }
                    }
                    seen = snapshot.content;

                    if last_status != Some(snapshot.status) {
                        last_status = Some(snapshot.status);
                        observer.on_status(snapshot.status);
                    }

                    match snapshot.status {
                        MessageStatus::Complete => {
                            info!(message_id, attempt, "Poller observed completion");
                            return Ok(seen);
                        }
                        MessageStatus::Error => {
                            let error = snapshot
                                .error
                                .unwrap_or_else(|| "generation failed".to_string());
                            warn!(message_id, attempt, error = %error, "Poller observed error");
                            return Err(ReplyError::Generation(error));
                        }
                        _ => {}
                    }
                }
                Err(error) if !error.is_transient() => {
                    warn!(message_id, attempt, error = %error, "Snapshot fetch failed permanently");
                    return Err(error);
                }
                Err(error) => {
                    warn!(message_id, attempt, error = %error, "Snapshot fetch failed");
                }
            }

            if attempt < self.config.max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ReplyError::Cancelled),
                    _ = tokio::time::sleep(self.config.interval) => {}
                }
            }
        }

        warn!(
            message_id,
            attempts = self.config.max_attempts,
            "Poller gave up waiting for completion"
        );
        Err(ReplyError::PollTimeout {
            attempts: self.config.max_attempts,
        })
    }

    /// Per-message snapshot, falling back to the whole conversation.
    async fn fetch_snapshot(
        &self,
        message_id: &str,
        conversation_id: &str,
    ) -> Result<MessageSnapshot> {
        match self.backend.fetch_message(message_id).await {
            Ok(snapshot) => Ok(snapshot),
            Err(error) if !error.is_transient() => Err(error),
            Err(error) => {
                debug!(
                    message_id,
                    conversation_id,
                    error = %error,
                    "Message endpoint failed, fetching conversation"
                );
                let conversation = self.backend.fetch_conversation(conversation_id).await?;
                conversation
                    .find_message(message_id)
                    .cloned()
                    .ok_or_else(|| ReplyError::MessageNotFound(message_id.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConversationSnapshot, SendMessageRequest, SendMessageResponse};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend replaying a fixed script of message snapshots.
    #[derive(Default)]
    struct ScriptedBackend {
        messages: Mutex<VecDeque<Result<MessageSnapshot>>>,
        conversation: Mutex<Option<ConversationSnapshot>>,
        message_calls: AtomicUsize,
        conversation_calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn with_snapshots(snapshots: &[(&str, MessageStatus)]) -> Self {
            let backend = Self::default();
            for (content, status) in snapshots {
                backend.messages.lock().push_back(Ok(snapshot(content, *status)));
            }
            backend
        }
    }

    fn snapshot(content: &str, status: MessageStatus) -> MessageSnapshot {
        MessageSnapshot {
            id: "m1".to_string(),
            content: content.to_string(),
            status,
            conversation_id: Some("c1".to_string()),
            error: None,
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn send_message(&self, _request: SendMessageRequest) -> Result<SendMessageResponse> {
            Err(ReplyError::Send("not scripted".to_string()))
        }

        async fn fetch_message(&self, message_id: &str) -> Result<MessageSnapshot> {
            self.message_calls.fetch_add(1, Ordering::SeqCst);
            self.messages
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(ReplyError::MessageNotFound(message_id.to_string())))
        }

        async fn fetch_conversation(&self, conversation_id: &str) -> Result<ConversationSnapshot> {
            self.conversation_calls.fetch_add(1, Ordering::SeqCst);
            self.conversation.lock().clone().ok_or(ReplyError::Http {
                status: 404,
                message: format!("conversation {} not found", conversation_id),
            })
        }
    }

    #[derive(Default)]
    struct Recorder {
        tokens: Mutex<Vec<String>>,
        statuses: Mutex<Vec<MessageStatus>>,
    }

    impl PollObserver for Recorder {
        fn on_token(&self, token: &str) {
            self.tokens.lock().push(token.to_string());
        }

        fn on_status(&self, status: MessageStatus) {
            self.statuses.lock().push(status);
        }
    }

    fn poller(backend: Arc<ScriptedBackend>, max_attempts: u32) -> FallbackPoller {
        FallbackPoller::new(
            backend,
            PollerConfig {
                interval: Duration::from_millis(100),
                max_attempts,
            },
        )
    }

    #[test]
    fn test_compute_delta() {
        assert_eq!(compute_delta("ab", "ab"), SnapshotDelta::Unchanged);
        assert_eq!(compute_delta("ab", "abc"), SnapshotDelta::Append("c".to_string()));
        assert_eq!(compute_delta("", "ab"), SnapshotDelta::Append("ab".to_string()));
        assert_eq!(compute_delta("abc", "ab"), SnapshotDelta::Diverged("ab".to_string()));
        assert_eq!(compute_delta("abc", "xyz1"), SnapshotDelta::Diverged("xyz1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshots_become_deltas() {
        let backend = Arc::new(ScriptedBackend::with_snapshots(&[
            ("ab", MessageStatus::Streaming),
            ("abc", MessageStatus::Streaming),
            ("abcd", MessageStatus::Complete),
        ]));
        let recorder = Recorder::default();

        let content = poller(backend, 10)
            .poll_until_complete("m1", "c1", &recorder, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(content, "abcd");
        assert_eq!(*recorder.tokens.lock(), vec!["ab", "c", "d"]);
        assert_eq!(
            *recorder.statuses.lock(),
            vec![MessageStatus::Streaming, MessageStatus::Complete]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_status_stops_without_spending_budget() {
        let backend = Arc::new(ScriptedBackend::with_snapshots(&[
            ("ab", MessageStatus::Streaming),
            ("ab", MessageStatus::Error),
            ("abc", MessageStatus::Streaming),
        ]));
        let recorder = Recorder::default();

        let error = poller(backend.clone(), 600)
            .poll_until_complete("m1", "c1", &recorder, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(error, ReplyError::Generation(_)));
        assert_eq!(backend.message_calls.load(Ordering::SeqCst), 2);
        assert_eq!(*recorder.tokens.lock(), vec!["ab"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_after_max_attempts() {
        let backend = Arc::new(ScriptedBackend::with_snapshots(&[
            ("a", MessageStatus::Streaming),
            ("a", MessageStatus::Streaming),
            ("a", MessageStatus::Streaming),
        ]));

        let error = poller(backend.clone(), 3)
            .poll_until_complete("m1", "c1", &Recorder::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(error, ReplyError::PollTimeout { attempts: 3 }));
        assert_eq!(backend.message_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_conversation_endpoint() {
        let backend = Arc::new(ScriptedBackend::default());
        *backend.conversation.lock() = Some(ConversationSnapshot {
            id: "c1".to_string(),
            messages: vec![snapshot("done", MessageStatus::Complete)],
        });
        let recorder = Recorder::default();

        let content = poller(backend.clone(), 5)
            .poll_until_complete("m1", "c1", &recorder, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(content, "done");
        assert_eq!(backend.conversation_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumes_from_already_seen_content() {
        let backend = Arc::new(ScriptedBackend::with_snapshots(&[(
            "Hi there",
            MessageStatus::Complete,
        )]));
        let recorder = Recorder::default();

        poller(backend, 5)
            .poll_until_complete_from("m1", "c1", "Hi", &recorder, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*recorder.tokens.lock(), vec![" there"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_diverged_snapshot_is_resent_whole() {
        let backend = Arc::new(ScriptedBackend::with_snapshots(&[
            ("abc", MessageStatus::Streaming),
            ("ab!", MessageStatus::Complete),
        ]));
        let recorder = Recorder::default();

        let content = poller(backend, 5)
            .poll_until_complete("m1", "c1", &recorder, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(content, "ab!");
        assert_eq!(*recorder.tokens.lock(), vec!["abc", "ab!"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_is_fatal() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.messages.lock().push_back(Err(ReplyError::Unauthorized));

        let error = poller(backend.clone(), 5)
            .poll_until_complete("m1", "c1", &Recorder::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(error.is_auth_failure());
        assert_eq!(backend.message_calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.conversation_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_fails_fast() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.messages.lock().push_back(Err(ReplyError::Http {
            status: 400,
            message: "bad message id".to_string(),
        }));

        let error = poller(backend.clone(), 5)
            .poll_until_complete("m1", "c1", &Recorder::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(error, ReplyError::Http { status: 400, .. }));
        assert_eq!(backend.message_calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.conversation_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.messages.lock().push_back(Err(ReplyError::Http {
            status: 503,
            message: "unavailable".to_string(),
        }));
        backend
            .messages
            .lock()
            .push_back(Ok(snapshot("back", MessageStatus::Complete)));

        let content = poller(backend.clone(), 5)
            .poll_until_complete("m1", "c1", &Recorder::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(content, "back");
        assert_eq!(backend.message_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation() {
        let backend = Arc::new(ScriptedBackend::with_snapshots(&[(
            "a",
            MessageStatus::Streaming,
        )]));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let error = poller(backend, 600)
            .poll_until_complete("m1", "c1", &Recorder::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(error, ReplyError::Cancelled));
    }
}
