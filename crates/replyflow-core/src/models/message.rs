//! Message update types shared by the push and polling paths.

use serde::{Deserialize, Serialize};

/// Generation status of an assistant message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Pending,
    Queued,
    Processing,
    Streaming,
    #[serde(alias = "completed")]
    Complete,
    Error,
}

impl MessageStatus {
    /// Complete and Error end a message; nothing is generated afterwards.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Streaming => "streaming",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a content fragment combines with what is already buffered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentUpdateMode {
    #[default]
    Append,
    Replace,
}

/// A single incremental update for one message, as produced by the push
/// channel or the poller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageUpdate {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub content_update_mode: ContentUpdateMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default)]
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MessageUpdate {
    /// An APPEND fragment.
    pub fn append(message_id: impl Into<String>, fragment: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            content: Some(fragment.into()),
            content_update_mode: ContentUpdateMode::Append,
            status: None,
            is_complete: false,
            conversation_id: None,
            error: None,
        }
    }

    /// A REPLACE fragment.
    pub fn replace(message_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content_update_mode: ContentUpdateMode::Replace,
            ..Self::append(message_id, content)
        }
    }

    /// A status change without content.
    pub fn status(message_id: impl Into<String>, status: MessageStatus) -> Self {
        Self {
            message_id: message_id.into(),
            content: None,
            content_update_mode: ContentUpdateMode::Append,
            status: Some(status),
            is_complete: false,
            conversation_id: None,
            error: None,
        }
    }

    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn completed(mut self) -> Self {
        self.is_complete = true;
        self
    }

    /// True when this update ends the message, either by flag or by status.
    pub fn is_terminal(&self) -> bool {
        self.is_complete || self.status.is_some_and(MessageStatus::is_terminal)
    }
}

/// Coalesced update handed to subscribers after a buffer flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushedUpdate {
    /// Identifier the content was keyed by when it arrived.
    pub message_id: String,
    pub conversation_id: Option<String>,
    /// Everything flushed so far for this message.
    pub content: String,
    /// Content added since the previous flush. Equals `content` when
    /// `mode` is `Replace`.
    pub delta: String,
    pub mode: ContentUpdateMode,
    pub status: MessageStatus,
    pub is_complete: bool,
    pub error: Option<String>,
}

impl FlushedUpdate {
    pub fn is_terminal(&self) -> bool {
        self.is_complete || self.status.is_terminal()
    }
}

/// Links a client-generated provisional id to the id the backend assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentifierMapping {
    pub provisional_id: String,
    pub confirmed_id: String,
    pub conversation_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_format() {
        let status: MessageStatus = serde_json::from_str("\"streaming\"").unwrap();
        assert_eq!(status, MessageStatus::Streaming);
        let completed: MessageStatus = serde_json::from_str("\"completed\"").unwrap();
        assert_eq!(completed, MessageStatus::Complete);
        assert_eq!(
            serde_json::to_string(&MessageStatus::Error).unwrap(),
            "\"error\""
        );
    }

    #[test]
    fn test_terminal_detection() {
        assert!(MessageStatus::Complete.is_terminal());
        assert!(MessageStatus::Error.is_terminal());
        assert!(!MessageStatus::Streaming.is_terminal());

        let update = MessageUpdate::append("m1", "a");
        assert!(!update.is_terminal());
        assert!(update.clone().completed().is_terminal());
        assert!(update.with_status(MessageStatus::Error).is_terminal());
    }

    #[test]
    fn test_update_defaults_when_fields_missing() {
        let update: MessageUpdate = serde_json::from_str(r#"{"message_id":"m1"}"#).unwrap();
        assert_eq!(update.content, None);
        assert_eq!(update.content_update_mode, ContentUpdateMode::Append);
        assert!(!update.is_complete);
    }
}
