//! Wire formats for the backend HTTP API and the push channel.

use serde::{Deserialize, Deserializer, Serialize};

use super::message::{ContentUpdateMode, MessageStatus, MessageUpdate};
use crate::error::{ReplyError, Result};

/// Heartbeat frame the client writes on the push channel.
pub const HEARTBEAT_FRAME: &str = r#"{"type":"ping"}"#;

/// Delivery path chosen for a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportMode {
    #[serde(rename = "websocket")]
    WebSocket,
    #[serde(rename = "polling")]
    Polling,
}

impl TransportMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
            Self::Polling => "polling",
        }
    }
}

/// File uploaded alongside a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Body of the outbound send request.
#[derive(Debug, Clone, Serialize)]
pub struct SendMessageRequest {
    pub message: String,
    pub conversation_id: Option<String>,
    pub transport_mode: TransportMode,
    #[serde(skip)]
    pub file: Option<Attachment>,
}

/// Backend acknowledgement of a send. Content never arrives here.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SendMessageResponse {
    pub conversation_id: String,
    pub message_id: String,
    #[serde(default)]
    pub status: MessageStatus,
}

/// Full state of one message as returned by the snapshot endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageSnapshot {
    #[serde(alias = "message_id")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: MessageStatus,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Queued messages may report `"content": null`.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Whole-conversation payload used when the per-message endpoint fails.
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationSnapshot {
    #[serde(alias = "conversation_id")]
    pub id: String,
    #[serde(default)]
    pub messages: Vec<MessageSnapshot>,
}

impl ConversationSnapshot {
    pub fn find_message(&self, message_id: &str) -> Option<&MessageSnapshot> {
        self.messages.iter().find(|message| message.id == message_id)
    }
}

/// `message_update` frame body.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageUpdateFrame {
    pub message_id: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub content_update_mode: Option<ContentUpdateMode>,
    #[serde(default)]
    pub status: Option<MessageStatus>,
    #[serde(default)]
    pub is_complete: Option<bool>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl From<MessageUpdateFrame> for MessageUpdate {
    fn from(frame: MessageUpdateFrame) -> Self {
        Self {
            message_id: frame.message_id,
            content: frame.content,
            content_update_mode: frame.content_update_mode.unwrap_or_default(),
            status: frame.status,
            is_complete: frame.is_complete.unwrap_or(false),
            conversation_id: frame.conversation_id,
            error: frame.error,
        }
    }
}

/// Frames the server pushes. Types other than `message_update` (pong,
/// presence, ...) are accepted and ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    MessageUpdate(MessageUpdateFrame),
    #[serde(other)]
    Unknown,
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|err| ReplyError::Protocol(err.to_string()))
    }
}
