//! Backend chat API.

mod http;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    ConversationSnapshot, MessageSnapshot, SendMessageRequest, SendMessageResponse,
};

pub use http::{HttpChatBackend, ws_url};

/// Request/response surface of the chat backend.
///
/// Content never arrives through `send_message`; it is delivered out of band
/// over the push channel or observed through the snapshot endpoints.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Submit a user message. The response carries the ids the backend
    /// assigned.
    async fn send_message(&self, request: SendMessageRequest) -> Result<SendMessageResponse>;

    /// Per-message snapshot.
    async fn fetch_message(&self, message_id: &str) -> Result<MessageSnapshot>;

    /// Whole conversation, used when the per-message endpoint fails.
    async fn fetch_conversation(&self, conversation_id: &str) -> Result<ConversationSnapshot>;
}
