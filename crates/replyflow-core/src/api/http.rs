use async_trait::async_trait;
use reqwest::multipart;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::debug;

use super::ChatBackend;
use crate::error::{ReplyError, Result};
use crate::models::{
    ConversationSnapshot, MessageSnapshot, SendMessageRequest, SendMessageResponse,
};
use crate::services::CredentialStore;

const MAX_ERROR_BODY: usize = 512;

/// `ChatBackend` over the backend's REST endpoints.
#[derive(Clone)]
pub struct HttpChatBackend {
    client: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialStore>,
}

impl HttpChatBackend {
    pub fn new(base_url: &str, credentials: Arc<dyn CredentialStore>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, credentials)
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: &str,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.credentials.bearer_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.authorize(self.client.get(&url)).send().await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(ReplyError::Unauthorized);
    }
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        return Err(ReplyError::Http {
            status: status.as_u16(),
            message: truncate(&body, MAX_ERROR_BODY),
        });
    }
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

fn multipart_form(request: SendMessageRequest) -> Result<multipart::Form> {
    let mut form = multipart::Form::new()
        .text("message", request.message)
        .text("transport_mode", request.transport_mode.as_str());
    if let Some(conversation_id) = request.conversation_id {
        form = form.text("conversation_id", conversation_id);
    }
    if let Some(file) = request.file {
        let part = multipart::Part::bytes(file.bytes)
            .file_name(file.file_name)
            .mime_str(&file.mime_type)?;
        form = form.part("file", part);
    }
    Ok(form)
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn send_message(&self, request: SendMessageRequest) -> Result<SendMessageResponse> {
        let url = format!("{}/api/chat/messages", self.base_url);
        debug!(
            conversation_id = ?request.conversation_id,
            transport = request.transport_mode.as_str(),
            has_file = request.file.is_some(),
            "Sending chat message"
        );
        let builder = self.authorize(self.client.post(&url));
        let builder = if request.file.is_some() {
            builder.multipart(multipart_form(request)?)
        } else {
            builder.json(&request)
        };
        decode(builder.send().await?).await
    }

    async fn fetch_message(&self, message_id: &str) -> Result<MessageSnapshot> {
        self.get_json(&format!("/api/chat/messages/{}", message_id))
            .await
    }

    async fn fetch_conversation(&self, conversation_id: &str) -> Result<ConversationSnapshot> {
        self.get_json(&format!("/api/conversations/{}", conversation_id))
            .await
    }
}

/// Push channel URL for an HTTP base URL.
pub fn ws_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}{}", rest, path)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}{}", rest, path)
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        format!("{}{}", base, path)
    } else {
        format!("ws://{}{}", base, path)
    }
}
