//! Error types for reply delivery

use std::time::Duration;
use thiserror::Error;

/// Push channel failures. Cloneable because every caller awaiting a shared
/// connect attempt receives the same result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed abnormally (code {code})")]
    AbnormalClose { code: u16 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Push channel rejected the credential")]
    Unauthorized,

    #[error("Credential cannot be sent as a header")]
    InvalidCredential,

    #[error("Connection closed by client")]
    Closed,

    #[error("Not connected")]
    NotConnected,
}

/// Errors surfaced to callers of the send and poll operations.
#[derive(Error, Debug)]
pub enum ReplyError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Polling timed out after {attempts} attempts")]
    PollTimeout { attempts: u32 },

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ReplyError {
    /// Authentication failures that should send the user back to sign-in.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized | Self::Connection(ConnectionError::Unauthorized)
        )
    }

    /// Errors worth another attempt. The poller retries these and ends the
    /// poll on anything else.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http { status, .. } => *status == 404 || *status == 429 || *status >= 500,
            Self::Request(_) | Self::MessageNotFound(_) | Self::Protocol(_) | Self::Json(_) => true,
            _ => false,
        }
    }
}

/// Result type alias for reply operations
pub type Result<T> = std::result::Result<T, ReplyError>;
