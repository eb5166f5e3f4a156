//! ReplyFlow core - streaming reply delivery for chat clients.
//!
//! Assistant replies reach the client over a push channel
//! ([`ConnectionManager`]) when it is available and through snapshot polling
//! ([`FallbackPoller`]) when it is not. Pushed fragments are coalesced by a
//! debounce buffer and routed by [`MessageDispatcher`] to subscribers, which
//! may be registered under a provisional id the backend later replaces.
//! [`MessageOrchestrator`] ties the pieces together for a single send.

pub mod api;
pub mod channel;
pub mod config;
pub mod error;
pub mod models;
pub mod runtime;
pub mod services;
pub mod subscription;

pub use api::{ChatBackend, HttpChatBackend, ws_url};
pub use channel::{ConnectionConfig, ConnectionManager, ConnectionState, ReconnectPolicy};
pub use config::ReplyflowConfig;
pub use error::{ConnectionError, ReplyError, Result};
pub use runtime::{
    BufferConfig, FallbackPoller, MessageDispatcher, MessageOrchestrator, NullObserver,
    PollerConfig, ReplyHandle, ReplyObserver, SendOutcome, SendPhase, SendRequest,
};
pub use services::{
    AuthFailureHandler, ConversationListRefresher, CredentialStore, NoopServices,
    StaticCredentials,
};
pub use subscription::Subscription;
