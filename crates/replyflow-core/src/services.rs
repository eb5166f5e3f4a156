//! Narrow interfaces to collaborators owned by the host application.

use parking_lot::RwLock;

/// Source of the bearer token used for the push channel and HTTP calls.
pub trait CredentialStore: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// Triggered when a send created a new conversation.
pub trait ConversationListRefresher: Send + Sync {
    fn refresh_conversations(&self);
}

/// Invoked when the backend rejects the credential, typically to send the
/// user back to sign-in.
pub trait AuthFailureHandler: Send + Sync {
    fn on_auth_failure(&self);
}

/// In-memory credential, replaceable at runtime.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    token: RwLock<Option<String>>,
}

impl StaticCredentials {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token.filter(|token| !token.is_empty())),
        }
    }

    pub fn set(&self, token: Option<String>) {
        *self.token.write() = token;
    }
}

impl CredentialStore for StaticCredentials {
    fn bearer_token(&self) -> Option<String> {
        self.token.read().clone()
    }
}

/// Collaborator that ignores every call.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopServices;

impl ConversationListRefresher for NoopServices {
    fn refresh_conversations(&self) {}
}

impl AuthFailureHandler for NoopServices {
    fn on_auth_failure(&self) {}
}
