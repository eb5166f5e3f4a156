//! Unsubscribe tokens returned by every callback registration.

use std::fmt;

/// Handle for a registered callback.
///
/// Dropping the handle does not remove the callback; call [`unsubscribe`]
/// when the subscriber goes away (for example on a conversation switch).
///
/// [`unsubscribe`]: Subscription::unsubscribe
#[must_use = "call unsubscribe() to remove the callback"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Remove the callback. Later updates are no longer delivered to it.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_unsubscribe_runs_cancel_once() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        let subscription = Subscription::new(move || flag.store(true, Ordering::SeqCst));
        assert!(!called.load(Ordering::SeqCst));
        subscription.unsubscribe();
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_drop_keeps_callback() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        drop(Subscription::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(!called.load(Ordering::SeqCst));
    }
}
