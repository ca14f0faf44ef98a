//! Cross-thread notification queue.
//!
//! `getaddrinfo` has no portable cancellation, so resolving runs on a
//! short-lived thread that posts its outcome here as a closure and asks the
//! event loop to wake the I/O thread. Only the I/O thread drains the queue;
//! handlers run on it with full access to the connection.

use std::sync::{Arc, Mutex};

use super::Connection;

/// A queued closure to run on the I/O thread.
pub(crate) type NotificationHandler = Box<dyn FnOnce(&mut Connection) + Send>;

/// Wake-up callback invoked from producer threads.
pub(crate) type NotifyRequestFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub(crate) struct NotificationQueue {
    handlers: Mutex<Vec<NotificationHandler>>,
}

impl NotificationQueue {
    /// Append a handler. Called from any thread.
    pub(crate) fn push(&self, handler: NotificationHandler) {
        self.handlers
            .lock()
            .expect("notification queue poisoned")
            .push(handler);
    }

    /// Swap the queue out under the lock; the handlers are run by the
    /// caller after the lock is released.
    pub(crate) fn drain(&self) -> Vec<NotificationHandler> {
        std::mem::take(
            &mut *self
                .handlers
                .lock()
                .expect("notification queue poisoned"),
        )
    }
}
