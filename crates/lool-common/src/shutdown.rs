//! Process-wide shutdown state.
//!
//! Every loop that must observe termination (session readers, queue
//! consumers, the broker pipe poll) holds a clone of one [`ShutdownToken`]
//! injected at startup. The token carries two monotone booleans: whether the
//! process should stop, and whether it is stopping abnormally. Abnormal stop
//! changes the teardown order: sockets are force-closed before joining
//! readers instead of waiting for them to drain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    should_stop: AtomicBool,
    abnormal: AtomicBool,
    notify: Notify,
}

/// Cloneable handle to the process shutdown state.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    inner: Arc<Inner>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a normal stop. Idempotent.
    pub fn request_stop(&self) {
        self.inner.should_stop.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Flags abnormal termination, which implies stopping.
    pub fn flag_abnormal(&self) {
        self.inner.abnormal.store(true, Ordering::SeqCst);
        self.request_stop();
    }

    pub fn should_stop(&self) -> bool {
        self.inner.should_stop.load(Ordering::SeqCst)
    }

    pub fn is_abnormal(&self) -> bool {
        self.inner.abnormal.load(Ordering::SeqCst)
    }

    /// Resolves when a stop has been requested.
    ///
    /// Checks the flag before waiting, so a token that is already stopped
    /// never blocks.
    pub async fn stopped(&self) {
        while !self.should_stop() {
            self.inner.notify.notified().await;
        }
    }
}
