//! One-shot terminal-state channel shared by a handle and its waiters.

use std::sync::Arc;

use hcslite_shared::HcsliteError;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// A wait channel that resolves exactly once.
///
/// The background waiter resolves it when the object exits; `close` resolves
/// it with `AlreadyClosed` on forced teardown. Whichever comes first wins,
/// and every later waiter observes the same stored value without blocking.
#[derive(Clone)]
pub struct WaitBlock {
    inner: Arc<WaitBlockInner>,
}

struct WaitBlockInner {
    state: Mutex<Option<Option<HcsliteError>>>,
    notify: Notify,
}

impl WaitBlock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(WaitBlockInner {
                state: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Resolve the channel. Returns `false` when it was already resolved, in
    /// which case the stored value is untouched.
    pub fn resolve(&self, terminal: Option<HcsliteError>) -> bool {
        {
            let mut state = self.inner.state.lock();
            if state.is_some() {
                return false;
            }
            *state = Some(terminal);
        }
        self.inner.notify.notify_waiters();
        true
    }

    /// True once the channel has resolved.
    pub fn is_resolved(&self) -> bool {
        self.inner.state.lock().is_some()
    }

    /// The terminal value, if resolved. Non-blocking.
    pub fn peek(&self) -> Option<Option<HcsliteError>> {
        self.inner.state.lock().clone()
    }

    /// Block until the channel resolves; returns the terminal value.
    pub async fn wait(&self) -> Option<HcsliteError> {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(terminal) = self.inner.state.lock().clone() {
                return terminal;
            }
            notified.await;
        }
    }
}

impl Default for WaitBlock {
    fn default() -> Self {
        Self::new()
    }
}
