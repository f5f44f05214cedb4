//! A cloneable handle for cancelling and awaiting a session's streams.

use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tokio_util::sync::CancellationToken;

/// A cloneable handle for poking a session from external code.
///
/// All fields are `Arc`-wrapped, so cloning is cheap.
#[derive(Clone)]
pub struct SessionHandle {
    pub(crate) cancel: Arc<Mutex<CancellationToken>>,
    /// Token of the most recently spawned pump
    pub(crate) pump: Arc<Mutex<Option<CancellationToken>>>,
    pub(crate) idle_notify: Arc<tokio::sync::Notify>,
    pub(crate) running: Arc<AtomicUsize>,
}

impl SessionHandle {
    pub(crate) fn new() -> Self {
        Self {
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
            pump: Arc::new(Mutex::new(None)),
            idle_notify: Arc::new(tokio::sync::Notify::new()),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Cancel whatever stream is currently being delivered.
    pub fn abort(&self) {
        self.cancel.lock().cancel();
    }

    /// Token for the current stream.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// Install a fresh token for a newly opened stream and return it.
    /// Anything still running under the previous token is cancelled.
    pub(crate) fn renew(&self) -> CancellationToken {
        let mut guard = self.cancel.lock();
        let previous = std::mem::replace(&mut *guard, CancellationToken::new());
        previous.cancel();
        guard.clone()
    }

    /// Token for a pump delivering a stream sent under `parent`.
    ///
    /// Only one pump runs at a time: the pump it replaces is cancelled.
    pub(crate) fn next_pump(&self, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        if let Some(previous) = self.pump.lock().replace(token.clone()) {
            previous.cancel();
        }
        token
    }

    pub(crate) fn pump_started(&self) {
        self.running.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn pump_finished(&self) {
        if self.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle_notify.notify_waiters();
        }
    }

    /// Wait until no stream is being pumped.
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.idle_notify.notified();
            if !self.is_running() {
                return;
            }
            notified.await;
        }
    }

    /// Wait until idle, with a timeout.
    /// Returns `true` if idle was reached, `false` on timeout.
    pub async fn wait_for_idle_timeout(&self, timeout: std::time::Duration) -> bool {
        if !self.is_running() {
            return true;
        }
        tokio::time::timeout(timeout, self.wait_for_idle())
            .await
            .is_ok()
    }

    /// Whether any stream is still being pumped.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) > 0
    }
}
