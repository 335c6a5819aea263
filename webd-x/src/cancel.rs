//! Per-connection cancellation signal.
//!
//! One `Cancellation` is created per accepted connection and doubles as the
//! logical context for every request served on it: disconnect cancels it,
//! and any in-flight handler can observe that through its request.

use std::sync::Arc;
use tokio::sync::watch;

/// A clonable, one-way done signal.
///
/// Cancelling is idempotent; all clones observe the same state.
#[derive(Clone)]
pub struct Cancellation {
    tx: Arc<watch::Sender<bool>>,
}

impl Cancellation {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fires the signal. Subsequent calls are no-ops.
    pub fn cancel(&self) {
        // send_if_modified avoids waking watchers on repeat cancels.
        self.tx.send_if_modified(|cancelled| {
            if *cancelled {
                false
            } else {
                *cancelled = true;
                true
            }
        });
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal has fired. Returns immediately if it
    /// already has.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        if *rx.borrow() {
            return;
        }
        // The sender lives in self, so changed() can only fail after this
        // clone is dropped.
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Cancellation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cancellation")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
