//! Shutdown signalling shared by all long-running tasks
//!
//! A watch channel wrapped in a pair of handles: the owner triggers once,
//! every task holding a watcher observes it. Watchers are cheap to clone
//! and safe to poll from `select!` loops.

use tokio::sync::watch;

/// Create a linked trigger/watcher pair.
pub fn channel() -> (ShutdownTrigger, ShutdownWatch) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownWatch { rx })
}

/// Owning half; signalling is idempotent.
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Signal shutdown to every watcher.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    /// Create an additional watcher bound to this trigger.
    pub fn watch(&self) -> ShutdownWatch {
        ShutdownWatch {
            rx: self.tx.subscribe(),
        }
    }
}

/// Cloneable observer half.
#[derive(Clone)]
pub struct ShutdownWatch {
    rx: watch::Receiver<bool>,
}

impl ShutdownWatch {
    /// True once shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when shutdown is triggered. Resolves immediately if it
    /// already was.
    pub async fn triggered(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        // The sender dropping counts as shutdown too.
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
    }

    /// A watcher permanently detached from any trigger; never fires.
    /// Useful for callers that do not manage shutdown.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        ShutdownWatch { rx }
    }
}

// ============================================================================
// TESTS
// ============================================================================
