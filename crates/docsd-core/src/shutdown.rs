//! Cooperative cancellation shared by every long-running task.
//!
//! Every subsystem task (bus subscriber loops, the debouncer, the repo
//! updater, queue workers) accepts a [`ShutdownSignal`] instead of a raw
//! context object; `Daemon::stop` flips the paired [`ShutdownHandle`] once
//! and every task observes it on its next `select!` iteration.

use tokio::sync::watch;

/// Held by the daemon (or a test harness); flips every paired signal.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

/// Held by a task; observes cancellation without owning the decision.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownHandle {
    pub fn new() -> (Self, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, ShutdownSignal { rx })
    }

    /// Signal cancellation to every derived [`ShutdownSignal`].
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// A fresh signal derived from this handle.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new().0
    }
}

impl ShutdownSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation has been signalled.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                // Handle dropped without cancelling; treat as cancelled so
                // tasks don't spin forever against a channel nobody owns.
                return;
            }
        }
    }
}
