//! Livereload broadcast hub (§4.8.6.f).
//!
//! The websocket transport itself is out of scope for this core — the only
//! contract it owns is "broadcast the final `doc_files_hash` to whatever is
//! listening." [`BroadcastLiveReloadHub`] is a minimal in-process
//! implementation a future HTTP/websocket adapter can subscribe to.

use async_trait::async_trait;
use tokio::sync::broadcast;

#[async_trait]
pub trait LiveReloadHub: Send + Sync {
    async fn broadcast(&self, doc_files_hash: &str);
}

/// Broadcasts over a bounded `tokio::sync::broadcast` channel. Slow or
/// absent subscribers never block a build: a full channel just drops the
/// oldest unread message, which is fine since only the latest hash matters.
pub struct BroadcastLiveReloadHub {
    tx: broadcast::Sender<String>,
}

impl BroadcastLiveReloadHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastLiveReloadHub {
    fn default() -> Self {
        Self::new(16)
    }
}

#[async_trait]
impl LiveReloadHub for BroadcastLiveReloadHub {
    async fn broadcast(&self, doc_files_hash: &str) {
        // No subscribers is the common case between page loads; the error
        // just means nobody is listening right now.
        let _ = self.tx.send(doc_files_hash.to_string());
    }
}
