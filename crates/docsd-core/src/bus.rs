//! Typed, in-process, process-scoped publish/subscribe.
//!
//! Each event kind gets its own [`EventBus<T>`] rather than one bus keyed by
//! a string topic: the daemon wires a handful of these together (one per
//! row in the event taxonomy) instead of routing through a single dynamic
//! dispatch point. `subscribe` hands back both the receive endpoint and an
//! [`Unsubscribe`] handle; either dropping the receiver or dropping the
//! handle detaches the subscriber with no leaked task or buffer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;

/// A single subscriber's send half, paired with the id used to find it
/// again for removal.
struct Subscriber<T> {
    id: u64,
    sender: mpsc::Sender<T>,
}

struct Inner<T> {
    subscribers: Mutex<Vec<Subscriber<T>>>,
    next_id: AtomicU64,
    closed: std::sync::atomic::AtomicBool,
}

/// A typed publish/subscribe channel for one event kind.
pub struct EventBus<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Dropping this detaches the subscriber immediately, even if the paired
/// `Receiver` is still held elsewhere.
pub struct Unsubscribe<T> {
    id: u64,
    bus: Weak<Inner<T>>,
}

impl<T> Drop for Unsubscribe<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner
                .subscribers
                .lock()
                .expect("event bus mutex poisoned")
                .retain(|s| s.id != self.id);
        }
    }
}

/// Returned by [`EventBus::publish`]: per-subscriber outcome of one publish.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub delivered: usize,
    /// Subscriber ids whose buffer was full; they did not receive this event.
    pub overflowed: Vec<u64>,
}

/// The bus has been closed; no further publishes are delivered.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("event bus is closed")]
pub struct BusClosed;

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                closed: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    /// Register a new subscriber with the given bounded buffer capacity.
    pub fn subscribe(&self, capacity: usize) -> (mpsc::Receiver<T>, Unsubscribe<T>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .subscribers
            .lock()
            .expect("event bus mutex poisoned")
            .push(Subscriber { id, sender: tx });
        (
            rx,
            Unsubscribe {
                id,
                bus: Arc::downgrade(&self.inner),
            },
        )
    }

    /// Number of subscribers currently attached (receiver not yet dropped).
    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.inner.subscribers.lock().expect("event bus mutex poisoned");
        subs.retain(|s| !s.sender.is_closed());
        subs.len()
    }

    /// Publish non-blockingly to every subscriber. A full buffer on one
    /// subscriber is recorded in [`PublishOutcome::overflowed`] but does not
    /// stop delivery to the others.
    pub fn publish(&self, event: T) -> Result<PublishOutcome, BusClosed> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusClosed);
        }
        let mut subs = self.inner.subscribers.lock().expect("event bus mutex poisoned");
        let mut outcome = PublishOutcome::default();
        subs.retain_mut(|sub| match sub.sender.try_send(event.clone()) {
            Ok(()) => {
                outcome.delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                outcome.overflowed.push(sub.id);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        Ok(outcome)
    }

    /// Close the bus: drop every subscriber endpoint and reject further
    /// publishes.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner
            .subscribers
            .lock()
            .expect("event bus mutex poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_all_subscribers_in_order() {
        let bus: EventBus<u32> = EventBus::new();
        let (mut rx1, _h1) = bus.subscribe(4);
        let (mut rx2, _h2) = bus.subscribe(4);

        bus.publish(1).unwrap();
        bus.publish(2).unwrap();

        assert_eq!(rx1.recv().await, Some(1));
        assert_eq!(rx1.recv().await, Some(2));
        assert_eq!(rx2.recv().await, Some(1));
        assert_eq!(rx2.recv().await, Some(2));
    }

    #[tokio::test]
    async fn full_buffer_overflows_only_that_subscriber() {
        let bus: EventBus<u32> = EventBus::new();
        let (mut rx_slow, _h1) = bus.subscribe(1);
        let (mut rx_fast, _h2) = bus.subscribe(4);

        bus.publish(1).unwrap();
        let outcome = bus.publish(2).unwrap();
        assert_eq!(outcome.overflowed, vec![1]);
        assert_eq!(outcome.delivered, 1);

        assert_eq!(rx_slow.recv().await, Some(1));
        assert_eq!(rx_fast.recv().await, Some(1));
        assert_eq!(rx_fast.recv().await, Some(2));
    }

    #[tokio::test]
    async fn dropping_unsubscribe_handle_detaches_immediately() {
        let bus: EventBus<u32> = EventBus::new();
        let (_rx, handle) = bus.subscribe(4);
        assert_eq!(bus.subscriber_count(), 1);
        drop(handle);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn dropping_receiver_detaches_on_next_count_or_publish() {
        let bus: EventBus<u32> = EventBus::new();
        let (rx, _handle) = bus.subscribe(4);
        drop(rx);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn close_rejects_further_publishes() {
        let bus: EventBus<u32> = EventBus::new();
        let (_rx, _handle) = bus.subscribe(4);
        bus.close();
        assert_eq!(bus.publish(1), Err(BusClosed));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
