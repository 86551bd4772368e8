//! Broadcast broker for the live change feed.
//!
//! The `Broker` wraps a `tokio::broadcast` channel that carries `Arc<CommittedEvent>`
//! messages. The engine publishes newly committed events while it still holds the
//! log write lock, so every receiver observes events in global commit order. Using
//! `Arc` ensures that events are shared across subscribers without deep-cloning the
//! envelope.
//!
//! Alongside the events the broker keeps a `watch` channel holding the log head
//! (the next unassigned sequence). Subscribers drain their receiver with
//! `try_recv` and wait on the head instead, so the receiver itself is never held
//! across an await and can be released by a cancel at any time.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use crate::types::CommittedEvent;

/// Broadcast broker for pushing newly committed events to live subscribers.
///
/// The `Broker` holds the sending half of a `tokio::broadcast` channel. Each call to
/// [`publish`](Broker::publish) sends the events to all active receivers and then
/// advances the head. Subscribers obtain a receiver via [`subscribe`](Broker::subscribe)
/// and a head watcher via [`watch_head`](Broker::watch_head).
#[derive(Debug)]
pub struct Broker {
    tx: broadcast::Sender<Arc<CommittedEvent>>,
    head: watch::Sender<u64>,
}

impl Broker {
    /// Create a new broker with the given broadcast channel capacity.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of events the channel buffers per receiver before
    ///   that receiver lags. Zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        // Subscribers obtain their own receivers via `subscribe()`.
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        let (head, _) = watch::channel(0);
        Self { tx, head }
    }

    /// Publish committed events to all active subscribers.
    ///
    /// Publishing with no active receivers is normal (nobody is subscribed) and is
    /// only traced.
    pub fn publish(&self, events: &[Arc<CommittedEvent>]) {
        for event in events {
            if self.tx.send(Arc::clone(event)).is_err() {
                tracing::trace!(sequence = event.sequence, "broker publish: no active receivers");
            }
        }
        if let Some(last) = events.last() {
            self.head.send_replace(last.sequence + 1);
        }
    }

    /// Create a new receiver for live events.
    ///
    /// The receiver gets every event published after this call. History is not
    /// replayed; catch-up is handled by the subscription stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<CommittedEvent>> {
        self.tx.subscribe()
    }

    /// Watch the head sequence. It changes after every publish that carried events.
    pub fn watch_head(&self) -> watch::Receiver<u64> {
        self.head.subscribe()
    }

    /// Number of currently registered receivers.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventEnvelope;
    use chrono::Utc;

    fn make_event(event_type: &str, sequence: u64) -> Arc<CommittedEvent> {
        Arc::new(CommittedEvent::new(
            sequence,
            Utc::now(),
            "stream".to_string(),
            EventEnvelope::new(format!("e-{sequence}"), "urn:test", event_type, Utc::now()),
        ))
    }

    #[tokio::test]
    async fn publish_three_events_received_by_subscriber() {
        let broker = Broker::new(16);
        let mut rx = broker.subscribe();

        broker.publish(&[
            make_event("EventA", 0),
            make_event("EventB", 1),
            make_event("EventC", 2),
        ]);

        let a = rx.recv().await.expect("should receive first event");
        let b = rx.recv().await.expect("should receive second event");
        let c = rx.recv().await.expect("should receive third event");

        assert_eq!(a.envelope.event_type, "EventA");
        assert_eq!(b.envelope.event_type, "EventB");
        assert_eq!(c.envelope.event_type, "EventC");
    }

    #[tokio::test]
    async fn multiple_subscribers_share_the_same_allocation() {
        let broker = Broker::new(16);
        let mut rx1 = broker.subscribe();
        let mut rx2 = broker.subscribe();

        broker.publish(&[make_event("Shared", 0)]);

        let arc1 = rx1.recv().await.expect("rx1 should receive");
        let arc2 = rx2.recv().await.expect("rx2 should receive");
        assert!(Arc::ptr_eq(&arc1, &arc2));
    }

    #[tokio::test]
    async fn lagged_subscriber_receives_lagged_error() {
        let broker = Broker::new(2);
        let mut rx = broker.subscribe();

        let events: Vec<_> = (0..5).map(|i| make_event("Overflow", i)).collect();
        broker.publish(&events);

        let mut got_lagged = false;
        for _ in 0..6 {
            match rx.recv().await {
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    got_lagged = true;
                    break;
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        assert!(got_lagged, "expected a Lagged error from the receiver");
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let broker = Broker::new(0);
        let mut rx = broker.subscribe();
        broker.publish(&[make_event("Only", 0)]);
        let event = rx.try_recv().expect("one event fits");
        assert_eq!(event.envelope.event_type, "Only");
    }

    #[tokio::test]
    async fn head_advances_after_publish() {
        let broker = Broker::new(4);
        let mut head = broker.watch_head();
        assert_eq!(*head.borrow_and_update(), 0);

        broker.publish(&[make_event("A", 0), make_event("B", 1)]);
        head.changed().await.expect("broker alive");
        assert_eq!(*head.borrow_and_update(), 2);

        broker.publish(&[]);
        assert!(!head.has_changed().expect("broker alive"));
    }

    #[test]
    fn publish_without_receivers_does_not_panic() {
        let broker = Broker::new(4);
        assert_eq!(broker.receiver_count(), 0);
        broker.publish(&[make_event("Nobody", 0)]);
    }
}
