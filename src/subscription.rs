//! Catch-up and live subscriptions over the change feed.
//!
//! A subscription registers its feed receiver **before** reading any history, then
//! replays committed events from its start sequence in batches taken from
//! successive snapshots. Once a batch reaches the head of the log it switches to
//! the live feed, dropping events the catch-up already delivered. If the live
//! receiver lags behind the feed, the subscription logs a warning and catches up
//! from the log again, so no event is lost.
//!
//! The feed receiver sits in a slot shared with the [`CancelHandle`]. The stream
//! only borrows it to drain pending events with `try_recv` and waits on the log
//! head otherwise, so cancelling takes the receiver out of the slot and drops it
//! on the spot, whether or not anyone is polling the subscription.
//!
//! Every delivered event carries a [`SubscriptionPosition::ResumeToken`]; resuming
//! from it yields the events strictly after that one.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_stream::stream;
use futures::StreamExt;
use futures_core::Stream;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::watch;
use tracing::warn;

use crate::engine::StorageEngine;
use crate::error::Error;
use crate::filter::Filter;
use crate::position::{self, ResumeToken, StartAt, SubscriptionPosition};
use crate::query::CompiledFilter;
use crate::types::{CommittedEvent, PositionedEvent};

type FeedSlot = Arc<Mutex<Option<broadcast::Receiver<Arc<CommittedEvent>>>>>;

/// Stops a subscription from any thread.
///
/// Cancelling ends the stream: a pending `next()` resolves to `None` and no
/// further events are delivered. The change-feed receiver is released before
/// `cancel` returns.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
    feed: FeedSlot,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
        self.release_feed();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    fn release_feed(&self) {
        let receiver = self.feed.lock().take();
        drop(receiver);
    }
}

type EventStream = Pin<Box<dyn Stream<Item = Result<PositionedEvent, Error>> + Send>>;

/// An open subscription, consumed as a `Stream` of positioned events.
///
/// Dropping the subscription releases its feed receiver, even while clones of its
/// [`CancelHandle`] are still around.
pub struct Subscription {
    stream: EventStream,
    cancel: CancelHandle,
}

impl Subscription {
    /// A handle that cancels this subscription from elsewhere.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Consume the subscription from synchronous code.
    pub fn into_blocking(self) -> BlockingSubscription {
        BlockingSubscription { inner: self }
    }
}

impl Stream for Subscription {
    type Item = Result<PositionedEvent, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.as_mut().poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.release_feed();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// A [`Subscription`] consumed as a blocking iterator.
///
/// `next()` parks the calling thread until an event arrives or the subscription is
/// cancelled. Do not call it from inside an async runtime worker.
#[derive(Debug)]
pub struct BlockingSubscription {
    inner: Subscription,
}

impl BlockingSubscription {
    pub fn cancel_handle(&self) -> CancelHandle {
        self.inner.cancel_handle()
    }
}

impl Iterator for BlockingSubscription {
    type Item = Result<PositionedEvent, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        futures::executor::block_on(self.inner.next())
    }
}

fn positioned(event: &CommittedEvent) -> PositionedEvent {
    PositionedEvent {
        event: event.envelope.clone(),
        position: SubscriptionPosition::ResumeToken(ResumeToken::for_sequence(event.sequence)),
    }
}

/// Resolve where a subscription starts, as a sequence number.
fn start_sequence<E: StorageEngine>(engine: &E, start_at: &StartAt) -> Result<u64, Error> {
    let head = engine.snapshot().next_sequence();
    position::apply_start_position(
        head,
        start_at,
        |_, token| Ok(token.sequence()?.saturating_add(1)),
        |_, time| Ok(engine.snapshot().first_sequence_committed_since(time)),
    )
}

/// Decrements the active-subscription gauge when the stream is dropped.
struct ActiveGauge;

impl ActiveGauge {
    fn register() -> Self {
        metrics::gauge!("eventfold_subscriptions_active").increment(1.0);
        ActiveGauge
    }
}

impl Drop for ActiveGauge {
    fn drop(&mut self) {
        metrics::gauge!("eventfold_subscriptions_active").decrement(1.0);
    }
}

/// Open a subscription on `engine`.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] if `start_at` holds a string position that is
/// not recognized, or a resume token that was not minted by this store.
pub(crate) fn open<E: StorageEngine>(
    engine: E,
    start_at: &StartAt,
    filter: &Filter,
) -> Result<Subscription, Error> {
    // Register on the feed BEFORE reading history.
    let mut head = engine.watch_head();
    let feed: FeedSlot = Arc::new(Mutex::new(Some(engine.feed())));
    let mut cursor = start_sequence(&engine, start_at)?;
    let filter = CompiledFilter::compile(filter, engine.config().time_representation);
    let batch_size = engine.config().catchup_batch_size.max(1);

    let (tx, mut cancelled) = watch::channel(false);
    let cancel = CancelHandle {
        tx: Arc::new(tx),
        feed: Arc::clone(&feed),
    };

    let stream = stream! {
        let _gauge = ActiveGauge::register();

        'feed: loop {
            // Catch-up phase: replay the log from the cursor to its current head.
            loop {
                if *cancelled.borrow() {
                    return;
                }
                let log = engine.snapshot();
                let (batch, next) = log.scan_from(cursor, batch_size);
                let at_head = next >= log.next_sequence();
                drop(log);

                for event in batch {
                    if *cancelled.borrow() {
                        return;
                    }
                    cursor = event.sequence + 1;
                    if filter.matches(&event) {
                        yield Ok(positioned(&event));
                    }
                }
                cursor = cursor.max(next);
                if at_head {
                    break;
                }
            }

            // Live phase: drain the feed, skipping what catch-up delivered, then wait
            // for the head to move.
            loop {
                head.borrow_and_update();
                loop {
                    if *cancelled.borrow() {
                        return;
                    }
                    let received = feed.lock().as_mut().map(|rx| rx.try_recv());
                    let Some(received) = received else {
                        return;
                    };
                    match received {
                        Ok(event) => {
                            if event.sequence < cursor {
                                continue;
                            }
                            cursor = event.sequence + 1;
                            if filter.matches(&event) {
                                yield Ok(positioned(&event));
                            }
                        }
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Lagged(skipped)) => {
                            warn!(skipped, cursor, "subscription lagged behind the change feed, catching up from the log");
                            continue 'feed;
                        }
                        Err(TryRecvError::Closed) => {
                            return;
                        }
                    }
                }

                let moved = tokio::select! {
                    biased;
                    _ = cancelled.changed() => false,
                    changed = head.changed() => changed.is_ok(),
                };
                if !moved {
                    return;
                }
            }
        }
    };

    Ok(Subscription {
        stream: Box::pin(stream),
        cancel,
    })
}
