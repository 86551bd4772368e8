//! The event store protocol.
//!
//! [`EventStore`] is the blocking API over a [`StorageEngine`]: conditional
//! writes with optimistic concurrency, snapshot-consistent stream reads, deletion,
//! in-place updates, cross-stream queries and subscriptions. Every mutating
//! operation runs inside one stream scope, so the version check and the append
//! it gates are indivisible relative to other writers of the same stream.
//!
//! [`EventStore::transaction`] exposes the scope to callers that need several
//! operations on one stream to commit or abort together.

use std::sync::Arc;

use metrics::counter;
use tracing::debug;

use crate::config::{StoreConfig, TimeRepresentation};
use crate::engine::{StagedOp, StorageEngine, StreamScope};
use crate::error::Error;
use crate::filter::Filter;
use crate::memory::MemoryEngine;
use crate::position::{StartAt, SubscriptionPosition};
use crate::query::{self, EventQuery, ReadOptions};
use crate::subscription::{self, Subscription};
use crate::types::{
    CommittedEvent, EventEnvelope, EventStream, ExtensionValue, STREAM_ID_EXTENSION, WriteCondition,
};

/// Versions before and after a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    pub stream_id: String,
    pub old_version: u64,
    pub new_version: u64,
}

/// Check a batch before anything is staged.
fn validate_batch(stream_id: &str, events: &[EventEnvelope]) -> Result<(), Error> {
    if stream_id.is_empty() {
        return Err(Error::InvalidArgument("stream id must not be empty".into()));
    }
    if events.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "cannot write an empty batch to stream {stream_id}"
        )));
    }
    events.iter().try_for_each(EventEnvelope::validate)
}

/// Blocking event store over a storage engine.
///
/// Cloning is cheap; clones share the engine.
#[derive(Clone, Debug)]
pub struct EventStore<E: StorageEngine = MemoryEngine> {
    engine: E,
}

impl EventStore<MemoryEngine> {
    /// An in-memory store with the default configuration.
    pub fn in_memory() -> Self {
        Self::new(MemoryEngine::default())
    }

    /// An in-memory store with `config`.
    pub fn with_config(config: StoreConfig) -> Self {
        Self::new(MemoryEngine::new(config))
    }
}

impl Default for EventStore<MemoryEngine> {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl<E: StorageEngine> EventStore<E> {
    /// A store over `engine`.
    pub fn new(engine: E) -> Self {
        Self { engine }
    }

    /// The underlying storage engine.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn config(&self) -> &StoreConfig {
        self.engine.config()
    }

    /// Append `events` to `stream_id` unconditionally.
    ///
    /// # Errors
    ///
    /// See [`write_conditionally`](EventStore::write_conditionally).
    pub fn write(
        &self,
        stream_id: &str,
        events: impl IntoIterator<Item = EventEnvelope>,
    ) -> Result<WriteResult, Error> {
        self.write_conditionally(stream_id, WriteCondition::Any, events)
    }

    /// Append `events` to `stream_id` if `condition` holds for its current version.
    ///
    /// The events are stamped with the [`STREAM_ID_EXTENSION`] and committed as
    /// one atomic unit in the given order.
    ///
    /// # Arguments
    ///
    /// * `stream_id` - Target stream; created on first write.
    /// * `condition` - Gate on the pre-write version.
    /// * `events` - Non-empty batch.
    ///
    /// # Returns
    ///
    /// The versions before and after the write.
    ///
    /// # Errors
    ///
    /// - [`Error::WriteConditionNotFulfilled`] if the condition does not hold
    /// - [`Error::DuplicateEvent`] if an event collides with a committed identity
    ///   or another event of the batch; nothing is written
    /// - [`Error::InvalidArgument`] for an empty batch, an empty stream id, or an
    ///   event with an empty id, source or type
    pub fn write_conditionally(
        &self,
        stream_id: &str,
        condition: WriteCondition,
        events: impl IntoIterator<Item = EventEnvelope>,
    ) -> Result<WriteResult, Error> {
        let events: Vec<EventEnvelope> = events.into_iter().collect();
        validate_batch(stream_id, &events)?;
        self.transaction(stream_id, move |tx| tx.write_conditionally(condition, events))
    }

    /// Read a whole stream in commit order.
    pub fn read(&self, stream_id: &str) -> EventStream {
        self.read_with(stream_id, ReadOptions::default())
    }

    /// Read a page of a stream.
    ///
    /// The version and the events come from one snapshot, so a concurrent commit
    /// is either fully visible or not at all.
    pub fn read_with(&self, stream_id: &str, options: ReadOptions) -> EventStream {
        let log = self.engine.snapshot();
        query::read_stream(&log, stream_id, &options, self.config().time_representation)
    }

    /// Whether `stream_id` currently holds any event.
    pub fn exists(&self, stream_id: &str) -> bool {
        self.engine.snapshot().exists(stream_id)
    }

    /// Remove every event of `stream_id`. Deleting a missing stream is a no-op.
    pub fn delete_event_stream(&self, stream_id: &str) -> Result<(), Error> {
        let mut scope = self.engine.begin(stream_id);
        scope.stage(StagedOp::DeleteStream);
        scope.commit()?;
        debug!(stream_id, "deleted stream");
        Ok(())
    }

    /// Remove the event identified by `(id, source)` from whichever stream holds it.
    ///
    /// # Returns
    ///
    /// `true` if an event was removed, `false` if none matched.
    pub fn delete_event(&self, id: &str, source: &str) -> Result<bool, Error> {
        let Some((mut scope, target)) = self.pin_event(id, source) else {
            return Ok(false);
        };
        scope.stage(StagedOp::DeleteEvent(target.sequence));
        scope.commit()?;
        debug!(id, source, stream_id = %target.stream_id, "deleted event");
        Ok(true)
    }

    /// Replace the event identified by `(id, source)` with `transform`'s result.
    ///
    /// The event keeps its identity, stream and position. If the transform returns
    /// an envelope equal to the stored one nothing is written. The owning stream
    /// stays locked while `transform` runs, so it must not write to that stream
    /// through the store.
    ///
    /// # Returns
    ///
    /// The stored envelope after the update, or `None` if no event matched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `transform` returns `None`, or changes
    /// the event's id, source or stream.
    pub fn update_event<F>(
        &self,
        id: &str,
        source: &str,
        transform: F,
    ) -> Result<Option<EventEnvelope>, Error>
    where
        F: FnOnce(&EventEnvelope) -> Option<EventEnvelope>,
    {
        let Some((mut scope, current)) = self.pin_event(id, source) else {
            return Ok(None);
        };
        let Some(mut updated) = transform(&current.envelope) else {
            return Err(Error::InvalidArgument(
                "update function is not allowed to return null".into(),
            ));
        };

        if updated.id != current.envelope.id || updated.source != current.envelope.source {
            return Err(Error::InvalidArgument(format!(
                "update function must not change the identity of event {id} (source {source})"
            )));
        }
        match updated.stream_id() {
            Some(owner) if owner != current.stream_id => {
                return Err(Error::InvalidArgument(format!(
                    "update function must not move event {id} out of stream {}",
                    current.stream_id
                )));
            }
            Some(_) => {}
            None => {
                updated.extensions.insert(
                    STREAM_ID_EXTENSION.to_string(),
                    ExtensionValue::String(current.stream_id.clone()),
                );
            }
        }
        if updated == current.envelope {
            return Ok(Some(updated));
        }
        updated.validate()?;

        scope.stage(StagedOp::Replace {
            sequence: current.sequence,
            envelope: updated.clone(),
        });
        scope.commit()?;
        debug!(id, source, stream_id = %current.stream_id, "updated event");
        Ok(Some(updated))
    }

    /// Lazily query events across all streams.
    pub fn query(&self, filter: &Filter, options: ReadOptions) -> EventQuery {
        EventQuery::new(
            self.engine.snapshot(),
            filter,
            &options,
            self.config().time_representation,
        )
    }

    /// Lazily read every event.
    pub fn all(&self, options: ReadOptions) -> EventQuery {
        self.query(&Filter::All, options)
    }

    /// Subscribe to every committed event from `start_at` on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `start_at` holds an unrecognized
    /// string position or a foreign resume token.
    pub fn subscribe(&self, start_at: StartAt) -> Result<Subscription, Error> {
        self.subscribe_filtered(start_at, &Filter::All)
    }

    /// Subscribe to committed events matching `filter`.
    pub fn subscribe_filtered(&self, start_at: StartAt, filter: &Filter) -> Result<Subscription, Error> {
        let subscription = subscription::open(self.engine.clone(), &start_at, filter)?;
        debug!(?start_at, "opened subscription");
        Ok(subscription)
    }

    /// A position for "now", for checkpointing before any event was received.
    ///
    /// The time comes from the engine's commit clock, so it is never earlier than
    /// the latest commit even if the wall clock stepped back.
    pub fn current_position(&self) -> SubscriptionPosition {
        SubscriptionPosition::OperationTime(self.engine.snapshot().next_commit_time())
    }

    /// Run `f` with exclusive access to `stream_id` and commit what it staged.
    ///
    /// Everything staged through the [`StreamTransaction`] commits atomically when
    /// `f` returns `Ok`. When `f` returns `Err`, or the commit finds a duplicate,
    /// nothing is applied. Writes to other streams are not blocked meanwhile.
    ///
    /// # Errors
    ///
    /// Returns `f`'s error, or [`Error::DuplicateEvent`] from the commit.
    pub fn transaction<R, F>(&self, stream_id: &str, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut StreamTransaction<E::Scope>) -> Result<R, Error>,
    {
        let mut tx = StreamTransaction {
            scope: self.engine.begin(stream_id),
            time_representation: self.config().time_representation,
        };
        let value = f(&mut tx)?;
        let outcome = tx.scope.commit().inspect_err(|e| {
            if matches!(e, Error::DuplicateEvent { .. }) {
                counter!("eventfold_duplicate_events_total").increment(1);
            }
        })?;
        if !outcome.appended.is_empty() {
            counter!("eventfold_writes_total").increment(1);
            counter!("eventfold_events_written_total").increment(outcome.appended.len() as u64);
        }
        Ok(value)
    }

    /// Begin a scope on the stream holding `(id, source)`.
    ///
    /// The event is located in a snapshot, its stream is locked, and the event is
    /// located again under the lock; if it moved in between, the lookup repeats.
    fn pin_event(&self, id: &str, source: &str) -> Option<(E::Scope, Arc<CommittedEvent>)> {
        let mut stream_id = self.engine.snapshot().locate(id, source)?.stream_id.clone();
        loop {
            let scope = self.engine.begin(&stream_id);
            let located = scope.snapshot().locate(id, source).cloned()?;
            if located.stream_id == stream_id {
                return Some((scope, located));
            }
            stream_id = located.stream_id.clone();
        }
    }
}

/// Exclusive access to one stream, handed to [`EventStore::transaction`].
///
/// Reads see the committed state as of the latest commit; staged writes become
/// visible after the transaction commits. [`version`](StreamTransaction::version)
/// includes staged writes, so conditional writes inside one transaction chain.
pub struct StreamTransaction<S: StreamScope> {
    scope: S,
    time_representation: TimeRepresentation,
}

impl<S: StreamScope> StreamTransaction<S> {
    /// The stream this transaction holds.
    pub fn stream_id(&self) -> &str {
        self.scope.stream_id()
    }

    /// The stream version including writes staged in this transaction.
    pub fn version(&self) -> u64 {
        self.scope.version()
    }

    /// Read the committed stream.
    pub fn read(&self) -> EventStream {
        self.read_with(ReadOptions::default())
    }

    pub fn read_with(&self, options: ReadOptions) -> EventStream {
        let log = self.scope.snapshot();
        query::read_stream(&log, self.scope.stream_id(), &options, self.time_representation)
    }

    pub fn write(&mut self, events: impl IntoIterator<Item = EventEnvelope>) -> Result<WriteResult, Error> {
        self.write_conditionally(WriteCondition::Any, events)
    }

    /// Stage `events` if `condition` holds for [`version`](StreamTransaction::version).
    ///
    /// Duplicate identities are detected when the transaction commits.
    pub fn write_conditionally(
        &mut self,
        condition: WriteCondition,
        events: impl IntoIterator<Item = EventEnvelope>,
    ) -> Result<WriteResult, Error> {
        let events: Vec<EventEnvelope> = events.into_iter().collect();
        validate_batch(self.scope.stream_id(), &events)?;

        let old_version = self.scope.version();
        condition.check(old_version).inspect_err(|_| {
            counter!("eventfold_write_condition_failures_total").increment(1);
        })?;

        let new_version = old_version + events.len() as u64;
        self.scope.stage(StagedOp::Append(events));
        Ok(WriteResult {
            stream_id: self.scope.stream_id().to_string(),
            old_version,
            new_version,
        })
    }

    /// Stage removal of every event in the stream, including ones staged earlier.
    pub fn delete_stream(&mut self) {
        self.scope.stage(StagedOp::DeleteStream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{and, gte, lt, ne};
    use chrono::{TimeZone, Utc};

    fn event(id: &str, event_type: &str) -> EventEnvelope {
        EventEnvelope::new(id, "urn:names", event_type, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("valid"))
    }

    #[test]
    fn versions_sum_batch_sizes() {
        let store = EventStore::in_memory();
        let r1 = store.write("s", [event("a", "T"), event("b", "T")]).expect("write");
        let r2 = store.write("s", [event("c", "T")]).expect("write");
        assert_eq!((r1.old_version, r1.new_version), (0, 2));
        assert_eq!((r2.old_version, r2.new_version), (2, 3));
        assert_eq!(store.read("s").version, 3);
    }

    #[test]
    fn written_events_carry_stream_id() {
        let store = EventStore::in_memory();
        store
            .write("name", [event("a", "T").with_extension(STREAM_ID_EXTENSION, "forged")])
            .expect("write");
        let stream = store.read("name");
        assert_eq!(stream.events[0].stream_id(), Some("name"));
    }

    #[test]
    fn condition_failure_leaves_stream_untouched() {
        let store = EventStore::in_memory();
        store.write("s", [event("a", "T")]).expect("write");

        let err = store
            .write_conditionally("s", WriteCondition::stream_version_eq(10), [event("b", "T")])
            .expect_err("version is 1");
        assert_eq!(
            err.to_string(),
            "WriteCondition was not fulfilled. Expected version to be equal to 10 but was 1."
        );

        let err = store
            .write_conditionally(
                "s",
                WriteCondition::stream_version(and([gte(0), lt(100), ne(1)])),
                [event("b", "T")],
            )
            .expect_err("ne(1) fails");
        assert!(matches!(err, Error::WriteConditionNotFulfilled { actual: 1, .. }));
        assert_eq!(store.read("s").version, 1);
    }

    #[test]
    fn invalid_batches_are_rejected_before_locking() {
        let store = EventStore::in_memory();
        assert!(matches!(store.write("s", Vec::new()), Err(Error::InvalidArgument(_))));
        assert!(matches!(store.write("", [event("a", "T")]), Err(Error::InvalidArgument(_))));
        assert!(matches!(store.write("s", [event("", "T")]), Err(Error::InvalidArgument(_))));
        assert!(!store.exists("s"));
    }

    #[test]
    fn delete_event_and_stream() {
        let store = EventStore::in_memory();
        store.write("s", [event("a", "T"), event("b", "T"), event("c", "T")]).expect("write");

        assert!(store.delete_event("b", "urn:names").expect("delete"));
        assert!(!store.delete_event("b", "urn:names").expect("already gone"));
        let stream = store.read("s");
        assert_eq!(stream.version, 2);
        assert_eq!(stream.events.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), ["a", "c"]);

        store.delete_event_stream("s").expect("delete stream");
        assert_eq!(store.read("s").version, 0);
        assert!(!store.exists("s"));
        store.delete_event_stream("s").expect("deleting again is a no-op");
    }

    #[test]
    fn update_event_rules() {
        let store = EventStore::in_memory();
        store.write("s", [event("a", "T")]).expect("write");

        assert_eq!(store.update_event("missing", "urn:names", |e| Some(e.clone())).expect("ok"), None);

        let err = store.update_event("a", "urn:names", |_| None).expect_err("null");
        assert_eq!(
            err.to_string(),
            "invalid argument: update function is not allowed to return null"
        );

        let err = store
            .update_event("a", "urn:names", |e| Some(e.clone().with_extension(STREAM_ID_EXTENSION, "other")))
            .expect_err("cannot move");
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = store
            .update_event("a", "urn:names", |e| {
                let mut moved = e.clone();
                moved.id = "b".into();
                Some(moved)
            })
            .expect_err("cannot rename");
        assert!(matches!(err, Error::InvalidArgument(_)));

        let updated = store
            .update_event("a", "urn:names", |e| {
                let mut changed = e.clone().with_subject("renamed");
                changed.extensions.clear();
                Some(changed)
            })
            .expect("update")
            .expect("found");
        assert_eq!(updated.subject, "renamed");
        assert_eq!(updated.stream_id(), Some("s"));
        assert_eq!(store.read("s").events, vec![updated]);
    }

    #[test]
    fn transaction_commits_everything_or_nothing() {
        let store = EventStore::in_memory();
        store.write("s", [event("a", "T")]).expect("write");

        let result: Result<(), Error> = store.transaction("s", |tx| {
            tx.write([event("b", "T")])?;
            Err(Error::InvalidArgument("changed my mind".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.read("s").version, 1);

        let version = store
            .transaction("s", |tx| {
                assert_eq!(tx.read().version, 1);
                tx.write_conditionally(WriteCondition::stream_version_eq(1), [event("b", "T")])?;
                tx.write_conditionally(WriteCondition::stream_version_eq(2), [event("c", "T")])?;
                Ok(tx.version())
            })
            .expect("commit");
        assert_eq!(version, 3);
        assert_eq!(store.read("s").version, 3);
    }

    #[test]
    fn transaction_duplicate_aborts_all_staged_writes() {
        let store = EventStore::in_memory();
        store.write("s", [event("a", "T")]).expect("write");
        let err = store
            .transaction("s", |tx| {
                tx.write([event("b", "T")])?;
                tx.write([event("a", "T")])
            })
            .expect_err("duplicate at commit");
        assert!(matches!(err, Error::DuplicateEvent { .. }));
        assert_eq!(store.read("s").version, 1);
    }

    #[test]
    fn transaction_can_replace_a_stream() {
        let store = EventStore::in_memory();
        store.write("s", [event("a", "T"), event("b", "T")]).expect("write");
        store
            .transaction("s", |tx| {
                tx.delete_stream();
                tx.write_conditionally(WriteCondition::stream_version_eq(0), [event("a", "Snapshot")])
            })
            .expect("commit");
        let stream = store.read("s");
        assert_eq!(stream.version, 1);
        assert_eq!(stream.events[0].event_type, "Snapshot");
    }

    #[test]
    fn current_position_is_an_operation_time() {
        let store = EventStore::in_memory();
        assert!(matches!(store.current_position(), SubscriptionPosition::OperationTime(_)));
    }

    #[test]
    fn current_position_never_precedes_the_last_commit() {
        let store = EventStore::in_memory();
        store.write("s", [event("a", "T")]).expect("write");
        let last = store
            .engine()
            .snapshot()
            .last_committed_at()
            .expect("something was committed");
        let SubscriptionPosition::OperationTime(time) = store.current_position() else {
            panic!("expected an operation time");
        };
        assert!(time >= last);
    }

    #[test]
    fn zero_broker_capacity_still_opens_a_store() {
        let store = EventStore::with_config(StoreConfig::default().with_broker_capacity(0));
        let mut sub = store.subscribe(StartAt::Now).expect("subscribe").into_blocking();
        store.write("s", [event("a", "T")]).expect("write");
        let received = sub.next().expect("open").expect("event");
        assert_eq!(received.event.id, "a");
    }
}
