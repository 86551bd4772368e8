//! In-memory storage engine.
//!
//! The whole log lives behind a single `RwLock<Arc<EventLog>>`. Readers clone the
//! `Arc` and work on an immutable snapshot; commits copy-on-write through
//! `Arc::make_mut`, so a snapshot held by a query or a catching-up subscription is
//! never mutated underneath it.
//!
//! Writers to one stream are serialized by a per-stream mutex that a
//! [`MemoryScope`] holds for its whole lifetime. The log write lock is only taken
//! for the short validate-and-apply section of a commit, during which the newly
//! committed events are also published to the change feed. That keeps the feed in
//! exact sequence order.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};
use tokio::sync::{broadcast, watch};

use crate::broker::Broker;
use crate::config::{IdentityScope, StoreConfig};
use crate::engine::{CommitOutcome, StagedOp, StorageEngine, StreamScope};
use crate::error::Error;
use crate::types::{CommittedEvent, EventEnvelope, ExtensionValue, STREAM_ID_EXTENSION};

/// An immutable view of the global log.
///
/// Entries are indexed by sequence number. A deleted event leaves a tombstone, so
/// sequence numbers are never reused and positions stay valid across deletions.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    entries: Vec<Option<Arc<CommittedEvent>>>,
    /// Live sequences of each stream, in commit order.
    streams: HashMap<String, Vec<u64>>,
    /// `(stream id, event id)` to sequence.
    stream_identities: HashMap<(String, String), u64>,
    /// `(source, event id)` to every live sequence carrying it.
    source_identities: HashMap<(String, String), BTreeSet<u64>>,
    live: usize,
    last_committed_at: Option<DateTime<Utc>>,
}

impl EventLog {
    /// The sequence number the next committed event will get.
    pub fn next_sequence(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Number of live events across all streams.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Number of live events in `stream_id`.
    pub fn version(&self, stream_id: &str) -> u64 {
        self.streams.get(stream_id).map_or(0, |s| s.len() as u64)
    }

    pub fn exists(&self, stream_id: &str) -> bool {
        self.version(stream_id) > 0
    }

    /// The live event at `sequence`, if it has not been deleted.
    pub fn get(&self, sequence: u64) -> Option<&Arc<CommittedEvent>> {
        usize::try_from(sequence)
            .ok()
            .and_then(|i| self.entries.get(i))
            .and_then(Option::as_ref)
    }

    /// Live events of `stream_id` in commit order.
    pub fn stream_events<'a>(
        &'a self,
        stream_id: &str,
    ) -> impl DoubleEndedIterator<Item = &'a Arc<CommittedEvent>> + use<'a> {
        self.streams
            .get(stream_id)
            .into_iter()
            .flatten()
            .filter_map(|&seq| self.get(seq))
    }

    /// Every live event in commit order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Arc<CommittedEvent>> {
        self.entries.iter().filter_map(Option::as_ref)
    }

    /// Find the event identified by `(id, source)`.
    ///
    /// When several streams carry the same `(source, id)` (possible only with
    /// [`IdentityScope::Stream`]) the earliest committed one wins.
    pub fn locate(&self, id: &str, source: &str) -> Option<&Arc<CommittedEvent>> {
        self.source_identities
            .get(&(source.to_string(), id.to_string()))
            .and_then(|seqs| seqs.first())
            .and_then(|&seq| self.get(seq))
    }

    /// Collect up to `max` live events with a sequence of at least `from`.
    ///
    /// Returns the events and the sequence to continue scanning from. The scan
    /// reached the head of the log when the returned sequence equals
    /// [`next_sequence`](EventLog::next_sequence).
    pub fn scan_from(&self, from: u64, max: usize) -> (Vec<Arc<CommittedEvent>>, u64) {
        let mut batch = Vec::with_capacity(max.min(self.live));
        let mut cursor = from;
        let head = self.next_sequence();
        while cursor < head && batch.len() < max {
            if let Some(event) = self.get(cursor) {
                batch.push(Arc::clone(event));
            }
            cursor += 1;
        }
        (batch, cursor)
    }

    /// The first sequence whose commit time is at or after `time`.
    ///
    /// Commit times are non-decreasing in sequence order, so this is a binary search.
    /// Returns [`next_sequence`](EventLog::next_sequence) if nothing qualifies.
    pub fn first_sequence_committed_since(&self, time: DateTime<Utc>) -> u64 {
        // Tombstones carry no timestamp.
        let live: Vec<&Arc<CommittedEvent>> = self.iter().collect();
        let idx = live.partition_point(|e| e.committed_at < time);
        live.get(idx).map_or(self.next_sequence(), |e| e.sequence)
    }

    fn append(&mut self, stream_id: &str, mut envelope: EventEnvelope, committed_at: DateTime<Utc>) -> Arc<CommittedEvent> {
        envelope.extensions.insert(
            STREAM_ID_EXTENSION.to_string(),
            ExtensionValue::String(stream_id.to_string()),
        );
        let sequence = self.next_sequence();
        self.stream_identities
            .insert((stream_id.to_string(), envelope.id.clone()), sequence);
        self.source_identities
            .entry((envelope.source.clone(), envelope.id.clone()))
            .or_default()
            .insert(sequence);
        self.streams
            .entry(stream_id.to_string())
            .or_default()
            .push(sequence);

        let event = Arc::new(CommittedEvent::new(
            sequence,
            committed_at,
            stream_id.to_string(),
            envelope,
        ));
        self.entries.push(Some(Arc::clone(&event)));
        self.live += 1;
        self.last_committed_at = Some(committed_at);
        event
    }

    fn remove(&mut self, sequence: u64) {
        let Some(slot) = usize::try_from(sequence).ok().and_then(|i| self.entries.get_mut(i)) else {
            return;
        };
        let Some(event) = slot.take() else {
            return;
        };
        let stream_key = (event.stream_id.clone(), event.envelope.id.clone());
        if self.stream_identities.get(&stream_key) == Some(&sequence) {
            self.stream_identities.remove(&stream_key);
        }
        let source_key = (event.envelope.source.clone(), event.envelope.id.clone());
        if let Some(seqs) = self.source_identities.get_mut(&source_key) {
            seqs.remove(&sequence);
            if seqs.is_empty() {
                self.source_identities.remove(&source_key);
            }
        }
        if let Some(seqs) = self.streams.get_mut(&event.stream_id) {
            seqs.retain(|&s| s != sequence);
            if seqs.is_empty() {
                self.streams.remove(&event.stream_id);
            }
        }
        self.live -= 1;
    }

    fn remove_stream(&mut self, stream_id: &str) {
        let seqs = self.streams.get(stream_id).cloned().unwrap_or_default();
        for seq in seqs {
            self.remove(seq);
        }
    }

    fn replace(&mut self, sequence: u64, envelope: EventEnvelope) {
        let Some(slot) = usize::try_from(sequence).ok().and_then(|i| self.entries.get_mut(i)) else {
            return;
        };
        let Some(current) = slot.as_ref() else {
            return;
        };
        let replacement = Arc::new(CommittedEvent::new(
            sequence,
            current.committed_at,
            current.stream_id.clone(),
            envelope,
        ));
        *slot = Some(replacement);
    }

    /// Commit time of the latest commit, if anything was ever committed.
    pub fn last_committed_at(&self) -> Option<DateTime<Utc>> {
        self.last_committed_at
    }

    /// The time the next commit would get: now, but never earlier than the latest
    /// commit, so commit times stay monotonic when the wall clock steps back.
    pub fn next_commit_time(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.last_committed_at {
            Some(last) if last > now => last,
            _ => now,
        }
    }

    /// Check that applying `staged` to `stream_id` creates no duplicate identity.
    ///
    /// Staged deletions free the identities they remove, so a transaction may delete
    /// a stream and re-append the same events.
    fn check_identities(
        &self,
        stream_id: &str,
        staged: &[StagedOp],
        scope: IdentityScope,
    ) -> Result<(), Error> {
        let mut removed: HashSet<u64> = HashSet::new();
        let mut added_ids: HashSet<&str> = HashSet::new();
        let mut added_sources: HashSet<(&str, &str)> = HashSet::new();

        for op in staged {
            match op {
                StagedOp::DeleteStream => {
                    removed.extend(self.streams.get(stream_id).into_iter().flatten());
                    added_ids.clear();
                    added_sources.clear();
                }
                StagedOp::DeleteEvent(seq) => {
                    removed.insert(*seq);
                }
                StagedOp::Replace { .. } => {}
                StagedOp::Append(events) => {
                    for event in events {
                        let id = event.id.as_str();
                        let source = event.source.as_str();
                        let in_stream = self
                            .stream_identities
                            .get(&(stream_id.to_string(), id.to_string()))
                            .is_some_and(|seq| !removed.contains(seq));
                        let in_log = scope == IdentityScope::Global
                            && self
                                .source_identities
                                .get(&(source.to_string(), id.to_string()))
                                .is_some_and(|seqs| seqs.iter().any(|seq| !removed.contains(seq)));
                        let in_batch = added_ids.contains(id)
                            || (scope == IdentityScope::Global && added_sources.contains(&(source, id)));

                        if in_stream || in_log || in_batch {
                            return Err(Error::DuplicateEvent {
                                stream_id: stream_id.to_string(),
                                event_id: id.to_string(),
                                event_source: source.to_string(),
                            });
                        }
                        added_ids.insert(id);
                        added_sources.insert((source, id));
                    }
                }
            }
        }
        Ok(())
    }
}

struct Inner {
    log: RwLock<Arc<EventLog>>,
    stream_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    broker: Broker,
    config: StoreConfig,
}

/// The in-memory [`StorageEngine`]. Cloning is cheap and clones share state.
///
/// Commits copy-on-write the [`EventLog`]. When no snapshot is outstanding the
/// log is mutated in place; when one is (an unfinished [`crate::EventQuery`], a
/// catching-up subscription batch, a concurrent read), the commit first clones the
/// whole log, which costs O(n) in the number of stored events. Workloads that keep
/// long-lived queries open while writing heavily pay that copy on every commit.
#[derive(Clone)]
pub struct MemoryEngine {
    inner: Arc<Inner>,
}

impl MemoryEngine {
    /// An empty engine configured by `config`.
    pub fn new(config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                log: RwLock::new(Arc::new(EventLog::default())),
                stream_locks: Mutex::new(HashMap::new()),
                broker: Broker::new(config.broker_capacity),
                config,
            }),
        }
    }

    /// Number of subscriptions currently holding a change-feed receiver.
    pub fn subscriber_count(&self) -> usize {
        self.inner.broker.receiver_count()
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let log = self.inner.log.read();
        f.debug_struct("MemoryEngine")
            .field("events", &log.len())
            .field("next_sequence", &log.next_sequence())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl StorageEngine for MemoryEngine {
    type Scope = MemoryScope;

    fn begin(&self, stream_id: &str) -> MemoryScope {
        let lock = {
            let mut locks = self.inner.stream_locks.lock();
            Arc::clone(locks.entry(stream_id.to_string()).or_default())
        };
        let guard = lock.lock_arc();
        MemoryScope {
            inner: Arc::clone(&self.inner),
            stream_id: stream_id.to_string(),
            lock,
            guard: Some(guard),
            staged: Vec::new(),
            staged_deletions: HashSet::new(),
        }
    }

    fn snapshot(&self) -> Arc<EventLog> {
        Arc::clone(&self.inner.log.read())
    }

    fn feed(&self) -> broadcast::Receiver<Arc<CommittedEvent>> {
        self.inner.broker.subscribe()
    }

    fn watch_head(&self) -> watch::Receiver<u64> {
        self.inner.broker.watch_head()
    }

    fn config(&self) -> &StoreConfig {
        &self.inner.config
    }
}

/// An exclusive scope on one stream of a [`MemoryEngine`].
///
/// Holds the stream's mutex until dropped. Dropping without committing discards
/// the staged operations.
pub struct MemoryScope {
    inner: Arc<Inner>,
    stream_id: String,
    lock: Arc<Mutex<()>>,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
    staged: Vec<StagedOp>,
    staged_deletions: HashSet<u64>,
}

impl StreamScope for MemoryScope {
    fn stream_id(&self) -> &str {
        &self.stream_id
    }

    fn snapshot(&self) -> Arc<EventLog> {
        Arc::clone(&self.inner.log.read())
    }

    fn version(&self) -> u64 {
        let mut version = self.snapshot().version(&self.stream_id);
        for op in &self.staged {
            match op {
                StagedOp::Append(events) => version += events.len() as u64,
                StagedOp::DeleteStream => version = 0,
                StagedOp::DeleteEvent(_) => version = version.saturating_sub(1),
                StagedOp::Replace { .. } => {}
            }
        }
        version
    }

    fn stage(&mut self, op: StagedOp) {
        if let StagedOp::DeleteEvent(seq) = &op
            && !self.staged_deletions.insert(*seq)
        {
            return;
        }
        self.staged.push(op);
    }

    fn commit(mut self) -> Result<CommitOutcome, Error> {
        let staged = std::mem::take(&mut self.staged);
        let mut log = self.inner.log.write();
        log.check_identities(&self.stream_id, &staged, self.inner.config.identity_scope)?;

        let committed_at = log.next_commit_time();
        let log_mut = Arc::make_mut(&mut *log);
        let mut appended = Vec::new();
        for op in staged {
            match op {
                StagedOp::Append(events) => {
                    for envelope in events {
                        appended.push(log_mut.append(&self.stream_id, envelope, committed_at));
                    }
                }
                StagedOp::DeleteStream => log_mut.remove_stream(&self.stream_id),
                StagedOp::DeleteEvent(seq) => log_mut.remove(seq),
                StagedOp::Replace { sequence, envelope } => log_mut.replace(sequence, envelope),
            }
        }
        let version = log_mut.version(&self.stream_id);

        self.inner.broker.publish(&appended);
        drop(log);

        tracing::debug!(
            stream_id = %self.stream_id,
            appended = appended.len(),
            version,
            "committed"
        );
        Ok(CommitOutcome { appended, version })
    }
}

impl Drop for MemoryScope {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.inner.stream_locks.lock();
        // The map entry plus our own handle: nobody else is waiting on this stream.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.stream_id);
        }
    }
}
