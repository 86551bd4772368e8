//! Storage capabilities the event store protocol is written against.
//!
//! An engine must provide three things:
//!
//! - a stream scope: an exclusive, per-stream unit of work that can read a
//!   consistent view, stage operations, and commit them atomically while
//!   enforcing identity uniqueness (dropping an uncommitted scope aborts it)
//! - a consistent snapshot of the global log for queries and catch-up reads
//! - a strictly ordered change feed of committed events
//!
//! [`crate::memory::MemoryEngine`] is the in-memory reference implementation.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use crate::config::StoreConfig;
use crate::error::Error;
use crate::memory::EventLog;
use crate::types::{CommittedEvent, EventEnvelope};

/// An operation staged inside a [`StreamScope`], applied on commit.
#[derive(Debug, Clone, PartialEq)]
pub enum StagedOp {
    /// Append the events, in order, to the scope's stream.
    Append(Vec<EventEnvelope>),
    /// Remove every event of the scope's stream.
    DeleteStream,
    /// Remove the committed event with this sequence number.
    DeleteEvent(u64),
    /// Replace the envelope of the committed event with this sequence number,
    /// keeping its identity and position.
    Replace {
        sequence: u64,
        envelope: EventEnvelope,
    },
}

/// What a successful commit changed.
#[derive(Debug, Clone, Default)]
pub struct CommitOutcome {
    /// Events appended by the commit, in commit order.
    pub appended: Vec<Arc<CommittedEvent>>,
    /// The stream's version after the commit.
    pub version: u64,
}

/// Capabilities required from a storage engine.
pub trait StorageEngine: Clone + Send + Sync + 'static {
    type Scope: StreamScope;

    /// Begin an exclusive scope on `stream_id`.
    ///
    /// Blocks while another scope on the same stream is open. Scopes on different
    /// streams never wait for each other.
    fn begin(&self, stream_id: &str) -> Self::Scope;

    /// A consistent view of the whole log as of the latest commit.
    fn snapshot(&self) -> Arc<EventLog>;

    /// Register a receiver on the change feed. Every event committed after this call
    /// is delivered, in commit order.
    fn feed(&self) -> broadcast::Receiver<Arc<CommittedEvent>>;

    /// Watch the head of the log (the next unassigned sequence). The value changes
    /// after the events of a commit have been put on the feed.
    fn watch_head(&self) -> watch::Receiver<u64>;

    fn config(&self) -> &StoreConfig;
}

/// An exclusive unit of work on one stream.
pub trait StreamScope: Send {
    fn stream_id(&self) -> &str;

    /// A consistent view of the committed log. Staged operations are not visible.
    fn snapshot(&self) -> Arc<EventLog>;

    /// The stream version with staged operations applied.
    fn version(&self) -> u64;

    fn stage(&mut self, op: StagedOp);

    /// Apply every staged operation as one atomic unit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateEvent`] if a staged append collides with a committed
    /// identity or another staged event. Nothing is applied in that case.
    fn commit(self) -> Result<CommitOutcome, Error>;
}
