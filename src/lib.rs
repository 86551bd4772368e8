//! eventfold-store: an event store core for event sourcing and CQRS.
//!
//! Events are immutable [`EventEnvelope`]s appended to named streams under
//! optimistic concurrency ([`WriteCondition`]). The store offers snapshot-consistent
//! stream reads, cross-stream [`Filter`] queries, in-place updates and deletions,
//! and resumable catch-up subscriptions whose [`SubscriptionPosition`]s can be
//! persisted in a [`SubscriptionPositionStorage`].
//!
//! The protocol is written against the [`StorageEngine`] capability traits;
//! [`MemoryEngine`] is the in-memory implementation. [`EventStore`] is the blocking
//! API and [`AsyncEventStore`] the async one, with identical semantics.

pub mod async_store;
pub mod broker;
pub mod condition;
pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod memory;
pub mod position;
pub mod position_storage;
pub mod query;
pub mod store;
pub mod subscription;
pub mod types;

pub use async_store::AsyncEventStore;
pub use condition::Condition;
pub use config::{IdentityScope, StoreConfig, TimeRepresentation};
pub use engine::{StorageEngine, StreamScope};
pub use error::Error;
pub use filter::{FieldFilter, Filter};
pub use memory::{EventLog, MemoryEngine};
pub use position::{ResumeToken, StartAt, SubscriptionPosition};
pub use position_storage::{
    FilePositionStorage, InMemoryPositionStorage, SubscriptionPositionStorage, start_at_for,
};
pub use query::{EventQuery, ReadOptions, SortBy};
pub use store::{EventStore, StreamTransaction, WriteResult};
pub use subscription::{BlockingSubscription, CancelHandle, Subscription};
pub use types::{
    DEFAULT_CONTENT_TYPE, EventEnvelope, EventStream, ExtensionValue, PositionedEvent,
    STREAM_ID_EXTENSION, WriteCondition,
};
