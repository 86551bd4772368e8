//! Non-blocking API over the event store.
//!
//! [`AsyncEventStore`] has the same semantics as [`EventStore`]. Operations that
//! may wait on a stream lock run on tokio's blocking pool through
//! `spawn_blocking`; snapshot reads return immediately. Queries are exposed as a
//! pull-based `Stream` over the same lazy iterator the blocking API uses, so the
//! consumer sets the pace.
//!
//! All async methods must be called from within a tokio runtime.

use futures::stream;

use crate::config::StoreConfig;
use crate::engine::StorageEngine;
use crate::error::Error;
use crate::filter::Filter;
use crate::memory::MemoryEngine;
use crate::position::{StartAt, SubscriptionPosition};
use crate::query::{EventQuery, ReadOptions};
use crate::store::{EventStore, StreamTransaction, WriteResult};
use crate::subscription::Subscription;
use crate::types::{EventEnvelope, EventStream, WriteCondition};

fn blocking_task_failed(e: tokio::task::JoinError) -> Error {
    Error::InvalidArgument(format!("blocking store task failed: {e}"))
}

/// Async event store. Cloning is cheap; clones share the engine.
#[derive(Clone, Debug)]
pub struct AsyncEventStore<E: StorageEngine = MemoryEngine> {
    inner: EventStore<E>,
}

impl AsyncEventStore<MemoryEngine> {
    /// An in-memory store with the default configuration.
    pub fn in_memory() -> Self {
        Self::new(EventStore::in_memory())
    }

    /// An in-memory store with `config`.
    pub fn with_config(config: StoreConfig) -> Self {
        Self::new(EventStore::with_config(config))
    }
}

impl<E: StorageEngine> From<EventStore<E>> for AsyncEventStore<E> {
    fn from(store: EventStore<E>) -> Self {
        Self::new(store)
    }
}

impl<E: StorageEngine> AsyncEventStore<E> {
    /// Wrap a blocking store.
    pub fn new(store: EventStore<E>) -> Self {
        Self { inner: store }
    }

    /// The blocking store sharing this store's engine.
    pub fn blocking(&self) -> &EventStore<E> {
        &self.inner
    }

    /// Async [`EventStore::write`].
    pub async fn write(&self, stream_id: &str, events: Vec<EventEnvelope>) -> Result<WriteResult, Error> {
        self.write_conditionally(stream_id, WriteCondition::Any, events).await
    }

    /// Async [`EventStore::write_conditionally`].
    pub async fn write_conditionally(
        &self,
        stream_id: &str,
        condition: WriteCondition,
        events: Vec<EventEnvelope>,
    ) -> Result<WriteResult, Error> {
        let store = self.inner.clone();
        let stream_id = stream_id.to_string();
        tokio::task::spawn_blocking(move || store.write_conditionally(&stream_id, condition, events))
            .await
            .map_err(blocking_task_failed)?
    }

    pub async fn read(&self, stream_id: &str) -> EventStream {
        self.inner.read(stream_id)
    }

    pub async fn read_with(&self, stream_id: &str, options: ReadOptions) -> EventStream {
        self.inner.read_with(stream_id, options)
    }

    pub async fn exists(&self, stream_id: &str) -> bool {
        self.inner.exists(stream_id)
    }

    pub async fn delete_event_stream(&self, stream_id: &str) -> Result<(), Error> {
        let store = self.inner.clone();
        let stream_id = stream_id.to_string();
        tokio::task::spawn_blocking(move || store.delete_event_stream(&stream_id))
            .await
            .map_err(blocking_task_failed)?
    }

    pub async fn delete_event(&self, id: &str, source: &str) -> Result<bool, Error> {
        let store = self.inner.clone();
        let (id, source) = (id.to_string(), source.to_string());
        tokio::task::spawn_blocking(move || store.delete_event(&id, &source))
            .await
            .map_err(blocking_task_failed)?
    }

    /// Async [`EventStore::update_event`]. `transform` runs on the blocking pool.
    pub async fn update_event<F>(
        &self,
        id: &str,
        source: &str,
        transform: F,
    ) -> Result<Option<EventEnvelope>, Error>
    where
        F: FnOnce(&EventEnvelope) -> Option<EventEnvelope> + Send + 'static,
    {
        let store = self.inner.clone();
        let (id, source) = (id.to_string(), source.to_string());
        tokio::task::spawn_blocking(move || store.update_event(&id, &source, transform))
            .await
            .map_err(blocking_task_failed)?
    }

    /// Async [`EventStore::transaction`]. `f` runs on the blocking pool.
    pub async fn transaction<R, F>(&self, stream_id: &str, f: F) -> Result<R, Error>
    where
        R: Send + 'static,
        F: FnOnce(&mut StreamTransaction<E::Scope>) -> Result<R, Error> + Send + 'static,
    {
        let store = self.inner.clone();
        let stream_id = stream_id.to_string();
        tokio::task::spawn_blocking(move || store.transaction(&stream_id, f))
            .await
            .map_err(blocking_task_failed)?
    }

    /// Query as a `Stream`. Results are produced only as the consumer polls.
    pub fn query(&self, filter: &Filter, options: ReadOptions) -> stream::Iter<EventQuery> {
        stream::iter(self.inner.query(filter, options))
    }

    pub fn all(&self, options: ReadOptions) -> stream::Iter<EventQuery> {
        stream::iter(self.inner.all(options))
    }

    pub fn subscribe(&self, start_at: StartAt) -> Result<Subscription, Error> {
        self.inner.subscribe(start_at)
    }

    pub fn subscribe_filtered(&self, start_at: StartAt, filter: &Filter) -> Result<Subscription, Error> {
        self.inner.subscribe_filtered(start_at, filter)
    }

    pub fn current_position(&self) -> SubscriptionPosition {
        self.inner.current_position()
    }
}
