//! Error types for the event store.
//!
//! This module defines the unified error enum used throughout the crate. All fallible
//! operations return `Result<T, Error>`. Condition and filter evaluation never fail;
//! only the store protocol, the position codec and position storage produce errors.
//!
//! - `WriteConditionNotFulfilled` -> expected, caller re-reads the version and retries
//! - `DuplicateEvent` -> batch rejected atomically, caller must re-read before retrying
//! - `InvalidArgument` -> a caller-supplied value or function violated a precondition
//! - `UnrecognizedPosition` -> persisted position state is corrupt or foreign, fatal
//! - `Io` / `Serialization` -> file-backed position storage failures

/// Unified error type for all event store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The write condition did not hold for the stream's current version.
    ///
    /// The display text is a compatibility contract: callers match on it verbatim.
    #[error("WriteCondition was not fulfilled. Expected version {condition} but was {actual}.")]
    WriteConditionNotFulfilled {
        /// Rendered condition clause, e.g. `to be equal to 10`.
        condition: String,
        /// The version the stream was actually at.
        actual: u64,
    },

    /// An event in the batch collides with an existing identity, or with another
    /// event in the same batch. Nothing from the batch was written.
    #[error("duplicate event {event_id} (source {event_source}) in stream {stream_id}")]
    DuplicateEvent {
        /// Stream the rejected batch was written to.
        stream_id: String,
        /// Id of the colliding event.
        event_id: String,
        /// Source of the colliding event.
        event_source: String,
    },

    /// A request argument is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A persisted subscription position matches none of the known encodings.
    #[error("unrecognized subscription position: {0}")]
    UnrecognizedPosition(String),

    /// An I/O error occurred while reading or writing persisted positions.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted position document could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
