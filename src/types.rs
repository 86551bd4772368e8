//! Core domain types for the event store.
//!
//! This module defines the data types every other module depends on: the immutable
//! event envelope callers write, the committed form the engine keeps, the stream
//! read model, write conditions for optimistic concurrency, and the
//! `(event, position)` pair yielded by subscriptions.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::{self, Condition};
use crate::error::Error;
use crate::position::SubscriptionPosition;

/// Extension attribute that names the stream owning an event.
///
/// Stamped on every envelope by `write`, overwriting any caller-supplied value.
pub const STREAM_ID_EXTENSION: &str = "streamid";

/// Content type assigned by [`EventEnvelope::new`].
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Value of an envelope extension attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtensionValue {
    /// Boolean attribute.
    Boolean(bool),
    /// Integer attribute.
    Integer(i64),
    /// String attribute.
    String(String),
}

impl fmt::Display for ExtensionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtensionValue::Boolean(b) => write!(f, "{b}"),
            ExtensionValue::Integer(i) => write!(f, "{i}"),
            ExtensionValue::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ExtensionValue {
    fn from(value: &str) -> Self {
        ExtensionValue::String(value.to_string())
    }
}

impl From<String> for ExtensionValue {
    fn from(value: String) -> Self {
        ExtensionValue::String(value)
    }
}

impl From<i64> for ExtensionValue {
    fn from(value: i64) -> Self {
        ExtensionValue::Integer(value)
    }
}

impl From<bool> for ExtensionValue {
    fn from(value: bool) -> Self {
        ExtensionValue::Boolean(value)
    }
}

/// An immutable event record.
///
/// The store never interprets `data`; serialization of the payload is the caller's
/// concern. `(source, id)` identifies the event globally, `(stream, id)` within
/// its stream.
///
/// # Fields
///
/// * `id` - Caller-assigned event id.
/// * `source` - URI identifying the context the event happened in.
/// * `event_type` - Type tag, e.g. `"NameDefined"`.
/// * `time` - Business timestamp of the event.
/// * `subject` - Subject of the event within the source.
/// * `content_type` - Media type of `data`.
/// * `schema` - Optional URI of the schema `data` adheres to.
/// * `data` - Opaque payload.
/// * `extensions` - Additional attributes, including [`STREAM_ID_EXTENSION`] once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Caller-assigned event id.
    pub id: String,
    /// URI identifying the context the event happened in.
    pub source: String,
    /// Type tag.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Business timestamp.
    pub time: DateTime<Utc>,
    /// Subject within the source.
    pub subject: String,
    /// Media type of `data`.
    pub content_type: String,
    /// Optional schema URI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// Opaque payload.
    #[serde(default)]
    pub data: Bytes,
    /// Extension attributes.
    #[serde(default)]
    pub extensions: BTreeMap<String, ExtensionValue>,
}

impl EventEnvelope {
    /// Create an envelope with an empty subject, empty payload and the default
    /// content type.
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        event_type: impl Into<String>,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            event_type: event_type.into(),
            time,
            subject: String::new(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            schema: None,
            data: Bytes::new(),
            extensions: BTreeMap::new(),
        }
    }

    /// Set the subject within the source.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Set the media type of `data`.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Set the schema URI `data` adheres to.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Set the payload.
    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    /// Add or replace an extension attribute.
    pub fn with_extension(mut self, name: impl Into<String>, value: impl Into<ExtensionValue>) -> Self {
        self.extensions.insert(name.into(), value.into());
        self
    }

    /// The owning stream, if the envelope has been written.
    pub fn stream_id(&self) -> Option<&str> {
        match self.extensions.get(STREAM_ID_EXTENSION) {
            Some(ExtensionValue::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Check the attributes `write` requires.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `id`, `source` or `event_type` is empty.
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.id.is_empty() {
            return Err(Error::InvalidArgument("event id must not be empty".into()));
        }
        if self.source.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "event {} has an empty source",
                self.id
            )));
        }
        if self.event_type.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "event {} has an empty type",
                self.id
            )));
        }
        Ok(())
    }
}

/// Render `time` the way the string time representation stores it.
///
/// RFC 3339 in UTC with a `Z` suffix and only as many fractional digits as the
/// instant needs. The width therefore varies, which is why lexical comparison of
/// this form is only approximately chronological.
pub fn rfc3339(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// An event as held by a storage engine after commit.
///
/// # Fields
///
/// * `sequence` - Global commit sequence number, zero-based and never reused.
/// * `committed_at` - Engine commit time, non-decreasing in `sequence` order.
/// * `stream_id` - Owning stream.
/// * `envelope` - The stored envelope.
/// * `time_text` - `envelope.time` in [`rfc3339`] form.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedEvent {
    pub sequence: u64,
    pub committed_at: DateTime<Utc>,
    pub stream_id: String,
    pub envelope: EventEnvelope,
    pub time_text: String,
}

impl CommittedEvent {
    pub(crate) fn new(
        sequence: u64,
        committed_at: DateTime<Utc>,
        stream_id: String,
        envelope: EventEnvelope,
    ) -> Self {
        let time_text = rfc3339(&envelope.time);
        Self {
            sequence,
            committed_at,
            stream_id,
            envelope,
            time_text,
        }
    }
}

/// The result of reading one stream.
///
/// `version` and `events` always come from the same snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct EventStream {
    /// Stream id.
    pub id: String,
    /// Number of events currently in the stream, 0 if the stream does not exist.
    pub version: u64,
    /// The requested slice of the stream's events.
    pub events: Vec<EventEnvelope>,
}

impl EventStream {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// An event delivered by a subscription together with the position to persist
/// after processing it.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionedEvent {
    pub event: EventEnvelope,
    pub position: SubscriptionPosition,
}

/// Gate for optimistic concurrency on write.
///
/// # Variants
///
/// * `Any` - No constraint; the write proceeds regardless of the stream version.
/// * `StreamVersion(c)` - The write proceeds only if the pre-write version satisfies `c`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WriteCondition {
    /// No constraint.
    #[default]
    Any,
    /// Constraint on the pre-write stream version.
    StreamVersion(Condition<u64>),
}

impl WriteCondition {
    /// Require the stream to be at exactly `version`.
    pub fn stream_version_eq(version: u64) -> Self {
        WriteCondition::StreamVersion(condition::eq(version))
    }

    /// Require the stream version to satisfy `condition`.
    pub fn stream_version(condition: Condition<u64>) -> Self {
        WriteCondition::StreamVersion(condition)
    }

    /// Check the condition against the current stream version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WriteConditionNotFulfilled`] if the condition does not hold.
    pub fn check(&self, version: u64) -> Result<(), Error> {
        match self {
            WriteCondition::Any => Ok(()),
            WriteCondition::StreamVersion(c) if c.evaluate(&version) => Ok(()),
            WriteCondition::StreamVersion(c) => Err(Error::WriteConditionNotFulfilled {
                condition: c.describe(),
                actual: version,
            }),
        }
    }
}
