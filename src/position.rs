//! Subscription positions and their persisted record format.
//!
//! A position is where a subscription resumes. Three shapes exist:
//!
//! - a [`ResumeToken`], opaque bytes minted by the change feed for each event
//! - an operation time, an instant in the feed's own clock
//! - a string position, a serialized form of one of the other two
//!
//! Persisted records are JSON documents keyed by subscription id and carry exactly
//! one of `resumeToken`, `operationTime` or `subscriptionPosition`.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::Error;

/// Record key holding the subscription id.
pub const SUBSCRIPTION_ID: &str = "subscriptionId";
/// Record key holding a resume token document.
pub const RESUME_TOKEN: &str = "resumeToken";
/// Record key holding an operation time.
pub const OPERATION_TIME: &str = "operationTime";
/// Record key holding a string position.
pub const GENERIC_SUBSCRIPTION_POSITION: &str = "subscriptionPosition";

/// Opaque resume token.
///
/// Serializes as `{"_data": "<hex>"}`. Tokens minted by this crate encode the
/// event's global sequence as 8 big-endian bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "TokenDocument", into = "TokenDocument")]
pub struct ResumeToken(Bytes);

#[derive(Serialize, Deserialize)]
struct TokenDocument {
    #[serde(rename = "_data")]
    data: String,
}

impl TryFrom<TokenDocument> for ResumeToken {
    type Error = hex::FromHexError;

    fn try_from(doc: TokenDocument) -> Result<Self, Self::Error> {
        Ok(ResumeToken(Bytes::from(hex::decode(doc.data)?)))
    }
}

impl From<ResumeToken> for TokenDocument {
    fn from(token: ResumeToken) -> Self {
        TokenDocument { data: token.to_hex() }
    }
}

impl ResumeToken {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        ResumeToken(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub(crate) fn for_sequence(sequence: u64) -> Self {
        ResumeToken(Bytes::copy_from_slice(&sequence.to_be_bytes()))
    }

    /// The sequence this token was minted for.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the token was not minted by this crate.
    pub(crate) fn sequence(&self) -> Result<u64, Error> {
        let bytes: [u8; 8] = self.0.as_ref().try_into().map_err(|_| {
            Error::InvalidArgument(format!("resume token {} is not recognized", self.to_hex()))
        })?;
        Ok(u64::from_be_bytes(bytes))
    }
}

/// Where a subscription resumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionPosition {
    ResumeToken(ResumeToken),
    /// Events committed at or after this instant.
    OperationTime(DateTime<Utc>),
    /// A serialized position, as produced by [`SubscriptionPosition::as_string`].
    StringPosition(String),
}

impl SubscriptionPosition {
    /// The JSON text form of the position.
    ///
    /// Resume tokens render as `{"resumeToken":{"_data":"…"}}`, operation times as
    /// `{"operationTime":"<rfc3339>"}`. A string position is returned unchanged.
    pub fn as_string(&self) -> String {
        match self {
            SubscriptionPosition::ResumeToken(token) => {
                json!({ RESUME_TOKEN: { "_data": token.to_hex() } }).to_string()
            }
            SubscriptionPosition::OperationTime(time) => {
                json!({ OPERATION_TIME: time }).to_string()
            }
            SubscriptionPosition::StringPosition(s) => s.clone(),
        }
    }
}

impl fmt::Display for SubscriptionPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

/// Where a new subscription starts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StartAt {
    /// Only events committed after the subscription was opened.
    #[default]
    Now,
    AtPosition(SubscriptionPosition),
}

impl StartAt {
    pub fn now() -> Self {
        StartAt::Now
    }

    pub fn position(position: SubscriptionPosition) -> Self {
        StartAt::AtPosition(position)
    }
}

impl From<SubscriptionPosition> for StartAt {
    fn from(position: SubscriptionPosition) -> Self {
        StartAt::AtPosition(position)
    }
}

/// Encode a position as its persisted record.
pub fn encode(subscription_id: &str, position: &SubscriptionPosition) -> Value {
    let mut record = Map::new();
    record.insert(SUBSCRIPTION_ID.to_string(), Value::String(subscription_id.to_string()));
    match position {
        SubscriptionPosition::ResumeToken(token) => {
            record.insert(RESUME_TOKEN.to_string(), json!({ "_data": token.to_hex() }));
        }
        SubscriptionPosition::OperationTime(time) => {
            record.insert(OPERATION_TIME.to_string(), json!(time));
        }
        SubscriptionPosition::StringPosition(s) => {
            record.insert(GENERIC_SUBSCRIPTION_POSITION.to_string(), Value::String(s.clone()));
        }
    }
    Value::Object(record)
}

/// Decode a persisted record.
///
/// Keys are tried in the order `resumeToken`, `operationTime`,
/// `subscriptionPosition`; the first one present decides the shape.
///
/// # Errors
///
/// Returns [`Error::UnrecognizedPosition`] if the record has none of the keys, or
/// the deciding key holds a malformed value.
pub fn decode(record: &Value) -> Result<SubscriptionPosition, Error> {
    let unrecognized = |detail: &str| {
        Error::UnrecognizedPosition(format!("{detail} in {record}"))
    };

    if let Some(token) = record.get(RESUME_TOKEN) {
        let token: ResumeToken = serde_json::from_value(token.clone())
            .map_err(|e| unrecognized(&format!("malformed {RESUME_TOKEN} ({e})")))?;
        return Ok(SubscriptionPosition::ResumeToken(token));
    }
    if let Some(time) = record.get(OPERATION_TIME) {
        let time: DateTime<Utc> = serde_json::from_value(time.clone())
            .map_err(|e| unrecognized(&format!("malformed {OPERATION_TIME} ({e})")))?;
        return Ok(SubscriptionPosition::OperationTime(time));
    }
    if let Some(position) = record.get(GENERIC_SUBSCRIPTION_POSITION) {
        let position = position
            .as_str()
            .ok_or_else(|| unrecognized(&format!("non-string {GENERIC_SUBSCRIPTION_POSITION}")))?;
        return Ok(SubscriptionPosition::StringPosition(position.to_string()));
    }
    Err(unrecognized("no known position key"))
}

/// Interpret a string position as a resume token or an operation time.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] if the text is not one of the
/// [`SubscriptionPosition::as_string`] forms.
pub fn parse_string_position(position: &str) -> Result<SubscriptionPosition, Error> {
    let invalid = || {
        Error::InvalidArgument(format!(
            "doesn't recognize subscription position {position} as a valid subscription position"
        ))
    };
    let document: Value = serde_json::from_str(position).map_err(|_| invalid())?;
    if document.get(RESUME_TOKEN).is_none() && document.get(OPERATION_TIME).is_none() {
        return Err(invalid());
    }
    match decode(&document).map_err(|_| invalid())? {
        SubscriptionPosition::StringPosition(_) => Err(invalid()),
        resolved => Ok(resolved),
    }
}

/// Thread `target` through the callback matching `start_at`.
///
/// `Now` returns `target` untouched. A string position is first parsed with
/// [`parse_string_position`].
///
/// # Errors
///
/// Propagates callback errors, and returns [`Error::InvalidArgument`] for an
/// unparseable string position.
pub fn apply_start_position<T>(
    target: T,
    start_at: &StartAt,
    on_resume_token: impl FnOnce(T, &ResumeToken) -> Result<T, Error>,
    on_operation_time: impl FnOnce(T, DateTime<Utc>) -> Result<T, Error>,
) -> Result<T, Error> {
    let position = match start_at {
        StartAt::Now => return Ok(target),
        StartAt::AtPosition(SubscriptionPosition::StringPosition(s)) => parse_string_position(s)?,
        StartAt::AtPosition(p) => p.clone(),
    };
    match position {
        SubscriptionPosition::ResumeToken(token) => on_resume_token(target, &token),
        SubscriptionPosition::OperationTime(time) => on_operation_time(target, time),
        SubscriptionPosition::StringPosition(_) => Err(Error::InvalidArgument(
            "nested string positions are not supported".into(),
        )),
    }
}
