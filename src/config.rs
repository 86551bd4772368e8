//! Store configuration.
//!
//! # Environment Variables
//!
//! | Variable                        | Default   | Description                                   |
//! |---------------------------------|-----------|-----------------------------------------------|
//! | `EVENTFOLD_TIME_REPRESENTATION` | `rfc3339` | `rfc3339` (string) or `date` (native instant) |
//! | `EVENTFOLD_IDENTITY_SCOPE`      | `global`  | `stream` or `global` duplicate detection      |
//! | `EVENTFOLD_BROKER_CAPACITY`     | `4096`    | Change-feed buffer per subscriber             |
//! | `EVENTFOLD_CATCHUP_BATCH_SIZE`  | `500`     | Events read per subscription catch-up batch   |

use std::str::FromStr;

use crate::error::Error;

/// Default change-feed buffer when `EVENTFOLD_BROKER_CAPACITY` is not set.
pub const DEFAULT_BROKER_CAPACITY: usize = 4096;

/// Default catch-up batch size when `EVENTFOLD_CATCHUP_BATCH_SIZE` is not set.
pub const DEFAULT_CATCHUP_BATCH_SIZE: usize = 500;

/// How event time is represented for filtering and sorting.
///
/// `Rfc3339String` compares the [`crate::types::rfc3339`] text lexically. Equality
/// and prefix-style filtering are cheap, but the text is not fixed-width, so range
/// conditions whose bounds fall on instants with a different number of fractional
/// digits than the stored event can include or exclude it incorrectly. `Date`
/// compares instants and is exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeRepresentation {
    #[default]
    Rfc3339String,
    Date,
}

impl FromStr for TimeRepresentation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rfc3339" | "rfc3339_string" | "string" => Ok(TimeRepresentation::Rfc3339String),
            "date" => Ok(TimeRepresentation::Date),
            other => Err(Error::InvalidArgument(format!(
                "unknown time representation: {other}"
            ))),
        }
    }
}

/// Which identities must be unique across committed events.
///
/// `(stream id, event id)` is always unique. `Global` additionally makes
/// `(source, event id)` unique across all streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentityScope {
    Stream,
    #[default]
    Global,
}

impl FromStr for IdentityScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stream" => Ok(IdentityScope::Stream),
            "global" => Ok(IdentityScope::Global),
            other => Err(Error::InvalidArgument(format!(
                "unknown identity scope: {other}"
            ))),
        }
    }
}

/// Configuration for an event store instance.
///
/// # Fields
///
/// * `time_representation` - Time comparison mode for queries and subscription filters.
/// * `identity_scope` - Duplicate detection scope.
/// * `broker_capacity` - Live events buffered per subscriber before it lags.
/// * `catchup_batch_size` - Events read per batch while a subscription catches up.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub time_representation: TimeRepresentation,
    pub identity_scope: IdentityScope,
    pub broker_capacity: usize,
    pub catchup_batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            time_representation: TimeRepresentation::default(),
            identity_scope: IdentityScope::default(),
            broker_capacity: DEFAULT_BROKER_CAPACITY,
            catchup_batch_size: DEFAULT_CATCHUP_BATCH_SIZE,
        }
    }
}

impl StoreConfig {
    /// Set how event times are compared and sorted.
    pub fn with_time_representation(mut self, time_representation: TimeRepresentation) -> Self {
        self.time_representation = time_representation;
        self
    }

    /// Set where event identities must be unique.
    pub fn with_identity_scope(mut self, identity_scope: IdentityScope) -> Self {
        self.identity_scope = identity_scope;
        self
    }

    /// Set the change-feed buffer per subscriber. Zero is raised to one.
    pub fn with_broker_capacity(mut self, broker_capacity: usize) -> Self {
        self.broker_capacity = broker_capacity;
        self
    }

    /// Set the number of events a catching-up subscription reads per batch.
    pub fn with_catchup_batch_size(mut self, catchup_batch_size: usize) -> Self {
        self.catchup_batch_size = catchup_batch_size;
        self
    }

    /// Parse the configuration from environment variables, falling back to the
    /// defaults for unset variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if:
    /// - `EVENTFOLD_TIME_REPRESENTATION` is not `rfc3339` or `date`
    /// - `EVENTFOLD_IDENTITY_SCOPE` is not `stream` or `global`
    /// - `EVENTFOLD_BROKER_CAPACITY` or `EVENTFOLD_CATCHUP_BATCH_SIZE` is not a
    ///   nonzero `usize`
    pub fn from_env() -> Result<StoreConfig, Error> {
        let mut config = StoreConfig::default();

        if let Ok(val) = std::env::var("EVENTFOLD_TIME_REPRESENTATION") {
            config.time_representation = val.parse().map_err(|e| {
                Error::InvalidArgument(format!("EVENTFOLD_TIME_REPRESENTATION: {e}"))
            })?;
        }

        if let Ok(val) = std::env::var("EVENTFOLD_IDENTITY_SCOPE") {
            config.identity_scope = val
                .parse()
                .map_err(|e| Error::InvalidArgument(format!("EVENTFOLD_IDENTITY_SCOPE: {e}")))?;
        }

        if let Ok(val) = std::env::var("EVENTFOLD_BROKER_CAPACITY") {
            config.broker_capacity = parse_nonzero("EVENTFOLD_BROKER_CAPACITY", &val)?;
        }

        if let Ok(val) = std::env::var("EVENTFOLD_CATCHUP_BATCH_SIZE") {
            config.catchup_batch_size = parse_nonzero("EVENTFOLD_CATCHUP_BATCH_SIZE", &val)?;
        }

        Ok(config)
    }
}

fn parse_nonzero(name: &str, val: &str) -> Result<usize, Error> {
    let parsed: usize = val
        .parse()
        .map_err(|e| Error::InvalidArgument(format!("{name} is not a valid usize: {e}")))?;
    if parsed == 0 {
        return Err(Error::InvalidArgument(format!("{name} must be nonzero")));
    }
    Ok(parsed)
}
