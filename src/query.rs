//! Filter compilation, ordering and paging over a log snapshot.
//!
//! A [`Filter`] is compiled once per query against the configured
//! [`TimeRepresentation`]. In string mode time conditions are moved into the
//! RFC 3339 text domain and compared against each event's precomputed
//! `time_text`; in date mode they compare instants.
//!
//! [`EventQuery`] is a lazy iterator over an immutable snapshot. Natural order is
//! filtered on demand; time order has to see every match before it can yield the
//! first one, so it collects and sorts up front.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::condition::Condition;
use crate::config::TimeRepresentation;
use crate::filter::{FieldFilter, Filter};
use crate::memory::EventLog;
use crate::types::{self, CommittedEvent, EventStream};

/// Result ordering for reads and queries.
///
/// Time orders break ties by commit order; the descending variants are the exact
/// reverse of their ascending counterparts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortBy {
    /// Commit order.
    #[default]
    NaturalAsc,
    NaturalDesc,
    /// By event time, in the configured [`TimeRepresentation`].
    TimeAsc,
    TimeDesc,
}

/// Paging and ordering for [`crate::EventStore::read_with`] and queries.
///
/// `skip` and `limit` apply after filtering and ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    pub skip: usize,
    pub limit: usize,
    pub sort_by: SortBy,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            skip: 0,
            limit: usize::MAX,
            sort_by: SortBy::NaturalAsc,
        }
    }
}

impl ReadOptions {
    /// Skip the first `skip` results.
    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    /// Return at most `limit` results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Order results by `sort_by`.
    pub fn sort_by(mut self, sort_by: SortBy) -> Self {
        self.sort_by = sort_by;
        self
    }
}

#[derive(Debug, Clone)]
enum CompiledField {
    Id(Condition<String>),
    Source(Condition<String>),
    Type(Condition<String>),
    Subject(Condition<String>),
    Schema(Condition<String>),
    ContentType(Condition<String>),
    TimeText(Condition<String>),
    TimeInstant(Condition<DateTime<Utc>>),
}

/// A [`Filter`] bound to a time representation, ready to test events.
#[derive(Debug, Clone)]
pub struct CompiledFilter(Node);

#[derive(Debug, Clone)]
enum Node {
    All,
    Field(CompiledField),
    And(Vec<Node>),
    Or(Vec<Node>),
}

impl CompiledFilter {
    pub fn compile(filter: &Filter, representation: TimeRepresentation) -> Self {
        CompiledFilter(compile_node(filter, representation))
    }

    pub fn matches(&self, event: &CommittedEvent) -> bool {
        self.0.matches(event)
    }
}

fn compile_node(filter: &Filter, representation: TimeRepresentation) -> Node {
    match filter {
        Filter::All => Node::All,
        Filter::And(children) => Node::And(
            children
                .iter()
                .map(|c| compile_node(c, representation))
                .collect(),
        ),
        Filter::Or(children) => Node::Or(
            children
                .iter()
                .map(|c| compile_node(c, representation))
                .collect(),
        ),
        Filter::Field(field) => Node::Field(match field {
            FieldFilter::Id(c) => CompiledField::Id(c.clone()),
            FieldFilter::Source(c) => CompiledField::Source(c.clone()),
            FieldFilter::Type(c) => CompiledField::Type(c.clone()),
            FieldFilter::Subject(c) => CompiledField::Subject(c.clone()),
            FieldFilter::Schema(c) => CompiledField::Schema(c.clone()),
            FieldFilter::ContentType(c) => CompiledField::ContentType(c.clone()),
            FieldFilter::Time(c) => match representation {
                TimeRepresentation::Rfc3339String => CompiledField::TimeText(c.map(&types::rfc3339)),
                TimeRepresentation::Date => CompiledField::TimeInstant(c.clone()),
            },
        }),
    }
}

impl Node {
    fn matches(&self, event: &CommittedEvent) -> bool {
        let envelope = &event.envelope;
        match self {
            Node::All => true,
            Node::And(children) => children.iter().all(|c| c.matches(event)),
            Node::Or(children) => children.iter().any(|c| c.matches(event)),
            Node::Field(field) => match field {
                CompiledField::Id(c) => c.evaluate(&envelope.id),
                CompiledField::Source(c) => c.evaluate(&envelope.source),
                CompiledField::Type(c) => c.evaluate(&envelope.event_type),
                CompiledField::Subject(c) => c.evaluate(&envelope.subject),
                CompiledField::Schema(c) => c.evaluate_optional(envelope.schema.as_ref()),
                CompiledField::ContentType(c) => c.evaluate(&envelope.content_type),
                CompiledField::TimeText(c) => c.evaluate(&event.time_text),
                CompiledField::TimeInstant(c) => c.evaluate(&envelope.time),
            },
        }
    }
}

fn by_time(a: &CommittedEvent, b: &CommittedEvent, representation: TimeRepresentation) -> Ordering {
    let primary = match representation {
        TimeRepresentation::Rfc3339String => a.time_text.cmp(&b.time_text),
        TimeRepresentation::Date => a.envelope.time.cmp(&b.envelope.time),
    };
    primary.then(a.sequence.cmp(&b.sequence))
}

/// Put events that are already in commit order into `sort_by` order.
fn order<T: AsRef<CommittedEvent>>(events: &mut [T], sort_by: SortBy, representation: TimeRepresentation) {
    match sort_by {
        SortBy::NaturalAsc => {}
        SortBy::NaturalDesc => events.reverse(),
        SortBy::TimeAsc => events.sort_by(|a, b| by_time(a.as_ref(), b.as_ref(), representation)),
        SortBy::TimeDesc => events.sort_by(|a, b| by_time(b.as_ref(), a.as_ref(), representation)),
    }
}

/// Read one stream from a snapshot. `version` counts the whole stream regardless
/// of paging.
pub(crate) fn read_stream(
    log: &EventLog,
    stream_id: &str,
    options: &ReadOptions,
    representation: TimeRepresentation,
) -> EventStream {
    let mut events: Vec<&Arc<CommittedEvent>> = log.stream_events(stream_id).collect();
    order(&mut events, options.sort_by, representation);
    EventStream {
        id: stream_id.to_string(),
        version: log.version(stream_id),
        events: events
            .into_iter()
            .skip(options.skip)
            .take(options.limit)
            .map(|e| e.envelope.clone())
            .collect(),
    }
}

enum Cursor {
    Natural {
        log: Arc<EventLog>,
        filter: CompiledFilter,
        front: u64,
        back: u64,
        descending: bool,
    },
    Sorted(std::vec::IntoIter<Arc<CommittedEvent>>),
}

impl Cursor {
    fn next_match(&mut self) -> Option<Arc<CommittedEvent>> {
        match self {
            Cursor::Sorted(events) => events.next(),
            Cursor::Natural {
                log,
                filter,
                front,
                back,
                descending,
            } => {
                while front < back {
                    let sequence = if *descending {
                        *back -= 1;
                        *back
                    } else {
                        *front += 1;
                        *front - 1
                    };
                    if let Some(event) = log.get(sequence)
                        && filter.matches(event)
                    {
                        return Some(Arc::clone(event));
                    }
                }
                None
            }
        }
    }
}

/// Lazy query results over one snapshot.
///
/// Writes committed after the query was opened are not visible to it.
pub struct EventQuery {
    cursor: Cursor,
    skip: usize,
    remaining: usize,
}

impl EventQuery {
    pub(crate) fn new(
        log: Arc<EventLog>,
        filter: &Filter,
        options: &ReadOptions,
        representation: TimeRepresentation,
    ) -> Self {
        let filter = CompiledFilter::compile(filter, representation);
        let cursor = match options.sort_by {
            SortBy::NaturalAsc | SortBy::NaturalDesc => Cursor::Natural {
                front: 0,
                back: log.next_sequence(),
                descending: options.sort_by == SortBy::NaturalDesc,
                log,
                filter,
            },
            SortBy::TimeAsc | SortBy::TimeDesc => {
                let mut matches: Vec<Arc<CommittedEvent>> = log
                    .iter()
                    .filter(|e| filter.matches(e))
                    .cloned()
                    .collect();
                order(&mut matches, options.sort_by, representation);
                Cursor::Sorted(matches.into_iter())
            }
        };
        Self {
            cursor,
            skip: options.skip,
            remaining: options.limit,
        }
    }
}

impl Iterator for EventQuery {
    type Item = types::EventEnvelope;

    fn next(&mut self) -> Option<Self::Item> {
        while self.skip > 0 {
            self.cursor.next_match()?;
            self.skip -= 1;
        }
        if self.remaining == 0 {
            return None;
        }
        let event = self.cursor.next_match()?;
        self.remaining -= 1;
        Some(event.envelope.clone())
    }
}

impl std::fmt::Debug for EventQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQuery")
            .field("skip", &self.skip)
            .field("remaining", &self.remaining)
            .finish_non_exhaustive()
    }
}
