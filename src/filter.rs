//! Composable predicates over event envelope fields.
//!
//! A [`Filter`] is either `All`, a single field condition, or a conjunction /
//! disjunction of filters. Field conditions are typed: string attributes take a
//! `Condition<String>`, `time` takes a `Condition<DateTime<Utc>>`. Filters are
//! compiled into a concrete predicate by [`crate::query`].

use chrono::{DateTime, Utc};

use crate::condition::{self, Condition};

/// A condition on one envelope field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldFilter {
    Id(Condition<String>),
    Source(Condition<String>),
    Type(Condition<String>),
    Subject(Condition<String>),
    Time(Condition<DateTime<Utc>>),
    /// Evaluated against an absent value when the envelope has no schema.
    Schema(Condition<String>),
    ContentType(Condition<String>),
}

/// A predicate over events.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Filter {
    /// Matches every event.
    #[default]
    All,
    /// Matches events whose field satisfies the condition.
    Field(FieldFilter),
    /// Matches events that every child matches.
    And(Vec<Filter>),
    /// Matches events that at least one child matches.
    Or(Vec<Filter>),
}

impl Filter {
    /// Matches every event.
    pub fn all() -> Self {
        Filter::All
    }

    /// Condition on the event id.
    pub fn id(condition: Condition<String>) -> Self {
        Filter::Field(FieldFilter::Id(condition))
    }

    /// Condition on the event source.
    pub fn source(condition: Condition<String>) -> Self {
        Filter::Field(FieldFilter::Source(condition))
    }

    /// Condition on the event type.
    pub fn event_type(condition: Condition<String>) -> Self {
        Filter::Field(FieldFilter::Type(condition))
    }

    pub fn subject(condition: Condition<String>) -> Self {
        Filter::Field(FieldFilter::Subject(condition))
    }

    /// Condition on the event time, compared in the store's time representation.
    pub fn time(condition: Condition<DateTime<Utc>>) -> Self {
        Filter::Field(FieldFilter::Time(condition))
    }

    pub fn schema(condition: Condition<String>) -> Self {
        Filter::Field(FieldFilter::Schema(condition))
    }

    pub fn content_type(condition: Condition<String>) -> Self {
        Filter::Field(FieldFilter::ContentType(condition))
    }

    /// Shorthand for `Filter::id(eq(id))`.
    pub fn id_eq(id: impl Into<String>) -> Self {
        Filter::id(condition::eq(id.into()))
    }

    /// Shorthand for `Filter::source(eq(source))`.
    pub fn source_eq(source: impl Into<String>) -> Self {
        Filter::source(condition::eq(source.into()))
    }

    /// Shorthand for `Filter::event_type(eq(event_type))`.
    pub fn type_eq(event_type: impl Into<String>) -> Self {
        Filter::event_type(condition::eq(event_type.into()))
    }

    /// Matches the single event identified by `(id, source)`.
    pub fn cloud_event(id: impl Into<String>, source: impl Into<String>) -> Self {
        Filter::id_eq(id).and(Filter::source_eq(source))
    }

    /// Combine with `other` conjunctively.
    ///
    /// Nested conjunctions are flattened and `All` is absorbed, so chains of `and`
    /// stay a single level deep.
    pub fn and(self, other: Filter) -> Filter {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (Filter::And(mut left), Filter::And(right)) => {
                left.extend(right);
                Filter::And(left)
            }
            (Filter::And(mut left), f) => {
                left.push(f);
                Filter::And(left)
            }
            (f, Filter::And(mut right)) => {
                right.insert(0, f);
                Filter::And(right)
            }
            (a, b) => Filter::And(vec![a, b]),
        }
    }

    /// Combine with `other` disjunctively.
    pub fn or(self, other: Filter) -> Filter {
        match (self, other) {
            (Filter::All, _) | (_, Filter::All) => Filter::All,
            (Filter::Or(mut left), Filter::Or(right)) => {
                left.extend(right);
                Filter::Or(left)
            }
            (Filter::Or(mut left), f) => {
                left.push(f);
                Filter::Or(left)
            }
            (f, Filter::Or(mut right)) => {
                right.insert(0, f);
                Filter::Or(right)
            }
            (a, b) => Filter::Or(vec![a, b]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::eq;

    #[test]
    fn and_absorbs_all() {
        let f = Filter::all().and(Filter::id_eq("a"));
        assert_eq!(f, Filter::id_eq("a"));
        let f = Filter::id_eq("a").and(Filter::All);
        assert_eq!(f, Filter::id_eq("a"));
    }

    #[test]
    fn or_with_all_is_all() {
        assert_eq!(Filter::id_eq("a").or(Filter::All), Filter::All);
    }

    #[test]
    fn chained_and_flattens() {
        let f = Filter::id_eq("a")
            .and(Filter::type_eq("T"))
            .and(Filter::source_eq("urn:s"));
        assert_eq!(
            f,
            Filter::And(vec![
                Filter::id_eq("a"),
                Filter::type_eq("T"),
                Filter::source_eq("urn:s"),
            ])
        );
    }

    #[test]
    fn chained_or_flattens() {
        let f = Filter::id_eq("a").or(Filter::id_eq("b")).or(Filter::id_eq("c"));
        assert!(matches!(f, Filter::Or(ref children) if children.len() == 3));
    }

    #[test]
    fn cloud_event_combines_id_and_source() {
        assert_eq!(
            Filter::cloud_event("e-1", "urn:s"),
            Filter::And(vec![Filter::id_eq("e-1"), Filter::source_eq("urn:s")])
        );
    }

    #[test]
    fn constructors_target_fields() {
        assert_eq!(
            Filter::subject(eq("s".to_string())),
            Filter::Field(FieldFilter::Subject(eq("s".to_string())))
        );
        assert_eq!(
            Filter::content_type(eq("application/json".to_string())),
            Filter::Field(FieldFilter::ContentType(eq("application/json".to_string())))
        );
    }
}
