//! Integration tests for the event store protocol through the public API.
//!
//! Covers conditional writes and their exact failure messages, atomic rejection of
//! duplicate batches, deletion and update semantics, read-skew freedom under
//! concurrent writers, and racing conditional writers on one stream.

use std::sync::{Arc, Barrier};
use std::thread;

use chrono::{TimeZone, Utc};
use eventfold_store::condition::{and, gte, lt, ne};
use eventfold_store::{
    EventEnvelope, EventStore, IdentityScope, ReadOptions, STREAM_ID_EXTENSION, SortBy,
    StoreConfig, WriteCondition,
};

/// Helper: an envelope in the `urn:names` source with a fixed time.
fn name_event(id: &str, event_type: &str) -> EventEnvelope {
    EventEnvelope::new(
        id,
        "urn:names",
        event_type,
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).single().expect("valid time"),
    )
    .with_subject("name")
    .with_data(format!(r#"{{"id":"{id}"}}"#).into_bytes())
}

/// Helper: an envelope with a generated id.
fn fresh_event(event_type: &str) -> EventEnvelope {
    EventEnvelope::new(uuid::Uuid::new_v4().to_string(), "urn:test", event_type, Utc::now())
}

fn ids(events: &[EventEnvelope]) -> Vec<&str> {
    events.iter().map(|e| e.id.as_str()).collect()
}

/// The canonical scenario: define a name, then change it under a version condition.
#[test]
fn name_defined_then_changed_with_version_condition() {
    let store = EventStore::in_memory();
    assert_eq!(store.read("name").version, 0);
    assert!(!store.exists("name"));

    store.write("name", [name_event("1", "NameDefined")]).expect("first write");
    assert_eq!(store.read("name").version, 1);

    let result = store
        .write_conditionally(
            "name",
            WriteCondition::stream_version_eq(1),
            [name_event("2", "NameWasChanged")],
        )
        .expect("condition holds");
    assert_eq!(result.new_version, 2);

    let stream = store.read("name");
    assert_eq!(stream.version, 2);
    let types: Vec<_> = stream.events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, ["NameDefined", "NameWasChanged"]);
    assert!(stream.events.iter().all(|e| e.stream_id() == Some("name")));
}

/// Versions are the sum of batch sizes over sequential unconditional writes.
#[test]
fn version_is_sum_of_batch_sizes() {
    let store = EventStore::in_memory();
    let sizes = [1usize, 3, 2, 5];
    for size in sizes {
        let batch: Vec<_> = (0..size).map(|_| fresh_event("T")).collect();
        store.write("sum", batch).expect("write");
    }
    assert_eq!(store.read("sum").version, sizes.iter().sum::<usize>() as u64);
}

#[test]
fn failed_condition_messages_are_exact() {
    let store = EventStore::in_memory();
    store.write("name", [name_event("1", "NameDefined")]).expect("write");

    let err = store
        .write_conditionally(
            "name",
            WriteCondition::stream_version_eq(10),
            [name_event("2", "NameWasChanged")],
        )
        .expect_err("version is 1");
    assert_eq!(
        err.to_string(),
        "WriteCondition was not fulfilled. Expected version to be equal to 10 but was 1."
    );

    let err = store
        .write_conditionally(
            "name",
            WriteCondition::stream_version(and([gte(0), lt(100), ne(1)])),
            [name_event("2", "NameWasChanged")],
        )
        .expect_err("ne(1) fails");
    assert_eq!(
        err.to_string(),
        "WriteCondition was not fulfilled. Expected version to be greater than or equal to 0 \
         and to be less than 100 and to not be equal to 1 but was 1."
    );
    assert_eq!(store.read("name").version, 1);
}

/// A batch with an internal duplicate, or one colliding with a committed event,
/// commits nothing.
#[test]
fn duplicate_batches_commit_nothing() {
    let store = EventStore::in_memory();
    store.write("name", [name_event("1", "NameDefined")]).expect("write");

    let err = store
        .write("name", [name_event("2", "A"), name_event("2", "B")])
        .expect_err("internal duplicate");
    assert!(matches!(err, eventfold_store::Error::DuplicateEvent { ref event_id, .. } if event_id == "2"));
    assert_eq!(store.read("name").version, 1);

    let err = store
        .write("name", [name_event("3", "A"), name_event("1", "Again")])
        .expect_err("collides with committed");
    assert!(matches!(err, eventfold_store::Error::DuplicateEvent { .. }));
    assert_eq!(store.read("name").version, 1);
    assert!(!store.exists("other"));
}

#[test]
fn identity_scope_controls_cross_stream_duplicates() {
    let global = EventStore::in_memory();
    global.write("a", [name_event("1", "T")]).expect("write");
    assert!(global.write("b", [name_event("1", "T")]).is_err());

    let per_stream = EventStore::with_config(StoreConfig::default().with_identity_scope(IdentityScope::Stream));
    per_stream.write("a", [name_event("1", "T")]).expect("write");
    per_stream.write("b", [name_event("1", "T")]).expect("other stream is fine");
    assert!(per_stream.write("b", [name_event("1", "T")]).is_err());

    // Lookups by (id, source) address the earliest committed event.
    assert!(per_stream.delete_event("1", "urn:names").expect("delete"));
    assert_eq!(per_stream.read("a").version, 0);
    assert_eq!(per_stream.read("b").version, 1);
}

#[test]
fn delete_event_removes_exactly_one() {
    let store = EventStore::in_memory();
    store
        .write("name", [name_event("1", "A"), name_event("2", "B"), name_event("3", "C")])
        .expect("write");

    assert!(store.delete_event("2", "urn:names").expect("delete"));
    let stream = store.read("name");
    assert_eq!(stream.version, 2);
    assert_eq!(ids(&stream.events), ["1", "3"]);

    // Unknown identities are not an error.
    assert!(!store.delete_event("2", "urn:names").expect("gone"));
    assert!(!store.delete_event("1", "urn:elsewhere").expect("other source"));

    // A deleted identity may be written again.
    store.write("name", [name_event("2", "B")]).expect("rewrite");
    assert_eq!(ids(&store.read("name").events), ["1", "3", "2"]);
}

#[test]
fn delete_stream_resets_version_and_existence() {
    let store = EventStore::in_memory();
    store.write("name", [name_event("1", "A"), name_event("2", "B")]).expect("write");
    store.write("other", [name_event("3", "C")]).expect("write");

    store.delete_event_stream("name").expect("delete");
    assert_eq!(store.read("name").version, 0);
    assert!(!store.exists("name"));
    assert!(store.exists("other"));

    store
        .write_conditionally("name", WriteCondition::stream_version_eq(0), [name_event("1", "A")])
        .expect("stream starts over");
}

#[test]
fn identity_update_is_a_no_op() {
    let store = EventStore::in_memory();
    store.write("name", [name_event("1", "A"), name_event("2", "B")]).expect("write");
    let before = store.read("name");

    let returned = store
        .update_event("1", "urn:names", |e| Some(e.clone()))
        .expect("update")
        .expect("found");
    assert_eq!(returned, before.events[0]);
    assert_eq!(store.read("name"), before);
}

#[test]
fn update_replaces_payload_in_place() {
    let store = EventStore::in_memory();
    store.write("name", [name_event("1", "A"), name_event("2", "B")]).expect("write");

    let updated = store
        .update_event("1", "urn:names", |e| Some(e.clone().with_data(&b"redacted"[..])))
        .expect("update")
        .expect("found");
    assert_eq!(&updated.data[..], b"redacted");
    assert_eq!(updated.extensions.get(STREAM_ID_EXTENSION).map(|v| v.to_string()), Some("name".into()));

    let stream = store.read("name");
    assert_eq!(stream.version, 2);
    assert_eq!(ids(&stream.events), ["1", "2"]);
    assert_eq!(stream.events[0], updated);

    let err = store.update_event("1", "urn:names", |_| None).expect_err("null");
    assert_eq!(
        err.to_string(),
        "invalid argument: update function is not allowed to return null"
    );
    assert_eq!(store.update_event("9", "urn:names", |e| Some(e.clone())).expect("ok"), None);
}

#[test]
fn read_pages_after_ordering() {
    let store = EventStore::in_memory();
    let base = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).single().expect("valid");
    let events: Vec<_> = [3i64, 1, 2]
        .iter()
        .enumerate()
        .map(|(i, minutes)| {
            EventEnvelope::new(format!("e{i}"), "urn:t", "T", base + chrono::Duration::minutes(*minutes))
        })
        .collect();
    store.write("s", events).expect("write");

    let page = store.read_with("s", ReadOptions::default().sort_by(SortBy::TimeAsc).skip(1).limit(1));
    assert_eq!(page.version, 3);
    assert_eq!(ids(&page.events), ["e2"]);

    let reversed = store.read_with("s", ReadOptions::default().sort_by(SortBy::NaturalDesc));
    assert_eq!(ids(&reversed.events), ["e2", "e1", "e0"]);
}

/// Readers racing a writer always see a version that matches the events returned.
#[test]
fn reads_are_free_of_read_skew() {
    let store = EventStore::in_memory();
    let writer_store = store.clone();
    let writer = thread::spawn(move || {
        for _ in 0..200 {
            writer_store
                .write("skew", [fresh_event("A"), fresh_event("B")])
                .expect("write");
        }
    });

    for _ in 0..500 {
        let stream = store.read("skew");
        assert_eq!(stream.version, stream.events.len() as u64);
        assert_eq!(stream.version % 2, 0, "batches are never observed half-applied");
    }
    writer.join().expect("writer thread");
    assert_eq!(store.read("skew").version, 400);
}

/// Two writers expecting the same version: exactly one wins, the other sees a
/// condition failure, and no update is lost.
#[test]
fn racing_conditional_writers_have_one_winner() {
    for _ in 0..20 {
        let store = EventStore::in_memory();
        store.write("race", [fresh_event("Init")]).expect("write");

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let store = store.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    store.write_conditionally("race", WriteCondition::stream_version_eq(1), [fresh_event("Next")])
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().expect("thread")).collect();

        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(eventfold_store::Error::WriteConditionNotFulfilled { actual: 2, .. })
        )));
        assert_eq!(store.read("race").version, 2);
    }
}

/// Writers to different streams do not serialize on each other.
#[test]
fn writers_to_different_streams_run_in_parallel() {
    let store = EventStore::in_memory();
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = store.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    store.write(&format!("stream-{i}"), [fresh_event("T")]).expect("write");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread");
    }
    for i in 0..8 {
        assert_eq!(store.read(&format!("stream-{i}")).version, 50);
    }
    assert_eq!(store.all(ReadOptions::default()).count(), 400);
}

/// Read-then-conditionally-write inside one transaction cannot be interleaved.
#[test]
fn transaction_spans_read_and_write() {
    let store = EventStore::in_memory();
    store.write("counter", [fresh_event("Incremented")]).expect("write");

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            thread::spawn(move || {
                for _ in 0..25 {
                    store
                        .transaction("counter", |tx| {
                            let seen = tx.read().version;
                            tx.write_conditionally(
                                WriteCondition::stream_version_eq(seen),
                                [fresh_event("Incremented")],
                            )
                        })
                        .expect("no other writer can interleave");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread");
    }
    assert_eq!(store.read("counter").version, 101);
}
