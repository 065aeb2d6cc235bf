//! policies.rs
//!
//! Insertion policies against a real database:
//! - EVENT_KEYS keeps the strongest version whatever the arrival order
//! - per-event replacement tiles the gauge by precedence
//! - equal precedence goes to the later write
//! - validity-window replacement and the `insert_and_erase` mode
//! - annotation replacement per (explicit reference, gauge)

mod common;

use std::collections::HashMap;

use serde_json::{json, Value as Json};
use uuid::Uuid;

use common::*;
use orbitline_core::model::{NamedValue, Value};
use orbitline_core::query::{AnnotationField, Filter};
use orbitline_store::Engine;

fn with_validity(mut op: Json, start: i64, stop: i64) -> Json {
    op["source"]["validity_start"] = json!(ts(start));
    op["source"]["validity_stop"] = json!(ts(stop));
    op
}

fn committed_source(engine: &Engine, payload: Json) -> Uuid {
    let report = engine.ingest_value(payload);
    assert!(report.is_ok(), "{report:?}");
    report.outcomes[0].source_id.unwrap()
}

fn priority_by_source(engine: &Engine) -> HashMap<Uuid, i64> {
    engine
        .session()
        .unwrap()
        .get_sources(&[])
        .unwrap()
        .into_iter()
        .map(|s| (s.id, s.priority))
        .collect()
}

#[test]
fn event_keys_keep_the_higher_priority_version_in_either_order() {
    let weak = op("SIG", "A.xml", 10, 0, vec![keyed("ORBIT", "EVENT_KEYS", "ORB_1", 0, 2)]);
    let strong = op("SIG", "B.xml", 30, 0, vec![keyed("ORBIT", "EVENT_KEYS", "ORB_1", 1, 3)]);

    for order in [[&weak, &strong], [&strong, &weak]] {
        let h = harness();
        let mut ids = Vec::new();
        for payload in order {
            ids.push(committed_source(&h.engine, (*payload).clone()));
        }
        let strong_id = if std::ptr::eq(order[0], &strong) { ids[0] } else { ids[1] };

        let events = visible(&h.engine, "ORBIT");
        assert_eq!(events.len(), 1, "{events:?}");
        assert_eq!(events[0].source_id, strong_id);
        assert_eq!(events[0].span, span(1, 3));
    }
}

#[test]
fn event_keys_tie_goes_to_the_later_write() {
    let h = harness();
    committed_source(&h.engine, op("SIG", "A.xml", 5, 0, vec![keyed("ORBIT", "EVENT_KEYS", "ORB_1", 0, 2)]));
    let later = committed_source(
        &h.engine,
        op("SIG", "B.xml", 5, 0, vec![keyed("ORBIT", "EVENT_KEYS", "ORB_1", 1, 3)]),
    );

    let events = visible(&h.engine, "ORBIT");
    assert_eq!(events.len(), 1, "{events:?}");
    assert_eq!(events[0].source_id, later);
    assert_eq!(events[0].span, span(1, 3));
}

#[test]
fn simple_update_replaces_by_gauge_and_key() {
    let h = harness();
    committed_source(&h.engine, op("SIG", "A.xml", 0, 0, vec![keyed("STATE", "SIMPLE_UPDATE", "K", 0, 1)]));
    committed_source(&h.engine, op("OTHER", "B.xml", 0, 1, vec![keyed("STATE", "SIMPLE_UPDATE", "K", 2, 3)]));
    committed_source(&h.engine, op("SIG", "C.xml", 0, 2, vec![keyed("STATE", "SIMPLE_UPDATE", "J", 4, 5)]));

    assert_eq!(spans(&visible(&h.engine, "STATE")), vec![span(2, 3), span(4, 5)]);
}

#[test]
fn per_event_policy_tiles_the_gauge_in_any_order() {
    let ops = [
        op("SIG", "P1.xml", 1, 0, vec![event("VALIDITY", PER_EVENT, 0, 4)]),
        op("SIG", "P2.xml", 2, 0, vec![event("VALIDITY", PER_EVENT, 2, 6)]),
        op("SIG", "P3.xml", 3, 0, vec![event("VALIDITY", PER_EVENT, 5, 9)]),
    ];
    let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];

    for order in orders {
        let h = harness();
        for i in order {
            committed_source(&h.engine, ops[i].clone());
        }
        let priorities = priority_by_source(&h.engine);
        let events = visible(&h.engine, "VALIDITY");

        let mut tiles: Vec<(time::OffsetDateTime, time::OffsetDateTime, i64)> = Vec::new();
        for e in &events {
            let p = priorities[&e.source_id];
            match tiles.last_mut() {
                Some(last) if last.1 == e.span.start && last.2 == p => last.1 = e.span.stop,
                Some(last) => {
                    assert!(last.1 <= e.span.start, "overlap in order {order:?}: {events:?}");
                    tiles.push((e.span.start, e.span.stop, p));
                }
                None => tiles.push((e.span.start, e.span.stop, p)),
            }
        }
        assert_eq!(
            tiles,
            vec![(at(0), at(2), 1), (at(2), at(5), 2), (at(5), at(9), 3)],
            "order {order:?}"
        );
    }
}

#[test]
fn higher_priority_source_supersedes_the_overlap_only() {
    let h = harness();
    let mut first = event("PROCESSING_VALIDITY", PER_EVENT, 0, 6);
    first["values"] = json!([text("datastrip", "DS_1")]);
    let a = committed_source(&h.engine, op("SIG", "A.xml", 10, 0, vec![first]));
    let b = committed_source(
        &h.engine,
        op("SIG", "B.xml", 30, 0, vec![event("PROCESSING_VALIDITY", PER_EVENT, 4, 10)]),
    );

    let events = visible(&h.engine, "PROCESSING_VALIDITY");
    let owned: Vec<_> = events.iter().map(|e| (e.span, e.source_id)).collect();
    assert_eq!(owned, vec![(span(0, 4), a), (span(4, 10), b)]);

    // The remainder keeps the values of the event it was cut from.
    let values = h.engine.session().unwrap().get_event_values(events[0].id).unwrap();
    assert_eq!(values, vec![NamedValue::new("datastrip", Value::Text("DS_1".into()))]);
}

#[test]
fn weaker_newcomer_fills_only_the_uncovered_parts() {
    let h = harness();
    committed_source(&h.engine, op("SIG", "B.xml", 30, 0, vec![event("G", PER_EVENT, 2, 4)]));
    let report = h.engine.ingest_value(op("SIG", "A.xml", 10, 0, vec![event("G", PER_EVENT, 0, 6)]));
    assert!(report.is_ok());
    assert_eq!(report.outcomes[0].stats.clipped, 1);
    assert_eq!(report.outcomes[0].stats.inserted, 2);
    assert_eq!(spans(&visible(&h.engine, "G")), vec![span(0, 2), span(2, 4), span(4, 6)]);
}

#[test]
fn equal_precedence_goes_to_the_later_write() {
    let h = harness();
    let a = committed_source(&h.engine, op("SIG", "A.xml", 5, 0, vec![event("G", PER_EVENT, 0, 4)]));
    let b = committed_source(&h.engine, op("SIG", "B.xml", 5, 0, vec![event("G", PER_EVENT, 2, 6)]));

    let owned: Vec<_> = visible(&h.engine, "G").iter().map(|e| (e.span, e.source_id)).collect();
    assert_eq!(owned, vec![(span(0, 2), a), (span(2, 6), b)]);
}

#[test]
fn generation_time_breaks_priority_ties() {
    let h = harness();
    let newer = committed_source(&h.engine, op("SIG", "NEW.xml", 5, 10, vec![event("G", PER_EVENT, 0, 4)]));
    committed_source(&h.engine, op("SIG", "OLD.xml", 5, 1, vec![event("G", PER_EVENT, 0, 4)]));

    let events = visible(&h.engine, "G");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].source_id, newer);
}

#[test]
fn validity_window_policy_clears_weaker_sources_inside_the_window() {
    let h = harness();
    let policy = "INSERT_and_ERASE_with_PRIORITY";
    committed_source(
        &h.engine,
        with_validity(op("SIG", "A.xml", 10, 0, vec![event("W", policy, 1, 2), event("W", policy, 5, 6)]), 0, 10),
    );
    committed_source(
        &h.engine,
        with_validity(op("SIG", "B.xml", 20, 0, vec![event("W", policy, 4, 5)]), 4, 8),
    );
    assert_eq!(spans(&visible(&h.engine, "W")), vec![span(1, 2), span(4, 5)]);

    // Weaker than both windows: nothing of it survives.
    let report = h
        .engine
        .ingest_value(with_validity(op("SIG", "C.xml", 5, 0, vec![event("W", policy, 7, 9)]), 0, 10));
    assert!(report.is_ok());
    assert_eq!(report.outcomes[0].stats.discarded, 1);
    assert_eq!(spans(&visible(&h.engine, "W")), vec![span(1, 2), span(4, 5)]);
}

#[test]
fn insert_and_erase_mode_clears_the_signature_window() {
    let h = harness();
    let a = committed_source(
        &h.engine,
        op("SIG", "A.xml", 0, 0, vec![event("G1", "INSERT", 0, 10), event("G2", "INSERT", 2, 3)]),
    );
    let mut replacement = with_validity(op("SIG", "B.xml", 10, 1, vec![event("G1", "INSERT", 4, 6)]), 4, 6);
    replacement["mode"] = json!("insert_and_erase");
    let b = committed_source(&h.engine, replacement);

    let g1: Vec<_> = visible(&h.engine, "G1").iter().map(|e| (e.span, e.source_id)).collect();
    assert_eq!(g1, vec![(span(0, 4), a), (span(4, 6), b), (span(6, 10), a)]);
    assert_eq!(spans(&visible(&h.engine, "G2")), vec![span(2, 3)]);
}

#[test]
fn annotations_keep_the_strongest_source() {
    let h = harness();
    let annotation = |value: &str| {
        json!([{
            "explicit_reference": "DS_1",
            "annotation_cnf": {"name": "FOOTPRINT", "system": "S2A"},
            "values": [text("footprint", value)]
        }])
    };
    let mut a = with_validity(op("SIG", "A.xml", 10, 0, vec![]), 0, 1);
    a["annotations"] = annotation("a");
    let mut weak = with_validity(op("SIG", "W.xml", 5, 0, vec![]), 0, 1);
    weak["annotations"] = annotation("weak");
    let mut strong = with_validity(op("SIG", "S.xml", 20, 0, vec![]), 0, 1);
    strong["annotations"] = annotation("strong");

    committed_source(&h.engine, a);
    let report = h.engine.ingest_value(weak);
    assert_eq!(report.outcomes[0].stats.annotations_discarded, 1);
    let strong_id = committed_source(&h.engine, strong);

    let session = h.engine.session().unwrap();
    let found = session
        .get_annotations(&[Filter::equals(AnnotationField::ExplicitRef, "DS_1")])
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].source_id, strong_id);
    assert_eq!(
        session.get_annotation_values(found[0].id).unwrap(),
        vec![NamedValue::text("footprint", "strong")]
    );
}
