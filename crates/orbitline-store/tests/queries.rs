//! queries.rs
//!
//! Query surface over committed data:
//! - column filters with every operator family
//! - value filters per value kind
//! - overlap windows, ordering and limits
//! - source and gauge listings
//! - malformed filters are rejected before touching the database

mod common;

use assert_matches::assert_matches;
use serde_json::json;

use common::*;
use orbitline_core::errors::ErrorKind;
use orbitline_core::model::{GaugeKind, ValueKind};
use orbitline_core::query::{EventField, EventQuery, Filter, FilterOp, SourceField, ValueFilter};

fn seeded() -> Harness {
    let h = harness();
    let mut pass_a = event("PASS", "INSERT", 0, 2);
    pass_a["explicit_reference"] = json!("ORB_100");
    pass_a["values"] = json!([
        {"name": "elevation", "type": "double", "value": 12.5},
        {"name": "nominal", "type": "boolean", "value": "true"},
        text("station", "SVALBARD")
    ]);
    let mut pass_b = event("PASS", "INSERT", 4, 6);
    pass_b["explicit_reference"] = json!("ORB_101");
    pass_b["values"] = json!([
        {"name": "elevation", "type": "double", "value": "40"},
        {"name": "nominal", "type": "boolean", "value": false},
        text("station", "MATERA")
    ]);
    let mut annotated = op("SIG", "A.xml", 3, 0, vec![pass_a, pass_b, event("ECLIPSE", "INSERT", 1, 5)]);
    annotated["annotations"] = json!([{
        "explicit_reference": "ORB_100",
        "annotation_cnf": {"name": "FOOTPRINT", "system": "S2A"},
        "values": [text("footprint", "POLYGON")]
    }]);
    assert!(h.engine.ingest_value(annotated).is_ok());
    assert!(h
        .engine
        .ingest_value(op("OTHER", "B.xml", 7, 1, vec![event("PASS", "INSERT", 8, 9)]))
        .is_ok());
    h
}

fn gauges_of(q: &EventQuery, h: &Harness) -> Vec<String> {
    h.engine
        .session()
        .unwrap()
        .get_events(q)
        .unwrap()
        .into_iter()
        .map(|e| format!("{}:{}", e.gauge.name, e.span.start.hour()))
        .collect()
}

#[test]
fn column_filters_cover_each_operator() {
    let h = seeded();

    let eq = EventQuery::new().filter(EventField::GaugeName, FilterOp::Eq, "PASS");
    assert_eq!(gauges_of(&eq, &h), vec!["PASS:0", "PASS:4", "PASS:8"]);

    let ne = EventQuery::new().filter(EventField::GaugeName, FilterOp::Ne, "PASS");
    assert_eq!(gauges_of(&ne, &h), vec!["ECLIPSE:1"]);

    let like = EventQuery::new().filter(EventField::ExplicitRef, FilterOp::Like, "ORB_10%");
    assert_eq!(gauges_of(&like, &h), vec!["PASS:0", "PASS:4"]);

    let within = EventQuery::new().filter(
        EventField::ExplicitRef,
        FilterOp::In,
        vec!["ORB_101", "ORB_999"],
    );
    assert_eq!(gauges_of(&within, &h), vec!["PASS:4"]);

    let none = EventQuery::new().filter(EventField::GaugeName, FilterOp::In, Vec::<&str>::new());
    assert!(gauges_of(&none, &h).is_empty());

    let later = EventQuery::new().filter(EventField::Start, FilterOp::Ge, at(4));
    assert_eq!(gauges_of(&later, &h), vec!["PASS:4", "PASS:8"]);
}

#[test]
fn overlap_window_and_limit() {
    let h = seeded();
    let window = EventQuery::new().overlapping(at(2), at(4));
    assert_eq!(gauges_of(&window, &h), vec!["ECLIPSE:1"]);

    // Touching endpoints do not overlap.
    let touching = EventQuery::new().overlapping(at(6), at(8));
    assert!(gauges_of(&touching, &h).is_empty());

    let first_two = EventQuery::new().limit(2);
    assert_eq!(gauges_of(&first_two, &h), vec!["PASS:0", "ECLIPSE:1"]);
}

#[test]
fn value_filters_match_by_kind() {
    let h = seeded();

    let high = EventQuery::new().value(ValueFilter::new("elevation", ValueKind::Double, FilterOp::Gt, 20.0));
    assert_eq!(gauges_of(&high, &h), vec!["PASS:4"]);

    let nominal = EventQuery::new().value(ValueFilter::new("nominal", ValueKind::Boolean, FilterOp::Eq, true));
    assert_eq!(gauges_of(&nominal, &h), vec!["PASS:0"]);

    let station = EventQuery::new()
        .filter(EventField::GaugeName, FilterOp::Eq, "PASS")
        .value(ValueFilter::new("station", ValueKind::Text, FilterOp::In, vec!["MATERA", "KIRUNA"]));
    assert_eq!(gauges_of(&station, &h), vec!["PASS:4"]);

    // A value of the right name but another kind never matches.
    let wrong_kind = EventQuery::new().value(ValueFilter::new("station", ValueKind::Double, FilterOp::Ge, 0.0));
    assert!(gauges_of(&wrong_kind, &h).is_empty());
}

#[test]
fn sources_and_gauges_are_listed() {
    let h = seeded();
    let session = h.engine.session().unwrap();

    let strong = session
        .get_sources(&[Filter::new(SourceField::Priority, FilterOp::Gt, 5i64)])
        .unwrap();
    assert_eq!(strong.len(), 1);
    assert_eq!(strong[0].identity.name, "B.xml");
    assert_eq!(strong[0].identity.dim_signature, "OTHER");

    let by_signature = session
        .get_sources(&[Filter::equals(SourceField::DimSignature, "SIG")])
        .unwrap();
    assert_eq!(by_signature.len(), 1);
    // Validity is corrected to cover every event of the operation.
    assert_eq!(by_signature[0].validity, Some(span(0, 6)));

    let events: Vec<_> = session
        .get_gauges(Some(GaugeKind::Event))
        .unwrap()
        .into_iter()
        .map(|g| g.gauge.to_string())
        .collect();
    assert_eq!(events, vec!["ECLIPSE@S2A", "PASS@S2A"]);

    let annotations = session.get_gauges(Some(GaugeKind::Annotation)).unwrap();
    assert_eq!(annotations.len(), 1);
    assert_eq!(annotations[0].gauge.name, "FOOTPRINT");
    assert_eq!(session.get_gauges(None).unwrap().len(), 3);
}

#[test]
fn malformed_filters_are_wrong_values() {
    let h = seeded();
    let session = h.engine.session().unwrap();

    let not_a_list = EventQuery::new().filter(EventField::GaugeName, FilterOp::In, "PASS");
    assert_matches!(session.get_events(&not_a_list), Err(e) if e.kind() == ErrorKind::WrongValue);

    let like_on_time = EventQuery::new().filter(EventField::Start, FilterOp::Like, "2020%");
    assert_matches!(session.get_events(&like_on_time), Err(e) if e.kind() == ErrorKind::WrongValue);

    let geometry = EventQuery::new().value(ValueFilter::new("shape", ValueKind::Geometry, FilterOp::Eq, "x"));
    assert_matches!(session.get_events(&geometry), Err(e) if e.kind() == ErrorKind::WrongValue);
}
