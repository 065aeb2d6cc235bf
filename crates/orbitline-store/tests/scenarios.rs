//! scenarios.rs
//!
//! End-to-end ground-segment scenarios:
//! - a transmission report with two gaps inside one acquisition window
//! - planned imaging turning from MISSING to partly COMPLETE once
//!   processing arrives, through the derived completeness generators

mod common;

use serde_json::json;

use common::*;
use orbitline_core::completeness::{
    coverage_status, gap_segments, CoverageCompleteness, CoverageStatus, PlannedMissingCompleteness,
};
use orbitline_core::defaults::PLANNED_EVENT_LINK;
use orbitline_core::model::{GaugeKey, NamedValue, Value, ValueKind};
use orbitline_core::timestamp::format_timestamp;
use orbitline_core::query::{EventField, EventQuery, FilterOp, ValueFilter};
use orbitline_store::{Engine, LinkQuery, StoreConfig};

#[test]
fn gap_report_marks_the_acquisition_incomplete() {
    let h = harness();
    let window = span(0, 10);
    let received = [span(0, 2), span(3, 6), span(7, 10)];
    let gaps = gap_segments(window, &received);
    let status = coverage_status(window, &gaps);
    assert_eq!(status, CoverageStatus::Incomplete);

    let mut acquisition = event("ACQUISITION", "INSERT", 0, 10);
    acquisition["link_ref"] = json!("ACQ");
    acquisition["values"] = json!([text("status", status.as_str())]);
    let mut events = vec![acquisition];
    for (gap, gauge) in gaps.iter().zip(["PROCESSING_GAP", "PLAYBACK_GAP"]) {
        events.push(json!({
            "gauge": {"name": gauge, "system": "S2A", "insertion_type": "INSERT"},
            "start": format_timestamp(gap.start),
            "stop": format_timestamp(gap.stop),
            "links": [{"link": "ACQ", "link_mode": "by_ref", "name": "ACQUISITION", "back_ref": "GAP"}]
        }));
    }
    let report = h.engine.ingest_value(op("REP_PASS", "REP_PASS_1.xml", 0, 0, events));
    assert!(report.is_ok(), "{report:?}");

    let session = h.engine.session().unwrap();
    let incomplete = EventQuery::new().value(ValueFilter::new(
        "status",
        ValueKind::Text,
        FilterOp::Eq,
        "INCOMPLETE",
    ));
    let acquisitions = session.get_events(&incomplete).unwrap();
    assert_eq!(acquisitions.len(), 1);
    assert_eq!(acquisitions[0].gauge.name, "ACQUISITION");

    let prime = EventQuery::new().filter(EventField::GaugeName, FilterOp::Eq, "ACQUISITION");
    let linked = session
        .get_linked_events(&LinkQuery::new(prime).link_name("GAP"))
        .unwrap();
    assert_eq!(linked.prime_events.len(), 1);
    let gauges: Vec<_> = linked.linked_events.iter().map(|e| e.gauge.name.as_str()).collect();
    assert_eq!(gauges, vec!["PROCESSING_GAP", "PLAYBACK_GAP"]);

    let gap_spans = spans(&linked.linked_events);
    assert_eq!(gap_spans, vec![span(2, 3), span(6, 7)]);
    assert!(gap_spans[0].stop <= gap_spans[1].start);
    assert!(gap_spans.iter().all(|g| window.contains(g)));
}

fn completeness_engine() -> (tempfile::TempDir, Engine) {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(StoreConfig::local_dev(dir.path()))
        .unwrap()
        .with_derived(Box::new(PlannedMissingCompleteness {
            planned_gauge: GaugeKey::new("PLANNED_IMAGING", "S2A"),
            completeness_gauge: GaugeKey::new("IMAGING_COMPLETENESS", "S2A"),
            priority: 10,
        }))
        .with_derived(Box::new(CoverageCompleteness {
            produced_gauge: GaugeKey::new("PROCESSING_VALIDITY", "S2A"),
            planned_gauge: GaugeKey::new("PLANNED_IMAGING", "S2A"),
            completeness_gauge: GaugeKey::new("IMAGING_COMPLETENESS", "S2A"),
            priority: 20,
        }));
    (dir, engine)
}

fn status_of(engine: &Engine, id: uuid::Uuid) -> String {
    let values = engine.session().unwrap().get_event_values(id).unwrap();
    match values.iter().find(|v| v.name == "status") {
        Some(NamedValue { value: Value::Text(s), .. }) => s.clone(),
        other => panic!("no status value: {other:?}"),
    }
}

#[test]
fn planned_interval_goes_from_missing_to_partly_complete() {
    let (_dir, engine) = completeness_engine();

    let plan = engine.ingest_value(op("NPPF", "NPPF_1.xml", 0, 0, vec![event("PLANNED_IMAGING", "INSERT", 0, 10)]));
    assert!(plan.is_ok(), "{plan:?}");
    let derived: Vec<_> = plan.outcomes.iter().filter_map(|o| o.derived_by.as_deref()).collect();
    assert_eq!(derived, vec!["planned_missing_completeness"]);

    let planned = visible(&engine, "PLANNED_IMAGING")[0].clone();
    let missing = visible(&engine, "IMAGING_COMPLETENESS");
    assert_eq!(spans(&missing), vec![span(0, 10)]);
    assert_eq!(status_of(&engine, missing[0].id), "MISSING");

    let processing = engine.ingest_value(op(
        "PROCESSING",
        "DS_1.xml",
        0,
        1,
        vec![event("PROCESSING_VALIDITY", PER_EVENT, 2, 5)],
    ));
    assert!(processing.is_ok(), "{processing:?}");
    assert_eq!(processing.primary().count(), 1);

    let completeness = visible(&engine, "IMAGING_COMPLETENESS");
    let timeline: Vec<_> = completeness
        .iter()
        .map(|e| (e.span, status_of(&engine, e.id)))
        .collect();
    assert_eq!(
        timeline,
        vec![
            (span(0, 2), "MISSING".to_string()),
            (span(2, 5), "COMPLETE".to_string()),
            (span(5, 10), "MISSING".to_string()),
        ]
    );

    // Every piece still points at the planned event, and back.
    let session = engine.session().unwrap();
    let prime = EventQuery::new().filter(EventField::Id, FilterOp::Eq, planned.id);
    let linking = session
        .get_linking_events(&LinkQuery::new(prime.clone()).link_name(PLANNED_EVENT_LINK))
        .unwrap();
    assert_eq!(spans(&linking.linking_events), spans(&completeness));

    let grouped = session
        .get_linking_events_group_by_link_name(&LinkQuery::new(prime).without_prime_events())
        .unwrap();
    assert!(grouped.prime_events.is_empty());
    assert_eq!(grouped.linking_events[PLANNED_EVENT_LINK].len(), 3);
}
