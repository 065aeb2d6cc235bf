//! links.rs
//!
//! Event links and explicit references:
//! - `back_ref` produces exactly one mirrored link
//! - undefined or duplicated `link_ref`s fail the whole operation
//! - `by_uuid` links to committed events, and what happens when the target
//!   is erased later
//! - a plan made stale by a concurrent link to an event it deletes is
//!   refused at commit
//! - explicit reference groups and links

mod common;

use serde_json::{json, Value as Json};

use common::*;
use orbitline_core::errors::{ErrorKind, StatusCode};
use orbitline_core::model::{ErLinkRecord, EventLinkRecord};
use orbitline_core::pipeline::parse::split_payload;
use orbitline_core::pipeline::{OperationState, Pipeline, PipelineContext, PipelineData};
use orbitline_core::policy::ApplyPlan;
use orbitline_core::query::{ExplicitRefField, Filter, LinkField};
use orbitline_core::timestamp::normalize;
use orbitline_store::Engine;

fn link(target: &str, mode: &str, name: &str, back_ref: Option<&str>) -> Json {
    let mut l = json!({"link": target, "link_mode": mode, "name": name});
    if let Some(b) = back_ref {
        l["back_ref"] = json!(b);
    }
    l
}

/// Validate and plan `payload` against the current store without committing.
fn plan_now(engine: &Engine, payload: Json) -> ApplyPlan {
    let now = normalize(time::OffsetDateTime::now_utc());
    let entry = split_payload(payload).unwrap().remove(0);
    let mut ctx = PipelineContext::new(engine.config(), now);
    let op = Pipeline::validation()
        .run(&mut ctx, PipelineData::Submitted(Box::new(entry.result.unwrap())))
        .and_then(PipelineData::into_validated)
        .unwrap();

    let session = engine.session().unwrap();
    let mut ctx = PipelineContext::new(engine.config(), now).with_state(&session);
    Pipeline::planning()
        .run(&mut ctx, PipelineData::Validated(Box::new(op)))
        .and_then(PipelineData::into_plan)
        .unwrap()
}

fn all_links(h: &Harness) -> Vec<EventLinkRecord> {
    h.engine.session().unwrap().get_event_links(&[]).unwrap()
}

#[test]
fn back_ref_is_mirrored_exactly_once() {
    let h = harness();
    let mut acquisition = event("ACQUISITION", "INSERT", 0, 4);
    acquisition["link_ref"] = json!("ACQ");
    let mut gap = event("PLAYBACK_GAP", "INSERT", 1, 2);
    gap["links"] = json!([link("ACQ", "by_ref", "ACQUISITION", Some("GAP"))]);

    let report = h.engine.ingest_value(op("SIG", "A.xml", 0, 0, vec![acquisition, gap]));
    assert!(report.is_ok(), "{report:?}");
    assert_eq!(report.outcomes[0].stats.links, 2);

    let acq = &visible(&h.engine, "ACQUISITION")[0];
    let gap = &visible(&h.engine, "PLAYBACK_GAP")[0];
    let links = all_links(&h);
    assert_eq!(links.len(), 2);
    let forward: Vec<_> = links
        .iter()
        .filter(|l| l.from == gap.id && l.to == acq.id && l.name == "ACQUISITION")
        .collect();
    let mirror: Vec<_> = links
        .iter()
        .filter(|l| l.from == acq.id && l.to == gap.id && l.name == "GAP")
        .collect();
    assert_eq!(forward.len(), 1);
    assert!(!forward[0].synthesized);
    assert_eq!(mirror.len(), 1);
    assert!(mirror[0].synthesized);
}

#[test]
fn undefined_link_ref_fails_the_whole_operation() {
    let h = harness();
    let mut e = event("G", "INSERT", 0, 1);
    e["links"] = json!([link("NOWHERE", "by_ref", "PARENT", None)]);
    let report = h
        .engine
        .ingest_value(op("SIG", "A.xml", 0, 0, vec![event("G", "INSERT", 2, 3), e]));

    let outcome = &report.outcomes[0];
    assert_eq!(outcome.status, StatusCode::UndefinedEventLink);
    assert_eq!(outcome.state, OperationState::Failed);
    assert!(visible(&h.engine, "G").is_empty());
    assert!(all_links(&h).is_empty());
}

#[test]
fn duplicated_link_ref_is_rejected() {
    let h = harness();
    let mut a = event("G", "INSERT", 0, 1);
    a["link_ref"] = json!("X");
    let mut b = event("G", "INSERT", 1, 2);
    b["link_ref"] = json!("X");
    let report = h.engine.ingest_value(op("SIG", "A.xml", 0, 0, vec![a, b]));
    assert_eq!(report.outcomes[0].status, StatusCode::DuplicatedEventLinkRef);
}

#[test]
fn uuid_links_reach_committed_events() {
    let h = harness();
    assert!(h
        .engine
        .ingest_value(op("PLAN", "NPPF.xml", 0, 0, vec![event("PLANNED_PLAYBACK", "INSERT", 0, 4)]))
        .is_ok());
    let planned = visible(&h.engine, "PLANNED_PLAYBACK")[0].id;

    let mut playback = event("PLAYBACK", "INSERT", 0, 4);
    playback["links"] = json!([link(&planned.to_string(), "by_uuid", "PLANNED_PLAYBACK", Some("PLAYBACK"))]);
    assert!(h.engine.ingest_value(op("REP", "REP.xml", 0, 1, vec![playback])).is_ok());
    let produced = visible(&h.engine, "PLAYBACK")[0].id;

    let session = h.engine.session().unwrap();
    let incoming = session
        .get_event_links(&[Filter::equals(LinkField::To, planned)])
        .unwrap();
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0].from, produced);
    let outgoing = session
        .get_event_links(&[Filter::equals(LinkField::From, planned)])
        .unwrap();
    assert_eq!(outgoing.len(), 1);
    assert_eq!(outgoing[0].name, "PLAYBACK");
}

#[test]
fn uuid_link_to_unknown_event_is_inconsistent() {
    let h = harness();
    let mut e = event("G", "INSERT", 0, 1);
    e["links"] = json!([link(&uuid::Uuid::new_v4().to_string(), "by_uuid", "PLANNED", None)]);
    let report = h.engine.ingest_value(op("SIG", "A.xml", 0, 0, vec![e]));
    assert_eq!(report.outcomes[0].status, StatusCode::LinksInconsistency);
}

#[test]
fn erasing_a_declared_link_target_is_refused() {
    let h = harness();
    assert!(h
        .engine
        .ingest_value(op("SIG", "A.xml", 0, 0, vec![keyed("ORBIT", "EVENT_KEYS", "K", 0, 1)]))
        .is_ok());
    let target = visible(&h.engine, "ORBIT")[0].id;

    let mut dependent = event("OTHER", "INSERT", 0, 1);
    dependent["links"] = json!([link(&target.to_string(), "by_uuid", "DEPENDS_ON", None)]);
    assert!(h.engine.ingest_value(op("SIG", "B.xml", 0, 0, vec![dependent])).is_ok());

    let report = h
        .engine
        .ingest_value(op("SIG", "C.xml", 0, 5, vec![keyed("ORBIT", "EVENT_KEYS", "K", 0, 1)]));
    assert_eq!(report.outcomes[0].status, StatusCode::LinksInconsistency);
    assert_eq!(visible(&h.engine, "ORBIT")[0].id, target);
    assert_eq!(all_links(&h).len(), 1);
}

#[test]
fn stale_plan_does_not_drop_a_link_committed_meanwhile() {
    let h = harness();
    assert!(h
        .engine
        .ingest_value(op("SIG", "A.xml", 1, 0, vec![event("G", PER_EVENT, 0, 4)]))
        .is_ok());
    let target = visible(&h.engine, "G")[0].id;

    // The stronger source plans to erase the event before anything links to it.
    let stronger = op("SIG", "B.xml", 9, 0, vec![event("G", PER_EVENT, 0, 4)]);
    let stale = plan_now(&h.engine, stronger.clone());
    assert!(stale.delete_events.contains(&target));
    assert!(stale.observed_links.is_empty());

    // Another gauge links to it in between.
    let mut dependent = event("H", "INSERT", 0, 1);
    dependent["links"] = json!([link(&target.to_string(), "by_uuid", "DEPENDS_ON", None)]);
    assert!(h.engine.ingest_value(op("OTHER", "C.xml", 0, 0, vec![dependent])).is_ok());

    let err = h.engine.session().unwrap().commit_plan(&stale).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);
    assert!(err.is_retryable());
    assert_eq!(visible(&h.engine, "G")[0].id, target);
    assert_eq!(all_links(&h).len(), 1);

    // Planning again sees the link and refuses the erasure.
    let report = h.engine.ingest_value(stronger);
    assert_eq!(report.outcomes[0].status, StatusCode::LinksInconsistency);
    assert_eq!(all_links(&h).len(), 1);
}

#[test]
fn clipped_event_keeps_its_links_on_every_piece() {
    let h = harness();
    let mut planned = event("PLANNED", "INSERT", 0, 1);
    planned["link_ref"] = json!("P");
    let mut validity = event("VALIDITY", PER_EVENT, 0, 6);
    validity["links"] = json!([link("P", "by_ref", "PLANNED", Some("VALIDITY"))]);
    assert!(h
        .engine
        .ingest_value(op("SIG", "A.xml", 1, 0, vec![planned, validity]))
        .is_ok());
    assert!(h
        .engine
        .ingest_value(op("SIG", "B.xml", 9, 0, vec![event("VALIDITY", PER_EVENT, 2, 4)]))
        .is_ok());

    let planned_id = visible(&h.engine, "PLANNED")[0].id;
    let pieces: Vec<_> = visible(&h.engine, "VALIDITY")
        .into_iter()
        .filter(|e| e.span != span(2, 4))
        .collect();
    assert_eq!(spans(&pieces), vec![span(0, 2), span(4, 6)]);

    let links = all_links(&h);
    for piece in &pieces {
        assert!(links
            .iter()
            .any(|l| l.from == piece.id && l.to == planned_id && l.name == "PLANNED"));
        assert!(links
            .iter()
            .any(|l| l.from == planned_id && l.to == piece.id && l.name == "VALIDITY" && l.synthesized));
    }
    assert_eq!(links.len(), 4);
}

#[test]
fn explicit_references_carry_groups_and_links() {
    let h = harness();
    let mut payload = op("SIG", "A.xml", 0, 0, vec![]);
    payload["source"]["validity_start"] = json!(ts(0));
    payload["source"]["validity_stop"] = json!(ts(1));
    payload["explicit_references"] = json!([
        {"name": "DS_1", "group": "DATASTRIPS", "links": [{"name": "GR_1", "link": "GRANULE", "back_ref": "DATASTRIP"}]},
        {"name": "GR_2", "group": "GRANULES"}
    ]);
    assert!(h.engine.ingest_value(payload).is_ok());

    let session = h.engine.session().unwrap();
    let refs = session.get_explicit_refs(&[]).unwrap();
    let names: Vec<_> = refs.iter().map(|r| (r.name.as_str(), r.group.as_deref())).collect();
    assert_eq!(
        names,
        vec![("DS_1", Some("DATASTRIPS")), ("GR_1", None), ("GR_2", Some("GRANULES"))]
    );

    assert_eq!(
        session.get_explicit_ref_links("DS_1").unwrap(),
        vec![
            ErLinkRecord { from: "DS_1".into(), to: "GR_1".into(), name: "GRANULE".into() },
            ErLinkRecord { from: "GR_1".into(), to: "DS_1".into(), name: "DATASTRIP".into() },
        ]
    );
    let linked = session.get_linked_explicit_refs("GR_1", Some("DATASTRIP")).unwrap();
    assert_eq!(linked.len(), 1);
    assert_eq!(linked[0].name, "DS_1");

    // A later declaration updates the group; silence keeps it.
    let mut regroup = op("SIG", "B.xml", 0, 0, vec![]);
    regroup["source"]["validity_start"] = json!(ts(0));
    regroup["source"]["validity_stop"] = json!(ts(1));
    regroup["explicit_references"] = json!([{"name": "GR_1", "group": "GRANULES"}, {"name": "DS_1"}]);
    assert!(h.engine.ingest_value(regroup).is_ok());
    let grouped = session
        .get_explicit_refs(&[Filter::equals(ExplicitRefField::Group, "GRANULES")])
        .unwrap();
    let names: Vec<_> = grouped.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["GR_1", "GR_2"]);
    assert_eq!(
        session
            .get_explicit_refs(&[Filter::equals(ExplicitRefField::Name, "DS_1")])
            .unwrap()[0]
            .group
            .as_deref(),
        Some("DATASTRIPS")
    );
}
