//! Shared helpers for the store integration suites.
//!
//! Every test gets its own throw-away database under a `tempfile` directory.
//! Times are written as hours after 2020-01-01T00:00:00Z.

#![allow(dead_code)]

use serde_json::{json, Value as Json};
use tempfile::TempDir;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

use orbitline_core::model::{EventRecord, Span};
use orbitline_core::query::{EventField, EventQuery, FilterOp};
use orbitline_core::timestamp::format_timestamp;
use orbitline_store::{Engine, StoreConfig};

pub const PER_EVENT: &str = "INSERT_and_ERASE_per_EVENT_with_PRIORITY";

pub struct Harness {
    pub dir: TempDir,
    pub engine: Engine,
}

pub fn harness() -> Harness {
    harness_with(|cfg| cfg)
}

pub fn harness_with(configure: impl FnOnce(StoreConfig) -> StoreConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let cfg = configure(StoreConfig::local_dev(dir.path()));
    let engine = Engine::open(cfg).unwrap();
    Harness { dir, engine }
}

pub fn at(h: i64) -> OffsetDateTime {
    datetime!(2020-01-01 00:00 UTC) + Duration::hours(h)
}

pub fn ts(h: i64) -> String {
    format_timestamp(at(h))
}

pub fn span(a: i64, b: i64) -> Span {
    Span::new(at(a), at(b))
}

/// One operation of signature `signature` from source `name`.
pub fn op(signature: &str, name: &str, priority: i64, generated: i64, events: Vec<Json>) -> Json {
    json!({
        "mode": "insert",
        "dim_signature": {"name": signature, "exec": "ingest_test", "version": "1.0"},
        "source": {
            "name": name,
            "generation_time": ts(generated),
            "reception_time": ts(generated),
            "priority": priority
        },
        "events": events
    })
}

pub fn event(gauge: &str, policy: &str, start: i64, stop: i64) -> Json {
    json!({
        "gauge": {"name": gauge, "system": "S2A", "insertion_type": policy},
        "start": ts(start),
        "stop": ts(stop)
    })
}

pub fn keyed(gauge: &str, policy: &str, key: &str, start: i64, stop: i64) -> Json {
    let mut e = event(gauge, policy, start, stop);
    e["key"] = json!(key);
    e
}

pub fn text(name: &str, value: &str) -> Json {
    json!({"name": name, "type": "text", "value": value})
}

/// Committed events of `gauge` ordered by start.
pub fn visible(engine: &Engine, gauge: &str) -> Vec<EventRecord> {
    let query = EventQuery::new().filter(EventField::GaugeName, FilterOp::Eq, gauge);
    engine.session().unwrap().get_events(&query).unwrap()
}

pub fn spans(events: &[EventRecord]) -> Vec<Span> {
    events.iter().map(|e| e.span).collect()
}
