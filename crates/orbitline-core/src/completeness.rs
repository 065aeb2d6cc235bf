//! Completeness analysis.
//!
//! Completeness compares what was planned with what was produced. It is
//! expressed with ordinary events on dedicated gauges using the
//! `INSERT_and_ERASE_per_EVENT_with_PRIORITY` policy:
//! - a low-priority MISSING event covers each planned interval as soon as the
//!   plan is ingested ([`PlannedMissingCompleteness`])
//! - a higher-priority COMPLETE event covers each sub-interval where
//!   production matched the plan ([`CoverageCompleteness`]), clipping the
//!   MISSING event down to the parts still uncovered
//!
//! Generators implement [`DerivedOperation`]. They run after the operation
//! that triggered them is committed and return follow-up operations in the
//! wire format; each one goes through the full pipeline and commits on its
//! own.

use serde::Serialize;
use serde_json::{json, Value};

use crate::defaults::{COMPLETENESS_LINK, PLANNED_EVENT_LINK};
use crate::errors::EngineResult;
use crate::interval::{intersect, merge, Segment};
use crate::model::{GaugeKey, Span};
use crate::policy::{cut, ApplyPlan, CommittedState, EventInsert, EventValues};
use crate::timestamp::format_timestamp;

/// Coverage of a window by received data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoverageStatus {
    Complete,
    Incomplete,
    Missing,
}

impl CoverageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "COMPLETE",
            Self::Incomplete => "INCOMPLETE",
            Self::Missing => "MISSING",
        }
    }
}

/// Parts of `window` not covered by `received`.
pub fn gap_segments(window: Span, received: &[Span]) -> Vec<Span> {
    cut(&[window], received)
}

/// Classify a window from its gaps.
pub fn coverage_status(window: Span, gaps: &[Span]) -> CoverageStatus {
    let uncovered = cut(&[window], &cut(&[window], gaps));
    if uncovered.is_empty() {
        CoverageStatus::Complete
    } else if uncovered.as_slice() == [window] {
        CoverageStatus::Missing
    } else {
        CoverageStatus::Incomplete
    }
}

/// Generator of follow-up operations.
pub trait DerivedOperation {
    fn id(&self) -> &str;

    /// Operations to submit after `plan` was committed. `state` already
    /// contains the committed plan.
    fn derive(&self, plan: &ApplyPlan, state: &dyn CommittedState) -> EngineResult<Vec<Value>>;
}

/// New events of the committing source on `gauge`.
fn own_events<'p>(plan: &'p ApplyPlan, gauge: &'p GaugeKey) -> impl Iterator<Item = &'p EventInsert> + 'p {
    plan.insert_events.iter().filter(move |e| {
        e.source_id == plan.source.id && &e.gauge == gauge && matches!(e.values, EventValues::Inline(_))
    })
}

fn completeness_event(gauge: &GaugeKey, span: Span, planned: uuid::Uuid, values: Vec<Value>) -> Value {
    json!({
        "gauge": {
            "name": gauge.name,
            "system": gauge.system,
            "insertion_type": "INSERT_and_ERASE_per_EVENT_with_PRIORITY"
        },
        "start": format_timestamp(span.start),
        "stop": format_timestamp(span.stop),
        "links": [{
            "link": planned.to_string(),
            "link_mode": "by_uuid",
            "name": PLANNED_EVENT_LINK,
            "back_ref": COMPLETENESS_LINK
        }],
        "values": values
    })
}

fn derived_operation(
    generator: &str,
    plan: &ApplyPlan,
    priority: i64,
    events: Vec<Value>,
) -> Value {
    let source = &plan.source;
    json!({
        "mode": "insert",
        "dim_signature": {
            "name": format!("COMPLETENESS_{}", source.identity.dim_signature),
            "exec": generator,
            "version": source.identity.version
        },
        "source": {
            "name": format!("{}#{}", source.identity.name, generator),
            "generation_time": format_timestamp(source.generation_time),
            "reception_time": format_timestamp(source.reception_time),
            "priority": priority
        },
        "events": events
    })
}

fn text(name: &str, value: &str) -> Value {
    json!({"name": name, "type": "text", "value": value})
}

/// MISSING completeness for every newly planned event.
#[derive(Debug, Clone)]
pub struct PlannedMissingCompleteness {
    pub planned_gauge: GaugeKey,
    pub completeness_gauge: GaugeKey,
    pub priority: i64,
}

impl DerivedOperation for PlannedMissingCompleteness {
    fn id(&self) -> &str {
        "planned_missing_completeness"
    }

    fn derive(&self, plan: &ApplyPlan, _state: &dyn CommittedState) -> EngineResult<Vec<Value>> {
        let events: Vec<Value> = own_events(plan, &self.planned_gauge)
            .map(|planned| {
                completeness_event(
                    &self.completeness_gauge,
                    planned.span,
                    planned.id,
                    vec![text("status", CoverageStatus::Missing.as_str())],
                )
            })
            .collect();
        if events.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![derived_operation(self.id(), plan, self.priority, events)])
    }
}

/// COMPLETE completeness where new production overlaps planned events.
#[derive(Debug, Clone)]
pub struct CoverageCompleteness {
    pub produced_gauge: GaugeKey,
    pub planned_gauge: GaugeKey,
    pub completeness_gauge: GaugeKey,
    pub priority: i64,
}

impl DerivedOperation for CoverageCompleteness {
    fn id(&self) -> &str {
        "coverage_completeness"
    }

    fn derive(&self, plan: &ApplyPlan, state: &dyn CommittedState) -> EngineResult<Vec<Value>> {
        let produced: Vec<Segment<()>> = own_events(plan, &self.produced_gauge)
            .map(|e| Segment::new((), e.span.start, e.span.stop))
            .collect();
        let merged: Vec<Segment<()>> = merge(&produced)
            .into_iter()
            .map(|m| Segment::new((), m.start, m.stop))
            .collect();
        let (Some(first), Some(last)) = (merged.first(), merged.last()) else {
            return Ok(Vec::new());
        };
        let hull = Span::new(first.start, last.stop);

        let mut planned = state.events_overlapping(&self.planned_gauge, hull)?;
        planned.sort_by_key(|e| (e.span.start, e.id));
        let planned_segments: Vec<Segment<uuid::Uuid>> = planned
            .iter()
            .map(|e| Segment::new(e.id, e.span.start, e.span.stop))
            .collect();
        let received: Vec<Span> = merged.iter().map(|m| Span::new(m.start, m.stop)).collect();
        let production: Vec<Segment<uuid::Uuid>> = received
            .iter()
            .map(|s| Segment::new(uuid::Uuid::nil(), s.start, s.stop))
            .collect();

        let mut events = Vec::new();
        for overlap in intersect(&planned_segments, &production) {
            let Some(p) = planned.iter().find(|e| e.id == overlap.id1) else {
                continue;
            };
            let status = coverage_status(p.span, &gap_segments(p.span, &received));
            events.push(completeness_event(
                &self.completeness_gauge,
                Span::new(overlap.start, overlap.stop),
                overlap.id1,
                vec![
                    text("status", CoverageStatus::Complete.as_str()),
                    text("planned_status", status.as_str()),
                ],
            ));
        }
        if events.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![derived_operation(self.id(), plan, self.priority, events)])
    }
}
