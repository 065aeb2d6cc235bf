//! Plan verification.
//!
//! Last stage before commit. Checks structural properties every plan must
//! have, whatever the policies decided:
//! - inserted spans are non-empty
//! - inserted ids are unique and never reuse an id being deleted
//! - remainder pieces of one committed event do not overlap
//! - every link endpoint survives the plan
//! - every explicit reference used by the plan is upserted by it
//!
//! A failed check is a bug in the planner, never a data error: the stage
//! turns it into `EngineError::Invariant`.
//!
//! This module performs no I/O.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};
use crate::interval::Timed;
use crate::model::Span;
use crate::policy::{ApplyPlan, EventValues};

/// A structured verification finding.
#[derive(Debug, Clone)]
pub struct VerifyFinding {
    pub level: VerifyLevel,
    pub code: String,
    pub message: String,
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyLevel {
    Info,
    Warning,
    Error,
}

/// Verification report.
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub ok: bool,
    pub findings: Vec<VerifyFinding>,
}

impl VerifyReport {
    pub fn has_errors(&self) -> bool {
        self.findings.iter().any(|f| f.level == VerifyLevel::Error)
    }

    /// First error as an engine error, if any.
    pub fn into_result(self) -> EngineResult<()> {
        match self.findings.into_iter().find(|f| f.level == VerifyLevel::Error) {
            Some(f) => Err(EngineError::invariant(format!("{}: {}", f.code, f.message))),
            None => Ok(()),
        }
    }
}

fn push(findings: &mut Vec<VerifyFinding>, level: VerifyLevel, code: impl Into<String>, message: impl Into<String>) {
    findings.push(VerifyFinding {
        level,
        code: code.into(),
        message: message.into(),
        data: BTreeMap::new(),
    });
}

/// Verify a plan. Returns a report even when checks fail.
pub fn verify_plan(plan: &ApplyPlan) -> VerifyReport {
    let mut findings = Vec::new();

    // 1) Inserted events
    let mut inserted = BTreeSet::new();
    let mut remainders: HashMap<Uuid, Vec<Span>> = HashMap::new();
    for ev in &plan.insert_events {
        if ev.span.is_empty() {
            push(
                &mut findings,
                VerifyLevel::Error,
                "plan.empty_span",
                format!("event {} has an empty interval", ev.id),
            );
        }
        if !inserted.insert(ev.id) || plan.delete_events.contains(&ev.id) {
            push(
                &mut findings,
                VerifyLevel::Error,
                "plan.id_collision",
                format!("event id {} is used twice", ev.id),
            );
        }
        if let EventValues::CopyOf(orig) = ev.values {
            if !plan.delete_events.contains(&orig) {
                push(
                    &mut findings,
                    VerifyLevel::Error,
                    "plan.orphan_remainder",
                    format!("event {} copies event {orig}, which is not replaced", ev.id),
                );
            }
            remainders.entry(orig).or_default().push(ev.span);
        }
    }

    // 2) Remainders never overlap
    for (orig, pieces) in &mut remainders {
        pieces.sort();
        if pieces.windows(2).any(|w| w[0].overlaps(&w[1])) {
            push(
                &mut findings,
                VerifyLevel::Error,
                "plan.overlapping_remainders",
                format!("remainders of event {orig} overlap"),
            );
        }
    }

    // 3) Links
    for link in &plan.insert_links {
        for end in [link.from, link.to] {
            if plan.delete_events.contains(&end) {
                push(
                    &mut findings,
                    VerifyLevel::Error,
                    "plan.dangling_link",
                    format!("link {:?} touches deleted event {end}", link.name),
                );
            }
        }
    }

    // 4) Explicit references
    let declared: BTreeSet<&str> = plan.explicit_refs.iter().map(|e| e.name.as_str()).collect();
    let used = plan
        .insert_events
        .iter()
        .filter(|e| matches!(e.values, EventValues::Inline(_)))
        .filter_map(|e| e.explicit_ref.as_deref())
        .chain(plan.insert_annotations.iter().map(|a| a.explicit_ref.as_str()))
        .chain(plan.er_links.iter().flat_map(|l| [l.from.as_str(), l.to.as_str()]));
    for name in used {
        if !declared.contains(name) {
            push(
                &mut findings,
                VerifyLevel::Error,
                "plan.unknown_explicit_ref",
                format!("explicit reference {name:?} is used but not upserted"),
            );
        }
    }

    push(
        &mut findings,
        VerifyLevel::Info,
        "plan.summary",
        format!(
            "{} events in, {} out, {} links",
            plan.insert_events.len(),
            plan.delete_events.len(),
            plan.insert_links.len()
        ),
    );

    let ok = !findings.iter().any(|f| f.level == VerifyLevel::Error);
    VerifyReport { ok, findings }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GaugeKey, OperationMode, SourceIdentity};
    use crate::policy::{ApplyStats, EventInsert, LinkInsert, SourceInsert};
    use time::macros::datetime;

    fn plan() -> ApplyPlan {
        let span = Span::new(datetime!(2020-01-01 00:00 UTC), datetime!(2020-01-01 01:00 UTC));
        ApplyPlan {
            source: SourceInsert {
                id: Uuid::from_u128(1),
                identity: SourceIdentity {
                    name: "S".into(),
                    dim_signature: "SIG".into(),
                    processor: "exec".into(),
                    version: "1".into(),
                },
                mode: OperationMode::Insert,
                validity: span,
                reported_validity: span,
                generation_time: span.start,
                reception_time: span.start,
                ingestion_time: span.start,
                priority: 0,
                digest: String::new(),
            },
            explicit_refs: Vec::new(),
            er_links: Vec::new(),
            gauges: BTreeMap::new(),
            insert_events: vec![EventInsert {
                id: Uuid::from_u128(2),
                source_id: Uuid::from_u128(1),
                gauge: GaugeKey::new("G", "S"),
                explicit_ref: None,
                key: None,
                span,
                values: EventValues::Inline(Vec::new()),
            }],
            delete_events: BTreeSet::new(),
            insert_links: Vec::new(),
            insert_annotations: Vec::new(),
            delete_annotations: BTreeSet::new(),
            required_events: BTreeSet::new(),
            observed_links: BTreeSet::new(),
            batch_event_ids: vec![vec![Uuid::from_u128(2)]],
            stats: ApplyStats::default(),
        }
    }

    #[test]
    fn clean_plan_passes() {
        let report = verify_plan(&plan());
        assert!(report.ok);
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn link_to_deleted_event_is_flagged() {
        let mut p = plan();
        p.delete_events.insert(Uuid::from_u128(9));
        p.insert_links.push(LinkInsert {
            from: Uuid::from_u128(2),
            to: Uuid::from_u128(9),
            name: "X".into(),
            synthesized: false,
        });
        let report = verify_plan(&p);
        assert!(report.has_errors());
        assert!(report.findings.iter().any(|f| f.code == "plan.dangling_link"));
    }

    #[test]
    fn undeclared_explicit_ref_is_flagged() {
        let mut p = plan();
        p.insert_events[0].explicit_ref = Some("DS_1".into());
        let err = verify_plan(&p).into_result().unwrap_err();
        assert!(err.to_string().contains("plan.unknown_explicit_ref"));
    }
}
