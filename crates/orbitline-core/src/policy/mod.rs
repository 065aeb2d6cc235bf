//! Insertion-policy engine.
//!
//! Given a resolved operation and read access to committed state, compute the
//! complete [`ApplyPlan`] before anything is written. The engine walks the
//! events of the operation in order and applies the policy declared for each
//! event's gauge:
//! - `INSERT`: no competition
//! - `EVENT_KEYS` / `SIMPLE_UPDATE`: keyed replacement, all or nothing
//! - `INSERT_and_ERASE_per_EVENT[_with_PRIORITY]`: per-event clipping, so that
//!   a gauge always tiles its timeline without overlaps
//! - `INSERT_and_ERASE[_with_PRIORITY]`: clipping by source validity windows
//!
//! An operation in `insert_and_erase` mode additionally erases weaker events
//! of its signature inside its validity window.
//!
//! Committed events are never edited in place. A clipped event is deleted and
//! its remainder pieces are inserted as new events that keep the original
//! source, copy its values and inherit its links. Link consistency is checked
//! last, against the final set of surviving events.

pub mod plan;
pub mod registry;
pub mod state;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};
use crate::interval::{difference, Segment, Timed};
use crate::model::{
    EventRecord, GaugeKey, GaugeKind, InsertionPolicy, Operation, OperationMode, PolicyScope, Precedence,
    PrecedenceRule, Span,
};
use crate::pipeline::resolve::{LinkEnd, ResolvedOperation};
use crate::pipeline::PipelineContext;

pub use plan::{
    AnnotationInsert, ApplyPlan, ApplyStats, ErLinkInsert, EventInsert, EventValues, ExplicitRefUpsert,
    LinkInsert, SourceInsert,
};
pub use registry::SourceRegistry;
pub use state::{CommittedState, MemoryState};

/// Parts of `pieces` not covered by `cutters`.
pub fn cut(pieces: &[Span], cutters: &[Span]) -> Vec<Span> {
    let segs: Vec<Segment<()>> = pieces.iter().map(|p| Segment::new((), p.start, p.stop)).collect();
    difference(&segs, cutters)
        .into_iter()
        .map(|s| Span::new(s.start, s.stop))
        .collect()
}

/// A committed event this operation clips or erases.
#[derive(Debug, Clone)]
struct Touched {
    record: EventRecord,
    /// Surviving pieces. Empty when erased.
    pieces: Vec<Span>,
}

struct Planner<'s> {
    state: &'s dyn CommittedState,
    registry: SourceRegistry<'s>,
    source_id: Uuid,
    incoming: Precedence,
    /// Surviving pieces of each event of the operation, by arena index.
    batch: Vec<Vec<Span>>,
    touched: BTreeMap<Uuid, Touched>,
}

impl<'s> Planner<'s> {
    fn new(state: &'s dyn CommittedState, source_id: Uuid, op: &Operation) -> Self {
        Self {
            state,
            registry: SourceRegistry::new(state),
            source_id,
            incoming: op.source.precedence(),
            batch: op.events.iter().map(|e| vec![e.span]).collect(),
            touched: BTreeMap::new(),
        }
    }

    fn pieces_of(&self, rec: &EventRecord) -> Vec<Span> {
        match self.touched.get(&rec.id) {
            Some(t) => t.pieces.clone(),
            None => vec![rec.span],
        }
    }

    fn is_erased(&self, rec: &EventRecord) -> bool {
        self.touched.get(&rec.id).is_some_and(|t| t.pieces.is_empty())
    }

    fn set_pieces(&mut self, rec: &EventRecord, pieces: Vec<Span>) {
        self.touched
            .entry(rec.id)
            .or_insert_with(|| Touched {
                record: rec.clone(),
                pieces: Vec::new(),
            })
            .pieces = pieces;
    }

    fn clip_committed(&mut self, rec: &EventRecord, cutters: &[Span]) {
        let current = self.pieces_of(rec);
        let next = cut(&current, cutters);
        if next != current {
            self.set_pieces(rec, next);
        }
    }

    /// Committed events of other sources, minus the ones already erased.
    fn competing(&self, found: Vec<EventRecord>) -> Vec<EventRecord> {
        found
            .into_iter()
            .filter(|r| r.source_id != self.source_id && !self.is_erased(r))
            .collect()
    }

    /// `EVENT_KEYS` and `SIMPLE_UPDATE`.
    fn keyed(&mut self, op: &Operation, idx: usize) -> EngineResult<()> {
        let ev = &op.events[idx];
        let found = match ev.policy {
            InsertionPolicy::EventKeys => match ev.key.as_deref() {
                Some(key) => self.state.events_by_key(&op.signature.name, key)?,
                None => return Ok(()),
            },
            _ => self
                .state
                .events_by_gauge(&ev.gauge, ev.key.as_deref(), ev.explicit_ref.as_deref())?,
        };
        let rule = ev.policy.rule();
        let existing = self.competing(found);

        if existing.iter().any(|r| rule.stronger(&r.precedence, &self.incoming)) {
            self.batch[idx].clear();
            return Ok(());
        }
        for rec in &existing {
            self.set_pieces(rec, Vec::new());
        }
        Ok(())
    }

    /// `INSERT_and_ERASE_per_EVENT[_with_PRIORITY]`.
    fn per_event(&mut self, op: &Operation, idx: usize) -> EngineResult<()> {
        let ev = &op.events[idx];
        if self.batch[idx].is_empty() {
            return Ok(());
        }
        let rule = ev.policy.rule();

        let mut stronger = Vec::new();
        let mut weaker = Vec::new();
        for rec in self.competing(self.state.events_overlapping(&ev.gauge, ev.span)?) {
            if rule.stronger(&rec.precedence, &self.incoming) {
                stronger.extend(self.pieces_of(&rec).into_iter().filter(|p| p.overlaps(&ev.span)));
            } else {
                weaker.push(rec);
            }
        }

        self.batch[idx] = cut(&self.batch[idx], &stronger);
        let winners = self.batch[idx].clone();
        if winners.is_empty() {
            return Ok(());
        }

        for rec in &weaker {
            self.clip_committed(rec, &winners);
        }
        // Earlier events of this operation share its precedence: last applied wins.
        for (j, other) in op.events.iter().enumerate().take(idx) {
            if other.gauge == ev.gauge && other.policy.scope() == PolicyScope::PerEvent {
                self.batch[j] = cut(&self.batch[j], &winners);
            }
        }
        Ok(())
    }

    /// `INSERT_and_ERASE[_with_PRIORITY]`, once per gauge.
    fn validity_window(&mut self, op: &Operation, gauge: &GaugeKey, rule: PrecedenceRule) -> EngineResult<()> {
        let window = op.source.validity;
        let stronger = self
            .registry
            .stronger_windows_for_gauge(gauge, &self.incoming, rule, self.source_id)?;

        for (i, ev) in op.events.iter().enumerate() {
            if &ev.gauge == gauge && ev.policy.scope() == PolicyScope::ValidityWindow {
                self.batch[i] = cut(&self.batch[i], &stronger);
            }
        }

        let effective = cut(&[window], &stronger);
        if effective.is_empty() {
            return Ok(());
        }
        for rec in self.competing(self.state.events_overlapping(gauge, window)?) {
            if !rule.stronger(&rec.precedence, &self.incoming) {
                self.clip_committed(&rec, &effective);
            }
        }
        Ok(())
    }

    /// Operation mode `insert_and_erase`.
    fn erase_signature_window(&mut self, op: &Operation) -> EngineResult<()> {
        let rule = PrecedenceRule::PriorityThenGeneration;
        let window = op.source.validity;
        let stronger = self.registry.stronger_windows_for_signature(
            &op.signature.name,
            &self.incoming,
            rule,
            self.source_id,
        )?;
        let effective = cut(&[window], &stronger);
        if effective.is_empty() {
            return Ok(());
        }
        for rec in self.competing(self.state.events_of_signature(&op.signature.name, window)?) {
            if !rule.stronger(&rec.precedence, &self.incoming) {
                self.clip_committed(&rec, &effective);
            }
        }
        Ok(())
    }
}

/// Compute the plan of a resolved operation against committed state.
pub fn plan_operation(ctx: &mut PipelineContext<'_>, resolved: ResolvedOperation) -> EngineResult<ApplyPlan> {
    let state = ctx.state()?;
    let op = &resolved.operation;

    let identity = op.identity();
    if let Some(existing) = state.find_source(&identity)? {
        return Err(EngineError::already_ingested(format!(
            "source {identity} was already ingested as {}",
            existing.id
        ))
        .at("source", "source"));
    }

    let source_id = ctx.next_id();
    let mut planner = Planner::new(state, source_id, op);

    if op.mode == OperationMode::InsertAndErase {
        planner.erase_signature_window(op)?;
    }

    let mut window_gauges = BTreeSet::new();
    for (idx, ev) in op.events.iter().enumerate() {
        match ev.policy.scope() {
            PolicyScope::Append => {}
            PolicyScope::Keyed => planner.keyed(op, idx)?,
            PolicyScope::PerEvent => planner.per_event(op, idx)?,
            PolicyScope::ValidityWindow => {
                if window_gauges.insert(ev.gauge.clone()) {
                    planner.validity_window(op, &ev.gauge, ev.policy.rule())?;
                }
            }
        }
    }
    ctx.cancel.check()?;

    finish(ctx, planner, resolved)
}

fn finish(ctx: &mut PipelineContext<'_>, planner: Planner<'_>, resolved: ResolvedOperation) -> EngineResult<ApplyPlan> {
    let op = &resolved.operation;
    let state = planner.state;
    let source_id = planner.source_id;
    let incoming = planner.incoming;
    let mut stats = ApplyStats::default();

    // New events, one row per surviving piece.
    let mut insert_events = Vec::new();
    let mut batch_event_ids = Vec::with_capacity(op.events.len());
    for (idx, (ev, pieces)) in op.events.iter().zip(&planner.batch).enumerate() {
        if pieces.is_empty() {
            stats.discarded += 1;
            ctx.push_info(
                "policy.discarded",
                format!("events[{idx}] on gauge {} is covered by stronger data", ev.gauge),
            );
        } else if pieces.as_slice() != [ev.span] {
            stats.clipped += 1;
        }

        let mut ids = Vec::with_capacity(pieces.len());
        for piece in pieces {
            let id = ctx.next_id();
            ids.push(id);
            insert_events.push(EventInsert {
                id,
                source_id,
                gauge: ev.gauge.clone(),
                explicit_ref: ev.explicit_ref.clone(),
                key: ev.key.clone(),
                span: *piece,
                values: EventValues::Inline(ev.values.clone()),
            });
        }
        stats.inserted += ids.len();
        batch_event_ids.push(ids);
    }

    // Committed events replaced by their remainders.
    let mut delete_events = BTreeSet::new();
    let mut replacements: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for (id, t) in &planner.touched {
        if t.pieces.as_slice() == [t.record.span] {
            continue;
        }
        delete_events.insert(*id);
        let mut ids = Vec::with_capacity(t.pieces.len());
        for piece in &t.pieces {
            let new_id = ctx.next_id();
            ids.push(new_id);
            insert_events.push(EventInsert {
                id: new_id,
                source_id: t.record.source_id,
                gauge: t.record.gauge.clone(),
                explicit_ref: t.record.explicit_ref.clone(),
                key: t.record.key.clone(),
                span: *piece,
                values: EventValues::CopyOf(*id),
            });
        }
        if ids.is_empty() {
            stats.erased += 1;
        } else {
            stats.split += 1;
        }
        replacements.insert(*id, ids);
    }

    let mut links: BTreeSet<LinkInsert> = BTreeSet::new();

    // Committed links touching a replaced event move to its remainders.
    let changed: Vec<Uuid> = delete_events.iter().copied().collect();
    let mut observed_links = BTreeSet::new();
    if !changed.is_empty() {
        for link in state.links_touching(&changed)? {
            let seen = LinkInsert {
                from: link.from,
                to: link.to,
                name: link.name.clone(),
                synthesized: link.synthesized,
            };
            if !observed_links.insert(seen) {
                continue;
            }
            let from = replacements.get(&link.from).cloned().unwrap_or_else(|| vec![link.from]);
            let to = replacements.get(&link.to).cloned().unwrap_or_else(|| vec![link.to]);
            if from.is_empty() {
                continue;
            }
            if to.is_empty() {
                if link.synthesized {
                    continue;
                }
                return Err(EngineError::links_inconsistency(format!(
                    "erasing event {} would orphan link {:?} declared by event {}",
                    link.to, link.name, link.from
                ))
                .at("link", link.name.clone()));
            }
            for f in &from {
                for t in &to {
                    links.insert(LinkInsert {
                        from: *f,
                        to: *t,
                        name: link.name.clone(),
                        synthesized: link.synthesized,
                    });
                }
            }
        }
    }

    // Links declared by this operation.
    let mut required_events = BTreeSet::new();
    let mut known: HashMap<Uuid, bool> = HashMap::new();
    for link in &resolved.links {
        let locator = match (link.from, link.to) {
            (LinkEnd::Batch(i), _) | (_, LinkEnd::Batch(i)) => format!("events[{i}]"),
            _ => "events".to_string(),
        };
        let mut ends = Vec::with_capacity(2);
        for end in [link.from, link.to] {
            let ids = match end {
                LinkEnd::Batch(j) => batch_event_ids.get(j).cloned().unwrap_or_default(),
                LinkEnd::Committed(u) => match replacements.get(&u) {
                    Some(r) if r.is_empty() => {
                        return Err(EngineError::links_inconsistency(format!(
                            "link {:?} targets event {u}, which this operation erases",
                            link.name
                        ))
                        .at("event", locator));
                    }
                    Some(r) => r.clone(),
                    None => {
                        let exists = match known.get(&u) {
                            Some(e) => *e,
                            None => {
                                let e = state.event(u)?.is_some();
                                known.insert(u, e);
                                e
                            }
                        };
                        if !exists {
                            return Err(EngineError::links_inconsistency(format!(
                                "link {:?} targets event {u}, which does not exist",
                                link.name
                            ))
                            .at("event", locator));
                        }
                        required_events.insert(u);
                        vec![u]
                    }
                },
            };
            ends.push(ids);
        }
        let (from, to) = (&ends[0], &ends[1]);
        if from.is_empty() || to.is_empty() {
            if !link.synthesized && !from.is_empty() {
                ctx.push_warning(
                    "policy.link_dropped",
                    format!("link {:?} of {locator} targets an event discarded by policy", link.name),
                );
            }
            continue;
        }
        for f in from {
            for t in to {
                links.insert(LinkInsert {
                    from: *f,
                    to: *t,
                    name: link.name.clone(),
                    synthesized: link.synthesized,
                });
            }
        }
    }
    stats.links = links.len();

    // Annotations: keyed replacement on (explicit reference, gauge).
    let mut insert_annotations = Vec::new();
    let mut delete_annotations = BTreeSet::new();
    for (idx, a) in op.annotations.iter().enumerate() {
        let existing: Vec<_> = state
            .annotations_for(&a.explicit_ref, &a.gauge)?
            .into_iter()
            .filter(|x| x.source_id != source_id && !delete_annotations.contains(&x.id))
            .collect();
        if existing
            .iter()
            .any(|x| PrecedenceRule::PriorityThenGeneration.stronger(&x.precedence, &incoming))
        {
            stats.annotations_discarded += 1;
            ctx.push_info(
                "policy.annotation_discarded",
                format!("annotations[{idx}] on {} is superseded", a.gauge),
            );
            continue;
        }
        delete_annotations.extend(existing.iter().map(|x| x.id));
        insert_annotations.push(AnnotationInsert {
            id: ctx.next_id(),
            source_id,
            explicit_ref: a.explicit_ref.clone(),
            gauge: a.gauge.clone(),
            values: a.values.clone(),
        });
    }
    stats.annotations = insert_annotations.len();

    let mut gauges = BTreeMap::new();
    for ev in &op.events {
        gauges.insert(ev.gauge.clone(), GaugeKind::Event);
    }
    for a in &op.annotations {
        gauges.entry(a.gauge.clone()).or_insert(GaugeKind::Annotation);
    }

    let explicit_refs = resolved
        .explicit_refs
        .iter()
        .map(|(name, group)| ExplicitRefUpsert {
            name: name.clone(),
            group: group.clone(),
        })
        .collect();
    let er_links = resolved
        .er_links
        .iter()
        .map(|l| ErLinkInsert {
            from: l.from.clone(),
            to: l.to.clone(),
            name: l.name.clone(),
        })
        .collect();

    ctx.push_info(
        "policy.planned",
        format!(
            "{} events inserted, {} discarded, {} committed events erased, {} split",
            stats.inserted, stats.discarded, stats.erased, stats.split
        ),
    );

    let src = &op.source;
    Ok(ApplyPlan {
        source: SourceInsert {
            id: source_id,
            identity: op.identity(),
            mode: op.mode,
            validity: src.validity,
            reported_validity: src.reported_validity,
            generation_time: src.generation_time,
            reception_time: src.reception_time,
            ingestion_time: ctx.now,
            priority: src.priority,
            digest: op.digest.clone(),
        },
        explicit_refs,
        er_links,
        gauges,
        insert_events,
        delete_events,
        insert_links: links.into_iter().collect(),
        insert_annotations,
        delete_annotations,
        required_events,
        observed_links,
        batch_event_ids,
        stats,
    })
}
