//! Read access to committed state.
//!
//! The policy engine only ever reads through [`CommittedState`]. The store
//! crate implements it over a SQLite connection; [`MemoryState`] implements it
//! in memory for dry runs and tests.
//!
//! Only sources with status OK and their events are visible through this
//! trait. Failed audit records never take part in conflict resolution.

use std::collections::{BTreeMap, BTreeSet};

use time::OffsetDateTime;
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};
use crate::interval::Timed;
use crate::model::{
    AnnotationRecord, EventLinkRecord, EventRecord, GaugeKey, NamedValue, SourceIdentity, SourceRecord,
    SourceStatus, Span,
};
use crate::policy::plan::{ApplyPlan, EventValues};

pub trait CommittedState {
    /// Committed source with this identity.
    fn find_source(&self, identity: &SourceIdentity) -> EngineResult<Option<SourceRecord>>;

    fn event(&self, id: Uuid) -> EngineResult<Option<EventRecord>>;

    /// Events of `gauge` whose interval overlaps `window`.
    fn events_overlapping(&self, gauge: &GaugeKey, window: Span) -> EngineResult<Vec<EventRecord>>;

    /// Events with natural key `key` owned by sources of `dim_signature`.
    fn events_by_key(&self, dim_signature: &str, key: &str) -> EngineResult<Vec<EventRecord>>;

    /// Events of `gauge`, narrowed to `key` when given, else to
    /// `explicit_ref` when given.
    fn events_by_gauge(
        &self,
        gauge: &GaugeKey,
        key: Option<&str>,
        explicit_ref: Option<&str>,
    ) -> EngineResult<Vec<EventRecord>>;

    /// Events of any gauge owned by sources of `dim_signature` overlapping `window`.
    fn events_of_signature(&self, dim_signature: &str, window: Span) -> EngineResult<Vec<EventRecord>>;

    /// Links with either end in `ids`.
    fn links_touching(&self, ids: &[Uuid]) -> EngineResult<Vec<EventLinkRecord>>;

    fn annotations_for(&self, explicit_ref: &str, gauge: &GaugeKey) -> EngineResult<Vec<AnnotationRecord>>;

    /// Sources owning at least one event of `gauge`.
    fn sources_for_gauge(&self, gauge: &GaugeKey) -> EngineResult<Vec<SourceRecord>>;

    fn sources_for_signature(&self, dim_signature: &str) -> EngineResult<Vec<SourceRecord>>;
}

/// Committed state held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub sources: BTreeMap<Uuid, SourceRecord>,
    pub events: BTreeMap<Uuid, EventRecord>,
    pub values: BTreeMap<Uuid, Vec<NamedValue>>,
    pub links: BTreeSet<(Uuid, Uuid, String, bool)>,
    pub annotations: BTreeMap<Uuid, AnnotationRecord>,
}

impl MemoryState {
    pub fn new() -> Self {
        Self::default()
    }

    fn signature_of(&self, ev: &EventRecord) -> Option<&str> {
        self.sources
            .get(&ev.source_id)
            .map(|s| s.identity.dim_signature.as_str())
    }

    /// Apply a plan the way the store does.
    pub fn commit(&mut self, plan: &ApplyPlan, now: OffsetDateTime) -> EngineResult<()> {
        for id in &plan.required_events {
            if !self.events.contains_key(id) {
                return Err(EngineError::links_inconsistency(format!("event {id} no longer exists")));
            }
        }

        let s = &plan.source;
        self.sources.insert(
            s.id,
            SourceRecord {
                id: s.id,
                identity: s.identity.clone(),
                validity: Some(s.validity),
                reported_validity: Some(s.reported_validity),
                generation_time: Some(s.generation_time),
                reception_time: Some(s.reception_time),
                ingestion_time: s.ingestion_time,
                priority: s.priority,
                status: SourceStatus::Ok,
                error_kind: None,
                error_message: None,
                digest: Some(s.digest.clone()),
            },
        );

        // Values of remainders are copied before their originals go away.
        let mut copied = Vec::new();
        for ins in &plan.insert_events {
            let values = match &ins.values {
                EventValues::Inline(v) => v.clone(),
                EventValues::CopyOf(orig) => self.values.get(orig).cloned().unwrap_or_default(),
            };
            copied.push(values);
        }

        for id in &plan.delete_events {
            self.events.remove(id);
            self.values.remove(id);
        }
        self.links
            .retain(|(from, to, _, _)| !plan.delete_events.contains(from) && !plan.delete_events.contains(to));

        for (ins, values) in plan.insert_events.iter().zip(copied) {
            let owner = self
                .sources
                .get(&ins.source_id)
                .ok_or_else(|| EngineError::invariant(format!("unknown source {}", ins.source_id)))?;
            self.events.insert(
                ins.id,
                EventRecord {
                    id: ins.id,
                    source_id: ins.source_id,
                    gauge: ins.gauge.clone(),
                    explicit_ref: ins.explicit_ref.clone(),
                    key: ins.key.clone(),
                    span: ins.span,
                    ingestion_time: now,
                    precedence: owner.precedence(),
                },
            );
            self.values.insert(ins.id, values);
        }

        for l in &plan.insert_links {
            self.links.insert((l.from, l.to, l.name.clone(), l.synthesized));
        }

        for id in &plan.delete_annotations {
            self.annotations.remove(id);
        }
        for a in &plan.insert_annotations {
            self.annotations.insert(
                a.id,
                AnnotationRecord {
                    id: a.id,
                    source_id: a.source_id,
                    explicit_ref: a.explicit_ref.clone(),
                    gauge: a.gauge.clone(),
                    ingestion_time: now,
                    precedence: s_precedence(plan),
                },
            );
        }
        Ok(())
    }

    /// Events of `gauge`, sorted by start.
    pub fn gauge_events(&self, gauge: &GaugeKey) -> Vec<&EventRecord> {
        let mut out: Vec<&EventRecord> = self.events.values().filter(|e| &e.gauge == gauge).collect();
        out.sort_by_key(|e| (e.span.start, e.span.stop));
        out
    }
}

fn s_precedence(plan: &ApplyPlan) -> crate::model::Precedence {
    crate::model::Precedence {
        priority: plan.source.priority,
        generation_time: plan.source.generation_time,
    }
}

impl CommittedState for MemoryState {
    fn find_source(&self, identity: &SourceIdentity) -> EngineResult<Option<SourceRecord>> {
        Ok(self
            .sources
            .values()
            .find(|s| s.status == SourceStatus::Ok && &s.identity == identity)
            .cloned())
    }

    fn event(&self, id: Uuid) -> EngineResult<Option<EventRecord>> {
        Ok(self.events.get(&id).cloned())
    }

    fn events_overlapping(&self, gauge: &GaugeKey, window: Span) -> EngineResult<Vec<EventRecord>> {
        Ok(self
            .events
            .values()
            .filter(|e| &e.gauge == gauge && e.overlaps(&window))
            .cloned()
            .collect())
    }

    fn events_by_key(&self, dim_signature: &str, key: &str) -> EngineResult<Vec<EventRecord>> {
        Ok(self
            .events
            .values()
            .filter(|e| e.key.as_deref() == Some(key) && self.signature_of(e) == Some(dim_signature))
            .cloned()
            .collect())
    }

    fn events_by_gauge(
        &self,
        gauge: &GaugeKey,
        key: Option<&str>,
        explicit_ref: Option<&str>,
    ) -> EngineResult<Vec<EventRecord>> {
        Ok(self
            .events
            .values()
            .filter(|e| &e.gauge == gauge)
            .filter(|e| match (key, explicit_ref) {
                (Some(k), _) => e.key.as_deref() == Some(k),
                (None, Some(er)) => e.explicit_ref.as_deref() == Some(er),
                (None, None) => true,
            })
            .cloned()
            .collect())
    }

    fn events_of_signature(&self, dim_signature: &str, window: Span) -> EngineResult<Vec<EventRecord>> {
        Ok(self
            .events
            .values()
            .filter(|e| self.signature_of(e) == Some(dim_signature) && e.overlaps(&window))
            .cloned()
            .collect())
    }

    fn links_touching(&self, ids: &[Uuid]) -> EngineResult<Vec<EventLinkRecord>> {
        let wanted: BTreeSet<&Uuid> = ids.iter().collect();
        Ok(self
            .links
            .iter()
            .filter(|(from, to, _, _)| wanted.contains(from) || wanted.contains(to))
            .map(|(from, to, name, synthesized)| EventLinkRecord {
                from: *from,
                to: *to,
                name: name.clone(),
                synthesized: *synthesized,
            })
            .collect())
    }

    fn annotations_for(&self, explicit_ref: &str, gauge: &GaugeKey) -> EngineResult<Vec<AnnotationRecord>> {
        Ok(self
            .annotations
            .values()
            .filter(|a| a.explicit_ref == explicit_ref && &a.gauge == gauge)
            .cloned()
            .collect())
    }

    fn sources_for_gauge(&self, gauge: &GaugeKey) -> EngineResult<Vec<SourceRecord>> {
        let owners: BTreeSet<Uuid> = self
            .events
            .values()
            .filter(|e| &e.gauge == gauge)
            .map(|e| e.source_id)
            .collect();
        Ok(owners
            .iter()
            .filter_map(|id| self.sources.get(id))
            .filter(|s| s.status == SourceStatus::Ok)
            .cloned()
            .collect())
    }

    fn sources_for_signature(&self, dim_signature: &str) -> EngineResult<Vec<SourceRecord>> {
        Ok(self
            .sources
            .values()
            .filter(|s| s.status == SourceStatus::Ok && s.identity.dim_signature == dim_signature)
            .cloned()
            .collect())
    }
}
