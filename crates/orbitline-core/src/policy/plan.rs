//! The apply plan: every mutation one operation makes, computed in memory.
//!
//! The store flushes a plan inside a single transaction. Nothing in a plan
//! refers to batch positions any more: all events, new or remainder pieces of
//! clipped committed events, carry their final uuid.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::model::{GaugeKey, GaugeKind, NamedValue, OperationMode, SourceIdentity, Span};

#[derive(Debug, Clone)]
pub struct SourceInsert {
    pub id: Uuid,
    pub identity: SourceIdentity,
    pub mode: OperationMode,
    pub validity: Span,
    pub reported_validity: Span,
    pub generation_time: OffsetDateTime,
    pub reception_time: OffsetDateTime,
    pub ingestion_time: OffsetDateTime,
    pub priority: i64,
    pub digest: String,
}

/// Where the values of an inserted event come from.
#[derive(Debug, Clone)]
pub enum EventValues {
    Inline(Vec<NamedValue>),
    /// Remainder of a clipped committed event: copy that event's values.
    CopyOf(Uuid),
}

#[derive(Debug, Clone)]
pub struct EventInsert {
    pub id: Uuid,
    pub source_id: Uuid,
    pub gauge: GaugeKey,
    pub explicit_ref: Option<String>,
    pub key: Option<String>,
    pub span: Span,
    pub values: EventValues,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkInsert {
    pub from: Uuid,
    pub to: Uuid,
    pub name: String,
    pub synthesized: bool,
}

#[derive(Debug, Clone)]
pub struct AnnotationInsert {
    pub id: Uuid,
    pub source_id: Uuid,
    pub explicit_ref: String,
    pub gauge: GaugeKey,
    pub values: Vec<NamedValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplicitRefUpsert {
    pub name: String,
    /// `None` leaves an existing group untouched.
    pub group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ErLinkInsert {
    pub from: String,
    pub to: String,
    pub name: String,
}

/// Counters reported with every committed operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyStats {
    /// New events of this operation that were committed (pieces counted).
    pub inserted: usize,
    /// New events fully dropped because stronger data already covers them.
    pub discarded: usize,
    /// New events that lost part of their interval.
    pub clipped: usize,
    /// Committed events removed entirely.
    pub erased: usize,
    /// Committed events replaced by their remainder pieces.
    pub split: usize,
    pub annotations: usize,
    pub annotations_discarded: usize,
    pub links: usize,
}

#[derive(Debug, Clone)]
pub struct ApplyPlan {
    pub source: SourceInsert,
    pub explicit_refs: Vec<ExplicitRefUpsert>,
    pub er_links: Vec<ErLinkInsert>,
    pub gauges: BTreeMap<GaugeKey, GaugeKind>,
    pub insert_events: Vec<EventInsert>,
    /// Committed events to delete, links touching them included.
    pub delete_events: BTreeSet<Uuid>,
    pub insert_links: Vec<LinkInsert>,
    pub insert_annotations: Vec<AnnotationInsert>,
    pub delete_annotations: BTreeSet<Uuid>,
    /// Committed `by_uuid` targets the plan relies on. Re-checked at commit.
    pub required_events: BTreeSet<Uuid>,
    /// Committed links touching `delete_events` as read while planning. The
    /// store refuses the plan when the set differs at commit.
    pub observed_links: BTreeSet<LinkInsert>,
    /// Final uuids of each batch event, by arena index. Empty when discarded.
    pub batch_event_ids: Vec<Vec<Uuid>>,
    pub stats: ApplyStats,
}

impl ApplyPlan {
    pub fn inserted_ids(&self) -> BTreeSet<Uuid> {
        self.insert_events.iter().map(|e| e.id).collect()
    }
}
