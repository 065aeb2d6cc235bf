//! Orbitline data model.
//!
//! Three families of types live here:
//! - the closed enums that drive behaviour ([`InsertionPolicy`], [`LinkMode`],
//!   [`OperationMode`], [`SourceStatus`])
//! - the validated operation ([`Operation`] and its specs), produced once by
//!   the validation stage from the loose [`wire`] format
//! - the committed records ([`SourceRecord`], [`EventRecord`], ...) read back
//!   from the store by the policy engine and by queries
//!
//! Models are plain data. Validation lives in `pipeline::validate`, conflict
//! resolution in `policy`.

pub mod value;
pub mod wire;

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};
use crate::interval::Timed;

pub use value::{find_value, Coordinate, NamedValue, Polygon, Value, ValueKind};

/// Classification key of events and annotations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GaugeKey {
    pub name: String,
    #[serde(default)]
    pub system: String,
}

impl GaugeKey {
    pub fn new(name: impl Into<String>, system: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system: system.into(),
        }
    }
}

impl fmt::Display for GaugeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.system.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}@{}", self.name, self.system)
        }
    }
}

/// Mission / logical stream plus the processor that produced the data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DimSignature {
    pub name: String,
    pub exec: String,
    pub version: String,
}

/// Identity of a source. Unique among committed sources.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceIdentity {
    pub name: String,
    pub dim_signature: String,
    pub processor: String,
    pub version: String,
}

impl fmt::Display for SourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} / {} {})",
            self.name, self.dim_signature, self.processor, self.version
        )
    }
}

/// Half-open `[start, stop)` span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Span {
    pub start: OffsetDateTime,
    pub stop: OffsetDateTime,
}

impl Span {
    pub fn new(start: OffsetDateTime, stop: OffsetDateTime) -> Self {
        Self { start, stop }
    }

    pub fn contains(&self, other: &Span) -> bool {
        self.start <= other.start && other.stop <= self.stop
    }

    pub fn union(&self, other: &Span) -> Span {
        Span::new(self.start.min(other.start), self.stop.max(other.stop))
    }
}

impl Timed for Span {
    fn start(&self) -> OffsetDateTime {
        self.start
    }
    fn stop(&self) -> OffsetDateTime {
        self.stop
    }
}

/// Ordering key of competing sources. Compared lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Precedence {
    pub priority: i64,
    pub generation_time: OffsetDateTime,
}

/// Which part of [`Precedence`] a policy looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecedenceRule {
    PriorityThenGeneration,
    GenerationOnly,
}

impl PrecedenceRule {
    fn key(self, p: &Precedence) -> (i64, OffsetDateTime) {
        match self {
            Self::PriorityThenGeneration => (p.priority, p.generation_time),
            Self::GenerationOnly => (0, p.generation_time),
        }
    }

    /// `a` strictly beats `b`. On equal precedence a committed event never
    /// beats a newcomer, so the later write wins the tie for every policy,
    /// `EVENT_KEYS` included.
    pub fn stronger(self, a: &Precedence, b: &Precedence) -> bool {
        self.key(a) > self.key(b)
    }
}

/// Conflict-resolution rule declared per event gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InsertionPolicy {
    Insert,
    EventKeys,
    SimpleUpdate,
    InsertAndErase,
    InsertAndEraseWithPriority,
    InsertAndErasePerEvent,
    InsertAndErasePerEventWithPriority,
}

/// How a policy chooses the events it competes with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyScope {
    /// No competition.
    Append,
    /// Events sharing a natural key.
    Keyed,
    /// Overlapping events of the same gauge, resolved per event.
    PerEvent,
    /// Events of the same gauge inside the source validity windows.
    ValidityWindow,
}

impl InsertionPolicy {
    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Self::Insert),
            "EVENT_KEYS" => Ok(Self::EventKeys),
            "SIMPLE_UPDATE" => Ok(Self::SimpleUpdate),
            "INSERT_AND_ERASE" => Ok(Self::InsertAndErase),
            "INSERT_AND_ERASE_WITH_PRIORITY" => Ok(Self::InsertAndEraseWithPriority),
            "INSERT_AND_ERASE_PER_EVENT" => Ok(Self::InsertAndErasePerEvent),
            "INSERT_AND_ERASE_PER_EVENT_WITH_PRIORITY" => {
                Ok(Self::InsertAndErasePerEventWithPriority)
            }
            _ => Err(EngineError::parsing(format!(
                "unknown insertion_type {raw:?}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::EventKeys => "EVENT_KEYS",
            Self::SimpleUpdate => "SIMPLE_UPDATE",
            Self::InsertAndErase => "INSERT_and_ERASE",
            Self::InsertAndEraseWithPriority => "INSERT_and_ERASE_with_PRIORITY",
            Self::InsertAndErasePerEvent => "INSERT_and_ERASE_per_EVENT",
            Self::InsertAndErasePerEventWithPriority => "INSERT_and_ERASE_per_EVENT_with_PRIORITY",
        }
    }

    pub fn scope(&self) -> PolicyScope {
        match self {
            Self::Insert => PolicyScope::Append,
            Self::EventKeys | Self::SimpleUpdate => PolicyScope::Keyed,
            Self::InsertAndErasePerEvent | Self::InsertAndErasePerEventWithPriority => {
                PolicyScope::PerEvent
            }
            Self::InsertAndErase | Self::InsertAndEraseWithPriority => PolicyScope::ValidityWindow,
        }
    }

    pub fn rule(&self) -> PrecedenceRule {
        match self {
            Self::InsertAndErase | Self::InsertAndErasePerEvent => PrecedenceRule::GenerationOnly,
            _ => PrecedenceRule::PriorityThenGeneration,
        }
    }
}

impl fmt::Display for InsertionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkMode {
    ByRef,
    ByUuid,
}

impl LinkMode {
    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw {
            "by_ref" => Ok(Self::ByRef),
            "by_uuid" => Ok(Self::ByUuid),
            other => Err(EngineError::parsing(format!("unknown link_mode {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationMode {
    Insert,
    InsertAndErase,
}

impl OperationMode {
    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw {
            "insert" => Ok(Self::Insert),
            "insert_and_erase" => Ok(Self::InsertAndErase),
            other => Err(EngineError::parsing(format!("unknown mode {other:?}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::InsertAndErase => "insert_and_erase",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceStatus {
    Pending,
    InProgress,
    Ok,
    Failed,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Ok => "OK",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "OK" => Ok(Self::Ok),
            "FAILED" => Ok(Self::Failed),
            other => Err(EngineError::invariant(format!("unknown source status {other:?}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Validated operation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub name: String,
    pub reception_time: OffsetDateTime,
    pub generation_time: OffsetDateTime,
    /// Corrected validity: declared window widened to the events it carries.
    pub validity: Span,
    pub reported_validity: Span,
    pub priority: i64,
}

impl SourceSpec {
    pub fn precedence(&self) -> Precedence {
        Precedence {
            priority: self.priority,
            generation_time: self.generation_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErLinkSpec {
    /// Name of the target explicit reference.
    pub target: String,
    pub name: String,
    pub back_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplicitRefSpec {
    pub name: String,
    pub group: Option<String>,
    pub links: Vec<ErLinkSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    /// Batch-local `link_ref`.
    Ref(String),
    /// Previously committed event.
    Uuid(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSpec {
    pub target: LinkTarget,
    pub name: String,
    pub back_ref: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EventSpec {
    pub link_ref: Option<String>,
    pub explicit_ref: Option<String>,
    pub key: Option<String>,
    pub gauge: GaugeKey,
    pub policy: InsertionPolicy,
    pub span: Span,
    pub links: Vec<LinkSpec>,
    pub values: Vec<NamedValue>,
}

#[derive(Debug, Clone)]
pub struct AnnotationSpec {
    pub explicit_ref: String,
    pub gauge: GaugeKey,
    pub values: Vec<NamedValue>,
}

/// An operation that passed validation. Every field is typed.
#[derive(Debug, Clone)]
pub struct Operation {
    pub mode: OperationMode,
    pub signature: DimSignature,
    pub source: SourceSpec,
    pub explicit_refs: Vec<ExplicitRefSpec>,
    pub events: Vec<EventSpec>,
    pub annotations: Vec<AnnotationSpec>,
    /// SHA-256 of the canonical JSON the operation was parsed from.
    pub digest: String,
}

impl Operation {
    pub fn identity(&self) -> SourceIdentity {
        SourceIdentity {
            name: self.source.name.clone(),
            dim_signature: self.signature.name.clone(),
            processor: self.signature.exec.clone(),
            version: self.signature.version.clone(),
        }
    }

    /// Event and annotation gauges touched by this operation.
    pub fn gauges(&self) -> std::collections::BTreeSet<GaugeKey> {
        self.events
            .iter()
            .map(|e| e.gauge.clone())
            .chain(self.annotations.iter().map(|a| a.gauge.clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Committed records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub id: Uuid,
    pub identity: SourceIdentity,
    pub validity: Option<Span>,
    pub reported_validity: Option<Span>,
    pub generation_time: Option<OffsetDateTime>,
    pub reception_time: Option<OffsetDateTime>,
    pub ingestion_time: OffsetDateTime,
    pub priority: i64,
    pub status: SourceStatus,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub digest: Option<String>,
}

impl SourceRecord {
    pub fn precedence(&self) -> Precedence {
        Precedence {
            priority: self.priority,
            generation_time: self.generation_time.unwrap_or(self.ingestion_time),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub id: Uuid,
    pub source_id: Uuid,
    pub gauge: GaugeKey,
    pub explicit_ref: Option<String>,
    pub key: Option<String>,
    pub span: Span,
    pub ingestion_time: OffsetDateTime,
    /// Precedence of the owning source.
    pub precedence: Precedence,
}

impl Timed for EventRecord {
    fn start(&self) -> OffsetDateTime {
        self.span.start
    }
    fn stop(&self) -> OffsetDateTime {
        self.span.stop
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventLinkRecord {
    pub from: Uuid,
    pub to: Uuid,
    pub name: String,
    /// Mirror edge generated from a `back_ref`.
    pub synthesized: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationRecord {
    pub id: Uuid,
    pub source_id: Uuid,
    pub explicit_ref: String,
    pub gauge: GaugeKey,
    pub ingestion_time: OffsetDateTime,
    pub precedence: Precedence,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplicitRefRecord {
    pub name: String,
    pub group: Option<String>,
    pub ingestion_time: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErLinkRecord {
    pub from: String,
    pub to: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GaugeKind {
    Event,
    Annotation,
}

impl GaugeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Annotation => "annotation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GaugeRecord {
    pub gauge: GaugeKey,
    pub kind: GaugeKind,
}
