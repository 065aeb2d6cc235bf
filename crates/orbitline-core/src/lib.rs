//! orbitline-core
//!
//! Core primitives for orbitline, the ground-segment timeline engine:
//! - error taxonomy and engine configuration
//! - interval algebra over half-open time segments
//! - typed operation model and its loose wire format
//! - the staged pipeline: parse, validate, resolve, apply, verify
//! - the gauge/source registry and the insertion-policy engine
//! - completeness generators and the query filter model
//!
//! This crate performs no I/O. Committed state is read through
//! [`policy::CommittedState`], implemented by the store crate.

pub mod completeness;
pub mod config;
pub mod errors;
pub mod interval;
pub mod model;
pub mod pipeline;
pub mod policy;
pub mod query;
pub mod timestamp;

/// Digests of submitted operations.
pub mod determinism {
    pub mod hashing;
}

pub use crate::errors::{EngineError, EngineResult};

/// Default names used by the completeness generators.
pub mod defaults {
    /// Link from a completeness event to the planned event it measures.
    pub const PLANNED_EVENT_LINK: &str = "PLANNED_EVENT";
    /// Mirror of [`PLANNED_EVENT_LINK`].
    pub const COMPLETENESS_LINK: &str = "COMPLETENESS";
}

/// Convenience re-exports.
pub mod prelude {
    pub use crate::completeness::{
        coverage_status, gap_segments, CoverageCompleteness, CoverageStatus, DerivedOperation,
        PlannedMissingCompleteness,
    };
    pub use crate::config::{validate_config, EngineConfig};
    pub use crate::errors::{ErrorKind, StatusCode};
    pub use crate::interval::{difference, intersect, intersect_many, merge, Segment, Timed};
    pub use crate::model::{
        GaugeKey, InsertionPolicy, NamedValue, Operation, SourceIdentity, Span, Value, ValueKind,
    };
    pub use crate::pipeline::{CancellationToken, Pipeline, PipelineContext, PipelineData};
    pub use crate::policy::{ApplyPlan, CommittedState, MemoryState};
    pub use crate::query::{EventField, EventQuery, Filter, FilterOp, FilterValue, ValueFilter};
    pub use crate::{EngineError, EngineResult};
}
