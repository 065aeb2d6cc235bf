//! Ingestion pipeline primitives.
//!
//! An operation travels through a fixed sequence of stages:
//! - parse: bytes are decoded into wire operations (`parse`)
//! - validate: wire shapes become a typed [`Operation`] (`validate`)
//! - resolve: `link_ref`s become arena indices, back-refs are mirrored (`resolve`)
//! - apply: insertion policies produce an [`ApplyPlan`] against committed state
//! - verify: the plan is re-checked before it is handed to the store (`verify`)
//!
//! This module defines:
//! - `Pipeline` and `Stage`
//! - `PipelineContext` (config, injected clock and ids, committed state,
//!   cancellation, diagnostics)
//! - `OperationState`, the lifecycle of one operation
//!
//! The core crate does not do I/O. The store crate opens connections, takes
//! gauge locks and passes a [`CommittedState`] view into the context.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::model::wire::WireOperation;
use crate::model::Operation;
use crate::policy::state::CommittedState;
use crate::policy::ApplyPlan;

pub mod parse;
pub mod resolve;
pub mod stages;
pub mod validate;
pub mod verify;

pub use resolve::ResolvedOperation;

/// Stable stage identifiers, dot-delimited.
pub type StageId = String;

/// A structured diagnostic emitted by pipeline stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDiagnostic {
    pub level: DiagnosticLevel,
    pub code: String,
    pub message: String,
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLevel {
    Info,
    Warning,
    Error,
}

/// Lifecycle of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationState {
    Received,
    Validated,
    Resolved,
    Applied,
    Committed,
    Failed,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::Validated => "VALIDATED",
            Self::Resolved => "RESOLVED",
            Self::Applied => "APPLIED",
            Self::Committed => "COMMITTED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared cancellation flag. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> EngineResult<()> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Source of identifiers for new sources, events and annotations.
///
/// Core never reads randomness directly; the caller injects the allocator.
pub trait IdAllocator {
    fn next_id(&mut self) -> Uuid;
}

/// Random v4 identifiers.
#[derive(Debug, Default)]
pub struct RandomIds;

impl IdAllocator for RandomIds {
    fn next_id(&mut self) -> Uuid {
        Uuid::new_v4()
    }
}

/// Predictable identifiers, counting up from a seed.
#[derive(Debug, Default)]
pub struct SequentialIds {
    next: u128,
}

impl SequentialIds {
    pub fn starting_at(seed: u128) -> Self {
        Self { next: seed }
    }
}

impl IdAllocator for SequentialIds {
    fn next_id(&mut self) -> Uuid {
        self.next += 1;
        Uuid::from_u128(self.next)
    }
}

/// Pipeline context shared by all stages of one operation.
pub struct PipelineContext<'a> {
    pub config: &'a EngineConfig,

    /// Ingestion time, chosen by the caller.
    pub now: OffsetDateTime,

    /// Committed state, present once the operation holds its locks.
    pub state: Option<&'a dyn CommittedState>,

    pub ids: Box<dyn IdAllocator + Send>,

    pub cancel: CancellationToken,

    /// Last lifecycle state reached.
    pub reached: OperationState,

    /// Collected diagnostics.
    pub diagnostics: Vec<PipelineDiagnostic>,
}

impl<'a> PipelineContext<'a> {
    pub fn new(config: &'a EngineConfig, now: OffsetDateTime) -> Self {
        Self {
            config,
            now,
            state: None,
            ids: Box::new(RandomIds),
            cancel: CancellationToken::new(),
            reached: OperationState::Received,
            diagnostics: Vec::new(),
        }
    }

    pub fn with_state(mut self, state: &'a dyn CommittedState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_ids(mut self, ids: impl IdAllocator + Send + 'static) -> Self {
        self.ids = Box::new(ids);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> EngineResult<&'a dyn CommittedState> {
        self.state
            .ok_or_else(|| EngineError::invariant("stage requires committed state but none was provided"))
    }

    pub fn next_id(&mut self) -> Uuid {
        self.ids.next_id()
    }

    pub fn push_info(&mut self, code: impl Into<String>, message: impl Into<String>) {
        self.push(DiagnosticLevel::Info, code, message, BTreeMap::new());
    }

    pub fn push_warning(&mut self, code: impl Into<String>, message: impl Into<String>) {
        self.push(DiagnosticLevel::Warning, code, message, BTreeMap::new());
    }

    pub fn push_error(&mut self, code: impl Into<String>, message: impl Into<String>) {
        self.push(DiagnosticLevel::Error, code, message, BTreeMap::new());
    }

    pub fn push(
        &mut self,
        level: DiagnosticLevel,
        code: impl Into<String>,
        message: impl Into<String>,
        data: BTreeMap<String, String>,
    ) {
        self.diagnostics.push(PipelineDiagnostic {
            level,
            code: code.into(),
            message: message.into(),
            data,
        });
    }

    /// Move collected diagnostics out, leaving the context empty.
    pub fn take_diagnostics(&mut self) -> Vec<PipelineDiagnostic> {
        std::mem::take(&mut self.diagnostics)
    }
}

/// A wire operation together with the digest of its canonical JSON.
#[derive(Debug, Clone)]
pub struct Submitted {
    pub wire: WireOperation,
    pub digest: String,
}

/// A stage input/output carrier.
#[derive(Debug, Clone)]
pub enum PipelineData {
    None,
    Submitted(Box<Submitted>),
    Validated(Box<Operation>),
    Resolved(Box<ResolvedOperation>),
    Applied(Box<ApplyPlan>),
}

impl PipelineData {
    fn variant(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Submitted(_) => "Submitted",
            Self::Validated(_) => "Validated",
            Self::Resolved(_) => "Resolved",
            Self::Applied(_) => "Applied",
        }
    }

    pub fn into_validated(self) -> EngineResult<Operation> {
        match self {
            Self::Validated(op) => Ok(*op),
            other => Err(unexpected("Validated", &other)),
        }
    }

    pub fn into_resolved(self) -> EngineResult<ResolvedOperation> {
        match self {
            Self::Resolved(r) => Ok(*r),
            other => Err(unexpected("Resolved", &other)),
        }
    }

    pub fn into_plan(self) -> EngineResult<ApplyPlan> {
        match self {
            Self::Applied(p) => Ok(*p),
            other => Err(unexpected("Applied", &other)),
        }
    }
}

pub(crate) fn unexpected(expected: &str, got: &PipelineData) -> EngineError {
    EngineError::invariant(format!(
        "expected {expected} pipeline data, got {}",
        got.variant()
    ))
}

/// A pipeline stage.
///
/// Stages should be deterministic: no system time, env, randomness or I/O.
/// Time and identifiers come from the context.
pub trait Stage {
    fn id(&self) -> &str;

    /// Lifecycle state reached when the stage succeeds, if any.
    fn reaches(&self) -> Option<OperationState> {
        None
    }

    fn run(&self, ctx: &mut PipelineContext<'_>, input: PipelineData) -> EngineResult<PipelineData>;
}

/// A pipeline is an ordered list of stages.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Stage + Send + Sync>>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<&str> = self.stages.iter().map(|s| s.id()).collect();
        f.debug_struct("Pipeline").field("stages", &ids).finish()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Stages that run before any lock is taken.
    pub fn validation() -> Self {
        let mut p = Self::new();
        p.push_stage(stages::ValidateStage);
        p
    }

    /// Stages that run while the operation holds its gauge locks.
    pub fn planning() -> Self {
        let mut p = Self::new();
        p.push_stage(stages::ResolveStage)
            .push_stage(stages::ApplyStage)
            .push_stage(stages::VerifyPlanStage);
        p
    }

    pub fn push_stage<S: Stage + Send + Sync + 'static>(&mut self, s: S) -> &mut Self {
        self.stages.push(Box::new(s));
        self
    }

    pub fn stages(&self) -> usize {
        self.stages.len()
    }

    /// Run every stage in order. Cancellation is checked before each stage.
    pub fn run(&self, ctx: &mut PipelineContext<'_>, input: PipelineData) -> EngineResult<PipelineData> {
        let mut data = input;

        for st in &self.stages {
            ctx.cancel.check()?;
            ctx.push_info("pipeline.stage.start", format!("starting stage {}", st.id()));

            data = match st.run(ctx, data) {
                Ok(d) => d,
                Err(e) => {
                    ctx.reached = OperationState::Failed;
                    ctx.push_error(format!("{}.failed", st.id()), e.to_string());
                    return Err(e);
                }
            };

            if let Some(state) = st.reaches() {
                ctx.reached = state;
            }
            ctx.push_info("pipeline.stage.end", format!("completed stage {}", st.id()));
        }

        Ok(data)
    }
}
