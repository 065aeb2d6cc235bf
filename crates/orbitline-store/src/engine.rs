//! Commit orchestrator.
//!
//! [`Engine`] drives every operation of a payload through its lifecycle:
//!
//! 1. parse and validate without holding any lock
//! 2. take the operation's gauge locks (bounded wait, total order)
//! 3. open a session, resolve and apply against committed state
//! 4. commit the plan in one transaction, then release the locks
//! 5. run the derived generators on the committed plan
//!
//! Retryable failures (lock timeouts, busy database, a plan invalidated by a
//! concurrent commit) restart at step 2, up to `locking.max_retries` times
//! with a doubling backoff. Every other failure ends the operation: data
//! errors and infrastructure errors alike leave a FAILED source row for the
//! audit trail, except duplicates and cancellations which leave nothing.
//!
//! Operations of one payload are processed in order and never share a
//! transaction, so one bad entry does not affect its neighbours.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value as Json;
use time::OffsetDateTime;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use orbitline_core::completeness::DerivedOperation;
use orbitline_core::config::EngineConfig;
use orbitline_core::errors::{ErrorKind, Offender, StatusCode};
use orbitline_core::model::{Operation, SourceIdentity};
use orbitline_core::pipeline::parse::{decode_operation, identity_hint, parse_operations, split_payload};
use orbitline_core::pipeline::{
    CancellationToken, DiagnosticLevel, OperationState, Pipeline, PipelineContext, PipelineData, PipelineDiagnostic,
    Submitted,
};
use orbitline_core::policy::{ApplyPlan, ApplyStats};
use orbitline_core::timestamp::normalize;
use orbitline_core::{EngineError, EngineResult};

use crate::config::StoreConfig;
use crate::db::{FailedSource, Session, Store};
use crate::locks::{GaugeLocks, LockSet};

/// Receives source progress (0 to 100). Not part of the commit contract.
pub trait ProgressObserver: Send + Sync {
    fn progress(&self, source: &SourceIdentity, percent: u8);
}

/// Logs progress at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressObserver for TracingProgress {
    fn progress(&self, source: &SourceIdentity, percent: u8) {
        debug!(source = %source.name, percent, "ingestion progress");
    }
}

/// Result of one operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationOutcome {
    /// Position inside the submitted payload. Derived operations carry the
    /// index of the operation they were derived from.
    pub index: usize,
    pub source: Option<SourceIdentity>,
    /// Id of the committed source.
    pub source_id: Option<Uuid>,
    pub status: StatusCode,
    pub kind: Option<ErrorKind>,
    pub message: Option<String>,
    pub offender: Option<Offender>,
    pub stats: ApplyStats,
    /// Generator that produced this operation.
    pub derived_by: Option<String>,
    pub attempts: u32,
    /// Terminal lifecycle state: `Committed` or `Failed`.
    pub state: OperationState,
    #[serde(skip)]
    pub diagnostics: Vec<PipelineDiagnostic>,
}

impl OperationOutcome {
    fn committed(index: usize, plan: &ApplyPlan, attempts: u32) -> Self {
        Self {
            index,
            source: Some(plan.source.identity.clone()),
            source_id: Some(plan.source.id),
            status: StatusCode::Ok,
            kind: None,
            message: None,
            offender: None,
            stats: plan.stats,
            derived_by: None,
            attempts,
            state: OperationState::Committed,
            diagnostics: Vec::new(),
        }
    }

    fn failed(index: usize, source: Option<SourceIdentity>, err: &EngineError, attempts: u32) -> Self {
        Self {
            index,
            source,
            source_id: None,
            status: err.status(),
            kind: Some(err.kind()),
            message: Some(err.to_string()),
            offender: err.offender().cloned(),
            stats: ApplyStats::default(),
            derived_by: None,
            attempts,
            state: OperationState::Failed,
            diagnostics: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == StatusCode::Ok
    }
}

/// Outcomes of one payload, primary and derived operations interleaved in
/// processing order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub outcomes: Vec<OperationOutcome>,
}

impl IngestReport {
    pub fn is_ok(&self) -> bool {
        self.outcomes.iter().all(OperationOutcome::is_ok)
    }

    pub fn committed(&self) -> impl Iterator<Item = &OperationOutcome> {
        self.outcomes.iter().filter(|o| o.is_ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = &OperationOutcome> {
        self.outcomes.iter().filter(|o| !o.is_ok())
    }

    /// Outcomes of the submitted operations, without derived ones.
    pub fn primary(&self) -> impl Iterator<Item = &OperationOutcome> {
        self.outcomes.iter().filter(|o| o.derived_by.is_none())
    }
}

/// What is known about an operation when it fails.
struct Failure<'a> {
    identity: Option<SourceIdentity>,
    digest: Option<String>,
    operation: Option<&'a Operation>,
}

pub struct Engine {
    store: Store,
    config: EngineConfig,
    locks: GaugeLocks,
    validation: Pipeline,
    planning: Pipeline,
    derived: Vec<Box<dyn DerivedOperation + Send + Sync>>,
    observer: Arc<dyn ProgressObserver>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let derived: Vec<&str> = self.derived.iter().map(|d| d.id()).collect();
        f.debug_struct("Engine")
            .field("store", &self.store)
            .field("derived", &derived)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Open (or create) the store and build an engine on it.
    pub fn open(config: StoreConfig) -> EngineResult<Self> {
        let store = Store::open(&config)?;
        Ok(Self::new(store, config.engine))
    }

    pub fn new(store: Store, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            locks: GaugeLocks::new(),
            validation: Pipeline::validation(),
            planning: Pipeline::planning(),
            derived: Vec::new(),
            observer: Arc::new(TracingProgress),
        }
    }

    /// Register a generator run after every committed primary operation.
    pub fn with_derived(mut self, generator: Box<dyn DerivedOperation + Send + Sync>) -> Self {
        self.derived.push(generator);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Share a lock table with another engine on the same database.
    pub fn with_locks(mut self, locks: GaugeLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn locks(&self) -> &GaugeLocks {
        &self.locks
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// New session for queries.
    pub fn session(&self) -> EngineResult<Session> {
        self.store.session()
    }

    /// Ingest a payload: one operation or an `{"operations": [...]}` batch.
    pub fn ingest(&self, bytes: &[u8]) -> IngestReport {
        self.ingest_with_cancel(bytes, &CancellationToken::new())
    }

    pub fn ingest_with_cancel(&self, bytes: &[u8], cancel: &CancellationToken) -> IngestReport {
        self.ingest_parsed(parse_operations(bytes, &self.config.limits), cancel)
    }

    /// Same as [`Engine::ingest`] for an already decoded payload.
    pub fn ingest_value(&self, payload: Json) -> IngestReport {
        self.ingest_parsed(split_payload(payload), &CancellationToken::new())
    }

    fn ingest_parsed(
        &self,
        parsed: EngineResult<Vec<orbitline_core::pipeline::parse::ParsedOperation>>,
        cancel: &CancellationToken,
    ) -> IngestReport {
        let entries = match parsed {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "payload rejected");
                return IngestReport {
                    outcomes: vec![OperationOutcome::failed(0, None, &e, 0)],
                };
            }
        };

        let mut report = IngestReport::default();
        for entry in entries {
            let (outcome, plan) = self.process(entry.index, entry.hint, entry.result, cancel);
            report.outcomes.push(outcome);
            if let Some(plan) = plan {
                self.run_derived(entry.index, &plan, cancel, &mut report.outcomes);
            }
        }
        report
    }

    /// Run one operation to COMMITTED or FAILED.
    fn process(
        &self,
        index: usize,
        hint: Option<SourceIdentity>,
        submitted: EngineResult<Submitted>,
        cancel: &CancellationToken,
    ) -> (OperationOutcome, Option<ApplyPlan>) {
        let now = normalize(OffsetDateTime::now_utc());
        let digest = submitted.as_ref().ok().map(|s| s.digest.clone());

        let mut ctx = PipelineContext::new(&self.config, now).with_cancel(cancel.clone());
        let validated = submitted
            .and_then(|s| self.validation.run(&mut ctx, PipelineData::Submitted(Box::new(s))))
            .and_then(PipelineData::into_validated);
        let mut diagnostics = ctx.take_diagnostics();

        let op = match validated {
            Ok(op) => op,
            Err(e) => {
                warn!(source = ?hint.as_ref().map(|i| i.name.as_str()), error = %e, "operation rejected");
                let failure = Failure {
                    identity: hint.clone(),
                    digest,
                    operation: None,
                };
                self.audit(&failure, &e, now);
                let mut outcome = OperationOutcome::failed(index, hint, &e, 0);
                outcome.diagnostics = diagnostics;
                return (outcome, None);
            }
        };

        let identity = op.identity();
        let span = info_span!("ingest", source = %identity.name, signature = %identity.dim_signature);
        let _entered = span.enter();
        self.observer.progress(&identity, 0);

        let max_retries = self.config.locking.max_retries;
        let mut retries = 0u32;
        let result = loop {
            match self.attempt(&op, now, cancel, &mut diagnostics) {
                Err(e) if e.is_retryable() && retries < max_retries => {
                    let backoff = self.config.locking.backoff_ms.saturating_mul(1u64 << retries.min(16));
                    warn!(error = %e, retry = retries + 1, backoff_ms = backoff, "retrying operation");
                    retries += 1;
                    if cancel.is_cancelled() {
                        break Err(EngineError::Cancelled);
                    }
                    thread::sleep(Duration::from_millis(backoff));
                }
                other => break other,
            }
        };
        let attempts = retries + 1;
        forward(&diagnostics);

        match result {
            Ok(plan) => {
                info!(
                    source_id = %plan.source.id,
                    inserted = plan.stats.inserted,
                    erased = plan.stats.erased,
                    split = plan.stats.split,
                    attempts,
                    "operation committed"
                );
                self.observer.progress(&identity, 100);
                let mut outcome = OperationOutcome::committed(index, &plan, attempts);
                outcome.diagnostics = diagnostics;
                (outcome, Some(plan))
            }
            Err(e) => {
                warn!(error = %e, kind = e.kind().as_str(), attempts, "operation failed");
                let failure = Failure {
                    identity: Some(identity.clone()),
                    digest: Some(op.digest.clone()),
                    operation: Some(&op),
                };
                self.audit(&failure, &e, now);
                let mut outcome = OperationOutcome::failed(index, Some(identity), &e, attempts);
                outcome.diagnostics = diagnostics;
                (outcome, None)
            }
        }
    }

    /// One locked plan-and-commit attempt. Locks are released on return.
    fn attempt(
        &self,
        op: &Operation,
        now: OffsetDateTime,
        cancel: &CancellationToken,
        diagnostics: &mut Vec<PipelineDiagnostic>,
    ) -> EngineResult<ApplyPlan> {
        let lock_set = LockSet::for_operation(op);
        let timeout = Duration::from_millis(self.config.locking.timeout_ms);
        let _guard = self.locks.acquire(&lock_set, timeout)?;
        debug!(keys = lock_set.len(), "locks acquired");
        cancel.check()?;

        let mut session = self.store.session()?;
        let plan = {
            let mut ctx = PipelineContext::new(&self.config, now)
                .with_cancel(cancel.clone())
                .with_state(&session);
            let planned = self
                .planning
                .run(&mut ctx, PipelineData::Validated(Box::new(op.clone())));
            diagnostics.extend(ctx.take_diagnostics());
            debug!(state = %ctx.reached, "planning finished");
            planned?.into_plan()?
        };
        self.observer.progress(&plan.source.identity, 50);

        cancel.check()?;
        session.commit_plan(&plan)?;
        debug!(state = %OperationState::Committed, "plan flushed");
        Ok(plan)
    }

    /// Persist a FAILED source row. Never fails the caller.
    fn audit(&self, failure: &Failure<'_>, err: &EngineError, now: OffsetDateTime) {
        if matches!(err.kind(), ErrorKind::SourceAlreadyIngested | ErrorKind::Cancelled) {
            return;
        }
        let Some(identity) = failure.identity.clone() else {
            warn!(error = %err, "failure not recorded: source identity unknown");
            return;
        };
        let op = failure.operation;
        let failed = FailedSource {
            identity,
            digest: failure.digest.clone(),
            validity: op.map(|o| o.source.validity),
            generation_time: op.map(|o| o.source.generation_time),
            reception_time: op.map(|o| o.source.reception_time),
            priority: op
                .map(|o| o.source.priority)
                .unwrap_or(self.config.policy.default_priority),
            kind: err.kind(),
            message: err.to_string(),
            ingestion_time: now,
        };
        match self.store.session().and_then(|s| s.record_failure(&failed)) {
            Ok(id) => debug!(source_id = %id, "failure recorded"),
            Err(e) => warn!(error = %e, "could not record failure"),
        }
    }

    /// Submit the operations generated from a committed plan. Derived
    /// operations do not trigger generators themselves.
    fn run_derived(
        &self,
        index: usize,
        plan: &ApplyPlan,
        cancel: &CancellationToken,
        outcomes: &mut Vec<OperationOutcome>,
    ) {
        if self.derived.is_empty() {
            return;
        }
        let mut pending: Vec<(&str, Json)> = Vec::new();
        match self.store.session() {
            Ok(session) => {
                for generator in &self.derived {
                    match generator.derive(plan, &session) {
                        Ok(ops) => pending.extend(ops.into_iter().map(|v| (generator.id(), v))),
                        Err(e) => {
                            warn!(generator = generator.id(), error = %e, "derived generator failed");
                            let mut outcome = OperationOutcome::failed(index, None, &e, 0);
                            outcome.derived_by = Some(generator.id().to_string());
                            outcomes.push(outcome);
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "derived generators skipped");
                return;
            }
        }

        for (generator, v) in pending {
            let hint = identity_hint(&v);
            let (mut outcome, _) = self.process(index, hint, decode_operation(v), cancel);
            outcome.derived_by = Some(generator.to_string());
            outcomes.push(outcome);
        }
    }
}

/// Forward pipeline diagnostics to tracing.
fn forward(diagnostics: &[PipelineDiagnostic]) {
    for d in diagnostics {
        match d.level {
            DiagnosticLevel::Error => warn!(code = %d.code, "{}", d.message),
            DiagnosticLevel::Warning | DiagnosticLevel::Info => debug!(code = %d.code, "{}", d.message),
        }
    }
}
