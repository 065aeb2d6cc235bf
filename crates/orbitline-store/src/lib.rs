//! orbitline-store
//!
//! Persistence and orchestration for orbitline:
//! - [`Store`]: SQLite database holding sources, events, links, annotations
//!   and explicit references
//! - [`locks::GaugeLocks`]: in-process gauge/key locks with bounded waits
//! - [`Engine`]: the commit orchestrator driving operations from raw bytes to
//!   a committed plan
//! - the query surface, as methods on [`Session`]
//! - [`logging::init`]: tracing subscriber setup
//!
//! All conflict resolution happens in `orbitline-core`. This crate reads
//! committed state for the planner and flushes the resulting plan in one
//! transaction.

pub mod config;
pub mod db;
pub mod engine;
pub mod locks;
pub mod logging;
pub mod query;
mod schema;

pub use crate::config::StoreConfig;
pub use crate::db::{FailedSource, Session, Store};
pub use crate::engine::{Engine, IngestReport, OperationOutcome, ProgressObserver, TracingProgress};
pub use crate::locks::{GaugeLocks, LockGuard, LockKey, LockMode, LockSet};
pub use crate::logging::{LogFormat, LoggingConfig};
pub use crate::query::{LinkQuery, LinkedEvents, LinkingEvents, LinkingEventsByName};
