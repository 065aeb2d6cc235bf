//! Error taxonomy for orbitline.
//!
//! Every failure an operation can hit maps onto one variant of [`EngineError`].
//! Variants are grouped by kind:
//! - structural: malformed operation, bad typed value, bad polygon
//! - temporal: a period whose start is not before its stop
//! - referential: undefined or duplicated links, deletions that orphan links
//! - idempotency: exact re-ingestion of a Source
//! - infrastructure: lock timeouts, storage failures, cancellation
//!
//! Data errors abort the whole operation and are never retried automatically.
//! Infrastructure errors flagged by [`EngineError::is_retryable`] may be retried
//! by the orchestrator.

use std::fmt;

use serde::Serialize;

/// Result alias used across the workspace.
pub type EngineResult<T> = Result<T, EngineError>;

/// The entity an error points at, when one is known.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Offender {
    /// Entity family: `source`, `event`, `annotation`, `value`, `link`, ...
    pub entity: String,
    /// Human-readable locator (`events[3].values[1]`, a link_ref, a uuid).
    pub locator: String,
}

impl Offender {
    pub fn new(entity: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            locator: locator.into(),
        }
    }
}

impl fmt::Display for Offender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.entity, self.locator)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("error parsing operation: {message}")]
    ErrorParsingDictionary { message: String, offender: Option<Offender> },

    #[error("wrong value: {message}")]
    WrongValue { message: String, offender: Option<Offender> },

    #[error("odd number of coordinates: {message}")]
    OddNumberOfCoordinates { message: String, offender: Option<Offender> },

    #[error("wrong geometry: {message}")]
    WrongGeometry { message: String, offender: Option<Offender> },

    #[error("wrong period: {message}")]
    WrongPeriod { message: String, offender: Option<Offender> },

    #[error("undefined event link: {message}")]
    UndefinedEventLink { message: String, offender: Option<Offender> },

    #[error("duplicated event link reference: {message}")]
    DuplicatedEventLinkRef { message: String, offender: Option<Offender> },

    #[error("links inconsistency: {message}")]
    LinksInconsistency { message: String, offender: Option<Offender> },

    #[error("source already ingested: {message}")]
    SourceAlreadyIngested { message: String, offender: Option<Offender> },

    #[error("timed out waiting for lock on {resource} after {waited_ms} ms")]
    LockTimeout { resource: String, waited_ms: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage error: {message}")]
    Storage { message: String, retryable: bool },

    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl EngineError {
    pub fn parsing(message: impl Into<String>) -> Self {
        Self::ErrorParsingDictionary {
            message: message.into(),
            offender: None,
        }
    }

    pub fn wrong_value(message: impl Into<String>) -> Self {
        Self::WrongValue {
            message: message.into(),
            offender: None,
        }
    }

    pub fn odd_coordinates(message: impl Into<String>) -> Self {
        Self::OddNumberOfCoordinates {
            message: message.into(),
            offender: None,
        }
    }

    pub fn wrong_geometry(message: impl Into<String>) -> Self {
        Self::WrongGeometry {
            message: message.into(),
            offender: None,
        }
    }

    pub fn wrong_period(message: impl Into<String>) -> Self {
        Self::WrongPeriod {
            message: message.into(),
            offender: None,
        }
    }

    pub fn undefined_link(message: impl Into<String>) -> Self {
        Self::UndefinedEventLink {
            message: message.into(),
            offender: None,
        }
    }

    pub fn duplicated_link_ref(message: impl Into<String>) -> Self {
        Self::DuplicatedEventLinkRef {
            message: message.into(),
            offender: None,
        }
    }

    pub fn links_inconsistency(message: impl Into<String>) -> Self {
        Self::LinksInconsistency {
            message: message.into(),
            offender: None,
        }
    }

    pub fn already_ingested(message: impl Into<String>) -> Self {
        Self::SourceAlreadyIngested {
            message: message.into(),
            offender: None,
        }
    }

    pub fn storage(message: impl Into<String>, retryable: bool) -> Self {
        Self::Storage {
            message: message.into(),
            retryable,
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant(message.into())
    }

    /// Attach the offending entity to a data error. When an inner offender is
    /// already set, `locator` is prefixed to it and the inner entity is kept.
    /// Infrastructure errors are returned unchanged.
    pub fn at(mut self, entity: impl Into<String>, locator: impl Into<String>) -> Self {
        let entity = entity.into();
        let locator = locator.into();
        let who = match self.offender() {
            Some(inner) => Offender::new(inner.entity.clone(), format!("{locator}.{}", inner.locator)),
            None => Offender::new(entity, locator),
        };
        match &mut self {
            Self::ErrorParsingDictionary { offender, .. }
            | Self::WrongValue { offender, .. }
            | Self::OddNumberOfCoordinates { offender, .. }
            | Self::WrongGeometry { offender, .. }
            | Self::WrongPeriod { offender, .. }
            | Self::UndefinedEventLink { offender, .. }
            | Self::DuplicatedEventLinkRef { offender, .. }
            | Self::LinksInconsistency { offender, .. }
            | Self::SourceAlreadyIngested { offender, .. } => *offender = Some(who),
            Self::LockTimeout { .. } | Self::Cancelled | Self::Storage { .. } | Self::Invariant(_) => {}
        }
        self
    }

    pub fn offender(&self) -> Option<&Offender> {
        match self {
            Self::ErrorParsingDictionary { offender, .. }
            | Self::WrongValue { offender, .. }
            | Self::OddNumberOfCoordinates { offender, .. }
            | Self::WrongGeometry { offender, .. }
            | Self::WrongPeriod { offender, .. }
            | Self::UndefinedEventLink { offender, .. }
            | Self::DuplicatedEventLinkRef { offender, .. }
            | Self::LinksInconsistency { offender, .. }
            | Self::SourceAlreadyIngested { offender, .. } => offender.as_ref(),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ErrorParsingDictionary { .. } => ErrorKind::ErrorParsingDictionary,
            Self::WrongValue { .. } => ErrorKind::WrongValue,
            Self::OddNumberOfCoordinates { .. } => ErrorKind::OddNumberOfCoordinates,
            Self::WrongGeometry { .. } => ErrorKind::WrongGeometry,
            Self::WrongPeriod { .. } => ErrorKind::WrongPeriod,
            Self::UndefinedEventLink { .. } => ErrorKind::UndefinedEventLink,
            Self::DuplicatedEventLinkRef { .. } => ErrorKind::DuplicatedEventLinkRef,
            Self::LinksInconsistency { .. } => ErrorKind::LinksInconsistency,
            Self::SourceAlreadyIngested { .. } => ErrorKind::SourceAlreadyIngested,
            Self::LockTimeout { .. } => ErrorKind::LockTimeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Storage { .. } => ErrorKind::Storage,
            Self::Invariant(_) => ErrorKind::Invariant,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.kind().status()
    }

    /// Lock timeouts and transient storage contention may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::LockTimeout { .. } => true,
            Self::Storage { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Data errors are the producer's to fix; they leave an audit record.
    pub fn is_data_error(&self) -> bool {
        self.kind().is_data()
    }
}

/// Closed set of error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ErrorKind {
    ErrorParsingDictionary,
    WrongValue,
    OddNumberOfCoordinates,
    WrongGeometry,
    WrongPeriod,
    UndefinedEventLink,
    DuplicatedEventLinkRef,
    LinksInconsistency,
    SourceAlreadyIngested,
    LockTimeout,
    Cancelled,
    Storage,
    Invariant,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ErrorParsingDictionary => "ErrorParsingDictionary",
            Self::WrongValue => "WrongValue",
            Self::OddNumberOfCoordinates => "OddNumberOfCoordinates",
            Self::WrongGeometry => "WrongGeometry",
            Self::WrongPeriod => "WrongPeriod",
            Self::UndefinedEventLink => "UndefinedEventLink",
            Self::DuplicatedEventLinkRef => "DuplicatedEventLinkRef",
            Self::LinksInconsistency => "LinksInconsistency",
            Self::SourceAlreadyIngested => "SourceAlreadyIngested",
            Self::LockTimeout => "LockTimeout",
            Self::Cancelled => "Cancelled",
            Self::Storage => "Storage",
            Self::Invariant => "Invariant",
        }
    }

    pub fn is_data(&self) -> bool {
        !matches!(
            self,
            Self::LockTimeout | Self::Cancelled | Self::Storage | Self::Invariant
        )
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::ErrorParsingDictionary => StatusCode::ParsingError,
            Self::WrongValue => StatusCode::WrongValue,
            Self::OddNumberOfCoordinates | Self::WrongGeometry => StatusCode::WrongGeometry,
            Self::WrongPeriod => StatusCode::WrongPeriod,
            Self::UndefinedEventLink => StatusCode::UndefinedEventLink,
            Self::DuplicatedEventLinkRef => StatusCode::DuplicatedEventLinkRef,
            Self::LinksInconsistency => StatusCode::LinksInconsistency,
            Self::SourceAlreadyIngested => StatusCode::SourceAlreadyIngested,
            Self::LockTimeout => StatusCode::LockTimeout,
            Self::Cancelled => StatusCode::Cancelled,
            Self::Storage | Self::Invariant => StatusCode::StorageError,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status surfaced to producers, one per operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Ok,
    SourceAlreadyIngested,
    WrongPeriod,
    WrongValue,
    WrongGeometry,
    LinksInconsistency,
    UndefinedEventLink,
    DuplicatedEventLinkRef,
    ParsingError,
    LockTimeout,
    Cancelled,
    StorageError,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::SourceAlreadyIngested => "SOURCE_ALREADY_INGESTED",
            Self::WrongPeriod => "WRONG_PERIOD",
            Self::WrongValue => "WRONG_VALUE",
            Self::WrongGeometry => "WRONG_GEOMETRY",
            Self::LinksInconsistency => "LINKS_INCONSISTENCY",
            Self::UndefinedEventLink => "UNDEFINED_EVENT_LINK",
            Self::DuplicatedEventLinkRef => "DUPLICATED_EVENT_LINK_REF",
            Self::ParsingError => "PARSING_ERROR",
            Self::LockTimeout => "LOCK_TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::StorageError => "STORAGE_ERROR",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
