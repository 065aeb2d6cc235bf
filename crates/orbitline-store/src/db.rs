//! SQLite store.
//!
//! [`Store`] owns the database location and opens one [`Session`] (one
//! connection) per operation or query. A session implements
//! [`CommittedState`] for the planner and flushes an [`ApplyPlan`] in a
//! single `BEGIN IMMEDIATE` transaction.
//!
//! Commit re-checks what the plan assumed about committed state:
//! - every `by_uuid` link target still exists, else `LinksInconsistency`
//! - every event the plan deletes still exists, and the links touching it
//!   are the ones the planner saw, else a retryable storage error so the
//!   orchestrator plans again
//!
//! Busy/locked database errors are retryable; everything else from SQLite is
//! a non-retryable storage error.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, Statement, ToSql, TransactionBehavior};
use time::OffsetDateTime;
use tracing::{debug, info};
use uuid::Uuid;

use orbitline_core::errors::ErrorKind;
use orbitline_core::model::{
    AnnotationRecord, EventLinkRecord, EventRecord, GaugeKey, NamedValue, Polygon, Precedence, SourceIdentity,
    SourceRecord, SourceStatus, Span, Value, ValueKind,
};
use orbitline_core::policy::{ApplyPlan, CommittedState, EventValues};
use orbitline_core::timestamp::{from_micros, to_micros};
use orbitline_core::{EngineError, EngineResult};

use crate::config::StoreConfig;
use crate::schema;

/// Maximum number of bound parameters per `IN (...)` list.
pub(crate) const IN_CHUNK: usize = 500;

/// Conversion of SQLite errors into engine errors.
pub(crate) trait SqlResultExt<T> {
    fn or_storage(self, what: &str) -> EngineResult<T>;
}

impl<T> SqlResultExt<T> for rusqlite::Result<T> {
    fn or_storage(self, what: &str) -> EngineResult<T> {
        self.map_err(|e| storage_error(what, &e))
    }
}

pub(crate) fn storage_error(what: &str, e: &rusqlite::Error) -> EngineError {
    let retryable = matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    );
    EngineError::storage(format!("failed to {what}: {e}"), retryable)
}

fn is_constraint(e: &rusqlite::Error) -> bool {
    matches!(e.sqlite_error_code(), Some(ErrorCode::ConstraintViolation))
}

pub(crate) fn uuid_col(raw: &str) -> EngineResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| EngineError::storage(format!("corrupt uuid {raw:?}: {e}"), false))
}

fn opt_time(micros: Option<i64>) -> EngineResult<Option<OffsetDateTime>> {
    micros.map(from_micros).transpose()
}

fn opt_span(start: Option<i64>, stop: Option<i64>) -> EngineResult<Option<Span>> {
    match (start, stop) {
        (Some(a), Some(b)) => Ok(Some(Span::new(from_micros(a)?, from_micros(b)?))),
        _ => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

pub(crate) const EVENT_SELECT: &str = "SELECT e.id, e.source_id, e.gauge_name, e.gauge_system, e.explicit_ref, \
     e.event_key, e.start_time, e.stop_time, e.ingestion_time, s.priority, \
     COALESCE(s.generation_time, s.ingestion_time) \
     FROM events e JOIN sources s ON s.id = e.source_id";

pub(crate) const SOURCE_SELECT: &str = "SELECT s.id, s.name, s.dim_signature, s.processor, s.version, \
     s.validity_start, s.validity_stop, s.reported_validity_start, s.reported_validity_stop, \
     s.generation_time, s.reception_time, s.ingestion_time, s.priority, s.status, \
     s.error_kind, s.error_message, s.digest FROM sources s";

pub(crate) const ANNOTATION_SELECT: &str = "SELECT a.id, a.source_id, a.explicit_ref, a.gauge_name, a.gauge_system, \
     a.ingestion_time, s.priority, COALESCE(s.generation_time, s.ingestion_time) \
     FROM annotations a JOIN sources s ON s.id = a.source_id";

struct EventRow {
    id: String,
    source_id: String,
    gauge_name: String,
    gauge_system: String,
    explicit_ref: Option<String>,
    key: Option<String>,
    start: i64,
    stop: i64,
    ingestion_time: i64,
    priority: i64,
    generation_time: i64,
}

impl EventRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            source_id: row.get(1)?,
            gauge_name: row.get(2)?,
            gauge_system: row.get(3)?,
            explicit_ref: row.get(4)?,
            key: row.get(5)?,
            start: row.get(6)?,
            stop: row.get(7)?,
            ingestion_time: row.get(8)?,
            priority: row.get(9)?,
            generation_time: row.get(10)?,
        })
    }

    fn into_record(self) -> EngineResult<EventRecord> {
        Ok(EventRecord {
            id: uuid_col(&self.id)?,
            source_id: uuid_col(&self.source_id)?,
            gauge: GaugeKey::new(self.gauge_name, self.gauge_system),
            explicit_ref: self.explicit_ref,
            key: self.key,
            span: Span::new(from_micros(self.start)?, from_micros(self.stop)?),
            ingestion_time: from_micros(self.ingestion_time)?,
            precedence: Precedence {
                priority: self.priority,
                generation_time: from_micros(self.generation_time)?,
            },
        })
    }
}

struct SourceRow {
    id: String,
    name: String,
    dim_signature: String,
    processor: String,
    version: String,
    validity_start: Option<i64>,
    validity_stop: Option<i64>,
    reported_start: Option<i64>,
    reported_stop: Option<i64>,
    generation_time: Option<i64>,
    reception_time: Option<i64>,
    ingestion_time: i64,
    priority: i64,
    status: String,
    error_kind: Option<String>,
    error_message: Option<String>,
    digest: Option<String>,
}

impl SourceRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            dim_signature: row.get(2)?,
            processor: row.get(3)?,
            version: row.get(4)?,
            validity_start: row.get(5)?,
            validity_stop: row.get(6)?,
            reported_start: row.get(7)?,
            reported_stop: row.get(8)?,
            generation_time: row.get(9)?,
            reception_time: row.get(10)?,
            ingestion_time: row.get(11)?,
            priority: row.get(12)?,
            status: row.get(13)?,
            error_kind: row.get(14)?,
            error_message: row.get(15)?,
            digest: row.get(16)?,
        })
    }

    fn into_record(self) -> EngineResult<SourceRecord> {
        Ok(SourceRecord {
            id: uuid_col(&self.id)?,
            identity: SourceIdentity {
                name: self.name,
                dim_signature: self.dim_signature,
                processor: self.processor,
                version: self.version,
            },
            validity: opt_span(self.validity_start, self.validity_stop)?,
            reported_validity: opt_span(self.reported_start, self.reported_stop)?,
            generation_time: opt_time(self.generation_time)?,
            reception_time: opt_time(self.reception_time)?,
            ingestion_time: from_micros(self.ingestion_time)?,
            priority: self.priority,
            status: SourceStatus::parse(&self.status)?,
            error_kind: self.error_kind,
            error_message: self.error_message,
            digest: self.digest,
        })
    }
}

struct AnnotationRow {
    id: String,
    source_id: String,
    explicit_ref: String,
    gauge_name: String,
    gauge_system: String,
    ingestion_time: i64,
    priority: i64,
    generation_time: i64,
}

impl AnnotationRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            source_id: row.get(1)?,
            explicit_ref: row.get(2)?,
            gauge_name: row.get(3)?,
            gauge_system: row.get(4)?,
            ingestion_time: row.get(5)?,
            priority: row.get(6)?,
            generation_time: row.get(7)?,
        })
    }

    fn into_record(self) -> EngineResult<AnnotationRecord> {
        Ok(AnnotationRecord {
            id: uuid_col(&self.id)?,
            source_id: uuid_col(&self.source_id)?,
            explicit_ref: self.explicit_ref,
            gauge: GaugeKey::new(self.gauge_name, self.gauge_system),
            ingestion_time: from_micros(self.ingestion_time)?,
            precedence: Precedence {
                priority: self.priority,
                generation_time: from_micros(self.generation_time)?,
            },
        })
    }
}

pub(crate) fn query_events(conn: &Connection, sql: &str, params: &[&dyn ToSql]) -> EngineResult<Vec<EventRecord>> {
    let mut stmt = conn.prepare_cached(sql).or_storage("prepare event query")?;
    let rows = stmt.query_map(params, EventRow::read).or_storage("query events")?;
    rows.map(|r| r.or_storage("read event row")?.into_record()).collect()
}

pub(crate) fn query_sources(conn: &Connection, sql: &str, params: &[&dyn ToSql]) -> EngineResult<Vec<SourceRecord>> {
    let mut stmt = conn.prepare_cached(sql).or_storage("prepare source query")?;
    let rows = stmt.query_map(params, SourceRow::read).or_storage("query sources")?;
    rows.map(|r| r.or_storage("read source row")?.into_record()).collect()
}

pub(crate) fn query_annotations(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> EngineResult<Vec<AnnotationRecord>> {
    let mut stmt = conn.prepare_cached(sql).or_storage("prepare annotation query")?;
    let rows = stmt.query_map(params, AnnotationRow::read).or_storage("query annotations")?;
    rows.map(|r| r.or_storage("read annotation row")?.into_record()).collect()
}

pub(crate) fn query_links(conn: &Connection, sql: &str, params: &[&dyn ToSql]) -> EngineResult<Vec<EventLinkRecord>> {
    let mut stmt = conn.prepare_cached(sql).or_storage("prepare link query")?;
    let rows = stmt
        .query_map(params, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, bool>(3)?,
            ))
        })
        .or_storage("query links")?;
    rows.map(|r| {
        let (from, to, name, synthesized) = r.or_storage("read link row")?;
        Ok(EventLinkRecord {
            from: uuid_col(&from)?,
            to: uuid_col(&to)?,
            name,
            synthesized,
        })
    })
    .collect()
}

pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

// ---------------------------------------------------------------------------
// Value trees
// ---------------------------------------------------------------------------

/// Tables holding flattened value trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueTable {
    Event,
    Annotation,
}

impl ValueTable {
    fn name(self) -> &'static str {
        match self {
            Self::Event => "event_values",
            Self::Annotation => "annotation_values",
        }
    }
}

fn write_values(conn: &Connection, table: ValueTable, owner: Uuid, values: &[NamedValue]) -> EngineResult<()> {
    let sql = format!(
        "INSERT INTO {} (owner_id, position, parent, name, kind, text_value, double_value, int_value) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        table.name()
    );
    let mut stmt = conn.prepare_cached(&sql).or_storage("prepare value insert")?;
    let mut position = 0;
    flatten(&mut stmt, &owner.to_string(), None, values, &mut position)
}

fn flatten(
    stmt: &mut Statement<'_>,
    owner: &str,
    parent: Option<i64>,
    values: &[NamedValue],
    position: &mut i64,
) -> EngineResult<()> {
    for nv in values {
        let me = *position;
        *position += 1;
        let (text, double, int): (Option<String>, Option<f64>, Option<i64>) = match &nv.value {
            Value::Text(s) => (Some(s.clone()), None, None),
            Value::Double(d) => (None, Some(*d), None),
            Value::Boolean(b) => (None, None, Some(i64::from(*b))),
            Value::Timestamp(t) => (None, None, Some(to_micros(*t))),
            Value::Geometry(p) => (Some(p.to_wkt()), None, None),
            Value::Object(_) => (None, None, None),
        };
        stmt.execute(params![owner, me, parent, nv.name, nv.value.kind().as_str(), text, double, int])
            .or_storage("insert value")?;
        if let Value::Object(children) = &nv.value {
            flatten(stmt, owner, Some(me), children, position)?;
        }
    }
    Ok(())
}

struct ValueRow {
    position: i64,
    parent: Option<i64>,
    name: String,
    kind: String,
    text: Option<String>,
    double: Option<f64>,
    int: Option<i64>,
}

impl ValueRow {
    fn leaf(&self) -> EngineResult<Value> {
        let corrupt = || EngineError::storage(format!("value {:?} has no stored {}", self.name, self.kind), false);
        Ok(match ValueKind::parse(&self.kind)? {
            ValueKind::Text => Value::Text(self.text.clone().ok_or_else(corrupt)?),
            ValueKind::Double => Value::Double(self.double.ok_or_else(corrupt)?),
            ValueKind::Boolean => Value::Boolean(self.int.ok_or_else(corrupt)? != 0),
            ValueKind::Timestamp => Value::Timestamp(from_micros(self.int.ok_or_else(corrupt)?)?),
            ValueKind::Geometry => Value::Geometry(Polygon::parse_wkt(self.text.as_deref().ok_or_else(corrupt)?)?),
            ValueKind::Object => Value::Object(Vec::new()),
        })
    }
}

fn rebuild(rows: &[ValueRow], parent: Option<i64>, next: &mut usize) -> EngineResult<Vec<NamedValue>> {
    let mut out = Vec::new();
    while let Some(row) = rows.get(*next) {
        if row.parent != parent {
            break;
        }
        *next += 1;
        let value = if row.kind == ValueKind::Object.as_str() {
            Value::Object(rebuild(rows, Some(row.position), next)?)
        } else {
            row.leaf()?
        };
        out.push(NamedValue::new(row.name.clone(), value));
    }
    Ok(out)
}

pub(crate) fn read_values(conn: &Connection, table: ValueTable, owner: Uuid) -> EngineResult<Vec<NamedValue>> {
    let sql = format!(
        "SELECT position, parent, name, kind, text_value, double_value, int_value \
         FROM {} WHERE owner_id = ?1 ORDER BY position",
        table.name()
    );
    let mut stmt = conn.prepare_cached(&sql).or_storage("prepare value query")?;
    let rows = stmt
        .query_map([owner.to_string()], |row| {
            Ok(ValueRow {
                position: row.get(0)?,
                parent: row.get(1)?,
                name: row.get(2)?,
                kind: row.get(3)?,
                text: row.get(4)?,
                double: row.get(5)?,
                int: row.get(6)?,
            })
        })
        .or_storage("query values")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .or_storage("read value row")?;
    let mut next = 0;
    rebuild(&rows, None, &mut next)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// SQLite database for the timeline.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    busy_timeout: Duration,
}

impl Store {
    /// Open or create the database described by `config`.
    pub fn open(config: &StoreConfig) -> EngineResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.root).map_err(|e| {
            EngineError::storage(format!("failed to create {}: {e}", config.root.display()), false)
        })?;

        let store = Self {
            path: config.db_path(),
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
        };
        info!(path = %store.path.display(), "opening store");

        let conn = store.connect()?;
        conn.execute_batch(schema::DATABASE_PRAGMAS)
            .or_storage("set database pragmas")?;
        schema::init_schema(&conn)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> EngineResult<Connection> {
        let conn = Connection::open(&self.path).or_storage("open database")?;
        conn.busy_timeout(self.busy_timeout).or_storage("set busy timeout")?;
        conn.execute_batch(schema::CONNECTION_PRAGMAS)
            .or_storage("set connection pragmas")?;
        Ok(conn)
    }

    /// A new connection, scoped to one operation or one query.
    pub fn session(&self) -> EngineResult<Session> {
        Ok(Session { conn: self.connect()? })
    }
}

fn links_touching(conn: &Connection, ids: &[Uuid]) -> EngineResult<Vec<EventLinkRecord>> {
    let mut out = Vec::new();
    for chunk in ids.chunks(IN_CHUNK) {
        let list = placeholders(chunk.len());
        let sql = format!(
            "SELECT from_id, to_id, name, synthesized FROM event_links \
             WHERE from_id IN ({list}) OR to_id IN ({list})"
        );
        let keys: Vec<String> = chunk.iter().map(Uuid::to_string).collect();
        let params: Vec<&dyn ToSql> = keys
            .iter()
            .chain(keys.iter())
            .map(|k| k as &dyn ToSql)
            .collect();
        out.extend(query_links(conn, &sql, &params)?);
    }
    out.sort_by(|a, b| (a.from, a.to, &a.name).cmp(&(b.from, b.to, &b.name)));
    out.dedup();
    Ok(out)
}

/// Audit record of an operation that failed.
#[derive(Debug, Clone)]
pub struct FailedSource {
    pub identity: SourceIdentity,
    pub digest: Option<String>,
    pub validity: Option<Span>,
    pub generation_time: Option<OffsetDateTime>,
    pub reception_time: Option<OffsetDateTime>,
    pub priority: i64,
    pub kind: ErrorKind,
    pub message: String,
    pub ingestion_time: OffsetDateTime,
}

/// One connection to the store.
pub struct Session {
    pub(crate) conn: Connection,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn events_where(&self, clause: &str, params: &[&dyn ToSql]) -> EngineResult<Vec<EventRecord>> {
        let sql = format!("{EVENT_SELECT} WHERE {clause} ORDER BY e.start_time, e.id");
        query_events(&self.conn, &sql, params)
    }

    /// Flush a plan atomically.
    pub fn commit_plan(&mut self, plan: &ApplyPlan) -> EngineResult<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .or_storage("begin commit")?;

        // 1) Assumptions of the plan
        for id in &plan.required_events {
            if !event_exists(&tx, *id)? {
                return Err(EngineError::links_inconsistency(format!(
                    "linked event {id} was removed before commit"
                ))
                .at("event", id.to_string()));
            }
        }
        for id in &plan.delete_events {
            if !event_exists(&tx, *id)? {
                return Err(EngineError::storage(
                    format!("event {id} was modified by a concurrent operation"),
                    true,
                ));
            }
        }
        if !plan.delete_events.is_empty() {
            let changed: Vec<Uuid> = plan.delete_events.iter().copied().collect();
            let current: BTreeSet<(Uuid, Uuid, String, bool)> = links_touching(&tx, &changed)?
                .into_iter()
                .map(|l| (l.from, l.to, l.name, l.synthesized))
                .collect();
            let observed: BTreeSet<(Uuid, Uuid, String, bool)> = plan
                .observed_links
                .iter()
                .map(|l| (l.from, l.to, l.name.clone(), l.synthesized))
                .collect();
            if current != observed {
                return Err(EngineError::storage(
                    "links of a replaced event were changed by a concurrent operation",
                    true,
                ));
            }
        }

        // 2) Source
        let s = &plan.source;
        tx.execute(
            "INSERT INTO sources (id, name, dim_signature, processor, version, validity_start, validity_stop, \
             reported_validity_start, reported_validity_stop, generation_time, reception_time, ingestion_time, \
             priority, status, digest) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                s.id.to_string(),
                s.identity.name,
                s.identity.dim_signature,
                s.identity.processor,
                s.identity.version,
                to_micros(s.validity.start),
                to_micros(s.validity.stop),
                to_micros(s.reported_validity.start),
                to_micros(s.reported_validity.stop),
                to_micros(s.generation_time),
                to_micros(s.reception_time),
                to_micros(s.ingestion_time),
                s.priority,
                SourceStatus::Ok.as_str(),
                s.digest,
            ],
        )
        .map_err(|e| {
            if is_constraint(&e) {
                EngineError::already_ingested(format!("source {} was committed concurrently", s.identity))
                    .at("source", "source")
            } else {
                storage_error("insert source", &e)
            }
        })?;

        // 3) Gauges and explicit references
        {
            let mut stmt = tx
                .prepare_cached("INSERT OR IGNORE INTO gauges (name, system, kind) VALUES (?1, ?2, ?3)")
                .or_storage("prepare gauge insert")?;
            for (gauge, kind) in &plan.gauges {
                stmt.execute(params![gauge.name, gauge.system, kind.as_str()])
                    .or_storage("insert gauge")?;
            }
        }
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO explicit_refs (name, grp, ingestion_time) VALUES (?1, ?2, ?3) \
                     ON CONFLICT(name) DO UPDATE SET grp = COALESCE(excluded.grp, explicit_refs.grp)",
                )
                .or_storage("prepare explicit reference upsert")?;
            for er in &plan.explicit_refs {
                stmt.execute(params![er.name, er.group, to_micros(s.ingestion_time)])
                    .or_storage("upsert explicit reference")?;
            }
            let mut stmt = tx
                .prepare_cached("INSERT OR IGNORE INTO explicit_ref_links (from_ref, to_ref, name) VALUES (?1, ?2, ?3)")
                .or_storage("prepare explicit reference link insert")?;
            for l in &plan.er_links {
                stmt.execute(params![l.from, l.to, l.name])
                    .or_storage("insert explicit reference link")?;
            }
        }

        // 4) Events, then values; remainders copy from their originals
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO events (id, source_id, gauge_name, gauge_system, explicit_ref, event_key, \
                     start_time, stop_time, ingestion_time) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )
                .or_storage("prepare event insert")?;
            for ev in &plan.insert_events {
                stmt.execute(params![
                    ev.id.to_string(),
                    ev.source_id.to_string(),
                    ev.gauge.name,
                    ev.gauge.system,
                    ev.explicit_ref,
                    ev.key,
                    to_micros(ev.span.start),
                    to_micros(ev.span.stop),
                    to_micros(s.ingestion_time),
                ])
                .or_storage("insert event")?;
            }
        }
        for ev in &plan.insert_events {
            match &ev.values {
                EventValues::Inline(values) => write_values(&tx, ValueTable::Event, ev.id, values)?,
                EventValues::CopyOf(orig) => {
                    tx.execute(
                        "INSERT INTO event_values (owner_id, position, parent, name, kind, text_value, \
                         double_value, int_value) \
                         SELECT ?1, position, parent, name, kind, text_value, double_value, int_value \
                         FROM event_values WHERE owner_id = ?2",
                        params![ev.id.to_string(), orig.to_string()],
                    )
                    .or_storage("copy event values")?;
                }
            }
        }

        // 5) Deletions; values and links cascade
        {
            let mut stmt = tx
                .prepare_cached("DELETE FROM events WHERE id = ?1")
                .or_storage("prepare event delete")?;
            for id in &plan.delete_events {
                stmt.execute([id.to_string()]).or_storage("delete event")?;
            }
        }

        // 6) Links
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT OR IGNORE INTO event_links (from_id, to_id, name, synthesized) VALUES (?1, ?2, ?3, ?4)",
                )
                .or_storage("prepare link insert")?;
            for l in &plan.insert_links {
                stmt.execute(params![l.from.to_string(), l.to.to_string(), l.name, l.synthesized])
                    .or_storage("insert link")?;
            }
        }

        // 7) Annotations
        {
            let mut stmt = tx
                .prepare_cached("DELETE FROM annotations WHERE id = ?1")
                .or_storage("prepare annotation delete")?;
            for id in &plan.delete_annotations {
                stmt.execute([id.to_string()]).or_storage("delete annotation")?;
            }
        }
        for a in &plan.insert_annotations {
            tx.execute(
                "INSERT INTO annotations (id, source_id, explicit_ref, gauge_name, gauge_system, ingestion_time) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    a.id.to_string(),
                    a.source_id.to_string(),
                    a.explicit_ref,
                    a.gauge.name,
                    a.gauge.system,
                    to_micros(s.ingestion_time),
                ],
            )
            .or_storage("insert annotation")?;
            write_values(&tx, ValueTable::Annotation, a.id, &a.values)?;
        }

        tx.commit().or_storage("commit")?;
        debug!(
            source_id = %s.id,
            inserted = plan.insert_events.len(),
            deleted = plan.delete_events.len(),
            links = plan.insert_links.len(),
            "plan flushed"
        );
        Ok(())
    }

    /// Persist the audit row of a failed operation.
    pub fn record_failure(&self, failed: &FailedSource) -> EngineResult<Uuid> {
        let id = Uuid::new_v4();
        let (start, stop) = match failed.validity {
            Some(v) => (Some(to_micros(v.start)), Some(to_micros(v.stop))),
            None => (None, None),
        };
        self.conn
            .execute(
                "INSERT INTO sources (id, name, dim_signature, processor, version, validity_start, validity_stop, \
                 generation_time, reception_time, ingestion_time, priority, status, error_kind, error_message, digest) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    id.to_string(),
                    failed.identity.name,
                    failed.identity.dim_signature,
                    failed.identity.processor,
                    failed.identity.version,
                    start,
                    stop,
                    failed.generation_time.map(to_micros),
                    failed.reception_time.map(to_micros),
                    to_micros(failed.ingestion_time),
                    failed.priority,
                    SourceStatus::Failed.as_str(),
                    failed.kind.as_str(),
                    failed.message,
                    failed.digest,
                ],
            )
            .or_storage("insert failed source")?;
        Ok(id)
    }
}

fn event_exists(conn: &Connection, id: Uuid) -> EngineResult<bool> {
    conn.query_row("SELECT 1 FROM events WHERE id = ?1", [id.to_string()], |_| Ok(()))
        .optional()
        .map(|found| found.is_some())
        .or_storage("look up event")
}

impl CommittedState for Session {
    fn find_source(&self, identity: &SourceIdentity) -> EngineResult<Option<SourceRecord>> {
        let sql = format!(
            "{SOURCE_SELECT} WHERE s.name = ?1 AND s.dim_signature = ?2 AND s.processor = ?3 \
             AND s.version = ?4 AND s.status = 'OK'"
        );
        let found = query_sources(
            &self.conn,
            &sql,
            &[&identity.name, &identity.dim_signature, &identity.processor, &identity.version],
        )?;
        Ok(found.into_iter().next())
    }

    fn event(&self, id: Uuid) -> EngineResult<Option<EventRecord>> {
        Ok(self.events_where("e.id = ?1", &[&id.to_string()])?.into_iter().next())
    }

    fn events_overlapping(&self, gauge: &GaugeKey, window: Span) -> EngineResult<Vec<EventRecord>> {
        self.events_where(
            "e.gauge_name = ?1 AND e.gauge_system = ?2 AND e.start_time < ?3 AND e.stop_time > ?4",
            &[&gauge.name, &gauge.system, &to_micros(window.stop), &to_micros(window.start)],
        )
    }

    fn events_by_key(&self, dim_signature: &str, key: &str) -> EngineResult<Vec<EventRecord>> {
        self.events_where("e.event_key = ?1 AND s.dim_signature = ?2", &[&key, &dim_signature])
    }

    fn events_by_gauge(
        &self,
        gauge: &GaugeKey,
        key: Option<&str>,
        explicit_ref: Option<&str>,
    ) -> EngineResult<Vec<EventRecord>> {
        match (key, explicit_ref) {
            (Some(k), _) => self.events_where(
                "e.gauge_name = ?1 AND e.gauge_system = ?2 AND e.event_key = ?3",
                &[&gauge.name, &gauge.system, &k],
            ),
            (None, Some(er)) => self.events_where(
                "e.gauge_name = ?1 AND e.gauge_system = ?2 AND e.explicit_ref = ?3",
                &[&gauge.name, &gauge.system, &er],
            ),
            (None, None) => self.events_where(
                "e.gauge_name = ?1 AND e.gauge_system = ?2",
                &[&gauge.name, &gauge.system],
            ),
        }
    }

    fn events_of_signature(&self, dim_signature: &str, window: Span) -> EngineResult<Vec<EventRecord>> {
        self.events_where(
            "s.dim_signature = ?1 AND e.start_time < ?2 AND e.stop_time > ?3",
            &[&dim_signature, &to_micros(window.stop), &to_micros(window.start)],
        )
    }

    fn links_touching(&self, ids: &[Uuid]) -> EngineResult<Vec<EventLinkRecord>> {
        links_touching(&self.conn, ids)
    }

    fn annotations_for(&self, explicit_ref: &str, gauge: &GaugeKey) -> EngineResult<Vec<AnnotationRecord>> {
        let sql = format!(
            "{ANNOTATION_SELECT} WHERE a.explicit_ref = ?1 AND a.gauge_name = ?2 AND a.gauge_system = ?3 \
             ORDER BY a.ingestion_time, a.id"
        );
        query_annotations(&self.conn, &sql, &[&explicit_ref, &gauge.name, &gauge.system])
    }

    fn sources_for_gauge(&self, gauge: &GaugeKey) -> EngineResult<Vec<SourceRecord>> {
        let sql = format!(
            "{SOURCE_SELECT} WHERE s.status = 'OK' AND EXISTS (SELECT 1 FROM events e WHERE e.source_id = s.id \
             AND e.gauge_name = ?1 AND e.gauge_system = ?2) ORDER BY s.ingestion_time, s.id"
        );
        query_sources(&self.conn, &sql, &[&gauge.name, &gauge.system])
    }

    fn sources_for_signature(&self, dim_signature: &str) -> EngineResult<Vec<SourceRecord>> {
        let sql = format!(
            "{SOURCE_SELECT} WHERE s.status = 'OK' AND s.dim_signature = ?1 ORDER BY s.ingestion_time, s.id"
        );
        query_sources(&self.conn, &sql, &[&dim_signature])
    }
}
