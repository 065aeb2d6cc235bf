//! Database schema.
//!
//! Conventions:
//! - uuids are stored as TEXT in their hyphenated form
//! - timestamps are INTEGER microseconds since the Unix epoch, UTC
//! - value trees are flattened in pre-order: `position` numbers the nodes of
//!   one owner, `parent` points at the enclosing `object` node
//!
//! Source identity is unique among OK sources only (partial index), so
//! FAILED audit rows never block a corrected resubmission.

use rusqlite::Connection;
use tracing::info;

use orbitline_core::EngineResult;

use crate::db::SqlResultExt;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Connection-level settings, applied to every connection.
pub const CONNECTION_PRAGMAS: &str = "PRAGMA foreign_keys = ON;";

/// Database-level settings, applied once when the store is opened.
pub const DATABASE_PRAGMAS: &str = "PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;";

pub fn init_schema(conn: &Connection) -> EngineResult<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("creating database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        migrate_schema(conn, current_version)?;
    } else {
        info!("database schema is up to date (v{})", current_version);
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> EngineResult<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .or_storage("create schema_version table")?;

    let version: Option<i32> = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
        .or_storage("read schema version")?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> EngineResult<()> {
    conn.execute("DELETE FROM schema_version", [])
        .or_storage("clear schema_version")?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])
        .or_storage("set schema_version")?;
    Ok(())
}

fn create_tables(conn: &Connection) -> EngineResult<()> {
    conn.execute_batch(SOURCES_SCHEMA).or_storage("create source tables")?;
    conn.execute_batch(EVENTS_SCHEMA).or_storage("create event tables")?;
    conn.execute_batch(ANNOTATIONS_SCHEMA)
        .or_storage("create annotation tables")?;
    conn.execute_batch(INDEXES_SCHEMA).or_storage("create indexes")?;
    Ok(())
}

fn migrate_schema(conn: &Connection, from_version: i32) -> EngineResult<()> {
    // v1 is the first released layout; later versions add their steps here.
    if from_version < 1 {
        create_tables(conn)?;
    }
    set_schema_version(conn, SCHEMA_VERSION)
}

const SOURCES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sources (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    dim_signature TEXT NOT NULL,
    processor TEXT NOT NULL,
    version TEXT NOT NULL,
    validity_start INTEGER,
    validity_stop INTEGER,
    reported_validity_start INTEGER,
    reported_validity_stop INTEGER,
    generation_time INTEGER,
    reception_time INTEGER,
    ingestion_time INTEGER NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL CHECK (status IN ('PENDING', 'IN_PROGRESS', 'OK', 'FAILED')),
    error_kind TEXT,
    error_message TEXT,
    digest TEXT
);

CREATE TABLE IF NOT EXISTS gauges (
    name TEXT NOT NULL,
    system TEXT NOT NULL DEFAULT '',
    kind TEXT NOT NULL CHECK (kind IN ('event', 'annotation')),
    PRIMARY KEY (name, system, kind)
);

CREATE TABLE IF NOT EXISTS explicit_refs (
    name TEXT PRIMARY KEY,
    grp TEXT,
    ingestion_time INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS explicit_ref_links (
    from_ref TEXT NOT NULL REFERENCES explicit_refs(name),
    to_ref TEXT NOT NULL REFERENCES explicit_refs(name),
    name TEXT NOT NULL,
    PRIMARY KEY (from_ref, to_ref, name)
);
"#;

const EVENTS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL REFERENCES sources(id),
    gauge_name TEXT NOT NULL,
    gauge_system TEXT NOT NULL DEFAULT '',
    explicit_ref TEXT REFERENCES explicit_refs(name),
    event_key TEXT,
    start_time INTEGER NOT NULL,
    stop_time INTEGER NOT NULL,
    ingestion_time INTEGER NOT NULL,
    CHECK (start_time < stop_time)
);

CREATE TABLE IF NOT EXISTS event_values (
    owner_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    parent INTEGER,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    text_value TEXT,
    double_value REAL,
    int_value INTEGER,
    PRIMARY KEY (owner_id, position)
);

CREATE TABLE IF NOT EXISTS event_links (
    from_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
    to_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    synthesized INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (from_id, to_id, name)
);
"#;

const ANNOTATIONS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS annotations (
    id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL REFERENCES sources(id),
    explicit_ref TEXT NOT NULL REFERENCES explicit_refs(name),
    gauge_name TEXT NOT NULL,
    gauge_system TEXT NOT NULL DEFAULT '',
    ingestion_time INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS annotation_values (
    owner_id TEXT NOT NULL REFERENCES annotations(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    parent INTEGER,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    text_value TEXT,
    double_value REAL,
    int_value INTEGER,
    PRIMARY KEY (owner_id, position)
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_sources_identity_ok
    ON sources(name, dim_signature, processor, version) WHERE status = 'OK';
CREATE INDEX IF NOT EXISTS idx_sources_signature ON sources(dim_signature, status);

CREATE INDEX IF NOT EXISTS idx_events_gauge_start ON events(gauge_name, gauge_system, start_time);
CREATE INDEX IF NOT EXISTS idx_events_key ON events(event_key) WHERE event_key IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_events_source ON events(source_id);
CREATE INDEX IF NOT EXISTS idx_events_explicit_ref ON events(explicit_ref) WHERE explicit_ref IS NOT NULL;

CREATE INDEX IF NOT EXISTS idx_event_values_name ON event_values(name, kind);
CREATE INDEX IF NOT EXISTS idx_event_links_to ON event_links(to_id, name);

CREATE INDEX IF NOT EXISTS idx_annotations_ref_gauge ON annotations(explicit_ref, gauge_name, gauge_system);
CREATE INDEX IF NOT EXISTS idx_explicit_ref_links_to ON explicit_ref_links(to_ref);
"#;
