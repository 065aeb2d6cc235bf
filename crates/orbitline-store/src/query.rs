//! Query surface.
//!
//! Filters come from `orbitline_core::query` already typed; this module maps
//! them onto columns and binds their coerced values. Filters combine with
//! AND. On top of plain entity queries it offers the graph helpers used by
//! downstream views:
//! - [`Session::get_linked_events`]: prime events and the events they link to
//! - [`Session::get_linking_events`]: prime events and the events linking to them
//! - [`Session::get_linking_events_group_by_link_name`]: same, grouped by the
//!   name of the incoming link
//!
//! Results are ordered deterministically (events by start then id).

use std::collections::{BTreeMap, BTreeSet};

use rusqlite::types::Null;
use rusqlite::ToSql;
use uuid::Uuid;

use orbitline_core::model::{
    AnnotationRecord, ErLinkRecord, EventLinkRecord, EventRecord, ExplicitRefRecord, GaugeKey, GaugeKind,
    GaugeRecord, NamedValue, SourceRecord, ValueKind,
};
use orbitline_core::query::{
    AnnotationField, Coerced, EventField, EventQuery, ExplicitRefField, Filter, FilterOp, LinkField, SourceField,
    ValueFilter,
};
use orbitline_core::timestamp::from_micros;
use orbitline_core::{EngineError, EngineResult};

use crate::db::{
    placeholders, query_annotations, query_events, query_links, query_sources, read_values, uuid_col, Session,
    SqlResultExt, ValueTable, ANNOTATION_SELECT, EVENT_SELECT, IN_CHUNK, SOURCE_SELECT,
};

/// WHERE clause under construction.
#[derive(Default)]
struct Conditions {
    clauses: Vec<String>,
    params: Vec<Box<dyn ToSql>>,
}

fn bind(c: Coerced) -> Box<dyn ToSql> {
    match c {
        Coerced::Text(s) => Box::new(s),
        Coerced::Integer(i) => Box::new(i),
        Coerced::Double(d) => Box::new(d),
        // Nested lists are never produced by coercion.
        Coerced::List(_) => Box::new(Null),
    }
}

/// `column op ?` for one coerced value.
fn comparison(column: &str, op: FilterOp, value: Coerced, params: &mut Vec<Box<dyn ToSql>>) -> String {
    match (op, value) {
        (FilterOp::In, Coerced::List(items)) => {
            if items.is_empty() {
                return "0".to_string();
            }
            let list = placeholders(items.len());
            params.extend(items.into_iter().map(bind));
            format!("{column} IN ({list})")
        }
        (op, value) => {
            let sql_op = match op {
                FilterOp::Eq | FilterOp::In => "=",
                FilterOp::Ne => "IS NOT",
                FilterOp::Lt => "<",
                FilterOp::Le => "<=",
                FilterOp::Gt => ">",
                FilterOp::Ge => ">=",
                FilterOp::Like => "LIKE",
            };
            params.push(bind(value));
            format!("{column} {sql_op} ?")
        }
    }
}

impl Conditions {
    fn push<F: orbitline_core::query::Field>(
        &mut self,
        filter: &Filter<F>,
        column: impl Fn(F) -> &'static str,
    ) -> EngineResult<()> {
        let value = filter.coerced()?;
        let clause = comparison(column(filter.field), filter.op, value, &mut self.params);
        self.clauses.push(clause);
        Ok(())
    }

    fn push_value(&mut self, filter: &ValueFilter) -> EngineResult<()> {
        let value = filter.coerced()?;
        let column = match filter.kind {
            ValueKind::Text => "v.text_value",
            ValueKind::Double => "v.double_value",
            _ => "v.int_value",
        };
        let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(filter.name.clone()), Box::new(filter.kind.as_str())];
        let cmp = comparison(column, filter.op, value, &mut params);
        self.clauses.push(format!(
            "EXISTS (SELECT 1 FROM event_values v WHERE v.owner_id = e.id AND v.name = ? AND v.kind = ? AND {cmp})"
        ));
        self.params.extend(params);
        Ok(())
    }

    fn raw(&mut self, clause: impl Into<String>) {
        self.clauses.push(clause.into());
    }

    fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    fn refs(&self) -> Vec<&dyn ToSql> {
        self.params.iter().map(|p| p.as_ref()).collect()
    }
}

fn event_column(f: EventField) -> &'static str {
    match f {
        EventField::Id => "e.id",
        EventField::SourceId => "e.source_id",
        EventField::GaugeName => "e.gauge_name",
        EventField::GaugeSystem => "e.gauge_system",
        EventField::ExplicitRef => "e.explicit_ref",
        EventField::Key => "e.event_key",
        EventField::Start => "e.start_time",
        EventField::Stop => "e.stop_time",
        EventField::IngestionTime => "e.ingestion_time",
    }
}

fn source_column(f: SourceField) -> &'static str {
    match f {
        SourceField::Id => "s.id",
        SourceField::Name => "s.name",
        SourceField::DimSignature => "s.dim_signature",
        SourceField::Processor => "s.processor",
        SourceField::Version => "s.version",
        SourceField::ValidityStart => "s.validity_start",
        SourceField::ValidityStop => "s.validity_stop",
        SourceField::GenerationTime => "s.generation_time",
        SourceField::ReceptionTime => "s.reception_time",
        SourceField::IngestionTime => "s.ingestion_time",
        SourceField::Priority => "s.priority",
        SourceField::Status => "s.status",
    }
}

fn annotation_column(f: AnnotationField) -> &'static str {
    match f {
        AnnotationField::Id => "a.id",
        AnnotationField::SourceId => "a.source_id",
        AnnotationField::ExplicitRef => "a.explicit_ref",
        AnnotationField::GaugeName => "a.gauge_name",
        AnnotationField::GaugeSystem => "a.gauge_system",
        AnnotationField::IngestionTime => "a.ingestion_time",
    }
}

fn explicit_ref_column(f: ExplicitRefField) -> &'static str {
    match f {
        ExplicitRefField::Name => "r.name",
        ExplicitRefField::Group => "r.grp",
        ExplicitRefField::IngestionTime => "r.ingestion_time",
    }
}

fn link_column(f: LinkField) -> &'static str {
    match f {
        LinkField::From => "l.from_id",
        LinkField::To => "l.to_id",
        LinkField::Name => "l.name",
    }
}

/// Prime events plus the links to follow from them.
#[derive(Debug, Clone, Default)]
pub struct LinkQuery {
    pub prime: EventQuery,
    /// Link names to follow. Empty follows every link.
    pub link_names: Vec<String>,
    /// Leave `prime_events` empty in the result.
    pub skip_prime_events: bool,
}

impl LinkQuery {
    pub fn new(prime: EventQuery) -> Self {
        Self {
            prime,
            ..Self::default()
        }
    }

    pub fn link_name(mut self, name: impl Into<String>) -> Self {
        self.link_names.push(name.into());
        self
    }

    pub fn without_prime_events(mut self) -> Self {
        self.skip_prime_events = true;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct LinkedEvents {
    pub prime_events: Vec<EventRecord>,
    pub linked_events: Vec<EventRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct LinkingEvents {
    pub prime_events: Vec<EventRecord>,
    pub linking_events: Vec<EventRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct LinkingEventsByName {
    pub prime_events: Vec<EventRecord>,
    pub linking_events: BTreeMap<String, Vec<EventRecord>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Links leaving the prime events.
    Outgoing,
    /// Links arriving at the prime events.
    Incoming,
}

impl Session {
    /// Events matching every filter, ordered by start.
    pub fn get_events(&self, query: &EventQuery) -> EngineResult<Vec<EventRecord>> {
        let mut cond = Conditions::default();
        for f in &query.filters {
            cond.push(f, event_column)?;
        }
        for vf in &query.value_filters {
            cond.push_value(vf)?;
        }
        let mut sql = format!("{EVENT_SELECT}{} ORDER BY e.start_time, e.id", cond.sql());
        if let Some(n) = query.limit {
            sql.push_str(&format!(" LIMIT {n}"));
        }
        query_events(&self.conn, &sql, &cond.refs())
    }

    pub fn get_event(&self, id: Uuid) -> EngineResult<Option<EventRecord>> {
        let query = EventQuery::new().filter(EventField::Id, FilterOp::Eq, id);
        Ok(self.get_events(&query)?.into_iter().next())
    }

    /// Sources of every status.
    pub fn get_sources(&self, filters: &[Filter<SourceField>]) -> EngineResult<Vec<SourceRecord>> {
        let mut cond = Conditions::default();
        for f in filters {
            cond.push(f, source_column)?;
        }
        let sql = format!("{SOURCE_SELECT}{} ORDER BY s.ingestion_time, s.id", cond.sql());
        query_sources(&self.conn, &sql, &cond.refs())
    }

    pub fn get_annotations(&self, filters: &[Filter<AnnotationField>]) -> EngineResult<Vec<AnnotationRecord>> {
        let mut cond = Conditions::default();
        for f in filters {
            cond.push(f, annotation_column)?;
        }
        let sql = format!("{ANNOTATION_SELECT}{} ORDER BY a.ingestion_time, a.id", cond.sql());
        query_annotations(&self.conn, &sql, &cond.refs())
    }

    pub fn get_explicit_refs(&self, filters: &[Filter<ExplicitRefField>]) -> EngineResult<Vec<ExplicitRefRecord>> {
        let mut cond = Conditions::default();
        for f in filters {
            cond.push(f, explicit_ref_column)?;
        }
        let sql = format!(
            "SELECT r.name, r.grp, r.ingestion_time FROM explicit_refs r{} ORDER BY r.name",
            cond.sql()
        );
        let mut stmt = self.conn.prepare_cached(&sql).or_storage("prepare explicit reference query")?;
        let rows = stmt
            .query_map(cond.refs().as_slice(), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .or_storage("query explicit references")?;
        rows.map(|r| {
            let (name, group, ingestion_time) = r.or_storage("read explicit reference row")?;
            Ok(ExplicitRefRecord {
                name,
                group,
                ingestion_time: from_micros(ingestion_time)?,
            })
        })
        .collect()
    }

    pub fn get_event_links(&self, filters: &[Filter<LinkField>]) -> EngineResult<Vec<EventLinkRecord>> {
        let mut cond = Conditions::default();
        for f in filters {
            cond.push(f, link_column)?;
        }
        let sql = format!(
            "SELECT l.from_id, l.to_id, l.name, l.synthesized FROM event_links l{} ORDER BY l.from_id, l.to_id, l.name",
            cond.sql()
        );
        query_links(&self.conn, &sql, &cond.refs())
    }

    pub fn get_event_values(&self, event_id: Uuid) -> EngineResult<Vec<NamedValue>> {
        read_values(&self.conn, ValueTable::Event, event_id)
    }

    pub fn get_annotation_values(&self, annotation_id: Uuid) -> EngineResult<Vec<NamedValue>> {
        read_values(&self.conn, ValueTable::Annotation, annotation_id)
    }

    /// Registered gauges, optionally of one kind.
    pub fn get_gauges(&self, kind: Option<GaugeKind>) -> EngineResult<Vec<GaugeRecord>> {
        let mut cond = Conditions::default();
        if let Some(k) = kind {
            cond.raw("kind = ?");
            cond.params.push(Box::new(k.as_str()));
        }
        let sql = format!("SELECT name, system, kind FROM gauges{} ORDER BY name, system, kind", cond.sql());
        let mut stmt = self.conn.prepare_cached(&sql).or_storage("prepare gauge query")?;
        let rows = stmt
            .query_map(cond.refs().as_slice(), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })
            .or_storage("query gauges")?;
        rows.map(|r| {
            let (name, system, kind) = r.or_storage("read gauge row")?;
            let kind = match kind.as_str() {
                "event" => GaugeKind::Event,
                "annotation" => GaugeKind::Annotation,
                other => return Err(EngineError::storage(format!("unknown gauge kind {other:?}"), false)),
            };
            Ok(GaugeRecord {
                gauge: GaugeKey::new(name, system),
                kind,
            })
        })
        .collect()
    }

    /// Links between explicit references with `name` at either end.
    pub fn get_explicit_ref_links(&self, name: &str) -> EngineResult<Vec<ErLinkRecord>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT from_ref, to_ref, name FROM explicit_ref_links WHERE from_ref = ?1 OR to_ref = ?1 \
                 ORDER BY from_ref, to_ref, name",
            )
            .or_storage("prepare explicit reference link query")?;
        let rows = stmt
            .query_map([name], |row| {
                Ok(ErLinkRecord {
                    from: row.get(0)?,
                    to: row.get(1)?,
                    name: row.get(2)?,
                })
            })
            .or_storage("query explicit reference links")?;
        rows.map(|r| r.or_storage("read explicit reference link row")).collect()
    }

    /// Explicit references `name` links to, optionally through one link name.
    pub fn get_linked_explicit_refs(&self, name: &str, link_name: Option<&str>) -> EngineResult<Vec<ExplicitRefRecord>> {
        let targets: BTreeSet<String> = self
            .get_explicit_ref_links(name)?
            .into_iter()
            .filter(|l| l.from == name && link_name.map(|n| n == l.name).unwrap_or(true))
            .map(|l| l.to)
            .collect();
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        let filter = Filter::new(
            ExplicitRefField::Name,
            FilterOp::In,
            targets.into_iter().collect::<Vec<String>>(),
        );
        self.get_explicit_refs(&[filter])
    }

    fn follow(&self, query: &LinkQuery, direction: Direction) -> EngineResult<(Vec<EventRecord>, Vec<(String, Uuid)>)> {
        let prime = self.get_events(&query.prime)?;
        if prime.is_empty() {
            return Ok((prime, Vec::new()));
        }
        let ids: Vec<String> = prime.iter().map(|e| e.id.to_string()).collect();
        let (anchor, other) = match direction {
            Direction::Outgoing => ("from_id", "to_id"),
            Direction::Incoming => ("to_id", "from_id"),
        };

        let mut hops = Vec::new();
        for chunk in ids.chunks(IN_CHUNK) {
            let mut params: Vec<&dyn ToSql> = chunk.iter().map(|k| k as &dyn ToSql).collect();
            let mut sql = format!(
                "SELECT name, {other} FROM event_links WHERE {anchor} IN ({})",
                placeholders(chunk.len())
            );
            if !query.link_names.is_empty() {
                sql.push_str(&format!(" AND name IN ({})", placeholders(query.link_names.len())));
                params.extend(query.link_names.iter().map(|n| n as &dyn ToSql));
            }
            let mut stmt = self.conn.prepare_cached(&sql).or_storage("prepare link traversal")?;
            let rows = stmt
                .query_map(params.as_slice(), |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
                .or_storage("traverse links")?;
            for r in rows {
                let (name, id) = r.or_storage("read link row")?;
                hops.push((name, uuid_col(&id)?));
            }
        }
        hops.sort();
        hops.dedup();
        Ok((prime, hops))
    }

    fn events_by_ids(&self, ids: &BTreeSet<Uuid>) -> EngineResult<BTreeMap<Uuid, EventRecord>> {
        let mut out = BTreeMap::new();
        let all: Vec<Uuid> = ids.iter().copied().collect();
        for chunk in all.chunks(IN_CHUNK) {
            let query = EventQuery::new().filter(EventField::Id, FilterOp::In, chunk.to_vec());
            for ev in self.get_events(&query)? {
                out.insert(ev.id, ev);
            }
        }
        Ok(out)
    }

    fn sorted(mut events: Vec<EventRecord>) -> Vec<EventRecord> {
        events.sort_by_key(|e| (e.span.start, e.id));
        events
    }

    /// Prime events and the events they link to.
    pub fn get_linked_events(&self, query: &LinkQuery) -> EngineResult<LinkedEvents> {
        let (prime, hops) = self.follow(query, Direction::Outgoing)?;
        let targets: BTreeSet<Uuid> = hops.into_iter().map(|(_, id)| id).collect();
        let linked = self.events_by_ids(&targets)?.into_values().collect();
        Ok(LinkedEvents {
            prime_events: if query.skip_prime_events { Vec::new() } else { prime },
            linked_events: Self::sorted(linked),
        })
    }

    /// Prime events and the events linking to them.
    pub fn get_linking_events(&self, query: &LinkQuery) -> EngineResult<LinkingEvents> {
        let (prime, hops) = self.follow(query, Direction::Incoming)?;
        let sources: BTreeSet<Uuid> = hops.into_iter().map(|(_, id)| id).collect();
        let linking = self.events_by_ids(&sources)?.into_values().collect();
        Ok(LinkingEvents {
            prime_events: if query.skip_prime_events { Vec::new() } else { prime },
            linking_events: Self::sorted(linking),
        })
    }

    /// Events linking to the prime events, grouped by link name.
    pub fn get_linking_events_group_by_link_name(&self, query: &LinkQuery) -> EngineResult<LinkingEventsByName> {
        let (prime, hops) = self.follow(query, Direction::Incoming)?;
        let ids: BTreeSet<Uuid> = hops.iter().map(|(_, id)| *id).collect();
        let events = self.events_by_ids(&ids)?;

        let mut grouped: BTreeMap<String, Vec<EventRecord>> = BTreeMap::new();
        for (name, id) in hops {
            if let Some(ev) = events.get(&id) {
                let group = grouped.entry(name).or_default();
                if !group.iter().any(|e| e.id == id) {
                    group.push(ev.clone());
                }
            }
        }
        let grouped = grouped
            .into_iter()
            .map(|(name, evs)| (name, Self::sorted(evs)))
            .collect();
        Ok(LinkingEventsByName {
            prime_events: if query.skip_prime_events { Vec::new() } else { prime },
            linking_events: grouped,
        })
    }
}
