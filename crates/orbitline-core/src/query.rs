//! Query filter model.
//!
//! A filter is `{field, op, value}`. Filters of one query are combined with
//! AND. Each entity has its own closed set of fields ([`EventField`],
//! [`SourceField`], ...), and each field has a storage type that filter values
//! are coerced to before they reach the store:
//! - timestamps accept RFC 3339 strings and compare as microseconds
//! - uuids accept their textual form
//! - `like` requires a text pattern, `in` requires a list
//!
//! Value filters ([`ValueFilter`]) match named event values of one kind.

use serde::Deserialize;
use serde_json::Value as Json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};
use crate::model::ValueKind;
use crate::timestamp::{parse_timestamp, to_micros};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "like")]
    Like,
    #[serde(rename = "in")]
    In,
}

impl FilterOp {
    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw {
            "==" => Ok(Self::Eq),
            "!=" => Ok(Self::Ne),
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::Le),
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::Ge),
            "like" => Ok(Self::Like),
            "in" => Ok(Self::In),
            other => Err(EngineError::parsing(format!("unknown filter operator {other:?}"))),
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Like => "like",
            Self::In => "in",
        }
    }
}

/// Storage type of a filterable field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Integer,
    Double,
    Boolean,
    Timestamp,
    Uuid,
}

/// A filter value as given by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Text(String),
    Integer(i64),
    Double(f64),
    Boolean(bool),
    Timestamp(OffsetDateTime),
    Uuid(Uuid),
    List(Vec<FilterValue>),
}

impl From<&str> for FilterValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<i64> for FilterValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for FilterValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<bool> for FilterValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<OffsetDateTime> for FilterValue {
    fn from(v: OffsetDateTime) -> Self {
        Self::Timestamp(v)
    }
}

impl From<Uuid> for FilterValue {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl<T: Into<FilterValue>> From<Vec<T>> for FilterValue {
    fn from(v: Vec<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

impl FilterValue {
    /// Loose JSON form used by callers that build filters from documents.
    pub fn from_json(v: &Json) -> EngineResult<Self> {
        match v {
            Json::String(s) => Ok(Self::Text(s.clone())),
            Json::Bool(b) => Ok(Self::Boolean(*b)),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Ok(Self::Integer(i)),
                None => n
                    .as_f64()
                    .map(Self::Double)
                    .ok_or_else(|| EngineError::parsing(format!("unsupported number {n}"))),
            },
            Json::Array(items) => Ok(Self::List(
                items.iter().map(Self::from_json).collect::<EngineResult<_>>()?,
            )),
            other => Err(EngineError::parsing(format!("unsupported filter value {other}"))),
        }
    }
}

/// A filter value converted to its storage representation.
#[derive(Debug, Clone, PartialEq)]
pub enum Coerced {
    Text(String),
    Integer(i64),
    Double(f64),
    List(Vec<Coerced>),
}

fn coerce_scalar(ty: FieldType, v: &FilterValue) -> EngineResult<Coerced> {
    let mismatch = || EngineError::wrong_value(format!("filter value {v:?} does not fit a {ty:?} field"));
    match (ty, v) {
        (FieldType::Text, FilterValue::Text(s)) => Ok(Coerced::Text(s.clone())),
        (FieldType::Integer, FilterValue::Integer(i)) => Ok(Coerced::Integer(*i)),
        (FieldType::Double, FilterValue::Double(d)) => Ok(Coerced::Double(*d)),
        (FieldType::Double, FilterValue::Integer(i)) => Ok(Coerced::Double(*i as f64)),
        (FieldType::Boolean, FilterValue::Boolean(b)) => Ok(Coerced::Integer(i64::from(*b))),
        (FieldType::Timestamp, FilterValue::Timestamp(t)) => Ok(Coerced::Integer(to_micros(*t))),
        (FieldType::Timestamp, FilterValue::Text(s)) => Ok(Coerced::Integer(to_micros(parse_timestamp(s)?))),
        (FieldType::Uuid, FilterValue::Uuid(u)) => Ok(Coerced::Text(u.to_string())),
        (FieldType::Uuid, FilterValue::Text(s)) => Uuid::parse_str(s)
            .map(|u| Coerced::Text(u.to_string()))
            .map_err(|e| EngineError::wrong_value(format!("invalid uuid {s:?}: {e}"))),
        _ => Err(mismatch()),
    }
}

/// Check operator/value compatibility and convert the value.
pub fn coerce(ty: FieldType, op: FilterOp, v: &FilterValue) -> EngineResult<Coerced> {
    match (op, v) {
        (FilterOp::In, FilterValue::List(items)) => Ok(Coerced::List(
            items.iter().map(|i| coerce_scalar(ty, i)).collect::<EngineResult<_>>()?,
        )),
        (FilterOp::In, _) => Err(EngineError::wrong_value("operator `in` requires a list")),
        (_, FilterValue::List(_)) => Err(EngineError::wrong_value(format!(
            "operator `{}` does not accept a list",
            op.symbol()
        ))),
        (FilterOp::Like, FilterValue::Text(s)) if matches!(ty, FieldType::Text | FieldType::Uuid) => {
            Ok(Coerced::Text(s.clone()))
        }
        (FilterOp::Like, _) => Err(EngineError::wrong_value("operator `like` requires a text field and pattern")),
        _ => coerce_scalar(ty, v),
    }
}

/// Entity fields usable in filters.
pub trait Field: Copy {
    fn name(&self) -> &'static str;
    fn field_type(&self) -> FieldType;
}

macro_rules! fields {
    ($(#[$meta:meta])* $ty:ident { $($variant:ident => ($name:literal, $ft:ident)),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $ty {
            $($variant),+
        }

        impl Field for $ty {
            fn name(&self) -> &'static str {
                match self {
                    $(Self::$variant => $name),+
                }
            }

            fn field_type(&self) -> FieldType {
                match self {
                    $(Self::$variant => FieldType::$ft),+
                }
            }
        }
    };
}

fields!(EventField {
    Id => ("id", Uuid),
    SourceId => ("source_id", Uuid),
    GaugeName => ("gauge_name", Text),
    GaugeSystem => ("gauge_system", Text),
    ExplicitRef => ("explicit_ref", Text),
    Key => ("key", Text),
    Start => ("start", Timestamp),
    Stop => ("stop", Timestamp),
    IngestionTime => ("ingestion_time", Timestamp),
});

fields!(SourceField {
    Id => ("id", Uuid),
    Name => ("name", Text),
    DimSignature => ("dim_signature", Text),
    Processor => ("processor", Text),
    Version => ("version", Text),
    ValidityStart => ("validity_start", Timestamp),
    ValidityStop => ("validity_stop", Timestamp),
    GenerationTime => ("generation_time", Timestamp),
    ReceptionTime => ("reception_time", Timestamp),
    IngestionTime => ("ingestion_time", Timestamp),
    Priority => ("priority", Integer),
    Status => ("status", Text),
});

fields!(AnnotationField {
    Id => ("id", Uuid),
    SourceId => ("source_id", Uuid),
    ExplicitRef => ("explicit_ref", Text),
    GaugeName => ("gauge_name", Text),
    GaugeSystem => ("gauge_system", Text),
    IngestionTime => ("ingestion_time", Timestamp),
});

fields!(ExplicitRefField {
    Name => ("name", Text),
    Group => ("group", Text),
    IngestionTime => ("ingestion_time", Timestamp),
});

fields!(LinkField {
    From => ("from", Uuid),
    To => ("to", Uuid),
    Name => ("name", Text),
});

/// `{field, op, value}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter<F> {
    pub field: F,
    pub op: FilterOp,
    pub value: FilterValue,
}

impl<F: Field> Filter<F> {
    pub fn new(field: F, op: FilterOp, value: impl Into<FilterValue>) -> Self {
        Self {
            field,
            op,
            value: value.into(),
        }
    }

    pub fn equals(field: F, value: impl Into<FilterValue>) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    /// Validate and convert the value for this field.
    pub fn coerced(&self) -> EngineResult<Coerced> {
        coerce(self.field.field_type(), self.op, &self.value)
            .map_err(|e| e.at("filter", self.field.name()))
    }
}

/// JSON form of a filter: `{"field": ..., "op": ..., "value": ...}`.
#[derive(Debug, Deserialize)]
struct RawFilter<F> {
    field: F,
    op: FilterOp,
    value: Json,
}

/// Parse a JSON array of filters.
pub fn filters_from_json<F>(v: &Json) -> EngineResult<Vec<Filter<F>>>
where
    F: Field + for<'de> Deserialize<'de>,
{
    let raw: Vec<RawFilter<F>> = serde_json::from_value(v.clone())
        .map_err(|e| EngineError::parsing(format!("invalid filters: {e}")))?;
    raw.into_iter()
        .map(|r| {
            let f = Filter {
                field: r.field,
                op: r.op,
                value: FilterValue::from_json(&r.value)?,
            };
            f.coerced()?;
            Ok(f)
        })
        .collect()
}

/// Filter on a named event value.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueFilter {
    pub name: String,
    pub kind: ValueKind,
    pub op: FilterOp,
    pub value: FilterValue,
}

impl ValueFilter {
    pub fn new(name: impl Into<String>, kind: ValueKind, op: FilterOp, value: impl Into<FilterValue>) -> Self {
        Self {
            name: name.into(),
            kind,
            op,
            value: value.into(),
        }
    }

    pub fn coerced(&self) -> EngineResult<Coerced> {
        let ty = match self.kind {
            ValueKind::Text => FieldType::Text,
            ValueKind::Double => FieldType::Double,
            ValueKind::Boolean => FieldType::Boolean,
            ValueKind::Timestamp => FieldType::Timestamp,
            ValueKind::Geometry | ValueKind::Object => {
                return Err(EngineError::wrong_value(format!(
                    "values of kind {} cannot be filtered",
                    self.kind.as_str()
                ))
                .at("value_filter", self.name.clone()))
            }
        };
        coerce(ty, self.op, &self.value).map_err(|e| e.at("value_filter", self.name.clone()))
    }
}

/// Event query: column filters, value filters, ordering by start.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub filters: Vec<Filter<EventField>>,
    pub value_filters: Vec<ValueFilter>,
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, field: EventField, op: FilterOp, value: impl Into<FilterValue>) -> Self {
        self.filters.push(Filter::new(field, op, value));
        self
    }

    pub fn value(mut self, filter: ValueFilter) -> Self {
        self.value_filters.push(filter);
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Events overlapping `[start, stop)`.
    pub fn overlapping(self, start: OffsetDateTime, stop: OffsetDateTime) -> Self {
        self.filter(EventField::Start, FilterOp::Lt, stop)
            .filter(EventField::Stop, FilterOp::Gt, start)
    }
}
