//! Typed values attached to events and annotations.
//!
//! A value list is a tree: `object` values hold a nested list. Every leaf is
//! one of the closed set of kinds in [`ValueKind`]. Values are converted from
//! the loose wire shapes exactly once, in the validation stage.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::errors::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Text,
    Double,
    Boolean,
    Timestamp,
    Geometry,
    Object,
}

impl ValueKind {
    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw {
            "text" => Ok(Self::Text),
            "double" => Ok(Self::Double),
            "boolean" => Ok(Self::Boolean),
            "timestamp" => Ok(Self::Timestamp),
            "geometry" => Ok(Self::Geometry),
            "object" => Ok(Self::Object),
            other => Err(EngineError::wrong_value(format!(
                "unknown value type {other:?}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Double => "double",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp",
            Self::Geometry => "geometry",
            Self::Object => "object",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Double(f64),
    Boolean(bool),
    Timestamp(OffsetDateTime),
    Geometry(Polygon),
    Object(Vec<NamedValue>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Text(_) => ValueKind::Text,
            Self::Double(_) => ValueKind::Double,
            Self::Boolean(_) => ValueKind::Boolean,
            Self::Timestamp(_) => ValueKind::Timestamp,
            Self::Geometry(_) => ValueKind::Geometry,
            Self::Object(_) => ValueKind::Object,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&[NamedValue]> {
        match self {
            Self::Object(v) => Some(v),
            _ => None,
        }
    }

    /// Nesting depth: leaves are 1.
    pub fn depth(&self) -> usize {
        match self {
            Self::Object(children) => 1 + children.iter().map(|c| c.value.depth()).max().unwrap_or(0),
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamedValue {
    pub name: String,
    pub value: Value,
}

impl NamedValue {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn text(name: impl Into<String>, v: impl Into<String>) -> Self {
        Self::new(name, Value::Text(v.into()))
    }

    pub fn double(name: impl Into<String>, v: f64) -> Self {
        Self::new(name, Value::Double(v))
    }

    pub fn boolean(name: impl Into<String>, v: bool) -> Self {
        Self::new(name, Value::Boolean(v))
    }
}

/// First value named `name` at the top level of `values`.
pub fn find_value<'a>(values: &'a [NamedValue], name: &str) -> Option<&'a Value> {
    values.iter().find(|v| v.name == name).map(|v| &v.value)
}

/// A single closed ring of `(lat, lon)` pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    ring: Vec<Coordinate>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Polygon {
    /// Parse either a `POLYGON ((lon lat, ...))` WKT string or a flat
    /// `"lat lon lat lon ..."` coordinate list.
    pub fn parse(raw: &str) -> EngineResult<Self> {
        let trimmed = raw.trim();
        if trimmed
            .get(..7)
            .map(|p| p.eq_ignore_ascii_case("POLYGON"))
            .unwrap_or(false)
        {
            Self::parse_wkt(trimmed)
        } else {
            Self::parse_coordinates(trimmed)
        }
    }

    /// Flat list of numbers: latitude then longitude, repeated.
    pub fn parse_coordinates(raw: &str) -> EngineResult<Self> {
        let numbers = raw
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
            .map(|t| {
                t.parse::<f64>()
                    .map_err(|_| EngineError::wrong_geometry(format!("coordinate {t:?} is not a number")))
            })
            .collect::<EngineResult<Vec<f64>>>()?;

        if numbers.is_empty() || numbers.len() % 2 != 0 {
            return Err(EngineError::odd_coordinates(format!(
                "expected an even, non-zero number of coordinates, got {}",
                numbers.len()
            )));
        }

        let ring = numbers
            .chunks_exact(2)
            .map(|pair| Coordinate {
                lat: pair[0],
                lon: pair[1],
            })
            .collect();
        Self::from_ring(ring)
    }

    /// WKT polygon with a single outer ring, `lon lat` per vertex.
    pub fn parse_wkt(raw: &str) -> EngineResult<Self> {
        let body = raw
            .get(7..)
            .filter(|_| raw[..7].eq_ignore_ascii_case("POLYGON"))
            .map(str::trim)
            .ok_or_else(|| EngineError::wrong_geometry("expected POLYGON text"))?;
        let inner = body
            .strip_prefix('(')
            .and_then(|b| b.strip_suffix(')'))
            .map(str::trim)
            .ok_or_else(|| EngineError::wrong_geometry("malformed POLYGON text"))?;
        let ring_text = inner
            .strip_prefix('(')
            .and_then(|b| b.strip_suffix(')'))
            .ok_or_else(|| EngineError::wrong_geometry("malformed POLYGON ring"))?;
        if ring_text.contains('(') || ring_text.contains(')') {
            return Err(EngineError::wrong_geometry(
                "only polygons with a single ring are supported",
            ));
        }

        let mut ring = Vec::new();
        for vertex in ring_text.split(',') {
            let parts: Vec<&str> = vertex.split_whitespace().collect();
            if parts.len() != 2 {
                return Err(EngineError::odd_coordinates(format!(
                    "vertex {:?} does not have exactly two coordinates",
                    vertex.trim()
                )));
            }
            let lon = parse_number(parts[0])?;
            let lat = parse_number(parts[1])?;
            ring.push(Coordinate { lat, lon });
        }
        Self::from_ring(ring)
    }

    fn from_ring(ring: Vec<Coordinate>) -> EngineResult<Self> {
        if ring.len() < 4 {
            return Err(EngineError::wrong_geometry(format!(
                "a closed ring needs at least 4 coordinate pairs, got {}",
                ring.len()
            )));
        }
        for c in &ring {
            if !c.lat.is_finite() || !c.lon.is_finite() {
                return Err(EngineError::wrong_geometry("non-finite coordinate"));
            }
            if !(-90.0..=90.0).contains(&c.lat) || !(-180.0..=180.0).contains(&c.lon) {
                return Err(EngineError::wrong_geometry(format!(
                    "coordinate ({}, {}) is out of range",
                    c.lat, c.lon
                )));
            }
        }
        if ring.first() != ring.last() {
            return Err(EngineError::wrong_geometry("ring is not closed"));
        }
        Ok(Self { ring })
    }

    pub fn ring(&self) -> &[Coordinate] {
        &self.ring
    }

    pub fn to_wkt(&self) -> String {
        let vertices: Vec<String> = self
            .ring
            .iter()
            .map(|c| format!("{} {}", c.lon, c.lat))
            .collect();
        format!("POLYGON (({}))", vertices.join(", "))
    }
}

fn parse_number(t: &str) -> EngineResult<f64> {
    t.parse::<f64>()
        .map_err(|_| EngineError::wrong_geometry(format!("coordinate {t:?} is not a number")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn coordinate_list_round_trips_through_wkt() {
        let p = Polygon::parse("10 20 10 21 11 21 10 20").unwrap();
        assert_eq!(p.ring().len(), 4);
        assert_eq!(p.to_wkt(), "POLYGON ((20 10, 21 10, 21 11, 20 10))");
        assert_eq!(Polygon::parse(&p.to_wkt()).unwrap(), p);
    }

    #[test]
    fn odd_coordinate_count_is_rejected() {
        let e = Polygon::parse("10 20 10 21 11").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::OddNumberOfCoordinates);
        let e = Polygon::parse("").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::OddNumberOfCoordinates);
    }

    #[test]
    fn open_ring_is_wrong_geometry() {
        let e = Polygon::parse("10 20 10 21 11 21 12 22").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::WrongGeometry);
    }

    #[test]
    fn out_of_range_latitude_is_wrong_geometry() {
        let e = Polygon::parse("95 20 10 21 11 21 95 20").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::WrongGeometry);
    }

    #[test]
    fn multi_ring_wkt_is_rejected() {
        let e = Polygon::parse("POLYGON ((0 0, 1 0, 1 1, 0 0), (0 0, 1 0, 1 1, 0 0))").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::WrongGeometry);
    }

    #[test]
    fn value_kind_parsing() {
        assert_eq!(ValueKind::parse("geometry").unwrap(), ValueKind::Geometry);
        assert_eq!(ValueKind::parse("float").unwrap_err().kind(), ErrorKind::WrongValue);
    }

    #[test]
    fn depth_counts_nesting() {
        let v = Value::Object(vec![NamedValue::new(
            "outer",
            Value::Object(vec![NamedValue::double("x", 1.0)]),
        )]);
        assert_eq!(v.depth(), 3);
        assert_eq!(Value::Boolean(true).depth(), 1);
    }
}
