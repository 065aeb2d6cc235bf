//! Validation: wire operation to typed [`Operation`].
//!
//! Checks, in order:
//! - structure: mode, signature, source times, policies, link modes, limits
//!   (`ErrorParsingDictionary`)
//! - typed values and geometries (`WrongValue`, `OddNumberOfCoordinates`,
//!   `WrongGeometry`)
//! - periods: every event and the source validity satisfy `start < stop`
//!   (`WrongPeriod`)
//!
//! The corrected validity of the source is computed here: the declared window
//! widened to the hull of the events, or the hull alone when no window is
//! declared. Reported validity defaults to the declared window.

use serde_json::Value as Json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};
use crate::interval::hull;
use crate::model::wire::{WireAnnotation, WireEvent, WireExplicitRef, WireGauge, WireLink, WireValue};
use crate::model::{
    AnnotationSpec, DimSignature, ErLinkSpec, EventSpec, ExplicitRefSpec, GaugeKey, InsertionPolicy,
    LinkMode, LinkSpec, LinkTarget, NamedValue, Operation, OperationMode, Polygon, SourceSpec, Span,
    Value, ValueKind,
};
use crate::pipeline::{PipelineContext, Submitted};
use crate::timestamp::parse_timestamp;

/// Validate one submitted operation.
pub fn validate_operation(ctx: &mut PipelineContext<'_>, submitted: Submitted) -> EngineResult<Operation> {
    let Submitted { wire, digest } = submitted;
    let limits = &ctx.config.limits;

    let mode = OperationMode::parse(&wire.mode).map_err(|e| e.at("operation", "mode"))?;

    let signature = DimSignature {
        name: required(&wire.dim_signature.name, "dim_signature.name")?,
        exec: required(&wire.dim_signature.exec, "dim_signature.exec")?,
        version: required(&wire.dim_signature.version, "dim_signature.version")?,
    };

    if wire.events.len() > limits.max_events {
        return Err(EngineError::parsing(format!(
            "operation carries {} events, limit is {}",
            wire.events.len(),
            limits.max_events
        )));
    }

    let explicit_refs = wire
        .explicit_references
        .iter()
        .enumerate()
        .map(|(i, er)| explicit_ref(er).map_err(|e| e.at("explicit_reference", format!("explicit_references[{i}]"))))
        .collect::<EngineResult<Vec<_>>>()?;

    let max_depth = limits.max_value_depth;
    let events = wire
        .events
        .iter()
        .enumerate()
        .map(|(i, ev)| event(ev, max_depth).map_err(|e| e.at("event", format!("events[{i}]"))))
        .collect::<EngineResult<Vec<_>>>()?;

    let annotations = wire
        .annotations
        .iter()
        .enumerate()
        .map(|(i, an)| annotation(an, max_depth).map_err(|e| e.at("annotation", format!("annotations[{i}]"))))
        .collect::<EngineResult<Vec<_>>>()?;

    let source = source(ctx, &wire.source, &events).map_err(|e| e.at("source", wire.source.name.clone()))?;

    if source.validity.start >= source.validity.stop {
        return Err(EngineError::wrong_period(format!(
            "corrected validity of source {} does not satisfy start < stop",
            source.name
        ))
        .at("source", source.name.clone()));
    }

    ctx.push_info(
        "validate.summary",
        format!(
            "{} events, {} annotations, {} explicit references",
            events.len(),
            annotations.len(),
            explicit_refs.len()
        ),
    );

    Ok(Operation {
        mode,
        signature,
        source,
        explicit_refs,
        events,
        annotations,
        digest,
    })
}

fn required(raw: &str, field: &str) -> EngineResult<String> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(EngineError::parsing(format!("{field} must not be empty")));
    }
    Ok(s.to_string())
}

fn optional_time(raw: &Option<String>) -> EngineResult<Option<OffsetDateTime>> {
    raw.as_deref().map(parse_timestamp).transpose()
}

fn window(start: &Option<String>, stop: &Option<String>, what: &str) -> EngineResult<Option<Span>> {
    match (optional_time(start)?, optional_time(stop)?) {
        (Some(start), Some(stop)) => {
            if start >= stop {
                return Err(EngineError::wrong_period(format!(
                    "{what} does not satisfy start < stop"
                )));
            }
            Ok(Some(Span::new(start, stop)))
        }
        (None, None) => Ok(None),
        _ => Err(EngineError::parsing(format!(
            "{what} needs both a start and a stop"
        ))),
    }
}

fn source(
    ctx: &PipelineContext<'_>,
    wire: &crate::model::wire::WireSource,
    events: &[EventSpec],
) -> EngineResult<SourceSpec> {
    let name = required(&wire.name, "source.name")?;
    let generation_time = parse_timestamp(&wire.generation_time)?;
    let reception_time = optional_time(&wire.reception_time)?.unwrap_or(ctx.now);

    let declared = window(&wire.validity_start, &wire.validity_stop, "source validity")?;
    let reported = window(
        &wire.reported_validity_start,
        &wire.reported_validity_stop,
        "reported source validity",
    )?;

    let spans: Vec<Span> = events.iter().map(|e| e.span).collect();
    let event_hull = hull(&spans).map(|(start, stop)| Span::new(start, stop));

    let validity = match (declared, event_hull) {
        (Some(d), Some(h)) => d.union(&h),
        (Some(d), None) => d,
        (None, Some(h)) => h,
        (None, None) => {
            return Err(EngineError::parsing(
                "source validity is missing and there are no events to derive it from",
            ))
        }
    };

    Ok(SourceSpec {
        name,
        reception_time,
        generation_time,
        validity,
        reported_validity: reported.or(declared).unwrap_or(validity),
        priority: wire.priority.unwrap_or(ctx.config.policy.default_priority),
    })
}

fn explicit_ref(er: &WireExplicitRef) -> EngineResult<ExplicitRefSpec> {
    let name = required(&er.name, "explicit_reference.name")?;
    let links = er
        .links
        .iter()
        .map(|l| {
            Ok(ErLinkSpec {
                target: required(&l.name, "explicit_reference link target")?,
                name: required(&l.link, "explicit_reference link name")?,
                back_ref: l.back_ref.clone().filter(|b| !b.trim().is_empty()),
            })
        })
        .collect::<EngineResult<Vec<_>>>()?;
    Ok(ExplicitRefSpec {
        name,
        group: er.group.clone().filter(|g| !g.trim().is_empty()),
        links,
    })
}

fn gauge(g: &WireGauge) -> EngineResult<GaugeKey> {
    Ok(GaugeKey {
        name: required(&g.name, "gauge.name")?,
        system: g.system.clone().unwrap_or_default(),
    })
}

fn event(ev: &WireEvent, max_depth: usize) -> EngineResult<EventSpec> {
    let gauge_key = gauge(&ev.gauge)?;
    let policy = match ev.gauge.insertion_type.as_deref() {
        Some(raw) => InsertionPolicy::parse(raw)?,
        None => return Err(EngineError::parsing("gauge.insertion_type is required")),
    };

    let key = ev.key.clone().filter(|k| !k.is_empty());
    if policy == InsertionPolicy::EventKeys && key.is_none() {
        return Err(EngineError::parsing("EVENT_KEYS events must declare a key"));
    }

    let links = ev
        .links
        .iter()
        .enumerate()
        .map(|(i, l)| link(l).map_err(|e| e.at("link", format!("links[{i}]"))))
        .collect::<EngineResult<Vec<_>>>()?;

    let values = values(&ev.values, max_depth)?;

    let start = parse_timestamp(&ev.start)?;
    let stop = parse_timestamp(&ev.stop)?;
    if start >= stop {
        return Err(EngineError::wrong_period(format!(
            "event start {} is not before stop {}",
            ev.start, ev.stop
        )));
    }

    Ok(EventSpec {
        link_ref: ev.link_ref.clone().filter(|r| !r.is_empty()),
        explicit_ref: ev.explicit_reference.clone().filter(|r| !r.is_empty()),
        key,
        gauge: gauge_key,
        policy,
        span: Span::new(start, stop),
        links,
        values,
    })
}

fn link(l: &WireLink) -> EngineResult<LinkSpec> {
    let target = match LinkMode::parse(&l.link_mode)? {
        LinkMode::ByRef => LinkTarget::Ref(required(&l.link, "link")?),
        LinkMode::ByUuid => LinkTarget::Uuid(
            Uuid::parse_str(l.link.trim())
                .map_err(|e| EngineError::parsing(format!("link {:?} is not a uuid: {e}", l.link)))?,
        ),
    };
    Ok(LinkSpec {
        target,
        name: required(&l.name, "link name")?,
        back_ref: l.back_ref.clone().filter(|b| !b.trim().is_empty()),
    })
}

fn annotation(an: &WireAnnotation, max_depth: usize) -> EngineResult<AnnotationSpec> {
    Ok(AnnotationSpec {
        explicit_ref: required(&an.explicit_reference, "annotation explicit_reference")?,
        gauge: gauge(&an.annotation_cnf)?,
        values: values(&an.values, max_depth)?,
    })
}

/// Convert a wire value list into typed values.
pub fn values(wire: &[WireValue], max_depth: usize) -> EngineResult<Vec<NamedValue>> {
    convert_list(wire, 1, max_depth)
}

fn convert_list(wire: &[WireValue], depth: usize, max_depth: usize) -> EngineResult<Vec<NamedValue>> {
    if depth > max_depth {
        return Err(EngineError::parsing(format!(
            "values nested deeper than {max_depth} levels"
        )));
    }
    wire.iter()
        .enumerate()
        .map(|(i, v)| convert_one(v, depth, max_depth).map_err(|e| e.at("value", format!("values[{i}]"))))
        .collect()
}

fn convert_one(v: &WireValue, depth: usize, max_depth: usize) -> EngineResult<NamedValue> {
    if v.name.trim().is_empty() {
        return Err(EngineError::wrong_value("value name must not be empty"));
    }
    let kind = ValueKind::parse(&v.kind)?;

    let value = match kind {
        ValueKind::Object => {
            let children = v
                .values
                .as_ref()
                .ok_or_else(|| EngineError::wrong_value(format!("object value {:?} has no values list", v.name)))?;
            Value::Object(convert_list(children, depth + 1, max_depth)?)
        }
        leaf => {
            let raw = v
                .value
                .as_ref()
                .filter(|j| !j.is_null())
                .ok_or_else(|| EngineError::wrong_value(format!("value {:?} has no value", v.name)))?;
            leaf_value(leaf, raw, &v.name)?
        }
    };

    Ok(NamedValue::new(v.name.trim(), value))
}

fn leaf_value(kind: ValueKind, raw: &Json, name: &str) -> EngineResult<Value> {
    let bad = |what: &str| EngineError::wrong_value(format!("value {name:?} is not a valid {what}: {raw}"));

    match kind {
        ValueKind::Text => match raw {
            Json::String(s) => Ok(Value::Text(s.clone())),
            Json::Number(n) => Ok(Value::Text(n.to_string())),
            Json::Bool(b) => Ok(Value::Text(b.to_string())),
            _ => Err(bad("text")),
        },
        ValueKind::Double => {
            let d = match raw {
                Json::Number(n) => n.as_f64(),
                Json::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            match d {
                Some(d) if d.is_finite() => Ok(Value::Double(d)),
                _ => Err(bad("double")),
            }
        }
        ValueKind::Boolean => match raw {
            Json::Bool(b) => Ok(Value::Boolean(*b)),
            Json::String(s) if s.eq_ignore_ascii_case("true") => Ok(Value::Boolean(true)),
            Json::String(s) if s.eq_ignore_ascii_case("false") => Ok(Value::Boolean(false)),
            _ => Err(bad("boolean")),
        },
        ValueKind::Timestamp => match raw {
            Json::String(s) => parse_timestamp(s).map(Value::Timestamp).map_err(|_| bad("timestamp")),
            _ => Err(bad("timestamp")),
        },
        ValueKind::Geometry => match raw {
            Json::String(s) => Polygon::parse(s).map(Value::Geometry),
            _ => Err(EngineError::wrong_geometry(format!(
                "geometry {name:?} must be a coordinate string"
            ))),
        },
        ValueKind::Object => Err(EngineError::invariant("object values are not leaves")),
    }
}
