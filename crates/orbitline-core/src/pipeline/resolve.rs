//! Reference resolution.
//!
//! The events of an operation form an arena indexed by position. Resolution
//! runs two passes:
//! 1. build the address table `link_ref -> arena index`, rejecting
//!    duplicates (`DuplicatedEventLinkRef`)
//! 2. rewrite every link target to a [`LinkEnd`]: `by_ref` targets become
//!    arena indices (`UndefinedEventLink` when missing), `by_uuid` targets
//!    stay committed addresses, checked later against committed state
//!
//! Every link declaring a `back_ref` is expanded by [`synthesize`] into the
//! declared edge plus its mirror. A mirror that collides with another edge of
//! the operation is a `DuplicatedEventLinkRef`.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};
use crate::model::{ErLinkSpec, LinkTarget, Operation};

/// One end of an event link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LinkEnd {
    /// Event of this operation, by arena index.
    Batch(usize),
    /// Previously committed event.
    Committed(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResolvedLink {
    pub from: LinkEnd,
    pub to: LinkEnd,
    pub name: String,
    /// Mirror generated from a `back_ref`.
    pub synthesized: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResolvedErLink {
    pub from: String,
    pub to: String,
    pub name: String,
}

/// Output of the resolution stage.
#[derive(Debug, Clone)]
pub struct ResolvedOperation {
    pub operation: Operation,
    pub links: Vec<ResolvedLink>,
    pub er_links: Vec<ResolvedErLink>,
    /// Group declared for each explicit reference, `None` when only referenced.
    pub explicit_refs: BTreeMap<String, Option<String>>,
}

/// Expand one declared edge into itself plus its mirror, if any.
pub fn synthesize(from: LinkEnd, to: LinkEnd, name: &str, back_ref: Option<&str>) -> Vec<ResolvedLink> {
    let mut out = vec![ResolvedLink {
        from,
        to,
        name: name.to_string(),
        synthesized: false,
    }];
    if let Some(back) = back_ref {
        out.push(ResolvedLink {
            from: to,
            to: from,
            name: back.to_string(),
            synthesized: true,
        });
    }
    out
}

/// Resolve the links of a validated operation.
pub fn resolve_operation(operation: Operation) -> EngineResult<ResolvedOperation> {
    // Pass 1: address table.
    let mut table: HashMap<&str, usize> = HashMap::with_capacity(operation.events.len());
    for (idx, ev) in operation.events.iter().enumerate() {
        if let Some(r) = ev.link_ref.as_deref() {
            if let Some(first) = table.insert(r, idx) {
                return Err(EngineError::duplicated_link_ref(format!(
                    "link_ref {r:?} is declared by events[{first}] and events[{idx}]"
                ))
                .at("event", format!("events[{idx}]")));
            }
        }
    }

    // Pass 2: rewrite targets and mirror back-refs.
    let mut links = Vec::new();
    let mut seen: BTreeSet<(LinkEnd, LinkEnd, String)> = BTreeSet::new();
    for (idx, ev) in operation.events.iter().enumerate() {
        for (li, link) in ev.links.iter().enumerate() {
            let to = match &link.target {
                LinkTarget::Ref(r) => match table.get(r.as_str()) {
                    Some(&j) => LinkEnd::Batch(j),
                    None => {
                        return Err(EngineError::undefined_link(format!(
                            "no event declares link_ref {r:?}"
                        ))
                        .at("link", format!("events[{idx}].links[{li}]")))
                    }
                },
                LinkTarget::Uuid(u) => LinkEnd::Committed(*u),
            };

            for edge in synthesize(LinkEnd::Batch(idx), to, &link.name, link.back_ref.as_deref()) {
                if !seen.insert((edge.from, edge.to, edge.name.clone())) {
                    return Err(EngineError::duplicated_link_ref(format!(
                        "link {:?} between the same events is declared twice",
                        edge.name
                    ))
                    .at("link", format!("events[{idx}].links[{li}]")));
                }
                links.push(edge);
            }
        }
    }

    let (explicit_refs, er_links) = resolve_explicit_refs(&operation)?;

    Ok(ResolvedOperation {
        operation,
        links,
        er_links,
        explicit_refs,
    })
}

type ErResolution = (BTreeMap<String, Option<String>>, Vec<ResolvedErLink>);

fn resolve_explicit_refs(operation: &Operation) -> EngineResult<ErResolution> {
    let mut refs: BTreeMap<String, Option<String>> = BTreeMap::new();
    let mut er_links = Vec::new();
    let mut seen = BTreeSet::new();

    for er in &operation.explicit_refs {
        let slot = refs.entry(er.name.clone()).or_insert(None);
        if er.group.is_some() {
            *slot = er.group.clone();
        }
        for ErLinkSpec { target, name, back_ref } in &er.links {
            refs.entry(target.clone()).or_insert(None);
            let mut edges = vec![ResolvedErLink {
                from: er.name.clone(),
                to: target.clone(),
                name: name.clone(),
            }];
            if let Some(back) = back_ref {
                edges.push(ResolvedErLink {
                    from: target.clone(),
                    to: er.name.clone(),
                    name: back.clone(),
                });
            }
            for edge in edges {
                if seen.insert(edge.clone()) {
                    er_links.push(edge);
                }
            }
        }
    }

    let referenced = operation
        .events
        .iter()
        .filter_map(|e| e.explicit_ref.clone())
        .chain(operation.annotations.iter().map(|a| a.explicit_ref.clone()));
    for name in referenced {
        refs.entry(name).or_insert(None);
    }

    Ok((refs, er_links))
}
