//! Interval algebra over half-open time segments.
//!
//! A segment covers `[start, stop)`. A list of segments is a *timeline*; most
//! callers pass timelines whose segments do not overlap each other, but the
//! functions here accept arbitrary input.
//!
//! Provided operations:
//! - [`merge`]: coalesce overlapping and adjacent segments into maximal runs
//! - [`intersect`]: pairwise overlaps of two timelines
//! - [`intersect_many`]: overlaps of N timelines, ids accumulated
//! - [`difference`]: parts of one timeline not covered by another
//! - [`duration`]: total covered seconds (overlaps counted twice)
//!
//! A shared boundary (`a.stop == b.start`) is not an overlap. Only [`merge`]
//! joins such segments. Every output is sorted by `(start, stop)` and contains
//! no zero-length segment.

use std::collections::BTreeSet;

use time::OffsetDateTime;

use crate::timestamp::seconds_between;

/// Anything with a half-open time span.
pub trait Timed {
    fn start(&self) -> OffsetDateTime;
    fn stop(&self) -> OffsetDateTime;

    fn seconds(&self) -> f64 {
        seconds_between(self.start(), self.stop())
    }

    /// Strict overlap: touching boundaries do not count.
    fn overlaps<T: Timed + ?Sized>(&self, other: &T) -> bool {
        self.start() < other.stop() && other.start() < self.stop()
    }

    fn is_empty(&self) -> bool {
        self.start() >= self.stop()
    }
}

/// Segments that carry one or more contributor ids.
pub trait Contributors<I> {
    fn collect_ids(&self, out: &mut BTreeSet<I>);
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Segment<I> {
    pub id: I,
    pub start: OffsetDateTime,
    pub stop: OffsetDateTime,
}

impl<I> Segment<I> {
    pub fn new(id: I, start: OffsetDateTime, stop: OffsetDateTime) -> Self {
        Self { id, start, stop }
    }
}

/// A maximal run produced by [`merge`] or [`intersect_many`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedSegment<I: Ord> {
    pub ids: BTreeSet<I>,
    pub start: OffsetDateTime,
    pub stop: OffsetDateTime,
}

/// One overlap produced by [`intersect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intersection<I> {
    pub start: OffsetDateTime,
    pub stop: OffsetDateTime,
    pub id1: I,
    pub id2: I,
}

impl<I> Intersection<I> {
    /// Same overlap seen from the other side.
    pub fn swapped(self) -> Self {
        Self {
            start: self.start,
            stop: self.stop,
            id1: self.id2,
            id2: self.id1,
        }
    }
}

impl<I> Timed for Segment<I> {
    fn start(&self) -> OffsetDateTime {
        self.start
    }
    fn stop(&self) -> OffsetDateTime {
        self.stop
    }
}

impl<I: Ord> Timed for MergedSegment<I> {
    fn start(&self) -> OffsetDateTime {
        self.start
    }
    fn stop(&self) -> OffsetDateTime {
        self.stop
    }
}

impl<I> Timed for Intersection<I> {
    fn start(&self) -> OffsetDateTime {
        self.start
    }
    fn stop(&self) -> OffsetDateTime {
        self.stop
    }
}

impl<I: Ord + Clone> Contributors<I> for Segment<I> {
    fn collect_ids(&self, out: &mut BTreeSet<I>) {
        out.insert(self.id.clone());
    }
}

impl<I: Ord + Clone> Contributors<I> for MergedSegment<I> {
    fn collect_ids(&self, out: &mut BTreeSet<I>) {
        out.extend(self.ids.iter().cloned());
    }
}

impl<I: Ord + Clone> Contributors<I> for Intersection<I> {
    fn collect_ids(&self, out: &mut BTreeSet<I>) {
        out.insert(self.id1.clone());
        out.insert(self.id2.clone());
    }
}

/// Coalesce overlapping or adjacent segments into maximal runs.
pub fn merge<S, I>(segments: &[S]) -> Vec<MergedSegment<I>>
where
    S: Timed + Contributors<I>,
    I: Ord + Clone,
{
    let mut sorted: Vec<&S> = segments.iter().filter(|s| !s.is_empty()).collect();
    sorted.sort_by_key(|s| (s.start(), s.stop()));

    let mut out: Vec<MergedSegment<I>> = Vec::new();
    for s in sorted {
        if let Some(run) = out.last_mut() {
            if s.start() <= run.stop {
                if s.stop() > run.stop {
                    run.stop = s.stop();
                }
                s.collect_ids(&mut run.ids);
                continue;
            }
        }
        let mut ids = BTreeSet::new();
        s.collect_ids(&mut ids);
        out.push(MergedSegment {
            ids,
            start: s.start(),
            stop: s.stop(),
        });
    }
    out
}

/// Every non-empty pairwise overlap between `a` and `b`.
pub fn intersect<I>(a: &[Segment<I>], b: &[Segment<I>]) -> Vec<Intersection<I>>
where
    I: Ord + Clone,
{
    let mut out = Vec::new();
    for x in a {
        for y in b {
            let start = x.start.max(y.start);
            let stop = x.stop.min(y.stop);
            if start < stop {
                out.push(Intersection {
                    start,
                    stop,
                    id1: x.id.clone(),
                    id2: y.id.clone(),
                });
            }
        }
    }
    out.sort_by(|l, r| {
        (l.start, l.stop, &l.id1, &l.id2).cmp(&(r.start, r.stop, &r.id1, &r.id2))
    });
    out
}

/// Split a timeline at every boundary into non-overlapping pieces, each
/// carrying the ids of all segments covering it. Uncovered gaps are skipped.
fn elementary<I>(timeline: &[Segment<I>]) -> Vec<MergedSegment<I>>
where
    I: Ord + Clone,
{
    let live: Vec<&Segment<I>> = timeline.iter().filter(|s| !s.is_empty()).collect();
    let mut bounds: Vec<OffsetDateTime> = live.iter().flat_map(|s| [s.start, s.stop]).collect();
    bounds.sort();
    bounds.dedup();

    bounds
        .windows(2)
        .filter_map(|w| {
            let ids: BTreeSet<I> = live
                .iter()
                .filter(|s| s.start <= w[0] && w[1] <= s.stop)
                .map(|s| s.id.clone())
                .collect();
            (!ids.is_empty()).then(|| MergedSegment {
                ids,
                start: w[0],
                stop: w[1],
            })
        })
        .collect()
}

/// Iterated intersection of several timelines.
///
/// Each timeline is first split into non-overlapping pieces, so a point
/// covered by several segments of one timeline is counted once. Each output
/// segment carries the ids of every segment covering it, across all inputs.
/// Outputs never overlap each other. An empty input, or any empty timeline,
/// yields an empty result.
pub fn intersect_many<I>(timelines: &[Vec<Segment<I>>]) -> Vec<MergedSegment<I>>
where
    I: Ord + Clone,
{
    let Some((first, rest)) = timelines.split_first() else {
        return Vec::new();
    };

    let mut acc = elementary(first);
    for timeline in rest {
        let pieces = elementary(timeline);
        let mut next = Vec::new();
        for x in &acc {
            for y in &pieces {
                let start = x.start.max(y.start);
                let stop = x.stop.min(y.stop);
                if start < stop {
                    let mut ids = x.ids.clone();
                    ids.extend(y.ids.iter().cloned());
                    next.push(MergedSegment { ids, start, stop });
                }
            }
        }
        acc = next;
    }

    acc.sort_by(|l, r| (l.start, l.stop, &l.ids).cmp(&(r.start, r.stop, &r.ids)));
    acc
}

/// Portions of `a` not covered by any segment of `b`, keeping `a`'s ids.
pub fn difference<I, T>(a: &[Segment<I>], b: &[T]) -> Vec<Segment<I>>
where
    I: Clone,
    T: Timed,
{
    let mut cutters: Vec<(OffsetDateTime, OffsetDateTime)> = b
        .iter()
        .filter(|s| !s.is_empty())
        .map(|s| (s.start(), s.stop()))
        .collect();
    cutters.sort();

    let mut out = Vec::new();
    for seg in a.iter().filter(|s| !s.is_empty()) {
        let mut cursor = seg.start;
        for &(c_start, c_stop) in &cutters {
            if c_stop <= cursor {
                continue;
            }
            if c_start >= seg.stop {
                break;
            }
            if c_start > cursor {
                out.push(Segment::new(seg.id.clone(), cursor, c_start));
            }
            if c_stop > cursor {
                cursor = c_stop;
            }
            if cursor >= seg.stop {
                break;
            }
        }
        if cursor < seg.stop {
            out.push(Segment::new(seg.id.clone(), cursor, seg.stop));
        }
    }
    out.sort_by_key(|s| (s.start, s.stop));
    out
}

/// Sum of `stop - start` in seconds.
pub fn duration<T: Timed>(segments: &[T]) -> f64 {
    segments.iter().map(Timed::seconds).sum()
}

/// Smallest segment containing all of `segments`.
pub fn hull<T: Timed>(segments: &[T]) -> Option<(OffsetDateTime, OffsetDateTime)> {
    let start = segments.iter().map(Timed::start).min()?;
    let stop = segments.iter().map(Timed::stop).max()?;
    Some((start, stop))
}
