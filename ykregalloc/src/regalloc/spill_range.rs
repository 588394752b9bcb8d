//! Spill ranges: groups of top-level live ranges that share one stack slot.

use super::{
    live_range::{LiveRanges, SpillLocation, SpillRangeIdx, TopLevelIdx},
    position::LifetimePosition,
};
use crate::sequence::RegisterKind;
use index_vec::IndexVec;

#[derive(Debug)]
pub(crate) struct SpillRange {
    /// The union of the intervals of every live range sharing this slot: sorted and disjoint.
    intervals: Vec<(LifetimePosition, LifetimePosition)>,
    ranges: Vec<TopLevelIdx>,
    assigned_slot: Option<i32>,
    byte_width: usize,
    kind: RegisterKind,
}

impl SpillRange {
    /// Create a spill range covering every child of `top`.
    pub(crate) fn new(lrs: &LiveRanges, top: TopLevelIdx) -> Self {
        let t = &lrs.tops[top];
        debug_assert!(!t.is_splinter());
        let intervals = lrs
            .children(top)
            .flat_map(|r| lrs.intervals_of(r))
            .map(|ui| (ui.start, ui.end))
            .collect::<Vec<_>>();
        debug_assert!(intervals.windows(2).all(|w| w[0].1 <= w[1].0));
        Self {
            intervals,
            ranges: vec![top],
            assigned_slot: None,
            byte_width: t.representation.byte_width(),
            kind: t.kind(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub(crate) fn ranges(&self) -> &[TopLevelIdx] {
        &self.ranges
    }

    pub(crate) fn byte_width(&self) -> usize {
        self.byte_width
    }

    pub(crate) fn kind(&self) -> RegisterKind {
        self.kind
    }

    pub(crate) fn assigned_slot(&self) -> Option<i32> {
        self.assigned_slot
    }

    pub(crate) fn set_assigned_slot(&mut self, slot: i32) {
        debug_assert!(self.assigned_slot.is_none());
        self.assigned_slot = Some(slot);
    }

    fn end(&self) -> Option<LifetimePosition> {
        self.intervals.last().map(|(_, e)| *e)
    }

    /// Is any position live in both `self` and `other`?
    pub(crate) fn is_intersecting_with(&self, other: &SpillRange) -> bool {
        let (Some(end), Some(other_end)) = (self.end(), other.end()) else {
            return false;
        };
        if end <= other.intervals[0].0 || other_end <= self.intervals[0].0 {
            return false;
        }
        intervals_intersect(&self.intervals, &other.intervals)
    }

    /// Does this spill range intersect the intervals `[start, end)` in `other`?
    pub(crate) fn intersects(&self, other: &[(LifetimePosition, LifetimePosition)]) -> bool {
        intervals_intersect(&self.intervals, other)
    }
}

/// Do two sorted, disjoint interval lists share a position?
fn intervals_intersect(
    a: &[(LifetimePosition, LifetimePosition)],
    b: &[(LifetimePosition, LifetimePosition)],
) -> bool {
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        let ((a_start, a_end), (b_start, b_end)) = (a[i], b[j]);
        if a_start < b_end && b_start < a_end {
            return true;
        }
        if a_end <= b_start {
            i += 1;
        } else {
            j += 1;
        }
    }
    false
}

/// Try to merge spill range `from` into `into`. This succeeds if neither has been given a slot
/// yet, both hold values of the same kind, and no position is live in both. On success `from` is
/// left empty and every top-level range that pointed at it points at `into` instead.
pub(crate) fn try_merge(
    spill_ranges: &mut IndexVec<SpillRangeIdx, SpillRange>,
    lrs: &mut LiveRanges,
    into: SpillRangeIdx,
    from: SpillRangeIdx,
) -> bool {
    if into == from {
        return false;
    }
    {
        let (a, b) = (&spill_ranges[into], &spill_ranges[from]);
        if a.is_empty()
            || b.is_empty()
            || a.assigned_slot.is_some()
            || b.assigned_slot.is_some()
            || a.kind != b.kind
            || a.is_intersecting_with(b)
        {
            return false;
        }
    }

    let other = &mut spill_ranges[from];
    let other_intervals = std::mem::take(&mut other.intervals);
    let other_ranges = std::mem::take(&mut other.ranges);
    let other_width = other.byte_width;
    let this = &mut spill_ranges[into];
    let mut merged = Vec::with_capacity(this.intervals.len() + other_intervals.len());
    let (mut i, mut j) = (0, 0);
    while i < this.intervals.len() || j < other_intervals.len() {
        if j == other_intervals.len()
            || (i < this.intervals.len() && this.intervals[i].0 < other_intervals[j].0)
        {
            merged.push(this.intervals[i]);
            i += 1;
        } else {
            merged.push(other_intervals[j]);
            j += 1;
        }
    }
    this.intervals = merged;
    this.byte_width = this.byte_width.max(other_width);

    // A range's splinter shares its spill range without being listed in it.
    let splinters = other_ranges.iter().filter_map(|t| lrs.tops[*t].splinter);
    for top in other_ranges.iter().copied().chain(splinters.collect::<Vec<_>>()) {
        let t = &mut lrs.tops[top];
        if t.spill == SpillLocation::Range(from) {
            t.spill = SpillLocation::Range(into);
        }
        if t.pending_spill_range == Some(from) {
            t.pending_spill_range = Some(into);
        }
    }
    this.ranges.extend(other_ranges);
    true
}
