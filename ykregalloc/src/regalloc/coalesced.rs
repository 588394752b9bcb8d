//! The live ranges allocated to one physical register, kept so that conflicts with a candidate
//! range can be found quickly.

use super::{
    live_range::{LiveRangeIdx, LiveRanges},
    position::LifetimePosition,
};
use std::collections::BTreeMap;

/// The use intervals of every range allocated to a register, keyed by start position. Intervals
/// of ranges sharing a register never overlap, so start positions are unique.
#[derive(Debug, Default)]
pub(crate) struct CoalescedLiveRanges {
    intervals: BTreeMap<LifetimePosition, (LifetimePosition, LiveRangeIdx)>,
}

impl CoalescedLiveRanges {
    pub(crate) fn allocate_range(&mut self, lrs: &LiveRanges, r: LiveRangeIdx) {
        for ui in lrs.intervals_of(r) {
            let old = self.intervals.insert(ui.start, (ui.end, r));
            debug_assert!(old.is_none(), "{} overlaps an allocated range", lrs.name(r));
        }
    }

    pub(crate) fn remove_range(&mut self, lrs: &LiveRanges, r: LiveRangeIdx) {
        for ui in lrs.intervals_of(r) {
            let old = self.intervals.remove(&ui.start);
            debug_assert_eq!(old.map(|(_, x)| x), Some(r));
        }
    }

    /// The allocated ranges that are live at some position where `r` is, in order of first
    /// conflict.
    pub(crate) fn conflicts(&self, lrs: &LiveRanges, r: LiveRangeIdx) -> Vec<LiveRangeIdx> {
        let mut out = Vec::new();
        for ui in lrs.intervals_of(r) {
            let overlapping = self
                .intervals
                .range(..ui.end)
                .rev()
                .take_while(|(_, (end, _))| *end > ui.start)
                .map(|(_, (_, x))| *x)
                .collect::<Vec<_>>();
            for x in overlapping.into_iter().rev() {
                if !out.contains(&x) {
                    out.push(x);
                }
            }
        }
        out
    }

    pub(crate) fn is_free_for(&self, lrs: &LiveRanges, r: LiveRangeIdx) -> bool {
        lrs.intervals_of(r).all(|ui| {
            self.intervals
                .range(..ui.end)
                .next_back()
                .map_or(true, |(_, (end, _))| *end <= ui.start)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sequence::Representation;

    fn p(x: i32) -> LifetimePosition {
        LifetimePosition::from_int(x)
    }

    #[test]
    fn conflicts() {
        let mut lrs = LiveRanges::new();
        let mk = |lrs: &mut LiveRanges, vreg, ivs: &[(i32, i32)]| {
            let top = lrs.new_top_level(vreg, Representation::Word64);
            for (s, e) in ivs.iter().rev() {
                lrs.add_use_interval(top, p(*s), p(*e));
            }
            lrs.head(top)
        };
        let a = mk(&mut lrs, 0, &[(2, 6), (12, 20)]);
        let b = mk(&mut lrs, 1, &[(6, 12)]);
        let c = mk(&mut lrs, 2, &[(4, 8), (18, 30)]);
        let d = mk(&mut lrs, 3, &[(20, 22)]);

        let mut reg = CoalescedLiveRanges::default();
        reg.allocate_range(&lrs, a);
        reg.allocate_range(&lrs, b);
        assert!(reg.is_free_for(&lrs, d));
        assert!(reg.conflicts(&lrs, d).is_empty());
        assert!(!reg.is_free_for(&lrs, c));
        assert_eq!(reg.conflicts(&lrs, c), vec![a, b]);

        reg.remove_range(&lrs, a);
        assert_eq!(reg.conflicts(&lrs, c), vec![b]);
        reg.remove_range(&lrs, b);
        assert!(reg.is_free_for(&lrs, c));
        reg.allocate_range(&lrs, c);
        assert_eq!(reg.conflicts(&lrs, d), vec![c]);
    }
}
