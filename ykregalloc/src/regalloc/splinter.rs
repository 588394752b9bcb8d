//! Splintering: separate the parts of live ranges that lie in deferred (cold) code, so that the
//! allocator can make different decisions there than on the hot path, and merge them back
//! afterwards.

use super::{data::RegisterAllocationData, live_range::TopLevelIdx, position::LifetimePosition};
use crate::{log::ra_trace, sequence::RpoNumber, stats::Counter};

/// The maximal runs of consecutive deferred blocks, found in one forward scan over the blocks.
struct DeferredRuns {
    /// For each block: if it is deferred, the last block of the run it is part of.
    run_end: Vec<Option<RpoNumber>>,
}

impl DeferredRuns {
    fn new(d: &RegisterAllocationData) -> Self {
        let blocks = d.seq.blocks();
        let mut run_end = vec![None; blocks.len()];
        let mut i = 0;
        while i < blocks.len() {
            if !blocks[RpoNumber::new(i)].is_deferred() {
                i += 1;
                continue;
            }
            let mut end = i;
            while end + 1 < blocks.len() && blocks[RpoNumber::new(end + 1)].is_deferred() {
                end += 1;
            }
            for x in &mut run_end[i..=end] {
                *x = Some(RpoNumber::new(end));
            }
            // Skip the run we have just classified.
            i = end + 1;
        }
        Self { run_end }
    }

    fn run_end(&self, b: RpoNumber) -> Option<RpoNumber> {
        self.run_end[b.index()]
    }
}

pub(crate) struct LiveRangeSeparator<'d, 'a> {
    d: &'d mut RegisterAllocationData<'a>,
}

impl<'d, 'a> LiveRangeSeparator<'d, 'a> {
    pub(crate) fn new(d: &'d mut RegisterAllocationData<'a>) -> Self {
        Self { d }
    }

    pub(crate) fn splinter(&mut self) {
        let runs = DeferredRuns::new(self.d);
        if runs.run_end.iter().all(|x| x.is_none()) {
            return;
        }
        // Splinters are added to the end of the live ranges: they must not be splintered again.
        let count = self.d.live_ranges.len();
        for vreg in 0..count {
            let Some(top) = self.d.live_ranges[vreg] else {
                continue;
            };
            let head = self.d.lrs.head(top);
            if self.d.lrs.is_empty(head) || self.d.lrs.tops[top].is_splinter() {
                continue;
            }
            // Ranges that start in deferred code stay there.
            let first_gap = self.d.lrs.intervals_of(head).next().unwrap().first_gap_index();
            let first_block = self
                .d
                .block_at(LifetimePosition::gap_from_instruction_index(first_gap))
                .rpo_number();
            if runs.run_end(first_block).is_none() {
                self.splinter_live_range(top, &runs);
            }
        }
    }

    fn splinter_live_range(&mut self, top: TopLevelIdx, runs: &DeferredRuns) {
        let head = self.d.lrs.head(top);
        // Splintering rewrites the intervals, so find every cut first.
        let blocks = self
            .d
            .lrs
            .intervals_of(head)
            .map(|ui| {
                let first = self
                    .d
                    .block_at(LifetimePosition::gap_from_instruction_index(ui.first_gap_index()));
                let last = self
                    .d
                    .block_at(LifetimePosition::gap_from_instruction_index(ui.last_gap_index()));
                (first.rpo_number(), last.rpo_number())
            })
            .collect::<Vec<_>>();

        let mut cuts = Vec::new();
        let mut cut: Option<(LifetimePosition, LifetimePosition)> = None;
        for (first, last) in blocks {
            let mut b = first.index();
            while b <= last.index() {
                let rpo = RpoNumber::new(b);
                match runs.run_end(rpo) {
                    Some(run_end) => {
                        let end = run_end.min(last);
                        let first_cut = match cut {
                            Some((x, _)) => x,
                            None => LifetimePosition::gap_from_instruction_index(
                                self.d.seq.block(rpo).first_instruction_index(),
                            ),
                        };
                        let last_cut = LifetimePosition::gap_from_instruction_index(
                            self.d.seq.block(end).last_instruction_index(),
                        );
                        cut = Some((first_cut, last_cut));
                        b = end.index() + 1;
                    }
                    None => {
                        if let Some(c) = cut.take() {
                            cuts.push(c);
                        }
                        b += 1;
                    }
                }
            }
        }
        // The range ends in deferred code.
        if let Some(c) = cut {
            cuts.push(c);
        }

        for (first_cut, last_cut) in cuts {
            self.create_splinter(top, first_cut, last_cut);
        }

        // Uses requiring a slot may now all be in one half.
        if let Some(splinter) = self.d.lrs.tops[top].splinter {
            if self.d.lrs.tops[top].has_slot_use {
                self.set_slot_use(top);
                self.set_slot_use(splinter);
            }
        }
    }

    fn set_slot_use(&mut self, top: TopLevelIdx) {
        let head = self.d.lrs.head(top);
        let has_slot_use = self
            .d
            .lrs
            .uses_of(head)
            .any(|u| self.d.lrs.uses[u].ty == super::live_range::UsePositionType::RequiresSlot);
        self.d.lrs.tops[top].has_slot_use = has_slot_use;
    }

    fn create_splinter(
        &mut self,
        top: TopLevelIdx,
        first_cut: LifetimePosition,
        last_cut: LifetimePosition,
    ) {
        let head = self.d.lrs.head(top);
        let (range_start, range_end) = (self.d.lrs.start(head), self.d.lrs.end(head));
        // A range ending at the end of the deferred code is recorded as ending at the start of the
        // next block.
        let max_allowed_end = last_cut.next_full_start();
        if first_cut <= range_start && max_allowed_end >= range_end {
            return;
        }
        let start = first_cut.max(range_start);
        let end = last_cut.min(range_end);
        if start >= end || start <= range_start {
            return;
        }
        // Nothing to do if the range has a hole across the whole cut.
        if !self
            .d
            .lrs
            .intervals_of(head)
            .any(|ui| ui.start < end && start < ui.end)
        {
            return;
        }

        // The parent must have a spill range before it is splintered: the splinter shares it, so
        // spill slots reused during allocation cannot clobber either.
        if self.d.lrs.tops[top].may_require_spill_range() {
            self.d.create_spill_range(top);
        }
        let splinter = match self.d.lrs.tops[top].splinter {
            Some(x) => x,
            None => {
                let rep = self.d.lrs.tops[top].representation;
                let s = self.d.next_live_range(rep);
                self.d.lrs.set_splinter(top, s);
                s
            }
        };
        ra_trace!(
            self.d.log,
            "splintering {} into v{} over [{start}, {end})",
            self.d.lrs.name(head),
            self.d.lrs.tops[splinter].vreg
        );
        self.d.lrs.splinter(top, splinter, start, end);
        self.d.stats.incr(Counter::Splinters);
    }
}

/// Reattach every splinter to the range it was splintered from.
pub(crate) fn merge_splinters(d: &mut RegisterAllocationData) {
    for vreg in 0..d.live_ranges.len() {
        let Some(splinter) = d.live_ranges[vreg] else {
            continue;
        };
        let Some(parent) = d.lrs.tops[splinter].splintered_from else {
            continue;
        };
        let head = d.lrs.head(splinter);
        if !d.lrs.is_empty(head) {
            ra_trace!(d.log, "merging {} back into v{}", d.lrs.name(head), d.lrs.tops[parent].vreg);
            d.lrs.merge(parent, splinter);
        } else {
            d.lrs.tops[parent].splinter = None;
        }
        d.live_ranges[vreg] = None;
    }
}
