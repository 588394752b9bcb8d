//! Once every live range has a register or has been spilled: give spill ranges stack slots, then
//! rewrite the sequence's operands to the locations chosen for them.

use super::{
    data::RegisterAllocationData,
    live_range::{SpillRangeIdx, TopLevelIdx, UsePositionType},
    spill_range::try_merge,
};
use crate::{
    log::ra_trace,
    sequence::{GapPosition, InstructionOperand, OperandSlot},
    stats::Counter,
};
use vob::Vob;

pub(crate) struct OperandAssigner<'d, 'a> {
    d: &'d mut RegisterAllocationData<'a>,
}

impl<'d, 'a> OperandAssigner<'d, 'a> {
    pub(crate) fn new(d: &'d mut RegisterAllocationData<'a>) -> Self {
        Self { d }
    }

    /// Merge spill ranges that are never live at the same time, then give each remaining spill
    /// range a slot in the frame.
    pub(crate) fn assign_spill_slots(&mut self) {
        let mut seen = Vob::from_elem(false, self.d.spill_ranges.len());
        let mut srs: Vec<SpillRangeIdx> = Vec::new();
        for sr in self.d.spill_range_for_vreg.iter().flatten() {
            if !seen.get(sr.index()).unwrap_or(true) && !self.d.spill_ranges[*sr].is_empty() {
                seen.set(sr.index(), true);
                srs.push(*sr);
            }
        }

        for i in 0..srs.len() {
            if self.d.spill_ranges[srs[i]].is_empty() {
                continue;
            }
            for j in i + 1..srs.len() {
                if try_merge(&mut self.d.spill_ranges, &mut self.d.lrs, srs[i], srs[j]) {
                    ra_trace!(
                        self.d.log,
                        "merged spill range {} into {}",
                        srs[j].index(),
                        srs[i].index()
                    );
                }
            }
        }

        for sr in srs {
            let range = &self.d.spill_ranges[sr];
            if range.is_empty() || range.assigned_slot().is_some() {
                continue;
            }
            let slot = self.d.frame.allocate_spill_slot(range.byte_width());
            self.d.spill_ranges[sr].set_assigned_slot(slot);
            self.d.stats.incr(Counter::SpillSlots);
            ra_trace!(self.d.log, "spill range {} gets slot {slot}", sr.index());
        }
    }

    /// Rewrite every operand of every virtual register to its final location, and insert the
    /// moves that put values into their spill slots.
    pub(crate) fn commit_assignment(&mut self) {
        for top in self.d.top_level_ranges().collect::<Vec<_>>() {
            if self.d.lrs.is_empty(self.d.lrs.head(top)) {
                continue;
            }
            let spill_op = self.d.spill_operand(top);

            if self.d.lrs.tops[top].is_phi {
                if let Some(phi) = self.d.phi_for(top) {
                    let op = self.d.assigned_operand(self.d.lrs.head(top));
                    let p = &self.d.phis[phi];
                    let (block, index) = (p.block, p.index);
                    for slot in p.incoming_operands.clone() {
                        self.d.seq.set_operand(slot, op);
                    }
                    self.d.seq.set_operand(OperandSlot::PhiOutput(block, index), op);
                }
            }

            for r in self.d.lrs.children(top).collect::<Vec<_>>() {
                let op = self.d.assigned_operand(r);
                for u in self.d.lrs.uses_of(r).collect::<Vec<_>>() {
                    let up = &self.d.lrs.uses[u];
                    let Some(slot) = up.operand else {
                        continue;
                    };
                    let new = match (up.ty, spill_op) {
                        (UsePositionType::RequiresSlot, Some(x)) => x,
                        (UsePositionType::RequiresSlot, None) => panic!(
                            "{} has a slot use but no spill slot",
                            self.d.lrs.name(r)
                        ),
                        _ => op,
                    };
                    self.d.seq.set_operand(slot, new);
                }
            }

            if let Some(spill_op) = spill_op {
                self.commit_spill_moves(top, spill_op);
            }
        }
    }

    /// Store the value of `top` to `spill_op` wherever it is defined.
    fn commit_spill_moves(&mut self, top: TopLevelIdx, spill_op: InstructionOperand) {
        let t = &self.d.lrs.tops[top];
        // The move may already exist, as a constraint move from a fixed register output to a slot.
        let might_be_duplicated = t.has_slot_use || self.d.lrs.ranges[t.head].spilled;
        for (gap, slot) in t.spill_move_insertion_locations.clone() {
            let src = self.d.seq.operand(slot);
            if might_be_duplicated {
                let found = self
                    .d
                    .seq
                    .instruction(gap)
                    .parallel_move(GapPosition::Start)
                    .is_some_and(|pm| {
                        pm.moves().iter().any(|m| {
                            !m.is_eliminated() && m.source == src && m.destination == spill_op
                        })
                    });
                if found {
                    continue;
                }
            }
            self.d.add_gap_move(gap, GapPosition::Start, src, spill_op);
        }
    }
}
