//! Fill in the reference maps of safepoints with the locations of every live reference.

use super::{data::RegisterAllocationData, live_range::SpillLocation, position::LifetimePosition};
use crate::{
    log::ra_trace,
    sequence::{InstrIdx, InstructionOperand, ReferenceMapIdx, VReg},
    stats::Counter,
};
use std::mem;

pub(crate) struct ReferenceMapPopulator<'d, 'a> {
    d: &'d mut RegisterAllocationData<'a>,
}

impl<'d, 'a> ReferenceMapPopulator<'d, 'a> {
    pub(crate) fn new(d: &'d mut RegisterAllocationData<'a>) -> Self {
        Self { d }
    }

    pub(crate) fn populate_reference_maps(&mut self) {
        for dr in mem::take(&mut self.d.delayed_references) {
            let op = self.d.seq.operand(dr.slot);
            if op.is_allocated() {
                self.d.seq.reference_map_mut(dr.map).record_reference(op);
            }
        }

        let maps = self
            .d
            .seq
            .reference_maps()
            .iter_enumerated()
            .map(|(i, m)| (i, m.instruction()))
            .collect::<Vec<_>>();
        debug_assert!(maps.windows(2).all(|w| w[0].1 < w[1].1));

        // Ranges are mostly visited in start order, so the search for the first safepoint of a
        // range starts where the previous one left off, rewinding only when a range starts
        // earlier than its predecessor.
        let mut first_map = 0;
        let mut last_range_start = InstrIdx::new(0);
        for top in self.d.top_level_ranges().collect::<Vec<_>>() {
            let t = &self.d.lrs.tops[top];
            let Ok(vreg) = usize::try_from(t.vreg) else {
                continue;
            };
            if vreg >= self.d.seq.virtual_register_count()
                || !self.d.seq.is_reference(VReg::new(vreg))
                || self.d.lrs.is_empty(t.head)
            {
                continue;
            }

            let start = self.d.lrs.start(t.head).to_instruction_index();
            let end = self
                .d
                .lrs
                .children(top)
                .map(|r| self.d.lrs.end(r).to_instruction_index())
                .max()
                .unwrap_or(start);
            if start < last_range_start {
                first_map = 0;
            }
            last_range_start = start;
            while first_map < maps.len() && maps[first_map].1 < start {
                first_map += 1;
            }

            let spill_op = match t.spill {
                SpillLocation::Operand(op) if !op.is_constant() => Some(op),
                SpillLocation::Range(_) => self.d.spill_operand(top),
                _ => None,
            };
            let spill_start = t.spill_start_index;

            let mut cur = t.head;
            let mut records: Vec<(ReferenceMapIdx, InstructionOperand)> = Vec::new();
            for (map, safe_point) in &maps[first_map..] {
                if safe_point.index() > end.index() + 1 {
                    break;
                }
                let pos = LifetimePosition::instruction_from_instruction_index(*safe_point);
                // Find the child covering the safepoint. If none does, `cur` stays at the last
                // child starting before it, which may cover a later safepoint.
                let found = loop {
                    if self.d.lrs.covers(cur, pos) {
                        break true;
                    }
                    match self.d.lrs.ranges[cur].next {
                        Some(n) if self.d.lrs.start(n) <= pos => cur = n,
                        _ => break false,
                    }
                };
                if !found {
                    continue;
                }
                // Exactly one location is recorded: wherever the covering child keeps the value.
                if !self.d.lrs.ranges[cur].spilled {
                    records.push((*map, self.d.assigned_operand(cur)));
                } else if let Some(op) = spill_op {
                    debug_assert!(spill_start.is_some_and(|s| *safe_point >= s));
                    records.push((*map, op));
                }
            }

            for (map, op) in records {
                ra_trace!(
                    self.d.log,
                    "v{vreg} is a reference in {} at instruction {}",
                    op.display(self.d.config),
                    self.d.seq.reference_maps()[map].instruction().index()
                );
                self.d.seq.reference_map_mut(map).record_reference(op);
                self.d.stats.incr(Counter::References);
            }
        }
    }
}
