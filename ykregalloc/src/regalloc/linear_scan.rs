//! Linear scan allocation: visit live ranges in start order, keeping track of which ranges hold a
//! register at the current position (active) and which hold one but are in a lifetime hole there
//! (inactive). A range that can't get a register for its whole lifetime is split, and parts that
//! don't need a register are spilled.

use super::{
    allocator::{AllocationStrategy, RegisterAllocator},
    data::RegisterAllocationData,
    live_range::{LiveRangeIdx, SpillRangeIdx, TopLevelIdx},
    position::LifetimePosition,
    spill_range::try_merge,
};
use crate::{
    log::ra_trace,
    sequence::{InstrIdx, RegisterKind},
};
use std::cmp::Reverse;

pub(crate) struct LinearScanAllocator<'d, 'a> {
    a: RegisterAllocator<'d, 'a>,
    /// Ranges yet to be allocated, sorted so that the next one to allocate is last.
    unhandled: Vec<LiveRangeIdx>,
    /// Ranges holding a register that are live at the current position.
    active: Vec<LiveRangeIdx>,
    /// Ranges holding a register that are in a lifetime hole at the current position.
    inactive: Vec<LiveRangeIdx>,
}

impl<'d, 'a> LinearScanAllocator<'d, 'a> {
    pub(crate) fn new(d: &'d mut RegisterAllocationData<'a>, kind: RegisterKind) -> Self {
        Self {
            a: RegisterAllocator::new(d, kind),
            unhandled: Vec::new(),
            active: Vec::new(),
            inactive: Vec::new(),
        }
    }

    fn reg_of(&self, r: LiveRangeIdx) -> usize {
        match self.a.d.lrs.ranges[r].assigned_register {
            Some(x) => usize::from(x),
            None => panic!("{} has no register", self.a.d.lrs.name(r)),
        }
    }

    fn sort_unhandled(&mut self) {
        let lrs = &self.a.d.lrs;
        self.unhandled.sort_by_key(|r| {
            let first_use = lrs.ranges[*r]
                .first_pos
                .map_or(LifetimePosition::max_position(), |u| lrs.uses[u].pos);
            (Reverse(lrs.start(*r)), Reverse(first_use), lrs.top(*r).vreg)
        });
    }

    /// Add `r`, created by splitting during allocation, to the unhandled ranges.
    fn add_to_unhandled_sorted(&mut self, r: LiveRangeIdx) {
        let lrs = &self.a.d.lrs;
        if lrs.is_empty(r) {
            return;
        }
        debug_assert!(lrs.ranges[r].assigned_register.is_none() && !lrs.ranges[r].spilled);
        let at = self
            .unhandled
            .iter()
            .rposition(|x| lrs.should_be_allocated_before(r, *x))
            .map_or(0, |i| i + 1);
        ra_trace!(self.a.d.log, "adding {} to unhandled", lrs.name(r));
        self.unhandled.insert(at, r);
    }

    /// Retire active ranges that have ended or reached a hole, and reactivate inactive ranges
    /// that are live again at `pos`.
    fn update_active_and_inactive(&mut self, pos: LifetimePosition) {
        let lrs = &self.a.d.lrs;
        let mut i = 0;
        while i < self.active.len() {
            let r = self.active[i];
            if lrs.end(r) <= pos {
                self.active.remove(i);
            } else if !lrs.covers(r, pos) {
                self.active.remove(i);
                self.inactive.push(r);
            } else {
                i += 1;
            }
        }
        let mut i = 0;
        while i < self.inactive.len() {
            let r = self.inactive[i];
            if lrs.end(r) <= pos {
                self.inactive.remove(i);
            } else if lrs.covers(r, pos) {
                self.inactive.remove(i);
                self.active.push(r);
            } else {
                i += 1;
            }
        }
    }

    /// If most of a phi's inputs have been spilled to slots that can be merged, spill the phi to
    /// that merged slot too, unless it needs a register straight away. Returns true if `top` has
    /// been dealt with.
    fn try_reuse_spill_for_phi(&mut self, top: TopLevelIdx) -> bool {
        let d = &mut *self.a.d;
        if !d.lrs.tops[top].is_phi {
            return false;
        }
        let Some(phi) = d.phi_for(top) else {
            return false;
        };
        let block = d.seq.block(d.phis[phi].block);
        let operands = block.phis()[d.phis[phi].index].operands().to_vec();
        let preds = block.predecessors().to_vec();

        let mut spilled_count = 0;
        let mut first_op = None;
        for (op, pred) in operands.iter().zip(preds) {
            let Some(op_top) = d.live_ranges[op.index()] else {
                continue;
            };
            let Some(op_spill) = d.lrs.tops[op_top].spill_range() else {
                continue;
            };
            let pred_end = LifetimePosition::instruction_from_instruction_index(
                d.seq.block(pred).last_instruction_index(),
            );
            let cover = d
                .lrs
                .children(op_top)
                .find(|r| d.lrs.can_cover(*r, pred_end));
            if cover.is_some_and(|r| d.lrs.ranges[r].spilled) {
                spilled_count += 1;
                first_op.get_or_insert(op_spill);
            }
        }
        // Only continue if more than half of the operands are spilled.
        let Some(first_op_spill) = first_op else {
            return false;
        };
        if spilled_count * 2 <= operands.len() {
            return false;
        }

        let mut num_merged = 0;
        for op in &operands {
            let Some(op_spill) = d.live_ranges[op.index()].and_then(|t| d.lrs.tops[t].spill_range())
            else {
                continue;
            };
            if op_spill == first_op_spill
                || try_merge(&mut d.spill_ranges, &mut d.lrs, first_op_spill, op_spill)
            {
                num_merged += 1;
            }
        }
        let head = d.lrs.head(top);
        let intervals = d
            .lrs
            .intervals_of(head)
            .map(|ui| (ui.start, ui.end))
            .collect::<Vec<_>>();
        if num_merged * 2 <= operands.len() || d.spill_ranges[first_op_spill].intersects(&intervals) {
            return false;
        }

        // If the phi doesn't need a register soon, spill it to the merged spill range.
        let start = d.lrs.start(head);
        let next_pos = if start.is_gap_position() {
            start.next_start()
        } else {
            start
        };
        let use_pos = d
            .lrs
            .next_use_position_register_is_beneficial(head, next_pos)
            .map(|u| d.lrs.uses[u].pos);
        match use_pos {
            None => {
                if !self.merge_phi_spill_range(top, first_op_spill) {
                    return false;
                }
                self.a.spill(head);
            }
            Some(pos) if pos > start.next_start() => {
                if !self.merge_phi_spill_range(top, first_op_spill) {
                    return false;
                }
                self.spill_between(head, start, pos);
            }
            Some(_) => return false,
        }
        true
    }

    /// Merge `top`'s spill range into `into`, giving `top` a spill range first if need be.
    fn merge_phi_spill_range(&mut self, top: TopLevelIdx, into: SpillRangeIdx) -> bool {
        let d = &mut *self.a.d;
        let sr = match d.lrs.tops[top].spill_range() {
            Some(x) => x,
            None => d.assign_spill_range(top),
        };
        let merged = try_merge(&mut d.spill_ranges, &mut d.lrs, into, sr);
        ra_trace!(
            d.log,
            "v{}: merging with its inputs' spill range {}",
            d.lrs.tops[top].vreg,
            if merged { "succeeded" } else { "failed" }
        );
        merged
    }

    /// Try to find a register that is free for all, or at least the first part, of `current`.
    fn try_allocate_free_reg(&mut self, current: LiveRangeIdx) -> bool {
        let lrs = &self.a.d.lrs;
        let mut free_until = vec![LifetimePosition::max_position(); self.a.num_registers];
        for r in &self.active {
            free_until[self.reg_of(*r)] = LifetimePosition::gap_from_instruction_index(InstrIdx::new(0));
        }
        for r in &self.inactive {
            debug_assert!(lrs.end(*r) > lrs.start(current));
            if let Some(x) = lrs.first_intersection(*r, current) {
                let reg = self.reg_of(*r);
                free_until[reg] = free_until[reg].min(x);
            }
        }

        let (start, end) = (lrs.start(current), lrs.end(current));
        if let Some((_, hint)) = lrs.first_hint_position(current, &self.a.d.phis) {
            if self.a.allocatable.contains(&hint) && free_until[usize::from(hint)] >= end {
                ra_trace!(
                    self.a.d.log,
                    "{} is free for all of {}: using the hint",
                    self.a.reg_name(hint),
                    lrs.name(current)
                );
                self.a.set_assigned_register(current, hint);
                return true;
            }
        }

        // Find the register that stays free for longest.
        let mut reg = self.a.allocatable[0];
        for code in &self.a.allocatable[1..] {
            if free_until[usize::from(*code)] > free_until[usize::from(reg)] {
                reg = *code;
            }
        }
        let pos = free_until[usize::from(reg)];
        if pos <= start {
            // Every register is blocked.
            return false;
        }
        if pos < end {
            // `reg` is free at the start of `current` but not for all of it.
            let tail = self.a.split_range_at(current, pos);
            self.add_to_unhandled_sorted(tail);
        }
        self.a.set_assigned_register(current, reg);
        true
    }

    /// Every register is in use at the start of `current`: take the one whose occupants need it
    /// least urgently, spilling parts of them, or spill `current` if it is the least urgent.
    fn allocate_blocked_reg(&mut self, current: LiveRangeIdx) {
        let lrs = &self.a.d.lrs;
        let start = lrs.start(current);
        let Some(register_use) = lrs.next_register_position(current, start) else {
            // Nothing in `current` requires a register.
            self.a.spill(current);
            return;
        };
        let register_use = lrs.uses[register_use].pos;

        let zero = LifetimePosition::gap_from_instruction_index(InstrIdx::new(0));
        let mut use_pos = vec![LifetimePosition::max_position(); self.a.num_registers];
        let mut block_pos = vec![LifetimePosition::max_position(); self.a.num_registers];
        for r in &self.active {
            let reg = self.reg_of(*r);
            if lrs.top(*r).is_fixed() || !lrs.can_be_spilled(*r, start) {
                block_pos[reg] = zero;
                use_pos[reg] = zero;
            } else {
                use_pos[reg] = match lrs.next_use_position_register_is_beneficial(*r, start) {
                    Some(u) => lrs.uses[u].pos,
                    None => lrs.end(*r),
                };
            }
        }
        for r in &self.inactive {
            let Some(x) = lrs.first_intersection(*r, current) else {
                continue;
            };
            let reg = self.reg_of(*r);
            if lrs.top(*r).is_fixed() {
                block_pos[reg] = block_pos[reg].min(x);
                use_pos[reg] = block_pos[reg].min(use_pos[reg]);
            } else {
                use_pos[reg] = use_pos[reg].min(x);
            }
        }

        let mut reg = self.a.allocatable[0];
        for code in &self.a.allocatable[1..] {
            if use_pos[usize::from(*code)] > use_pos[usize::from(reg)] {
                reg = *code;
            }
        }
        let pos = use_pos[usize::from(reg)];
        if pos < register_use {
            // Every register is needed before `current` needs one: spill `current` up to its
            // first register use.
            if LifetimePosition::exists_gap_position_between(start, register_use) {
                self.spill_between(current, start, register_use);
            } else {
                self.a.set_assigned_register(current, reg);
                self.split_and_spill_intersecting(current);
            }
            return;
        }

        if block_pos[usize::from(reg)] < lrs.end(current) {
            // `reg` is blocked by a fixed range before `current` ends: split before then.
            let tail =
                self.a
                    .split_between(current, start, block_pos[usize::from(reg)].start());
            self.add_to_unhandled_sorted(tail);
        }
        debug_assert!(block_pos[usize::from(reg)] >= self.a.d.lrs.end(current));
        // `reg` wasn't free, so the parts of its other occupants that overlap `current` must go.
        self.a.set_assigned_register(current, reg);
        self.split_and_spill_intersecting(current);
    }

    /// Evict every range other than `current` that uses `current`'s register while `current` is
    /// live, spilling them until they next need a register.
    fn split_and_spill_intersecting(&mut self, current: LiveRangeIdx) {
        let reg = self.reg_of(current);
        let split_pos = self.a.d.lrs.start(current);
        let mut i = 0;
        while i < self.active.len() {
            let r = self.active[i];
            if self.reg_of(r) != reg {
                i += 1;
                continue;
            }
            let next_pos = self
                .a
                .d
                .lrs
                .next_register_position(r, split_pos)
                .map(|u| self.a.d.lrs.uses[u].pos);
            let spill_pos = self.a.find_optimal_spilling_pos(r, split_pos);
            match next_pos {
                None => self.spill_after(r, spill_pos),
                Some(next_pos) => {
                    // Keep `r` spilled at least until `current` starts, so that no unhandled range
                    // starts before the range being allocated.
                    debug_assert!(LifetimePosition::exists_gap_position_between(
                        split_pos, next_pos
                    ));
                    self.spill_between_until(r, spill_pos, split_pos, next_pos);
                }
            }
            self.active.remove(i);
        }

        let mut i = 0;
        while i < self.inactive.len() {
            let r = self.inactive[i];
            if self.a.d.lrs.top(r).is_fixed() || self.reg_of(r) != reg {
                i += 1;
                continue;
            }
            let Some(intersection) = self.a.d.lrs.first_intersection(r, current) else {
                i += 1;
                continue;
            };
            match self.a.d.lrs.next_register_position(r, split_pos) {
                None => self.spill_after(r, split_pos),
                Some(u) => {
                    let end = intersection.min(self.a.d.lrs.uses[u].pos);
                    self.spill_between(r, split_pos, end);
                }
            }
            self.inactive.remove(i);
        }
    }

    fn spill_after(&mut self, r: LiveRangeIdx, pos: LifetimePosition) {
        let second = self.a.split_range_at(r, pos);
        self.a.spill(second);
    }

    fn spill_between(&mut self, r: LiveRangeIdx, start: LifetimePosition, end: LifetimePosition) {
        self.spill_between_until(r, start, start, end);
    }

    /// Spill the part of `r` from `start` to somewhere in `[until, end)`, and queue what follows
    /// for allocation.
    fn spill_between_until(
        &mut self,
        r: LiveRangeIdx,
        start: LifetimePosition,
        until: LifetimePosition,
        end: LifetimePosition,
    ) {
        assert!(start < end);
        let second = self.a.split_range_at(r, start);
        let second_start = self.a.d.lrs.start(second);
        if second_start < end {
            // Split somewhere in `]start + 1, end[`, spill the middle part and queue the rest.
            let third_end = if self.a.d.is_block_boundary(end.start()) {
                end.start()
            } else {
                end.prev_start().end()
            };
            let third = self
                .a
                .split_between(second, second_start.end().max(until), third_end);
            debug_assert_ne!(third, second);
            self.a.spill(second);
            self.add_to_unhandled_sorted(third);
        } else {
            // Nothing to spill: `second` starts after `end`.
            self.add_to_unhandled_sorted(second);
        }
    }
}

impl AllocationStrategy for LinearScanAllocator<'_, '_> {
    fn allocate_registers(&mut self) {
        debug_assert!(self.unhandled.is_empty() && self.active.is_empty());
        let nvregs = self.a.d.seq.virtual_register_count();
        self.a
            .split_and_spill_ranges_defined_by_memory_operand(nvregs <= self.a.allocatable.len());

        for top in self.a.ranges_to_process() {
            let lrs = &self.a.d.lrs;
            self.unhandled
                .extend(lrs.children(top).filter(|r| !lrs.ranges[*r].spilled));
        }
        self.sort_unhandled();
        for top in self.a.d.fixed_live_ranges(self.a.kind).collect::<Vec<_>>() {
            let head = self.a.d.lrs.head(top);
            if !self.a.d.lrs.is_empty(head) {
                self.inactive.push(head);
            }
        }

        while let Some(current) = self.unhandled.pop() {
            let pos = self.a.d.lrs.start(current);
            ra_trace!(
                self.a.d.log,
                "processing {} starting at {pos}",
                self.a.d.lrs.name(current)
            );
            if self.a.d.lrs.is_top_level(current)
                && self.try_reuse_spill_for_phi(self.a.d.lrs.ranges[current].top)
            {
                continue;
            }
            self.update_active_and_inactive(pos);
            debug_assert!(
                self.a.d.lrs.ranges[current].assigned_register.is_none()
                    && !self.a.d.lrs.ranges[current].spilled
            );
            if !self.try_allocate_free_reg(current) {
                self.allocate_blocked_reg(current);
            }
            if self.a.d.lrs.ranges[current].assigned_register.is_some() {
                self.active.push(current);
            }
        }
    }
}
