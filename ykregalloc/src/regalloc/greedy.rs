//! Greedy allocation: live ranges are allocated largest first. A range that finds no free register
//! may evict ranges that are cheaper to spill than itself; failing that it is split or spilled, and
//! the pieces go back in the queue.

use super::{
    allocator::{AllocationStrategy, RegisterAllocator},
    coalesced::CoalescedLiveRanges,
    data::RegisterAllocationData,
    live_range::{LiveRangeIdx, UsePositionHint, UsePositionType},
    position::LifetimePosition,
};
use crate::{
    log::ra_trace,
    sequence::{InstrIdx, InstructionOperand, RegCode, RegisterKind},
    stats::Counter,
};
use std::{cmp::Reverse, collections::BinaryHeap};

/// What to do with a range that can't be given a register.
#[derive(Copy, Clone, Debug, PartialEq)]
enum Progress {
    /// Nothing in the range needs a register.
    Spill,
    /// Spill everything before this position and allocate the rest.
    SpillUntil(LifetimePosition),
    /// Split here and allocate both parts.
    Split(LifetimePosition),
}

pub(crate) struct GreedyAllocator<'d, 'a> {
    a: RegisterAllocator<'d, 'a>,
    /// The ranges allocated to each register, indexed by register code.
    allocations: Vec<CoalescedLiveRanges>,
    /// Ranges awaiting allocation, largest first.
    queue: BinaryHeap<(u64, Reverse<LiveRangeIdx>)>,
}

impl<'d, 'a> GreedyAllocator<'d, 'a> {
    pub(crate) fn new(d: &'d mut RegisterAllocationData<'a>, kind: RegisterKind) -> Self {
        let a = RegisterAllocator::new(d, kind);
        let allocations = (0..a.num_registers)
            .map(|_| CoalescedLiveRanges::default())
            .collect();
        Self {
            a,
            allocations,
            queue: BinaryHeap::new(),
        }
    }

    fn enqueue(&mut self, r: LiveRangeIdx) {
        if self.a.d.lrs.is_empty(r) {
            return;
        }
        let size = self.a.d.lrs.size(r);
        ra_trace!(
            self.a.d.log,
            "enqueueing {} (size {size})",
            self.a.d.lrs.name(r)
        );
        self.queue.push((size, Reverse(r)));
    }

    /// How we can make progress with `r` without giving it a register, if at all.
    fn find_progress(&self, r: LiveRangeIdx) -> Option<Progress> {
        let lrs = &self.a.d.lrs;
        let Some(first_reg_use) = lrs.next_register_position(r, lrs.start(r)) else {
            return Some(Progress::Spill);
        };
        let instr = lrs.uses[first_reg_use].pos.to_instruction_index();
        if let Some(pos) = self.a.split_position_for_instruction(r, instr) {
            return Some(Progress::SpillUntil(pos));
        }
        // The range needs a register from the start: split it so that some part of it becomes
        // small enough to fit somewhere.
        lrs.uses_of(r)
            .filter(|u| lrs.uses[*u].ty == UsePositionType::RequiresRegister)
            .find_map(|u| {
                let i = lrs.uses[u].pos.to_instruction_index();
                self.a.split_position_for_instruction(r, i).or_else(|| {
                    self.a
                        .split_position_for_instruction(r, InstrIdx::new(i.index() + 1))
                })
            })
            .map(Progress::Split)
    }

    /// How costly it would be to spill `r`: ranges with many uses in a small span are expensive.
    /// Ranges that can't be spilled or split have the maximum weight.
    fn spill_weight(&self, r: LiveRangeIdx) -> f32 {
        let lrs = &self.a.d.lrs;
        if lrs.top(r).is_fixed() || self.find_progress(r).is_none() {
            return f32::MAX;
        }
        let hinted = lrs.uses_of(r).any(|u| {
            matches!(
                lrs.uses[u].hint,
                UsePositionHint::Operand(InstructionOperand::Register { .. })
            )
        });
        let multiplier = if hinted { 3.0 } else { 1.0 };
        let uses = lrs.uses_of(r).count() as f32;
        multiplier * uses / (lrs.size(r) as f32)
    }

    /// The highest spill weight of the ranges in `rs`.
    fn max_weight(&self, rs: &[LiveRangeIdx]) -> f32 {
        rs.iter()
            .map(|r| self.spill_weight(*r))
            .fold(0.0, f32::max)
    }

    fn assign(&mut self, r: LiveRangeIdx, reg: RegCode) {
        self.allocations[usize::from(reg)].allocate_range(&self.a.d.lrs, r);
        self.a.set_assigned_register(r, reg);
    }

    fn evict(&mut self, r: LiveRangeIdx, reg: RegCode) {
        ra_trace!(
            self.a.d.log,
            "evicting {} from {}",
            self.a.d.lrs.name(r),
            self.a.reg_name(reg)
        );
        self.allocations[usize::from(reg)].remove_range(&self.a.d.lrs, r);
        self.a.d.lrs.unset_assigned_register(r);
        self.a.d.lrs.unset_use_hints(r);
        self.a.set_phi_register(r, None);
        self.a.d.stats.incr(Counter::Evictions);
        self.enqueue(r);
    }

    fn process(&mut self, r: LiveRangeIdx) {
        ra_trace!(self.a.d.log, "processing {}", self.a.d.lrs.name(r));
        let weight = self.spill_weight(r);
        let allocatable = self.a.allocatable;
        let lrs = &self.a.d.lrs;
        let hint = lrs
            .first_hint_position(r, &self.a.d.phis)
            .map(|(_, reg)| reg)
            .filter(|reg| allocatable.contains(reg));

        if let Some(hint) = hint {
            if self.allocations[usize::from(hint)].is_free_for(lrs, r) {
                self.assign(r, hint);
                return;
            }
        }
        if let Some(reg) = allocatable
            .iter()
            .copied()
            .find(|reg| self.allocations[usize::from(*reg)].is_free_for(lrs, r))
        {
            self.assign(r, reg);
            return;
        }

        // Every register is taken: find the one whose conflicting ranges are cheapest to evict,
        // preferring the hint.
        let mut evictable: Option<(RegCode, f32, Vec<LiveRangeIdx>)> = None;
        for reg in hint.into_iter().chain(allocatable.iter().copied()) {
            let conflicts = self.allocations[usize::from(reg)].conflicts(&self.a.d.lrs, r);
            let max = self.max_weight(&conflicts);
            if max >= weight {
                continue;
            }
            if Some(reg) == hint {
                evictable = Some((reg, max, conflicts));
                break;
            }
            if evictable.as_ref().map_or(true, |(_, x, _)| max < *x) {
                evictable = Some((reg, max, conflicts));
            }
        }
        if let Some((reg, _, conflicts)) = evictable {
            for c in conflicts {
                self.evict(c, reg);
            }
            self.assign(r, reg);
            return;
        }

        match self.find_progress(r) {
            Some(Progress::Spill) => self.a.spill(r),
            Some(Progress::SpillUntil(pos)) => {
                let tail = self.a.split_range_at(r, pos);
                self.a.spill(r);
                self.enqueue(tail);
            }
            Some(Progress::Split(pos)) => {
                let tail = self.a.split_range_at(r, pos);
                self.enqueue(r);
                self.enqueue(tail);
            }
            None => panic!(
                "{} needs a register but none can be made available",
                self.a.d.lrs.name(r)
            ),
        }
    }
}

impl AllocationStrategy for GreedyAllocator<'_, '_> {
    fn allocate_registers(&mut self) {
        self.a.split_and_spill_ranges_defined_by_memory_operand(true);

        for top in self.a.ranges_to_process() {
            let children = self
                .a
                .d
                .lrs
                .children(top)
                .filter(|r| !self.a.d.lrs.ranges[*r].spilled)
                .collect::<Vec<_>>();
            for r in children {
                self.enqueue(r);
            }
        }
        for top in self.a.d.fixed_live_ranges(self.a.kind).collect::<Vec<_>>() {
            let head = self.a.d.lrs.head(top);
            if let Some(reg) = self.a.d.lrs.ranges[head].assigned_register {
                self.allocations[usize::from(reg)].allocate_range(&self.a.d.lrs, head);
            }
        }

        while let Some((_, Reverse(r))) = self.queue.pop() {
            debug_assert!(self.a.d.lrs.ranges[r].assigned_register.is_none());
            self.process(r);
        }
    }
}

#[cfg(test)]
mod test {
    use super::{super::test_util::with_live_ranges, *};
    use crate::{
        config::RegisterConfiguration,
        sequence::{Instruction, Representation, SequenceBuilder, UnallocatedOperand, VReg},
    };

    fn two_regs() -> RegisterConfiguration {
        RegisterConfiguration::new(&["r0", "r1"], &["d0", "d1"], &[]).unwrap()
    }

    fn locations(d: &RegisterAllocationData, vreg: VReg) -> Vec<(Option<RegCode>, bool)> {
        let top = d.live_ranges[vreg.index()].unwrap();
        d.lrs
            .children(top)
            .map(|r| (d.lrs.ranges[r].assigned_register, d.lrs.ranges[r].spilled))
            .collect()
    }

    #[test]
    fn evict_cheapest() {
        let mut b = SequenceBuilder::new("t");
        let v0 = b.vreg(Representation::Word64);
        let v1 = b.vreg(Representation::Word64);
        let v2 = b.vreg(Representation::Word64);
        b.block();
        b.push(Instruction::new("def").output(UnallocatedOperand::register(v0)));
        b.push(Instruction::new("def").output(UnallocatedOperand::register(v1)));
        b.push(Instruction::new("def").output(UnallocatedOperand::register(v2)));
        b.push(
            Instruction::new("use")
                .input(UnallocatedOperand::register(v2))
                .input(UnallocatedOperand::register(v1)),
        );
        b.push(Instruction::new("use").input(UnallocatedOperand::any(v0)));
        let mut seq = b.build().unwrap();
        with_live_ranges(&mut seq, &two_regs(), |d| {
            GreedyAllocator::new(d, RegisterKind::General).allocate_registers();
            // v0 is the longest range, so is allocated first, but it has the fewest uses for its
            // size: v2 evicts it. v0 then keeps its register only until its definition is done.
            assert_eq!(d.stats.get(Counter::Evictions), 1);
            assert_eq!(locations(d, v0), vec![(Some(0), false), (None, true)]);
            assert_eq!(locations(d, v1), vec![(Some(1), false)]);
            assert_eq!(locations(d, v2), vec![(Some(0), false)]);
        });
    }

    #[test]
    fn split_around_call() {
        let mut b = SequenceBuilder::new("t");
        let v0 = b.vreg(Representation::Word64);
        b.block();
        b.push(Instruction::new("def").output(UnallocatedOperand::register(v0)));
        b.push(Instruction::new("call").call());
        b.push(Instruction::new("use").input(UnallocatedOperand::register(v0)));
        let mut seq = b.build().unwrap();
        with_live_ranges(&mut seq, &two_regs(), |d| {
            GreedyAllocator::new(d, RegisterKind::General).allocate_registers();
            assert_eq!(
                locations(d, v0),
                vec![(Some(0), false), (None, true), (Some(0), false)]
            );
            let top = d.live_ranges[v0.index()].unwrap();
            let starts = d
                .lrs
                .children(top)
                .map(|r| d.lrs.start(r).value())
                .collect::<Vec<_>>();
            assert_eq!(starts, vec![2, 4, 8]);
        });
    }

    #[test]
    fn hints_are_preferred() {
        let mut b = SequenceBuilder::new("t");
        let v0 = b.vreg(Representation::Word64);
        b.block();
        b.push(Instruction::new("def").output(UnallocatedOperand::register(v0)));
        b.push(Instruction::new("use").input(UnallocatedOperand::fixed_register(v0, 3)));
        let mut seq = b.build().unwrap();
        with_live_ranges(&mut seq, &RegisterConfiguration::x64(), |d| {
            GreedyAllocator::new(d, RegisterKind::General).allocate_registers();
            assert_eq!(locations(d, v0), vec![(Some(3), false)]);
        });
    }
}
