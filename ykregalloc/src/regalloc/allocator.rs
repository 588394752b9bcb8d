//! What every allocation strategy has in common: splitting and spilling live ranges, and choosing
//! good places to do so.

use super::{
    data::RegisterAllocationData,
    live_range::{LiveRangeIdx, TopLevelIdx},
    position::LifetimePosition,
};
use crate::{
    log::ra_trace,
    sequence::{InstrIdx, RegCode, RegisterKind},
    stats::Counter,
};

/// A way of assigning registers to the live ranges of one register kind.
pub(crate) trait AllocationStrategy {
    /// Give every live range of this allocator's kind a register or a spill slot.
    fn allocate_registers(&mut self);
}

pub(crate) struct RegisterAllocator<'d, 'a> {
    pub(crate) d: &'d mut RegisterAllocationData<'a>,
    pub(crate) kind: RegisterKind,
    /// The number of register codes of this kind, whether allocatable or not. Fixed ranges exist
    /// for some non-allocatable registers (e.g. `rsp` named by a pre-existing move).
    pub(crate) num_registers: usize,
    pub(crate) allocatable: &'a [RegCode],
}

impl<'d, 'a> RegisterAllocator<'d, 'a> {
    pub(crate) fn new(d: &'d mut RegisterAllocationData<'a>, kind: RegisterKind) -> Self {
        let config = d.config;
        Self {
            d,
            kind,
            num_registers: config.num_registers(kind),
            allocatable: config.allocatable_codes(kind),
        }
    }

    pub(crate) fn reg_name(&self, code: RegCode) -> &str {
        self.d.config.register_name(self.kind, code)
    }

    /// The non-empty top-level ranges of this allocator's kind.
    pub(crate) fn ranges_to_process(&self) -> Vec<TopLevelIdx> {
        self.d
            .top_level_ranges()
            .filter(|t| {
                let top = &self.d.lrs.tops[*t];
                top.kind() == self.kind && !self.d.lrs.is_empty(top.head)
            })
            .collect()
    }

    /// Split `r` at `pos`, returning the part starting at `pos`. If `pos` is at or before the start
    /// of `r`, nothing is split and `r` itself is returned.
    pub(crate) fn split_range_at(&mut self, r: LiveRangeIdx, pos: LifetimePosition) -> LiveRangeIdx {
        debug_assert!(!self.d.lrs.top(r).is_fixed());
        if pos <= self.d.lrs.start(r) {
            return r;
        }
        ra_trace!(self.d.log, "splitting {} at {pos}", self.d.lrs.name(r));
        self.d.stats.incr(Counter::Splits);
        self.d.lrs.split_at(r, pos)
    }

    /// Split `r` somewhere in `[start, end]`, as late as possible unless an earlier split would
    /// keep a loop free of the split.
    pub(crate) fn split_between(
        &mut self,
        r: LiveRangeIdx,
        start: LifetimePosition,
        end: LifetimePosition,
    ) -> LiveRangeIdx {
        ra_trace!(
            self.d.log,
            "splitting {} in [{start}, {end}]",
            self.d.lrs.name(r)
        );
        let pos = self.find_optimal_split_pos(start, end);
        debug_assert!(pos >= start);
        self.split_range_at(r, pos)
    }

    /// Find a position in `[start, end]` to split at. Splitting at the end is best, unless the end
    /// is inside a loop that starts after `start`: then the header of the outermost such loop is
    /// chosen, so that the value's location doesn't change on every iteration.
    pub(crate) fn find_optimal_split_pos(
        &self,
        start: LifetimePosition,
        end: LifetimePosition,
    ) -> LifetimePosition {
        let (start_instr, end_instr) = (start.to_instruction_index(), end.to_instruction_index());
        debug_assert!(start_instr <= end_instr);
        if start_instr == end_instr {
            return end;
        }
        let start_block = self.d.block_at(start).rpo_number();
        let end_block = self.d.block_at(end);
        if end_block.rpo_number() == start_block {
            return end;
        }
        let mut block = end_block;
        while let Some(header) = self.d.containing_loop(block) {
            if header.rpo_number() <= start_block {
                break;
            }
            block = header;
        }
        if block.rpo_number() == end_block.rpo_number() && !end_block.is_loop_header() {
            return end;
        }
        LifetimePosition::gap_from_instruction_index(block.first_instruction_index())
    }

    /// If `r` is to be spilled at `pos` inside a loop, try to move the spill back to the loop's
    /// header, so that the back edge needs no memory move. This is only done if `r` has no
    /// register-beneficial use between the header and `pos`.
    pub(crate) fn find_optimal_spilling_pos(
        &self,
        r: LiveRangeIdx,
        mut pos: LifetimePosition,
    ) -> LifetimePosition {
        let block = self.d.block_at(pos.start());
        let mut header = if block.is_loop_header() {
            Some(block)
        } else {
            self.d.containing_loop(block)
        };
        if header.is_none() {
            return pos;
        }
        let prev_use = self
            .d
            .lrs
            .previous_use_position_register_is_beneficial(r, pos)
            .map(|u| self.d.lrs.uses[u].pos);
        while let Some(h) = header {
            let loop_start = LifetimePosition::gap_from_instruction_index(h.first_instruction_index());
            if self.d.lrs.covers(r, loop_start) && prev_use.map_or(true, |x| x < loop_start) {
                pos = loop_start;
            }
            // Try hoisting out to an outer loop.
            header = self.d.containing_loop(h);
        }
        pos
    }

    /// The gap before instruction `i`, if `r` can be split there.
    pub(crate) fn split_position_for_instruction(
        &self,
        r: LiveRangeIdx,
        i: InstrIdx,
    ) -> Option<LifetimePosition> {
        let pos = LifetimePosition::gap_from_instruction_index(i);
        if self.d.lrs.start(r) >= pos || pos >= self.d.lrs.end(r) {
            return None;
        }
        Some(pos)
    }

    /// Send `r` to the stack, giving its top-level range a spill range if it doesn't already have
    /// somewhere to go.
    pub(crate) fn spill(&mut self, r: LiveRangeIdx) {
        ra_trace!(self.d.log, "spilling {}", self.d.lrs.name(r));
        let top = self.d.lrs.ranges[r].top;
        if self.d.lrs.tops[top].has_no_spill_type() {
            self.d.assign_spill_range(top);
        }
        self.d.lrs.mark_spilled(r);
        self.d.stats.incr(Counter::Spills);
    }

    /// Record that `r` lives in `reg`, and let everything hinted by `r` know.
    pub(crate) fn set_assigned_register(&mut self, r: LiveRangeIdx, reg: RegCode) {
        ra_trace!(
            self.d.log,
            "assigning {} to {}",
            self.reg_name(reg),
            self.d.lrs.name(r)
        );
        self.d.mark_allocated(self.kind, reg);
        self.d.lrs.set_assigned_register(r, reg);
        self.d.lrs.set_use_hints(r, reg);
        self.set_phi_register(r, Some(reg));
    }

    /// If `r` is the head of a phi's range, record `reg` as the phi's register.
    pub(crate) fn set_phi_register(&mut self, r: LiveRangeIdx, reg: Option<RegCode>) {
        if !self.d.lrs.is_top_level(r) || !self.d.lrs.top(r).is_phi {
            return;
        }
        if let Some(phi) = self.d.phi_for(self.d.lrs.ranges[r].top) {
            self.d.phis[phi].assigned_register = reg;
        }
    }

    /// Values that already have a home on the stack (e.g. those defined by a fixed slot output)
    /// are spilled up to their first register-beneficial use. If `operands_only`, values whose
    /// home is a spill range are left alone.
    pub(crate) fn split_and_spill_ranges_defined_by_memory_operand(&mut self, operands_only: bool) {
        for top in self.ranges_to_process() {
            let t = &self.d.lrs.tops[top];
            if t.has_no_spill_type() || (operands_only && t.has_spill_range()) {
                continue;
            }
            let head = t.head;
            let start = self.d.lrs.start(head);
            ra_trace!(
                self.d.log,
                "{} is defined by a spill operand",
                self.d.lrs.name(head)
            );
            match self
                .d
                .lrs
                .next_use_position_register_is_beneficial(head, start.next_start())
            {
                None => self.spill(head),
                // A register-beneficial use right at the start isn't worth spilling for.
                Some(u) if self.d.lrs.uses[u].pos > start.next_start() => {
                    let upos = self.d.lrs.uses[u].pos;
                    let Some(split) =
                        self.split_position_for_instruction(head, upos.to_instruction_index())
                    else {
                        continue;
                    };
                    let split = self.find_optimal_split_pos(start.next_full_start(), split);
                    self.split_range_at(head, split);
                    self.spill(head);
                }
                Some(_) => (),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{super::test_util::with_live_ranges, *};
    use crate::{
        config::RegisterConfiguration,
        sequence::{Instruction, Representation, SequenceBuilder, UnallocatedOperand},
    };

    fn p(x: i32) -> LifetimePosition {
        LifetimePosition::from_int(x)
    }

    /// B0: v0 = def; B1..B3 a loop (header B1); B3: use v0 after the loop.
    fn loop_seq() -> (crate::sequence::InstructionSequence, crate::sequence::VReg) {
        let mut b = SequenceBuilder::new("t");
        let v0 = b.vreg(Representation::Word64);
        let b0 = b.block();
        b.push(Instruction::new("def").output(UnallocatedOperand::register(v0)));
        b.push(Instruction::new("jmp"));
        let b1 = b.block();
        b.push(Instruction::new("nop"));
        b.push(Instruction::new("branch"));
        let b2 = b.block();
        b.push(Instruction::new("nop"));
        b.push(Instruction::new("jmp"));
        let b3 = b.block();
        b.push(Instruction::new("use").input(UnallocatedOperand::register(v0)));
        b.edge(b0, b1);
        b.edge(b1, b2);
        b.edge(b1, b3);
        b.edge(b2, b1);
        b.mark_loop(b1, b3);
        (b.build().unwrap(), v0)
    }

    #[test]
    fn optimal_split_pos() {
        let (mut seq, _) = loop_seq();
        with_live_ranges(&mut seq, &RegisterConfiguration::x64(), |d| {
            let a = RegisterAllocator::new(d, RegisterKind::General);
            // Within one instruction or one block, split as late as possible.
            assert_eq!(a.find_optimal_split_pos(p(2), p(3)), p(3));
            assert_eq!(a.find_optimal_split_pos(p(1), p(6)), p(6));
            // Ending inside the loop: split at the loop header instead.
            assert_eq!(a.find_optimal_split_pos(p(2), p(19)), p(8));
            // Ending at the loop header itself.
            assert_eq!(a.find_optimal_split_pos(p(2), p(10)), p(8));
            // Starting inside the loop: no hoisting.
            assert_eq!(a.find_optimal_split_pos(p(9), p(19)), p(19));
            // Ending after the loop.
            assert_eq!(a.find_optimal_split_pos(p(2), p(26)), p(26));
        });
    }

    #[test]
    fn optimal_spilling_pos() {
        let (mut seq, v0) = loop_seq();
        with_live_ranges(&mut seq, &RegisterConfiguration::x64(), |d| {
            let head = d.lrs.head(d.live_ranges[v0.index()].unwrap());
            let a = RegisterAllocator::new(d, RegisterKind::General);
            // v0 is live throughout the loop and has no use in it: spill at the header.
            assert_eq!(a.find_optimal_spilling_pos(head, p(18)), p(8));
            // Outside any loop, the position is left alone.
            assert_eq!(a.find_optimal_spilling_pos(head, p(4)), p(4));
        });
    }

    #[test]
    fn spill_and_split_positions() {
        let (mut seq, v0) = loop_seq();
        with_live_ranges(&mut seq, &RegisterConfiguration::x64(), |d| {
            let top = d.live_ranges[v0.index()].unwrap();
            let head = d.lrs.head(top);
            let mut a = RegisterAllocator::new(d, RegisterKind::General);
            assert_eq!(a.split_position_for_instruction(head, InstrIdx::new(0)), None);
            assert_eq!(
                a.split_position_for_instruction(head, InstrIdx::new(3)),
                Some(p(12))
            );
            assert_eq!(a.split_position_for_instruction(head, InstrIdx::new(7)), None);
            assert_eq!(a.split_range_at(head, p(2)), head);
            let tail = a.split_range_at(head, p(12));
            assert_ne!(tail, head);
            a.spill(tail);
            assert!(a.d.lrs.ranges[tail].spilled);
            assert!(a.d.lrs.tops[top].has_spill_range());
            assert_eq!(a.d.stats.get(Counter::Splits), 1);
            assert_eq!(a.d.stats.get(Counter::Spills), 1);
        });
    }

    #[test]
    fn ranges_defined_by_memory_operands() {
        let mut b = SequenceBuilder::new("t");
        let v0 = b.vreg(Representation::Word64);
        let v1 = b.vreg(Representation::Word64);
        b.block();
        b.push(Instruction::new("load").output(UnallocatedOperand::fixed_slot(v0, 3)));
        b.push(Instruction::new("load").output(UnallocatedOperand::fixed_slot(v1, 4)));
        b.push(Instruction::new("nop"));
        b.push(Instruction::new("nop"));
        b.push(Instruction::new("use").input(UnallocatedOperand::register(v0)));
        b.push(Instruction::new("use").input(UnallocatedOperand::any(v1)));
        let mut seq = b.build().unwrap();
        with_live_ranges(&mut seq, &RegisterConfiguration::x64(), |d| {
            let (t0, t1) = (
                d.live_ranges[v0.index()].unwrap(),
                d.live_ranges[v1.index()].unwrap(),
            );
            let mut a = RegisterAllocator::new(d, RegisterKind::General);
            a.split_and_spill_ranges_defined_by_memory_operand(true);
            let d = a.d;
            // v0 stays on the stack until shortly before the instruction that needs it in a
            // register.
            let c0 = d.lrs.children(t0).collect::<Vec<_>>();
            assert_eq!(c0.len(), 2);
            assert!(d.lrs.ranges[c0[0]].spilled);
            assert_eq!(d.lrs.start(c0[1]), p(16));
            // v1 never benefits from a register.
            let c1 = d.lrs.children(t1).collect::<Vec<_>>();
            assert_eq!(c1.len(), 1);
            assert!(d.lrs.ranges[c1[0]].spilled);
        });
    }
}
