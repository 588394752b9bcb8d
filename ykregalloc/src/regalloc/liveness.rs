//! Liveness analysis: build a live range for every virtual register, and for every physical
//! register that some instruction fixes or clobbers.
//!
//! Blocks are visited in reverse order and instructions backwards within each block. A value is
//! assumed live from the start of the block until its last use; when its definition is found, the
//! range is shortened to start there. Values live around a loop's back edge are made live across
//! the whole loop.

use super::{
    data::RegisterAllocationData,
    live_range::{SpillLocation, TopLevelIdx, UsePositionHint, UsePositionIdx, UsePositionType},
    position::LifetimePosition,
};
use crate::{
    log::ra_trace,
    sequence::{GapPosition, InstrIdx, InstructionOperand, OperandSlot, RegisterKind, RpoNumber},
    stats::Counter,
    RegAllocError,
};
use std::collections::HashMap;
use vob::Vob;

pub(crate) struct LiveRangeBuilder<'d, 'a> {
    d: &'d mut RegisterAllocationData<'a>,
    /// The use created for each phi's definition, keyed by the source of the move into the phi
    /// from its block's first predecessor. When that move is processed, the phi's use is hinted
    /// with the move's source.
    phi_hints: HashMap<OperandSlot, UsePositionIdx>,
}

impl<'d, 'a> LiveRangeBuilder<'d, 'a> {
    pub(crate) fn new(d: &'d mut RegisterAllocationData<'a>) -> Self {
        Self {
            d,
            phi_hints: HashMap::new(),
        }
    }

    pub(crate) fn build_live_ranges(&mut self) -> Result<(), RegAllocError> {
        for b in self.d.seq.blocks().indices().rev() {
            let mut live = self.compute_live_out(b);
            self.add_initial_intervals(b, &live);
            self.process_instructions(b, &mut live);
            self.process_phis(b, &mut live);
            if self.d.seq.block(b).is_loop_header() {
                self.process_loop_header(b, &live);
            }
            self.d.live_in_sets[b] = live;
        }

        let tops = self.d.top_level_ranges().collect::<Vec<_>>();
        self.d.stats.add(Counter::LiveRanges, tops.len() as u64);
        for top in tops {
            let t = &self.d.lrs.tops[top];
            ra_trace!(
                self.d.log,
                "built {}: {}",
                self.d.lrs.name(t.head),
                self.d
                    .lrs
                    .intervals_of(t.head)
                    .map(|ui| format!("[{}, {})", ui.start, ui.end))
                    .collect::<Vec<_>>()
                    .join(" ")
            );
            // Every value with a use that demands a slot will need one.
            if t.has_slot_use && t.has_no_spill_type() {
                self.d.assign_spill_range(top);
            }
            // A constant can always be rematerialised, so it is never worth spilling: uses that
            // could take the constant itself are instead made to ask for a register. Gap
            // positions (i.e. moves) can read the constant directly.
            if matches!(
                self.d.lrs.tops[top].spill,
                SpillLocation::Operand(InstructionOperand::Constant(_))
            ) {
                let head = self.d.lrs.head(top);
                let uses = self.d.lrs.uses_of(head).collect::<Vec<_>>();
                for u in uses {
                    let up = &mut self.d.lrs.uses[u];
                    if up.ty == UsePositionType::RequiresSlot {
                        continue;
                    }
                    let ty = if up.pos.is_gap_position() {
                        UsePositionType::Any
                    } else {
                        UsePositionType::RequiresRegister
                    };
                    up.set_type(ty, true);
                }
            }
        }

        let undefined = self.d.live_in_sets[RpoNumber::new(0)]
            .iter_set_bits(..)
            .map(|x| u32::try_from(x).unwrap())
            .collect::<Vec<_>>();
        if !undefined.is_empty() {
            return Err(RegAllocError::UseWithoutDefinition(undefined));
        }
        Ok(())
    }

    /// The values live at the end of block `b`: those live into its forward successors, plus the
    /// values its successors' phis read along the edge from `b`.
    fn compute_live_out(&self, b: RpoNumber) -> Vob {
        let mut live = Vob::from_elem(false, self.d.seq.virtual_register_count());
        for succ in self.d.seq.block(b).successors() {
            // Back edges are accounted for by the loop header.
            if *succ <= b {
                continue;
            }
            live.or(&self.d.live_in_sets[*succ]);
            let sblock = self.d.seq.block(*succ);
            let Some(pred_idx) = sblock.predecessor_index_of(b) else {
                panic!("B{} is not a predecessor of B{}", b.index(), succ.index());
            };
            for phi in sblock.phis() {
                live.set(phi.operands()[pred_idx].index(), true);
            }
        }
        live
    }

    /// Assume every value live out of `b` is live across the whole block.
    fn add_initial_intervals(&mut self, b: RpoNumber, live: &Vob) {
        let block = self.d.seq.block(b);
        let start = LifetimePosition::gap_from_instruction_index(block.first_instruction_index());
        let end =
            LifetimePosition::instruction_from_instruction_index(block.last_instruction_index())
                .next_start();
        for vreg in live.iter_set_bits(..) {
            let top = self.d.live_range_for(vreg.into());
            self.d.lrs.add_use_interval(top, start, end);
        }
    }

    /// The range an operand belongs to, if any.
    fn live_range_for(&mut self, op: &InstructionOperand) -> Option<TopLevelIdx> {
        match op {
            InstructionOperand::Unallocated(u) => Some(self.d.live_range_for(u.vreg)),
            InstructionOperand::Constant(vreg) => Some(self.d.live_range_for(*vreg)),
            InstructionOperand::Register { kind, code } => {
                Some(self.d.fixed_live_range_for(*kind, *code))
            }
            _ => None,
        }
    }

    /// Record the definition of `op` (found at `slot`) at `pos`.
    fn define(
        &mut self,
        pos: LifetimePosition,
        slot: OperandSlot,
        op: &InstructionOperand,
        hint: UsePositionHint,
    ) -> Option<UsePositionIdx> {
        let top = self.live_range_for(op)?;
        let head = self.d.lrs.head(top);
        if self.d.lrs.is_empty(head) || self.d.lrs.start(head) > pos {
            // A definition without a use.
            self.d.lrs.add_use_interval(top, pos, pos.next_start());
            let u = self
                .d
                .lrs
                .new_use(pos.next_start(), None, UsePositionHint::None);
            self.d.lrs.add_use_position(top, u);
        } else {
            self.d.lrs.shorten_to(top, pos);
        }
        let InstructionOperand::Unallocated(unalloc) = op else {
            return None;
        };
        let u = self.d.lrs.new_use(pos, Some((slot, unalloc)), hint);
        self.d.lrs.add_use_position(top, u);
        Some(u)
    }

    /// Record a use of `op` (found at `slot`) at `pos`: the value must be live from the start of
    /// the block until then.
    fn use_(
        &mut self,
        block_start: LifetimePosition,
        pos: LifetimePosition,
        slot: OperandSlot,
        op: &InstructionOperand,
        hint: UsePositionHint,
    ) -> Option<UsePositionIdx> {
        let top = self.live_range_for(op)?;
        let u = match op {
            InstructionOperand::Unallocated(unalloc) => {
                let u = self.d.lrs.new_use(pos, Some((slot, unalloc)), hint);
                self.d.lrs.add_use_position(top, u);
                Some(u)
            }
            _ => None,
        };
        self.d.lrs.add_use_interval(top, block_start, pos);
        u
    }

    fn process_instructions(&mut self, b: RpoNumber, live: &mut Vob) {
        let block = self.d.seq.block(b);
        let (first, last) = (
            block.first_instruction_index(),
            block.last_instruction_index(),
        );
        let block_start = LifetimePosition::gap_from_instruction_index(first);
        for i in (first.index()..=last.index()).rev().map(InstrIdx::new) {
            let pos = LifetimePosition::instruction_from_instruction_index(i);
            let instr = self.d.seq.instruction(i);
            let outputs = instr.outputs().to_vec();
            let inputs = instr.inputs().to_vec();
            let temps = instr.temps().to_vec();
            let clobbers = [
                (RegisterKind::General, instr.clobbers_registers()),
                (RegisterKind::Double, instr.clobbers_double_registers()),
            ];

            for (j, output) in outputs.iter().enumerate() {
                if let Some(vreg) = output.vreg() {
                    live.set(vreg.index(), false);
                }
                self.define(pos, OperandSlot::Output(i, j), output, UsePositionHint::None);
            }

            for (kind, clobbered) in clobbers {
                if !clobbered {
                    continue;
                }
                for code in self.d.config.allocatable_codes(kind).to_vec() {
                    if self.d.seq.instruction(i).is_output_register(kind, code) {
                        continue;
                    }
                    let top = self.d.fixed_live_range_for(kind, code);
                    self.d.lrs.add_use_interval(top, pos, pos.end());
                }
            }

            for (j, input) in inputs.iter().enumerate() {
                // Constants are rematerialised where they are used, so their uses don't extend
                // their live ranges: only their definitions matter. Immediates have no live range
                // at all.
                if input.is_immediate() || input.is_constant() {
                    continue;
                }
                let use_pos = match input {
                    InstructionOperand::Unallocated(u) if u.used_at_start => pos,
                    _ => pos.end(),
                };
                if let InstructionOperand::Unallocated(u) = input {
                    live.set(u.vreg.index(), true);
                    if u.has_slot_policy() {
                        let top = self.d.live_range_for(u.vreg);
                        self.d.lrs.tops[top].has_slot_use = true;
                    }
                }
                self.use_(
                    block_start,
                    use_pos,
                    OperandSlot::Input(i, j),
                    input,
                    UsePositionHint::None,
                );
            }

            for (j, temp) in temps.iter().enumerate() {
                let slot = OperandSlot::Temp(i, j);
                self.use_(block_start, pos.end(), slot, temp, UsePositionHint::None);
                self.define(pos, slot, temp, UsePositionHint::None);
            }

            // The moves in the gap before the instruction: END moves happen after START moves, so
            // are visited first.
            let gap = pos.prev_start();
            for (gpos, pos) in [(GapPosition::End, gap.end()), (GapPosition::Start, gap.start())] {
                self.process_gap_moves(b, i, gpos, pos, block_start, live);
            }
        }
    }

    fn process_gap_moves(
        &mut self,
        b: RpoNumber,
        i: InstrIdx,
        gpos: GapPosition,
        pos: LifetimePosition,
        block_start: LifetimePosition,
        live: &mut Vob,
    ) {
        let Some(pm) = self.d.seq.instruction(i).parallel_move(gpos) else {
            return;
        };
        let moves = pm.moves().to_vec();
        for (j, mv) in moves.iter().enumerate() {
            if mv.is_eliminated() {
                continue;
            }
            let (from, to) = (mv.source, mv.destination);
            let mut hint = UsePositionHint::for_operand(&to);
            let mut to_use = None;
            let mut to_phi = false;
            match to {
                InstructionOperand::Unallocated(u) => {
                    let top = self.d.live_range_for(u.vreg);
                    if self.d.lrs.tops[top].is_phi {
                        to_phi = true;
                        hint = if self.d.lrs.tops[top].is_non_loop_phi {
                            match self.d.lrs.first_hinted_use(top) {
                                Some(x) => UsePositionHint::UsePos(x),
                                None => UsePositionHint::None,
                            }
                        } else {
                            match self.d.phi_for(top) {
                                Some(p) => UsePositionHint::Phi(p),
                                None => panic!("v{} is a phi without a phi map", u.vreg.index()),
                            }
                        };
                    } else if live.get(u.vreg.index()).unwrap_or(false) {
                        to_use = self.define(
                            pos,
                            OperandSlot::MoveDestination(i, gpos, j),
                            &to,
                            UsePositionHint::for_operand(&from),
                        );
                        live.set(u.vreg.index(), false);
                    } else {
                        // Nothing reads the destination.
                        ra_trace!(
                            self.d.log,
                            "B{}: eliminating dead move to v{} at {pos}",
                            b.index(),
                            u.vreg.index()
                        );
                        self.d.seq.eliminate_gap_move(i, gpos, j);
                        continue;
                    }
                }
                _ => {
                    self.define(
                        pos,
                        OperandSlot::MoveDestination(i, gpos, j),
                        &to,
                        UsePositionHint::None,
                    );
                }
            }
            let from_slot = OperandSlot::MoveSource(i, gpos, j);
            let from_use = self.use_(block_start, pos, from_slot, &from, hint);
            if let InstructionOperand::Unallocated(u) = from {
                live.set(u.vreg.index(), true);
            }
            if let (Some(t), Some(f)) = (to_use, from_use) {
                self.d.lrs.uses[t].resolve_hint(f);
                self.d.lrs.uses[f].resolve_hint(t);
            }
            if to_phi {
                if let (Some(phi_use), Some(f)) = (self.phi_hints.get(&from_slot), from_use) {
                    self.d.lrs.uses[*phi_use].resolve_hint(f);
                }
            }
        }
    }

    /// Define each of `b`'s phis at the start of the block.
    fn process_phis(&mut self, b: RpoNumber, live: &mut Vob) {
        let block = self.d.seq.block(b);
        if block.phis().is_empty() {
            return;
        }
        let start = LifetimePosition::gap_from_instruction_index(block.first_instruction_index());
        let pred_last = self
            .d
            .seq
            .block(block.predecessors()[0])
            .last_instruction_index();
        let phis = block
            .phis()
            .iter()
            .map(|phi| (phi.vreg(), *phi.output()))
            .collect::<Vec<_>>();
        for (k, (vreg, output)) in phis.into_iter().enumerate() {
            live.set(vreg.index(), false);
            // Hint the phi with whatever flows in from the first predecessor.
            let moves = self
                .d
                .seq
                .instruction(pred_last)
                .parallel_move(GapPosition::End)
                .map(|pm| pm.moves())
                .unwrap_or_default();
            let Some((j, mv)) = moves.iter().enumerate().find(|(_, mv)| {
                !mv.is_eliminated()
                    && matches!(mv.destination, InstructionOperand::Unallocated(u) if u.vreg == vreg)
            }) else {
                panic!(
                    "No move into phi v{} from B{}'s first predecessor",
                    vreg.index(),
                    b.index()
                );
            };
            let hint = UsePositionHint::for_operand(&mv.source);
            let source = OperandSlot::MoveSource(pred_last, GapPosition::End, j);
            if let Some(u) = self.define(start, OperandSlot::PhiOutput(b, k), &output, hint) {
                self.phi_hints.insert(source, u);
            }
        }
    }

    /// Make every value live into loop header `b` live throughout the loop.
    fn process_loop_header(&mut self, b: RpoNumber, live: &Vob) {
        let block = self.d.seq.block(b);
        let start = LifetimePosition::gap_from_instruction_index(block.first_instruction_index());
        let end =
            LifetimePosition::gap_from_instruction_index(self.d.last_loop_instruction_index(block))
                .next_full_start();
        let Some(loop_end) = block.loop_end() else {
            return;
        };
        for vreg in live.iter_set_bits(..) {
            let top = self.d.live_range_for(vreg.into());
            self.d.lrs.ensure_interval(top, start, end);
        }
        for lb in b.index() + 1..loop_end.index() {
            self.d.live_in_sets[RpoNumber::new(lb)].or(live);
        }
    }
}

#[cfg(test)]
mod test {
    use super::{super::constraints::ConstraintBuilder, *};
    use crate::{
        config::RegisterConfiguration,
        log::Log,
        sequence::{
            Frame, Instruction, InstructionSequence, Representation, SequenceBuilder,
            UnallocatedOperand, VReg,
        },
    };

    fn build(
        seq: &mut InstructionSequence,
        f: impl FnOnce(&mut RegisterAllocationData),
    ) -> Result<(), RegAllocError> {
        let mut frame = Frame::new(0);
        let cfg = RegisterConfiguration::x64();
        let log = Log::disabled();
        let mut d = RegisterAllocationData::new(seq, &mut frame, &cfg, &log);
        let mut cb = ConstraintBuilder::new(&mut d);
        cb.meet_register_constraints()?;
        cb.resolve_phis();
        LiveRangeBuilder::new(&mut d).build_live_ranges()?;
        f(&mut d);
        Ok(())
    }

    fn intervals(d: &RegisterAllocationData, vreg: VReg) -> Vec<(i32, i32)> {
        let head = d.lrs.head(d.live_ranges[vreg.index()].unwrap());
        d.lrs
            .intervals_of(head)
            .map(|ui| (ui.start.value(), ui.end.value()))
            .collect()
    }

    fn uses(d: &RegisterAllocationData, vreg: VReg) -> Vec<(i32, UsePositionType)> {
        let head = d.lrs.head(d.live_ranges[vreg.index()].unwrap());
        d.lrs
            .uses_of(head)
            .map(|u| (d.lrs.uses[u].pos.value(), d.lrs.uses[u].ty))
            .collect()
    }

    #[test]
    fn straight_line() {
        let mut b = SequenceBuilder::new("t");
        let v0 = b.vreg(Representation::Word64);
        let v1 = b.vreg(Representation::Word64);
        let v2 = b.vreg(Representation::Word64);
        b.block();
        b.push(Instruction::new("def").output(UnallocatedOperand::register(v0)));
        b.push(Instruction::new("def").output(UnallocatedOperand::register(v1)));
        b.push(
            Instruction::new("add")
                .input(UnallocatedOperand::register(v0).at_start())
                .input(UnallocatedOperand::any(v1))
                .output(UnallocatedOperand::register(v2)),
        );
        b.push(Instruction::new("ret").input(UnallocatedOperand::slot(v2)));
        let mut seq = b.build().unwrap();
        build(&mut seq, |d| {
            assert_eq!(intervals(d, v0), vec![(2, 10)]);
            assert_eq!(intervals(d, v1), vec![(6, 11)]);
            assert_eq!(intervals(d, v2), vec![(10, 15)]);
            use UsePositionType::*;
            assert_eq!(uses(d, v0), vec![(2, RequiresRegister), (10, RequiresRegister)]);
            assert_eq!(uses(d, v1), vec![(6, RequiresRegister), (11, Any)]);
            assert_eq!(uses(d, v2), vec![(10, RequiresRegister), (15, RequiresSlot)]);
            // A slot use means a spill range is needed.
            let t2 = d.live_ranges[v2.index()].unwrap();
            assert!(d.lrs.tops[t2].has_slot_use && d.lrs.tops[t2].has_spill_range());
            d.lrs.verify_child_structure(t2).unwrap();
        })
        .unwrap();
    }

    #[test]
    fn definition_without_use() {
        let mut b = SequenceBuilder::new("t");
        let v0 = b.vreg(Representation::Word64);
        b.block();
        b.push(Instruction::new("def").output(UnallocatedOperand::register(v0)));
        b.push(Instruction::new("ret"));
        let mut seq = b.build().unwrap();
        build(&mut seq, |d| {
            assert_eq!(intervals(d, v0), vec![(2, 4)]);
            assert_eq!(uses(d, v0).len(), 2);
        })
        .unwrap();
    }

    #[test]
    fn calls_clobber_registers() {
        let mut b = SequenceBuilder::new("t");
        let v0 = b.vreg(Representation::Word64);
        b.block();
        b.push(Instruction::new("nop"));
        b.push(
            Instruction::new("call")
                .output(UnallocatedOperand::fixed_register(v0, 0))
                .call(),
        );
        b.push(Instruction::new("ret").input(UnallocatedOperand::any(v0)));
        let mut seq = b.build().unwrap();
        build(&mut seq, |d| {
            let rcx = d
                .fixed_live_ranges(RegisterKind::General)
                .find(|t| d.lrs.tops[*t].vreg == -2)
                .unwrap();
            let rcx = d.lrs.head(rcx);
            assert!(d.lrs.covers(rcx, LifetimePosition::from_int(6)));
            assert!(!d.lrs.covers(rcx, LifetimePosition::from_int(7)));
            // rax is the call's output, so only holds the output itself until the gap move that
            // copies it out.
            let rax = d.lrs.head(
                d.fixed_live_ranges(RegisterKind::General)
                    .find(|t| d.lrs.tops[*t].vreg == -1)
                    .unwrap(),
            );
            assert_eq!(
                d.lrs
                    .intervals_of(rax)
                    .map(|ui| (ui.start.value(), ui.end.value()))
                    .collect::<Vec<_>>(),
                vec![(6, 8)]
            );
            // Every double register is clobbered too.
            assert_eq!(d.fixed_live_ranges(RegisterKind::Double).count(), 16);
            assert_eq!(intervals(d, v0), vec![(8, 11)]);
        })
        .unwrap();
    }

    #[test]
    fn dead_moves_are_eliminated() {
        let mut b = SequenceBuilder::new("t");
        let v0 = b.vreg(Representation::Word64);
        let v1 = b.vreg(Representation::Word64);
        b.block();
        b.push(Instruction::new("def").output(UnallocatedOperand::register(v0)));
        b.push(Instruction::new("ret").gap_move(
            GapPosition::Start,
            UnallocatedOperand::any(v0),
            UnallocatedOperand::any(v1),
        ));
        let mut seq = b.build().unwrap();
        build(&mut seq, |d| {
            let pm = d
                .seq
                .instruction(InstrIdx::new(1))
                .parallel_move(GapPosition::Start)
                .unwrap();
            assert!(pm.moves()[0].is_eliminated());
        })
        .unwrap();
    }

    #[test]
    fn loops() {
        let mut b = SequenceBuilder::new("t");
        let v0 = b.vreg(Representation::Word64);
        let v1 = b.vreg(Representation::Word64);
        let v2 = b.vreg(Representation::Word64);
        let b0 = b.block();
        b.push(Instruction::new("def").output(UnallocatedOperand::register(v0)));
        b.push(Instruction::new("def").output(UnallocatedOperand::register(v1)));
        b.push(Instruction::new("jmp"));
        let b1 = b.block();
        b.phi(v2, &[v1, v2]);
        b.push(Instruction::new("use").input(UnallocatedOperand::register(v2)));
        b.push(Instruction::new("branch"));
        let b2 = b.block();
        b.push(Instruction::new("jmp"));
        let b3 = b.block();
        b.push(Instruction::new("ret").input(UnallocatedOperand::any(v0)));
        b.edge(b0, b1);
        b.edge(b1, b2);
        b.edge(b2, b1);
        b.edge(b1, b3);
        b.mark_loop(b1, b3);
        let mut seq = b.build().unwrap();
        build(&mut seq, |d| {
            // v0 is live from its definition, through the whole loop, to its use.
            assert_eq!(intervals(d, v0), vec![(2, 27)]);
            assert!(d.live_in_sets[b1].get(v0.index()).unwrap());
            assert!(d.live_in_sets[b2].get(v0.index()).unwrap());
            assert!(d.live_in_sets[b2].get(v2.index()).unwrap());
            let t2 = d.live_ranges[v2.index()].unwrap();
            assert!(d.lrs.tops[t2].is_phi && !d.lrs.tops[t2].is_non_loop_phi);
            // The phi is live from the header to the move at the end of the back edge.
            assert_eq!(intervals(d, v2), vec![(12, 21)]);
        })
        .unwrap();
    }

    #[test]
    fn use_without_definition() {
        let mut b = SequenceBuilder::new("t");
        let v0 = b.vreg(Representation::Word64);
        let v1 = b.vreg(Representation::Word64);
        b.block();
        b.push(
            Instruction::new("ret")
                .input(UnallocatedOperand::any(v1))
                .input(UnallocatedOperand::any(v0)),
        );
        let mut seq = b.build().unwrap();
        match build(&mut seq, |_| ()) {
            Err(RegAllocError::UseWithoutDefinition(v)) => assert_eq!(v, vec![0, 1]),
            x => panic!("{x:?}"),
        }
    }

    #[test]
    fn constants() {
        let mut b = SequenceBuilder::new("t");
        let c = b.constant(Representation::Word64, crate::sequence::Constant::Int64(3));
        b.block();
        b.push(Instruction::new("const").output(InstructionOperand::Constant(c)));
        b.push(
            Instruction::new("use")
                .input(UnallocatedOperand::any(c))
                .gap_move(
                    GapPosition::Start,
                    UnallocatedOperand::any(c),
                    InstructionOperand::register(RegisterKind::General, 3),
                ),
        );
        b.push(Instruction::new("ret"));
        let mut seq = b.build().unwrap();
        build(&mut seq, |d| {
            let t = d.live_ranges[c.index()].unwrap();
            assert!(d.lrs.tops[t].has_spill_operand());
            assert_eq!(intervals(d, c), vec![(2, 7)]);
            // The instruction's use must be in a register; the move can read the constant.
            assert_eq!(
                uses(d, c)
                    .into_iter()
                    .map(|(_, ty)| ty)
                    .collect::<Vec<_>>(),
                vec![UsePositionType::Any, UsePositionType::RequiresRegister]
            );
        })
        .unwrap();
    }
}
