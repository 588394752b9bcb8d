//! Satisfy fixed operand constraints and turn phis into gap moves.
//!
//! After this phase no operand has a fixed policy: each has been rewritten to its fixed location,
//! with a gap move connecting it to an unconstrained use or definition of the same virtual
//! register. Similarly, every "same as first input" output now shares its input's virtual
//! register, and every phi input is a move at the end of the corresponding predecessor.

use super::data::{DelayedReference, RegisterAllocationData};
use crate::{
    log::ra_trace,
    sequence::{
        GapPosition, InstrIdx, InstructionOperand, OperandSlot, Policy, RegisterKind, RpoNumber,
        UnallocatedOperand,
    },
    RegAllocError,
};

pub(crate) struct ConstraintBuilder<'d, 'a> {
    d: &'d mut RegisterAllocationData<'a>,
}

impl<'d, 'a> ConstraintBuilder<'d, 'a> {
    pub(crate) fn new(d: &'d mut RegisterAllocationData<'a>) -> Self {
        Self { d }
    }

    pub(crate) fn meet_register_constraints(&mut self) -> Result<(), RegAllocError> {
        self.check_fixed_registers()?;
        for b in self.d.seq.blocks().indices() {
            self.meet_register_constraints_in_block(b);
        }
        Ok(())
    }

    /// Every fixed register an operand asks for must be one we are allowed to allocate.
    fn check_fixed_registers(&self) -> Result<(), RegAllocError> {
        for instr in self.d.seq.instructions() {
            for op in instr
                .outputs()
                .iter()
                .chain(instr.inputs())
                .chain(instr.temps())
            {
                let Some(u) = op.as_unallocated() else {
                    continue;
                };
                let (kind, code) = match u.policy {
                    Policy::FixedRegister(c) => (RegisterKind::General, c),
                    Policy::FixedDoubleRegister(c) => (RegisterKind::Double, c),
                    _ => continue,
                };
                if !self.d.config.is_allocatable(kind, code) {
                    return Err(RegAllocError::InvalidConfiguration(format!(
                        "{} demands {} register {code}, which is not allocatable",
                        instr.mnemonic(),
                        kind
                    )));
                }
            }
        }
        Ok(())
    }

    fn meet_register_constraints_in_block(&mut self, b: RpoNumber) {
        let block = self.d.seq.block(b);
        let start = block.first_instruction_index().index();
        let end = block.last_instruction_index().index();
        for i in start..=end {
            self.meet_constraints_before(InstrIdx::new(i));
            if i != end {
                self.meet_constraints_after(InstrIdx::new(i));
            }
        }
        self.meet_register_constraints_for_last_instruction_in_block(b);
    }

    /// Rewrite the fixed-policy operand at `slot` to its fixed location, returning that location.
    /// If `is_tagged`, the location is recorded in the instruction's reference map (if it has
    /// one).
    fn allocate_fixed(&mut self, slot: OperandSlot, instr: InstrIdx, is_tagged: bool) -> InstructionOperand {
        let InstructionOperand::Unallocated(u) = self.d.seq.operand(slot) else {
            panic!("{slot:?} is not unallocated");
        };
        let kind = self.d.seq.representation(u.vreg).kind();
        let alloc = match u.policy {
            Policy::FixedSlot(index) => InstructionOperand::stack_slot(kind, index),
            Policy::FixedRegister(code) => InstructionOperand::register(RegisterKind::General, code),
            Policy::FixedDoubleRegister(code) => {
                InstructionOperand::register(RegisterKind::Double, code)
            }
            p => panic!("{slot:?} has non-fixed policy {p:?}"),
        };
        ra_trace!(self.d.log, "allocating fixed v{} at {slot:?}", u.vreg.index());
        self.d.seq.set_operand(slot, alloc);
        if is_tagged {
            if let Some(rm) = self.d.seq.instruction(instr).reference_map() {
                self.d.seq.reference_map_mut(rm).record_reference(alloc);
            }
        }
        alloc
    }

    /// Handle the outputs and temps of instruction `i`, which is not the last in its block.
    fn meet_constraints_after(&mut self, i: InstrIdx) {
        let next = InstrIdx::new(i.index() + 1);
        for j in 0..self.d.seq.instruction(i).temps().len() {
            let temp = self.d.seq.instruction(i).temps()[j];
            if temp.as_unallocated().is_some_and(|u| u.has_fixed_policy()) {
                self.allocate_fixed(OperandSlot::Temp(i, j), i, false);
            }
        }

        for j in 0..self.d.seq.instruction(i).outputs().len() {
            let output = self.d.seq.instruction(i).outputs()[j];
            if let InstructionOperand::Constant(vreg) = output {
                let top = self.d.live_range_for(vreg);
                let t = &mut self.d.lrs.tops[top];
                t.set_spill_start_index(next);
                t.set_spill_operand(output);
                continue;
            }
            let Some(u) = output.as_unallocated().copied() else {
                continue;
            };
            let top = self.d.live_range_for(u.vreg);
            let mut assigned = false;
            if u.has_fixed_policy() {
                let is_tagged = self.d.seq.is_reference(u.vreg);
                let fixed = self.allocate_fixed(OperandSlot::Output(i, j), i, is_tagged);
                // A value produced on the stack never needs spilling.
                if fixed.is_stack_slot() {
                    let t = &mut self.d.lrs.tops[top];
                    t.set_spill_operand(fixed);
                    t.set_spill_start_index(next);
                    assigned = true;
                }
                self.d.add_gap_move(
                    next,
                    GapPosition::Start,
                    fixed,
                    UnallocatedOperand::any(u.vreg).into(),
                );
            }
            if !assigned {
                let t = &mut self.d.lrs.tops[top];
                t.record_spill_location(next, OperandSlot::Output(i, j));
                t.set_spill_start_index(next);
            }
        }
    }

    /// Handle the inputs of instruction `i`, and any output that must be in the same place as
    /// its first input.
    fn meet_constraints_before(&mut self, i: InstrIdx) {
        for j in 0..self.d.seq.instruction(i).inputs().len() {
            let input = self.d.seq.instruction(i).inputs()[j];
            let Some(u) = input.as_unallocated().copied() else {
                continue;
            };
            if u.has_fixed_policy() {
                let is_tagged = self.d.seq.is_reference(u.vreg);
                let fixed = self.allocate_fixed(OperandSlot::Input(i, j), i, is_tagged);
                self.d.add_gap_move(
                    i,
                    GapPosition::End,
                    UnallocatedOperand::any(u.vreg).into(),
                    fixed,
                );
            }
        }

        let Some(InstructionOperand::Unallocated(output)) =
            self.d.seq.instruction(i).outputs().first().copied()
        else {
            return;
        };
        if !output.has_same_as_input_policy() {
            return;
        }
        let InstructionOperand::Unallocated(input) = self.d.seq.instruction(i).inputs()[0] else {
            panic!("Instruction {} has no unallocated first input", i.index());
        };
        let (input_vreg, output_vreg) = (input.vreg, output.vreg);
        // The input becomes a use of the output's virtual register, fed by a copy of the input.
        let new_input = UnallocatedOperand {
            vreg: output_vreg,
            ..input
        };
        self.d
            .seq
            .set_operand(OperandSlot::Input(i, 0), new_input.into());
        let mv = self.d.add_gap_move(
            i,
            GapPosition::End,
            UnallocatedOperand::any(input_vreg).into(),
            new_input.into(),
        );
        if self.d.seq.is_reference(input_vreg) && !self.d.seq.is_reference(output_vreg) {
            if let Some(map) = self.d.seq.instruction(i).reference_map() {
                self.d.delayed_references.push(DelayedReference {
                    map,
                    slot: OperandSlot::MoveSource(i, GapPosition::End, mv),
                });
            }
        }
    }

    /// Fixed temps of a block's last instruction are rewritten in place. Its outputs are connected
    /// to their virtual registers at the start of each successor, since the instruction has no gap
    /// after it within the block.
    fn meet_register_constraints_for_last_instruction_in_block(&mut self, b: RpoNumber) {
        let block = self.d.seq.block(b);
        let end = block.last_instruction_index();
        let successors = block
            .successors()
            .iter()
            .map(|s| self.d.seq.block(*s).first_instruction_index())
            .collect::<Vec<_>>();
        for j in 0..self.d.seq.instruction(end).temps().len() {
            let temp = self.d.seq.instruction(end).temps()[j];
            if temp.as_unallocated().is_some_and(|u| u.has_fixed_policy()) {
                self.allocate_fixed(OperandSlot::Temp(end, j), end, false);
            }
        }
        for j in 0..self.d.seq.instruction(end).outputs().len() {
            let Some(u) = self.d.seq.instruction(end).outputs()[j].as_unallocated().copied() else {
                continue;
            };
            let top = self.d.live_range_for(u.vreg);
            let mut assigned = false;
            if u.has_fixed_policy() {
                let fixed = self.allocate_fixed(OperandSlot::Output(end, j), end, false);
                if fixed.is_stack_slot() {
                    let t = &mut self.d.lrs.tops[top];
                    t.set_spill_operand(fixed);
                    t.set_spill_start_index(end);
                    assigned = true;
                }
                for gap in &successors {
                    self.d.add_gap_move(
                        *gap,
                        GapPosition::Start,
                        fixed,
                        UnallocatedOperand::any(u.vreg).into(),
                    );
                }
            }
            if !assigned {
                for gap in &successors {
                    let t = &mut self.d.lrs.tops[top];
                    t.record_spill_location(*gap, OperandSlot::Output(end, j));
                    t.set_spill_start_index(*gap);
                }
            }
        }
    }

    /// Turn every phi into moves at the end of its block's predecessors.
    pub(crate) fn resolve_phis(&mut self) {
        for b in self.d.seq.blocks().indices().rev() {
            self.resolve_phis_in_block(b);
        }
    }

    fn resolve_phis_in_block(&mut self, b: RpoNumber) {
        let block = self.d.seq.block(b);
        let first = block.first_instruction_index();
        let is_loop_header = block.is_loop_header();
        let preds = block
            .predecessors()
            .iter()
            .map(|p| self.d.seq.block(*p).last_instruction_index())
            .collect::<Vec<_>>();
        let phis = block
            .phis()
            .iter()
            .map(|phi| (phi.vreg(), phi.operands().to_vec(), *phi.output()))
            .collect::<Vec<_>>();
        for (idx, (vreg, operands, output)) in phis.into_iter().enumerate() {
            let phi = self.d.initialize_phi_map(vreg, b, idx);
            for (pred_last, op) in preds.iter().zip(operands) {
                let mv = self.d.add_gap_move(
                    *pred_last,
                    GapPosition::End,
                    UnallocatedOperand::any(op).into(),
                    output,
                );
                self.d.phis[phi]
                    .incoming_operands
                    .push(OperandSlot::MoveDestination(*pred_last, GapPosition::End, mv));
            }
            let top = self.d.live_range_for(vreg);
            let t = &mut self.d.lrs.tops[top];
            t.record_spill_location(first, OperandSlot::PhiOutput(b, idx));
            t.set_spill_start_index(first);
            t.is_phi = true;
            t.is_non_loop_phi = !is_loop_header;
        }
    }
}
