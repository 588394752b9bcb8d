//! The instruction sequence the register allocator consumes and rewrites.
//!
//! An [InstructionSequence] is a control-flow graph of [InstructionBlock]s laid out in reverse
//! post order, each holding a contiguous run of [Instruction]s. Operands start out as
//! [UnallocatedOperand]s naming virtual registers; the allocator rewrites them in place and fills
//! in the [ParallelMove]s in the gaps between instructions. Sequences are created with
//! [SequenceBuilder].

use crate::config::RegisterConfiguration;
use index_vec::IndexVec;
use std::{collections::HashMap, fmt};

mod block;
mod builder;
mod frame;
mod instruction;
mod operand;

pub use block::{InstructionBlock, RpoNumber};
pub use builder::SequenceBuilder;
pub use frame::{Frame, SLOT_SIZE};
pub use instruction::{
    GapPosition, Instruction, MoveOperands, ParallelMove, PhiInstruction, ReferenceMap,
    ReferenceMapIdx,
};
pub use operand::{
    Constant, InstructionOperand, OperandDisplay, Policy, RegCode, RegisterKind, Representation,
    UnallocatedOperand, VReg,
};

index_vec::define_index_type! {
    /// An instruction's index within its [InstructionSequence].
    pub struct InstrIdx = u32;
}

/// The address of a single operand within an [InstructionSequence]. The allocator remembers
/// where every use of a virtual register lives so that it can rewrite it once its location is
/// known.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperandSlot {
    Output(InstrIdx, usize),
    Input(InstrIdx, usize),
    Temp(InstrIdx, usize),
    MoveSource(InstrIdx, GapPosition, usize),
    MoveDestination(InstrIdx, GapPosition, usize),
    /// The output of the `usize`th phi of a block.
    PhiOutput(RpoNumber, usize),
}

#[derive(Debug)]
pub struct InstructionSequence {
    debug_name: String,
    blocks: IndexVec<RpoNumber, InstructionBlock>,
    instructions: IndexVec<InstrIdx, Instruction>,
    representations: IndexVec<VReg, Representation>,
    constants: HashMap<VReg, Constant>,
    reference_maps: IndexVec<ReferenceMapIdx, ReferenceMap>,
}

impl InstructionSequence {
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    pub fn blocks(&self) -> &IndexVec<RpoNumber, InstructionBlock> {
        &self.blocks
    }

    pub fn block(&self, rpo: RpoNumber) -> &InstructionBlock {
        &self.blocks[rpo]
    }

    pub(crate) fn block_mut(&mut self, rpo: RpoNumber) -> &mut InstructionBlock {
        &mut self.blocks[rpo]
    }

    pub fn instructions(&self) -> &IndexVec<InstrIdx, Instruction> {
        &self.instructions
    }

    pub fn instruction(&self, idx: InstrIdx) -> &Instruction {
        &self.instructions[idx]
    }

    pub(crate) fn instruction_mut(&mut self, idx: InstrIdx) -> &mut Instruction {
        &mut self.instructions[idx]
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    /// The block containing the instruction `idx`.
    pub fn instruction_block(&self, idx: InstrIdx) -> &InstructionBlock {
        &self.blocks[self.instructions[idx].block()]
    }

    pub fn virtual_register_count(&self) -> usize {
        self.representations.len()
    }

    pub fn representation(&self, vreg: VReg) -> Representation {
        self.representations[vreg]
    }

    pub fn is_reference(&self, vreg: VReg) -> bool {
        self.representations[vreg].is_reference()
    }

    /// If `vreg` is defined by a constant, return its value.
    pub fn constant(&self, vreg: VReg) -> Option<&Constant> {
        self.constants.get(&vreg)
    }

    pub fn reference_maps(&self) -> &IndexVec<ReferenceMapIdx, ReferenceMap> {
        &self.reference_maps
    }

    pub(crate) fn reference_map_mut(&mut self, idx: ReferenceMapIdx) -> &mut ReferenceMap {
        &mut self.reference_maps[idx]
    }

    /// Return the operand at `slot`.
    pub fn operand(&self, slot: OperandSlot) -> InstructionOperand {
        match slot {
            OperandSlot::Output(i, j) => self.instructions[i].outputs()[j],
            OperandSlot::Input(i, j) => self.instructions[i].inputs()[j],
            OperandSlot::Temp(i, j) => self.instructions[i].temps()[j],
            OperandSlot::MoveSource(i, pos, j) => self.gap_move(i, pos, j).source,
            OperandSlot::MoveDestination(i, pos, j) => self.gap_move(i, pos, j).destination,
            OperandSlot::PhiOutput(b, j) => *self.blocks[b].phis()[j].output(),
        }
    }

    /// Overwrite the operand at `slot` with `op`.
    pub(crate) fn set_operand(&mut self, slot: OperandSlot, op: InstructionOperand) {
        match slot {
            OperandSlot::Output(i, j) => self.instructions[i].outputs_mut()[j] = op,
            OperandSlot::Input(i, j) => self.instructions[i].inputs_mut()[j] = op,
            OperandSlot::Temp(i, j) => self.instructions[i].temps_mut()[j] = op,
            OperandSlot::MoveSource(i, pos, j) => self.gap_move_mut(i, pos, j).source = op,
            OperandSlot::MoveDestination(i, pos, j) => {
                self.gap_move_mut(i, pos, j).destination = op
            }
            OperandSlot::PhiOutput(b, j) => self.blocks[b].phis_mut()[j].set_output(op),
        }
    }

    fn gap_move(&self, i: InstrIdx, pos: GapPosition, j: usize) -> &MoveOperands {
        match self.instructions[i].parallel_move(pos) {
            Some(pm) => &pm.moves()[j],
            None => panic!("No {pos:?} gap move at instruction {}", i.index()),
        }
    }

    fn gap_move_mut(&mut self, i: InstrIdx, pos: GapPosition, j: usize) -> &mut MoveOperands {
        match self.instructions[i].parallel_move_mut(pos) {
            Some(pm) => &mut pm.moves_mut()[j],
            None => panic!("No {pos:?} gap move at instruction {}", i.index()),
        }
    }

    /// Add a move to the gap at `pos` before instruction `i`, returning the index of the move
    /// within that gap's parallel move.
    pub(crate) fn add_gap_move(
        &mut self,
        i: InstrIdx,
        pos: GapPosition,
        source: InstructionOperand,
        destination: InstructionOperand,
    ) -> usize {
        self.instructions[i]
            .get_or_create_parallel_move(pos)
            .add_move(source, destination)
    }

    /// Remove the `j`th move of the gap at `pos` before instruction `i` from its parallel move.
    pub(crate) fn eliminate_gap_move(&mut self, i: InstrIdx, pos: GapPosition, j: usize) {
        self.gap_move_mut(i, pos, j).eliminate();
    }

    /// Returns a value that prints this sequence using register names from `config`.
    pub fn display<'a>(&'a self, config: &'a RegisterConfiguration) -> SequenceDisplay<'a> {
        SequenceDisplay { seq: self, config }
    }
}

pub struct SequenceDisplay<'a> {
    seq: &'a InstructionSequence,
    config: &'a RegisterConfiguration,
}

impl SequenceDisplay<'_> {
    fn fmt_block(&self, f: &mut fmt::Formatter<'_>, b: &InstructionBlock) -> fmt::Result {
        let cfg = self.config;
        write!(f, "B{}", b.rpo_number().index())?;
        if !b.predecessors().is_empty() {
            write!(f, " (preds: {})", blocks_str(b.predecessors()))?;
        }
        if !b.successors().is_empty() {
            write!(f, " (succs: {})", blocks_str(b.successors()))?;
        }
        if let Some(e) = b.loop_end() {
            write!(f, " (loop header, end: B{})", e.index())?;
        }
        if let Some(h) = b.loop_header() {
            write!(f, " (in loop: B{})", h.index())?;
        }
        if b.is_deferred() {
            write!(f, " (deferred)")?;
        }
        writeln!(f)?;
        for phi in b.phis() {
            let ops = phi
                .operands()
                .iter()
                .map(|v| format!("v{}", v.index()))
                .collect::<Vec<_>>();
            writeln!(
                f,
                "  phi v{}: {} = {}",
                phi.vreg().index(),
                phi.output().display(cfg),
                ops.join(", ")
            )?;
        }
        for idx in (b.code_start().index()..b.code_end().index()).map(InstrIdx::new) {
            let instr = &self.seq.instructions[idx];
            for (pos, name) in [(GapPosition::Start, "start"), (GapPosition::End, "end")] {
                let Some(pm) = instr.parallel_move(pos) else {
                    continue;
                };
                let moves = pm
                    .moves()
                    .iter()
                    .filter(|m| !m.is_eliminated())
                    .map(|m| format!("{} = {}", m.destination.display(cfg), m.source.display(cfg)))
                    .collect::<Vec<_>>();
                if !moves.is_empty() {
                    writeln!(f, "  gap {} {name}: {}", idx.index(), moves.join("; "))?;
                }
            }
            write!(f, "  {}: ", idx.index())?;
            if !instr.outputs().is_empty() {
                write!(f, "{} = ", ops_str(instr.outputs(), cfg))?;
            }
            write!(f, "{}", instr.mnemonic())?;
            if !instr.inputs().is_empty() {
                write!(f, " {}", ops_str(instr.inputs(), cfg))?;
            }
            if !instr.temps().is_empty() {
                write!(f, " (temps: {})", ops_str(instr.temps(), cfg))?;
            }
            if instr.clobbers_registers() {
                write!(f, " (call)")?;
            }
            if let Some(rm) = instr.reference_map() {
                write!(
                    f,
                    " {{refs: {}}}",
                    ops_str(self.seq.reference_maps[rm].references(), cfg)
                )?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

fn blocks_str(blocks: &[RpoNumber]) -> String {
    blocks
        .iter()
        .map(|b| format!("B{}", b.index()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn ops_str(ops: &[InstructionOperand], cfg: &RegisterConfiguration) -> String {
    ops.iter()
        .map(|op| op.display(cfg).to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for SequenceDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.seq.debug_name.is_empty() {
            writeln!(f, "; {}", self.seq.debug_name)?;
        }
        let mut consts = self.seq.constants.iter().collect::<Vec<_>>();
        consts.sort_by_key(|(v, _)| **v);
        for (vreg, c) in consts {
            writeln!(f, "; v{} = {c}", vreg.index())?;
        }
        for b in &self.seq.blocks {
            self.fmt_block(f, b)?;
        }
        Ok(())
    }
}
