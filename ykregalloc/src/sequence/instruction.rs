//! Instructions, the parallel moves in the gaps between them, phis and reference maps.

use super::{block::RpoNumber, operand::*, InstrIdx};
use smallvec::SmallVec;

/// Each instruction is preceded by a gap with two parallel moves: one at the gap's START position
/// and one at its END position. The START moves happen before the END moves.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GapPosition {
    Start,
    End,
}

impl GapPosition {
    fn idx(self) -> usize {
        match self {
            GapPosition::Start => 0,
            GapPosition::End => 1,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MoveOperands {
    pub source: InstructionOperand,
    pub destination: InstructionOperand,
}

impl MoveOperands {
    pub fn new(source: InstructionOperand, destination: InstructionOperand) -> Self {
        Self {
            source,
            destination,
        }
    }

    /// An eliminated move is one that has been removed from its parallel move.
    pub fn is_eliminated(&self) -> bool {
        self.source.is_invalid()
    }

    pub fn eliminate(&mut self) {
        self.source = InstructionOperand::Invalid;
    }

    /// Does this move have no observable effect?
    pub fn is_redundant(&self) -> bool {
        self.is_eliminated() || self.source == self.destination
    }
}

/// A set of moves with simultaneous semantics: all sources are read before any destination is
/// written.
#[derive(Clone, Debug, Default)]
pub struct ParallelMove(Vec<MoveOperands>);

impl ParallelMove {
    pub fn moves(&self) -> &[MoveOperands] {
        &self.0
    }

    pub(crate) fn moves_mut(&mut self) -> &mut Vec<MoveOperands> {
        &mut self.0
    }

    /// Add a move, returning its index within this parallel move.
    pub fn add_move(&mut self, source: InstructionOperand, destination: InstructionOperand) -> usize {
        self.0.push(MoveOperands::new(source, destination));
        self.0.len() - 1
    }

    pub fn is_redundant(&self) -> bool {
        self.0.iter().all(|m| m.is_redundant())
    }

    /// Prepare `mv` to be inserted into this parallel move so that the combination behaves as if
    /// `self` were performed first and `mv` second. If an existing move writes `mv`'s source,
    /// `mv` reads from that move's source instead. If an existing move writes `mv`'s destination,
    /// its index is returned: the caller must eliminate that move when inserting `mv`.
    pub(crate) fn prepare_insert_after(&self, mv: &mut MoveOperands) -> Option<usize> {
        let mut replacement = None;
        let mut to_eliminate = None;
        for (i, cur) in self.0.iter().enumerate() {
            if cur.is_eliminated() {
                continue;
            }
            if cur.destination == mv.source {
                debug_assert!(replacement.is_none());
                replacement = Some(cur.source);
                if to_eliminate.is_some() {
                    break;
                }
            } else if cur.destination == mv.destination {
                debug_assert!(to_eliminate.is_none());
                to_eliminate = Some(i);
                if replacement.is_some() {
                    break;
                }
            }
        }
        if let Some(src) = replacement {
            mv.source = src;
        }
        to_eliminate
    }
}

index_vec::define_index_type! {
    pub struct ReferenceMapIdx = u32;
}

/// A GC safepoint: after allocation, holds the locations of every live reference at the
/// instruction it is attached to.
#[derive(Clone, Debug)]
pub struct ReferenceMap {
    instruction: InstrIdx,
    references: Vec<InstructionOperand>,
}

impl ReferenceMap {
    pub(crate) fn new(instruction: InstrIdx) -> Self {
        Self {
            instruction,
            references: Vec::new(),
        }
    }

    pub fn instruction(&self) -> InstrIdx {
        self.instruction
    }

    pub fn references(&self) -> &[InstructionOperand] {
        &self.references
    }

    /// Record that `op` holds a live reference. Arguments (negative stack slots) belong to the
    /// caller's frame and are not recorded; neither are duplicates.
    pub(crate) fn record_reference(&mut self, op: InstructionOperand) {
        debug_assert!(op.is_allocated());
        if let InstructionOperand::StackSlot { index, .. } = op {
            if index < 0 {
                return;
            }
        }
        if !self.references.contains(&op) {
            self.references.push(op);
        }
    }
}

#[derive(Clone, Debug)]
pub struct PhiInstruction {
    vreg: VReg,
    operands: SmallVec<[VReg; 4]>,
    output: InstructionOperand,
}

impl PhiInstruction {
    /// Create a phi defining `vreg`. `operands[i]` is the value flowing in from the block's `i`th
    /// predecessor.
    pub fn new(vreg: VReg, operands: &[VReg]) -> Self {
        Self {
            vreg,
            operands: SmallVec::from_slice(operands),
            output: UnallocatedOperand::none(vreg).into(),
        }
    }

    pub fn vreg(&self) -> VReg {
        self.vreg
    }

    pub fn operands(&self) -> &[VReg] {
        &self.operands
    }

    /// The phi's output: unallocated before allocation, its assigned location afterwards.
    pub fn output(&self) -> &InstructionOperand {
        &self.output
    }

    pub(crate) fn set_output(&mut self, op: InstructionOperand) {
        self.output = op;
    }
}

#[derive(Clone, Debug)]
pub struct Instruction {
    mnemonic: String,
    outputs: SmallVec<[InstructionOperand; 2]>,
    inputs: SmallVec<[InstructionOperand; 4]>,
    temps: SmallVec<[InstructionOperand; 2]>,
    clobbers_registers: bool,
    clobbers_double_registers: bool,
    needs_reference_map: bool,
    reference_map: Option<ReferenceMapIdx>,
    parallel_moves: [Option<ParallelMove>; 2],
    block: RpoNumber,
}

impl Instruction {
    pub fn new(mnemonic: &str) -> Self {
        Self {
            mnemonic: mnemonic.to_owned(),
            outputs: SmallVec::new(),
            inputs: SmallVec::new(),
            temps: SmallVec::new(),
            clobbers_registers: false,
            clobbers_double_registers: false,
            needs_reference_map: false,
            reference_map: None,
            parallel_moves: [None, None],
            block: RpoNumber::new(0),
        }
    }

    pub fn output<T: Into<InstructionOperand>>(mut self, op: T) -> Self {
        self.outputs.push(op.into());
        self
    }

    pub fn input<T: Into<InstructionOperand>>(mut self, op: T) -> Self {
        self.inputs.push(op.into());
        self
    }

    pub fn temp<T: Into<InstructionOperand>>(mut self, op: T) -> Self {
        self.temps.push(op.into());
        self
    }

    /// This instruction is a call: it clobbers every general and double register not used as one
    /// of its outputs.
    pub fn call(mut self) -> Self {
        self.clobbers_registers = true;
        self.clobbers_double_registers = true;
        self
    }

    /// This instruction is a GC safepoint and needs a [ReferenceMap].
    pub fn safepoint(mut self) -> Self {
        self.needs_reference_map = true;
        self
    }

    /// Add a move to the gap before this instruction. Used to build sequences that already
    /// contain moves.
    pub fn gap_move<S, D>(mut self, pos: GapPosition, source: S, destination: D) -> Self
    where
        S: Into<InstructionOperand>,
        D: Into<InstructionOperand>,
    {
        self.get_or_create_parallel_move(pos)
            .add_move(source.into(), destination.into());
        self
    }

    pub fn mnemonic(&self) -> &str {
        &self.mnemonic
    }

    pub fn outputs(&self) -> &[InstructionOperand] {
        &self.outputs
    }

    pub fn inputs(&self) -> &[InstructionOperand] {
        &self.inputs
    }

    pub fn temps(&self) -> &[InstructionOperand] {
        &self.temps
    }

    pub(crate) fn outputs_mut(&mut self) -> &mut [InstructionOperand] {
        &mut self.outputs
    }

    pub(crate) fn inputs_mut(&mut self) -> &mut [InstructionOperand] {
        &mut self.inputs
    }

    pub(crate) fn temps_mut(&mut self) -> &mut [InstructionOperand] {
        &mut self.temps
    }

    pub fn clobbers_registers(&self) -> bool {
        self.clobbers_registers
    }

    pub fn clobbers_double_registers(&self) -> bool {
        self.clobbers_double_registers
    }

    pub fn needs_reference_map(&self) -> bool {
        self.needs_reference_map
    }

    pub fn reference_map(&self) -> Option<ReferenceMapIdx> {
        self.reference_map
    }

    pub(crate) fn set_reference_map(&mut self, idx: ReferenceMapIdx) {
        self.reference_map = Some(idx);
    }

    /// The block this instruction belongs to.
    pub fn block(&self) -> RpoNumber {
        self.block
    }

    pub(crate) fn set_block(&mut self, block: RpoNumber) {
        self.block = block;
    }

    pub fn parallel_move(&self, pos: GapPosition) -> Option<&ParallelMove> {
        self.parallel_moves[pos.idx()].as_ref()
    }

    pub(crate) fn parallel_move_mut(&mut self, pos: GapPosition) -> Option<&mut ParallelMove> {
        self.parallel_moves[pos.idx()].as_mut()
    }

    pub(crate) fn get_or_create_parallel_move(&mut self, pos: GapPosition) -> &mut ParallelMove {
        self.parallel_moves[pos.idx()].get_or_insert_with(ParallelMove::default)
    }

    /// Is every gap move before this instruction redundant?
    pub fn are_moves_redundant(&self) -> bool {
        self.parallel_moves
            .iter()
            .all(|pm| pm.as_ref().map(|pm| pm.is_redundant()).unwrap_or(true))
    }

    /// Is `code` of `kind` one of this instruction's (fixed) outputs?
    pub(crate) fn is_output_register(&self, kind: RegisterKind, code: RegCode) -> bool {
        self.outputs
            .iter()
            .any(|op| *op == InstructionOperand::register(kind, code))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn reg(code: RegCode) -> InstructionOperand {
        InstructionOperand::register(RegisterKind::General, code)
    }

    #[test]
    fn redundant_moves() {
        let mut pm = ParallelMove::default();
        assert!(pm.is_redundant());
        pm.add_move(reg(0), reg(0));
        assert!(pm.is_redundant());
        let i = pm.add_move(reg(0), reg(1));
        assert!(!pm.is_redundant());
        pm.moves_mut()[i].eliminate();
        assert!(pm.is_redundant());
    }

    #[test]
    fn insert_after() {
        // r1 = r0; r2 = r3
        let mut pm = ParallelMove::default();
        pm.add_move(reg(0), reg(1));
        pm.add_move(reg(3), reg(2));

        // Reading r1 afterwards is the same as reading r0 beforehand.
        let mut mv = MoveOperands::new(reg(1), reg(4));
        assert_eq!(pm.prepare_insert_after(&mut mv), None);
        assert_eq!(mv.source, reg(0));

        // Writing r2 afterwards makes the earlier write to r2 dead.
        let mut mv = MoveOperands::new(reg(5), reg(2));
        assert_eq!(pm.prepare_insert_after(&mut mv), Some(1));
        assert_eq!(mv.source, reg(5));

        // Both at once.
        let mut mv = MoveOperands::new(reg(1), reg(2));
        assert_eq!(pm.prepare_insert_after(&mut mv), Some(1));
        assert_eq!(mv.source, reg(0));
    }

    #[test]
    fn reference_maps_skip_arguments_and_duplicates() {
        let mut rm = ReferenceMap::new(InstrIdx::new(0));
        rm.record_reference(InstructionOperand::stack_slot(RegisterKind::General, -2));
        rm.record_reference(reg(1));
        rm.record_reference(reg(1));
        rm.record_reference(InstructionOperand::stack_slot(RegisterKind::General, 0));
        assert_eq!(
            rm.references(),
            &[
                reg(1),
                InstructionOperand::stack_slot(RegisterKind::General, 0)
            ]
        );
    }

    #[test]
    fn outputs_as_registers() {
        let i = Instruction::new("call").output(reg(0)).call();
        assert!(i.is_output_register(RegisterKind::General, 0));
        assert!(!i.is_output_register(RegisterKind::General, 1));
        assert!(!i.is_output_register(RegisterKind::Double, 0));
        assert!(i.clobbers_registers() && i.clobbers_double_registers());
    }
}
