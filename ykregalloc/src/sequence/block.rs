use super::{instruction::PhiInstruction, InstrIdx};
use smallvec::SmallVec;

index_vec::define_index_type! {
    /// A block's number in reverse post order. Blocks are stored, and instructions laid out, in
    /// this order.
    pub struct RpoNumber = u32;
}

#[derive(Clone, Debug)]
pub struct InstructionBlock {
    pub(super) rpo: RpoNumber,
    pub(super) code_start: InstrIdx,
    /// One past the block's last instruction.
    pub(super) code_end: InstrIdx,
    /// The innermost loop header containing this block. For a loop header this is the header of
    /// the enclosing loop.
    pub(super) loop_header: Option<RpoNumber>,
    /// For loop headers: one past the last block of the loop.
    pub(super) loop_end: Option<RpoNumber>,
    pub(super) deferred: bool,
    pub(super) predecessors: SmallVec<[RpoNumber; 2]>,
    pub(super) successors: SmallVec<[RpoNumber; 2]>,
    pub(super) phis: Vec<PhiInstruction>,
}

impl InstructionBlock {
    pub fn rpo_number(&self) -> RpoNumber {
        self.rpo
    }

    pub fn code_start(&self) -> InstrIdx {
        self.code_start
    }

    pub fn code_end(&self) -> InstrIdx {
        self.code_end
    }

    pub fn first_instruction_index(&self) -> InstrIdx {
        self.code_start
    }

    pub fn last_instruction_index(&self) -> InstrIdx {
        InstrIdx::new(self.code_end.index() - 1)
    }

    pub fn is_loop_header(&self) -> bool {
        self.loop_end.is_some()
    }

    pub fn loop_end(&self) -> Option<RpoNumber> {
        self.loop_end
    }

    pub fn loop_header(&self) -> Option<RpoNumber> {
        self.loop_header
    }

    /// Is this block unlikely to be executed?
    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    pub fn predecessors(&self) -> &[RpoNumber] {
        &self.predecessors
    }

    pub fn successors(&self) -> &[RpoNumber] {
        &self.successors
    }

    pub fn phis(&self) -> &[PhiInstruction] {
        &self.phis
    }

    pub(crate) fn phis_mut(&mut self) -> &mut [PhiInstruction] {
        &mut self.phis
    }

    /// Returns the index of `pred` in this block's predecessor list.
    pub fn predecessor_index_of(&self, pred: RpoNumber) -> Option<usize> {
        self.predecessors.iter().position(|x| *x == pred)
    }
}
