use super::{
    block::{InstructionBlock, RpoNumber},
    instruction::{Instruction, PhiInstruction, ReferenceMap, ReferenceMapIdx},
    operand::{Constant, InstructionOperand, Representation, VReg},
    InstrIdx, InstructionSequence,
};
use crate::RegAllocError;
use index_vec::IndexVec;
use smallvec::SmallVec;
use std::collections::HashMap;

/// Incrementally build an [InstructionSequence].
///
/// Blocks are created in reverse post order with [Self::block]; instructions and phis are added
/// to the most recently created block. Edges can be added in any order, but the order in which
/// edges into a block are added defines the order of its predecessors, and thus the order of its
/// phis' operands.
pub struct SequenceBuilder {
    debug_name: String,
    blocks: IndexVec<RpoNumber, InstructionBlock>,
    instructions: IndexVec<InstrIdx, Instruction>,
    representations: IndexVec<VReg, Representation>,
    constants: HashMap<VReg, Constant>,
    edges: Vec<(RpoNumber, RpoNumber)>,
    loops: Vec<(RpoNumber, RpoNumber)>,
}

impl SequenceBuilder {
    pub fn new(debug_name: &str) -> Self {
        Self {
            debug_name: debug_name.to_owned(),
            blocks: IndexVec::new(),
            instructions: IndexVec::new(),
            representations: IndexVec::new(),
            constants: HashMap::new(),
            edges: Vec::new(),
            loops: Vec::new(),
        }
    }

    /// Create a new virtual register.
    pub fn vreg(&mut self, rep: Representation) -> VReg {
        self.representations.push(rep)
    }

    /// Create a new virtual register whose value is the constant `c`. It must be defined by an
    /// instruction with an [InstructionOperand::Constant] output.
    pub fn constant(&mut self, rep: Representation, c: Constant) -> VReg {
        let vreg = self.representations.push(rep);
        self.constants.insert(vreg, c);
        vreg
    }

    /// Start a new block.
    pub fn block(&mut self) -> RpoNumber {
        let rpo = self.blocks.next_idx();
        let start = self.instructions.next_idx();
        self.blocks.push(InstructionBlock {
            rpo,
            code_start: start,
            code_end: start,
            loop_header: None,
            loop_end: None,
            deferred: false,
            predecessors: SmallVec::new(),
            successors: SmallVec::new(),
            phis: Vec::new(),
        })
    }

    /// Start a new block that is unlikely to be executed.
    pub fn deferred_block(&mut self) -> RpoNumber {
        let rpo = self.block();
        self.blocks[rpo].deferred = true;
        rpo
    }

    pub fn edge(&mut self, from: RpoNumber, to: RpoNumber) {
        self.edges.push((from, to));
    }

    /// Mark `header` as a loop header whose loop covers the blocks `header..end`.
    pub fn mark_loop(&mut self, header: RpoNumber, end: RpoNumber) {
        self.loops.push((header, end));
    }

    /// Add a phi to the current block.
    pub fn phi(&mut self, vreg: VReg, operands: &[VReg]) {
        let cur = self.current();
        self.blocks[cur].phis.push(PhiInstruction::new(vreg, operands));
    }

    /// Append `instr` to the current block.
    pub fn push(&mut self, mut instr: Instruction) -> InstrIdx {
        let cur = self.current();
        instr.set_block(cur);
        let idx = self.instructions.push(instr);
        self.blocks[cur].code_end = self.instructions.next_idx();
        idx
    }

    fn current(&self) -> RpoNumber {
        match self.blocks.len().checked_sub(1).map(RpoNumber::from_usize) {
            Some(x) => x,
            None => panic!("No block has been started"),
        }
    }

    /// Validate what has been built and turn it into an [InstructionSequence].
    pub fn build(mut self) -> Result<InstructionSequence, RegAllocError> {
        if self.blocks.is_empty() {
            return Err(malformed("a sequence needs at least one block"));
        }
        for b in &self.blocks {
            if b.code_start == b.code_end {
                return Err(malformed(format!("B{} is empty", b.rpo.index())));
            }
        }

        for &(from, to) in &self.edges {
            if from.index() >= self.blocks.len() || to.index() >= self.blocks.len() {
                return Err(malformed(format!(
                    "edge B{} -> B{} refers to a non-existent block",
                    from.index(),
                    to.index()
                )));
            }
            self.blocks[from].successors.push(to);
            self.blocks[to].predecessors.push(from);
        }
        for &(from, to) in &self.edges {
            if self.blocks[from].successors.len() > 1 && self.blocks[to].predecessors.len() > 1 {
                return Err(malformed(format!(
                    "critical edge B{} -> B{}",
                    from.index(),
                    to.index()
                )));
            }
        }
        // Values defined by a block's last instruction are moved into place at the start of each
        // successor, so every successor must have that block as its only predecessor.
        for b in &self.blocks {
            let last = &self.instructions[b.last_instruction_index()];
            if last.outputs().is_empty() {
                continue;
            }
            if last.outputs().iter().any(|op| op.is_constant()) {
                return Err(malformed(format!(
                    "the last instruction of B{} defines a constant",
                    b.rpo.index()
                )));
            }
            for s in &b.successors {
                if self.blocks[*s].predecessors.len() != 1 {
                    return Err(malformed(format!(
                        "the last instruction of B{} has outputs but its successor B{} has several predecessors",
                        b.rpo.index(),
                        s.index()
                    )));
                }
            }
        }

        self.loops.sort();
        for &(header, end) in &self.loops {
            if header >= end || end.index() > self.blocks.len() {
                return Err(malformed(format!(
                    "loop B{}..B{} is invalid",
                    header.index(),
                    end.index()
                )));
            }
            self.blocks[header].loop_end = Some(end);
            // Inner loops have larger headers and thus overwrite their outer loop's header.
            for b in header.index() + 1..end.index() {
                self.blocks[RpoNumber::new(b)].loop_header = Some(header);
            }
        }

        let nvregs = self.representations.len();
        let check_vreg = |vreg: VReg| {
            if vreg.index() >= nvregs {
                Err(malformed(format!("v{} is not a virtual register", vreg.index())))
            } else {
                Ok(())
            }
        };
        for b in &self.blocks {
            for phi in &b.phis {
                check_vreg(phi.vreg())?;
                for v in phi.operands() {
                    check_vreg(*v)?;
                }
                if phi.operands().len() != b.predecessors.len() {
                    return Err(malformed(format!(
                        "phi v{} in B{} has {} operands but the block has {} predecessors",
                        phi.vreg().index(),
                        b.rpo.index(),
                        phi.operands().len(),
                        b.predecessors.len()
                    )));
                }
            }
        }
        for instr in &self.instructions {
            for op in instr
                .outputs()
                .iter()
                .chain(instr.inputs())
                .chain(instr.temps())
            {
                if let Some(vreg) = op.vreg() {
                    check_vreg(vreg)?;
                }
                if let InstructionOperand::Constant(vreg) = op {
                    if !self.constants.contains_key(vreg) {
                        return Err(malformed(format!(
                            "v{} is used as a constant but has no constant value",
                            vreg.index()
                        )));
                    }
                }
            }
            if let Some(InstructionOperand::Unallocated(u)) = instr.outputs().first() {
                if u.has_same_as_input_policy()
                    && !matches!(
                        instr.inputs().first(),
                        Some(InstructionOperand::Unallocated(_))
                    )
                {
                    return Err(malformed(format!(
                        "{} has a same-as-input output but no unallocated first input",
                        instr.mnemonic()
                    )));
                }
            }
        }

        let mut reference_maps = IndexVec::<ReferenceMapIdx, _>::new();
        for (iidx, instr) in self.instructions.iter_mut_enumerated() {
            if instr.needs_reference_map() {
                instr.set_reference_map(reference_maps.push(ReferenceMap::new(iidx)));
            }
        }

        Ok(InstructionSequence {
            debug_name: self.debug_name,
            blocks: self.blocks,
            instructions: self.instructions,
            representations: self.representations,
            constants: self.constants,
            reference_maps,
        })
    }
}

fn malformed<S: Into<String>>(msg: S) -> RegAllocError {
    RegAllocError::MalformedSequence(msg.into())
}
