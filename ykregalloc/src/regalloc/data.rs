//! The state shared by every phase of one register allocation run.

use super::{
    live_range::{
        LiveRangeIdx, LiveRanges, PhiIdx, SpillLocation, SpillRangeIdx, TopLevelIdx,
    },
    position::LifetimePosition,
    spill_range::SpillRange,
};
use crate::{
    config::RegisterConfiguration,
    log::Log,
    sequence::{
        Frame, InstrIdx, InstructionBlock, InstructionOperand, InstructionSequence, OperandSlot,
        RegCode, RegisterKind, Representation, ReferenceMapIdx, RpoNumber, VReg,
    },
    stats::{Counter, RegAllocStats},
};
use index_vec::IndexVec;
use std::collections::HashMap;
use vob::Vob;

/// What the allocator needs to know about a phi once its inputs have become gap moves.
#[derive(Debug)]
pub(crate) struct PhiMapValue {
    pub(crate) vreg: VReg,
    pub(crate) block: RpoNumber,
    /// The phi's index within its block's phis.
    pub(crate) index: usize,
    /// The destinations of the moves into the phi at the end of each predecessor. Once the phi
    /// has a location, these are rewritten to it.
    pub(crate) incoming_operands: Vec<OperandSlot>,
    pub(crate) assigned_register: Option<RegCode>,
}

/// A reference map entry that can only be filled in once allocation has finished: the location
/// of the operand at `slot` at the safepoint `map`.
#[derive(Debug)]
pub(crate) struct DelayedReference {
    pub(crate) map: ReferenceMapIdx,
    pub(crate) slot: OperandSlot,
}

pub(crate) struct RegisterAllocationData<'a> {
    pub(crate) seq: &'a mut InstructionSequence,
    pub(crate) frame: &'a mut Frame,
    pub(crate) config: &'a RegisterConfiguration,
    pub(crate) log: &'a Log,
    pub(crate) stats: RegAllocStats,
    pub(crate) lrs: LiveRanges,
    /// The top-level range of each virtual register, indexed by virtual register. Splinters are
    /// given virtual registers beyond those of the sequence.
    pub(crate) live_ranges: Vec<Option<TopLevelIdx>>,
    fixed_live_ranges: Vec<Option<TopLevelIdx>>,
    fixed_double_live_ranges: Vec<Option<TopLevelIdx>>,
    pub(crate) spill_ranges: IndexVec<SpillRangeIdx, SpillRange>,
    /// The spill range in use by each virtual register, indexed by virtual register. Splinters
    /// share their parent's entry.
    pub(crate) spill_range_for_vreg: Vec<Option<SpillRangeIdx>>,
    pub(crate) live_in_sets: IndexVec<RpoNumber, Vob>,
    pub(crate) phis: IndexVec<PhiIdx, PhiMapValue>,
    phi_map: HashMap<VReg, PhiIdx>,
    pub(crate) delayed_references: Vec<DelayedReference>,
}

impl<'a> RegisterAllocationData<'a> {
    pub(crate) fn new(
        seq: &'a mut InstructionSequence,
        frame: &'a mut Frame,
        config: &'a RegisterConfiguration,
        log: &'a Log,
    ) -> Self {
        let nvregs = seq.virtual_register_count();
        let nblocks = seq.blocks().len();
        Self {
            seq,
            frame,
            config,
            log,
            stats: RegAllocStats::default(),
            lrs: LiveRanges::new(),
            live_ranges: vec![None; nvregs],
            fixed_live_ranges: vec![None; config.num_registers(RegisterKind::General)],
            fixed_double_live_ranges: vec![None; config.num_registers(RegisterKind::Double)],
            spill_ranges: IndexVec::new(),
            spill_range_for_vreg: vec![None; nvregs],
            live_in_sets: (0..nblocks).map(|_| Vob::from_elem(false, nvregs)).collect(),
            phis: IndexVec::new(),
            phi_map: HashMap::new(),
            delayed_references: Vec::new(),
        }
    }

    /// The top-level range for the virtual register `vreg`, creating it if necessary.
    pub(crate) fn live_range_for(&mut self, vreg: VReg) -> TopLevelIdx {
        if let Some(x) = self.live_ranges[vreg.index()] {
            return x;
        }
        let rep = self.seq.representation(vreg);
        let top = self.lrs.new_top_level(vreg_to_i32(vreg.index()), rep);
        self.live_ranges[vreg.index()] = Some(top);
        top
    }

    /// The range of the physical register `code`, creating it if necessary. Fixed ranges have
    /// negative virtual registers: `-code - 1` for general registers, with double registers
    /// following on after all the general registers.
    pub(crate) fn fixed_live_range_for(&mut self, kind: RegisterKind, code: RegCode) -> TopLevelIdx {
        let (ranges, vreg, rep) = match kind {
            RegisterKind::General => (
                &mut self.fixed_live_ranges,
                -i32::from(code) - 1,
                Representation::Word64,
            ),
            RegisterKind::Double => (
                &mut self.fixed_double_live_ranges,
                -i32::from(code) - 1 - vreg_to_i32(self.config.num_registers(RegisterKind::General)),
                Representation::Float64,
            ),
        };
        if let Some(x) = ranges[usize::from(code)] {
            return x;
        }
        let top = self.lrs.new_top_level(vreg, rep);
        ranges[usize::from(code)] = Some(top);
        let head = self.lrs.head(top);
        self.lrs.set_assigned_register(head, code);
        self.frame.mark_allocated(kind, code);
        top
    }

    /// The range of the physical register `code`, if any instruction fixed or clobbered it.
    pub(crate) fn fixed_live_range(&self, kind: RegisterKind, code: RegCode) -> Option<TopLevelIdx> {
        match kind {
            RegisterKind::General => self.fixed_live_ranges.get(usize::from(code)),
            RegisterKind::Double => self.fixed_double_live_ranges.get(usize::from(code)),
        }
        .copied()
        .flatten()
    }

    /// The fixed ranges of `kind` that exist.
    pub(crate) fn fixed_live_ranges(&self, kind: RegisterKind) -> impl Iterator<Item = TopLevelIdx> + '_ {
        match kind {
            RegisterKind::General => self.fixed_live_ranges.iter(),
            RegisterKind::Double => self.fixed_double_live_ranges.iter(),
        }
        .flatten()
        .copied()
    }

    /// Iterate over every (non-fixed) top-level range, including splinters that have not been
    /// merged back yet.
    pub(crate) fn top_level_ranges(&self) -> impl Iterator<Item = TopLevelIdx> + '_ {
        self.live_ranges.iter().flatten().copied()
    }

    /// Create a new top-level range with a fresh virtual register: used for splinters.
    pub(crate) fn next_live_range(&mut self, rep: Representation) -> TopLevelIdx {
        let vreg = self.live_ranges.len();
        let top = self.lrs.new_top_level(vreg_to_i32(vreg), rep);
        self.live_ranges.push(Some(top));
        top
    }

    /// Create a spill range for `top` without committing `top` to it.
    pub(crate) fn create_spill_range(&mut self, top: TopLevelIdx) -> SpillRangeIdx {
        debug_assert!(!self.lrs.tops[top].has_spill_operand());
        let sr = self.spill_ranges.push(SpillRange::new(&self.lrs, top));
        self.lrs.tops[top].pending_spill_range = Some(sr);
        sr
    }

    /// Commit `top` to being spilled to a spill range, creating one if necessary.
    pub(crate) fn assign_spill_range(&mut self, top: TopLevelIdx) -> SpillRangeIdx {
        debug_assert!(!self.lrs.tops[top].has_spill_operand());
        let (owner, pending) = {
            let t = &self.lrs.tops[top];
            (t.splintered_from.unwrap_or(top), t.pending_spill_range)
        };
        let owner_pending = self.lrs.tops[owner].pending_spill_range;
        let sr = match pending {
            Some(x) => x,
            None => match owner_pending {
                Some(x) => x,
                None => self.create_spill_range(owner),
            },
        };
        self.lrs.tops[top].spill = SpillLocation::Range(sr);
        self.lrs.tops[top].pending_spill_range = Some(sr);
        let vreg = usize::try_from(self.lrs.tops[owner].vreg).unwrap();
        self.spill_range_for_vreg[vreg] = Some(sr);
        sr
    }

    /// The spill location of `top` as an operand, if it has one yet: either its spill operand or
    /// the slot of its spill range.
    pub(crate) fn spill_operand(&self, top: TopLevelIdx) -> Option<InstructionOperand> {
        let t = &self.lrs.tops[top];
        match t.spill {
            SpillLocation::None => None,
            SpillLocation::Operand(op) => Some(op),
            SpillLocation::Range(sr) => self.spill_ranges[sr]
                .assigned_slot()
                .map(|slot| InstructionOperand::stack_slot(t.kind(), slot)),
        }
    }

    /// The location `r` ended up in.
    pub(crate) fn assigned_operand(&self, r: LiveRangeIdx) -> InstructionOperand {
        let lr = &self.lrs.ranges[r];
        if let Some(reg) = lr.assigned_register {
            return InstructionOperand::register(lr.kind, reg);
        }
        debug_assert!(lr.spilled, "{} has no location", self.lrs.name(r));
        match self.spill_operand(lr.top) {
            Some(op) => op,
            None => panic!("Spilled range {} has no spill slot", self.lrs.name(r)),
        }
    }

    pub(crate) fn initialize_phi_map(&mut self, vreg: VReg, block: RpoNumber, index: usize) -> PhiIdx {
        let idx = self.phis.push(PhiMapValue {
            vreg,
            block,
            index,
            incoming_operands: Vec::new(),
            assigned_register: None,
        });
        self.phi_map.insert(vreg, idx);
        idx
    }

    /// The phi defining the top-level range `top`.
    pub(crate) fn phi_for(&self, top: TopLevelIdx) -> Option<PhiIdx> {
        let vreg = usize::try_from(self.lrs.tops[top].vreg).ok()?;
        if vreg >= self.seq.virtual_register_count() {
            return None;
        }
        self.phi_map.get(&VReg::new(vreg)).copied()
    }

    /// The block containing position `pos`.
    pub(crate) fn block_at(&self, pos: LifetimePosition) -> &InstructionBlock {
        let idx = pos.to_instruction_index();
        // Ranges may end just beyond the last instruction.
        let idx = InstrIdx::new(idx.index().min(self.seq.instruction_count() - 1));
        self.seq.instruction_block(idx)
    }

    /// Is `pos` the very first position of a block?
    pub(crate) fn is_block_boundary(&self, pos: LifetimePosition) -> bool {
        if !pos.is_full_start() {
            return false;
        }
        let idx = pos.to_instruction_index();
        idx.index() < self.seq.instruction_count()
            && self.seq.instruction_block(idx).code_start() == idx
    }

    /// The innermost loop header containing `block`, not counting `block` itself.
    pub(crate) fn containing_loop(&self, block: &InstructionBlock) -> Option<&InstructionBlock> {
        block.loop_header().map(|h| self.seq.block(h))
    }

    /// The index of the last instruction of the loop headed by `header`.
    pub(crate) fn last_loop_instruction_index(&self, header: &InstructionBlock) -> InstrIdx {
        match header.loop_end() {
            Some(end) => self
                .seq
                .block(RpoNumber::new(end.index() - 1))
                .last_instruction_index(),
            None => panic!("B{} is not a loop header", header.rpo_number().index()),
        }
    }

    /// Note that `code` of `kind` has been used.
    pub(crate) fn mark_allocated(&mut self, kind: RegisterKind, code: RegCode) {
        self.frame.mark_allocated(kind, code);
    }

    pub(crate) fn add_gap_move(
        &mut self,
        i: InstrIdx,
        pos: crate::sequence::GapPosition,
        from: InstructionOperand,
        to: InstructionOperand,
    ) -> usize {
        self.stats.incr(Counter::GapMoves);
        self.seq.add_gap_move(i, pos, from, to)
    }
}

fn vreg_to_i32(x: usize) -> i32 {
    // The number of virtual registers is bounded by the size of the sequence.
    i32::try_from(x).unwrap()
}
