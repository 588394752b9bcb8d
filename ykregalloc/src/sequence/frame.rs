//! The stack frame as seen by the register allocator.

use super::operand::{RegCode, RegisterKind};
use vob::Vob;

/// The size of one stack slot in bytes.
pub const SLOT_SIZE: usize = 8;

/// This data structure keeps track of an abstract stack pointer for the spill area of a frame. The
/// abstract stack pointer is zero-based, so the stack pointer value also serves as the size of the
/// spill area.
///
/// The implementation is platform agnostic: as the abstract stack gets bigger, the abstract stack
/// pointer grows upwards, even on architectures where the stack grows downwards.
#[derive(Debug, Default)]
struct AbstractStack(usize);

impl AbstractStack {
    /// Aligns the abstract stack pointer to the specified number of bytes.
    ///
    /// Returns the newly aligned stack pointer.
    fn align(&mut self, to: usize) -> usize {
        let rem = self.0 % to;
        if rem != 0 {
            self.0 += to - rem;
        }
        self.0
    }

    /// Makes the stack bigger by `nbytes` bytes.
    ///
    /// Returns the new stack pointer.
    fn grow(&mut self, nbytes: usize) -> usize {
        self.0 += nbytes;
        self.0
    }

    /// Returns the stack pointer value.
    fn size(&self) -> usize {
        self.0
    }
}

/// The layout of a function's frame: some number of fixed slots (return address, saved frame
/// pointer, incoming arguments and the like) followed by the spill area the register allocator
/// hands out. Also records which registers the allocation ended up using, so that a code generator
/// can save and restore callee-saved registers.
#[derive(Debug)]
pub struct Frame {
    fixed_slot_count: usize,
    spill_area: AbstractStack,
    allocated_registers: Vob,
    allocated_double_registers: Vob,
}

impl Frame {
    pub fn new(fixed_slot_count: usize) -> Self {
        Self {
            fixed_slot_count,
            spill_area: AbstractStack::default(),
            allocated_registers: Vob::new(),
            allocated_double_registers: Vob::new(),
        }
    }

    /// Allocate a spill slot able to hold `width` bytes, returning its slot index.
    pub fn allocate_spill_slot(&mut self, width: usize) -> i32 {
        let nbytes = width.max(1).next_multiple_of(SLOT_SIZE);
        let off = self.spill_area.align(nbytes.next_power_of_two());
        self.spill_area.grow(nbytes);
        // Slot indexes are bounded by the size of a frame, which is tiny compared to `i32::MAX`.
        i32::try_from(self.fixed_slot_count + off / SLOT_SIZE).unwrap()
    }

    pub fn fixed_slot_count(&self) -> usize {
        self.fixed_slot_count
    }

    /// How many slots does the spill area occupy?
    pub fn spill_slot_count(&self) -> usize {
        self.spill_area.size() / SLOT_SIZE
    }

    pub fn total_slot_count(&self) -> usize {
        self.fixed_slot_count + self.spill_slot_count()
    }

    pub(crate) fn mark_allocated(&mut self, kind: RegisterKind, code: RegCode) {
        let v = self.registers_mut(kind);
        let i = usize::from(code);
        if i >= v.len() {
            v.resize(i + 1, false);
        }
        v.set(i, true);
    }

    pub fn is_allocated(&self, kind: RegisterKind, code: RegCode) -> bool {
        self.registers(kind)
            .get(usize::from(code))
            .unwrap_or(false)
    }

    /// Iterate over the codes of all registers of `kind` the allocation used.
    pub fn allocated_registers(&self, kind: RegisterKind) -> impl Iterator<Item = RegCode> + '_ {
        self.registers(kind)
            .iter_set_bits(..)
            .map(|i| RegCode::try_from(i).unwrap())
    }

    fn registers(&self, kind: RegisterKind) -> &Vob {
        match kind {
            RegisterKind::General => &self.allocated_registers,
            RegisterKind::Double => &self.allocated_double_registers,
        }
    }

    fn registers_mut(&mut self, kind: RegisterKind) -> &mut Vob {
        match kind {
            RegisterKind::General => &mut self.allocated_registers,
            RegisterKind::Double => &mut self.allocated_double_registers,
        }
    }
}
