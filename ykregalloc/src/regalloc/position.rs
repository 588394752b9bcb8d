//! Lifetime positions: the time axis live ranges are measured along.
//!
//! Every instruction `i` owns four consecutive positions, `4i` to `4i + 3`:
//!
//! ```text
//!   4i     gap start          (the START parallel move before the instruction)
//!   4i + 1 gap end            (the END parallel move before the instruction)
//!   4i + 2 instruction start  (inputs used at start are read; outputs are written)
//!   4i + 3 instruction end    (other inputs are read)
//! ```

use crate::sequence::InstrIdx;
use std::fmt;

/// The number of positions per instruction.
const STEP: i32 = 4;
/// The offset of the instruction positions within an instruction's positions.
const HALF_STEP: i32 = 2;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct LifetimePosition(i32);

static_assertions::assert_eq_size!(LifetimePosition, i32);

impl LifetimePosition {
    /// The gap-start position of instruction `i`.
    pub(crate) fn gap_from_instruction_index(i: InstrIdx) -> Self {
        Self(idx_to_i32(i) * STEP)
    }

    /// The instruction-start position of instruction `i`.
    pub(crate) fn instruction_from_instruction_index(i: InstrIdx) -> Self {
        Self(idx_to_i32(i) * STEP + HALF_STEP)
    }

    pub(crate) fn invalid() -> Self {
        Self(-1)
    }

    /// A position later than every real position.
    pub(crate) fn max_position() -> Self {
        Self(i32::MAX)
    }

    #[cfg(test)]
    pub(crate) fn from_int(x: i32) -> Self {
        Self(x)
    }

    pub(crate) fn value(self) -> i32 {
        self.0
    }

    pub(crate) fn is_valid(self) -> bool {
        self.0 != -1
    }

    /// The index of the instruction this position belongs to.
    pub(crate) fn to_instruction_index(self) -> InstrIdx {
        debug_assert!(self.is_valid());
        InstrIdx::new(usize::try_from(self.0 / STEP).unwrap())
    }

    /// Is this the start of a gap or instruction half?
    pub(crate) fn is_start(self) -> bool {
        self.0 & 1 == 0
    }

    pub(crate) fn is_end(self) -> bool {
        self.0 & 1 == 1
    }

    /// Is this the very first position of an instruction (i.e. its gap start)?
    pub(crate) fn is_full_start(self) -> bool {
        self.0 & (STEP - 1) == 0
    }

    pub(crate) fn is_gap_position(self) -> bool {
        self.0 & HALF_STEP == 0
    }

    pub(crate) fn is_instruction_position(self) -> bool {
        !self.is_gap_position()
    }

    /// The start of this position's half (gap or instruction).
    pub(crate) fn start(self) -> Self {
        debug_assert!(self.is_valid());
        Self(self.0 & !1)
    }

    /// The end of this position's half (gap or instruction).
    pub(crate) fn end(self) -> Self {
        debug_assert!(self.is_valid());
        Self(self.start().0 + 1)
    }

    /// The gap-start position of this position's instruction.
    pub(crate) fn full_start(self) -> Self {
        debug_assert!(self.is_valid());
        Self(self.0 & !(STEP - 1))
    }

    /// The start of the next half.
    pub(crate) fn next_start(self) -> Self {
        debug_assert!(self.is_valid());
        Self(self.start().0 + HALF_STEP)
    }

    /// The gap-start position of the next instruction.
    pub(crate) fn next_full_start(self) -> Self {
        debug_assert!(self.is_valid());
        Self(self.full_start().0 + STEP)
    }

    /// The start of the previous half.
    pub(crate) fn prev_start(self) -> Self {
        debug_assert!(self.is_valid());
        debug_assert!(self.0 >= HALF_STEP);
        Self(self.start().0 - HALF_STEP)
    }

    /// Is there a gap position strictly between `a` and `b` (in either order)?
    pub(crate) fn exists_gap_position_between(a: Self, b: Self) -> bool {
        let (a, b) = if a > b { (b, a) } else { (a, b) };
        let next = Self(a.0 + 1);
        if next.is_gap_position() {
            next < b
        } else {
            next.next_full_start() < b
        }
    }
}

fn idx_to_i32(i: InstrIdx) -> i32 {
    // Sequences with more than 2^29 instructions are far beyond anything a JIT produces.
    i32::try_from(i.index()).unwrap()
}

impl fmt::Debug for LifetimePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for LifetimePosition {
    /// Print as `@<instruction index><g|i><s|e>`, e.g. `@3gs` for the gap start of instruction 3.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return write!(f, "@invalid");
        }
        if *self == Self::max_position() {
            return write!(f, "@max");
        }
        write!(
            f,
            "@{}{}{}",
            self.0 / STEP,
            if self.is_gap_position() { 'g' } else { 'i' },
            if self.is_start() { 's' } else { 'e' }
        )
    }
}
