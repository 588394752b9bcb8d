//! Instruction operands.
//!
//! Before allocation nearly every value-carrying operand is an [UnallocatedOperand]: a virtual
//! register plus a [Policy] saying where the value is allowed to live at that point. Allocation
//! rewrites these in place into [InstructionOperand::Register]s, [InstructionOperand::StackSlot]s
//! or (for values that are compile-time constants) [InstructionOperand::Constant]s.

use crate::config::RegisterConfiguration;
use std::fmt;
use strum::Display;

index_vec::define_index_type! {
    /// A virtual register.
    pub struct VReg = u32;
}

/// The encoding of a physical register within its [RegisterKind].
pub type RegCode = u8;

/// The class of physical registers a value is allocated from.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegisterKind {
    #[strum(to_string = "general")]
    General,
    #[strum(to_string = "double")]
    Double,
}

/// The machine representation of a virtual register.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash)]
pub enum Representation {
    #[strum(to_string = "w32")]
    Word32,
    #[strum(to_string = "w64")]
    Word64,
    /// A pointer the garbage collector needs to know about.
    #[strum(to_string = "tagged")]
    Tagged,
    #[strum(to_string = "f32")]
    Float32,
    #[strum(to_string = "f64")]
    Float64,
}

impl Representation {
    pub fn kind(self) -> RegisterKind {
        match self {
            Self::Word32 | Self::Word64 | Self::Tagged => RegisterKind::General,
            Self::Float32 | Self::Float64 => RegisterKind::Double,
        }
    }

    pub fn is_reference(self) -> bool {
        self == Self::Tagged
    }

    /// How many bytes does a spilled value of this representation need?
    pub fn byte_width(self) -> usize {
        match self {
            Self::Word32 | Self::Float32 => 4,
            Self::Word64 | Self::Tagged | Self::Float64 => 8,
        }
    }
}

/// Where is an unallocated operand allowed to live?
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Policy {
    /// No constraint at all. Used for phi outputs.
    None,
    /// A register, a stack slot or a constant: whatever the value happens to be in.
    Any,
    Register,
    Slot,
    FixedRegister(RegCode),
    FixedDoubleRegister(RegCode),
    FixedSlot(i32),
    /// The output must end up in the same location as the instruction's first input.
    SameAsFirstInput,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct UnallocatedOperand {
    pub vreg: VReg,
    pub policy: Policy,
    /// For inputs: is the value only needed at the very start of the instruction (so that an
    /// output may reuse its location)?
    pub used_at_start: bool,
}

impl UnallocatedOperand {
    pub fn new(vreg: VReg, policy: Policy) -> Self {
        Self {
            vreg,
            policy,
            used_at_start: false,
        }
    }

    pub fn none(vreg: VReg) -> Self {
        Self::new(vreg, Policy::None)
    }

    pub fn any(vreg: VReg) -> Self {
        Self::new(vreg, Policy::Any)
    }

    pub fn register(vreg: VReg) -> Self {
        Self::new(vreg, Policy::Register)
    }

    pub fn slot(vreg: VReg) -> Self {
        Self::new(vreg, Policy::Slot)
    }

    pub fn fixed_register(vreg: VReg, code: RegCode) -> Self {
        Self::new(vreg, Policy::FixedRegister(code))
    }

    pub fn fixed_double_register(vreg: VReg, code: RegCode) -> Self {
        Self::new(vreg, Policy::FixedDoubleRegister(code))
    }

    pub fn fixed_slot(vreg: VReg, index: i32) -> Self {
        Self::new(vreg, Policy::FixedSlot(index))
    }

    pub fn same_as_first_input(vreg: VReg) -> Self {
        Self::new(vreg, Policy::SameAsFirstInput)
    }

    /// Mark this (input) operand as only being read at the start of its instruction.
    pub fn at_start(mut self) -> Self {
        self.used_at_start = true;
        self
    }

    pub fn has_fixed_policy(&self) -> bool {
        matches!(
            self.policy,
            Policy::FixedRegister(_) | Policy::FixedDoubleRegister(_) | Policy::FixedSlot(_)
        )
    }

    pub fn has_register_policy(&self) -> bool {
        self.policy == Policy::Register
    }

    pub fn has_slot_policy(&self) -> bool {
        self.policy == Policy::Slot
    }

    pub fn has_any_policy(&self) -> bool {
        self.policy == Policy::Any
    }

    pub fn has_same_as_input_policy(&self) -> bool {
        self.policy == Policy::SameAsFirstInput
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum InstructionOperand {
    Invalid,
    Unallocated(UnallocatedOperand),
    /// A value defined as a compile-time constant (see [super::InstructionSequence::constant]).
    Constant(VReg),
    Immediate(i64),
    Register { kind: RegisterKind, code: RegCode },
    StackSlot { kind: RegisterKind, index: i32 },
}

impl InstructionOperand {
    pub fn register(kind: RegisterKind, code: RegCode) -> Self {
        Self::Register { kind, code }
    }

    pub fn stack_slot(kind: RegisterKind, index: i32) -> Self {
        Self::StackSlot { kind, index }
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid)
    }

    pub fn is_unallocated(&self) -> bool {
        matches!(self, Self::Unallocated(_))
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Self::Constant(_))
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self, Self::Immediate(_))
    }

    pub fn is_register(&self) -> bool {
        matches!(self, Self::Register { .. })
    }

    pub fn is_stack_slot(&self) -> bool {
        matches!(self, Self::StackSlot { .. })
    }

    /// Is this a concrete machine location?
    pub fn is_allocated(&self) -> bool {
        self.is_register() || self.is_stack_slot()
    }

    pub fn as_unallocated(&self) -> Option<&UnallocatedOperand> {
        match self {
            Self::Unallocated(u) => Some(u),
            _ => None,
        }
    }

    /// If this operand refers to a virtual register, return it.
    pub fn vreg(&self) -> Option<VReg> {
        match self {
            Self::Unallocated(u) => Some(u.vreg),
            Self::Constant(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns a value that can be formatted with register names from `config`.
    pub fn display<'a>(&'a self, config: &'a RegisterConfiguration) -> OperandDisplay<'a> {
        OperandDisplay { op: self, config }
    }
}

impl From<UnallocatedOperand> for InstructionOperand {
    fn from(u: UnallocatedOperand) -> Self {
        Self::Unallocated(u)
    }
}

pub struct OperandDisplay<'a> {
    op: &'a InstructionOperand,
    config: &'a RegisterConfiguration,
}

impl fmt::Display for OperandDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            InstructionOperand::Invalid => write!(f, "(invalid)"),
            InstructionOperand::Unallocated(u) => {
                write!(f, "v{}", u.vreg.index())?;
                match u.policy {
                    Policy::None => Ok(()),
                    Policy::Any => write!(f, "(-)"),
                    Policy::Register => write!(f, "(R)"),
                    Policy::Slot => write!(f, "(S)"),
                    Policy::FixedRegister(c) => write!(
                        f,
                        "(={})",
                        self.config.register_name(RegisterKind::General, c)
                    ),
                    Policy::FixedDoubleRegister(c) => write!(
                        f,
                        "(={})",
                        self.config.register_name(RegisterKind::Double, c)
                    ),
                    Policy::FixedSlot(i) => write!(f, "(={i}S)"),
                    Policy::SameAsFirstInput => write!(f, "(1)"),
                }
            }
            InstructionOperand::Constant(v) => write!(f, "[constant:v{}]", v.index()),
            InstructionOperand::Immediate(i) => write!(f, "#{i}"),
            InstructionOperand::Register { kind, code } => {
                write!(f, "{}", self.config.register_name(*kind, *code))
            }
            InstructionOperand::StackSlot { kind, index } => match kind {
                RegisterKind::General => write!(f, "[stack:{index}]"),
                RegisterKind::Double => write!(f, "[fp_stack:{index}]"),
            },
        }
    }
}

/// The value of a virtual register defined by a constant.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Constant {
    Int32(i32),
    Int64(i64),
    Float64(f64),
    /// The address of a heap object.
    Tagged(u64),
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int32(x) => write!(f, "{x}i32"),
            Self::Int64(x) => write!(f, "{x}i64"),
            Self::Float64(x) => write!(f, "{x}f64"),
            Self::Tagged(x) => write!(f, "{x:#x}"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn representations() {
        assert_eq!(Representation::Tagged.kind(), RegisterKind::General);
        assert_eq!(Representation::Float32.kind(), RegisterKind::Double);
        assert!(Representation::Tagged.is_reference());
        assert!(!Representation::Word64.is_reference());
        assert_eq!(Representation::Word32.byte_width(), 4);
        assert_eq!(Representation::Float64.byte_width(), 8);
    }

    #[test]
    fn display() {
        let cfg = RegisterConfiguration::x64();
        let v = VReg::new(3);
        let ops = [
            (InstructionOperand::from(UnallocatedOperand::none(v)), "v3"),
            (UnallocatedOperand::any(v).into(), "v3(-)"),
            (UnallocatedOperand::register(v).into(), "v3(R)"),
            (UnallocatedOperand::slot(v).into(), "v3(S)"),
            (UnallocatedOperand::fixed_register(v, 2).into(), "v3(=rdx)"),
            (UnallocatedOperand::fixed_double_register(v, 1).into(), "v3(=xmm1)"),
            (UnallocatedOperand::fixed_slot(v, -1).into(), "v3(=-1S)"),
            (UnallocatedOperand::same_as_first_input(v).into(), "v3(1)"),
            (InstructionOperand::Constant(v), "[constant:v3]"),
            (InstructionOperand::Immediate(-7), "#-7"),
            (
                InstructionOperand::register(RegisterKind::General, 3),
                "rbx",
            ),
            (
                InstructionOperand::stack_slot(RegisterKind::Double, 2),
                "[fp_stack:2]",
            ),
        ];
        for (op, s) in ops {
            assert_eq!(op.display(&cfg).to_string(), s);
        }
    }

    #[test]
    fn policies() {
        let v = VReg::new(0);
        assert!(UnallocatedOperand::fixed_slot(v, 0).has_fixed_policy());
        assert!(UnallocatedOperand::fixed_register(v, 0).has_fixed_policy());
        assert!(!UnallocatedOperand::register(v).has_fixed_policy());
        assert!(UnallocatedOperand::any(v).at_start().used_at_start);
        assert_eq!(
            InstructionOperand::from(UnallocatedOperand::any(v)).vreg(),
            Some(v)
        );
        assert_eq!(InstructionOperand::Immediate(1).vreg(), None);
    }
}
