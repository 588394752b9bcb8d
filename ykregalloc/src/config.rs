//! Register configurations and allocator options.

use crate::{
    sequence::{RegCode, RegisterKind},
    RegAllocError,
};
use smallvec::SmallVec;
use std::{env, str::FromStr};
use strum::{Display, EnumString};

/// The x64 general purpose registers, in encoding order.
static X64_GP_REGS: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15",
];

/// The x64 floating point registers, in encoding order.
static X64_FP_REGS: [&str; 16] = [
    "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8", "xmm9", "xmm10",
    "xmm11", "xmm12", "xmm13", "xmm14", "xmm15",
];

/// x64 registers the allocator must never hand out.
static X64_RESERVED: [&str; 2] = ["rsp", "rbp"];

/// The physical registers of a target: how many there are of each kind, what they are called,
/// and which of them the allocator may use.
#[derive(Clone, Debug)]
pub struct RegisterConfiguration {
    general_names: Vec<String>,
    double_names: Vec<String>,
    allocatable_general: SmallVec<[RegCode; 16]>,
    allocatable_double: SmallVec<[RegCode; 16]>,
}

impl RegisterConfiguration {
    /// Create a configuration from register names in encoding order. Registers named in
    /// `reserved` are never allocated.
    pub fn new(
        general: &[&str],
        double: &[&str],
        reserved: &[&str],
    ) -> Result<Self, RegAllocError> {
        fn allocatable(
            names: &[&str],
            reserved: &[&str],
        ) -> Result<SmallVec<[RegCode; 16]>, RegAllocError> {
            if names.len() > usize::from(RegCode::MAX) {
                return Err(RegAllocError::InvalidConfiguration(format!(
                    "at most {} registers of each kind are supported",
                    RegCode::MAX
                )));
            }
            for (i, n) in names.iter().enumerate() {
                if names[..i].contains(n) {
                    return Err(RegAllocError::InvalidConfiguration(format!(
                        "register '{n}' is defined twice"
                    )));
                }
            }
            Ok((0..names.len())
                .filter(|i| !reserved.contains(&names[*i]))
                .map(|i| RegCode::try_from(i).unwrap())
                .collect())
        }

        for r in reserved {
            if !general.contains(r) && !double.contains(r) {
                return Err(RegAllocError::InvalidConfiguration(format!(
                    "reserved register '{r}' does not exist"
                )));
            }
        }
        let allocatable_general = allocatable(general, reserved)?;
        if allocatable_general.is_empty() {
            return Err(RegAllocError::InvalidConfiguration(
                "at least one general register must be allocatable".into(),
            ));
        }
        Ok(Self {
            general_names: general.iter().map(|x| (*x).to_owned()).collect(),
            double_names: double.iter().map(|x| (*x).to_owned()).collect(),
            allocatable_general,
            allocatable_double: allocatable(double, reserved)?,
        })
    }

    /// The x64 registers, with the stack and frame pointers reserved.
    pub fn x64() -> Self {
        match Self::new(&X64_GP_REGS, &X64_FP_REGS, &X64_RESERVED) {
            Ok(x) => x,
            Err(e) => panic!("{e}"),
        }
    }

    pub fn num_registers(&self, kind: RegisterKind) -> usize {
        self.names(kind).len()
    }

    /// The codes of the registers of `kind` that the allocator may use, in ascending order.
    pub fn allocatable_codes(&self, kind: RegisterKind) -> &[RegCode] {
        match kind {
            RegisterKind::General => &self.allocatable_general,
            RegisterKind::Double => &self.allocatable_double,
        }
    }

    pub fn is_allocatable(&self, kind: RegisterKind, code: RegCode) -> bool {
        self.allocatable_codes(kind).contains(&code)
    }

    pub fn register_name(&self, kind: RegisterKind, code: RegCode) -> &str {
        self.names(kind)
            .get(usize::from(code))
            .map(|x| x.as_str())
            .unwrap_or("<unknown register>")
    }

    /// Look up a register by name.
    pub fn code_of(&self, kind: RegisterKind, name: &str) -> Option<RegCode> {
        self.names(kind)
            .iter()
            .position(|x| x == name)
            .map(|x| RegCode::try_from(x).unwrap())
    }

    fn names(&self, kind: RegisterKind) -> &[String] {
        match kind {
            RegisterKind::General => &self.general_names,
            RegisterKind::Double => &self.double_names,
        }
    }
}

/// Which register allocation algorithm to run.
#[derive(Copy, Clone, Debug, Default, Display, EnumString, PartialEq, Eq)]
pub enum Strategy {
    /// Sweep over live ranges in start order.
    #[default]
    #[strum(serialize = "linear")]
    LinearScan,
    /// Allocate the largest live ranges first, evicting cheaper ones when needed.
    #[strum(serialize = "greedy")]
    Greedy,
}

/// Options for a register allocation run, built up in the style of a builder:
///
/// ```
/// use ykregalloc::{RegAllocOptions, Strategy};
/// let opts = RegAllocOptions::new().strategy(Strategy::Greedy).verify(true);
/// assert_eq!(opts.get_strategy(), Strategy::Greedy);
/// ```
#[derive(Clone, Debug, Default)]
pub struct RegAllocOptions {
    strategy: Strategy,
    splinter: bool,
    verify: bool,
}

impl RegAllocOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from the defaults, then apply the `YKD_REGALLOC` (`linear` or `greedy`) and
    /// `YKD_REGALLOC_SPLINTER` (`0` or `1`) environment variables if they are set.
    pub fn from_env() -> Result<Self, RegAllocError> {
        let mut opts = Self::new();
        if let Ok(s) = env::var("YKD_REGALLOC") {
            opts.strategy = Strategy::from_str(&s).map_err(|_| {
                RegAllocError::InvalidOption(format!(
                    "YKD_REGALLOC must be 'linear' or 'greedy', not '{s}'"
                ))
            })?;
        }
        if let Ok(s) = env::var("YKD_REGALLOC_SPLINTER") {
            opts.splinter = match s.as_str() {
                "0" => false,
                "1" => true,
                _ => {
                    return Err(RegAllocError::InvalidOption(format!(
                        "YKD_REGALLOC_SPLINTER must be '0' or '1', not '{s}'"
                    )))
                }
            };
        }
        Ok(opts)
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Should live ranges be splintered around deferred blocks?
    pub fn splinter(mut self, splinter: bool) -> Self {
        self.splinter = splinter;
        self
    }

    /// Should the final allocation be checked?
    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn get_strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn get_splinter(&self) -> bool {
        self.splinter
    }

    pub fn get_verify(&self) -> bool {
        self.verify
    }
}
