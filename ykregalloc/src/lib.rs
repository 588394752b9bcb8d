//! A register allocator for a JIT compiler backend.
//!
//! Given an [InstructionSequence] whose operands name virtual registers, [allocate_registers]
//! decides, for every virtual register and every point in the program where it is live, whether it
//! lives in a physical register or a stack slot. It then rewrites the sequence in place: operands
//! become concrete locations, gap moves are inserted wherever a value changes location, and the
//! reference maps of GC safepoints are filled in.
//!
//! Two allocation strategies are available (see [Strategy]): a linear scan over live ranges in
//! start order, and a greedy allocator that handles the largest live ranges first.

use thiserror::Error;

pub mod config;
pub mod log;
mod regalloc;
pub mod sequence;
pub mod stats;

pub use config::{RegAllocOptions, RegisterConfiguration, Strategy};
pub use log::{Log, Verbosity};
pub use regalloc::allocate_registers;
pub use stats::{Counter, Phase, RegAllocStats};

#[derive(Debug, Error)]
pub enum RegAllocError {
    #[error("Malformed instruction sequence: {0}")]
    MalformedSequence(String),
    #[error("Invalid register configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Invalid option: {0}")]
    InvalidOption(String),
    /// These virtual registers are used somewhere that no definition reaches.
    #[error("Use without definition: {}", .0.iter().map(|x| format!("v{x}")).collect::<Vec<_>>().join(", "))]
    UseWithoutDefinition(Vec<u32>),
    #[error("Allocation verification failed: {0}")]
    VerificationFailed(String),
}
