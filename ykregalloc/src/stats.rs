//! Statistics about a single register allocation run. "Durations" are wall-clock time, so they are
//! only ever a rough guide.

use std::{
    fmt,
    time::{Duration, Instant},
};
use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

/// The things we count.
#[derive(Copy, Clone, Debug, Display, EnumCount, EnumIter, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum Counter {
    /// Top-level live ranges built by liveness analysis.
    LiveRanges,
    /// Live ranges split into two.
    Splits,
    /// Live ranges (or parts of them) sent to the stack.
    Spills,
    /// Live ranges evicted from a register by the greedy allocator.
    Evictions,
    /// Live ranges carved out around deferred blocks.
    Splinters,
    /// Stack slots allocated for spill ranges.
    SpillSlots,
    /// Moves the allocator added to gaps.
    GapMoves,
    /// Operands recorded in reference maps.
    References,
}

/// The phases of a register allocation run.
#[derive(Copy, Clone, Debug, Display, EnumCount, EnumIter, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    MeetRegisterConstraints,
    ResolvePhis,
    BuildLiveRanges,
    SplinterLiveRanges,
    AllocateGeneralRegisters,
    AllocateDoubleRegisters,
    MergeSplinters,
    AssignSpillSlots,
    CommitAssignment,
    PopulateReferenceMaps,
    ConnectRanges,
    ResolveControlFlow,
    Verify,
}

#[derive(Clone, Debug, Default)]
pub struct RegAllocStats {
    counters: [u64; Counter::COUNT],
    durations: [Duration; Phase::COUNT],
}

impl RegAllocStats {
    pub fn get(&self, c: Counter) -> u64 {
        self.counters[c as usize]
    }

    pub fn duration(&self, p: Phase) -> Duration {
        self.durations[p as usize]
    }

    pub(crate) fn incr(&mut self, c: Counter) {
        self.add(c, 1);
    }

    pub(crate) fn add(&mut self, c: Counter, n: u64) {
        self.counters[c as usize] += n;
    }

    /// Start timing phase `p`: the returned value must be handed back to [Self::phase_end].
    pub(crate) fn phase_start(&self) -> Instant {
        Instant::now()
    }

    pub(crate) fn phase_end(&mut self, p: Phase, start: Instant) {
        self.durations[p as usize] += start.elapsed();
    }
}

impl fmt::Display for RegAllocStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in Counter::iter() {
            writeln!(f, "{c}: {}", self.get(c))?;
        }
        for p in Phase::iter() {
            writeln!(f, "{p}_secs: {:.6}", self.duration(p).as_secs_f64())?;
        }
        Ok(())
    }
}
