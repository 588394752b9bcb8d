//! The register allocation pipeline.
//!
//! Allocation happens in a fixed sequence of phases over a shared [RegisterAllocationData]: fixing
//! up operand constraints with gap moves, building a live range per virtual register, allocating
//! registers to live ranges (splitting and spilling them as needed), then rewriting the
//! instruction sequence to reflect the decisions made.

mod allocator;
mod assign;
mod coalesced;
mod connect;
mod constraints;
mod data;
mod greedy;
mod linear_scan;
mod live_range;
mod liveness;
mod position;
mod refmaps;
mod spill_range;
mod splinter;
mod verify;

use crate::{
    config::{RegAllocOptions, RegisterConfiguration, Strategy},
    log::{Log, Verbosity},
    sequence::{Frame, InstructionSequence, RegisterKind},
    stats::{Phase, RegAllocStats},
    RegAllocError,
};
use allocator::AllocationStrategy;
use assign::OperandAssigner;
use connect::LiveRangeConnector;
use constraints::ConstraintBuilder;
use data::RegisterAllocationData;
use greedy::GreedyAllocator;
use linear_scan::LinearScanAllocator;
use liveness::LiveRangeBuilder;
use refmaps::ReferenceMapPopulator;
use splinter::LiveRangeSeparator;
use std::mem;

/// Allocate registers for `seq`, rewriting it in place so that every operand names a physical
/// register, a stack slot or a constant. Spill slots are allocated in `frame`, which also records
/// which registers were used.
///
/// # Errors
///
/// Fails if `seq` uses a virtual register that no definition reaches, or if verification is
/// enabled in `opts` and the allocation is found to be inconsistent.
pub fn allocate_registers(
    seq: &mut InstructionSequence,
    frame: &mut Frame,
    config: &RegisterConfiguration,
    opts: &RegAllocOptions,
    log: &Log,
) -> Result<RegAllocStats, RegAllocError> {
    let debug_name = seq.debug_name().to_owned();
    let mut d = RegisterAllocationData::new(seq, frame, config, log);
    let mut p = Pipeline {
        d: &mut d,
        debug_name: &debug_name,
    };

    p.run(Phase::MeetRegisterConstraints, |d| {
        ConstraintBuilder::new(d).meet_register_constraints()
    })?;
    p.run(Phase::ResolvePhis, |d| {
        ConstraintBuilder::new(d).resolve_phis();
        Ok(())
    })?;
    p.run(Phase::BuildLiveRanges, |d| {
        LiveRangeBuilder::new(d).build_live_ranges()
    })?;
    if opts.get_splinter() {
        p.run(Phase::SplinterLiveRanges, |d| {
            LiveRangeSeparator::new(d).splinter();
            Ok(())
        })?;
    }

    let strategy = opts.get_strategy();
    for (phase, kind) in [
        (Phase::AllocateGeneralRegisters, RegisterKind::General),
        (Phase::AllocateDoubleRegisters, RegisterKind::Double),
    ] {
        p.run(phase, |d| {
            match strategy {
                Strategy::LinearScan => LinearScanAllocator::new(d, kind).allocate_registers(),
                Strategy::Greedy => GreedyAllocator::new(d, kind).allocate_registers(),
            }
            Ok(())
        })?;
    }

    if opts.get_splinter() {
        p.run(Phase::MergeSplinters, |d| {
            splinter::merge_splinters(d);
            Ok(())
        })?;
    }
    p.run(Phase::AssignSpillSlots, |d| {
        OperandAssigner::new(d).assign_spill_slots();
        Ok(())
    })?;
    p.run(Phase::CommitAssignment, |d| {
        OperandAssigner::new(d).commit_assignment();
        Ok(())
    })?;
    p.run(Phase::PopulateReferenceMaps, |d| {
        ReferenceMapPopulator::new(d).populate_reference_maps();
        Ok(())
    })?;
    p.run(Phase::ConnectRanges, |d| {
        LiveRangeConnector::new(d).connect_ranges();
        Ok(())
    })?;
    p.run(Phase::ResolveControlFlow, |d| {
        LiveRangeConnector::new(d).resolve_control_flow();
        Ok(())
    })?;
    if opts.get_verify() {
        p.run(Phase::Verify, |d| verify::verify_allocation(d))?;
    }

    if log.enabled(Verbosity::Trace) {
        log.log(
            Verbosity::Trace,
            &format!("--- {debug_name} after allocation ---\n{}", d.seq.display(config)),
        );
    }
    Ok(mem::take(&mut d.stats))
}

/// Runs phases one after the other, timing and logging each.
struct Pipeline<'d, 'a> {
    d: &'d mut RegisterAllocationData<'a>,
    debug_name: &'d str,
}

impl Pipeline<'_, '_> {
    fn run<F>(&mut self, phase: Phase, f: F) -> Result<(), RegAllocError>
    where
        F: FnOnce(&mut RegisterAllocationData) -> Result<(), RegAllocError>,
    {
        self.d
            .log
            .log(Verbosity::Phase, &format!("{phase}: {}", self.debug_name));
        let start = self.d.stats.phase_start();
        let r = f(self.d);
        self.d.stats.phase_end(phase, start);
        if let Err(e) = &r {
            self.d.log.log(Verbosity::Error, &format!("{phase}: {e}"));
        }
        r
    }
}
