//! Helpers shared by the integration tests.

#![allow(dead_code)]

use fm::{FMBuilder, FMatcher};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use ykregalloc::{
    allocate_registers,
    sequence::{
        Frame, GapPosition, InstrIdx, Instruction, InstructionOperand, InstructionSequence,
        RegisterKind, VReg,
    },
    Log, RegAllocError, RegAllocOptions, RegAllocStats, RegisterConfiguration, Strategy,
};

lazy_static! {
    static ref PTN_RE: Regex = Regex::new(r"\{\{.+?\}\}").unwrap();
    static ref TEXT_RE: Regex = Regex::new(r"[a-zA-Z0-9\._:\[\]]+").unwrap();
}

pub const STRATEGIES: [Strategy; 2] = [Strategy::LinearScan, Strategy::Greedy];

/// A configuration with only two registers of each kind, so that allocation is under pressure.
pub fn two_regs() -> RegisterConfiguration {
    RegisterConfiguration::new(&["r0", "r1"], &["d0", "d1"], &[]).unwrap()
}

pub fn fmatcher(ptn: &str) -> FMatcher<'_> {
    FMBuilder::new(ptn)
        .unwrap()
        .name_matcher(PTN_RE.clone(), TEXT_RE.clone())
        .build()
        .unwrap()
}

/// Panic unless `text` matches the [fm] pattern `ptn`.
pub fn assert_matches(ptn: &str, text: &str) {
    if let Err(e) = fmatcher(ptn).matches(text) {
        panic!("{e}");
    }
}

/// The result of allocating registers for one sequence.
pub struct Allocated {
    pub seq: InstructionSequence,
    pub frame: Frame,
    pub stats: RegAllocStats,
}

/// Build a sequence with `build`, allocate it with `strategy`, check the result with the
/// allocator's own verifier and with [check_allocation], and return it.
pub fn allocate<F>(
    build: F,
    config: &RegisterConfiguration,
    strategy: Strategy,
    splinter: bool,
    log: &Log,
) -> Result<Allocated, RegAllocError>
where
    F: Fn() -> InstructionSequence,
{
    let orig = build();
    let mut seq = build();
    let mut frame = Frame::new(0);
    let opts = RegAllocOptions::new()
        .strategy(strategy)
        .splinter(splinter)
        .verify(true);
    let stats = allocate_registers(&mut seq, &mut frame, config, &opts, log)?;
    if let Err(e) = check_allocation(&orig, &seq, config) {
        panic!(
            "{strategy} allocation of {} is wrong: {e}\n{}",
            orig.debug_name(),
            seq.display(config)
        );
    }
    Ok(Allocated { seq, frame, stats })
}

/// Which virtual register holds which location at some point in the program.
type State = HashMap<InstructionOperand, VReg>;

/// The virtual register an operand of the unallocated sequence refers to.
fn vreg_of(op: &InstructionOperand) -> Option<VReg> {
    match op {
        InstructionOperand::Unallocated(u) => Some(u.vreg),
        InstructionOperand::Constant(v) => Some(*v),
        _ => None,
    }
}

/// Does `instr` copy `v` to a location of the instruction's own choosing: a fixed input, or the
/// first input of a "same as first input" output?
fn is_pinned(instr: &Instruction, v: VReg) -> bool {
    let same_as_input = instr
        .outputs()
        .first()
        .and_then(|o| o.as_unallocated())
        .is_some_and(|u| u.has_same_as_input_policy());
    instr.inputs().iter().enumerate().any(|(j, op)| {
        op.as_unallocated()
            .is_some_and(|u| u.vreg == v && (u.has_fixed_policy() || (j == 0 && same_as_input)))
    })
}

fn read(st: &State, op: &InstructionOperand) -> Option<VReg> {
    match op {
        InstructionOperand::Constant(v) => Some(*v),
        _ => st.get(op).copied(),
    }
}

/// The virtual registers live just before each instruction of `seq`, which must be unallocated.
fn live_before(seq: &InstructionSequence) -> HashMap<InstrIdx, Vec<VReg>> {
    let nblocks = seq.blocks().len();
    let mut live_in: Vec<Vec<VReg>> = vec![Vec::new(); nblocks];
    let mut out = HashMap::new();
    let mut changed = true;
    while changed {
        changed = false;
        for b in seq.blocks().iter().rev() {
            let mut live: Vec<VReg> = Vec::new();
            for s in b.successors() {
                let sb = seq.block(*s);
                let phi_vregs = sb.phis().iter().map(|p| p.vreg()).collect::<Vec<_>>();
                for v in &live_in[s.index()] {
                    if !phi_vregs.contains(v) && !live.contains(v) {
                        live.push(*v);
                    }
                }
                let k = sb.predecessor_index_of(b.rpo_number()).unwrap();
                for p in sb.phis() {
                    if !live.contains(&p.operands()[k]) {
                        live.push(p.operands()[k]);
                    }
                }
            }
            for i in (b.code_start().index()..b.code_end().index()).rev() {
                let instr = seq.instruction(InstrIdx::new(i));
                for op in instr.outputs() {
                    if let Some(v) = vreg_of(op) {
                        live.retain(|x| *x != v);
                    }
                }
                for op in instr.inputs() {
                    if let Some(v) = vreg_of(op) {
                        if !live.contains(&v) {
                            live.push(v);
                        }
                    }
                }
                out.insert(InstrIdx::new(i), live.clone());
            }
            live.sort();
            if live != live_in[b.rpo_number().index()] {
                live_in[b.rpo_number().index()] = live;
                changed = true;
            }
        }
    }
    out
}

/// Check that `alloc`, the allocated form of `orig`, computes the same thing: by simulating which
/// value each location holds, every operand must read the value the original operand named, and
/// every reference map must record each live reference in exactly one location.
pub fn check_allocation(
    orig: &InstructionSequence,
    alloc: &InstructionSequence,
    config: &RegisterConfiguration,
) -> Result<(), String> {
    let live = live_before(orig);
    let nblocks = alloc.blocks().len();
    let mut out: Vec<Option<State>> = vec![None; nblocks];
    // Iterate to a fixed point, then do one more pass that reports errors.
    let mut checking = false;
    loop {
        let mut changed = false;
        for b in alloc.blocks() {
            let mut st: Option<State> = None;
            for (k, pred) in b.predecessors().iter().enumerate() {
                let Some(po) = &out[pred.index()] else {
                    continue;
                };
                let mut po = po.clone();
                for phi in b.phis() {
                    if po.get(phi.output()) == Some(&phi.operands()[k]) {
                        po.insert(*phi.output(), phi.vreg());
                    } else {
                        po.remove(phi.output());
                    }
                }
                st = Some(match st {
                    None => po,
                    Some(s) => s.into_iter().filter(|(l, v)| po.get(l) == Some(v)).collect(),
                });
            }
            let mut st = st.unwrap_or_default();

            for i in (b.code_start().index()..b.code_end().index()).map(InstrIdx::new) {
                let instr = alloc.instruction(i);
                let oinstr = orig.instruction(i);
                for pos in [GapPosition::Start, GapPosition::End] {
                    let Some(pm) = instr.parallel_move(pos) else {
                        continue;
                    };
                    let writes = pm
                        .moves()
                        .iter()
                        .filter(|m| !m.is_eliminated())
                        .map(|m| (m.destination, read(&st, &m.source)))
                        .collect::<Vec<_>>();
                    for (dst, v) in writes {
                        match v {
                            Some(v) => st.insert(dst, v),
                            None => st.remove(&dst),
                        };
                    }
                }

                if checking {
                    for (j, op) in oinstr.inputs().iter().enumerate() {
                        let Some(v) = vreg_of(op) else {
                            continue;
                        };
                        let loc = instr.inputs()[j];
                        if read(&st, &loc) != Some(v) {
                            return Err(format!(
                                "input {j} of instruction {} should be v{} but {} holds {}",
                                i.index(),
                                v.index(),
                                loc.display(config),
                                read(&st, &loc).map_or("nothing".to_owned(), |x| format!(
                                    "v{}",
                                    x.index()
                                ))
                            ));
                        }
                    }
                    if let Some(rm) = instr.reference_map() {
                        let refs = alloc.reference_maps()[rm].references();
                        for r in refs {
                            match st.get(r) {
                                Some(v) if alloc.is_reference(*v) => (),
                                _ => {
                                    return Err(format!(
                                        "{} is recorded as a reference at instruction {} but doesn't hold one",
                                        r.display(config),
                                        i.index()
                                    ))
                                }
                            }
                        }
                        for v in &live[&i] {
                            if !alloc.is_reference(*v)
                                || oinstr.outputs().iter().any(|o| vreg_of(o) == Some(*v))
                            {
                                continue;
                            }
                            let n = refs.iter().filter(|r| st.get(r) == Some(v)).count();
                            // A value the instruction copies to a location of its own may be
                            // recorded there too.
                            if n == 0 || (n > 1 && !is_pinned(oinstr, *v)) {
                                return Err(format!(
                                    "v{} is live at instruction {} but recorded {n} times in its reference map",
                                    v.index(),
                                    i.index()
                                ));
                            }
                        }
                    }
                }

                if instr.clobbers_registers() {
                    st.retain(|l, _| {
                        !matches!(l, InstructionOperand::Register { kind: RegisterKind::General, .. })
                    });
                }
                if instr.clobbers_double_registers() {
                    st.retain(|l, _| {
                        !matches!(l, InstructionOperand::Register { kind: RegisterKind::Double, .. })
                    });
                }
                for t in instr.temps() {
                    st.remove(t);
                }
                for (j, op) in oinstr.outputs().iter().enumerate() {
                    let loc = instr.outputs()[j];
                    match vreg_of(op) {
                        Some(v) if !loc.is_constant() => {
                            st.insert(loc, v);
                        }
                        _ => (),
                    }
                }
            }

            if out[b.rpo_number().index()].as_ref() != Some(&st) {
                out[b.rpo_number().index()] = Some(st);
                changed = true;
            }
        }
        if checking {
            return Ok(());
        }
        if !changed {
            checking = true;
        }
    }
}
