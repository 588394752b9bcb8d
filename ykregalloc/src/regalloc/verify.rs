//! Check a finished allocation: every operand must have a concrete location, fixed ranges must be
//! untouched, and no two values may be in the same register at the same time.

use super::{data::RegisterAllocationData, live_range::LiveRangeIdx, position::LifetimePosition};
use crate::{
    sequence::{GapPosition, InstructionOperand, RegCode, RegisterKind},
    RegAllocError,
};

pub(crate) fn verify_allocation(d: &RegisterAllocationData) -> Result<(), RegAllocError> {
    verify_operands(d)?;
    for kind in [RegisterKind::General, RegisterKind::Double] {
        verify_fixed_ranges(d, kind)?;
        verify_no_double_allocation(d, kind)?;
    }
    Ok(())
}

fn verify_operands(d: &RegisterAllocationData) -> Result<(), RegAllocError> {
    let check = |op: &InstructionOperand, what: &dyn Fn() -> String| {
        if op.is_unallocated() {
            Err(RegAllocError::VerificationFailed(format!(
                "{} is still unallocated: {}",
                what(),
                op.display(d.config)
            )))
        } else {
            Ok(())
        }
    };

    for b in d.seq.blocks() {
        for (k, phi) in b.phis().iter().enumerate() {
            check(phi.output(), &|| {
                format!("phi {k} of B{}", b.rpo_number().index())
            })?;
        }
    }
    for (i, instr) in d.seq.instructions().iter_enumerated() {
        for pos in [GapPosition::Start, GapPosition::End] {
            let Some(pm) = instr.parallel_move(pos) else {
                continue;
            };
            for mv in pm.moves().iter().filter(|mv| !mv.is_eliminated()) {
                let what = || format!("a {pos:?} gap move before instruction {}", i.index());
                check(&mv.source, &what)?;
                check(&mv.destination, &what)?;
            }
        }
        let what = || format!("an operand of instruction {}", i.index());
        for op in instr
            .outputs()
            .iter()
            .chain(instr.inputs())
            .chain(instr.temps())
        {
            check(op, &what)?;
        }
    }
    Ok(())
}

/// A physical register's range is never split or spilled, and stays in its own register.
fn verify_fixed_ranges(d: &RegisterAllocationData, kind: RegisterKind) -> Result<(), RegAllocError> {
    for &code in d.config.allocatable_codes(kind) {
        let Some(top) = d.fixed_live_range(kind, code) else {
            continue;
        };
        let head = d.lrs.head(top);
        let lr = &d.lrs.ranges[head];
        if d.lrs.children(top).count() != 1 || lr.spilled || lr.assigned_register != Some(code) {
            return Err(RegAllocError::VerificationFailed(format!(
                "the range of {} has been moved",
                d.config.register_name(kind, code)
            )));
        }
    }
    Ok(())
}

/// Sweep the use intervals of every register-allocated range of `kind` in start order, tracking
/// which range last occupied each register and until when.
fn verify_no_double_allocation(
    d: &RegisterAllocationData,
    kind: RegisterKind,
) -> Result<(), RegAllocError> {
    let mut intervals: Vec<(LifetimePosition, LifetimePosition, RegCode, LiveRangeIdx)> =
        Vec::new();
    let tops = d
        .top_level_ranges()
        .chain(d.fixed_live_ranges(kind))
        .filter(|t| d.lrs.tops[*t].kind() == kind);
    for top in tops {
        for r in d.lrs.children(top) {
            let lr = &d.lrs.ranges[r];
            let Some(reg) = lr.assigned_register else {
                continue;
            };
            if lr.spilled {
                continue;
            }
            intervals.extend(d.lrs.intervals_of(r).map(|ui| (ui.start, ui.end, reg, r)));
        }
    }
    intervals.sort_by_key(|(s, e, _, _)| (*s, *e));

    let mut occupied: Vec<Option<(LifetimePosition, LiveRangeIdx)>> =
        vec![None; d.config.num_registers(kind)];
    for (start, end, reg, r) in intervals {
        let slot = &mut occupied[usize::from(reg)];
        if let Some((prev_end, prev)) = *slot {
            if prev_end > start && d.lrs.ranges[prev].top != d.lrs.ranges[r].top {
                return Err(RegAllocError::VerificationFailed(format!(
                    "{} and {} are both in {} at {start}",
                    d.lrs.name(prev),
                    d.lrs.name(r),
                    d.config.register_name(kind, reg)
                )));
            }
            if prev_end >= end {
                continue;
            }
        }
        *slot = Some((end, r));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::{
        super::{allocator::RegisterAllocator, assign::OperandAssigner, test_util::with_live_ranges},
        *,
    };
    use crate::{
        config::RegisterConfiguration,
        sequence::{Instruction, Representation, SequenceBuilder, UnallocatedOperand},
    };

    #[test]
    fn detects_double_allocation() {
        let mut b = SequenceBuilder::new("t");
        let v0 = b.vreg(Representation::Word64);
        let v1 = b.vreg(Representation::Word64);
        b.block();
        b.push(Instruction::new("def").output(UnallocatedOperand::register(v0)));
        b.push(Instruction::new("def").output(UnallocatedOperand::register(v1)));
        b.push(
            Instruction::new("use")
                .input(UnallocatedOperand::register(v0))
                .input(UnallocatedOperand::register(v1)),
        );
        let mut seq = b.build().unwrap();
        with_live_ranges(&mut seq, &RegisterConfiguration::x64(), |d| {
            let tops = [v0, v1].map(|v| d.live_ranges[v.index()].unwrap());
            // Nothing has been allocated yet.
            assert!(matches!(
                verify_allocation(d),
                Err(RegAllocError::VerificationFailed(_))
            ));

            let mut a = RegisterAllocator::new(d, RegisterKind::General);
            for t in tops {
                let head = a.d.lrs.head(t);
                a.set_assigned_register(head, 0);
            }
            let d = a.d;
            OperandAssigner::new(d).commit_assignment();
            match verify_allocation(d) {
                Err(RegAllocError::VerificationFailed(msg)) => {
                    assert_eq!(msg, "v0:0 and v1:0 are both in rax at @1is")
                }
                x => panic!("{x:?}"),
            }

            let head = d.lrs.head(tops[1]);
            d.lrs.unset_assigned_register(head);
            d.lrs.set_assigned_register(head, 1);
            OperandAssigner::new(d).commit_assignment();
            verify_allocation(d).unwrap();
        });
    }

    #[test]
    fn detects_moved_fixed_range() {
        let mut b = SequenceBuilder::new("t");
        let v0 = b.vreg(Representation::Word64);
        b.block();
        b.push(Instruction::new("def").output(UnallocatedOperand::register(v0)));
        b.push(Instruction::new("call").call());
        b.push(Instruction::new("call").call());
        b.push(Instruction::new("use").input(UnallocatedOperand::any(v0)));
        let mut seq = b.build().unwrap();
        with_live_ranges(&mut seq, &RegisterConfiguration::x64(), |d| {
            let t0 = d.live_ranges[v0.index()].unwrap();
            let rcx = d.fixed_live_range(RegisterKind::General, 1).unwrap();
            let mut a = RegisterAllocator::new(d, RegisterKind::General);
            let head = a.d.lrs.head(t0);
            a.spill(head);
            let d = a.d;
            let mut oa = OperandAssigner::new(d);
            oa.assign_spill_slots();
            oa.commit_assignment();
            verify_allocation(d).unwrap();

            // rcx's range, which blocks both calls, wanders into rdx.
            let fixed_head = d.lrs.head(rcx);
            d.lrs.unset_assigned_register(fixed_head);
            d.lrs.set_assigned_register(fixed_head, 2);
            match verify_allocation(d) {
                Err(RegAllocError::VerificationFailed(msg)) => {
                    assert_eq!(msg, "the range of rcx has been moved")
                }
                x => panic!("{x:?}"),
            }
        });
    }
}
