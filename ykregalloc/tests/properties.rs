//! Allocate a grid of sequence shapes under every combination of register configuration,
//! strategy and splintering, checking each result by simulation.

mod common;

use common::{allocate, two_regs, STRATEGIES};
use ykregalloc::{
    sequence::{
        Constant, Instruction, InstructionOperand, InstructionSequence, RegisterKind,
        Representation, SequenceBuilder, UnallocatedOperand,
    },
    Counter, Log, RegisterConfiguration,
};

const REPS: [Representation; 3] = [
    Representation::Word64,
    Representation::Tagged,
    Representation::Float64,
];

fn configs() -> [RegisterConfiguration; 2] {
    [two_regs(), RegisterConfiguration::x64()]
}

/// Four values and a constant, live across a safepointing call and then used in pairs.
fn straight_line(rep: Representation) -> InstructionSequence {
    let mut b = SequenceBuilder::new("straight_line");
    let vs = (0..4).map(|_| b.vreg(rep)).collect::<Vec<_>>();
    let c = b.constant(Representation::Word64, Constant::Int64(7));
    b.block();
    b.push(Instruction::new("const").output(InstructionOperand::Constant(c)));
    for v in &vs {
        b.push(Instruction::new("def").output(UnallocatedOperand::register(*v)));
    }
    b.push(
        Instruction::new("call")
            .input(UnallocatedOperand::any(vs[0]))
            .input(UnallocatedOperand::any(c))
            .call()
            .safepoint(),
    );
    b.push(
        Instruction::new("use")
            .input(UnallocatedOperand::register(vs[0]))
            .input(UnallocatedOperand::register(vs[1])),
    );
    b.push(
        Instruction::new("use")
            .input(UnallocatedOperand::register(vs[2]))
            .input(UnallocatedOperand::any(vs[3])),
    );
    b.push(Instruction::new("ret").input(UnallocatedOperand::any(vs[3])));
    b.build().unwrap()
}

/// Two arms, one of which calls, merged by a phi.
fn diamond_phi(rep: Representation) -> InstructionSequence {
    let mut b = SequenceBuilder::new("diamond_phi");
    let v0 = b.vreg(rep);
    let v1 = b.vreg(rep);
    let v2 = b.vreg(rep);
    let v3 = b.vreg(rep);
    let v4 = b.vreg(rep);
    let b0 = b.block();
    b.push(Instruction::new("def").output(UnallocatedOperand::register(v0)));
    b.push(Instruction::new("def").output(UnallocatedOperand::register(v1)));
    b.push(Instruction::new("branch").input(UnallocatedOperand::register(v0)));
    let b1 = b.block();
    b.push(
        Instruction::new("add")
            .output(UnallocatedOperand::same_as_first_input(v2))
            .input(UnallocatedOperand::register(v0))
            .input(UnallocatedOperand::any(v1)),
    );
    b.push(Instruction::new("jmp"));
    let b2 = b.block();
    b.push(Instruction::new("def").output(UnallocatedOperand::register(v3)));
    b.push(
        Instruction::new("call")
            .input(UnallocatedOperand::any(v1))
            .call()
            .safepoint(),
    );
    b.push(Instruction::new("jmp"));
    let b3 = b.block();
    b.phi(v4, &[v2, v3]);
    b.push(
        Instruction::new("use")
            .input(UnallocatedOperand::register(v4))
            .input(UnallocatedOperand::register(v1)),
    );
    b.push(Instruction::new("ret"));
    b.edge(b0, b1);
    b.edge(b0, b2);
    b.edge(b1, b3);
    b.edge(b2, b3);
    b.build().unwrap()
}

/// A loop whose induction variable is a phi, with a loop invariant value and a call in the body.
fn loop_phi(rep: Representation) -> InstructionSequence {
    let mut b = SequenceBuilder::new("loop_phi");
    let v0 = b.vreg(rep);
    let v1 = b.vreg(rep);
    let v2 = b.vreg(rep);
    let v3 = b.vreg(rep);
    let b0 = b.block();
    b.push(Instruction::new("def").output(UnallocatedOperand::register(v0)));
    b.push(Instruction::new("def").output(UnallocatedOperand::register(v1)));
    b.push(Instruction::new("jmp"));
    let b1 = b.block();
    b.phi(v2, &[v0, v3]);
    b.push(Instruction::new("branch").input(UnallocatedOperand::register(v2)));
    let b2 = b.block();
    b.push(
        Instruction::new("add")
            .output(UnallocatedOperand::same_as_first_input(v3))
            .input(UnallocatedOperand::register(v2))
            .input(UnallocatedOperand::register(v1)),
    );
    b.push(
        Instruction::new("call")
            .input(UnallocatedOperand::any(v1))
            .call()
            .safepoint(),
    );
    b.push(Instruction::new("jmp"));
    let b3 = b.block();
    b.push(
        Instruction::new("use")
            .input(UnallocatedOperand::register(v2))
            .input(UnallocatedOperand::any(v1)),
    );
    b.push(Instruction::new("ret"));
    b.edge(b0, b1);
    b.edge(b1, b2);
    b.edge(b2, b1);
    b.edge(b1, b3);
    b.mark_loop(b1, b3);
    b.build().unwrap()
}

/// Values live across a deferred arm that calls and a hot arm that doesn't.
fn deferred_arm(rep: Representation) -> InstructionSequence {
    let mut b = SequenceBuilder::new("deferred_arm");
    let v0 = b.vreg(rep);
    let v1 = b.vreg(rep);
    let b0 = b.block();
    b.push(Instruction::new("def").output(UnallocatedOperand::register(v0)));
    b.push(Instruction::new("def").output(UnallocatedOperand::register(v1)));
    b.push(Instruction::new("branch").input(UnallocatedOperand::register(v0)));
    let b1 = b.deferred_block();
    b.push(
        Instruction::new("call")
            .input(UnallocatedOperand::any(v1))
            .call()
            .safepoint(),
    );
    b.push(Instruction::new("jmp"));
    let b2 = b.block();
    b.push(Instruction::new("nop"));
    b.push(Instruction::new("jmp"));
    let b3 = b.block();
    b.push(
        Instruction::new("use")
            .input(UnallocatedOperand::register(v0))
            .input(UnallocatedOperand::register(v1)),
    );
    b.push(Instruction::new("ret"));
    b.edge(b0, b1);
    b.edge(b0, b2);
    b.edge(b1, b3);
    b.edge(b2, b3);
    b.build().unwrap()
}

/// General and double values interleaved, with fixed registers and temps.
fn mixed() -> InstructionSequence {
    let mut b = SequenceBuilder::new("mixed");
    let w0 = b.vreg(Representation::Word64);
    let w1 = b.vreg(Representation::Tagged);
    let f0 = b.vreg(Representation::Float64);
    let f1 = b.vreg(Representation::Float64);
    let t = b.vreg(Representation::Word64);
    b.block();
    b.push(Instruction::new("def").output(UnallocatedOperand::fixed_register(w0, 0)));
    b.push(Instruction::new("fdef").output(UnallocatedOperand::register(f0)));
    b.push(Instruction::new("def").output(UnallocatedOperand::register(w1)));
    b.push(
        Instruction::new("cvt")
            .output(UnallocatedOperand::register(f1))
            .input(UnallocatedOperand::register(w0))
            .temp(UnallocatedOperand::register(t)),
    );
    b.push(Instruction::new("gc").call().safepoint());
    b.push(
        Instruction::new("fuse")
            .input(UnallocatedOperand::fixed_double_register(f0, 1))
            .input(UnallocatedOperand::register(f1))
            .input(UnallocatedOperand::register(w1)),
    );
    b.build().unwrap()
}

fn check_all<F>(build: F)
where
    F: Fn() -> InstructionSequence + Copy,
{
    for cfg in configs() {
        for s in STRATEGIES {
            for splinter in [false, true] {
                // The allocator's own verification, which `allocate` turns on, also checks that no
                // fixed range was split, spilled or moved.
                let a = allocate(build, &cfg, s, splinter, &Log::disabled()).unwrap();
                if !splinter {
                    assert_eq!(a.stats.get(Counter::Splinters), 0);
                }
                // Every slot the frame has was handed out to some spill range.
                assert_eq!(
                    u64::try_from(a.frame.spill_slot_count()).unwrap(),
                    a.stats.get(Counter::SpillSlots),
                    "{s} {}",
                    a.seq.display(&cfg)
                );
                for kind in [RegisterKind::General, RegisterKind::Double] {
                    for code in a.frame.allocated_registers(kind) {
                        assert!(usize::from(code) < cfg.num_registers(kind));
                    }
                }
            }
        }
    }
}

#[test]
fn straight_line_grid() {
    for rep in REPS {
        check_all(move || straight_line(rep));
    }
}

#[test]
fn diamond_grid() {
    for rep in REPS {
        check_all(move || diamond_phi(rep));
    }
}

#[test]
fn loop_grid() {
    for rep in REPS {
        check_all(move || loop_phi(rep));
    }
}

#[test]
fn deferred_grid() {
    for rep in REPS {
        check_all(move || deferred_arm(rep));
    }
}

#[test]
fn mixed_grid() {
    check_all(mixed);
}
