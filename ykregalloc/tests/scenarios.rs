//! End-to-end allocation of small sequences whose outcome is known.

mod common;

use common::{allocate, assert_matches, two_regs, STRATEGIES};
use ykregalloc::{
    sequence::{
        Constant, Instruction, InstructionOperand, InstructionSequence, Representation,
        SequenceBuilder, UnallocatedOperand,
    },
    Counter, Log, RegAllocError, RegisterConfiguration, Strategy, Verbosity,
};

/// Three values, one of which is only read from memory, competing for two registers.
fn forced_spill() -> InstructionSequence {
    let mut b = SequenceBuilder::new("forced_spill");
    let v0 = b.vreg(Representation::Word64);
    let v1 = b.vreg(Representation::Word64);
    let v2 = b.vreg(Representation::Word64);
    b.block();
    b.push(Instruction::new("def").output(UnallocatedOperand::register(v0)));
    b.push(Instruction::new("def").output(UnallocatedOperand::register(v1)));
    b.push(Instruction::new("def").output(UnallocatedOperand::register(v2)));
    b.push(
        Instruction::new("use")
            .input(UnallocatedOperand::register(v2))
            .input(UnallocatedOperand::register(v1)),
    );
    b.push(Instruction::new("use").input(UnallocatedOperand::any(v0)));
    b.build().unwrap()
}

#[test]
fn spill_under_pressure() {
    for s in STRATEGIES {
        let a = allocate(forced_spill, &two_regs(), s, false, &Log::disabled()).unwrap();
        assert_eq!(a.stats.get(Counter::Spills), 1, "{s}");
        assert_eq!(a.stats.get(Counter::SpillSlots), 1, "{s}");
        assert_eq!(a.frame.spill_slot_count(), 1, "{s}");
        assert_matches(
            "
            ; forced_spill
            B0
              0: {{a}} = def
              gap 1 start: [stack:0] = {{a}}
              1: {{b}} = def
              2: {{c}} = def
              3: use {{c}}, {{b}}
              4: use [stack:0]
            ",
            &a.seq.display(&two_regs()).to_string(),
        );
    }
}

/// B1 heads a loop that doesn't use v0, which is used after the loop.
fn loop_live_through() -> InstructionSequence {
    let mut b = SequenceBuilder::new("loop_live_through");
    let v0 = b.vreg(Representation::Word64);
    let b0 = b.block();
    b.push(Instruction::new("def").output(UnallocatedOperand::register(v0)));
    b.push(Instruction::new("jmp"));
    let b1 = b.block();
    b.push(Instruction::new("nop"));
    b.push(Instruction::new("branch"));
    let b2 = b.block();
    b.push(Instruction::new("nop"));
    b.push(Instruction::new("jmp"));
    let b3 = b.block();
    b.push(Instruction::new("ret").input(UnallocatedOperand::register(v0)));
    b.edge(b0, b1);
    b.edge(b1, b2);
    b.edge(b2, b1);
    b.edge(b1, b3);
    b.mark_loop(b1, b3);
    b.build().unwrap()
}

#[test]
fn loop_liveness() {
    for s in STRATEGIES {
        let log = Log::buffered(Verbosity::Trace);
        let a = allocate(loop_live_through, &RegisterConfiguration::x64(), s, false, &log).unwrap();
        // v0 is live for the whole loop body, not just where the loop is entered and left.
        let lines = log.take_lines();
        assert!(
            lines.contains(&"regalloc-trace: built v0:0: [@0is, @6ie)".to_owned()),
            "{s}"
        );
        assert_eq!(a.stats.get(Counter::Spills), 0, "{s}");
        assert_eq!(a.stats.get(Counter::GapMoves), 0, "{s}");
    }
}

/// A value live across a call must be spilled around it.
fn across_call() -> InstructionSequence {
    let mut b = SequenceBuilder::new("across_call");
    let v0 = b.vreg(Representation::Tagged);
    b.block();
    b.push(Instruction::new("def").output(UnallocatedOperand::register(v0)));
    b.push(Instruction::new("gc").call().safepoint());
    b.push(Instruction::new("use").input(UnallocatedOperand::register(v0)));
    b.build().unwrap()
}

#[test]
fn spill_around_calls() {
    for s in STRATEGIES {
        let cfg = RegisterConfiguration::x64();
        let a = allocate(across_call, &cfg, s, false, &Log::disabled()).unwrap();
        assert_eq!(a.stats.get(Counter::References), 1, "{s}");
        assert_matches(
            "
            ; across_call
            B0
              0: {{a}} = def
              gap 1 start: [stack:0] = {{a}}
              1: gc (call) {refs: [stack:0]}
              ...
              2: use {{b}}
            ",
            &a.seq.display(&cfg).to_string(),
        );
    }
}

/// B0 defines v0, B1 is deferred, B2 uses v0.
fn hot_cold_hot() -> InstructionSequence {
    let mut b = SequenceBuilder::new("hot_cold_hot");
    let v0 = b.vreg(Representation::Word64);
    let b0 = b.block();
    b.push(Instruction::new("def").output(UnallocatedOperand::register(v0)));
    b.push(Instruction::new("jmp"));
    let b1 = b.deferred_block();
    b.push(Instruction::new("call").call());
    b.push(Instruction::new("jmp"));
    let b2 = b.block();
    b.push(Instruction::new("ret").input(UnallocatedOperand::register(v0)));
    b.edge(b0, b1);
    b.edge(b1, b2);
    b.build().unwrap()
}

#[test]
fn splintering() {
    for s in STRATEGIES {
        let log = Log::buffered(Verbosity::Trace);
        let a = allocate(hot_cold_hot, &RegisterConfiguration::x64(), s, true, &log).unwrap();
        assert_eq!(a.stats.get(Counter::Splinters), 1, "{s}");
        let lines = log.take_lines();
        assert!(
            lines.contains(&"regalloc-trace: splintering v0:0 into v1 over [@2gs, @3gs)".to_owned()),
            "{s}"
        );
        assert!(
            lines
                .iter()
                .any(|l| l.starts_with("regalloc-trace: merging v1:") && l.ends_with("back into v0")),
            "{s}"
        );

        // Without splintering, the same sequence still allocates correctly.
        let a = allocate(hot_cold_hot, &RegisterConfiguration::x64(), s, false, &Log::disabled())
            .unwrap();
        assert_eq!(a.stats.get(Counter::Splinters), 0, "{s}");
    }
}

/// Floating point values come from the double registers.
fn doubles() -> InstructionSequence {
    let mut b = SequenceBuilder::new("doubles");
    let v0 = b.vreg(Representation::Float64);
    let v1 = b.vreg(Representation::Float64);
    let v2 = b.vreg(Representation::Word64);
    b.block();
    b.push(Instruction::new("fdef").output(UnallocatedOperand::register(v0)));
    b.push(Instruction::new("fdef").output(UnallocatedOperand::register(v1)));
    b.push(Instruction::new("def").output(UnallocatedOperand::register(v2)));
    b.push(
        Instruction::new("fadd")
            .input(UnallocatedOperand::register(v0))
            .input(UnallocatedOperand::register(v1))
            .input(UnallocatedOperand::register(v2)),
    );
    b.build().unwrap()
}

#[test]
fn double_registers() {
    for s in STRATEGIES {
        let a = allocate(doubles, &two_regs(), s, false, &Log::disabled()).unwrap();
        assert_eq!(a.stats.get(Counter::Spills), 0, "{s}");
        let text = a.seq.display(&two_regs()).to_string();
        assert_matches(
            "
            ...
              3: fadd {{x}}, {{y}}, {{z}}
            ",
            &text,
        );
        let last = text.lines().last().unwrap();
        assert!(last.contains(" d0") && last.contains(" d1") && last.contains(" r0"), "{s}");
    }
}

/// A value is given different locations in the two arms of a diamond and merged with a phi.
fn diamond() -> InstructionSequence {
    let mut b = SequenceBuilder::new("diamond");
    let v0 = b.vreg(Representation::Word64);
    let v1 = b.vreg(Representation::Word64);
    let v2 = b.vreg(Representation::Word64);
    let v3 = b.vreg(Representation::Word64);
    let c = b.constant(Representation::Word64, Constant::Int64(42));
    let b0 = b.block();
    b.push(Instruction::new("const").output(InstructionOperand::Constant(c)));
    b.push(Instruction::new("def").output(UnallocatedOperand::register(v0)));
    b.push(Instruction::new("branch").input(UnallocatedOperand::register(v0)));
    let b1 = b.block();
    b.push(
        Instruction::new("add")
            .output(UnallocatedOperand::same_as_first_input(v1))
            .input(UnallocatedOperand::register(v0))
            .input(UnallocatedOperand::any(c)),
    );
    b.push(Instruction::new("jmp"));
    let b2 = b.block();
    b.push(Instruction::new("call").output(UnallocatedOperand::fixed_register(v2, 0)).call());
    b.push(Instruction::new("jmp"));
    let b3 = b.block();
    b.phi(v3, &[v1, v2]);
    b.push(
        Instruction::new("ret")
            .input(UnallocatedOperand::fixed_register(v3, 0))
            .input(UnallocatedOperand::any(v0)),
    );
    b.edge(b0, b1);
    b.edge(b0, b2);
    b.edge(b1, b3);
    b.edge(b2, b3);
    b.build().unwrap()
}

#[test]
fn phis_and_constants() {
    for s in STRATEGIES {
        let cfg = RegisterConfiguration::x64();
        let a = allocate(diamond, &cfg, s, false, &Log::disabled()).unwrap();
        assert_matches(
            "
            ...
            B3 (preds: B1, B2)
              phi v3: {{p}} = v1, v2
              ...
              7: ret rax, {{v0}}
            ",
            &a.seq.display(&cfg).to_string(),
        );
    }
}

#[test]
fn greedy_evicts() {
    let a = allocate(
        forced_spill,
        &two_regs(),
        Strategy::Greedy,
        false,
        &Log::disabled(),
    )
    .unwrap();
    assert_eq!(a.stats.get(Counter::Evictions), 1);
}

fn undefined_use() -> InstructionSequence {
    let mut b = SequenceBuilder::new("undefined_use");
    let v0 = b.vreg(Representation::Word64);
    b.block();
    b.push(Instruction::new("use").input(UnallocatedOperand::register(v0)));
    b.build().unwrap()
}

#[test]
fn use_without_definition() {
    for s in STRATEGIES {
        let cfg = RegisterConfiguration::x64();
        match allocate(undefined_use, &cfg, s, false, &Log::disabled()) {
            Err(RegAllocError::UseWithoutDefinition(v)) => assert_eq!(v, vec![0]),
            Err(e) => panic!("{e}"),
            Ok(_) => panic!("{s}: allocation succeeded"),
        }
    }
}

/// A block ending in an instruction that needs a scratch register of its choosing.
fn fixed_temp_at_end() -> InstructionSequence {
    let mut b = SequenceBuilder::new("fixed_temp_at_end");
    let v0 = b.vreg(Representation::Word64);
    let t = b.vreg(Representation::Word64);
    b.block();
    b.push(Instruction::new("def").output(UnallocatedOperand::register(v0)));
    b.push(
        Instruction::new("ret")
            .input(UnallocatedOperand::register(v0))
            .temp(UnallocatedOperand::fixed_register(t, 2)),
    );
    b.build().unwrap()
}

#[test]
fn fixed_temp_on_last_instruction() {
    for s in STRATEGIES {
        let cfg = RegisterConfiguration::x64();
        let a = allocate(fixed_temp_at_end, &cfg, s, false, &Log::disabled()).unwrap();
        let text = a.seq.display(&cfg).to_string();
        assert_matches(
            "
            ...
              1: ret {{a}} (temps: rdx)
            ",
            &text,
        );
        assert!(!text.contains("ret rdx"), "{s}");
    }
}
