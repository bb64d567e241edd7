use krait_asm::{
    op,
    JmpOp,
    MemSize,
    RegId,
};

use crate::error::Reject;
use crate::kfunc::KfuncId;
use crate::prelude::ProgramBuilder;

/// Ordinary back-edges form unprovable loops and are rejected in the first
/// pass.
#[test]
fn counter_loop_rejected() {
    let err = ProgramBuilder::new()
        .insn(op::mov64_imm(0u8, 0))
        .insn(op::add64_imm(0u8, 1))
        .insn(op::jmp_imm(JmpOp::Jlt, 0u8, 10, -2))
        .insn(op::exit())
        .run()
        .unwrap_err();
    assert_eq!(err.reject, Reject::BackEdge);
    assert_eq!(err.errno(), 22);
}

/// The iterator program: construct, advance in a loop, destroy.
fn iter_loop(with_destroy: bool) -> Vec<krait_asm::Instruction> {
    let mut insns = vec![
        op::mov64_reg(1u8, RegId::FP),
        op::add64_imm(1u8, -16),
        op::mov64_imm(2u8, 0),
        op::mov64_imm(3u8, 1_000_000),
        op::call_kfunc(KfuncId::IterNumNew as i32), // 4
        op::mov64_reg(1u8, RegId::FP),              // 5: loop head
        op::add64_imm(1u8, -16),
        op::call_kfunc(KfuncId::IterNumNext as i32), // 7
        op::jmp_imm(JmpOp::Jeq, 0u8, 0, 3),          // 8 -> 12
        op::ldx(MemSize::Double, 4u8, 0u8, 0),       // 9: current element
        op::mov64_reg(6u8, 4u8),                     // 10
        op::ja(-7),                                  // 11 -> 5
        op::mov64_reg(1u8, RegId::FP),               // 12
        op::add64_imm(1u8, -16),
    ];
    if with_destroy {
        insns.push(op::call_kfunc(KfuncId::IterNumDestroy as i32));
    } else {
        insns.push(op::mov64_imm(5u8, 0));
    }
    insns.push(op::mov64_imm(0u8, 0));
    insns.push(op::exit());
    insns
}

/// An open-coded iterator over a million elements converges by state
/// equivalence at the advance site.
#[test]
fn iterator_loop_verifies() {
    let prog = ProgramBuilder::new()
        .insns(iter_loop(true))
        .run()
        .expect("iterator loop should converge");
    // Convergence means far fewer simulated instructions than iterations.
    assert!(prog.stats.insn_processed < 1000);
    assert!(prog.stats.prune_hits > 0);
}

/// Dropping the destroy call leaks the iterator's reference.
#[test]
fn iterator_without_destroy_rejected() {
    let err = ProgramBuilder::new()
        .insns(iter_loop(false))
        .run()
        .unwrap_err();
    assert_eq!(err.reject, Reject::UnreleasedReference);
    assert!(err.message.contains("Unreleased reference"), "{}", err.message);
}

/// Advancing something that is not an iterator is caught.
#[test]
fn iter_next_without_new_rejected() {
    let err = ProgramBuilder::new()
        .insn(op::mov64_reg(1u8, RegId::FP))
        .insn(op::add64_imm(1u8, -16))
        .insn(op::call_kfunc(KfuncId::IterNumNext as i32))
        .insn(op::mov64_imm(0u8, 0))
        .insn(op::exit())
        .run()
        .unwrap_err();
    assert_eq!(err.reject, Reject::BadCallArgument);
}

/// Plain stores must not overwrite a live iterator.
#[test]
fn overwriting_live_iterator_rejected() {
    let err = ProgramBuilder::new()
        .insn(op::mov64_reg(1u8, RegId::FP))
        .insn(op::add64_imm(1u8, -16))
        .insn(op::mov64_imm(2u8, 0))
        .insn(op::mov64_imm(3u8, 10))
        .insn(op::call_kfunc(KfuncId::IterNumNew as i32))
        .insn(op::st_imm(MemSize::Double, RegId::FP, -16, 0))
        .insn(op::mov64_imm(0u8, 0))
        .insn(op::exit())
        .run()
        .unwrap_err();
    assert_eq!(err.reject, Reject::BadRegisterType);
    assert!(err.message.contains("iterator"), "{}", err.message);
}

/// Nested iteration: two independent iterators converge independently.
#[test]
fn nested_iterator_loops_verify() {
    let insns = vec![
        // outer iterator at fp-16
        op::mov64_reg(1u8, RegId::FP),
        op::add64_imm(1u8, -16),
        op::mov64_imm(2u8, 0),
        op::mov64_imm(3u8, 100),
        op::call_kfunc(KfuncId::IterNumNew as i32), // 4
        // outer loop head
        op::mov64_reg(1u8, RegId::FP), // 5
        op::add64_imm(1u8, -16),
        op::call_kfunc(KfuncId::IterNumNext as i32), // 7
        op::jmp_imm(JmpOp::Jeq, 0u8, 0, 14),         // 8 -> 23
        // inner iterator at fp-32
        op::mov64_reg(1u8, RegId::FP), // 9
        op::add64_imm(1u8, -32),
        op::mov64_imm(2u8, 0),
        op::mov64_imm(3u8, 100),
        op::call_kfunc(KfuncId::IterNumNew as i32), // 13
        // inner loop head
        op::mov64_reg(1u8, RegId::FP), // 14
        op::add64_imm(1u8, -32),
        op::call_kfunc(KfuncId::IterNumNext as i32), // 16
        op::jmp_imm(JmpOp::Jeq, 0u8, 0, 1),          // 17 -> 19
        op::ja(-5),                                  // 18 -> 14
        // destroy inner
        op::mov64_reg(1u8, RegId::FP), // 19
        op::add64_imm(1u8, -32),
        op::call_kfunc(KfuncId::IterNumDestroy as i32), // 21
        op::ja(-18),                                    // 22 -> 5
        // destroy outer
        op::mov64_reg(1u8, RegId::FP), // 23
        op::add64_imm(1u8, -16),
        op::call_kfunc(KfuncId::IterNumDestroy as i32), // 25
        op::mov64_imm(0u8, 0),
        op::exit(),
    ];
    let prog = ProgramBuilder::new()
        .insns(insns)
        .run()
        .expect("nested iterators should converge");
    assert!(prog.stats.prune_hits > 0);
}

/// The simulation budget rejects state explosions that never converge.
#[test]
fn insn_budget_is_enforced() {
    let mut config = crate::ctx::VerifierConfig::privileged();
    config.insn_limit = 40;
    let mut insns = vec![op::mov64_imm(0u8, 0)];
    for _ in 0..60 {
        insns.push(op::add64_imm(0u8, 1));
    }
    insns.push(op::exit());
    let err = ProgramBuilder::new()
        .config(config)
        .insns(insns)
        .run()
        .unwrap_err();
    assert_eq!(err.reject, Reject::InsnLimit);
    assert_eq!(err.errno(), 7);
}
