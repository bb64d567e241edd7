use krait_asm::{
    op,
    JmpOp,
    MemSize,
    RegId,
};

use crate::error::Reject;
use crate::prelude::ProgramBuilder;

/// Null-checked map lookup: the guarded write sees a non-null value
/// pointer.
#[test]
fn lookup_with_null_check_verifies() {
    let mut b = ProgramBuilder::new();
    let fd = b.hash_map(4, 8);
    let prog = b
        .insn(op::mov64_imm(1u8, 0))
        .insn(op::stx(MemSize::Word, RegId::FP, -4, 1u8))
        .insn(op::mov64_reg(2u8, RegId::FP))
        .insn(op::add64_imm(2u8, -4))
        .insns(op::ld_map_fd(1u8, fd))
        .insn(op::call_helper(crate::helper::HelperId::MapLookup as i32))
        .insn(op::jmp_imm(JmpOp::Jeq, 0u8, 0, 2))
        .insn(op::st_imm(MemSize::Word, 0u8, 0, 42))
        .insn(op::mov64_imm(0u8, 0))
        .insn(op::exit())
        .run()
        .expect("guarded write should verify");
    assert_eq!(prog.used_maps, vec![0]);
    assert!(prog.stats.insn_processed > 0);
    // The key write at fp-4 is the deepest stack touch.
    assert_eq!(prog.subprogs[0].stack_depth, 4);
}

/// The same program without the null check must be rejected.
#[test]
fn lookup_without_null_check_rejected() {
    let mut b = ProgramBuilder::new();
    let fd = b.hash_map(4, 8);
    let (result, log) = b
        .insn(op::mov64_imm(1u8, 0))
        .insn(op::stx(MemSize::Word, RegId::FP, -4, 1u8))
        .insn(op::mov64_reg(2u8, RegId::FP))
        .insn(op::add64_imm(2u8, -4))
        .insns(op::ld_map_fd(1u8, fd))
        .insn(op::call_helper(crate::helper::HelperId::MapLookup as i32))
        .insn(op::st_imm(MemSize::Word, 0u8, 0, 42))
        .insn(op::mov64_imm(0u8, 0))
        .insn(op::exit())
        .run_logged();
    let err = result.unwrap_err();
    assert_eq!(err.reject, Reject::MaybeNullDeref);
    assert!(err.message.contains("may be null"), "{}", err.message);
    assert!(log.contains("may be null"));
}

/// A branch to nowhere fails structurally.
#[test]
fn jump_out_of_range_rejected() {
    let err = ProgramBuilder::new()
        .insn(op::mov64_imm(1u8, 1))
        .insn(op::jmp_imm(JmpOp::Jgt, 1u8, 0, 1000))
        .insn(op::exit())
        .run()
        .unwrap_err();
    assert_eq!(err.reject, Reject::JumpOutOfRange);
    assert_eq!(err.errno(), 22);
}

/// Storing the frame pointer into a map value leaks a kernel address.
#[test]
fn pointer_leak_into_map_rejected() {
    let mut b = ProgramBuilder::new();
    let fd = b.hash_map(4, 8);
    let err = b
        .unprivileged()
        .insn(op::mov64_imm(1u8, 0))
        .insn(op::stx(MemSize::Word, RegId::FP, -4, 1u8))
        .insn(op::mov64_reg(2u8, RegId::FP))
        .insn(op::add64_imm(2u8, -4))
        .insns(op::ld_map_fd(1u8, fd))
        .insn(op::call_helper(crate::helper::HelperId::MapLookup as i32))
        .insn(op::jmp_imm(JmpOp::Jeq, 0u8, 0, 2))
        .insn(op::stx(MemSize::Double, 0u8, 0, RegId::FP))
        .insn(op::mov64_imm(0u8, 0))
        .insn(op::exit())
        .run()
        .unwrap_err();
    assert_eq!(err.reject, Reject::PointerLeak);
    assert!(err.message.contains("leaks addr"), "{}", err.message);
}

#[test]
fn uninitialized_register_read_rejected() {
    let err = ProgramBuilder::new()
        .insn(op::mov64_imm(0u8, 0))
        .insn(op::add64_reg(0u8, 2u8))
        .insn(op::exit())
        .run()
        .unwrap_err();
    assert_eq!(err.reject, Reject::UninitRegister);
    assert!(err.message.contains("R2"), "{}", err.message);
}

#[test]
fn frame_pointer_is_read_only() {
    let err = ProgramBuilder::new()
        .insn(op::mov64_imm(10u8, 0))
        .insn(op::mov64_imm(0u8, 0))
        .insn(op::exit())
        .run()
        .unwrap_err();
    assert_eq!(err.reject, Reject::BadRegisterType);
}

#[test]
fn division_by_constant_zero_rejected() {
    let err = ProgramBuilder::new()
        .insn(op::mov64_imm(0u8, 10))
        .insn(op::alu64_imm(krait_asm::AluOp::Div, 0u8, 0))
        .insn(op::exit())
        .run()
        .unwrap_err();
    assert_eq!(err.reject, Reject::DivByZero);
    assert_eq!(err.insn_idx, 1);
}

#[test]
fn oversized_shift_rejected() {
    let err = ProgramBuilder::new()
        .insn(op::mov64_imm(0u8, 1))
        .insn(op::alu32_imm(krait_asm::AluOp::Lsh, 0u8, 32))
        .insn(op::exit())
        .run()
        .unwrap_err();
    assert_eq!(err.reject, Reject::ShiftOutOfRange);
}

#[test]
fn exit_needs_a_return_value() {
    let err = ProgramBuilder::new().insn(op::exit()).run().unwrap_err();
    assert_eq!(err.reject, Reject::UninitRegister);
}

/// Packet-edit programs return verdict codes only.
#[test]
fn return_range_enforced() {
    let err = ProgramBuilder::new()
        .kind(crate::ctx::ProgramKind::PacketEdit)
        .insn(op::mov64_imm(0u8, 7))
        .insn(op::exit())
        .run()
        .unwrap_err();
    assert_eq!(err.reject, Reject::ValueOutOfRange);
}

/// A dynamically dead body is neutralized in the rewritten stream.
#[test]
fn dead_code_is_neutralized() {
    let prog = ProgramBuilder::new()
        .insn(op::mov64_imm(0u8, 0))
        .insn(op::jmp_imm(JmpOp::Jeq, 0u8, 0, 1))
        .insn(op::mov64_imm(0u8, 1))
        .insn(op::exit())
        .run()
        .expect("decided branch should verify");
    assert_eq!(prog.insns[2], op::ja(0));
    assert!(prog.aux[2].seen);
}

/// Loads from frozen read-only map data fold to constants; the branch on
/// the folded value is decided statically.
#[test]
fn frozen_map_load_folds_constant() {
    let mut b = ProgramBuilder::new();
    let fd = b.map(super::frozen_array(vec![7, 0, 0, 0, 0, 0, 0, 0]));
    let prog = b
        .insns(op::ld_map_value(1u8, fd, 0))
        .insn(op::ldx(MemSize::Word, 0u8, 1u8, 0))
        // 7 != 9, so the store below is dead.
        .insn(op::jmp_imm(JmpOp::Jne, 0u8, 9, 1))
        .insn(op::st_imm(MemSize::Word, 1u8, 0, 1))
        .insn(op::mov64_imm(0u8, 0))
        .insn(op::exit())
        .run()
        .expect("folded constant should verify");
    assert!(prog.aux[2].const_fold.is_some());
    assert_eq!(prog.insns[4], op::ja(0));
}

/// Reads of the context resolve through the program kind's table.
#[test]
fn ctx_reads_and_narrow_loads() {
    let prog = ProgramBuilder::new()
        .insn(op::ldx(MemSize::Word, 0u8, 1u8, 0))
        .insn(op::ldx(MemSize::Byte, 2u8, 1u8, 1))
        .insn(op::exit())
        .run()
        .expect("context reads should verify");
    assert_eq!(prog.stats.insn_processed, 3);
}

#[test]
fn ctx_write_rejected_for_readonly_field() {
    let err = ProgramBuilder::new()
        .insn(op::mov64_imm(0u8, 0))
        .insn(op::stx(MemSize::Word, 1u8, 0, 0u8))
        .insn(op::exit())
        .run()
        .unwrap_err();
    assert_eq!(err.reject, Reject::OutOfBounds);
}

/// Unprivileged runs reject reading stack bytes that were never written.
#[test]
fn uninit_stack_read_rejected_unprivileged() {
    let err = ProgramBuilder::new()
        .unprivileged()
        .insn(op::ldx(MemSize::Double, 0u8, RegId::FP, -8))
        .insn(op::exit())
        .run()
        .unwrap_err();
    assert_eq!(err.reject, Reject::UninitStack);
}

/// Spilling and filling preserves the register's abstract state.
#[test]
fn spill_fill_roundtrip() {
    let prog = ProgramBuilder::new()
        .insn(op::mov64_imm(3u8, 41))
        .insn(op::stx(MemSize::Double, RegId::FP, -8, 3u8))
        .insn(op::ldx(MemSize::Double, 0u8, RegId::FP, -8))
        // The filled value is the known constant 41.
        .insn(op::jmp_imm(JmpOp::Jne, 0u8, 41, 1))
        .insn(op::mov64_imm(0u8, 0))
        .insn(op::exit())
        .run()
        .expect("spill/fill should verify");
    // The never-taken branch body was neutralized.
    assert_eq!(prog.insns[4], op::mov64_imm(0u8, 0));
}

/// A spill that is not slot-aligned cannot restore a register.
#[test]
fn misaligned_spill_rejected() {
    let err = ProgramBuilder::new()
        .unprivileged()
        .insn(op::mov64_reg(3u8, RegId::FP))
        .insn(op::stx(MemSize::Double, RegId::FP, -12, 3u8))
        .insn(op::mov64_imm(0u8, 0))
        .insn(op::exit())
        .run()
        .unwrap_err();
    assert_eq!(err.reject, Reject::MisalignedAccess);
}

/// A pointer only spills as a whole word; partial stores would leak it.
#[test]
fn partial_pointer_spill_rejected() {
    let err = ProgramBuilder::new()
        .unprivileged()
        .insn(op::mov64_reg(3u8, RegId::FP))
        .insn(op::stx(MemSize::Word, RegId::FP, -4, 3u8))
        .insn(op::mov64_imm(0u8, 0))
        .insn(op::exit())
        .run()
        .unwrap_err();
    assert_eq!(err.reject, Reject::BadSpill);
}
