use krait_asm::{
    op,
    AluOp,
    JmpOp,
    MemSize,
    RegId,
};

use crate::error::Reject;
use crate::prelude::ProgramBuilder;

/// Builds the common prologue: a null-checked lookup leaving the value
/// pointer in r0 and an unknown scalar loaded from it in r3.
fn lookup_prologue(b: &mut ProgramBuilder) -> Vec<krait_asm::Instruction> {
    let fd = b.hash_map(4, 8);
    let mut insns = vec![
        op::mov64_imm(1u8, 0),
        op::stx(MemSize::Word, RegId::FP, -4, 1u8),
        op::mov64_reg(2u8, RegId::FP),
        op::add64_imm(2u8, -4),
    ];
    insns.extend(op::ld_map_fd(1u8, fd));
    insns.push(op::call_helper(crate::helper::HelperId::MapLookup as i32));
    insns
}

/// A branch-checked scalar indexes into the map value safely.
#[test]
fn bounded_variable_offset_verifies() {
    let mut b = ProgramBuilder::new();
    let prologue = lookup_prologue(&mut b);
    let prog = b
        .insns(prologue)
        .insn(op::jmp_imm(JmpOp::Jeq, 0u8, 0, 5)) // 7 -> 13 exit
        .insn(op::ldx(MemSize::Word, 3u8, 0u8, 0)) // 8
        .insn(op::jmp_imm(JmpOp::Jgt, 3u8, 4, 2)) // 9 -> 12
        .insn(op::add64_reg(0u8, 3u8)) // 10: off in [0, 4]
        .insn(op::st_imm(MemSize::Byte, 0u8, 0, 1)) // 11: bytes [0,5) of 8
        .insn(op::mov64_imm(0u8, 0)) // 12
        .insn(op::exit()) // 13
        .run()
        .expect("bounded index should verify");
    assert!(prog.stats.insn_processed > 10);
}

/// Without the range check, the minimum offset may be negative.
#[test]
fn unbounded_variable_offset_rejected() {
    let mut b = ProgramBuilder::new();
    let prologue = lookup_prologue(&mut b);
    let err = b
        .insns(prologue)
        .insn(op::jmp_imm(JmpOp::Jeq, 0u8, 0, 3)) // 7 -> 11
        .insn(op::ldx(MemSize::Word, 3u8, 0u8, 0)) // 8
        .insn(op::add64_reg(0u8, 3u8)) // 9: unbounded
        .insn(op::st_imm(MemSize::Byte, 0u8, 0, 1)) // 10
        .insn(op::mov64_imm(0u8, 0)) // 11
        .insn(op::exit()) // 12
        .run()
        .unwrap_err();
    // The arithmetic itself is rejected: the offset has no usable bound.
    assert_eq!(err.reject, Reject::ValueOutOfRange);
}

/// Masking with AND bounds the index through the known-bits domain.
#[test]
fn tnum_mask_bounds_the_index() {
    let mut b = ProgramBuilder::new();
    let prologue = lookup_prologue(&mut b);
    let prog = b
        .insns(prologue)
        .insn(op::jmp_imm(JmpOp::Jeq, 0u8, 0, 4)) // 7 -> 12
        .insn(op::ldx(MemSize::Word, 3u8, 0u8, 0)) // 8
        .insn(op::alu64_imm(AluOp::And, 3u8, 7)) // 9: [0, 7]
        .insn(op::add64_reg(0u8, 3u8)) // 10
        .insn(op::st_imm(MemSize::Byte, 0u8, 0, 1)) // 11: bytes [0,8) of 8
        .insn(op::mov64_imm(0u8, 0)) // 12
        .insn(op::exit()) // 13
        .run()
        .expect("masked index should verify");
    assert!(prog.stats.insn_processed > 10);
}

/// 32-bit comparisons refine the subregister view, which carries into the
/// 64-bit bound after zero-extension.
#[test]
fn jmp32_refinement_bounds_access() {
    let mut b = ProgramBuilder::new();
    let prologue = lookup_prologue(&mut b);
    let prog = b
        .insns(prologue)
        .insn(op::jmp_imm(JmpOp::Jeq, 0u8, 0, 5)) // 7 -> 13
        .insn(op::ldx(MemSize::Word, 3u8, 0u8, 0)) // 8
        .insn(op::mov32_reg(3u8, 3u8)) // 9: zero-extend
        .insn(op::jmp32_imm(JmpOp::Jgt, 3u8, 4, 2)) // 10 -> 13
        .insn(op::add64_reg(0u8, 3u8)) // 11
        .insn(op::st_imm(MemSize::Byte, 0u8, 0, 1)) // 12
        .insn(op::mov64_imm(0u8, 0)) // 13
        .insn(op::exit()) // 14
        .run();
    prog.expect("32-bit refinement should verify");
}

/// Same-id scalar copies share branch refinements.
#[test]
fn equal_scalars_share_refinement() {
    let mut b = ProgramBuilder::new();
    let prologue = lookup_prologue(&mut b);
    let prog = b
        .insns(prologue)
        .insn(op::jmp_imm(JmpOp::Jeq, 0u8, 0, 6)) // 7 -> 14
        .insn(op::ldx(MemSize::Word, 3u8, 0u8, 0)) // 8
        .insn(op::mov64_reg(4u8, 3u8)) // 9: linked copy
        .insn(op::jmp_imm(JmpOp::Jgt, 3u8, 4, 3)) // 10: bound r3 -> 14
        // r4 carries the same bound through the shared id.
        .insn(op::add64_reg(0u8, 4u8)) // 11
        .insn(op::st_imm(MemSize::Byte, 0u8, 0, 1)) // 12
        .insn(op::mov64_imm(0u8, 0)) // 13
        .insn(op::exit()) // 14
        .run();
    prog.expect("shared refinement should verify");
}

/// Unsigned/signed view interplay: a signed check alone does not bound the
/// unsigned offset.
#[test]
fn signed_check_alone_is_insufficient() {
    let mut b = ProgramBuilder::new();
    let prologue = lookup_prologue(&mut b);
    let err = b
        .insns(prologue)
        .insn(op::jmp_imm(JmpOp::Jeq, 0u8, 0, 4)) // 7 -> 12
        .insn(op::ldx(MemSize::Word, 3u8, 0u8, 0)) // 8
        .insn(op::jmp_imm(JmpOp::Jsgt, 3u8, 4, 2)) // 9: smax <= 4, smin still < 0
        .insn(op::add64_reg(0u8, 3u8)) // 10
        .insn(op::st_imm(MemSize::Byte, 0u8, 0, 1)) // 11
        .insn(op::mov64_imm(0u8, 0)) // 12
        .insn(op::exit()) // 13
        .run()
        .unwrap_err();
    assert_eq!(err.reject, Reject::ValueOutOfRange);
}

/// The packet-end comparison widens the packet range on the proven side.
#[test]
fn packet_range_widening() {
    let prog = ProgramBuilder::new()
        .kind(crate::ctx::ProgramKind::PacketEdit)
        .insn(op::ldx(MemSize::Word, 2u8, 1u8, 76)) // data
        .insn(op::ldx(MemSize::Word, 3u8, 1u8, 80)) // data_end
        .insn(op::mov64_reg(4u8, 2u8))
        .insn(op::add64_imm(4u8, 4))
        .insn(op::jmp_reg(JmpOp::Jgt, 4u8, 3u8, 1)) // data+4 > end -> out
        .insn(op::ldx(MemSize::Word, 5u8, 2u8, 0)) // 4 bytes proven
        .insn(op::mov64_imm(0u8, 0))
        .insn(op::exit())
        .run();
    prog.expect("widened packet access should verify");
}

/// Without the end comparison the packet range stays zero.
#[test]
fn packet_access_without_proof_rejected() {
    let err = ProgramBuilder::new()
        .kind(crate::ctx::ProgramKind::PacketEdit)
        .insn(op::ldx(MemSize::Word, 2u8, 1u8, 76))
        .insn(op::ldx(MemSize::Word, 0u8, 2u8, 0))
        .insn(op::mov64_imm(0u8, 0))
        .insn(op::exit())
        .run()
        .unwrap_err();
    assert_eq!(err.reject, Reject::OutOfBounds);
    assert!(err.message.contains("packet"), "{}", err.message);
}
