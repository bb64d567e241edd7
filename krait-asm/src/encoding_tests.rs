use strum::IntoEnumIterator;
use test_case::test_case;

use crate::op;
use crate::opcode::{
    AluOp,
    AtomicOp,
    Class,
    JmpOp,
    MemSize,
    Mode,
    PseudoCall,
    PseudoLd,
    SrcKind,
};
use crate::{
    Instruction,
    RegId,
};

#[test]
fn raw_roundtrip() {
    let insn = op::jmp_imm(JmpOp::Jsgt, 3u8, -7, 12);
    let raw = insn.to_raw();
    assert_eq!(Instruction::from_raw(raw), insn);
    assert_eq!(Instruction::from_bytes(insn.to_bytes()), insn);
}

#[test]
fn field_extraction() {
    let insn = Instruction::new(0x61, 2, 10, -8, 0);
    assert_eq!(insn.class(), Class::Ldx);
    assert_eq!(insn.mode(), Some(Mode::Mem));
    assert_eq!(insn.mem_size(), MemSize::Word);
    assert_eq!(insn.dst(), Some(RegId::R2));
    assert_eq!(insn.src(), Some(RegId::FP));
    assert_eq!(insn.off(), -8);
}

#[test]
fn register_fields_are_masked() {
    let insn = Instruction::new(0x07, 0x1f, 0x2f, 0, 0);
    assert_eq!(insn.dst_field(), 0x0f);
    assert_eq!(insn.src_field(), 0x0f);
    assert_eq!(insn.dst(), None);
    assert_eq!(insn.src(), None);
}

#[test]
fn class_decoding_is_total() {
    for opcode in 0..=u8::MAX {
        let _ = Class::from_opcode(opcode);
    }
}

#[test]
fn alu_ops_roundtrip() {
    for alu_op in AluOp::iter() {
        let insn = op::alu64_reg(alu_op, 1u8, 2u8);
        assert_eq!(insn.class(), Class::Alu64);
        assert_eq!(insn.alu_op(), Some(alu_op));
        assert_eq!(insn.src_kind(), SrcKind::Reg);

        let insn = op::alu32_imm(alu_op, 1u8, -1);
        assert_eq!(insn.class(), Class::Alu32);
        assert_eq!(insn.alu_op(), Some(alu_op));
        assert_eq!(insn.src_kind(), SrcKind::Imm);
    }
}

#[test]
fn jmp_ops_roundtrip() {
    for jmp_op in JmpOp::iter() {
        let insn = op::jmp_reg(jmp_op, 1u8, 2u8, 4);
        assert_eq!(insn.class(), Class::Jmp);
        assert_eq!(insn.jmp_op(), Some(jmp_op));

        let insn = op::jmp32_imm(jmp_op, 1u8, 7, -4);
        assert_eq!(insn.class(), Class::Jmp32);
        assert_eq!(insn.jmp_op(), Some(jmp_op));
    }
}

#[test]
fn atomic_ops_roundtrip() {
    for atomic_op in AtomicOp::iter() {
        let insn = op::atomic(MemSize::Double, atomic_op, 1u8, -8, 2u8);
        assert_eq!(insn.class(), Class::Stx);
        assert_eq!(insn.mode(), Some(Mode::Atomic));
        assert_eq!(AtomicOp::from_imm(insn.imm()), Some(atomic_op));
    }
}

#[test_case(JmpOp::Jgt, JmpOp::Jle; "unsigned gt")]
#[test_case(JmpOp::Jsge, JmpOp::Jslt; "signed ge")]
#[test_case(JmpOp::Jeq, JmpOp::Jne; "equality")]
fn negation(op: JmpOp, negated: JmpOp) {
    assert_eq!(op.negated(), negated);
    assert_eq!(negated.negated(), op);
}

#[test_case(JmpOp::Jgt, JmpOp::Jlt)]
#[test_case(JmpOp::Jsle, JmpOp::Jsge)]
#[test_case(JmpOp::Jset, JmpOp::Jset)]
fn swapped_operands(op: JmpOp, swapped: JmpOp) {
    assert_eq!(op.swapped(), swapped);
}

#[test]
fn ld_imm64_shape() {
    let [lo, hi] = op::ld_imm64(1u8, 0xdead_beef_0bad_cafe);
    assert!(lo.is_ld_imm64());
    assert_eq!(lo.pseudo_ld(), Some(PseudoLd::Raw));
    assert_eq!(lo.imm() as u32, 0x0bad_cafe);
    assert_eq!(hi.imm() as u32, 0xdead_beef);

    let [lo, _] = op::ld_map_fd(1u8, 5);
    assert_eq!(lo.pseudo_ld(), Some(PseudoLd::MapFd));
    assert_eq!(lo.imm(), 5);
}

#[test]
fn call_pseudo_sources() {
    assert_eq!(op::call_helper(1).pseudo_call(), Some(PseudoCall::Helper));
    assert_eq!(op::call_rel(3).pseudo_call(), Some(PseudoCall::Subprog));
    assert_eq!(op::call_kfunc(7).pseudo_call(), Some(PseudoCall::Kfunc));
    assert!(op::exit().is_exit());
    assert!(!op::exit().is_call());
}

#[test]
fn display_smoke() {
    assert_eq!(op::mov64_imm(0u8, 7).to_string(), "mov r0, 7");
    assert_eq!(op::add64_reg(1u8, 2u8).to_string(), "add r1, r2");
    assert_eq!(op::exit().to_string(), "exit");
    assert_eq!(op::ja(-2).to_string(), "ja -2");
    assert_eq!(
        op::ldx(MemSize::Word, 1u8, 10u8, -4).to_string(),
        "ldxw r1, [r10-4]"
    );
    assert_eq!(
        op::jmp_imm(JmpOp::Jeq, 0u8, 0, 5).to_string(),
        "jeq r0, 0, +5"
    );
}
