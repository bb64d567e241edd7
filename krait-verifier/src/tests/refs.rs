use krait_asm::{
    op,
    JmpOp,
    MemSize,
    RegId,
};

use crate::error::Reject;
use crate::helper::HelperId;
use crate::kfunc::KfuncId;
use crate::ktype::{
    Ktype,
    KtypeField,
    KtypeFieldKind,
    KtypeKind,
};
use crate::map::{
    MapDef,
    MapKind,
};
use crate::prelude::ProgramBuilder;

fn ringbuf() -> MapDef {
    MapDef::plain("events", MapKind::Ringbuf, 0, 0)
}

/// Reserve, null-check, write, submit: the canonical reference life cycle.
#[test]
fn ringbuf_reserve_submit_verifies() {
    let mut b = ProgramBuilder::new();
    let fd = b.map(ringbuf());
    b.insns(op::ld_map_fd(1u8, fd)) // 0,1
        .insn(op::mov64_imm(2u8, 8)) // 2: size
        .insn(op::mov64_imm(3u8, 0)) // 3: flags
        .insn(op::call_helper(HelperId::RingbufReserve as i32)) // 4
        .insn(op::jmp_imm(JmpOp::Jeq, 0u8, 0, 4)) // 5 -> 10
        .insn(op::st_imm(MemSize::Double, 0u8, 0, 42)) // 6
        .insn(op::mov64_reg(1u8, 0u8)) // 7
        .insn(op::mov64_imm(2u8, 0)) // 8
        .insn(op::call_helper(HelperId::RingbufSubmit as i32)) // 9
        .insn(op::mov64_imm(0u8, 0)) // 10
        .insn(op::exit()) // 11
        .run()
        .expect("reserve/submit should verify");
}

/// Dropping the submit leaks the reservation.
#[test]
fn ringbuf_leak_rejected() {
    let mut b = ProgramBuilder::new();
    let fd = b.map(ringbuf());
    let err = b
        .insns(op::ld_map_fd(1u8, fd))
        .insn(op::mov64_imm(2u8, 8))
        .insn(op::mov64_imm(3u8, 0))
        .insn(op::call_helper(HelperId::RingbufReserve as i32))
        .insn(op::jmp_imm(JmpOp::Jeq, 0u8, 0, 1)) // null check, no submit
        .insn(op::mov64_imm(0u8, 0))
        .insn(op::mov64_imm(0u8, 0))
        .insn(op::exit())
        .run()
        .unwrap_err();
    assert_eq!(err.reject, Reject::UnreleasedReference);
    assert!(err.message.contains("Unreleased reference"), "{}", err.message);
}

/// The failed-allocation branch releases the pending reference by itself.
#[test]
fn null_branch_releases_reference() {
    let mut b = ProgramBuilder::new();
    let fd = b.map(ringbuf());
    b.insns(op::ld_map_fd(1u8, fd)) // 0,1
        .insn(op::mov64_imm(2u8, 8)) // 2
        .insn(op::mov64_imm(3u8, 0)) // 3
        .insn(op::call_helper(HelperId::RingbufReserve as i32)) // 4
        .insn(op::jmp_imm(JmpOp::Jne, 0u8, 0, 2)) // 5: non-null -> 8
        .insn(op::mov64_imm(0u8, 0)) // 6: null branch exits clean
        .insn(op::exit()) // 7
        .insn(op::mov64_reg(1u8, 0u8)) // 8
        .insn(op::mov64_imm(2u8, 0)) // 9
        .insn(op::call_helper(HelperId::RingbufSubmit as i32)) // 10
        .insn(op::mov64_imm(0u8, 0)) // 11
        .insn(op::exit()) // 12
        .run()
        .expect("null branch needs no release");
}

/// Submitting twice releases a reference that is no longer held.
#[test]
fn double_release_rejected() {
    let mut b = ProgramBuilder::new();
    let fd = b.map(ringbuf());
    let err = b
        .insns(op::ld_map_fd(1u8, fd)) // 0,1
        .insn(op::mov64_imm(2u8, 8)) // 2
        .insn(op::mov64_imm(3u8, 0)) // 3
        .insn(op::call_helper(HelperId::RingbufReserve as i32)) // 4
        .insn(op::jmp_imm(JmpOp::Jeq, 0u8, 0, 5)) // 5 -> 11
        .insn(op::mov64_reg(6u8, 0u8)) // 6: keep a copy
        .insn(op::mov64_reg(1u8, 0u8)) // 7
        .insn(op::mov64_imm(2u8, 0)) // 8
        .insn(op::call_helper(HelperId::RingbufSubmit as i32)) // 9
        .insn(op::mov64_reg(1u8, 6u8)) // 10: the copy is dead now
        .insn(op::mov64_imm(0u8, 0)) // 11
        .insn(op::exit()) // 12
        .run()
        .unwrap_err();
    // The released reference invalidated every copy.
    assert_eq!(err.reject, Reject::UninitRegister);
    assert_eq!(err.insn_idx, 10);
}

fn locked_map_prologue(b: &mut ProgramBuilder) -> Vec<krait_asm::Instruction> {
    let fd = b.map(super::lockable_map());
    let mut insns = vec![
        op::mov64_imm(1u8, 0),
        op::stx(MemSize::Word, RegId::FP, -4, 1u8),
        op::mov64_reg(2u8, RegId::FP),
        op::add64_imm(2u8, -4),
    ];
    insns.extend(op::ld_map_fd(1u8, fd));
    insns.push(op::call_helper(HelperId::MapLookup as i32));
    insns.push(op::jmp_imm(JmpOp::Jne, 0u8, 0, 2)); // 7: non-null -> 10
    insns.push(op::mov64_imm(0u8, 0)); // 8
    insns.push(op::exit()); // 9
    insns
}

/// Lock, store under the lock, unlock.
#[test]
fn spin_lock_roundtrip_verifies() {
    let mut b = ProgramBuilder::new();
    let prologue = locked_map_prologue(&mut b);
    b.insns(prologue)
        .insn(op::mov64_reg(6u8, 0u8)) // 10
        .insn(op::mov64_reg(1u8, 6u8)) // 11
        .insn(op::call_helper(HelperId::SpinLock as i32)) // 12
        .insn(op::st_imm(MemSize::Word, 6u8, 4, 1)) // 13: past the lock word
        .insn(op::mov64_reg(1u8, 6u8)) // 14
        .insn(op::call_helper(HelperId::SpinUnlock as i32)) // 15
        .insn(op::mov64_imm(0u8, 0)) // 16
        .insn(op::exit()) // 17
        .run()
        .expect("lock/unlock should verify");
}

/// Taking the lock twice deadlocks.
#[test]
fn double_lock_rejected() {
    let mut b = ProgramBuilder::new();
    let prologue = locked_map_prologue(&mut b);
    let err = b
        .insns(prologue)
        .insn(op::mov64_reg(6u8, 0u8)) // 10
        .insn(op::mov64_reg(1u8, 6u8)) // 11
        .insn(op::call_helper(HelperId::SpinLock as i32)) // 12
        .insn(op::mov64_reg(1u8, 6u8)) // 13
        .insn(op::call_helper(HelperId::SpinLock as i32)) // 14
        .insn(op::mov64_imm(0u8, 0)) // 15
        .insn(op::exit()) // 16
        .run()
        .unwrap_err();
    assert_eq!(err.reject, Reject::DoubleLock);
}

/// Returning with the lock held pins the cpu.
#[test]
fn exit_with_lock_held_rejected() {
    let mut b = ProgramBuilder::new();
    let prologue = locked_map_prologue(&mut b);
    let err = b
        .insns(prologue)
        .insn(op::mov64_reg(1u8, 0u8)) // 10
        .insn(op::call_helper(HelperId::SpinLock as i32)) // 11
        .insn(op::mov64_imm(0u8, 0)) // 12
        .insn(op::exit()) // 13
        .run()
        .unwrap_err();
    assert_eq!(err.reject, Reject::DoubleLock);
    assert!(err.message.contains("held at exit"), "{}", err.message);
}

/// Helpers outside the allowlist may not run under the lock.
#[test]
fn helper_call_under_lock_rejected() {
    let mut b = ProgramBuilder::new();
    let prologue = locked_map_prologue(&mut b);
    let err = b
        .insns(prologue)
        .insn(op::mov64_reg(1u8, 0u8)) // 10
        .insn(op::call_helper(HelperId::SpinLock as i32)) // 11
        .insn(op::call_helper(HelperId::KtimeGetNs as i32)) // 12
        .insn(op::mov64_imm(0u8, 0)) // 13
        .insn(op::exit()) // 14
        .run()
        .unwrap_err();
    assert_eq!(err.reject, Reject::CallWithLockHeld);
}

/// RCU brackets nest neither way.
#[test]
fn rcu_bracket_discipline() {
    let prog = ProgramBuilder::new()
        .insn(op::call_kfunc(KfuncId::RcuReadLock as i32))
        .insn(op::call_kfunc(KfuncId::RcuReadUnlock as i32))
        .insn(op::mov64_imm(0u8, 0))
        .insn(op::exit())
        .run();
    prog.expect("balanced bracket should verify");

    let err = ProgramBuilder::new()
        .insn(op::call_kfunc(KfuncId::RcuReadLock as i32))
        .insn(op::call_kfunc(KfuncId::RcuReadLock as i32))
        .insn(op::mov64_imm(0u8, 0))
        .insn(op::exit())
        .run()
        .unwrap_err();
    assert_eq!(err.reject, Reject::BadRcuBracket);

    let err = ProgramBuilder::new()
        .insn(op::call_kfunc(KfuncId::RcuReadLock as i32))
        .insn(op::mov64_imm(0u8, 0))
        .insn(op::exit())
        .run()
        .unwrap_err();
    assert_eq!(err.reject, Reject::BadRcuBracket);
    assert!(err.message.contains("open at exit"), "{}", err.message);
}

fn node_type(b: &mut ProgramBuilder) -> crate::ktype::KtypeId {
    b.ktypes().register(Ktype {
        name: "work_item".into(),
        size: 16,
        kind: KtypeKind::Struct {
            fields: vec![KtypeField {
                name: "value".into(),
                offset: 0,
                size: 8,
                kind: KtypeFieldKind::Scalar,
            }],
        },
    })
}

/// Allocate, null-check, write, free.
#[test]
fn obj_new_drop_roundtrip() {
    let mut b = ProgramBuilder::new();
    let ty = node_type(&mut b);
    b.insn(op::mov64_imm(1u8, ty.0 as i32)) // 0
        .insn(op::call_kfunc(KfuncId::ObjNew as i32)) // 1
        .insn(op::jmp_imm(JmpOp::Jeq, 0u8, 0, 4)) // 2 -> 7
        .insn(op::st_imm(MemSize::Double, 0u8, 0, 5)) // 3
        .insn(op::mov64_reg(1u8, 0u8)) // 4
        .insn(op::call_kfunc(KfuncId::ObjDrop as i32)) // 5
        .insn(op::mov64_imm(0u8, 0)) // 6
        .insn(op::exit()) // 7... reached from 2 with r0 = 0
        .run()
        .expect("obj_new/obj_drop should verify");
}

/// A local dynptr wraps stack memory and feeds a read back onto the
/// stack.
#[test]
fn dynptr_from_mem_roundtrip() {
    ProgramBuilder::new()
        .insn(op::st_imm(MemSize::Double, RegId::FP, -8, 1)) // source bytes
        .insn(op::mov64_reg(1u8, RegId::FP))
        .insn(op::add64_imm(1u8, -8))
        .insn(op::mov64_imm(2u8, 8)) // size
        .insn(op::mov64_imm(3u8, 0)) // flags
        .insn(op::mov64_reg(4u8, RegId::FP))
        .insn(op::add64_imm(4u8, -24)) // dynptr slots
        .insn(op::call_helper(HelperId::DynptrFromMem as i32))
        .insn(op::mov64_reg(1u8, RegId::FP))
        .insn(op::add64_imm(1u8, -32)) // read destination
        .insn(op::mov64_imm(2u8, 8))
        .insn(op::mov64_reg(3u8, RegId::FP))
        .insn(op::add64_imm(3u8, -24))
        .insn(op::mov64_imm(4u8, 0)) // offset
        .insn(op::mov64_imm(5u8, 0)) // flags
        .insn(op::call_helper(HelperId::DynptrRead as i32))
        .insn(op::mov64_imm(0u8, 0))
        .insn(op::exit())
        .run()
        .expect("local dynptr round trip should verify");
}

/// A ring-buffer dynptr reservation carries a reference.
#[test]
fn dynptr_reservation_leak_rejected() {
    let mut b = ProgramBuilder::new();
    let fd = b.map(ringbuf());
    let err = b
        .insns(op::ld_map_fd(1u8, fd))
        .insn(op::mov64_imm(2u8, 8))
        .insn(op::mov64_imm(3u8, 0))
        .insn(op::mov64_reg(4u8, RegId::FP))
        .insn(op::add64_imm(4u8, -16))
        .insn(op::call_helper(HelperId::RingbufReserveDynptr as i32))
        .insn(op::mov64_imm(0u8, 0))
        .insn(op::exit())
        .run()
        .unwrap_err();
    assert_eq!(err.reject, Reject::UnreleasedReference);
}

/// Forgetting the drop leaks the allocation.
#[test]
fn obj_leak_rejected() {
    let mut b = ProgramBuilder::new();
    let ty = node_type(&mut b);
    let err = b
        .insn(op::mov64_imm(1u8, ty.0 as i32))
        .insn(op::call_kfunc(KfuncId::ObjNew as i32))
        .insn(op::jmp_imm(JmpOp::Jeq, 0u8, 0, 1))
        .insn(op::mov64_imm(0u8, 0))
        .insn(op::mov64_imm(0u8, 0))
        .insn(op::exit())
        .run()
        .unwrap_err();
    assert_eq!(err.reject, Reject::UnreleasedReference);
}
