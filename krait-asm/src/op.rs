//! Constructor shorthands for building programs.
//!
//! Mirrors the mnemonic surface of the instruction set one function per
//! shape, so tests and tools can write programs without touching the wire
//! encoding. Register arguments accept either [`RegId`] or a plain `u8`
//! (which panics when out of range, as misuse is a bug in the caller).

use crate::insn::Instruction;
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
use crate::reg::RegId;

/// Types accepted wherever a register operand is expected.
pub trait CheckRegId: Copy {
    /// Convert into a checked register id.
    fn check(self) -> RegId;
}

impl CheckRegId for RegId {
    fn check(self) -> RegId {
        self
    }
}

impl CheckRegId for u8 {
    fn check(self) -> RegId {
        RegId::new(self).expect("register id out of range")
    }
}

const fn alu_opcode(class: Class, op: AluOp, src: SrcKind) -> u8 {
    class as u8 | op as u8 | src as u8
}

const fn jmp_opcode(class: Class, op: JmpOp, src: SrcKind) -> u8 {
    class as u8 | op as u8 | src as u8
}

const fn mem_opcode(class: Class, size: MemSize, mode: Mode) -> u8 {
    class as u8 | size as u8 | mode as u8
}

/// 64-bit ALU operation with a register source.
pub fn alu64_reg(op: AluOp, dst: impl CheckRegId, src: impl CheckRegId) -> Instruction {
    Instruction::new(
        alu_opcode(Class::Alu64, op, SrcKind::Reg),
        dst.check().val(),
        src.check().val(),
        0,
        0,
    )
}

/// 64-bit ALU operation with an immediate source.
pub fn alu64_imm(op: AluOp, dst: impl CheckRegId, imm: i32) -> Instruction {
    Instruction::new(
        alu_opcode(Class::Alu64, op, SrcKind::Imm),
        dst.check().val(),
        0,
        0,
        imm,
    )
}

/// 32-bit ALU operation with a register source.
pub fn alu32_reg(op: AluOp, dst: impl CheckRegId, src: impl CheckRegId) -> Instruction {
    Instruction::new(
        alu_opcode(Class::Alu32, op, SrcKind::Reg),
        dst.check().val(),
        src.check().val(),
        0,
        0,
    )
}

/// 32-bit ALU operation with an immediate source.
pub fn alu32_imm(op: AluOp, dst: impl CheckRegId, imm: i32) -> Instruction {
    Instruction::new(
        alu_opcode(Class::Alu32, op, SrcKind::Imm),
        dst.check().val(),
        0,
        0,
        imm,
    )
}

/// `dst = imm`, 64-bit.
pub fn mov64_imm(dst: impl CheckRegId, imm: i32) -> Instruction {
    alu64_imm(AluOp::Mov, dst, imm)
}

/// `dst = src`, 64-bit.
pub fn mov64_reg(dst: impl CheckRegId, src: impl CheckRegId) -> Instruction {
    alu64_reg(AluOp::Mov, dst, src)
}

/// `dst = imm`, 32-bit, zero-extending into the upper half.
pub fn mov32_imm(dst: impl CheckRegId, imm: i32) -> Instruction {
    alu32_imm(AluOp::Mov, dst, imm)
}

/// `dst = src`, 32-bit, zero-extending into the upper half.
pub fn mov32_reg(dst: impl CheckRegId, src: impl CheckRegId) -> Instruction {
    alu32_reg(AluOp::Mov, dst, src)
}

/// Sign-extending move of the low `bits` (8, 16, or 32) of `src`.
pub fn mov64_sx(dst: impl CheckRegId, src: impl CheckRegId, bits: u8) -> Instruction {
    Instruction::new(
        alu_opcode(Class::Alu64, AluOp::Mov, SrcKind::Reg),
        dst.check().val(),
        src.check().val(),
        bits as i16,
        0,
    )
}

/// `dst += imm`, 64-bit.
pub fn add64_imm(dst: impl CheckRegId, imm: i32) -> Instruction {
    alu64_imm(AluOp::Add, dst, imm)
}

/// `dst += src`, 64-bit.
pub fn add64_reg(dst: impl CheckRegId, src: impl CheckRegId) -> Instruction {
    alu64_reg(AluOp::Add, dst, src)
}

/// Load from `[src + off]` into `dst`.
pub fn ldx(size: MemSize, dst: impl CheckRegId, src: impl CheckRegId, off: i16) -> Instruction {
    Instruction::new(
        mem_opcode(Class::Ldx, size, Mode::Mem),
        dst.check().val(),
        src.check().val(),
        off,
        0,
    )
}

/// Sign-extending load from `[src + off]` into `dst`.
pub fn ldx_sx(
    size: MemSize,
    dst: impl CheckRegId,
    src: impl CheckRegId,
    off: i16,
) -> Instruction {
    Instruction::new(
        mem_opcode(Class::Ldx, size, Mode::MemSx),
        dst.check().val(),
        src.check().val(),
        off,
        0,
    )
}

/// Store `src` into `[dst + off]`.
pub fn stx(size: MemSize, dst: impl CheckRegId, off: i16, src: impl CheckRegId) -> Instruction {
    Instruction::new(
        mem_opcode(Class::Stx, size, Mode::Mem),
        dst.check().val(),
        src.check().val(),
        off,
        0,
    )
}

/// Store `imm` into `[dst + off]`.
pub fn st_imm(size: MemSize, dst: impl CheckRegId, off: i16, imm: i32) -> Instruction {
    Instruction::new(
        mem_opcode(Class::St, size, Mode::Mem),
        dst.check().val(),
        0,
        off,
        imm,
    )
}

/// Atomic read-modify-write of `[dst + off]` with operand `src`.
pub fn atomic(
    size: MemSize,
    op: AtomicOp,
    dst: impl CheckRegId,
    off: i16,
    src: impl CheckRegId,
) -> Instruction {
    Instruction::new(
        mem_opcode(Class::Stx, size, Mode::Atomic),
        dst.check().val(),
        src.check().val(),
        off,
        op.to_imm(),
    )
}

/// Unconditional jump by `off` words.
pub fn ja(off: i16) -> Instruction {
    Instruction::new(jmp_opcode(Class::Jmp, JmpOp::Ja, SrcKind::Imm), 0, 0, off, 0)
}

/// Conditional 64-bit jump comparing two registers.
pub fn jmp_reg(op: JmpOp, dst: impl CheckRegId, src: impl CheckRegId, off: i16) -> Instruction {
    Instruction::new(
        jmp_opcode(Class::Jmp, op, SrcKind::Reg),
        dst.check().val(),
        src.check().val(),
        off,
        0,
    )
}

/// Conditional 64-bit jump comparing a register with an immediate.
pub fn jmp_imm(op: JmpOp, dst: impl CheckRegId, imm: i32, off: i16) -> Instruction {
    Instruction::new(
        jmp_opcode(Class::Jmp, op, SrcKind::Imm),
        dst.check().val(),
        0,
        off,
        imm,
    )
}

/// Conditional jump comparing the low 32 bits of two registers.
pub fn jmp32_reg(op: JmpOp, dst: impl CheckRegId, src: impl CheckRegId, off: i16) -> Instruction {
    Instruction::new(
        jmp_opcode(Class::Jmp32, op, SrcKind::Reg),
        dst.check().val(),
        src.check().val(),
        off,
        0,
    )
}

/// Conditional jump comparing the low 32 bits of a register with an
/// immediate.
pub fn jmp32_imm(op: JmpOp, dst: impl CheckRegId, imm: i32, off: i16) -> Instruction {
    Instruction::new(
        jmp_opcode(Class::Jmp32, op, SrcKind::Imm),
        dst.check().val(),
        0,
        off,
        imm,
    )
}

/// Call a runtime helper by id.
pub fn call_helper(helper_id: i32) -> Instruction {
    Instruction::new(
        jmp_opcode(Class::Jmp, JmpOp::Call, SrcKind::Imm),
        0,
        PseudoCall::Helper as u8,
        0,
        helper_id,
    )
}

/// Call a subprogram at relative word offset `delta`.
pub fn call_rel(delta: i32) -> Instruction {
    Instruction::new(
        jmp_opcode(Class::Jmp, JmpOp::Call, SrcKind::Imm),
        0,
        PseudoCall::Subprog as u8,
        0,
        delta,
    )
}

/// Call a typed kernel function by id.
pub fn call_kfunc(kfunc_id: i32) -> Instruction {
    Instruction::new(
        jmp_opcode(Class::Jmp, JmpOp::Call, SrcKind::Imm),
        0,
        PseudoCall::Kfunc as u8,
        0,
        kfunc_id,
    )
}

/// Return from the current frame.
pub fn exit() -> Instruction {
    Instruction::new(jmp_opcode(Class::Jmp, JmpOp::Exit, SrcKind::Imm), 0, 0, 0, 0)
}

const LD_IMM64_OPCODE: u8 =
    Class::Ld as u8 | MemSize::Double as u8 | Mode::Imm as u8;

fn ld_imm64_pair(dst: RegId, pseudo: PseudoLd, imm_lo: i32, imm_hi: i32) -> [Instruction; 2] {
    [
        Instruction::new(LD_IMM64_OPCODE, dst.val(), pseudo as u8, 0, imm_lo),
        Instruction::new(0, 0, 0, 0, imm_hi),
    ]
}

/// Load a raw 64-bit immediate; occupies two instruction words.
pub fn ld_imm64(dst: impl CheckRegId, imm: u64) -> [Instruction; 2] {
    ld_imm64_pair(
        dst.check(),
        PseudoLd::Raw,
        imm as u32 as i32,
        (imm >> 32) as u32 as i32,
    )
}

/// Load a map object by file descriptor; occupies two instruction words.
pub fn ld_map_fd(dst: impl CheckRegId, fd: i32) -> [Instruction; 2] {
    ld_imm64_pair(dst.check(), PseudoLd::MapFd, fd, 0)
}

/// Load the address of `map[fd].value + off`; occupies two instruction
/// words.
pub fn ld_map_value(dst: impl CheckRegId, fd: i32, off: i32) -> [Instruction; 2] {
    ld_imm64_pair(dst.check(), PseudoLd::MapValue, fd, off)
}

/// Load the address of a typed kernel variable; occupies two instruction
/// words.
pub fn ld_ktype_var(dst: impl CheckRegId, type_id: i32) -> [Instruction; 2] {
    ld_imm64_pair(dst.check(), PseudoLd::KtypeId, type_id, 0)
}

/// Load the address of the subprogram at relative word offset `delta`;
/// occupies two instruction words.
pub fn ld_func(dst: impl CheckRegId, delta: i32) -> [Instruction; 2] {
    ld_imm64_pair(dst.check(), PseudoLd::Func, delta, 0)
}

/// Legacy absolute packet load into `r0`.
pub fn ld_abs(size: MemSize, imm: i32) -> Instruction {
    Instruction::new(mem_opcode(Class::Ld, size, Mode::Abs), 0, 0, 0, imm)
}

/// Legacy indirect packet load into `r0`.
pub fn ld_ind(size: MemSize, src: impl CheckRegId, imm: i32) -> Instruction {
    Instruction::new(
        mem_opcode(Class::Ld, size, Mode::Ind),
        0,
        src.check().val(),
        0,
        imm,
    )
}
