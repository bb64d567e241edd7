use core::fmt;

use crate::opcode::{
    AluOp,
    Class,
    JmpOp,
    MemSize,
    Mode,
    PseudoCall,
    PseudoLd,
    SrcKind,
};
use crate::reg::RegId;

/// Raw wire representation of an instruction.
pub type RawInstruction = u64;

/// A decoded 64-bit Krait instruction word.
///
/// Field layout, least significant byte first: opcode byte, a register byte
/// (destination in the low nibble, source in the high nibble), a signed
/// 16-bit displacement, and a signed 32-bit immediate. A 64-bit immediate
/// load occupies two consecutive words; the second word carries the high
/// half of the immediate and must otherwise be zero.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction {
    opcode: u8,
    regs: u8,
    off: i16,
    imm: i32,
}

impl Instruction {
    /// Size of one instruction word in bytes.
    pub const LEN: usize = 8;

    /// Assemble an instruction from its fields. Register fields are masked
    /// to their four bits.
    pub const fn new(opcode: u8, dst: u8, src: u8, off: i16, imm: i32) -> Self {
        Self {
            opcode,
            regs: (dst & 0x0f) | ((src & 0x0f) << 4),
            off,
            imm,
        }
    }

    /// Decode an instruction from its wire representation.
    pub const fn from_raw(raw: RawInstruction) -> Self {
        Self {
            opcode: (raw & 0xff) as u8,
            regs: ((raw >> 8) & 0xff) as u8,
            off: ((raw >> 16) & 0xffff) as u16 as i16,
            imm: ((raw >> 32) & 0xffff_ffff) as u32 as i32,
        }
    }

    /// Encode the instruction into its wire representation.
    pub const fn to_raw(self) -> RawInstruction {
        (self.opcode as u64)
            | ((self.regs as u64) << 8)
            | ((self.off as u16 as u64) << 16)
            | ((self.imm as u32 as u64) << 32)
    }

    /// Decode an instruction from little-endian bytes.
    pub const fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self::from_raw(u64::from_le_bytes(bytes))
    }

    /// Encode the instruction as little-endian bytes.
    pub const fn to_bytes(self) -> [u8; Self::LEN] {
        self.to_raw().to_le_bytes()
    }

    /// The opcode byte.
    pub const fn opcode(&self) -> u8 {
        self.opcode
    }

    /// Instruction class.
    pub const fn class(&self) -> Class {
        Class::from_opcode(self.opcode)
    }

    /// Raw destination register field.
    pub const fn dst_field(&self) -> u8 {
        self.regs & 0x0f
    }

    /// Raw source register field.
    pub const fn src_field(&self) -> u8 {
        self.regs >> 4
    }

    /// Destination register, if the field is in range.
    pub const fn dst(&self) -> Option<RegId> {
        RegId::new(self.dst_field())
    }

    /// Source register, if the field is in range.
    pub const fn src(&self) -> Option<RegId> {
        RegId::new(self.src_field())
    }

    /// Signed 16-bit displacement.
    pub const fn off(&self) -> i16 {
        self.off
    }

    /// Signed 32-bit immediate.
    pub const fn imm(&self) -> i32 {
        self.imm
    }

    /// ALU operation selector, for ALU-class instructions.
    pub const fn alu_op(&self) -> Option<AluOp> {
        if self.class().is_alu() {
            AluOp::from_opcode(self.opcode)
        } else {
            None
        }
    }

    /// Jump operation selector, for jump-class instructions.
    pub const fn jmp_op(&self) -> Option<JmpOp> {
        if self.class().is_jmp() {
            JmpOp::from_opcode(self.opcode)
        } else {
            None
        }
    }

    /// Source-operand kind for ALU and jump classes.
    pub const fn src_kind(&self) -> SrcKind {
        SrcKind::from_opcode(self.opcode)
    }

    /// Memory access width, for memory-class instructions.
    pub const fn mem_size(&self) -> MemSize {
        MemSize::from_opcode(self.opcode)
    }

    /// Addressing mode, for memory-class instructions.
    pub const fn mode(&self) -> Option<Mode> {
        Mode::from_opcode(self.opcode)
    }

    /// Whether this is the first word of a 64-bit immediate load pair.
    pub const fn is_ld_imm64(&self) -> bool {
        matches!(self.class(), Class::Ld)
            && matches!(self.mode(), Some(Mode::Imm))
            && matches!(self.mem_size(), MemSize::Double)
    }

    /// Pseudo-source of a 64-bit immediate load pair.
    pub const fn pseudo_ld(&self) -> Option<PseudoLd> {
        if self.is_ld_imm64() {
            PseudoLd::from_src(self.src_field())
        } else {
            None
        }
    }

    /// Whether this is a call of any form.
    pub const fn is_call(&self) -> bool {
        matches!(self.class(), Class::Jmp) && self.opcode & 0xf0 == JmpOp::Call as u8
    }

    /// Pseudo-source of a call instruction.
    pub const fn pseudo_call(&self) -> Option<PseudoCall> {
        if self.is_call() {
            PseudoCall::from_src(self.src_field())
        } else {
            None
        }
    }

    /// Whether this is an `exit` instruction.
    pub const fn is_exit(&self) -> bool {
        matches!(self.class(), Class::Jmp) && self.opcode & 0xf0 == JmpOp::Exit as u8
    }

    /// Whether this instruction never falls through to `pc + 1`.
    pub const fn is_unconditional_jmp(&self) -> bool {
        matches!(self.class(), Class::Jmp)
            && (self.opcode & 0xf0 == JmpOp::Ja as u8
                || self.opcode & 0xf0 == JmpOp::Exit as u8)
    }
}

impl From<RawInstruction> for Instruction {
    fn from(raw: RawInstruction) -> Self {
        Self::from_raw(raw)
    }
}

impl From<Instruction> for RawInstruction {
    fn from(insn: Instruction) -> Self {
        insn.to_raw()
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dst = self.dst_field();
        let src = self.src_field();
        match self.class() {
            Class::Alu32 | Class::Alu64 => {
                let wide = matches!(self.class(), Class::Alu64);
                let suffix = if wide { "" } else { "32" };
                match (self.alu_op(), self.src_kind()) {
                    (Some(op), SrcKind::Reg) => {
                        write!(f, "{}{} r{}, r{}", op.name(), suffix, dst, src)
                    }
                    (Some(op), SrcKind::Imm) => {
                        write!(f, "{}{} r{}, {}", op.name(), suffix, dst, self.imm)
                    }
                    (None, _) => write!(f, "invalid(0x{:02x})", self.opcode),
                }
            }
            Class::Jmp | Class::Jmp32 => match self.jmp_op() {
                Some(JmpOp::Exit) => write!(f, "exit"),
                Some(JmpOp::Call) => write!(f, "call {}", self.imm),
                Some(JmpOp::Ja) => write!(f, "ja {:+}", self.off),
                Some(op) => match self.src_kind() {
                    SrcKind::Reg => {
                        write!(f, "{} r{}, r{}, {:+}", op.name(), dst, src, self.off)
                    }
                    SrcKind::Imm => {
                        write!(f, "{} r{}, {}, {:+}", op.name(), dst, self.imm, self.off)
                    }
                },
                None => write!(f, "invalid(0x{:02x})", self.opcode),
            },
            Class::Ldx => write!(
                f,
                "ldx{} r{}, [r{}{:+}]",
                size_suffix(self.mem_size()),
                dst,
                src,
                self.off
            ),
            Class::Stx => write!(
                f,
                "stx{} [r{}{:+}], r{}",
                size_suffix(self.mem_size()),
                dst,
                self.off,
                src
            ),
            Class::St => write!(
                f,
                "st{} [r{}{:+}], {}",
                size_suffix(self.mem_size()),
                dst,
                self.off,
                self.imm
            ),
            Class::Ld => {
                if self.is_ld_imm64() {
                    write!(f, "lddw r{}, {}", dst, self.imm)
                } else {
                    write!(f, "ld(0x{:02x}) {}", self.opcode, self.imm)
                }
            }
        }
    }
}

const fn size_suffix(size: MemSize) -> &'static str {
    match size {
        MemSize::Byte => "b",
        MemSize::Half => "h",
        MemSize::Word => "w",
        MemSize::Double => "dw",
    }
}
