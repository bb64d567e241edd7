//! Instruction set primitives of the Krait VM.
//!
//! Krait programs are sequences of fixed-size 64-bit instruction words
//! operating on eleven registers (`r0`..`r9` plus the read-only frame
//! pointer). This crate owns the wire encoding and nothing else: field
//! extraction, opcode classification, and constructor shorthands for
//! building programs in tests and tools.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

#[cfg(test)]
mod encoding_tests;
mod insn;
mod opcode;
mod reg;

pub mod op;

pub use insn::{
    Instruction,
    RawInstruction,
};
pub use opcode::{
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
pub use reg::RegId;

/// Native word of the Krait VM.
pub type Word = u64;
