//! Krait VM bytecode verifier.
//!
//! Before a Krait program may run in a privileged context, this crate
//! proves it safe without executing it: every memory access in bounds and
//! well typed, no uninitialized data escaping, every acquired runtime
//! resource released, control flow terminating, and helper and
//! kernel-function calling conventions respected. The analysis is a
//! symbolic abstract interpreter walking all feasible paths, pruning
//! explorations subsumed by earlier ones, and tracking which facts must be
//! exact rather than approximated.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

pub mod bounds;
pub mod cfg;
pub mod consts;
pub mod ctx;
pub mod error;
pub mod frame;
pub mod helper;
pub mod kfunc;
pub mod ktype;
pub mod log;
pub mod map;
pub mod patch;
pub mod reg;
pub mod stack;
pub mod state;
pub mod tnum;
#[cfg(any(test, feature = "test-helpers"))]
pub mod util;
pub mod verifier;

#[cfg(test)]
mod tests;

#[doc(no_inline)]
pub use krait_asm;

pub mod prelude {
    //! Everything a loader needs to drive a verification run.
    #[doc(no_inline)]
    pub use krait_asm::{
        op,
        Instruction,
        RegId,
    };

    pub use crate::ctx::{
        Caps,
        ProgramKind,
        VerifierConfig,
    };
    pub use crate::error::{
        ErrorClass,
        Reject,
        VerifierError,
    };
    pub use crate::helper::HelperId;
    pub use crate::kfunc::KfuncId;
    pub use crate::ktype::{
        Ktype,
        KtypeDb,
        KtypeId,
    };
    pub use crate::log::LogLevel;
    pub use crate::map::{
        FieldKind,
        MapDef,
        MapKind,
        TypedField,
    };
    pub use crate::tnum::Tnum;
    pub use crate::verifier::{
        verify,
        verify_full,
        VerifiedProgram,
        VerifierInput,
        VerifierStats,
    };

    #[cfg(any(test, feature = "test-helpers"))]
    pub use crate::util::test_helpers::ProgramBuilder;
}
