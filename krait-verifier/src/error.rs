//! Verifier rejection and failure types.

use core::fmt;

/// Failure class of a rejection, mapped to a distinct errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
pub enum ErrorClass {
    /// Malformed program shape: bad jump targets, unreachable code,
    /// reserved fields, size and depth limits.
    Structural,
    /// A typing rule was violated: wrong register kind, misaligned or
    /// out-of-bounds access, pointer leak.
    Type,
    /// A resource discipline was violated: references, locks, RCU brackets.
    Resource,
    /// An arithmetic rule was violated: division by a zero constant,
    /// oversized shifts, unsupported pointer operators.
    Arithmetic,
    /// The analysis ran out of budget before covering every path.
    Complexity,
    /// The verifier itself misbehaved. Always a bug.
    Internal,
}

impl ErrorClass {
    /// POSIX-style errno the class maps to.
    pub const fn errno(self) -> i32 {
        match self {
            Self::Structural => 22,  // EINVAL
            Self::Type => 13,        // EACCES
            Self::Resource => 9,     // EBADF
            Self::Arithmetic => 33,  // EDOM
            Self::Complexity => 7,   // E2BIG
            Self::Internal => 14,    // EFAULT
        }
    }
}

/// Individual rejection reasons raised by the analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[repr(u8)]
#[non_exhaustive]
pub enum Reject {
    /// A jump or call target is outside the program or splits an
    /// immediate-load pair.
    JumpOutOfRange = 0x00,
    /// An instruction can never be reached from the entry point.
    UnreachableInsn = 0x01,
    /// A field that must be zero carries a value.
    ReservedFieldSet = 0x02,
    /// The program exceeds the instruction-count limit.
    OversizedProgram = 0x03,
    /// Subprogram calls nest deeper than the frame limit.
    CallStackTooDeep = 0x04,
    /// A back-edge among ordinary jumps forms a loop.
    BackEdge = 0x05,
    /// The program can fall off the last instruction.
    FallOffEnd = 0x06,
    /// An opcode the VM does not define.
    UnknownOpcode = 0x07,

    /// A register's type is not in the permitted set for the operation.
    BadRegisterType = 0x10,
    /// A read of a register that was never written.
    UninitRegister = 0x11,
    /// A memory access is misaligned.
    MisalignedAccess = 0x12,
    /// A memory access falls outside the bounds of its base object.
    OutOfBounds = 0x13,
    /// A pointer would be stored where unprivileged programs may read it.
    PointerLeak = 0x14,
    /// A register spill that is not slot-aligned or slot-sized.
    BadSpill = 0x15,
    /// A read of stack bytes that were never written.
    UninitStack = 0x16,
    /// A write into read-only memory.
    ReadOnly = 0x17,
    /// A helper or kernel-function argument failed its type contract.
    BadCallArgument = 0x18,
    /// A conditionally-null pointer was used without a null check.
    MaybeNullDeref = 0x19,

    /// A reference was still held when the frame returned.
    UnreleasedReference = 0x20,
    /// A release of a reference that was never acquired.
    ReleaseWithoutAcquire = 0x21,
    /// A second lock while one is already held.
    DoubleLock = 0x22,
    /// An unlock of a different object than the one locked.
    WrongUnlock = 0x23,
    /// An RCU bracket opened inside another one, or closed while not open.
    BadRcuBracket = 0x24,
    /// A call that is not allowed while a lock is held.
    CallWithLockHeld = 0x25,

    /// Division or modulo by an immediate zero.
    DivByZero = 0x30,
    /// A shift count at least as large as the operand width.
    ShiftOutOfRange = 0x31,
    /// An ALU operator that is not defined on pointers.
    PointerArithmetic = 0x32,
    /// Pointer subtraction outside privileged mode.
    PointerSubtraction = 0x33,
    /// An offset or value that left the representable range.
    ValueOutOfRange = 0x34,
    /// The speculative twin of an address computation went out of bounds.
    SpeculativeOutOfBounds = 0x35,

    /// The instruction-processing budget was exhausted.
    InsnLimit = 0x40,
    /// The pending-fork stack outgrew its limit.
    ForkLimit = 0x41,
    /// Precision backtracking could not locate a required constant.
    BacktrackLimit = 0x42,

    /// An internal invariant of the verifier was violated.
    VerifierBug = 0x50,
}

impl Reject {
    /// Failure class (and thus errno) of this reason.
    pub const fn class(self) -> ErrorClass {
        match self {
            Self::JumpOutOfRange
            | Self::UnreachableInsn
            | Self::ReservedFieldSet
            | Self::OversizedProgram
            | Self::CallStackTooDeep
            | Self::BackEdge
            | Self::FallOffEnd
            | Self::UnknownOpcode => ErrorClass::Structural,

            Self::BadRegisterType
            | Self::UninitRegister
            | Self::MisalignedAccess
            | Self::OutOfBounds
            | Self::PointerLeak
            | Self::BadSpill
            | Self::UninitStack
            | Self::ReadOnly
            | Self::BadCallArgument
            | Self::MaybeNullDeref => ErrorClass::Type,

            Self::UnreleasedReference
            | Self::ReleaseWithoutAcquire
            | Self::DoubleLock
            | Self::WrongUnlock
            | Self::BadRcuBracket
            | Self::CallWithLockHeld => ErrorClass::Resource,

            Self::DivByZero
            | Self::ShiftOutOfRange
            | Self::PointerArithmetic
            | Self::PointerSubtraction
            | Self::ValueOutOfRange
            | Self::SpeculativeOutOfBounds => ErrorClass::Arithmetic,

            Self::InsnLimit | Self::ForkLimit | Self::BacktrackLimit => {
                ErrorClass::Complexity
            }

            Self::VerifierBug => ErrorClass::Internal,
        }
    }

    /// Errno the rejection maps to.
    pub const fn errno(self) -> i32 {
        self.class().errno()
    }
}

/// A verification failure: the reason, the instruction it was detected at,
/// and the formatted diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display(fmt = "{}: {}", insn_idx, message)]
#[must_use]
pub struct VerifierError {
    /// Rejection reason.
    pub reject: Reject,
    /// Instruction index the failure was detected at.
    pub insn_idx: usize,
    /// Formatted diagnostic, also the last line of the log.
    pub message: String,
}

impl VerifierError {
    /// Construct a failure at the given instruction.
    pub fn new(reject: Reject, insn_idx: usize, message: impl Into<String>) -> Self {
        Self {
            reject,
            insn_idx,
            message: message.into(),
        }
    }

    /// Errno the failure maps to.
    pub const fn errno(&self) -> i32 {
        self.reject.errno()
    }
}

impl std::error::Error for VerifierError {}

impl From<Bug> for VerifierError {
    fn from(bug: Bug) -> Self {
        Self {
            reject: Reject::VerifierBug,
            insn_idx: bug.insn_idx,
            message: format!("verifier bug: {}", bug.variant),
        }
    }
}

/// Internal invariant violations. Reaching one of these is always a defect
/// in the verifier, never in the program under analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Bug {
    /// Which invariant broke.
    pub variant: BugVariant,
    /// Instruction index the analysis was at.
    pub insn_idx: usize,
}

impl Bug {
    /// Construct a bug report at the given instruction.
    pub const fn new(variant: BugVariant, insn_idx: usize) -> Self {
        Self { variant, insn_idx }
    }
}

/// The internal invariants that can be reported as [`Bug`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[non_exhaustive]
pub enum BugVariant {
    /// A state id resolved to a freed or recycled arena slot.
    #[display(fmt = "stale state id in parent chain")]
    StaleStateId,
    /// A branch counter was decremented below zero.
    #[display(fmt = "branch counter underflow")]
    BranchCountUnderflow,
    /// A frame index outside the live frame stack.
    #[display(fmt = "frame index out of range")]
    FrameOutOfRange,
    /// A patch site fell outside the instruction stream.
    #[display(fmt = "patch offset out of range")]
    PatchOutOfRange,
    /// A register or slot kind that cannot occur at this point.
    #[display(fmt = "unexpected register state")]
    UnexpectedRegState,
}

/// Shorthand for fallible verifier operations.
pub type VResult<T> = Result<T, VerifierError>;

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Structural => "structural",
            Self::Type => "type",
            Self::Resource => "resource",
            Self::Arithmetic => "arithmetic",
            Self::Complexity => "complexity",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn errnos_are_distinct_per_class() {
        let mut seen = std::collections::HashSet::new();
        for class in ErrorClass::iter() {
            assert!(seen.insert(class.errno()), "duplicate errno for {class}");
        }
    }

    #[test]
    fn every_reject_has_a_class() {
        for reject in Reject::iter() {
            // classification is total and internal bugs stay internal
            let class = reject.class();
            if reject == Reject::VerifierBug {
                assert_eq!(class, ErrorClass::Internal);
            } else {
                assert_ne!(class, ErrorClass::Internal);
            }
        }
    }

    #[test]
    fn error_display_leads_with_insn_idx() {
        let err = VerifierError::new(Reject::OutOfBounds, 7, "R0 out of bounds");
        assert_eq!(err.to_string(), "7: R0 out of bounds");
        assert_eq!(err.errno(), 13);
    }
}
