//! Analysis limits and layout parameters.

use core::mem;

use krait_asm::Word;

/// Length of a VM word, in bytes.
pub const WORD_SIZE: usize = mem::size_of::<Word>();

/// Maximum number of live call frames in one verifier state.
pub const MAX_CALL_FRAMES: usize = 8;

/// Stack bytes available to each frame. Frame-pointer relative offsets are
/// legal in `[-MAX_STACK, 0)`.
pub const MAX_STACK: u32 = 512;

/// Granularity of stack tracking; a spilled register occupies one slot.
pub const SLOT_SIZE: u32 = 8;

/// Stack slots per frame.
pub const MAX_SLOTS: usize = (MAX_STACK / SLOT_SIZE) as usize;

/// Upper bound on program length, in instruction words.
pub const MAX_PROG_INSNS: usize = 1_000_000;

/// Total simulated instructions before the analysis gives up.
pub const MAX_INSN_PROCESSED: usize = 1_000_000;

/// Upper bound on pending forks in the exploration worklist.
pub const MAX_PENDING_FORKS: usize = 8192;

/// Helper and kernel-function calls pass at most this many arguments.
pub const MAX_CALL_ARGS: usize = 5;

/// Registers clobbered by any call.
pub const CALLER_SAVED: [krait_asm::RegId; 6] = [
    krait_asm::RegId::R0,
    krait_asm::RegId::R1,
    krait_asm::RegId::R2,
    krait_asm::RegId::R3,
    krait_asm::RegId::R4,
    krait_asm::RegId::R5,
];

/// Largest errno value representable in a helper's error return.
pub const MAX_ERRNO: i64 = 4095;

/// Largest byte count a bounded-size helper argument may describe.
pub const MAX_HELPER_MEM: u64 = 1 << 29;

/// Minimum straight-line instructions between loop checkpoints.
pub const CHECKPOINT_INSN_GAP: u32 = 8;

/// Minimum taken jumps between loop checkpoints.
pub const CHECKPOINT_JMP_GAP: u32 = 2;

/// Checkpoint-list entries at one instruction before eviction kicks in.
pub const MAX_CHECKPOINTS_PER_INSN: usize = 64;

/// A checkpoint whose miss count exceeds its hit count by this factor is
/// evicted once off every active path.
pub const CHECKPOINT_EVICT_RATIO: u32 = 16;

/// Assumed leading misalignment of packet payloads.
pub const PACKET_HEAD_ALIGN: u32 = 2;

/// Default log-buffer capacity, in bytes.
pub const LOG_BUF_CAP: usize = 1 << 20;

/// Stack slots occupied by a dynamic pointer descriptor.
pub const DYNPTR_SLOTS: usize = 2;

static_assertions::const_assert!(MAX_STACK % SLOT_SIZE == 0);
static_assertions::const_assert!(MAX_PROG_INSNS <= MAX_INSN_PROCESSED);
static_assertions::const_assert!(SLOT_SIZE as usize == WORD_SIZE);
