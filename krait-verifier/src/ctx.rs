//! Program kinds and their context-access vtables.
//!
//! Each program kind owns an operations table the core consults as a pure
//! query interface: whether a context offset is accessible, what pointer
//! kind a context load yields, which helpers are available, and what return
//! values the entry frame may produce. The callbacks never mutate verifier
//! state.

use crate::helper::HelperId;
use crate::log::LogLevel;
use crate::reg::{
    PtrBase,
    PtrFlags,
};

bitflags::bitflags! {
    /// Privilege and hardening switches for one verification run.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Caps: u32 {
        /// The loader holds the VM privilege; lifts unprivileged-only
        /// restrictions.
        const PRIVILEGED = 1 << 0;
        /// Pointers may be stored where other programs could read them.
        const ALLOW_PTR_LEAKS = 1 << 1;
        /// Reads of never-written stack bytes yield unknown scalars instead
        /// of rejections.
        const ALLOW_UNINIT_STACK = 1 << 2;
        /// Skip bounds-misprediction hardening.
        const BYPASS_SPEC_V1 = 1 << 3;
        /// Skip store-bypass hardening.
        const BYPASS_SPEC_V4 = 1 << 4;
        /// Reject accesses that are not naturally aligned.
        const STRICT_ALIGNMENT = 1 << 5;
    }
}

/// Tunable limits and switches of one verification run.
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Privilege and hardening switches.
    pub caps: Caps,
    /// Log verbosity.
    pub log_level: LogLevel,
    /// Total simulated-instruction budget.
    pub insn_limit: usize,
    /// Pending-fork limit.
    pub fork_limit: usize,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            caps: Caps::empty(),
            log_level: LogLevel::Off,
            insn_limit: crate::consts::MAX_INSN_PROCESSED,
            fork_limit: crate::consts::MAX_PENDING_FORKS,
        }
    }
}

impl VerifierConfig {
    /// Privileged configuration with leak and uninit-stack allowances, the
    /// shape trusted loaders run with.
    pub fn privileged() -> Self {
        Self {
            caps: Caps::PRIVILEGED
                | Caps::ALLOW_PTR_LEAKS
                | Caps::ALLOW_UNINIT_STACK
                | Caps::BYPASS_SPEC_V1
                | Caps::BYPASS_SPEC_V4,
            ..Self::default()
        }
    }

    /// Whether the run is privileged.
    pub fn privileged_mode(&self) -> bool {
        self.caps.contains(Caps::PRIVILEGED)
    }
}

/// What a valid context access yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtxAccess {
    /// A plain number.
    Scalar,
    /// A pointer of the given kind and flags.
    Ptr {
        /// Resulting base object.
        base: PtrBase,
        /// Resulting flags.
        flags: PtrFlags,
    },
}

/// Program kinds known to the verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
pub enum ProgramKind {
    /// Packet filter attached to a socket.
    SocketFilter,
    /// Early packet processor with write access to the payload.
    PacketEdit,
    /// Kernel-event tracer with a read-only typed context.
    Tracing,
}

impl ProgramKind {
    /// The operations table for this kind.
    pub fn ops(self) -> &'static dyn ProgOps {
        match self {
            Self::SocketFilter => &SocketFilterOps,
            Self::PacketEdit => &PacketEditOps,
            Self::Tracing => &TracingOps,
        }
    }
}

/// Per-program-kind query interface.
pub trait ProgOps: Sync {
    /// Kind name for diagnostics.
    fn name(&self) -> &'static str;

    /// Whether `(off, size)` is a valid context access in the given
    /// direction, and what it yields. Offsets are always constant.
    fn ctx_access(&self, off: u32, size: u32, write: bool) -> Option<CtxAccess>;

    /// Size of the aligned field at `off`, allowing narrow loads inside it.
    fn ctx_field_size(&self, off: u32) -> Option<u32>;

    /// Whether legacy packet loads are defined for this kind.
    fn allows_ld_abs(&self) -> bool;

    /// Whether stores through packet pointers are allowed.
    fn packet_writable(&self) -> bool;

    /// Whether the helper is callable from this kind.
    fn helper_allowed(&self, helper: HelperId) -> bool;

    /// Inclusive range the entry frame's return value must fall in.
    fn return_range(&self) -> (u64, u64);
}

/// Byte layout of the packet-descriptor context shared by the two packet
/// kinds: lengths, then payload cursors.
mod pkt_ctx {
    pub const LEN: u32 = 0;
    pub const PROTOCOL: u32 = 4;
    pub const MARK: u32 = 8;
    pub const DATA: u32 = 76;
    pub const DATA_END: u32 = 80;
    pub const DATA_META: u32 = 84;
    pub const SIZE: u32 = 192;
}

fn pkt_ctx_access(off: u32, size: u32, write: bool, meta: bool) -> Option<CtxAccess> {
    use pkt_ctx::*;
    if off + size > SIZE {
        return None;
    }
    match off {
        DATA if size == 4 && !write => Some(CtxAccess::Ptr {
            base: PtrBase::Packet { range: 0 },
            flags: PtrFlags::empty(),
        }),
        DATA_END if size == 4 && !write => Some(CtxAccess::Ptr {
            base: PtrBase::PacketEnd,
            flags: PtrFlags::empty(),
        }),
        DATA_META if size == 4 && !write && meta => Some(CtxAccess::Ptr {
            base: PtrBase::PacketMeta { range: 0 },
            flags: PtrFlags::empty(),
        }),
        DATA | DATA_END | DATA_META => None,
        MARK => Some(CtxAccess::Scalar),
        LEN | PROTOCOL if !write => Some(CtxAccess::Scalar),
        _ if !write => Some(CtxAccess::Scalar),
        _ => None,
    }
}

fn pkt_ctx_field_size(off: u32) -> Option<u32> {
    (off < pkt_ctx::SIZE).then_some(4)
}

struct SocketFilterOps;

impl ProgOps for SocketFilterOps {
    fn name(&self) -> &'static str {
        "socket_filter"
    }

    fn ctx_access(&self, off: u32, size: u32, write: bool) -> Option<CtxAccess> {
        if write {
            // The filter context is read-only except the mark word.
            return (off == pkt_ctx::MARK && size == 4).then_some(CtxAccess::Scalar);
        }
        pkt_ctx_access(off, size, write, false)
    }

    fn ctx_field_size(&self, off: u32) -> Option<u32> {
        pkt_ctx_field_size(off)
    }

    fn allows_ld_abs(&self) -> bool {
        true
    }

    fn packet_writable(&self) -> bool {
        false
    }

    fn helper_allowed(&self, helper: HelperId) -> bool {
        !helper.packet_rewriting()
    }

    fn return_range(&self) -> (u64, u64) {
        (0, u64::MAX)
    }
}

struct PacketEditOps;

impl ProgOps for PacketEditOps {
    fn name(&self) -> &'static str {
        "packet_edit"
    }

    fn ctx_access(&self, off: u32, size: u32, write: bool) -> Option<CtxAccess> {
        pkt_ctx_access(off, size, write, true)
    }

    fn ctx_field_size(&self, off: u32) -> Option<u32> {
        pkt_ctx_field_size(off)
    }

    fn allows_ld_abs(&self) -> bool {
        false
    }

    fn packet_writable(&self) -> bool {
        true
    }

    fn helper_allowed(&self, _helper: HelperId) -> bool {
        true
    }

    fn return_range(&self) -> (u64, u64) {
        // Verdict codes.
        (0, 4)
    }
}

struct TracingOps;

impl TracingOps {
    /// Tracing programs see a fixed-size argument block.
    const CTX_SIZE: u32 = 128;
}

impl ProgOps for TracingOps {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn ctx_access(&self, off: u32, size: u32, write: bool) -> Option<CtxAccess> {
        (!write && off + size <= Self::CTX_SIZE).then_some(CtxAccess::Scalar)
    }

    fn ctx_field_size(&self, off: u32) -> Option<u32> {
        (off < Self::CTX_SIZE).then_some(8)
    }

    fn allows_ld_abs(&self) -> bool {
        false
    }

    fn packet_writable(&self) -> bool {
        false
    }

    fn helper_allowed(&self, helper: HelperId) -> bool {
        !helper.packet_rewriting()
    }

    fn return_range(&self) -> (u64, u64) {
        (0, u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_cursors_resolve_to_pointers() {
        let ops = ProgramKind::SocketFilter.ops();
        assert!(matches!(
            ops.ctx_access(pkt_ctx::DATA, 4, false),
            Some(CtxAccess::Ptr {
                base: PtrBase::Packet { range: 0 },
                ..
            })
        ));
        assert!(matches!(
            ops.ctx_access(pkt_ctx::DATA_END, 4, false),
            Some(CtxAccess::Ptr {
                base: PtrBase::PacketEnd,
                ..
            })
        ));
        // Half-width loads of a cursor are meaningless.
        assert!(ops.ctx_access(pkt_ctx::DATA, 2, false).is_none());
    }

    #[test]
    fn socket_filter_context_is_mostly_readonly() {
        let ops = ProgramKind::SocketFilter.ops();
        assert!(ops.ctx_access(pkt_ctx::MARK, 4, true).is_some());
        assert!(ops.ctx_access(pkt_ctx::LEN, 4, true).is_none());
    }

    #[test]
    fn tracing_context_is_flat() {
        let ops = ProgramKind::Tracing.ops();
        assert!(matches!(
            ops.ctx_access(0, 8, false),
            Some(CtxAccess::Scalar)
        ));
        assert!(ops.ctx_access(124, 8, false).is_none());
        assert!(ops.ctx_access(0, 8, true).is_none());
    }
}
