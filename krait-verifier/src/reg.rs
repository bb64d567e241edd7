//! Abstract register state.
//!
//! Every register is either uninitialized, a scalar tracked by the value
//! domain, or a pointer. Pointer kinds are a sum type carrying their own
//! payload; orthogonal properties (nullability, read-only, trust, RCU) live
//! in a separate flag set.

use core::fmt;

use crate::ktype::KtypeId;
use crate::map::MapId;
use crate::tnum::Tnum;

bitflags::bitflags! {
    /// Orthogonal properties of a pointer value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PtrFlags: u16 {
        /// The pointer may be null until a null check refines it.
        const MAYBE_NULL = 1 << 0;
        /// Stores through the pointer are rejected.
        const RDONLY = 1 << 1;
        /// Points into ring-buffer storage.
        const RINGBUF = 1 << 2;
        /// Points into user memory; loads need copy helpers.
        const USER = 1 << 3;
        /// Per-CPU address that must be resolved before dereference.
        const PERCPU = 1 << 4;
        /// Valid only inside an RCU read-side bracket.
        const RCU = 1 << 5;
        /// Points at a program-allocated object.
        const ALLOC = 1 << 6;
        /// A non-owning view of a collection-held allocation.
        const NON_OWN_REF = 1 << 7;
        /// No provenance guarantee; dereference must be checked at runtime.
        const UNTRUSTED = 1 << 8;
        /// Provenance guaranteed by the runtime for the program's duration.
        const TRUSTED = 1 << 9;
    }
}

/// Dynamic-pointer families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
pub enum DynptrKind {
    /// Backed by program stack or map memory.
    Local,
    /// Backed by a ring-buffer reservation; carries a reference.
    Ringbuf,
}

impl DynptrKind {
    /// Whether constructing this dynptr acquires a reference.
    pub const fn refcounted(self) -> bool {
        matches!(self, Self::Ringbuf)
    }
}

/// Descriptor of a dynptr held in a spilled slot register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynptrState {
    /// Family of the dynptr.
    pub kind: DynptrKind,
    /// Set only on the first of the slots the dynptr spans.
    pub first_slot: bool,
}

/// Iterator families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IterKind {
    /// Numeric range iterator.
    Num,
}

impl IterKind {
    /// Bytes of stack the iterator occupies.
    pub const fn size(self) -> u32 {
        match self {
            Self::Num => 16,
        }
    }
}

/// Life-cycle phase of an iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterPhase {
    /// Constructed and possibly mid-iteration.
    Active,
    /// The advance call returned null; no more elements.
    Drained,
}

/// Descriptor of an iterator held in a spilled slot register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterState {
    /// Family of the iterator.
    pub kind: IterKind,
    /// Phase of the state machine.
    pub phase: IterPhase,
    /// Advance calls simulated so far on this path.
    pub depth: u32,
}

/// Base object a pointer refers to, with per-kind payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtrBase {
    /// The program context object.
    Ctx,
    /// A map object itself (not its storage).
    ConstMap(MapId),
    /// Storage of one map element.
    MapValue {
        /// The map.
        map: MapId,
        /// Distinguishes values returned by separate lookups.
        uid: u32,
    },
    /// A map key area handed to a callback.
    MapKey(MapId),
    /// The stack of one call frame.
    Stack {
        /// Frame the pointer refers into.
        frameno: u32,
    },
    /// Packet payload; `range` bytes past `off` are proven accessible.
    Packet {
        /// Verified accessible length.
        range: u32,
    },
    /// Packet metadata area preceding the payload.
    PacketMeta {
        /// Verified accessible length.
        range: u32,
    },
    /// One past the last packet byte; only comparisons are legal.
    PacketEnd,
    /// Flow dissector keys.
    FlowKeys,
    /// A socket object.
    Sock,
    /// The common prefix shared by socket types.
    SockCommon,
    /// A TCP socket object.
    TcpSock,
    /// An XDP socket object.
    XdpSock,
    /// A typed kernel object.
    Ktype {
        /// Type of the pointee.
        id: KtypeId,
    },
    /// Fixed-size kernel memory.
    Mem {
        /// Region size in bytes.
        size: u32,
    },
    /// Variable-size buffer bounded at runtime.
    Buf {
        /// Maximum accessible size.
        size: u32,
    },
    /// Address of a subprogram, passable to callback-calling helpers.
    Func {
        /// Subprogram index.
        subprog: u32,
    },
    /// A dynptr descriptor passed by the runtime (never on the stack).
    ConstDynptr {
        /// Family of the described dynptr.
        kind: DynptrKind,
    },
}

impl PtrBase {
    /// Short name used in diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ctx => "ctx",
            Self::ConstMap(_) => "map_ptr",
            Self::MapValue { .. } => "map_value",
            Self::MapKey(_) => "map_key",
            Self::Stack { .. } => "fp",
            Self::Packet { .. } => "pkt",
            Self::PacketMeta { .. } => "pkt_meta",
            Self::PacketEnd => "pkt_end",
            Self::FlowKeys => "flow_keys",
            Self::Sock => "sock",
            Self::SockCommon => "sock_common",
            Self::TcpSock => "tcp_sock",
            Self::XdpSock => "xdp_sock",
            Self::Ktype { .. } => "kernel_object",
            Self::Mem { .. } => "mem",
            Self::Buf { .. } => "buf",
            Self::Func { .. } => "func",
            Self::ConstDynptr { .. } => "dynptr",
        }
    }

    /// Whether pointers of this kind tolerate arithmetic at all.
    pub const fn arithmetic_ok(self) -> bool {
        !matches!(
            self,
            Self::PacketEnd
                | Self::FlowKeys
                | Self::Sock
                | Self::SockCommon
                | Self::TcpSock
                | Self::XdpSock
                | Self::Func { .. }
                | Self::ConstDynptr { .. }
                | Self::ConstMap(_)
        )
    }

    /// Whether a packet-family pointer.
    pub const fn is_packet(self) -> bool {
        matches!(self, Self::Packet { .. } | Self::PacketMeta { .. })
    }
}

/// What a register holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegKind {
    /// Never written on this path.
    NotInit,
    /// A number tracked by the value domain.
    Scalar,
    /// A pointer with base-object payload and property flags.
    Ptr {
        /// Base object.
        base: PtrBase,
        /// Orthogonal properties.
        flags: PtrFlags,
    },
}

bitflags::bitflags! {
    /// Liveness marks on a register or spilled slot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Live: u8 {
        /// The low 32 bits were read on some path.
        const READ32 = 1 << 0;
        /// All 64 bits were read on some path.
        const READ64 = 1 << 1;
        /// Written since the state was forked.
        const WRITTEN = 1 << 2;
        /// Liveness fully resolved; no further propagation.
        const DONE = 1 << 3;
    }
}

impl Live {
    /// Whether any read mark is present.
    pub const fn is_read(self) -> bool {
        self.intersects(Self::READ32.union(Self::READ64))
    }
}

/// Abstract state of one register.
#[derive(Debug, Clone, PartialEq)]
pub struct RegState {
    /// What the register holds.
    pub kind: RegKind,
    /// Fixed byte offset added to the base (pointers only).
    pub off: i32,
    /// Known-bits view of the variable part.
    pub var_off: Tnum,
    /// Signed 64-bit lower bound.
    pub smin: i64,
    /// Signed 64-bit upper bound.
    pub smax: i64,
    /// Unsigned 64-bit lower bound.
    pub umin: u64,
    /// Unsigned 64-bit upper bound.
    pub umax: u64,
    /// Signed 32-bit lower bound of the subregister.
    pub s32_min: i32,
    /// Signed 32-bit upper bound of the subregister.
    pub s32_max: i32,
    /// Unsigned 32-bit lower bound of the subregister.
    pub u32_min: u32,
    /// Unsigned 32-bit upper bound of the subregister.
    pub u32_max: u32,
    /// Correlation id shared by copies of one conditionally-null pointer or
    /// linked scalar; zero when untracked.
    pub id: u32,
    /// Nonzero when the register holds an acquired reference.
    pub ref_obj_id: u32,
    /// Liveness marks.
    pub live: Live,
    /// The exact value (not just bounds) is required downstream.
    pub precise: bool,
    /// Dynptr descriptor when this state sits in a dynptr stack slot.
    pub dynptr: Option<DynptrState>,
    /// Iterator descriptor when this state sits in an iterator stack slot.
    pub iter: Option<IterState>,
}

impl Default for RegState {
    fn default() -> Self {
        Self::not_init()
    }
}

impl RegState {
    /// An uninitialized register.
    pub fn not_init() -> Self {
        Self {
            kind: RegKind::NotInit,
            off: 0,
            var_off: Tnum::UNKNOWN,
            smin: i64::MIN,
            smax: i64::MAX,
            umin: 0,
            umax: u64::MAX,
            s32_min: i32::MIN,
            s32_max: i32::MAX,
            u32_min: 0,
            u32_max: u32::MAX,
            id: 0,
            ref_obj_id: 0,
            live: Live::empty(),
            precise: false,
            dynptr: None,
            iter: None,
        }
    }

    /// A scalar about which nothing is known.
    pub fn unknown_scalar() -> Self {
        Self {
            kind: RegKind::Scalar,
            ..Self::not_init()
        }
    }

    /// The known scalar constant `value`.
    pub fn constant(value: u64) -> Self {
        let mut reg = Self::unknown_scalar();
        reg.var_off = Tnum::constant(value);
        reg.smin = value as i64;
        reg.smax = value as i64;
        reg.umin = value;
        reg.umax = value;
        let low = value as u32;
        reg.s32_min = low as i32;
        reg.s32_max = low as i32;
        reg.u32_min = low;
        reg.u32_max = low;
        reg
    }

    /// A pointer with zero offset.
    pub fn pointer(base: PtrBase, flags: PtrFlags) -> Self {
        let mut reg = Self::not_init();
        reg.kind = RegKind::Ptr { base, flags };
        reg.var_off = Tnum::constant(0);
        reg.set_const_bounds(0);
        reg
    }

    /// Whether the register was ever written.
    pub const fn is_init(&self) -> bool {
        !matches!(self.kind, RegKind::NotInit)
    }

    /// Whether the register holds a scalar.
    pub const fn is_scalar(&self) -> bool {
        matches!(self.kind, RegKind::Scalar)
    }

    /// Whether the register holds a pointer.
    pub const fn is_ptr(&self) -> bool {
        matches!(self.kind, RegKind::Ptr { .. })
    }

    /// Base object of a pointer register.
    pub const fn ptr_base(&self) -> Option<PtrBase> {
        match self.kind {
            RegKind::Ptr { base, .. } => Some(base),
            _ => None,
        }
    }

    /// Property flags of a pointer register.
    pub const fn ptr_flags(&self) -> PtrFlags {
        match self.kind {
            RegKind::Ptr { flags, .. } => flags,
            _ => PtrFlags::empty(),
        }
    }

    /// Mutable property flags of a pointer register.
    pub fn ptr_flags_mut(&mut self) -> Option<&mut PtrFlags> {
        match &mut self.kind {
            RegKind::Ptr { flags, .. } => Some(flags),
            _ => None,
        }
    }

    /// Whether the register is a pointer that may still be null.
    pub const fn maybe_null(&self) -> bool {
        self.ptr_flags().contains(PtrFlags::MAYBE_NULL)
    }

    /// Whether the scalar is a known constant.
    pub fn is_const(&self) -> bool {
        self.is_scalar() && self.var_off.is_const()
    }

    /// The known constant value, if there is one.
    pub fn const_value(&self) -> Option<u64> {
        (self.is_scalar() && self.var_off.is_const()).then(|| self.var_off.value())
    }

    /// Overwrite with an unknown scalar, keeping liveness and parentage.
    pub fn set_unknown(&mut self) {
        let live = self.live;
        *self = Self::unknown_scalar();
        self.live = live;
    }

    /// Overwrite with the constant `value`, keeping liveness.
    pub fn set_constant(&mut self, value: u64) {
        let live = self.live;
        *self = Self::constant(value);
        self.live = live;
    }

    /// Set all five bound views to the constant `value`.
    pub fn set_const_bounds(&mut self, value: u64) {
        self.smin = value as i64;
        self.smax = value as i64;
        self.umin = value;
        self.umax = value;
        let low = value as u32;
        self.s32_min = low as i32;
        self.s32_max = low as i32;
        self.u32_min = low;
        self.u32_max = low;
    }

    /// Forget everything about the numeric bounds.
    pub fn set_unbounded(&mut self) {
        self.var_off = Tnum::UNKNOWN;
        self.smin = i64::MIN;
        self.smax = i64::MAX;
        self.umin = 0;
        self.umax = u64::MAX;
        self.set_unbounded32();
    }

    /// Forget everything about the 32-bit bound views.
    pub fn set_unbounded32(&mut self) {
        self.s32_min = i32::MIN;
        self.s32_max = i32::MAX;
        self.u32_min = 0;
        self.u32_max = u32::MAX;
    }

    /// Whether both 64-bit interval views pin a single value.
    pub fn bounds_const(&self) -> Option<u64> {
        (self.umin == self.umax && self.smin == self.smax && self.umin as i64 == self.smin)
            .then_some(self.umin)
    }

    /// Whether the pointer's effective offset is exactly known.
    pub fn fixed_off(&self) -> bool {
        self.var_off.is_known_const(0)
    }

    /// Drop identity so the value no longer correlates with its copies.
    pub fn clear_id(&mut self) {
        self.id = 0;
    }
}

impl fmt::Display for RegState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            RegKind::NotInit => f.write_str("?"),
            RegKind::Scalar => {
                if let Some(v) = self.const_value() {
                    write!(f, "{v}")
                } else {
                    write!(
                        f,
                        "scalar(umin={},umax={},smin={},smax={},var_off={})",
                        self.umin, self.umax, self.smin, self.smax, self.var_off
                    )
                }
            }
            RegKind::Ptr { base, flags } => {
                write!(f, "{}", base.name())?;
                if flags.contains(PtrFlags::MAYBE_NULL) {
                    f.write_str("_or_null")?;
                }
                write!(f, "(off={}", self.off)?;
                if !self.var_off.is_known_const(0) {
                    write!(f, ",var_off={}", self.var_off)?;
                }
                if let PtrBase::Packet { range } | PtrBase::PacketMeta { range } = base {
                    write!(f, ",range={range}")?;
                }
                if let PtrBase::Mem { size } | PtrBase::Buf { size } = base {
                    write!(f, ",size={size}")?;
                }
                if self.id != 0 {
                    write!(f, ",id={}", self.id)?;
                }
                if self.ref_obj_id != 0 {
                    write!(f, ",ref={}", self.ref_obj_id)?;
                }
                f.write_str(")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_have_tight_views() {
        let reg = RegState::constant(0xffff_ffff_0000_0001);
        assert_eq!(reg.const_value(), Some(0xffff_ffff_0000_0001));
        assert_eq!(reg.umin, reg.umax);
        assert_eq!(reg.smin, reg.smax);
        assert_eq!(reg.u32_min, 1);
        assert_eq!(reg.s32_max, 1);
        assert!(reg.smin < 0);
    }

    #[test]
    fn pointer_display() {
        let mut reg = RegState::pointer(
            PtrBase::MapValue {
                map: MapId(0),
                uid: 0,
            },
            PtrFlags::MAYBE_NULL,
        );
        reg.id = 3;
        assert_eq!(reg.to_string(), "map_value_or_null(off=0,id=3)");
    }

    #[test]
    fn set_unknown_preserves_liveness() {
        let mut reg = RegState::constant(7);
        reg.live = Live::WRITTEN;
        reg.set_unknown();
        assert!(reg.is_scalar());
        assert_eq!(reg.live, Live::WRITTEN);
        assert_eq!(reg.const_value(), None);
    }
}
