//! Runtime helper prototypes.
//!
//! Helpers are indirect calls into a table of kernel primitives. Each one
//! publishes a prototype: the kinds its five argument registers must hold,
//! what lands in `r0`, and its effect on the reference, lock, and callback
//! disciplines. The argument checker interprets these declaratively.

use crate::reg::DynptrKind;

/// Helper identifiers, the immediate of a helper call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[repr(i32)]
pub enum HelperId {
    /// `map_lookup(map, key) -> value_or_null`
    MapLookup = 1,
    /// `map_update(map, key, value, flags) -> errno`
    MapUpdate = 2,
    /// `map_delete(map, key) -> errno`
    MapDelete = 3,
    /// `prandom() -> u32`
    GetPrandom = 7,
    /// `ktime_ns() -> u64`
    KtimeGetNs = 5,
    /// `trace_printk(fmt, fmt_size, ...) -> errno`
    TracePrintk = 6,
    /// `spin_lock(lock)`
    SpinLock = 93,
    /// `spin_unlock(lock)`
    SpinUnlock = 94,
    /// `ringbuf_reserve(map, size, flags) -> mem_or_null`, acquiring.
    RingbufReserve = 131,
    /// `ringbuf_submit(mem, flags)`, releasing.
    RingbufSubmit = 132,
    /// `ringbuf_discard(mem, flags)`, releasing.
    RingbufDiscard = 133,
    /// `probe_read_kernel(dst, size, src) -> errno`
    ProbeReadKernel = 113,
    /// `for_each_map_elem(map, callback, ctx, flags) -> iterations`
    ForEachMapElem = 164,
    /// `loop(iterations, callback, ctx, flags) -> iterations`
    Loop = 181,
    /// `dynptr_from_mem(mem, size, flags, dynptr) -> errno`
    DynptrFromMem = 197,
    /// `ringbuf_reserve_dynptr(map, size, flags, dynptr) -> errno`,
    /// acquiring.
    RingbufReserveDynptr = 198,
    /// `ringbuf_submit_dynptr(dynptr, flags)`, releasing.
    RingbufSubmitDynptr = 199,
    /// `dynptr_read(dst, size, dynptr, offset, flags) -> errno`
    DynptrRead = 201,
    /// `dynptr_write(dynptr, offset, src, size, flags) -> errno`
    DynptrWrite = 202,
    /// `dynptr_data(dynptr, offset, len) -> mem_or_null`
    DynptrData = 203,
    /// `snprintf(dst, dst_size, fmt, args, args_size) -> length`
    Snprintf = 165,
    /// `timer_init(timer, map, flags) -> errno`
    TimerInit = 169,
    /// `timer_set_callback(timer, callback) -> errno`
    TimerSetCallback = 170,
    /// `timer_start(timer, nsecs, flags) -> errno`
    TimerStart = 171,
}

impl HelperId {
    /// Decode a call immediate.
    pub fn from_imm(imm: i32) -> Option<Self> {
        use strum::IntoEnumIterator;
        Self::iter().find(|h| *h as i32 == imm)
    }

    /// Name used in diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            Self::MapLookup => "map_lookup",
            Self::MapUpdate => "map_update",
            Self::MapDelete => "map_delete",
            Self::GetPrandom => "get_prandom",
            Self::KtimeGetNs => "ktime_get_ns",
            Self::TracePrintk => "trace_printk",
            Self::SpinLock => "spin_lock",
            Self::SpinUnlock => "spin_unlock",
            Self::RingbufReserve => "ringbuf_reserve",
            Self::RingbufSubmit => "ringbuf_submit",
            Self::RingbufDiscard => "ringbuf_discard",
            Self::ProbeReadKernel => "probe_read_kernel",
            Self::ForEachMapElem => "for_each_map_elem",
            Self::Loop => "loop",
            Self::DynptrFromMem => "dynptr_from_mem",
            Self::RingbufReserveDynptr => "ringbuf_reserve_dynptr",
            Self::RingbufSubmitDynptr => "ringbuf_submit_dynptr",
            Self::DynptrRead => "dynptr_read",
            Self::DynptrWrite => "dynptr_write",
            Self::DynptrData => "dynptr_data",
            Self::Snprintf => "snprintf",
            Self::TimerInit => "timer_init",
            Self::TimerSetCallback => "timer_set_callback",
            Self::TimerStart => "timer_start",
        }
    }

    /// Whether the helper rewrites packet payloads, invalidating packet
    /// pointers and being unavailable to read-only kinds.
    pub const fn packet_rewriting(self) -> bool {
        // None of the registered helpers rewrite payloads today; the hook
        // stays because program-kind tables key off it.
        false
    }
}

/// Kind contract of one helper argument register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    /// Slot unused.
    None,
    /// Any initialized scalar.
    Scalar,
    /// A scalar giving the byte size of the preceding memory argument.
    ConstSize {
        /// Whether zero is an acceptable size.
        allow_zero: bool,
    },
    /// A map object.
    ConstMapPtr,
    /// Readable initialized bytes of the preceding map's key size.
    MapKey,
    /// Readable initialized bytes of the preceding map's value size.
    MapValue,
    /// Writable bytes of the preceding map's value size; may be uninit.
    UninitMapValue,
    /// Readable initialized memory; size bound by the following
    /// [`ArgType::ConstSize`].
    Mem {
        /// Whether a null constant is tolerated (size must then be zero).
        maybe_null: bool,
    },
    /// Writable, possibly uninitialized memory the helper fills.
    UninitMem,
    /// The program context object.
    Ctx,
    /// The lock field of a lockable object.
    SpinLock,
    /// The timer field of a map value.
    Timer,
    /// A dynptr slot or runtime dynptr descriptor.
    Dynptr {
        /// Constructor form: slots must be untyped and become a dynptr of
        /// this kind.
        uninit: Option<DynptrKind>,
    },
    /// A null-terminated string in frozen read-only map data.
    ConstStr,
    /// A subprogram address for a callback.
    Callback,
}

/// What a helper leaves in `r0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetType {
    /// Nothing; `r0` is scrambled.
    Void,
    /// An unknown scalar.
    Scalar,
    /// An errno-style scalar in `[-MAX_ERRNO, 0]`.
    ErrnoScalar,
    /// Pointer to the looked-up map's value, or null.
    MapValueOrNull,
    /// Pointer to `size`-byte memory bound by the reserve argument, or
    /// null.
    RingbufMemOrNull,
    /// Pointer into the dynptr's backing memory, or null.
    DynptrMemOrNull,
}

/// Which synthetic frame a callback-calling helper pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    /// `loop(n, cb, ctx, flags)`: `cb(index, ctx)`.
    Loop,
    /// `for_each_map_elem(map, cb, ctx, flags)`: `cb(map, key, value, ctx)`.
    ForEachMapElem,
    /// `timer_set_callback(timer, cb)`: `cb(map, key, value)`, asynchronous.
    Timer,
}

/// Full prototype of one helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuncProto {
    /// Argument contracts for `r1..r5`.
    pub args: [ArgType; 5],
    /// Return contract.
    pub ret: RetType,
    /// `r0` carries a fresh reference that must be released.
    pub acquires: bool,
    /// One-based argument index whose reference is consumed.
    pub releases: Option<usize>,
    /// Callback frame the helper pushes.
    pub callback: Option<CallbackKind>,
    /// Whether the call is tolerated while a spinlock is held.
    pub allowed_with_lock: bool,
}

impl FuncProto {
    const fn new(args: [ArgType; 5], ret: RetType) -> Self {
        Self {
            args,
            ret,
            acquires: false,
            releases: None,
            callback: None,
            allowed_with_lock: false,
        }
    }
}

/// Prototype of `helper`.
pub fn proto(helper: HelperId) -> FuncProto {
    use ArgType as A;
    use RetType as R;
    let n = A::None;
    match helper {
        HelperId::MapLookup => {
            FuncProto::new([A::ConstMapPtr, A::MapKey, n, n, n], R::MapValueOrNull)
        }
        HelperId::MapUpdate => FuncProto::new(
            [A::ConstMapPtr, A::MapKey, A::MapValue, A::Scalar, n],
            R::ErrnoScalar,
        ),
        HelperId::MapDelete => {
            FuncProto::new([A::ConstMapPtr, A::MapKey, n, n, n], R::ErrnoScalar)
        }
        HelperId::GetPrandom | HelperId::KtimeGetNs => {
            FuncProto::new([n, n, n, n, n], R::Scalar)
        }
        HelperId::TracePrintk => FuncProto::new(
            [
                A::ConstStr,
                A::ConstSize { allow_zero: false },
                A::Scalar,
                A::Scalar,
                A::Scalar,
            ],
            R::ErrnoScalar,
        ),
        // Reaching the lock processor with a lock already held reports the
        // precise double-lock diagnostic.
        HelperId::SpinLock => FuncProto {
            allowed_with_lock: true,
            ..FuncProto::new([A::SpinLock, n, n, n, n], R::Void)
        },
        HelperId::SpinUnlock => FuncProto {
            allowed_with_lock: true,
            ..FuncProto::new([A::SpinLock, n, n, n, n], R::Void)
        },
        HelperId::RingbufReserve => FuncProto {
            acquires: true,
            ..FuncProto::new(
                [A::ConstMapPtr, A::ConstSize { allow_zero: false }, A::Scalar, n, n],
                R::RingbufMemOrNull,
            )
        },
        HelperId::RingbufSubmit | HelperId::RingbufDiscard => FuncProto {
            releases: Some(1),
            ..FuncProto::new([A::Mem { maybe_null: false }, A::Scalar, n, n, n], R::Void)
        },
        HelperId::ProbeReadKernel => FuncProto::new(
            [
                A::UninitMem,
                A::ConstSize { allow_zero: true },
                A::Scalar,
                n,
                n,
            ],
            R::ErrnoScalar,
        ),
        HelperId::ForEachMapElem => FuncProto {
            callback: Some(CallbackKind::ForEachMapElem),
            ..FuncProto::new(
                [A::ConstMapPtr, A::Callback, A::Mem { maybe_null: true }, A::Scalar, n],
                R::Scalar,
            )
        },
        HelperId::Loop => FuncProto {
            callback: Some(CallbackKind::Loop),
            ..FuncProto::new(
                [A::Scalar, A::Callback, A::Mem { maybe_null: true }, A::Scalar, n],
                R::Scalar,
            )
        },
        HelperId::DynptrFromMem => FuncProto::new(
            [
                A::Mem { maybe_null: false },
                A::ConstSize { allow_zero: false },
                A::Scalar,
                A::Dynptr {
                    uninit: Some(DynptrKind::Local),
                },
                n,
            ],
            R::ErrnoScalar,
        ),
        HelperId::RingbufReserveDynptr => FuncProto {
            acquires: true,
            ..FuncProto::new(
                [
                    A::ConstMapPtr,
                    A::ConstSize { allow_zero: false },
                    A::Scalar,
                    A::Dynptr {
                        uninit: Some(DynptrKind::Ringbuf),
                    },
                    n,
                ],
                R::ErrnoScalar,
            )
        },
        HelperId::RingbufSubmitDynptr => FuncProto {
            releases: Some(1),
            ..FuncProto::new(
                [A::Dynptr { uninit: None }, A::Scalar, n, n, n],
                R::Void,
            )
        },
        HelperId::DynptrRead => FuncProto::new(
            [
                A::UninitMem,
                A::ConstSize { allow_zero: true },
                A::Dynptr { uninit: None },
                A::Scalar,
                A::Scalar,
            ],
            R::ErrnoScalar,
        ),
        HelperId::DynptrWrite => FuncProto::new(
            [
                A::Dynptr { uninit: None },
                A::Scalar,
                A::Mem { maybe_null: false },
                A::ConstSize { allow_zero: true },
                A::Scalar,
            ],
            R::ErrnoScalar,
        ),
        HelperId::DynptrData => FuncProto::new(
            [A::Dynptr { uninit: None }, A::Scalar, A::Scalar, n, n],
            R::DynptrMemOrNull,
        ),
        HelperId::Snprintf => FuncProto::new(
            [
                A::UninitMem,
                A::ConstSize { allow_zero: true },
                A::ConstStr,
                A::Mem { maybe_null: true },
                A::ConstSize { allow_zero: true },
            ],
            R::ErrnoScalar,
        ),
        HelperId::TimerInit => FuncProto::new(
            [A::Timer, A::ConstMapPtr, A::Scalar, n, n],
            R::ErrnoScalar,
        ),
        HelperId::TimerSetCallback => FuncProto {
            callback: Some(CallbackKind::Timer),
            ..FuncProto::new([A::Timer, A::Callback, n, n, n], R::ErrnoScalar)
        },
        HelperId::TimerStart => FuncProto::new(
            [A::Timer, A::Scalar, A::Scalar, n, n],
            R::ErrnoScalar,
        ),
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn imm_roundtrip() {
        for helper in HelperId::iter() {
            assert_eq!(HelperId::from_imm(helper as i32), Some(helper));
        }
        assert_eq!(HelperId::from_imm(0), None);
        assert_eq!(HelperId::from_imm(-1), None);
    }

    #[test]
    fn size_args_follow_mem_args() {
        // Every ConstSize argument must directly follow the memory argument
        // it sizes; the checker depends on that pairing.
        for helper in HelperId::iter() {
            let proto = proto(helper);
            for (i, arg) in proto.args.iter().enumerate() {
                if matches!(arg, ArgType::ConstSize { .. }) {
                    assert!(i > 0, "{}: size arg in first slot", helper.name());
                    assert!(
                        matches!(
                            proto.args[i - 1],
                            ArgType::Mem { .. }
                                | ArgType::UninitMem
                                | ArgType::ConstStr
                                | ArgType::ConstMapPtr
                        ),
                        "{}: size arg not preceded by memory",
                        helper.name()
                    );
                }
            }
        }
    }

    #[test]
    fn release_helpers_name_a_pointer_arg() {
        for helper in HelperId::iter() {
            let proto = proto(helper);
            if let Some(idx) = proto.releases {
                assert!((1..=5).contains(&idx));
                assert!(!matches!(proto.args[idx - 1], ArgType::None));
            }
        }
    }
}
