//! Call and return processing: subprogram calls, helper calls with their
//! declarative argument contracts, callback frames, and frame exits.

use krait_asm::{
    Instruction,
    PseudoCall,
    RegId,
};

use crate::bounds;
use crate::consts::{
    DYNPTR_SLOTS,
    MAX_CALL_FRAMES,
    MAX_ERRNO,
    MAX_HELPER_MEM,
    SLOT_SIZE,
};
use crate::error::{
    Bug,
    BugVariant,
    Reject,
    VResult,
};
use crate::frame::FuncState;
use crate::helper::{
    proto,
    ArgType,
    CallbackKind,
    FuncProto,
    HelperId,
    RetType,
};
use crate::map::{
    FieldKind,
    MapId,
};
use crate::reg::{
    DynptrKind,
    DynptrState,
    Live,
    PtrBase,
    PtrFlags,
    RegState,
};
use crate::stack::{
    SlotTag,
    Stack,
};
use crate::state::{
    ActiveLock,
    LockObject,
    VerifierState,
};

use super::{
    clobber_caller_saved,
    helper_of,
    Flow,
    Verifier,
};

/// Facts gathered while matching one helper call's arguments.
#[derive(Default)]
struct CallMeta {
    /// Map passed through a map-pointer argument.
    map: Option<MapId>,
    /// Memory argument awaiting its size argument.
    pending_region: Option<PendingRegion>,
    /// Largest byte count a size argument allowed.
    msize_max: Option<u64>,
    /// Reference consumed by a releasing helper.
    release_ref: Option<u32>,
    /// Dynptr slots a releasing helper also invalidates.
    release_dynptr: Option<(usize, usize)>,
    /// Dynptr constructor target: frame, first slot, kind.
    new_dynptr: Option<(usize, usize, DynptrKind)>,
    /// Subprogram passed as a callback.
    callback: Option<usize>,
    /// Constant value of the most recent plain scalar argument.
    last_scalar_const: Option<u64>,
    /// Map containing the timer field of a timer argument.
    timer_map: Option<MapId>,
}

struct PendingRegion {
    regno: RegId,
    reg: RegState,
    write: bool,
    null: bool,
}

impl Verifier<'_> {
    pub(crate) fn check_call(&mut self, insn: Instruction) -> VResult<Flow> {
        if insn.off() != 0 || insn.dst_field() != 0 {
            return Err(self.reject(
                Reject::ReservedFieldSet,
                "reserved fields of call must be zero",
            ));
        }
        match insn.pseudo_call() {
            Some(PseudoCall::Helper) => self.check_helper_call(insn),
            Some(PseudoCall::Subprog) => self.check_subprog_call(insn),
            Some(PseudoCall::Kfunc) => self.check_kfunc_call(insn),
            None => Err(self.reject(
                Reject::ReservedFieldSet,
                format!("invalid call pseudo source {}", insn.src_field()),
            )),
        }
    }

    pub(crate) fn check_exit(&mut self, insn: Instruction) -> VResult<Flow> {
        if insn.off() != 0 || insn.imm() != 0 || insn.dst_field() != 0 || insn.src_field() != 0
        {
            return Err(self.reject(
                Reject::ReservedFieldSet,
                "reserved fields of exit must be zero",
            ));
        }
        if self.cur.curframe == 0 {
            if self.cur.cur_frame().in_callback {
                self.check_callback_return()?;
            } else {
                self.check_frame0_exit()?;
            }
            return Ok(Flow::PathDone);
        }
        self.prepare_func_exit()
    }

    fn check_callback_return(&mut self) -> VResult<()> {
        let r0 = self.read_reg(RegId::R0, Live::READ64)?;
        let in_range = r0.is_scalar() && r0.umin == 0 && r0.umax <= 1;
        if !in_range {
            return Err(self.reject(
                Reject::ValueOutOfRange,
                "callback must return 0 or 1",
            ));
        }
        let frameno = self.cur.curframe;
        let leaked = self
            .cur
            .cur_frame()
            .refs
            .iter()
            .find(|r| r.callback_ref == frameno as u32 + 1)
            .copied();
        if let Some(entry) = leaked {
            return Err(self.reject(
                Reject::UnreleasedReference,
                format!(
                    "Unreleased reference id={} acquired inside the callback",
                    entry.id
                ),
            ));
        }
        Ok(())
    }

    /// Return from a nested frame into its caller.
    fn prepare_func_exit(&mut self) -> VResult<Flow> {
        let callee = self.cur.cur_frame().clone();
        let callsite = callee.callsite.ok_or_else(|| {
            crate::error::VerifierError::from(Bug::new(
                BugVariant::FrameOutOfRange,
                self.insn_idx,
            ))
        })?;

        if callee.in_callback {
            self.check_callback_return()?;
        } else {
            // The caller consumes r0; it must at least be written.
            let r0 = self.cur.reg(RegId::R0);
            if !r0.is_init() {
                return Err(self.reject(
                    Reject::UninitRegister,
                    "R0 !read_ok at subprogram exit",
                ));
            }
        }

        let r0 = self.cur.reg(RegId::R0).clone();
        self.cur.frames.pop();
        self.cur.curframe -= 1;
        // The reference set is shared; the callee's view is current.
        self.cur.cur_frame_mut().refs = callee.refs;
        if !callee.in_callback {
            let out = self.cur.reg_mut(RegId::R0);
            let live = out.live;
            *out = r0;
            out.live = live | Live::WRITTEN;
        }
        Ok(Flow::Next(callsite + 1))
    }

    fn check_subprog_call(&mut self, insn: Instruction) -> VResult<Flow> {
        let target = (self.insn_idx as i64 + 1 + insn.imm() as i64) as usize;
        let subprog = self.cfg.subprog_starting_at(target).ok_or_else(|| {
            crate::error::VerifierError::from(Bug::new(
                BugVariant::FrameOutOfRange,
                self.insn_idx,
            ))
        })?;
        if self.cur.frames.len() >= MAX_CALL_FRAMES {
            return Err(self.reject(
                Reject::CallStackTooDeep,
                format!("the call stack of {} frames is too deep", self.cur.frames.len()),
            ));
        }
        if self.cur.active_lock.is_some() {
            return Err(self.reject(
                Reject::CallWithLockHeld,
                "subprogram call with a lock held",
            ));
        }
        self.aux[self.insn_idx].call_subprog = Some(subprog);

        let frameno = self.cur.frames.len();
        let caller = self.cur.cur_frame().clone();
        let mut callee = FuncState::new(frameno, subprog, Some(self.insn_idx));
        callee.refs = caller.refs.clone();
        for r in [RegId::R1, RegId::R2, RegId::R3, RegId::R4, RegId::R5] {
            let mut arg = caller.reg(r).clone();
            arg.live = Live::WRITTEN;
            *callee.reg_mut(r) = arg;
        }
        clobber_caller_saved(self.cur.cur_frame_mut());
        self.cur.frames.push(callee);
        self.cur.curframe = frameno;
        Ok(Flow::Next(target))
    }

    // ------------------------------------------------------------------
    // Helper calls
    // ------------------------------------------------------------------

    fn check_helper_call(&mut self, insn: Instruction) -> VResult<Flow> {
        let helper = helper_of(insn).ok_or_else(|| {
            self.reject(
                Reject::UnknownOpcode,
                format!("invalid helper id {}", insn.imm()),
            )
        })?;
        if !self.ops.helper_allowed(helper) {
            return Err(self.reject(
                Reject::BadCallArgument,
                format!(
                    "helper {} not allowed for {} programs",
                    helper.name(),
                    self.ops.name()
                ),
            ));
        }
        let proto = proto(helper);
        if self.cur.active_lock.is_some() && !proto.allowed_with_lock {
            return Err(self.reject(
                Reject::CallWithLockHeld,
                format!("call to {} with a lock held", helper.name()),
            ));
        }

        let mut meta = CallMeta::default();
        for (i, arg) in proto.args.iter().enumerate() {
            self.check_helper_arg(helper, i, *arg, &mut meta)?;
        }
        self.flush_pending_region(&mut meta, None)?;

        if let Some(idx) = proto.releases {
            self.apply_release(helper, idx, &meta)?;
        }
        if let Some((frameno, slot, kind)) = meta.new_dynptr {
            self.materialize_dynptr(frameno, slot, kind)?;
        }

        if let Some(cb) = proto.callback {
            return self.push_callback_frame(helper, cb, &proto, meta);
        }

        self.apply_helper_ret(helper, &proto, &meta)?;
        Ok(Flow::Next(self.insn_idx + 1))
    }

    fn check_helper_arg(
        &mut self,
        helper: HelperId,
        argno: usize,
        arg: ArgType,
        meta: &mut CallMeta,
    ) -> VResult<()> {
        let regno = RegId::new(argno as u8 + 1).expect("argument registers are r1..r5");
        if matches!(arg, ArgType::None) {
            return Ok(());
        }
        let reg = self.read_reg(regno, Live::READ64)?;

        // A size argument always closes the preceding memory argument.
        if !matches!(arg, ArgType::ConstSize { .. }) {
            self.flush_pending_region(meta, None)?;
        }

        match arg {
            ArgType::None => {}
            ArgType::Scalar => {
                if !reg.is_scalar() {
                    return Err(self.bad_arg(helper, regno, &reg, "a scalar"));
                }
                meta.last_scalar_const = reg.const_value();
            }
            ArgType::ConstSize { allow_zero } => {
                if !reg.is_scalar() {
                    return Err(self.bad_arg(helper, regno, &reg, "a size scalar"));
                }
                if !allow_zero && reg.umin == 0 {
                    return Err(self.reject(
                        Reject::BadCallArgument,
                        format!("R{} size must be nonzero", regno.val()),
                    ));
                }
                if reg.umax > MAX_HELPER_MEM {
                    return Err(self.reject(
                        Reject::BadCallArgument,
                        format!("R{} size is out of range", regno.val()),
                    ));
                }
                // The exact size feeds bounds checks downstream.
                self.mark_chain_precision(self.cur.curframe, regno.index())?;
                meta.msize_max = Some(reg.umax);
                self.flush_pending_region(meta, Some(reg.umax))?;
            }
            ArgType::ConstMapPtr => {
                let Some(PtrBase::ConstMap(map)) = reg.ptr_base() else {
                    return Err(self.bad_arg(helper, regno, &reg, "a map object"));
                };
                meta.map = Some(map);
                self.aux[self.insn_idx].observe_map_ptr(map);
            }
            ArgType::MapKey => {
                let map = meta.map.ok_or_else(|| {
                    crate::error::VerifierError::from(Bug::new(
                        BugVariant::UnexpectedRegState,
                        self.insn_idx,
                    ))
                })?;
                let key_size = self.map_def(map)?.key_size as u64;
                self.check_helper_region(helper, regno, &reg, key_size, false)?;
                let key = self.stack_region_constant(&reg, key_size);
                self.aux[self.insn_idx].observe_map_key(key);
            }
            ArgType::MapValue | ArgType::UninitMapValue => {
                let map = meta.map.ok_or_else(|| {
                    crate::error::VerifierError::from(Bug::new(
                        BugVariant::UnexpectedRegState,
                        self.insn_idx,
                    ))
                })?;
                let value_size = self.map_def(map)?.value_size as u64;
                let write = matches!(arg, ArgType::UninitMapValue);
                self.check_helper_region(helper, regno, &reg, value_size, write)?;
            }
            ArgType::Mem { maybe_null } => {
                if maybe_null && reg.const_value() == Some(0) {
                    meta.pending_region = Some(PendingRegion {
                        regno,
                        reg,
                        write: false,
                        null: true,
                    });
                    return Ok(());
                }
                if !mem_arg_compatible(&reg) {
                    return Err(self.bad_arg(helper, regno, &reg, "readable memory"));
                }
                if reg.ref_obj_id != 0 {
                    meta.release_ref = Some(reg.ref_obj_id);
                }
                meta.pending_region = Some(PendingRegion {
                    regno,
                    reg,
                    write: false,
                    null: false,
                });
            }
            ArgType::UninitMem => {
                if !mem_arg_compatible(&reg) {
                    return Err(self.bad_arg(helper, regno, &reg, "writable memory"));
                }
                meta.pending_region = Some(PendingRegion {
                    regno,
                    reg,
                    write: true,
                    null: false,
                });
            }
            ArgType::Ctx => {
                if reg.ptr_base() != Some(PtrBase::Ctx) {
                    return Err(self.bad_arg(helper, regno, &reg, "the context object"));
                }
            }
            ArgType::SpinLock => {
                self.check_spin_lock_arg(helper, regno, &reg)?;
            }
            ArgType::Timer => {
                let Some(PtrBase::MapValue { map, .. }) = reg.ptr_base() else {
                    return Err(self.bad_arg(helper, regno, &reg, "a map value timer field"));
                };
                let def = self.map_def(map)?;
                let at_timer = def
                    .field_at(reg.off.max(0) as u32)
                    .is_some_and(|f| matches!(f.kind, FieldKind::Timer));
                if !reg.fixed_off() || !at_timer {
                    return Err(self.reject(
                        Reject::BadCallArgument,
                        format!("R{} does not point at a timer field", regno.val()),
                    ));
                }
                meta.timer_map = Some(map);
            }
            ArgType::Dynptr { uninit } => {
                self.check_dynptr_arg(helper, regno, &reg, uninit, meta)?;
            }
            ArgType::ConstStr => {
                self.check_const_str_arg(helper, regno, &reg)?;
                meta.pending_region = Some(PendingRegion {
                    regno,
                    reg,
                    write: false,
                    null: false,
                });
            }
            ArgType::Callback => {
                let Some(PtrBase::Func { subprog }) = reg.ptr_base() else {
                    return Err(self.bad_arg(helper, regno, &reg, "a function address"));
                };
                meta.callback = Some(subprog as usize);
            }
        }
        Ok(())
    }

    fn bad_arg(
        &mut self,
        helper: HelperId,
        regno: RegId,
        reg: &RegState,
        expected: &str,
    ) -> crate::error::VerifierError {
        self.reject(
            Reject::BadCallArgument,
            format!(
                "R{} type={} expected {} for {}",
                regno.val(),
                reg,
                expected,
                helper.name()
            ),
        )
    }

    /// A memory argument whose size argument never arrived is checked with
    /// an explicit size; otherwise the size argument supplies it.
    fn flush_pending_region(
        &mut self,
        meta: &mut CallMeta,
        size: Option<u64>,
    ) -> VResult<()> {
        let Some(region) = meta.pending_region.take() else {
            return Ok(());
        };
        if region.null {
            if size.is_some_and(|s| s > 0) {
                return Err(self.reject(
                    Reject::BadCallArgument,
                    format!("R{} is null but the size is nonzero", region.regno.val()),
                ));
            }
            return Ok(());
        }
        let len = match size {
            Some(len) => len,
            // Sizeless regions (e.g. release arguments) only need the
            // pointer itself to be valid, which the match established.
            None => return Ok(()),
        };
        if len == 0 {
            return Ok(());
        }
        self.check_helper_region(
            HelperId::MapLookup,
            region.regno,
            &region.reg,
            len,
            region.write,
        )
    }

    /// Validate a `len`-byte region behind `reg` for helper consumption.
    fn check_helper_region(
        &mut self,
        _helper: HelperId,
        regno: RegId,
        reg: &RegState,
        len: u64,
        write: bool,
    ) -> VResult<()> {
        if reg.maybe_null() {
            return Err(self.reject(
                Reject::MaybeNullDeref,
                format!("R{} may be null where memory is required", regno.val()),
            ));
        }
        match reg.ptr_base() {
            Some(PtrBase::Stack { frameno }) => {
                self.check_stack_region(frameno as usize, regno, reg, len, write)
            }
            Some(PtrBase::MapValue { map, .. }) => {
                let def = self.map_def(map)?.clone();
                let lo = reg.off as i64 + reg.smin;
                let hi = reg.off as i64 + reg.umax as i64 + len as i64;
                if lo < 0 || hi > def.value_size as i64 {
                    return Err(self.reject(
                        Reject::OutOfBounds,
                        format!(
                            "R{} region [{}..{}) escapes map value of {} bytes",
                            regno.val(),
                            lo,
                            hi,
                            def.value_size
                        ),
                    ));
                }
                if write && def.frozen {
                    return Err(self.reject(
                        Reject::ReadOnly,
                        format!("write into frozen map {}", def.name),
                    ));
                }
                if let Some(field) = def.field_overlapping(lo as u64, (hi - lo) as u64) {
                    if !matches!(field.kind, FieldKind::Kptr { .. }) || write {
                        return Err(self.reject(
                            Reject::OutOfBounds,
                            format!(
                                "R{} region overlaps a typed field at {}",
                                regno.val(),
                                field.offset
                            ),
                        ));
                    }
                }
                Ok(())
            }
            Some(PtrBase::Packet { range } | PtrBase::PacketMeta { range }) => {
                if write && !self.ops.packet_writable() {
                    return Err(self.reject(
                        Reject::ReadOnly,
                        "packet is read only for this program kind",
                    ));
                }
                let lo = reg.off as i64 + reg.smin;
                let hi = reg.off as i64 + reg.umax as i64 + len as i64;
                if lo < 0 || hi > range as i64 {
                    return Err(self.reject(
                        Reject::OutOfBounds,
                        format!("R{} region escapes the proven packet range", regno.val()),
                    ));
                }
                Ok(())
            }
            Some(PtrBase::Mem { size } | PtrBase::Buf { size }) => {
                if write && reg.ptr_flags().contains(PtrFlags::RDONLY) {
                    return Err(self.reject(
                        Reject::ReadOnly,
                        format!("R{} is read-only memory", regno.val()),
                    ));
                }
                let lo = reg.off as i64 + reg.smin;
                let hi = reg.off as i64 + reg.umax as i64 + len as i64;
                if lo < 0 || hi > size as i64 {
                    return Err(self.reject(
                        Reject::OutOfBounds,
                        format!("R{} region escapes the memory object", regno.val()),
                    ));
                }
                Ok(())
            }
            _ => Err(self.reject(
                Reject::BadCallArgument,
                format!("R{} type={} cannot supply a memory region", regno.val(), reg),
            )),
        }
    }

    /// A stack-backed region: reads need initialized bytes, writes mark
    /// them.
    fn check_stack_region(
        &mut self,
        frameno: usize,
        regno: RegId,
        reg: &RegState,
        len: u64,
        write: bool,
    ) -> VResult<()> {
        if !reg.fixed_off() {
            return Err(self.reject(
                Reject::OutOfBounds,
                format!("R{} variable stack region for a call", regno.val()),
            ));
        }
        let start = reg.off as i64;
        let end = start + len as i64;
        if start >= 0 || start < -(crate::consts::MAX_STACK as i64) || end > 0 {
            return Err(self.reject(
                Reject::OutOfBounds,
                format!(
                    "R{} stack region [{start}..{end}) out of bounds",
                    regno.val()
                ),
            ));
        }
        let lo_slot = Stack::slot_of(end - 1).expect("range-checked");
        let hi_slot = Stack::slot_of(start).expect("range-checked");

        if write {
            self.destroy_typed_objects(frameno, lo_slot, hi_slot)?;
            let frame = &mut self.cur.frames[frameno];
            frame.stack.grow_to(start);
            for byte_off in start..end {
                let slot_idx = Stack::slot_of(byte_off).expect("range-checked");
                let slot = frame
                    .stack
                    .slot_mut(slot_idx)
                    .expect("stack was grown to cover the region");
                if slot.is_spilled_reg() {
                    slot.spilled = RegState::not_init();
                    for tag in slot.tags.iter_mut() {
                        *tag = SlotTag::Misc;
                    }
                }
                slot.tags[Stack::byte_of(byte_off)] = SlotTag::Misc;
            }
        } else {
            let allow_uninit = self
                .config
                .caps
                .contains(crate::ctx::Caps::ALLOW_UNINIT_STACK);
            for byte_off in start..end {
                let slot_idx = Stack::slot_of(byte_off).expect("range-checked");
                let spilled_ptr = self.cur.frames[frameno]
                    .stack
                    .slot(slot_idx)
                    .is_some_and(|s| s.is_spilled_reg() && s.spilled.is_ptr());
                if spilled_ptr {
                    return Err(self.reject(
                        Reject::PointerLeak,
                        format!("R{} region contains a spilled pointer", regno.val()),
                    ));
                }
                let tag = self.cur.frames[frameno].stack.byte_tag(byte_off);
                match tag {
                    SlotTag::Invalid if !allow_uninit => {
                        return Err(self.reject(
                            Reject::UninitStack,
                            format!(
                                "invalid indirect read from stack off {byte_off}"
                            ),
                        ));
                    }
                    SlotTag::Dynptr | SlotTag::Iter => {
                        return Err(self.reject(
                            Reject::BadRegisterType,
                            "region overlaps a typed stack object",
                        ));
                    }
                    _ => {}
                }
            }
        }
        for slot_idx in lo_slot..=hi_slot {
            self.mark_stack_read_at(frameno, slot_idx, Live::READ64)?;
        }
        let subprogno = self.cur.frames[frameno].subprogno;
        let depth = &mut self.cfg.subprogs[subprogno].stack_depth;
        *depth = (*depth).max((-start) as u32);
        Ok(())
    }

    /// A small stack region fully covered by a spilled constant yields the
    /// constant, feeding the lookup-site key tracking.
    fn stack_region_constant(&self, reg: &RegState, len: u64) -> Option<u64> {
        let PtrBase::Stack { frameno } = reg.ptr_base()? else {
            return None;
        };
        if !reg.fixed_off() || len > SLOT_SIZE as u64 {
            return None;
        }
        let slot_idx = Stack::slot_of(reg.off as i64)?;
        let slot = self.cur.frames[frameno as usize].stack.slot(slot_idx)?;
        if slot.is_spilled_reg() && reg.off % SLOT_SIZE as i32 == 0 {
            return slot.spilled.const_value();
        }
        if slot.uniform() == Some(SlotTag::Zero) {
            return Some(0);
        }
        None
    }

    fn check_spin_lock_arg(
        &mut self,
        helper: HelperId,
        regno: RegId,
        reg: &RegState,
    ) -> VResult<()> {
        let Some(PtrBase::MapValue { map, .. }) = reg.ptr_base() else {
            return Err(self.bad_arg(helper, regno, &reg.clone(), "a lockable map value"));
        };
        let def = self.map_def(map)?;
        let at_lock = reg.fixed_off()
            && reg.off >= 0
            && def
                .field_at(reg.off as u32)
                .is_some_and(|f| matches!(f.kind, FieldKind::SpinLock));
        if !at_lock {
            return Err(self.reject(
                Reject::BadCallArgument,
                format!("R{} does not point at a spin lock field", regno.val()),
            ));
        }
        let lock = ActiveLock {
            object: LockObject::MapValue(map),
            id: reg.id,
        };
        match helper {
            HelperId::SpinLock => {
                if self.cur.active_lock.is_some() {
                    return Err(self.reject(
                        Reject::DoubleLock,
                        "a lock is already held",
                    ));
                }
                self.cur.active_lock = Some(lock);
            }
            HelperId::SpinUnlock => match self.cur.active_lock {
                Some(held) if held == lock => {
                    self.cur.active_lock = None;
                    invalidate_non_owning_refs(&mut self.cur);
                }
                Some(_) => {
                    return Err(self.reject(
                        Reject::WrongUnlock,
                        "unlock of a different lock than the one held",
                    ));
                }
                None => {
                    return Err(self.reject(
                        Reject::WrongUnlock,
                        "unlock without a held lock",
                    ));
                }
            },
            _ => {
                return Err(crate::error::VerifierError::from(Bug::new(
                    BugVariant::UnexpectedRegState,
                    self.insn_idx,
                )))
            }
        }
        Ok(())
    }

    fn check_dynptr_arg(
        &mut self,
        helper: HelperId,
        regno: RegId,
        reg: &RegState,
        uninit: Option<DynptrKind>,
        meta: &mut CallMeta,
    ) -> VResult<()> {
        if let Some(PtrBase::ConstDynptr { .. }) = reg.ptr_base() {
            if uninit.is_some() {
                return Err(self.reject(
                    Reject::BadCallArgument,
                    format!("R{} runtime dynptr cannot be initialized again", regno.val()),
                ));
            }
            return Ok(());
        }
        let Some(PtrBase::Stack { frameno }) = reg.ptr_base() else {
            return Err(self.bad_arg(helper, regno, &reg.clone(), "a dynptr"));
        };
        let frameno = frameno as usize;
        if !reg.fixed_off() || reg.off % SLOT_SIZE as i32 != 0 {
            return Err(self.reject(
                Reject::BadCallArgument,
                format!("R{} dynptr must sit at an aligned stack offset", regno.val()),
            ));
        }
        let end = reg.off as i64 + (DYNPTR_SLOTS as i64 * SLOT_SIZE as i64);
        if reg.off >= 0 || end > 0 || (reg.off as i64) < -(crate::consts::MAX_STACK as i64) {
            return Err(self.reject(
                Reject::OutOfBounds,
                format!("R{} dynptr slots out of stack bounds", regno.val()),
            ));
        }
        let first_slot = Stack::slot_of(end - 1).expect("range-checked");

        match uninit {
            Some(kind) => {
                // The slots must hold no live object yet.
                let occupied = (first_slot..first_slot + DYNPTR_SLOTS).any(|idx| {
                    self.cur.frames[frameno]
                        .stack
                        .slot(idx)
                        .is_some_and(|s| s.holds_typed_obj() || s.is_spilled_reg())
                });
                if occupied {
                    return Err(self.reject(
                        Reject::BadCallArgument,
                        format!("R{} dynptr slots are already in use", regno.val()),
                    ));
                }
                meta.new_dynptr = Some((frameno, first_slot, kind));
            }
            None => {
                let head = self.cur.frames[frameno]
                    .stack
                    .slot(first_slot)
                    .filter(|s| {
                        s.spilled
                            .dynptr
                            .is_some_and(|d| d.first_slot)
                    })
                    .cloned();
                let Some(head) = head else {
                    return Err(self.reject(
                        Reject::BadCallArgument,
                        format!("R{} expected an initialized dynptr", regno.val()),
                    ));
                };
                if head.spilled.ref_obj_id != 0 {
                    meta.release_ref = Some(head.spilled.ref_obj_id);
                    meta.release_dynptr = Some((frameno, first_slot));
                }
                self.mark_stack_read_at(frameno, first_slot, Live::READ64)?;
            }
        }
        Ok(())
    }

    fn materialize_dynptr(
        &mut self,
        frameno: usize,
        first_slot: usize,
        kind: DynptrKind,
    ) -> VResult<()> {
        let ref_id = if kind.refcounted() {
            let id = self.next_id();
            let callback_ref = if self.cur.cur_frame().in_callback {
                self.cur.curframe as u32 + 1
            } else {
                0
            };
            let insn_idx = self.insn_idx;
            self.cur.frames[frameno].acquire_ref(id, insn_idx, callback_ref);
            id
        } else {
            0
        };
        let frame = &mut self.cur.frames[frameno];
        let grow_off = -((first_slot as i64 + DYNPTR_SLOTS as i64) * SLOT_SIZE as i64);
        frame.stack.grow_to(grow_off);
        for (i, idx) in (first_slot..first_slot + DYNPTR_SLOTS).enumerate() {
            let slot = frame
                .stack
                .slot_mut(idx)
                .expect("stack was grown to cover the dynptr");
            let mut state = RegState::not_init();
            state.dynptr = Some(DynptrState {
                kind,
                first_slot: i == 0,
            });
            if i == 0 {
                state.ref_obj_id = ref_id;
            }
            state.live = Live::WRITTEN;
            slot.spilled = state;
            slot.tags = [SlotTag::Dynptr; 8];
        }
        Ok(())
    }

    fn check_const_str_arg(
        &mut self,
        _helper: HelperId,
        regno: RegId,
        reg: &RegState,
    ) -> VResult<()> {
        let Some(PtrBase::MapValue { map, .. }) = reg.ptr_base() else {
            return Err(self.reject(
                Reject::BadCallArgument,
                format!("R{} format string must live in read-only map data", regno.val()),
            ));
        };
        let (frozen, nul_terminated) = {
            let def = self.map_def(map)?;
            let frozen = def.readonly_constant() && reg.fixed_off() && reg.off >= 0;
            let nul_terminated = frozen
                && def.rdonly_data.as_ref().is_some_and(|data| {
                    data.get(reg.off as usize..)
                        .is_some_and(|tail| tail.iter().any(|&b| b == 0))
                });
            (frozen, nul_terminated)
        };
        if !frozen {
            return Err(self.reject(
                Reject::BadCallArgument,
                format!("R{} format string must be a frozen constant", regno.val()),
            ));
        }
        if !nul_terminated {
            return Err(self.reject(
                Reject::BadCallArgument,
                "format string is not NUL terminated",
            ));
        }
        Ok(())
    }

    fn apply_release(
        &mut self,
        helper: HelperId,
        _arg_idx: usize,
        meta: &CallMeta,
    ) -> VResult<()> {
        let Some(id) = meta.release_ref else {
            return Err(self.reject(
                Reject::ReleaseWithoutAcquire,
                format!("{} expects a reference-carrying argument", helper.name()),
            ));
        };
        if !self.cur.cur_frame_mut().release_ref(id) {
            return Err(self.reject(
                Reject::ReleaseWithoutAcquire,
                format!("release of reference id={id} that was not acquired"),
            ));
        }
        self.cur.invalidate_ref(id);
        if let Some((frameno, first_slot)) = meta.release_dynptr {
            let frame = &mut self.cur.frames[frameno];
            for idx in first_slot..first_slot + DYNPTR_SLOTS {
                if let Some(slot) = frame.stack.slot_mut(idx) {
                    slot.invalidate();
                }
            }
        }
        Ok(())
    }

    fn apply_helper_ret(
        &mut self,
        helper: HelperId,
        proto: &FuncProto,
        meta: &CallMeta,
    ) -> VResult<()> {
        clobber_caller_saved(self.cur.cur_frame_mut());
        let r0 = RegId::R0;
        match proto.ret {
            RetType::Void => {
                // r0 stays scrambled.
            }
            RetType::Scalar => {
                let out = self.cur.reg_mut(r0);
                *out = RegState::unknown_scalar();
                out.live = Live::WRITTEN;
            }
            RetType::ErrnoScalar => {
                let mut out = RegState::unknown_scalar();
                out.smin = -MAX_ERRNO;
                out.smax = 0;
                bounds::sync_bounds(&mut out);
                out.live = Live::WRITTEN;
                *self.cur.reg_mut(r0) = out;
            }
            RetType::MapValueOrNull => {
                let map = meta.map.ok_or_else(|| {
                    crate::error::VerifierError::from(Bug::new(
                        BugVariant::UnexpectedRegState,
                        self.insn_idx,
                    ))
                })?;
                if !self.map_def(map)?.kind.supports_lookup() {
                    return Err(self.reject(
                        Reject::BadCallArgument,
                        format!("{} does not support element lookup", helper.name()),
                    ));
                }
                let uid = self.next_id();
                let id = self.next_id();
                let mut out = RegState::pointer(
                    PtrBase::MapValue { map, uid },
                    PtrFlags::MAYBE_NULL,
                );
                out.id = id;
                out.live = Live::WRITTEN;
                *self.cur.reg_mut(r0) = out;
            }
            RetType::RingbufMemOrNull => {
                let size = meta.msize_max.unwrap_or(0);
                let Ok(size) = u32::try_from(size) else {
                    return Err(self.reject(
                        Reject::BadCallArgument,
                        "reservation size out of range",
                    ));
                };
                let id = self.next_id();
                let mut out = RegState::pointer(
                    PtrBase::Mem { size },
                    PtrFlags::RINGBUF | PtrFlags::MAYBE_NULL,
                );
                out.id = id;
                if proto.acquires {
                    out.ref_obj_id = id;
                    let callback_ref = if self.cur.cur_frame().in_callback {
                        self.cur.curframe as u32 + 1
                    } else {
                        0
                    };
                    let insn_idx = self.insn_idx;
                    self.cur
                        .cur_frame_mut()
                        .acquire_ref(id, insn_idx, callback_ref);
                }
                out.live = Live::WRITTEN;
                *self.cur.reg_mut(r0) = out;
            }
            RetType::DynptrMemOrNull => {
                let Some(size) = meta.last_scalar_const else {
                    return Err(self.reject(
                        Reject::BadCallArgument,
                        "the slice length must be a known constant",
                    ));
                };
                let Ok(size) = u32::try_from(size) else {
                    return Err(self.reject(
                        Reject::BadCallArgument,
                        "the slice length is out of range",
                    ));
                };
                let id = self.next_id();
                let mut out =
                    RegState::pointer(PtrBase::Mem { size }, PtrFlags::MAYBE_NULL);
                out.id = id;
                out.live = Live::WRITTEN;
                *self.cur.reg_mut(r0) = out;
            }
        }
        Ok(())
    }

    /// Synchronous callback: apply the helper's own effects to the caller,
    /// then verify the callback body in a fresh frame.
    fn push_callback_frame(
        &mut self,
        helper: HelperId,
        kind: CallbackKind,
        proto: &FuncProto,
        meta: CallMeta,
    ) -> VResult<Flow> {
        let Some(subprog) = meta.callback else {
            return Err(self.reject(
                Reject::BadCallArgument,
                format!("{} requires a callback", helper.name()),
            ));
        };
        if kind == CallbackKind::Timer {
            return self.push_async_callback(helper, subprog, proto, meta);
        }
        if self.cur.frames.len() >= MAX_CALL_FRAMES {
            return Err(self.reject(
                Reject::CallStackTooDeep,
                "callback nests the call stack too deep",
            ));
        }
        // The helper returns before the callback frame is entered, from the
        // verifier's point of view.
        let ctx_arg = self.cur.reg(RegId::R3).clone();
        self.apply_helper_ret(helper, proto, &meta)?;

        let frameno = self.cur.frames.len();
        let target = self.cfg.subprogs[subprog].start;
        let mut callee = FuncState::new(frameno, subprog, Some(self.insn_idx));
        callee.refs = self.cur.cur_frame().refs.clone();
        callee.in_callback = true;

        match kind {
            CallbackKind::Loop => {
                // cb(index, ctx)
                let mut index = RegState::unknown_scalar();
                index.live = Live::WRITTEN;
                *callee.reg_mut(RegId::R1) = index;
                let mut ctx = ctx_arg;
                ctx.live = Live::WRITTEN;
                *callee.reg_mut(RegId::R2) = ctx;
            }
            CallbackKind::ForEachMapElem => {
                // cb(map, key, value, ctx)
                let map = meta.map.ok_or_else(|| {
                    crate::error::VerifierError::from(Bug::new(
                        BugVariant::UnexpectedRegState,
                        self.insn_idx,
                    ))
                })?;
                let uid = self.next_id();
                let mut map_reg =
                    RegState::pointer(PtrBase::ConstMap(map), PtrFlags::empty());
                map_reg.live = Live::WRITTEN;
                *callee.reg_mut(RegId::R1) = map_reg;
                let mut key = RegState::pointer(PtrBase::MapKey(map), PtrFlags::empty());
                key.live = Live::WRITTEN;
                *callee.reg_mut(RegId::R2) = key;
                let mut value = RegState::pointer(
                    PtrBase::MapValue { map, uid },
                    PtrFlags::empty(),
                );
                value.live = Live::WRITTEN;
                *callee.reg_mut(RegId::R3) = value;
                let mut ctx = ctx_arg;
                ctx.live = Live::WRITTEN;
                *callee.reg_mut(RegId::R4) = ctx;
            }
            CallbackKind::Timer => unreachable!("handled above via push_async_callback"),
        }

        self.cur.frames.push(callee);
        self.cur.curframe = frameno;
        Ok(Flow::Next(target))
    }

    /// Asynchronous callback: runs after the program returns, so it is
    /// verified as an independent exploration seeded with the arguments
    /// the runtime will pass.
    fn push_async_callback(
        &mut self,
        helper: HelperId,
        subprog: usize,
        proto: &FuncProto,
        meta: CallMeta,
    ) -> VResult<Flow> {
        let map = meta.timer_map.ok_or_else(|| {
            crate::error::VerifierError::from(Bug::new(
                BugVariant::UnexpectedRegState,
                self.insn_idx,
            ))
        })?;
        let target = self.cfg.subprogs[subprog].start;

        let mut frame = FuncState::new(0, subprog, Some(self.insn_idx));
        frame.in_callback = true;
        frame.in_async_callback = true;
        // cb(map, key, value)
        let mut map_reg = RegState::pointer(PtrBase::ConstMap(map), PtrFlags::empty());
        map_reg.live = Live::WRITTEN;
        *frame.reg_mut(RegId::R1) = map_reg;
        let mut key = RegState::pointer(PtrBase::MapKey(map), PtrFlags::empty());
        key.live = Live::WRITTEN;
        *frame.reg_mut(RegId::R2) = key;
        let uid = self.next_id();
        let mut value =
            RegState::pointer(PtrBase::MapValue { map, uid }, PtrFlags::empty());
        value.live = Live::WRITTEN;
        *frame.reg_mut(RegId::R3) = value;

        let mut state = VerifierState::entry();
        state.frames = vec![frame];
        state.first_insn_idx = target;
        state.last_insn_idx = target;
        state.branches = 1;
        if self.worklist.len() >= self.config.fork_limit {
            return Err(self.reject(
                Reject::ForkLimit,
                "fork budget exhausted scheduling the async callback",
            ));
        }
        self.worklist.push(crate::state::BranchEntry {
            state,
            insn_idx: target,
            prev_insn_idx: Some(self.insn_idx),
            spec_origin: None,
        });

        self.apply_helper_ret(helper, proto, &meta)?;
        Ok(Flow::Next(self.insn_idx + 1))
    }
}

/// Pointer kinds acceptable as helper memory regions.
fn mem_arg_compatible(reg: &RegState) -> bool {
    matches!(
        reg.ptr_base(),
        Some(
            PtrBase::Stack { .. }
                | PtrBase::MapValue { .. }
                | PtrBase::MapKey(_)
                | PtrBase::Packet { .. }
                | PtrBase::PacketMeta { .. }
                | PtrBase::Mem { .. }
                | PtrBase::Buf { .. }
        )
    )
}

/// Leaving the lock's protection ends every non-owning view of
/// collection-held allocations.
pub(crate) fn invalidate_non_owning_refs(state: &mut VerifierState) {
    for frame in &mut state.frames {
        for reg in frame.regs.iter_mut() {
            if reg.ptr_flags().contains(PtrFlags::NON_OWN_REF) {
                let live = reg.live;
                *reg = RegState::not_init();
                reg.live = live;
            }
        }
        for (_, slot) in frame.stack.iter_mut() {
            if slot.is_spilled_reg()
                && slot.spilled.ptr_flags().contains(PtrFlags::NON_OWN_REF)
            {
                slot.invalidate();
            }
        }
    }
}
