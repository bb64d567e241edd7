//! Load, store, and atomic access rules.
//!
//! Every access computes the minimum and maximum effective offset from the
//! base register's fixed offset, variable tracking, and the instruction
//! displacement, then checks both ends against the legal extent of the
//! pointer kind. Stack accesses additionally maintain the byte-tag model
//! and the spill/fill discipline.

use krait_asm::{
    AtomicOp,
    Class,
    Instruction,
    MemSize,
    Mode,
    RegId,
};

use crate::bounds;
use crate::consts::{
    MAX_STACK,
    PACKET_HEAD_ALIGN,
    SLOT_SIZE,
};
use crate::ctx::{
    Caps,
    CtxAccess,
};
use crate::error::{
    Reject,
    VResult,
};
use crate::ktype::KtypeFieldKind;
use crate::map::FieldKind;
use crate::reg::{
    Live,
    PtrBase,
    PtrFlags,
    RegKind,
    RegState,
};
use crate::stack::{
    SlotTag,
    Stack,
};

use super::Verifier;

/// Direction of an access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Read,
    Write,
}

/// What a load produces.
pub(crate) enum Loaded {
    /// An unknown scalar of the access width.
    Scalar,
    /// A known constant.
    Const(u64),
    /// A typed value (context pointer field, spill fill, kptr load).
    Reg(RegState),
}

impl Verifier<'_> {
    pub(crate) fn check_load(&mut self, insn: Instruction) -> VResult<()> {
        let mode = insn.mode();
        if !matches!(mode, Some(Mode::Mem | Mode::MemSx)) {
            return Err(self.reject(
                Reject::UnknownOpcode,
                format!("invalid load mode in opcode {:#04x}", insn.opcode()),
            ));
        }
        let sign_extend = mode == Some(Mode::MemSx);
        let size = insn.mem_size();
        if sign_extend && size == MemSize::Double {
            return Err(self.reject(
                Reject::ReservedFieldSet,
                "sign-extending load of a full word is meaningless",
            ));
        }
        let dst = insn.dst().ok_or_else(|| {
            self.reject(Reject::BadRegisterType, "invalid destination register field")
        })?;
        let src = insn.src().ok_or_else(|| {
            self.reject(Reject::BadRegisterType, "invalid source register field")
        })?;

        let base_reg = self.read_reg(src, Live::READ64)?;
        let loaded = self.check_mem_access(
            src,
            &base_reg,
            insn.off() as i64,
            size,
            Access::Read,
            None,
            None,
        )?;

        self.writable_reg(dst)?;
        let live = self.cur.reg(dst).live;
        let out = self.cur.reg_mut(dst);
        match loaded {
            Loaded::Scalar => {
                out.set_unknown();
                out.clear_id();
                bounds::coerce_to_size(out, size.bytes());
            }
            Loaded::Const(v) => {
                out.set_constant(v);
                out.clear_id();
                bounds::coerce_to_size(out, size.bytes());
            }
            Loaded::Reg(reg) => {
                *out = reg;
            }
        }
        if sign_extend {
            if !self.cur.reg(dst).is_scalar() {
                return Err(self.reject(
                    Reject::BadRegisterType,
                    "sign-extending load of a pointer",
                ));
            }
            let out = self.cur.reg_mut(dst);
            bounds::coerce_to_size_sx(out, size.bytes());
        }
        self.cur.reg_mut(dst).live = live | Live::WRITTEN;
        Ok(())
    }

    pub(crate) fn check_store(&mut self, insn: Instruction) -> VResult<()> {
        let is_stx = insn.class() == Class::Stx;
        if insn.mode() != Some(Mode::Mem) {
            return Err(self.reject(
                Reject::UnknownOpcode,
                format!("invalid store mode in opcode {:#04x}", insn.opcode()),
            ));
        }
        let size = insn.mem_size();
        let dst = insn.dst().ok_or_else(|| {
            self.reject(Reject::BadRegisterType, "invalid destination register field")
        })?;

        let value;
        let imm;
        if is_stx {
            let src = insn.src().ok_or_else(|| {
                self.reject(Reject::BadRegisterType, "invalid source register field")
            })?;
            value = Some(self.read_reg(src, Live::READ64)?);
            imm = None;
        } else {
            if insn.src_field() != 0 {
                return Err(self.reject(
                    Reject::ReservedFieldSet,
                    "reserved source register of store immediate",
                ));
            }
            value = None;
            imm = Some(insn.imm() as i64);
        }

        let base_reg = self.read_reg(dst, Live::READ64)?;
        self.check_mem_access(
            dst,
            &base_reg,
            insn.off() as i64,
            size,
            Access::Write,
            value.as_ref(),
            imm,
        )?;
        Ok(())
    }

    pub(crate) fn check_atomic(&mut self, insn: Instruction) -> VResult<()> {
        let size = insn.mem_size();
        if !matches!(size, MemSize::Word | MemSize::Double) {
            return Err(self.reject(
                Reject::ReservedFieldSet,
                "atomic operations are word or double-word sized",
            ));
        }
        let atomic_op = AtomicOp::from_imm(insn.imm()).ok_or_else(|| {
            self.reject(
                Reject::UnknownOpcode,
                format!("invalid atomic operation {:#x}", insn.imm()),
            )
        })?;
        let dst = insn.dst().ok_or_else(|| {
            self.reject(Reject::BadRegisterType, "invalid destination register field")
        })?;
        let src = insn.src().ok_or_else(|| {
            self.reject(Reject::BadRegisterType, "invalid source register field")
        })?;

        let operand = self.read_reg(src, Live::READ64)?;
        if operand.is_ptr() {
            return Err(self.reject(
                Reject::PointerLeak,
                format!("R{} atomic store of a pointer prohibited", src.val()),
            ));
        }
        let base_reg = self.read_reg(dst, Live::READ64)?;
        let base = base_reg.ptr_base().ok_or_else(|| {
            self.reject(
                Reject::BadRegisterType,
                format!("R{} atomic access needs a pointer", dst.val()),
            )
        })?;
        let atomics_ok = matches!(
            base,
            PtrBase::MapValue { .. }
                | PtrBase::Stack { .. }
                | PtrBase::Mem { .. }
                | PtrBase::Buf { .. }
        ) || (matches!(base, PtrBase::Ktype { .. })
            && base_reg.ptr_flags().contains(PtrFlags::ALLOC));
        if !atomics_ok {
            return Err(self.reject(
                Reject::BadRegisterType,
                format!("atomic access to {} prohibited", base.name()),
            ));
        }

        // An atomic is a read and a write of the same cell.
        self.check_mem_access(
            dst,
            &base_reg,
            insn.off() as i64,
            size,
            Access::Read,
            None,
            None,
        )?;
        self.check_mem_access(
            dst,
            &base_reg,
            insn.off() as i64,
            size,
            Access::Write,
            Some(&RegState::unknown_scalar()),
            None,
        )?;

        if atomic_op == AtomicOp::Cmpxchg {
            // Implicitly reads and rewrites r0.
            self.read_reg(RegId::R0, Live::READ64)?;
            self.writable_reg(RegId::R0)?;
            let r0 = self.cur.reg_mut(RegId::R0);
            r0.set_unknown();
            r0.clear_id();
            bounds::coerce_to_size(r0, size.bytes());
        } else if atomic_op.is_fetch() {
            self.writable_reg(src)?;
            let out = self.cur.reg_mut(src);
            out.set_unknown();
            out.clear_id();
            bounds::coerce_to_size(out, size.bytes());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dispatch per pointer kind
    // ------------------------------------------------------------------

    /// Core access check; `value`/`imm` describe the stored value for
    /// writes.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn check_mem_access(
        &mut self,
        regno: RegId,
        reg: &RegState,
        off: i64,
        size: MemSize,
        access: Access,
        value: Option<&RegState>,
        imm: Option<i64>,
    ) -> VResult<Loaded> {
        let base = match reg.kind {
            RegKind::Ptr { base, .. } => base,
            RegKind::Scalar => {
                return Err(self.reject(
                    Reject::BadRegisterType,
                    format!("R{} invalid mem access 'scalar'", regno.val()),
                ))
            }
            RegKind::NotInit => {
                return Err(self.reject(
                    Reject::UninitRegister,
                    format!("R{} invalid mem access 'uninit'", regno.val()),
                ))
            }
        };
        if reg.maybe_null() {
            return Err(self.reject(
                Reject::MaybeNullDeref,
                format!(
                    "R{} invalid mem access '{}_or_null', may be null",
                    regno.val(),
                    base.name()
                ),
            ));
        }
        let flags = reg.ptr_flags();
        if access == Access::Write && flags.contains(PtrFlags::RDONLY) {
            return Err(self.reject(
                Reject::ReadOnly,
                format!("R{} write into read-only {}", regno.val(), base.name()),
            ));
        }
        if flags.contains(PtrFlags::USER) {
            return Err(self.reject(
                Reject::BadRegisterType,
                "direct access to user memory prohibited; use a copy helper",
            ));
        }
        if flags.contains(PtrFlags::PERCPU) {
            return Err(self.reject(
                Reject::BadRegisterType,
                "per-cpu address must be resolved before dereference",
            ));
        }
        if flags.contains(PtrFlags::RCU) && !self.cur.active_rcu {
            return Err(self.reject(
                Reject::BadRcuBracket,
                format!(
                    "R{} RCU-protected pointer used outside the bracket",
                    regno.val()
                ),
            ));
        }

        self.check_alignment(reg, base, off, size)?;

        if self.aux[self.insn_idx].ptr_base.is_none() {
            self.aux[self.insn_idx].ptr_base = Some(base);
        }

        match base {
            PtrBase::Stack { frameno } => {
                self.check_stack_access(frameno as usize, reg, off, size, access, value, imm)
            }
            PtrBase::MapValue { map, .. } => {
                self.check_map_value_access(regno, map, reg, off, size, access, value)
            }
            PtrBase::MapKey(map) => {
                let key_size = self.map_def(map)?.key_size;
                self.check_region_access(regno, reg, off, size, key_size, base)?;
                if access == Access::Write {
                    return Err(self.reject(
                        Reject::ReadOnly,
                        "map key area is read only",
                    ));
                }
                Ok(Loaded::Scalar)
            }
            PtrBase::Packet { range } | PtrBase::PacketMeta { range } => {
                if access == Access::Write && !self.ops.packet_writable() {
                    return Err(self.reject(
                        Reject::ReadOnly,
                        format!("{} programs may not write packets", self.ops.name()),
                    ));
                }
                self.check_packet_access(regno, reg, off, size, range)?;
                self.check_ptr_leak(regno, value)?;
                Ok(Loaded::Scalar)
            }
            PtrBase::Ctx => self.check_ctx_access(regno, reg, off, size, access, value),
            PtrBase::Mem { size: mem_size } | PtrBase::Buf { size: mem_size } => {
                self.check_region_access(regno, reg, off, size, mem_size, base)?;
                self.check_ptr_leak(regno, value)?;
                Ok(Loaded::Scalar)
            }
            PtrBase::FlowKeys => {
                const FLOW_KEYS_SIZE: u32 = 64;
                if access == Access::Write {
                    return Err(self.reject(
                        Reject::ReadOnly,
                        "flow keys are read only",
                    ));
                }
                self.check_region_access(regno, reg, off, size, FLOW_KEYS_SIZE, base)?;
                Ok(Loaded::Scalar)
            }
            PtrBase::Sock | PtrBase::SockCommon | PtrBase::TcpSock | PtrBase::XdpSock => {
                if access == Access::Write {
                    return Err(self.reject(
                        Reject::ReadOnly,
                        format!("{} is read only", base.name()),
                    ));
                }
                let obj_size = match base {
                    PtrBase::SockCommon => 88,
                    PtrBase::Sock => 136,
                    PtrBase::TcpSock => 320,
                    _ => 144,
                };
                self.check_region_access(regno, reg, off, size, obj_size, base)?;
                Ok(Loaded::Scalar)
            }
            PtrBase::Ktype { id } => {
                self.check_ktype_access(regno, id, reg, off, size, access, value)
            }
            PtrBase::ConstMap(_)
            | PtrBase::PacketEnd
            | PtrBase::Func { .. }
            | PtrBase::ConstDynptr { .. } => Err(self.reject(
                Reject::BadRegisterType,
                format!("cannot dereference {}", base.name()),
            )),
        }
    }

    /// Reject storing a pointer where other contexts could observe it.
    fn check_ptr_leak(&mut self, regno: RegId, value: Option<&RegState>) -> VResult<()> {
        if let Some(value) = value {
            if value.is_ptr() && !self.config.caps.contains(Caps::ALLOW_PTR_LEAKS) {
                return Err(self.reject(
                    Reject::PointerLeak,
                    format!("R{} leaks addr into memory", regno.val()),
                ));
            }
        }
        Ok(())
    }

    fn check_alignment(
        &mut self,
        reg: &RegState,
        base: PtrBase,
        off: i64,
        size: MemSize,
    ) -> VResult<()> {
        let strict = self.config.caps.contains(Caps::STRICT_ALIGNMENT)
            || matches!(base, PtrBase::Stack { .. });
        if !strict || size == MemSize::Byte {
            return Ok(());
        }
        let bytes = size.bytes() as i64;
        let mut fixed = reg.off as i64 + off;
        if base.is_packet() {
            fixed += PACKET_HEAD_ALIGN as i64;
        }
        let var_misaligned =
            (reg.var_off.value() | reg.var_off.mask()) & (size.bytes() as u64 - 1) != 0;
        if fixed.rem_euclid(bytes) != 0 || var_misaligned {
            return Err(self.reject(
                Reject::MisalignedAccess,
                format!(
                    "misaligned {} access off={} size={}",
                    base.name(),
                    fixed,
                    bytes
                ),
            ));
        }
        Ok(())
    }

    /// Bounds check for a flat region of `region_size` bytes.
    fn check_region_access(
        &mut self,
        regno: RegId,
        reg: &RegState,
        off: i64,
        size: MemSize,
        region_size: u32,
        base: PtrBase,
    ) -> VResult<()> {
        let lo = reg.off as i64 + off + reg.smin;
        let hi = reg.off as i64 + off + reg.umax as i64 + size.bytes() as i64;
        if reg.smin < 0 && lo < 0 {
            return Err(self.reject(
                Reject::OutOfBounds,
                format!(
                    "R{} min value is negative accessing {}",
                    regno.val(),
                    base.name()
                ),
            ));
        }
        if lo < 0 || hi > region_size as i64 {
            return Err(self.reject(
                Reject::OutOfBounds,
                format!(
                    "R{} invalid access to {}: off={} size={} bounds=[0,{})",
                    regno.val(),
                    base.name(),
                    reg.off as i64 + off,
                    size.bytes(),
                    region_size
                ),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Map values
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn check_map_value_access(
        &mut self,
        regno: RegId,
        map: crate::map::MapId,
        reg: &RegState,
        off: i64,
        size: MemSize,
        access: Access,
        value: Option<&RegState>,
    ) -> VResult<Loaded> {
        let def = self.map_def(map)?.clone();
        if access == Access::Write && def.frozen {
            return Err(self.reject(
                Reject::ReadOnly,
                format!("write into frozen map {}", def.name),
            ));
        }
        self.check_region_access(regno, reg, off, size, def.value_size, reg.ptr_base().expect("map value pointer"))?;
        self.check_ptr_leak(regno, value)?;

        let lo = (reg.off as i64 + off + reg.smin) as u64;
        let hi = (reg.off as i64 + off + reg.umax as i64) as u64 + size.bytes() as u64;
        if let Some(field) = def.field_overlapping(lo, hi - lo) {
            match field.kind {
                FieldKind::Kptr { target, trusted } => {
                    let exact = reg.fixed_off()
                        && lo == field.offset as u64
                        && size == MemSize::Double;
                    if !exact {
                        return Err(self.reject(
                            Reject::OutOfBounds,
                            format!(
                                "kptr field at {} requires an exact aligned word access",
                                field.offset
                            ),
                        ));
                    }
                    if access == Access::Write {
                        return Err(self.reject(
                            Reject::BadRegisterType,
                            "kptr cells are only written through the exchange call",
                        ));
                    }
                    let mut out = RegState::pointer(
                        PtrBase::Ktype { id: target },
                        if trusted {
                            PtrFlags::TRUSTED | PtrFlags::MAYBE_NULL
                        } else {
                            PtrFlags::UNTRUSTED | PtrFlags::MAYBE_NULL
                        },
                    );
                    out.id = self.next_id();
                    out.live = Live::WRITTEN;
                    return Ok(Loaded::Reg(out));
                }
                other => {
                    return Err(self.reject(
                        Reject::OutOfBounds,
                        format!(
                            "direct access to {} field at offset {} prohibited",
                            field_name(other),
                            field.offset
                        ),
                    ));
                }
            }
        }

        if access == Access::Read && def.readonly_constant() && reg.fixed_off() {
            if let Some(v) = def.read_constant(lo, size.bytes() as u64) {
                self.aux[self.insn_idx].const_fold = Some(v);
                return Ok(Loaded::Const(v));
            }
        }
        Ok(Loaded::Scalar)
    }

    // ------------------------------------------------------------------
    // Packets
    // ------------------------------------------------------------------

    fn check_packet_access(
        &mut self,
        regno: RegId,
        reg: &RegState,
        off: i64,
        size: MemSize,
        range: u32,
    ) -> VResult<()> {
        let lo = reg.off as i64 + off + reg.smin;
        if lo < 0 {
            return Err(self.reject(
                Reject::OutOfBounds,
                format!("R{} packet offset may be negative", regno.val()),
            ));
        }
        let hi = reg.off as i64 + off + reg.umax as i64 + size.bytes() as i64;
        if hi > range as i64 {
            return Err(self.reject(
                Reject::OutOfBounds,
                format!(
                    "R{} invalid access to packet: off={} size={} R{} range={}",
                    regno.val(),
                    reg.off as i64 + off,
                    size.bytes(),
                    regno.val(),
                    range
                ),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Context
    // ------------------------------------------------------------------

    fn check_ctx_access(
        &mut self,
        regno: RegId,
        reg: &RegState,
        off: i64,
        size: MemSize,
        access: Access,
        value: Option<&RegState>,
    ) -> VResult<Loaded> {
        if !reg.fixed_off() {
            return Err(self.reject(
                Reject::OutOfBounds,
                format!("R{} variable offset into ctx prohibited", regno.val()),
            ));
        }
        let total = reg.off as i64 + off;
        let Ok(total) = u32::try_from(total) else {
            return Err(self.reject(
                Reject::OutOfBounds,
                format!("R{} negative ctx offset {total}", regno.val()),
            ));
        };
        self.check_ptr_leak(regno, value)?;

        let write = access == Access::Write;
        if let Some(result) = self.ops.ctx_access(total, size.bytes(), write) {
            return Ok(match result {
                CtxAccess::Scalar => Loaded::Scalar,
                CtxAccess::Ptr { base, flags } => {
                    let mut out = RegState::pointer(base, flags);
                    out.live = Live::WRITTEN;
                    if flags.contains(PtrFlags::MAYBE_NULL) {
                        out.id = self.next_id();
                    }
                    Loaded::Reg(out)
                }
            });
        }

        // Narrow loads inside a field are widened and masked post-load.
        if !write {
            if let Some(field_size) = self.ops.ctx_field_size(total) {
                let base_off = total - total % field_size;
                if size.bytes() < field_size {
                    if let Some(CtxAccess::Scalar) =
                        self.ops.ctx_access(base_off, field_size, false)
                    {
                        return Ok(Loaded::Scalar);
                    }
                }
            }
        }

        Err(self.reject(
            Reject::OutOfBounds,
            format!(
                "invalid ctx {} off={} size={}",
                if write { "write" } else { "read" },
                total,
                size.bytes()
            ),
        ))
    }

    // ------------------------------------------------------------------
    // Typed kernel objects
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn check_ktype_access(
        &mut self,
        regno: RegId,
        id: crate::ktype::KtypeId,
        reg: &RegState,
        off: i64,
        size: MemSize,
        access: Access,
        value: Option<&RegState>,
    ) -> VResult<Loaded> {
        if !reg.fixed_off() {
            return Err(self.reject(
                Reject::OutOfBounds,
                format!(
                    "R{} variable offset into a kernel object prohibited",
                    regno.val()
                ),
            ));
        }
        let flags = reg.ptr_flags();
        let ktypes = self.ktypes;
        let ktype = ktypes.resolve(id, self.insn_idx)?;
        let name = ktype.name.clone();
        let obj_size = ktype.size;
        let total = reg.off as i64 + off;
        let Ok(total) = u32::try_from(total) else {
            return Err(self.reject(
                Reject::OutOfBounds,
                format!("R{} negative object offset", regno.val()),
            ));
        };
        if total + size.bytes() > obj_size {
            return Err(self.reject(
                Reject::OutOfBounds,
                format!(
                    "invalid access to {} at off {} size {}",
                    name,
                    total,
                    size.bytes()
                ),
            ));
        }

        let field = ktypes.field_at(id, total, size.bytes()).cloned();
        if access == Access::Write {
            let writable = flags.contains(PtrFlags::ALLOC)
                || flags.contains(PtrFlags::NON_OWN_REF);
            if !writable {
                return Err(self.reject(
                    Reject::ReadOnly,
                    format!("{} is read only from programs", name),
                ));
            }
            match &field {
                Some(f) if matches!(f.kind, KtypeFieldKind::Scalar) => {}
                _ => {
                    return Err(self.reject(
                        Reject::BadRegisterType,
                        format!("only plain data fields of {} are writable", name),
                    ))
                }
            }
            if let Some(value) = value {
                if value.is_ptr() {
                    return Err(self.reject(
                        Reject::PointerLeak,
                        format!("R{} leaks addr into object", regno.val()),
                    ));
                }
            }
            return Ok(Loaded::Scalar);
        }

        match field.map(|f| f.kind) {
            Some(KtypeFieldKind::Scalar) => Ok(Loaded::Scalar),
            Some(KtypeFieldKind::Ptr { target, tag }) => {
                if size != MemSize::Double {
                    return Err(self.reject(
                        Reject::OutOfBounds,
                        "pointer fields require a full-word load",
                    ));
                }
                let mut out_flags = PtrFlags::empty();
                if tag.maybe_null {
                    out_flags |= PtrFlags::MAYBE_NULL;
                }
                if tag.rcu {
                    if self.cur.active_rcu {
                        out_flags |= PtrFlags::RCU | PtrFlags::TRUSTED;
                    } else {
                        out_flags |= PtrFlags::UNTRUSTED;
                    }
                } else if tag.trusted && flags.contains(PtrFlags::TRUSTED) {
                    out_flags |= PtrFlags::TRUSTED;
                } else {
                    out_flags |= PtrFlags::UNTRUSTED;
                }
                let mut out =
                    RegState::pointer(PtrBase::Ktype { id: target }, out_flags);
                if out_flags.contains(PtrFlags::MAYBE_NULL) {
                    out.id = self.next_id();
                }
                out.live = Live::WRITTEN;
                Ok(Loaded::Reg(out))
            }
            None => Err(self.reject(
                Reject::OutOfBounds,
                format!(
                    "no field of {} covers off {} size {}",
                    name,
                    total,
                    size.bytes()
                ),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Stack
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn check_stack_access(
        &mut self,
        frameno: usize,
        reg: &RegState,
        off: i64,
        size: MemSize,
        access: Access,
        value: Option<&RegState>,
        imm: Option<i64>,
    ) -> VResult<Loaded> {
        if !reg.fixed_off() {
            return self.check_stack_access_var(frameno, reg, off, size, access, value);
        }
        let total = reg.off as i64 + off;
        self.bump_stack_depth(frameno, total, size)?;
        match access {
            Access::Read => self.check_stack_read_fixed(frameno, total, size),
            Access::Write => {
                self.check_stack_write_fixed(frameno, total, size, value, imm)?;
                Ok(Loaded::Scalar)
            }
        }
    }

    fn bump_stack_depth(&mut self, frameno: usize, off: i64, size: MemSize) -> VResult<()> {
        if off >= 0 || off < -(MAX_STACK as i64) || off + size.bytes() as i64 > 0 {
            return Err(self.reject(
                Reject::OutOfBounds,
                format!(
                    "invalid stack access off={} size={}",
                    off,
                    size.bytes()
                ),
            ));
        }
        let subprogno = self.cur.frames[frameno].subprogno;
        let depth = (-off) as u32;
        let entry = &mut self.cfg.subprogs[subprogno].stack_depth;
        *entry = (*entry).max(depth);
        Ok(())
    }

    fn check_stack_read_fixed(
        &mut self,
        frameno: usize,
        off: i64,
        size: MemSize,
    ) -> VResult<Loaded> {
        let slot_idx = Stack::slot_of(off).expect("offset was range-checked");
        let allow_uninit = self.config.caps.contains(Caps::ALLOW_UNINIT_STACK);

        let frame = &mut self.cur.frames[frameno];
        frame.stack.grow_to(off);
        let slot = frame
            .stack
            .slot(slot_idx)
            .expect("slot was just grown")
            .clone();

        let first_byte = Stack::byte_of(off);
        let bytes = first_byte..first_byte + size.bytes() as usize;

        if slot.is_spilled_reg() {
            if size == MemSize::Double && first_byte == 0 {
                let filled = slot.spilled.clone();
                self.mark_stack_read_at(frameno, slot_idx, Live::READ64)?;
                let mut out = filled;
                out.live = Live::WRITTEN;
                return Ok(Loaded::Reg(out));
            }
            if slot.spilled.is_ptr() {
                return Err(self.reject(
                    Reject::BadSpill,
                    format!("partial read of spilled pointer at off {off}"),
                ));
            }
            self.mark_stack_read_at(frameno, slot_idx, Live::READ64)?;
            return Ok(Loaded::Scalar);
        }

        let mut all_zero = true;
        for b in bytes {
            match slot.tags[b] {
                SlotTag::Invalid => {
                    if !allow_uninit {
                        return Err(self.reject(
                            Reject::UninitStack,
                            format!("invalid read from stack off {off}"),
                        ));
                    }
                    all_zero = false;
                }
                SlotTag::Dynptr | SlotTag::Iter => {
                    return Err(self.reject(
                        Reject::BadRegisterType,
                        format!("direct read of a typed stack object at off {off}"),
                    ));
                }
                SlotTag::Zero => {}
                _ => all_zero = false,
            }
        }
        self.mark_stack_read_at(frameno, slot_idx, Live::READ64)?;
        if all_zero {
            Ok(Loaded::Const(0))
        } else {
            Ok(Loaded::Scalar)
        }
    }

    fn check_stack_write_fixed(
        &mut self,
        frameno: usize,
        off: i64,
        size: MemSize,
        value: Option<&RegState>,
        imm: Option<i64>,
    ) -> VResult<()> {
        let slot_idx = Stack::slot_of(off).expect("offset was range-checked");
        self.destroy_typed_objects(frameno, slot_idx, slot_idx)?;

        // Whole-register spill.
        let aligned = off % SLOT_SIZE as i64 == 0;
        if size == MemSize::Double && aligned {
            if let Some(value) = value {
                if value.is_ptr() && !self.config.caps.contains(Caps::BYPASS_SPEC_V4) {
                    self.aux[self.insn_idx].sanitize_stack_spill = true;
                }
                let frame = &mut self.cur.frames[frameno];
                frame.stack.grow_to(off);
                let slot = frame.stack.slot_mut(slot_idx).expect("slot was just grown");
                let read_marks = slot.spilled.live;
                slot.spilled = value.clone();
                slot.spilled.live = read_marks | Live::WRITTEN;
                slot.tags = [SlotTag::Spill; 8];
                return Ok(());
            }
        }

        if let Some(value) = value {
            if value.is_ptr() {
                return Err(self.reject(
                    Reject::BadSpill,
                    "pointers spill only as whole aligned words",
                ));
            }
        }

        // Partial overwrite of a spilled register corrupts it.
        let spilled_ptr_here = self.cur.frames[frameno]
            .stack
            .slot(slot_idx)
            .is_some_and(|s| s.is_spilled_reg() && s.spilled.is_ptr());
        if spilled_ptr_here && !self.config.caps.contains(Caps::ALLOW_PTR_LEAKS) {
            return Err(self.reject(
                Reject::PointerLeak,
                format!("attempt to corrupt spilled pointer at off {off}"),
            ));
        }

        let zero = imm == Some(0) || value.is_some_and(|v| v.const_value() == Some(0));
        let tag = if zero { SlotTag::Zero } else { SlotTag::Misc };

        let frame = &mut self.cur.frames[frameno];
        frame.stack.grow_to(off);
        let slot = frame.stack.slot_mut(slot_idx).expect("slot was just grown");
        if slot.is_spilled_reg() {
            let read_marks = slot.spilled.live & (Live::READ32 | Live::READ64);
            slot.spilled = RegState::not_init();
            slot.spilled.live = read_marks;
            for tag in slot.tags.iter_mut() {
                *tag = SlotTag::Misc;
            }
        }
        let first_byte = Stack::byte_of(off);
        for b in first_byte..first_byte + size.bytes() as usize {
            slot.tags[b] = tag;
        }
        if size == MemSize::Double {
            slot.spilled.live |= Live::WRITTEN;
        }
        Ok(())
    }

    fn check_stack_access_var(
        &mut self,
        frameno: usize,
        reg: &RegState,
        off: i64,
        size: MemSize,
        access: Access,
        value: Option<&RegState>,
    ) -> VResult<Loaded> {
        if !self.privileged() {
            return Err(self.reject(
                Reject::OutOfBounds,
                "variable stack access requires privilege",
            ));
        }
        let min_off = reg.off as i64 + off + reg.smin;
        let max_off = reg.off as i64 + off + reg.smax + size.bytes() as i64 - 1;
        if min_off < -(MAX_STACK as i64) || max_off >= 0 || reg.smin > reg.smax {
            return Err(self.reject(
                Reject::OutOfBounds,
                format!(
                    "invalid variable stack access range [{min_off}, {max_off}]"
                ),
            ));
        }
        self.bump_stack_depth(frameno, min_off, size)?;

        let lo_slot = Stack::slot_of(max_off).expect("range-checked");
        let hi_slot = Stack::slot_of(min_off).expect("range-checked");
        self.destroy_typed_objects(frameno, lo_slot, hi_slot)?;

        match access {
            Access::Write => {
                if value.is_some_and(RegState::is_ptr) {
                    return Err(self.reject(
                        Reject::BadSpill,
                        "pointers spill only at known offsets",
                    ));
                }
                let corrupts_spilled_ptr = (lo_slot..=hi_slot).any(|slot_idx| {
                    self.cur.frames[frameno]
                        .stack
                        .slot(slot_idx)
                        .is_some_and(|s| s.is_spilled_reg() && s.spilled.is_ptr())
                });
                if corrupts_spilled_ptr {
                    return Err(self.reject(
                        Reject::PointerLeak,
                        "variable write may corrupt a spilled pointer",
                    ));
                }
                let frame = &mut self.cur.frames[frameno];
                frame.stack.grow_to(min_off);
                for byte_off in min_off..=max_off {
                    let slot_idx = Stack::slot_of(byte_off).expect("range-checked");
                    let slot = frame
                        .stack
                        .slot_mut(slot_idx)
                        .expect("stack was grown to cover the range");
                    slot.tags[Stack::byte_of(byte_off)] = SlotTag::Misc;
                    if slot.is_spilled_reg() {
                        slot.spilled = RegState::not_init();
                    }
                }
                Ok(Loaded::Scalar)
            }
            Access::Read => {
                let allow_uninit = self.config.caps.contains(Caps::ALLOW_UNINIT_STACK);
                for byte_off in min_off..=max_off {
                    let tag = self.cur.frames[frameno].stack.byte_tag(byte_off);
                    match tag {
                        SlotTag::Invalid if !allow_uninit => {
                            return Err(self.reject(
                                Reject::UninitStack,
                                format!("invalid variable read at off {byte_off}"),
                            ));
                        }
                        SlotTag::Dynptr | SlotTag::Iter => {
                            return Err(self.reject(
                                Reject::BadRegisterType,
                                "variable read overlaps a typed stack object",
                            ));
                        }
                        SlotTag::Spill => {
                            let slot_idx =
                                Stack::slot_of(byte_off).expect("range-checked");
                            let spilled_ptr = self.cur.frames[frameno]
                                .stack
                                .slot(slot_idx)
                                .is_some_and(|s| s.spilled.is_ptr());
                            if spilled_ptr {
                                return Err(self.reject(
                                    Reject::PointerLeak,
                                    "variable read overlaps a spilled pointer",
                                ));
                            }
                        }
                        _ => {}
                    }
                }
                for slot_idx in lo_slot..=hi_slot {
                    self.mark_stack_read_at(frameno, slot_idx, Live::READ64)?;
                }
                Ok(Loaded::Scalar)
            }
        }
    }

    /// Overwriting any slot of a dynptr or iterator destroys the whole
    /// object; refcounted ones must be released first.
    pub(crate) fn destroy_typed_objects(
        &mut self,
        frameno: usize,
        lo_slot: usize,
        hi_slot: usize,
    ) -> VResult<()> {
        enum Verdict {
            Destroy(usize),
            RefcountedDynptr,
            LiveIter,
        }
        let mut verdicts: Vec<Verdict> = Vec::new();
        {
            let frame = &self.cur.frames[frameno];
            let mut seen_heads: Vec<usize> = Vec::new();
            for idx in lo_slot..=hi_slot {
                let Some(slot) = frame.stack.slot(idx) else {
                    continue;
                };
                if !slot.holds_typed_obj() {
                    continue;
                }
                // Find the object's first slot (identity lives there).
                let mut first = idx;
                while first > 0 {
                    let Some(prev) = frame.stack.slot(first) else {
                        break;
                    };
                    let is_first = prev
                        .spilled
                        .dynptr
                        .map(|d| d.first_slot)
                        .unwrap_or(prev.spilled.iter.is_some());
                    if is_first {
                        break;
                    }
                    first -= 1;
                }
                if seen_heads.contains(&first) {
                    continue;
                }
                seen_heads.push(first);
                let Some(head) = frame.stack.slot(first) else {
                    continue;
                };
                if head.spilled.iter.is_some() {
                    verdicts.push(Verdict::LiveIter);
                } else if head
                    .spilled
                    .dynptr
                    .is_some_and(|d| d.kind.refcounted())
                    && head.spilled.ref_obj_id != 0
                {
                    verdicts.push(Verdict::RefcountedDynptr);
                } else {
                    verdicts.push(Verdict::Destroy(first));
                }
            }
        }
        for verdict in verdicts {
            match verdict {
                Verdict::RefcountedDynptr => {
                    return Err(self.reject(
                        Reject::UnreleasedReference,
                        "cannot overwrite a referenced dynptr before releasing it",
                    ));
                }
                Verdict::LiveIter => {
                    return Err(self.reject(
                        Reject::BadRegisterType,
                        "cannot overwrite a live iterator; destroy it first",
                    ));
                }
                Verdict::Destroy(first) => {
                    let frame = &mut self.cur.frames[frameno];
                    // A local dynptr spans a fixed pair of slots.
                    for idx in first..(first + crate::consts::DYNPTR_SLOTS) {
                        if let Some(slot) = frame.stack.slot_mut(idx) {
                            if slot.holds_typed_obj() {
                                slot.invalidate();
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn field_name(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::SpinLock => "spin lock",
        FieldKind::Timer => "timer",
        FieldKind::Kptr { .. } => "kptr",
        FieldKind::ListHead { .. } => "list head",
        FieldKind::ListNode => "list node",
        FieldKind::RbRoot { .. } => "rb root",
        FieldKind::RbNode => "rb node",
        FieldKind::Refcount => "refcount",
    }
}
