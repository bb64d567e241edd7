//! ALU instruction rules: scalar evaluation, moves, and pointer
//! arithmetic with its misprediction hardening.

use krait_asm::{
    AluOp,
    Class,
    Instruction,
    RegId,
    SrcKind,
};

use crate::bounds;
use crate::error::{
    Reject,
    VResult,
};
use crate::log::vtrace;
use crate::patch::AluSanitize;
use crate::reg::{
    Live,
    PtrBase,
    RegKind,
    RegState,
};
use crate::tnum::Tnum;

use super::Verifier;

impl Verifier<'_> {
    pub(crate) fn check_alu(&mut self, insn: Instruction) -> VResult<()> {
        let is64 = insn.class() == Class::Alu64;
        let op = insn.alu_op().ok_or_else(|| {
            self.reject(
                Reject::UnknownOpcode,
                format!("invalid opcode {:#04x}", insn.opcode()),
            )
        })?;
        let dst = self.dst_reg(insn)?;

        match op {
            AluOp::End => self.check_endian(insn, dst),
            AluOp::Neg => self.check_neg(insn, dst, is64),
            AluOp::Mov => self.check_mov(insn, dst, is64),
            _ => self.check_binary_alu(insn, op, dst, is64),
        }
    }

    fn dst_reg(&mut self, insn: Instruction) -> VResult<RegId> {
        insn.dst().ok_or_else(|| {
            self.reject(
                Reject::BadRegisterType,
                format!("invalid destination register field {}", insn.dst_field()),
            )
        })
    }

    fn src_reg(&mut self, insn: Instruction) -> VResult<RegId> {
        insn.src().ok_or_else(|| {
            self.reject(
                Reject::BadRegisterType,
                format!("invalid source register field {}", insn.src_field()),
            )
        })
    }

    fn check_endian(&mut self, insn: Instruction, dst: RegId) -> VResult<()> {
        let width = insn.imm();
        if !matches!(width, 16 | 32 | 64) {
            return Err(self.reject(
                Reject::ReservedFieldSet,
                format!("byte swap width must be 16, 32, or 64, got {width}"),
            ));
        }
        let reg = self.read_reg(dst, Live::READ64)?;
        if !reg.is_scalar() {
            return Err(self.reject(
                Reject::PointerArithmetic,
                format!("R{} byte swap on a pointer prohibited", dst.val()),
            ));
        }
        self.writable_reg(dst)?;
        let out = self.cur.reg_mut(dst);
        out.set_unknown();
        out.clear_id();
        bounds::coerce_to_size(out, width as u32 / 8);
        Ok(())
    }

    fn check_neg(&mut self, insn: Instruction, dst: RegId, is64: bool) -> VResult<()> {
        if insn.imm() != 0 || insn.off() != 0 || insn.src_field() != 0 {
            return Err(self.reject(
                Reject::ReservedFieldSet,
                "reserved fields of neg must be zero",
            ));
        }
        let mark = if is64 { Live::READ64 } else { Live::READ32 };
        let reg = self.read_reg(dst, mark)?;
        if !reg.is_scalar() {
            return Err(self.reject(
                Reject::PointerArithmetic,
                format!("R{} pointer negation prohibited", dst.val()),
            ));
        }
        self.writable_reg(dst)?;
        let zero = RegState::constant(0);
        let out = self.cur.reg_mut(dst);
        out.clear_id();
        if is64 {
            bounds::apply_alu64(out, &zero, AluOp::Neg);
        } else {
            bounds::apply_alu32(out, &zero, AluOp::Neg);
            self.aux[self.insn_idx].zext_dst = true;
        }
        Ok(())
    }

    fn check_mov(&mut self, insn: Instruction, dst: RegId, is64: bool) -> VResult<()> {
        match insn.src_kind() {
            SrcKind::Imm => {
                if insn.off() != 0 || insn.src_field() != 0 {
                    return Err(self.reject(
                        Reject::ReservedFieldSet,
                        "reserved fields of mov immediate must be zero",
                    ));
                }
                self.writable_reg(dst)?;
                let value = if is64 {
                    insn.imm() as i64 as u64
                } else {
                    self.aux[self.insn_idx].zext_dst = true;
                    insn.imm() as u32 as u64
                };
                self.cur.reg_mut(dst).set_constant(value);
                self.cur.reg_mut(dst).clear_id();
                Ok(())
            }
            SrcKind::Reg => {
                let sx_bits = match insn.off() {
                    0 => None,
                    8 | 16 | 32 => Some(insn.off() as u32),
                    other => {
                        return Err(self.reject(
                            Reject::ReservedFieldSet,
                            format!("invalid sign-extension width {other}"),
                        ))
                    }
                };
                let src = self.src_reg(insn)?;
                let mark = if is64 { Live::READ64 } else { Live::READ32 };
                let src_state = self.read_reg(src, mark)?;
                self.writable_reg(dst)?;

                if let Some(bits) = sx_bits {
                    if !src_state.is_scalar() {
                        return Err(self.reject(
                            Reject::PointerArithmetic,
                            format!("R{} sign-extending a pointer prohibited", src.val()),
                        ));
                    }
                    let live = self.cur.reg(dst).live;
                    let mut out = src_state;
                    out.clear_id();
                    bounds::coerce_to_size_sx(&mut out, bits / 8);
                    if !is64 {
                        bounds::coerce_to_size(&mut out, 4);
                        self.aux[self.insn_idx].zext_dst = true;
                    }
                    out.live = live;
                    *self.cur.reg_mut(dst) = out;
                    return Ok(());
                }

                if is64 {
                    // Give correlated scalars a shared id so later branch
                    // refinements reach every copy.
                    if src_state.is_scalar()
                        && src_state.id == 0
                        && !src_state.var_off.is_const()
                    {
                        let id = self.next_id();
                        self.cur.reg_mut(src).id = id;
                    }
                    let src_state = self.cur.reg(src).clone();
                    let live = self.cur.reg(dst).live;
                    let mut out = src_state;
                    out.live = live;
                    *self.cur.reg_mut(dst) = out;
                    Ok(())
                } else {
                    self.aux[self.insn_idx].zext_dst = true;
                    let live = self.cur.reg(dst).live;
                    if src_state.is_ptr() {
                        if !self.config.caps.contains(crate::ctx::Caps::ALLOW_PTR_LEAKS) {
                            return Err(self.reject(
                                Reject::PointerLeak,
                                format!("R{} partial copy of pointer", src.val()),
                            ));
                        }
                        let out = self.cur.reg_mut(dst);
                        out.set_unknown();
                        out.live = live;
                        out.clear_id();
                        bounds::coerce_to_size(out, 4);
                        return Ok(());
                    }
                    let mut out = src_state;
                    out.clear_id();
                    bounds::coerce_to_size(&mut out, 4);
                    out.live = live;
                    *self.cur.reg_mut(dst) = out;
                    Ok(())
                }
            }
        }
    }

    fn check_binary_alu(
        &mut self,
        insn: Instruction,
        op: AluOp,
        dst: RegId,
        is64: bool,
    ) -> VResult<()> {
        if insn.off() != 0 && !(op.is_div_or_mod() && insn.off() == 1) {
            // offset 1 selects the signed division family
            return Err(self.reject(
                Reject::ReservedFieldSet,
                "reserved offset field of alu op must be zero",
            ));
        }

        let src_state = match insn.src_kind() {
            SrcKind::Imm => {
                if insn.src_field() != 0 {
                    return Err(self.reject(
                        Reject::ReservedFieldSet,
                        "reserved source register of alu immediate must be zero",
                    ));
                }
                let value = if is64 {
                    insn.imm() as i64 as u64
                } else {
                    insn.imm() as u32 as u64
                };
                RegState::constant(value)
            }
            SrcKind::Reg => {
                let src = self.src_reg(insn)?;
                let mark = if is64 { Live::READ64 } else { Live::READ32 };
                self.read_reg(src, mark)?
            }
        };

        // Divisor and shift-count sanity on known constants.
        if op.is_div_or_mod() {
            if let Some(0) = src_state.const_value() {
                if insn.src_kind() == SrcKind::Imm {
                    return Err(self.reject(Reject::DivByZero, "division by zero"));
                }
            }
        }
        if op.is_shift() {
            let width = if is64 { 64 } else { 32 };
            if let Some(shift) = src_state.const_value() {
                if shift >= width {
                    return Err(self.reject(
                        Reject::ShiftOutOfRange,
                        format!("invalid shift {shift}"),
                    ));
                }
            }
        }

        let mark = if is64 { Live::READ64 } else { Live::READ32 };
        let dst_state = self.read_reg(dst, mark)?;

        match (dst_state.is_ptr(), src_state.is_ptr()) {
            (true, true) => self.check_ptr_ptr(insn, op, dst, &dst_state, &src_state, is64),
            (true, false) => {
                self.check_ptr_scalar(insn, op, dst, dst_state, src_state, is64, true)
            }
            (false, true) => {
                if op != AluOp::Add {
                    return Err(self.reject(
                        Reject::PointerArithmetic,
                        format!(
                            "R{} {} on a pointer operand prohibited",
                            dst.val(),
                            op.name()
                        ),
                    ));
                }
                self.check_ptr_scalar(insn, op, dst, src_state, dst_state, is64, false)
            }
            (false, false) => {
                self.writable_reg(dst)?;
                let signed_division = op.is_div_or_mod() && insn.off() == 1;
                let out = self.cur.reg_mut(dst);
                out.clear_id();
                if signed_division {
                    // The unsigned transfer function does not model the
                    // signed family; keep only the width.
                    out.set_unknown();
                    if !is64 {
                        bounds::coerce_to_size(out, 4);
                        self.aux[self.insn_idx].zext_dst = true;
                    }
                    return Ok(());
                }
                if is64 {
                    bounds::apply_alu64(out, &src_state, op);
                } else {
                    bounds::apply_alu32(out, &src_state, op);
                    self.aux[self.insn_idx].zext_dst = true;
                }
                Ok(())
            }
        }
    }

    /// Pointer-difference: privileged only, same base object, yields a
    /// scalar.
    fn check_ptr_ptr(
        &mut self,
        _insn: Instruction,
        op: AluOp,
        dst: RegId,
        dst_state: &RegState,
        src_state: &RegState,
        is64: bool,
    ) -> VResult<()> {
        if op != AluOp::Sub || !is64 {
            return Err(self.reject(
                Reject::PointerArithmetic,
                format!("R{} pointer {} pointer prohibited", dst.val(), op.name()),
            ));
        }
        if !self.privileged() {
            return Err(self.reject(
                Reject::PointerSubtraction,
                "pointer subtraction requires privilege",
            ));
        }
        self.writable_reg(dst)?;
        let live = self.cur.reg(dst).live;
        let same_object = dst_state.ptr_base() == src_state.ptr_base()
            && dst_state.id == src_state.id;
        if !same_object {
            // Distinct base addresses: the numeric difference is
            // arbitrary.
            let out = self.cur.reg_mut(dst);
            out.set_unknown();
            out.live = live;
            out.clear_id();
            return Ok(());
        }
        // Same base object: the bases cancel, the difference is the offset
        // delta plus the variable-part delta.
        let mut out = RegState::unknown_scalar();
        out.var_off = dst_state.var_off;
        out.smin = dst_state.smin;
        out.smax = dst_state.smax;
        out.umin = dst_state.umin;
        out.umax = dst_state.umax;
        let mut sub = RegState::unknown_scalar();
        sub.var_off = src_state.var_off;
        sub.smin = src_state.smin;
        sub.smax = src_state.smax;
        sub.umin = src_state.umin;
        sub.umax = src_state.umax;
        bounds::apply_alu64(&mut out, &sub, AluOp::Sub);
        let delta = RegState::constant((dst_state.off as i64 - src_state.off as i64) as u64);
        bounds::apply_alu64(&mut out, &delta, AluOp::Add);
        out.live = live;
        *self.cur.reg_mut(dst) = out;
        Ok(())
    }

    /// Pointer ± scalar.
    #[allow(clippy::too_many_arguments)]
    fn check_ptr_scalar(
        &mut self,
        insn: Instruction,
        op: AluOp,
        dst: RegId,
        ptr: RegState,
        scalar: RegState,
        is64: bool,
        ptr_is_dst: bool,
    ) -> VResult<()> {
        if !matches!(op, AluOp::Add | AluOp::Sub) {
            return Err(self.reject(
                Reject::PointerArithmetic,
                format!("R{} {} on pointer prohibited", dst.val(), op.name()),
            ));
        }
        if !is64 {
            return Err(self.reject(
                Reject::PointerArithmetic,
                "32-bit pointer arithmetic prohibited",
            ));
        }
        let base = ptr
            .ptr_base()
            .expect("caller checked the operand is a pointer");
        if !base.arithmetic_ok() {
            return Err(self.reject(
                Reject::PointerArithmetic,
                format!("pointer arithmetic on {} prohibited", base.name()),
            ));
        }
        if ptr.maybe_null() {
            return Err(self.reject(
                Reject::MaybeNullDeref,
                format!(
                    "R{} pointer arithmetic on possibly-null {} prohibited",
                    dst.val(),
                    base.name()
                ),
            ));
        }

        self.writable_reg(dst)?;
        let live = self.cur.reg(dst).live;
        let mut out = ptr.clone();
        out.live = live;

        if let Some(value) = scalar.const_value() {
            // Constant delta folds into the fixed offset.
            let delta = value as i64;
            let delta = if op == AluOp::Sub {
                delta.checked_neg()
            } else {
                Some(delta)
            };
            let new_off = delta
                .and_then(|d| (ptr.off as i64).checked_add(d))
                .and_then(|o| i32::try_from(o).ok());
            let Some(new_off) = new_off else {
                return Err(self.reject(
                    Reject::ValueOutOfRange,
                    format!("R{} pointer offset out of range", dst.val()),
                ));
            };
            out.off = new_off;
            *self.cur.reg_mut(dst) = out;
            return Ok(());
        }

        // Variable offset: sanity-check magnitude, then harden, then fold
        // the bounds in.
        const MAX_VAR_OFF: i64 = 1 << 29;
        if scalar.smin <= -MAX_VAR_OFF || scalar.smax >= MAX_VAR_OFF {
            return Err(self.reject(
                Reject::ValueOutOfRange,
                format!("R{} variable offset out of safe range", dst.val()),
            ));
        }

        // The scalar's bounds become the pointer's bounds; pruning must not
        // widen them behind our back.
        let scalar_regno = if ptr_is_dst {
            insn.src().map(|r| r.index())
        } else {
            Some(dst.index())
        };
        if let Some(regno) = scalar_regno {
            self.mark_chain_precision(self.cur.curframe, regno)?;
        }

        if !self.config.caps.contains(crate::ctx::Caps::BYPASS_SPEC_V1) {
            self.sanitize_ptr_alu(insn, op, &ptr, &scalar, dst, ptr_is_dst)?;
        }

        let mut proxy = RegState::unknown_scalar();
        proxy.var_off = ptr.var_off;
        proxy.smin = ptr.smin;
        proxy.smax = ptr.smax;
        proxy.umin = ptr.umin;
        proxy.umax = ptr.umax;
        bounds::apply_alu64(&mut proxy, &scalar, op);
        out.var_off = proxy.var_off;
        out.smin = proxy.smin;
        out.smax = proxy.smax;
        out.umin = proxy.umin;
        out.umax = proxy.umax;
        out.s32_min = proxy.s32_min;
        out.s32_max = proxy.s32_max;
        out.u32_min = proxy.u32_min;
        out.u32_max = proxy.u32_max;

        if base.is_packet() {
            // The proven range no longer describes the moved cursor.
            let id = self.next_id();
            out.id = id;
            if let RegKind::Ptr {
                base: PtrBase::Packet { range } | PtrBase::PacketMeta { range },
                ..
            } = &mut out.kind
            {
                *range = 0;
            }
        }

        *self.cur.reg_mut(dst) = out;
        Ok(())
    }

    /// Record the masking limit for this site and fork the speculative
    /// twin in which the variable offset contributed nothing.
    fn sanitize_ptr_alu(
        &mut self,
        _insn: Instruction,
        op: AluOp,
        ptr: &RegState,
        scalar: &RegState,
        dst: RegId,
        _ptr_is_dst: bool,
    ) -> VResult<()> {
        let base = ptr.ptr_base().expect("pointer operand");
        let off_is_neg = scalar.smin < 0;
        let mask_to_left =
            (op == AluOp::Add && off_is_neg) || (op == AluOp::Sub && !off_is_neg);

        let fixed = ptr.off as i64 + ptr.var_off.value() as i64;
        let limit: i64 = match base {
            PtrBase::Stack { .. } => {
                if mask_to_left {
                    crate::consts::MAX_STACK as i64 + fixed
                } else {
                    -fixed - 1
                }
            }
            PtrBase::MapValue { map, .. } => {
                let value_size = self.map_def(map)?.value_size as i64;
                if mask_to_left {
                    ptr.umax as i64 + fixed
                } else {
                    value_size - (ptr.smin + fixed)
                }
            }
            // Other kinds have no meaningful masking window; their accesses
            // are bounds-checked against constant extents anyway.
            _ => return Ok(()),
        };
        if limit < 0 || limit > u32::MAX as i64 {
            return Err(self.reject(
                Reject::SpeculativeOutOfBounds,
                format!("R{} pointer arithmetic cannot be hardened", dst.val()),
            ));
        }

        let san = AluSanitize {
            limit: limit as u32,
            neg: mask_to_left,
        };
        match self.aux[self.insn_idx].alu_state {
            None => self.aux[self.insn_idx].alu_state = Some(san),
            Some(existing) if existing == san => {}
            Some(_) => {
                return Err(self.reject(
                    Reject::SpeculativeOutOfBounds,
                    format!(
                        "R{} pointer arithmetic limits differ between paths",
                        dst.val()
                    ),
                ));
            }
        }

        // Under misprediction the mask forces the variable part to zero:
        // the twin resumes after this instruction with the pointer
        // unmoved.
        let insn_idx = self.insn_idx;
        let twin = self.push_fork(insn_idx + 1, true)?;
        let live = twin.reg(dst).live;
        let mut unmoved = ptr.clone();
        unmoved.live = live;
        *twin.reg_mut(dst) = unmoved;
        vtrace!(self.log, "{}: speculative twin forked", insn_idx);
        Ok(())
    }
}
