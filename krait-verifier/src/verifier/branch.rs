//! Conditional branch processing.
//!
//! Each conditional jump either resolves statically (one live successor, a
//! speculative twin for the dead one) or forks: the taken branch is pushed
//! onto the worklist and the fall-through continues in place. Both copies
//! get their operand bounds refined by the comparison, null checks refine
//! pointer nullability across every same-id copy, and comparisons against
//! the packet-end cursor widen packet ranges.

use krait_asm::{
    Class,
    Instruction,
    JmpOp,
    RegId,
    SrcKind,
};

use crate::bounds;
use crate::error::{
    Reject,
    VResult,
};
use crate::reg::{
    Live,
    PtrBase,
    PtrFlags,
    RegState,
};
use crate::state::VerifierState;
use crate::tnum::Tnum;

use super::{
    Flow,
    Verifier,
};

/// The second comparison operand.
enum Operand {
    Reg(RegId, RegState),
    Imm(RegState),
}

impl Operand {
    fn state(&self) -> &RegState {
        match self {
            Self::Reg(_, s) => s,
            Self::Imm(s) => s,
        }
    }
}

impl Verifier<'_> {
    pub(crate) fn check_cond_jmp(&mut self, insn: Instruction, op: JmpOp) -> VResult<Flow> {
        let is_jmp32 = insn.class() == Class::Jmp32;
        let dst = insn.dst().ok_or_else(|| {
            self.reject(Reject::BadRegisterType, "invalid destination register field")
        })?;
        let mark = if is_jmp32 { Live::READ32 } else { Live::READ64 };
        let dst_state = self.read_reg(dst, mark)?;

        let src = match insn.src_kind() {
            SrcKind::Reg => {
                let r = insn.src().ok_or_else(|| {
                    self.reject(Reject::BadRegisterType, "invalid source register field")
                })?;
                Operand::Reg(r, self.read_reg(r, mark)?)
            }
            SrcKind::Imm => {
                if insn.src_field() != 0 {
                    return Err(self.reject(
                        Reject::ReservedFieldSet,
                        "reserved source register of compare immediate",
                    ));
                }
                let value = if is_jmp32 {
                    insn.imm() as u32 as u64
                } else {
                    insn.imm() as i64 as u64
                };
                Operand::Imm(RegState::constant(value))
            }
        };

        let target = (self.insn_idx as i64 + 1 + insn.off() as i64) as usize;

        // Route pointer comparisons.
        if dst_state.is_ptr() || src.state().is_ptr() {
            return self.check_ptr_cond_jmp(insn, op, dst, dst_state, src, target, is_jmp32);
        }

        let taken = is_branch_taken(op, &dst_state, src.state(), is_jmp32);
        if let Some(taken) = taken {
            // The outcome is proven, so the exact operand values matter.
            self.mark_chain_precision(self.cur.curframe, dst.index())?;
            if let Operand::Reg(r, _) = &src {
                self.mark_chain_precision(self.cur.curframe, r.index())?;
            }
            let (live, dead) = if taken {
                (target, self.insn_idx + 1)
            } else {
                (self.insn_idx + 1, target)
            };
            self.push_mispredicted_twin(dead, dst, &src)?;
            return Ok(Flow::Next(live));
        }

        // Unknown outcome: fork. The taken branch goes to the worklist.
        let twin = self.push_fork(target, false)?;
        refine_scalar_branch(twin, dst, &src, op, is_jmp32, true);
        refine_scalar_branch(&mut self.cur, dst, &src, op, is_jmp32, false);
        Ok(Flow::Next(self.insn_idx + 1))
    }

    /// Under branch misprediction the dead side still executes; verify it
    /// with the compared registers scrubbed.
    fn push_mispredicted_twin(
        &mut self,
        dead_idx: usize,
        dst: RegId,
        src: &Operand,
    ) -> VResult<()> {
        if self.config.caps.contains(crate::ctx::Caps::BYPASS_SPEC_V1) {
            return Ok(());
        }
        if self.cur.speculative {
            // Nested mispredictions collapse into the already-speculative
            // path.
            return Ok(());
        }
        let twin = self.push_fork(dead_idx, true)?;
        let live = twin.reg(dst).live;
        twin.reg_mut(dst).set_unknown();
        twin.reg_mut(dst).live = live;
        twin.reg_mut(dst).clear_id();
        if let Operand::Reg(r, _) = src {
            let live = twin.reg(*r).live;
            twin.reg_mut(*r).set_unknown();
            twin.reg_mut(*r).live = live;
            twin.reg_mut(*r).clear_id();
        }
        Ok(())
    }

    /// Pointer comparisons: null checks, packet-range proofs, and plain
    /// identity tests.
    #[allow(clippy::too_many_arguments)]
    fn check_ptr_cond_jmp(
        &mut self,
        _insn: Instruction,
        op: JmpOp,
        dst: RegId,
        dst_state: RegState,
        src: Operand,
        target: usize,
        is_jmp32: bool,
    ) -> VResult<Flow> {
        if is_jmp32 {
            return Err(self.reject(
                Reject::BadRegisterType,
                "32-bit comparison of a pointer prohibited",
            ));
        }

        // Null check: pointer against constant zero.
        let null_check = matches!(op, JmpOp::Jeq | JmpOp::Jne)
            && dst_state.is_ptr()
            && src.state().const_value() == Some(0);
        if null_check {
            if !dst_state.maybe_null() {
                // A pointer that cannot be null decides the branch.
                let taken = op == JmpOp::Jne;
                let (live, dead) = if taken {
                    (target, self.insn_idx + 1)
                } else {
                    (self.insn_idx + 1, target)
                };
                self.push_mispredicted_twin(dead, dst, &src)?;
                return Ok(Flow::Next(live));
            }
            let id = dst_state.id;
            // `== 0` taken means null; `!= 0` taken means non-null.
            let null_branch_is_target = op == JmpOp::Jeq;
            let twin = self.push_fork(target, false)?;
            mark_ptr_or_null_regs(twin, id, null_branch_is_target);
            mark_ptr_or_null_regs(&mut self.cur, id, !null_branch_is_target);
            return Ok(Flow::Next(self.insn_idx + 1));
        }

        // Packet-range proof: a packet cursor against the end cursor.
        if let Operand::Reg(_, src_state) = &src {
            if let Some((pkt, pkt_op)) = packet_compare(&dst_state, src_state, op) {
                if matches!(
                    pkt_op,
                    JmpOp::Jgt | JmpOp::Jge | JmpOp::Jlt | JmpOp::Jle
                ) {
                    let twin = self.push_fork(target, false)?;
                    widen_pkt_ranges(twin, &pkt, pkt_op, true);
                    widen_pkt_ranges(&mut self.cur, &pkt, pkt_op, false);
                    return Ok(Flow::Next(self.insn_idx + 1));
                }
            }
        }

        // Identity tests between pointers of the same kind.
        let identity_ok = matches!(op, JmpOp::Jeq | JmpOp::Jne)
            && dst_state.is_ptr()
            && src.state().is_ptr();
        if identity_ok || self.privileged() {
            let _ = self.push_fork(target, false)?;
            return Ok(Flow::Next(self.insn_idx + 1));
        }

        Err(self.reject(
            Reject::BadRegisterType,
            format!("R{} {} comparison on pointer prohibited", dst.val(), op.name()),
        ))
    }
}

/// The packet operand of a packet/packet-end comparison, normalized so the
/// returned operator reads `pkt OP pkt_end`.
fn packet_compare(
    dst: &RegState,
    src: &RegState,
    op: JmpOp,
) -> Option<(RegState, JmpOp)> {
    let dst_pkt = dst.ptr_base().is_some_and(PtrBase::is_packet);
    let src_pkt = src.ptr_base().is_some_and(PtrBase::is_packet);
    let dst_end = dst.ptr_base() == Some(PtrBase::PacketEnd);
    let src_end = src.ptr_base() == Some(PtrBase::PacketEnd);
    if dst_pkt && src_end {
        Some((dst.clone(), op))
    } else if src_pkt && dst_end {
        Some((src.clone(), op.swapped()))
    } else {
        None
    }
}

/// Widen the proven range of every packet pointer sharing the compared
/// cursor's id, in whichever branch proves `cursor ≤/< end`.
fn widen_pkt_ranges(state: &mut VerifierState, pkt: &RegState, pkt_op: JmpOp, taken: bool) {
    // Only fixed cursors prove anything.
    if !pkt.fixed_off() || pkt.off < 0 {
        return;
    }
    let effective = if taken { pkt_op } else { pkt_op.negated() };
    let new_range = match effective {
        JmpOp::Jle => pkt.off,
        JmpOp::Jlt => pkt.off.saturating_add(1),
        _ => return,
    };
    let Ok(new_range) = u32::try_from(new_range) else {
        return;
    };
    let base_kind = pkt.ptr_base();
    for frame in &mut state.frames {
        for reg in frame.regs.iter_mut() {
            widen_one(reg, pkt, base_kind, new_range);
        }
        for (_, slot) in frame.stack.iter_mut() {
            if slot.is_spilled_reg() {
                widen_one(&mut slot.spilled, pkt, base_kind, new_range);
            }
        }
    }
}

fn widen_one(
    reg: &mut RegState,
    pkt: &RegState,
    base_kind: Option<PtrBase>,
    new_range: u32,
) {
    if reg.id != pkt.id {
        return;
    }
    let same_family = match (reg.ptr_base(), base_kind) {
        (Some(PtrBase::Packet { .. }), Some(PtrBase::Packet { .. })) => true,
        (Some(PtrBase::PacketMeta { .. }), Some(PtrBase::PacketMeta { .. })) => true,
        _ => false,
    };
    if !same_family {
        return;
    }
    if let crate::reg::RegKind::Ptr {
        base: PtrBase::Packet { range } | PtrBase::PacketMeta { range },
        ..
    } = &mut reg.kind
    {
        *range = (*range).max(new_range);
    }
}

/// Null-check refinement across every copy of the checked pointer.
fn mark_ptr_or_null_regs(state: &mut VerifierState, id: u32, is_null: bool) {
    if id == 0 {
        return;
    }
    let mut released_ref = 0u32;
    for frame in &mut state.frames {
        for reg in frame.regs.iter_mut() {
            if !reg.is_ptr() || reg.id != id {
                continue;
            }
            if is_null {
                if reg.ref_obj_id != 0 {
                    // The acquisition failed; nothing to release later.
                    released_ref = reg.ref_obj_id;
                }
                let live = reg.live;
                *reg = RegState::constant(0);
                reg.live = live;
            } else if let Some(flags) = reg.ptr_flags_mut() {
                flags.remove(PtrFlags::MAYBE_NULL);
            }
        }
        for (_, slot) in frame.stack.iter_mut() {
            if !slot.is_spilled_reg() || !slot.spilled.is_ptr() || slot.spilled.id != id {
                continue;
            }
            if is_null {
                if slot.spilled.ref_obj_id != 0 {
                    released_ref = slot.spilled.ref_obj_id;
                }
                let live = slot.spilled.live;
                slot.spilled = RegState::constant(0);
                slot.spilled.live = live;
            } else if let Some(flags) = slot.spilled.ptr_flags_mut() {
                flags.remove(PtrFlags::MAYBE_NULL);
            }
        }
    }
    if released_ref != 0 {
        for frame in &mut state.frames {
            frame.release_ref(released_ref);
        }
        state.invalidate_ref(released_ref);
    }
}

/// Decide the branch statically when the operand intervals allow it.
pub(crate) fn is_branch_taken(
    op: JmpOp,
    dst: &RegState,
    src: &RegState,
    is_jmp32: bool,
) -> Option<bool> {
    let (dumin, dumax, dsmin, dsmax) = views(dst, is_jmp32);
    let (sumin, sumax, ssmin, ssmax) = views(src, is_jmp32);
    match op {
        JmpOp::Jeq => {
            if dumin == dumax && sumin == sumax && dumin == sumin {
                Some(true)
            } else if disjoint(dumin, dumax, sumin, sumax)
                || disjoint_s(dsmin, dsmax, ssmin, ssmax)
            {
                Some(false)
            } else {
                None
            }
        }
        JmpOp::Jne => is_branch_taken(JmpOp::Jeq, dst, src, is_jmp32).map(|t| !t),
        JmpOp::Jgt => cmp_taken(dumin > sumax, dumax <= sumin),
        JmpOp::Jge => cmp_taken(dumin >= sumax, dumax < sumin),
        JmpOp::Jlt => cmp_taken(dumax < sumin, dumin >= sumax),
        JmpOp::Jle => cmp_taken(dumax <= sumin, dumin > sumax),
        JmpOp::Jsgt => cmp_taken(dsmin > ssmax, dsmax <= ssmin),
        JmpOp::Jsge => cmp_taken(dsmin >= ssmax, dsmax < ssmin),
        JmpOp::Jslt => cmp_taken(dsmax < ssmin, dsmin >= ssmax),
        JmpOp::Jsle => cmp_taken(dsmax <= ssmin, dsmin > ssmax),
        JmpOp::Jset => {
            let val = src.const_value()?;
            let val = if is_jmp32 { val & 0xffff_ffff } else { val };
            let var = if is_jmp32 {
                dst.var_off.subreg()
            } else {
                dst.var_off
            };
            if var.value() & val != 0 {
                Some(true)
            } else if (var.value() | var.mask()) & val == 0 {
                Some(false)
            } else {
                None
            }
        }
        JmpOp::Ja | JmpOp::Call | JmpOp::Exit => None,
    }
}

fn views(reg: &RegState, is_jmp32: bool) -> (u64, u64, i64, i64) {
    if is_jmp32 {
        (
            reg.u32_min as u64,
            reg.u32_max as u64,
            reg.s32_min as i64,
            reg.s32_max as i64,
        )
    } else {
        (reg.umin, reg.umax, reg.smin, reg.smax)
    }
}

fn disjoint(amin: u64, amax: u64, bmin: u64, bmax: u64) -> bool {
    amin > bmax || amax < bmin
}

fn disjoint_s(amin: i64, amax: i64, bmin: i64, bmax: i64) -> bool {
    amin > bmax || amax < bmin
}

fn cmp_taken(always: bool, never: bool) -> Option<bool> {
    if always {
        Some(true)
    } else if never {
        Some(false)
    } else {
        None
    }
}

/// Refine both operands of a scalar comparison in `state` for the branch
/// where the comparison evaluates to `taken`.
fn refine_scalar_branch(
    state: &mut VerifierState,
    dst: RegId,
    src: &Operand,
    op: JmpOp,
    is_jmp32: bool,
    taken: bool,
) {
    if op == JmpOp::Jset {
        // Bit tests refine only the tested register.
        let mut dst_reg = state.reg(dst).clone();
        refine_bit_test(&mut dst_reg, src, is_jmp32, taken);
        *state.reg_mut(dst) = dst_reg.clone();
        sync_equal_scalars(state, &dst_reg);
        return;
    }

    let effective = if taken { op } else { op.negated() };

    let src_snapshot = match src {
        Operand::Reg(r, _) => state.reg(*r).clone(),
        Operand::Imm(s) => s.clone(),
    };
    let mut dst_reg = state.reg(dst).clone();
    refine_one(&mut dst_reg, &src_snapshot, effective, is_jmp32);
    *state.reg_mut(dst) = dst_reg.clone();
    sync_equal_scalars(state, &dst_reg);

    if let Operand::Reg(r, _) = src {
        let dst_snapshot = state.reg(dst).clone();
        let mut src_reg = state.reg(*r).clone();
        refine_one(&mut src_reg, &dst_snapshot, effective.swapped(), is_jmp32);
        *state.reg_mut(*r) = src_reg.clone();
        sync_equal_scalars(state, &src_reg);
    }
}

/// `reg & mask` tested nonzero (`taken`) or zero (`!taken`).
fn refine_bit_test(reg: &mut RegState, src: &Operand, is_jmp32: bool, taken: bool) {
    if !reg.is_scalar() {
        return;
    }
    let Some(val) = src.state().const_value() else {
        return;
    };
    let val = if is_jmp32 { val & 0xffff_ffff } else { val };
    if taken {
        // At least one tested bit is set; only a single-bit mask pins it.
        if val.count_ones() == 1 {
            reg.var_off = reg.var_off.or(Tnum::constant(val));
        }
    } else {
        // Every tested bit is clear.
        if is_jmp32 {
            let cleared = reg.var_off.subreg().and(Tnum::constant(!val & 0xffff_ffff));
            reg.var_off = reg.var_off.with_subreg(cleared);
        } else {
            reg.var_off = reg.var_off.and(Tnum::constant(!val));
        }
    }
    bounds::sync_bounds(reg);
}

/// Copy a refined register to every same-id scalar in the state.
pub(crate) fn sync_equal_scalars(state: &mut VerifierState, template: &RegState) {
    if template.id == 0 || !template.is_scalar() {
        return;
    }
    for frame in &mut state.frames {
        for reg in frame.regs.iter_mut() {
            if reg.is_scalar() && reg.id == template.id {
                let live = reg.live;
                let precise = reg.precise;
                *reg = template.clone();
                reg.live = live;
                reg.precise = precise;
            }
        }
        for (_, slot) in frame.stack.iter_mut() {
            if slot.is_spilled_reg()
                && slot.spilled.is_scalar()
                && slot.spilled.id == template.id
            {
                let live = slot.spilled.live;
                slot.spilled = template.clone();
                slot.spilled.live = live;
            }
        }
    }
}

/// Tighten `reg` under the assumption `reg OP other` holds.
fn refine_one(reg: &mut RegState, other: &RegState, op: JmpOp, is_jmp32: bool) {
    if !reg.is_scalar() {
        return;
    }
    let (oumin, oumax, osmin, osmax) = views(other, is_jmp32);
    // Work on a 64-bit or 32-bit view, then re-synchronize.
    macro_rules! views_mut {
        ($f:expr) => {
            if is_jmp32 {
                let mut umin = reg.u32_min as u64;
                let mut umax = reg.u32_max as u64;
                let mut smin = reg.s32_min as i64;
                let mut smax = reg.s32_max as i64;
                #[allow(clippy::redundant_closure_call)]
                ($f)(&mut umin, &mut umax, &mut smin, &mut smax);
                reg.u32_min = umin as u32;
                reg.u32_max = umax as u32;
                reg.s32_min = smin as i32;
                reg.s32_max = smax as i32;
            } else {
                let mut umin = reg.umin;
                let mut umax = reg.umax;
                let mut smin = reg.smin;
                let mut smax = reg.smax;
                #[allow(clippy::redundant_closure_call)]
                ($f)(&mut umin, &mut umax, &mut smin, &mut smax);
                reg.umin = umin;
                reg.umax = umax;
                reg.smin = smin;
                reg.smax = smax;
            }
        };
    }

    match op {
        JmpOp::Jeq => {
            views_mut!(|umin: &mut u64, umax: &mut u64, smin: &mut i64, smax: &mut i64| {
                *umin = (*umin).max(oumin);
                *umax = (*umax).min(oumax);
                *smin = (*smin).max(osmin);
                *smax = (*smax).min(osmax);
            });
            let ovar = if is_jmp32 {
                other.var_off.subreg()
            } else {
                other.var_off
            };
            if is_jmp32 {
                reg.var_off = reg.var_off.with_subreg(reg.var_off.subreg().intersect(ovar));
            } else {
                reg.var_off = reg.var_off.intersect(ovar);
            }
        }
        JmpOp::Jne => {
            // Only a constant operand pulls a losing bound in by one.
            if oumin == oumax {
                views_mut!(|umin: &mut u64, umax: &mut u64, smin: &mut i64, smax: &mut i64| {
                    if *umin == oumin && *umin < *umax {
                        *umin += 1;
                    }
                    if *umax == oumin && *umax > *umin {
                        *umax -= 1;
                    }
                    if *smin == osmin && *smin < *smax {
                        *smin += 1;
                    }
                    if *smax == osmin && *smax > *smin {
                        *smax -= 1;
                    }
                });
            }
        }
        JmpOp::Jgt => {
            views_mut!(|umin: &mut u64, _umax: &mut u64, _smin: &mut i64, _smax: &mut i64| {
                *umin = (*umin).max(oumin.saturating_add(1));
            });
        }
        JmpOp::Jge => {
            views_mut!(|umin: &mut u64, _umax: &mut u64, _smin: &mut i64, _smax: &mut i64| {
                *umin = (*umin).max(oumin);
            });
        }
        JmpOp::Jlt => {
            views_mut!(|_umin: &mut u64, umax: &mut u64, _smin: &mut i64, _smax: &mut i64| {
                *umax = (*umax).min(oumax.saturating_sub(1));
            });
        }
        JmpOp::Jle => {
            views_mut!(|_umin: &mut u64, umax: &mut u64, _smin: &mut i64, _smax: &mut i64| {
                *umax = (*umax).min(oumax);
            });
        }
        JmpOp::Jsgt => {
            views_mut!(|_umin: &mut u64, _umax: &mut u64, smin: &mut i64, _smax: &mut i64| {
                *smin = (*smin).max(osmin.saturating_add(1));
            });
        }
        JmpOp::Jsge => {
            views_mut!(|_umin: &mut u64, _umax: &mut u64, smin: &mut i64, _smax: &mut i64| {
                *smin = (*smin).max(osmin);
            });
        }
        JmpOp::Jslt => {
            views_mut!(|_umin: &mut u64, _umax: &mut u64, _smin: &mut i64, smax: &mut i64| {
                *smax = (*smax).min(osmax.saturating_sub(1));
            });
        }
        JmpOp::Jsle => {
            views_mut!(|_umin: &mut u64, _umax: &mut u64, _smin: &mut i64, smax: &mut i64| {
                *smax = (*smax).min(osmax);
            });
        }
        _ => {}
    }
    bounds::sync_bounds(reg);
}
