//! State equivalence for pruning.
//!
//! An old checkpoint subsumes the current state when, for everything the
//! old exploration ever read, the old view is at least as general as the
//! current one. Identities are compared under a remapping built
//! incrementally, so two states agree when their correlation structure
//! matches even though the id values differ.

use crate::frame::FuncState;
use crate::reg::{
    IterPhase,
    PtrBase,
    RegKind,
    RegState,
};
use crate::stack::{
    SlotTag,
    StackSlot,
};
use crate::state::VerifierState;

/// Incremental old-id to current-id correspondence.
#[derive(Debug, Default)]
pub(crate) struct IdMap {
    pairs: Vec<(u32, u32)>,
}

impl IdMap {
    /// Whether `old` and `cur` are the same identity under the mapping,
    /// extending it on first sight.
    pub(crate) fn same(&mut self, old: u32, cur: u32) -> bool {
        if old == 0 && cur == 0 {
            return true;
        }
        if old == 0 || cur == 0 {
            return false;
        }
        for &(o, c) in &self.pairs {
            if o == old {
                return c == cur;
            }
        }
        self.pairs.push((old, cur));
        true
    }
}

/// Whether `old` subsumes `cur`. `iter_convergence` is set at
/// iterator-advance prune points, where matching active iterators prove
/// termination regardless of depth.
pub(crate) fn states_equal(
    old: &VerifierState,
    cur: &VerifierState,
    iter_convergence: bool,
) -> bool {
    if old.curframe != cur.curframe || old.frames.len() != cur.frames.len() {
        return false;
    }
    // A state proven safe only under misprediction proves nothing about an
    // architectural path.
    if old.speculative && !cur.speculative {
        return false;
    }
    if old.active_rcu != cur.active_rcu {
        return false;
    }

    let mut idmap = IdMap::default();
    match (old.active_lock, cur.active_lock) {
        (None, None) => {}
        (Some(a), Some(b)) => {
            if a.object != b.object || !idmap.same(a.id, b.id) {
                return false;
            }
        }
        _ => return false,
    }

    for (fo, fc) in old.frames.iter().zip(&cur.frames) {
        if fo.callsite != fc.callsite
            || fo.subprogno != fc.subprogno
            || fo.in_callback != fc.in_callback
            || fo.in_async_callback != fc.in_async_callback
        {
            return false;
        }
        if !refsafe(fo, fc, &mut idmap) {
            return false;
        }
        for (rold, rcur) in fo.regs.iter().zip(&fc.regs) {
            if !regsafe(rold, rcur, &mut idmap) {
                return false;
            }
        }
        if !stacksafe(fo, fc, &mut idmap, iter_convergence) {
            return false;
        }
    }
    true
}

fn refsafe(old: &FuncState, cur: &FuncState, idmap: &mut IdMap) -> bool {
    if old.refs.len() != cur.refs.len() {
        return false;
    }
    old.refs.iter().zip(&cur.refs).all(|(o, c)| {
        o.callback_ref == c.callback_ref && idmap.same(o.id, c.id)
    })
}

/// Interval containment across all four views.
fn range_within(old: &RegState, cur: &RegState) -> bool {
    old.umin <= cur.umin
        && old.umax >= cur.umax
        && old.smin <= cur.smin
        && old.smax >= cur.smax
        && old.u32_min <= cur.u32_min
        && old.u32_max >= cur.u32_max
        && old.s32_min <= cur.s32_min
        && old.s32_max >= cur.s32_max
}

/// Whether the old register view accepts the current one.
pub(crate) fn regsafe(rold: &RegState, rcur: &RegState, idmap: &mut IdMap) -> bool {
    if !rold.live.is_read() {
        // Nothing downstream of the old state observed this register.
        return true;
    }
    match rold.kind {
        RegKind::NotInit => true,
        RegKind::Scalar => {
            if !matches!(rcur.kind, RegKind::Scalar) {
                return false;
            }
            if rold.id != 0 && !idmap.same(rold.id, rcur.id) {
                return false;
            }
            if !rold.precise {
                // Imprecise old bounds were never load-bearing.
                return true;
            }
            range_within(rold, rcur) && rold.var_off.contains(rcur.var_off)
        }
        RegKind::Ptr {
            base: old_base,
            flags: old_flags,
        } => {
            let RegKind::Ptr {
                base: cur_base,
                flags: cur_flags,
            } = rcur.kind
            else {
                return false;
            };
            if old_flags != cur_flags
                || !idmap.same(rold.id, rcur.id)
                || !idmap.same(rold.ref_obj_id, rcur.ref_obj_id)
            {
                return false;
            }
            match (old_base, cur_base) {
                // Map values and packets tolerate tighter variable parts.
                (
                    PtrBase::MapValue { map: m0, uid: u0 },
                    PtrBase::MapValue { map: m1, uid: u1 },
                ) => {
                    m0 == m1
                        && u0 == u1
                        && rold.off == rcur.off
                        && range_within(rold, rcur)
                        && rold.var_off.contains(rcur.var_off)
                }
                (PtrBase::Packet { range: r0 }, PtrBase::Packet { range: r1 })
                | (
                    PtrBase::PacketMeta { range: r0 },
                    PtrBase::PacketMeta { range: r1 },
                ) => {
                    // Anything proven with the shorter range still holds.
                    r1 >= r0
                        && rold.off == rcur.off
                        && range_within(rold, rcur)
                        && rold.var_off.contains(rcur.var_off)
                }
                (o, c) => {
                    o == c
                        && rold.off == rcur.off
                        && rold.var_off == rcur.var_off
                        && range_within(rold, rcur)
                }
            }
        }
    }
}

/// Category of one stack slot for comparison purposes.
#[derive(PartialEq, Eq, Clone, Copy)]
enum SlotShape {
    Untouched,
    Spill,
    Bytes,
    Dynptr,
    Iter,
}

fn shape(slot: &StackSlot) -> SlotShape {
    if slot.is_spilled_reg() {
        SlotShape::Spill
    } else if slot.tags.iter().any(|t| matches!(t, SlotTag::Dynptr)) {
        SlotShape::Dynptr
    } else if slot.tags.iter().any(|t| matches!(t, SlotTag::Iter)) {
        SlotShape::Iter
    } else if slot.uniform() == Some(SlotTag::Invalid) {
        SlotShape::Untouched
    } else {
        SlotShape::Bytes
    }
}

fn stacksafe(
    old: &FuncState,
    cur: &FuncState,
    idmap: &mut IdMap,
    iter_convergence: bool,
) -> bool {
    for (idx, oslot) in old.stack.iter() {
        let oshape = shape(oslot);
        if oshape == SlotShape::Untouched {
            continue;
        }
        if !oslot.spilled.live.is_read() && !matches!(oshape, SlotShape::Iter) {
            // Never observed below the old checkpoint.
            continue;
        }
        let Some(cslot) = cur.stack.slot(idx) else {
            return false;
        };
        match oshape {
            SlotShape::Untouched => {}
            SlotShape::Spill => {
                if shape(cslot) != SlotShape::Spill
                    || !regsafe(&oslot.spilled, &cslot.spilled, idmap)
                {
                    return false;
                }
            }
            SlotShape::Bytes => {
                for (o, c) in oslot.tags.iter().zip(&cslot.tags) {
                    let ok = match o {
                        SlotTag::Invalid => true,
                        SlotTag::Misc => matches!(
                            c,
                            SlotTag::Misc | SlotTag::Zero | SlotTag::Spill
                        ),
                        SlotTag::Zero => matches!(c, SlotTag::Zero),
                        _ => false,
                    };
                    if !ok {
                        return false;
                    }
                }
                // Raw bytes may stand in for a spilled scalar, never for a
                // spilled pointer.
                if shape(cslot) == SlotShape::Spill && cslot.spilled.is_ptr() {
                    return false;
                }
            }
            SlotShape::Dynptr => {
                let (Some(od), Some(cd)) = (oslot.spilled.dynptr, cslot.spilled.dynptr)
                else {
                    return false;
                };
                if od.kind != cd.kind || od.first_slot != cd.first_slot {
                    return false;
                }
                if !idmap.same(oslot.spilled.ref_obj_id, cslot.spilled.ref_obj_id) {
                    return false;
                }
            }
            SlotShape::Iter => {
                let (Some(oi), Some(ci)) = (oslot.spilled.iter, cslot.spilled.iter) else {
                    // Mirror slots carry only tags.
                    if shape(cslot) != SlotShape::Iter {
                        return false;
                    }
                    continue;
                };
                if oi.kind != ci.kind || oi.phase != ci.phase {
                    return false;
                }
                // Mid-loop states at different depths are genuinely
                // different; at the advance site the depth is exactly what
                // convergence abstracts over.
                if !iter_convergence
                    && oi.phase == IterPhase::Active
                    && oi.depth != ci.depth
                {
                    return false;
                }
                if !idmap.same(oslot.spilled.ref_obj_id, cslot.spilled.ref_obj_id) {
                    return false;
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use krait_asm::RegId;

    use super::*;
    use crate::reg::{
        Live,
        PtrFlags,
    };

    fn read_scalar(umin: u64, umax: u64, precise: bool) -> RegState {
        let mut reg = RegState::unknown_scalar();
        reg.umin = umin;
        reg.umax = umax;
        crate::bounds::sync_bounds(&mut reg);
        reg.precise = precise;
        reg.live = Live::READ64;
        reg
    }

    #[test]
    fn unread_registers_do_not_matter() {
        let mut idmap = IdMap::default();
        let mut old = RegState::constant(5);
        old.live = Live::empty();
        let cur = RegState::pointer(PtrBase::Ctx, PtrFlags::empty());
        assert!(regsafe(&old, &cur, &mut idmap));
    }

    #[test]
    fn imprecise_scalars_always_match() {
        let mut idmap = IdMap::default();
        let old = read_scalar(0, 10, false);
        let cur = read_scalar(100, 200, false);
        assert!(regsafe(&old, &cur, &mut idmap));
    }

    #[test]
    fn precise_scalars_need_containment() {
        let mut idmap = IdMap::default();
        let old = read_scalar(0, 10, true);
        let inside = read_scalar(2, 8, false);
        let outside = read_scalar(5, 20, false);
        assert!(regsafe(&old, &inside, &mut idmap));
        assert!(!regsafe(&old, &outside, &mut idmap));
    }

    #[test]
    fn pointer_kinds_must_match_exactly() {
        let mut idmap = IdMap::default();
        let mut old = RegState::pointer(PtrBase::Ctx, PtrFlags::empty());
        old.live = Live::READ64;
        let cur_ok = RegState::pointer(PtrBase::Ctx, PtrFlags::empty());
        let cur_bad = RegState::pointer(PtrBase::FlowKeys, PtrFlags::empty());
        assert!(regsafe(&old, &cur_ok, &mut idmap));
        assert!(!regsafe(&old, &cur_bad, &mut idmap));
    }

    #[test]
    fn packet_range_may_grow() {
        let mut idmap = IdMap::default();
        let mut old = RegState::pointer(PtrBase::Packet { range: 8 }, PtrFlags::empty());
        old.live = Live::READ64;
        let shorter = RegState::pointer(PtrBase::Packet { range: 4 }, PtrFlags::empty());
        let longer = RegState::pointer(PtrBase::Packet { range: 16 }, PtrFlags::empty());
        assert!(!regsafe(&old, &shorter, &mut idmap));
        assert!(regsafe(&old, &longer, &mut idmap));
    }

    #[test]
    fn id_mapping_is_consistent() {
        let mut idmap = IdMap::default();
        assert!(idmap.same(1, 7));
        assert!(idmap.same(1, 7));
        assert!(!idmap.same(1, 8));
        assert!(idmap.same(2, 8));
        assert!(!idmap.same(3, 0));
    }

    #[test]
    fn speculative_old_cannot_prune_real_paths() {
        let mut old = VerifierState::entry();
        old.speculative = true;
        let cur = VerifierState::entry();
        assert!(!states_equal(&old, &cur, false));
        assert!(states_equal(&cur, &old, false));
    }

    #[test]
    fn lock_states_must_agree() {
        use crate::state::{
            ActiveLock,
            LockObject,
        };
        let mut old = VerifierState::entry();
        let cur = VerifierState::entry();
        assert!(states_equal(&old, &cur, false));
        old.active_lock = Some(ActiveLock {
            object: LockObject::MapValue(crate::map::MapId(0)),
            id: 1,
        });
        assert!(!states_equal(&old, &cur, false));
    }

    #[test]
    fn generalization_prunes_refined_copies() {
        let mut old = VerifierState::entry();
        let mut cur = VerifierState::entry();
        *old.reg_mut(RegId::R6) = read_scalar(0, 100, true);
        *cur.reg_mut(RegId::R6) = read_scalar(10, 20, false);
        assert!(states_equal(&old, &cur, false));
        // And not the other way around.
        assert!(!states_equal(&cur, &old, false) || !cur.reg(RegId::R6).precise);
    }
}
