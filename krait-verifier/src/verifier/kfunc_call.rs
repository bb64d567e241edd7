//! Typed kernel-function calls.
//!
//! Argument contracts come from the kernel-function registry and type
//! database rather than helper prototypes, and several functions perform
//! bespoke state transitions: RCU bracket toggles, object allocation and
//! disposal, graph-collection ownership transfers, and the iterator
//! construct/advance/destroy cycle whose convergence check anchors loop
//! termination.

use krait_asm::{
    Instruction,
    RegId,
};

use crate::consts::SLOT_SIZE;
use crate::error::{
    Bug,
    BugVariant,
    Reject,
    VResult,
};
use crate::kfunc::{
    KfuncFlags,
    KfuncId,
};
use crate::ktype::KtypeId;
use crate::map::FieldKind;
use crate::reg::{
    IterKind,
    IterPhase,
    IterState,
    Live,
    PtrBase,
    PtrFlags,
    RegState,
};
use crate::stack::{
    SlotTag,
    Stack,
};

use super::{
    clobber_caller_saved,
    Flow,
    Verifier,
};

impl Verifier<'_> {
    pub(crate) fn check_kfunc_call(&mut self, insn: Instruction) -> VResult<Flow> {
        let kfunc = KfuncId::from_imm(insn.imm()).ok_or_else(|| {
            self.reject(
                Reject::UnknownOpcode,
                format!("invalid kernel function id {}", insn.imm()),
            )
        })?;
        let flags = kfunc.flags();

        if self.cur.active_lock.is_some() && !kfunc.allowed_with_lock() {
            return Err(self.reject(
                Reject::CallWithLockHeld,
                format!("call to {} with a lock held", kfunc.name()),
            ));
        }
        if flags.contains(KfuncFlags::RCU_PROTECTED) && !self.cur.active_rcu {
            return Err(self.reject(
                Reject::BadRcuBracket,
                format!("{} requires an RCU bracket", kfunc.name()),
            ));
        }
        if flags.contains(KfuncFlags::LOCK_HELD) && self.cur.active_lock.is_none() {
            return Err(self.reject(
                Reject::CallWithLockHeld,
                format!("{} requires the collection lock", kfunc.name()),
            ));
        }

        match kfunc {
            KfuncId::RcuReadLock => {
                if self.cur.active_rcu {
                    return Err(self.reject(
                        Reject::BadRcuBracket,
                        "nested RCU bracket",
                    ));
                }
                self.cur.active_rcu = true;
                self.scrub_after_kfunc(None);
                Ok(Flow::Next(self.insn_idx + 1))
            }
            KfuncId::RcuReadUnlock => {
                if !self.cur.active_rcu {
                    return Err(self.reject(
                        Reject::BadRcuBracket,
                        "RCU unlock without a bracket",
                    ));
                }
                self.cur.active_rcu = false;
                demote_rcu_pointers(&mut self.cur);
                self.scrub_after_kfunc(None);
                Ok(Flow::Next(self.insn_idx + 1))
            }
            KfuncId::ObjNew => self.check_obj_new(),
            KfuncId::ObjDrop => self.check_obj_drop(),
            KfuncId::RefcountAcquire => self.check_refcount_acquire(),
            KfuncId::ListPushFront | KfuncId::ListPushBack => self.check_list_push(kfunc),
            KfuncId::ListPopFront | KfuncId::ListPopBack => self.check_collection_take(
                kfunc,
                |k| matches!(k, FieldKind::ListHead { .. }),
                "list head",
            ),
            KfuncId::RbtreeRemove => self.check_collection_take(
                kfunc,
                |k| matches!(k, FieldKind::RbRoot { .. }),
                "rb root",
            ),
            KfuncId::RbtreeFirst => self.check_rbtree_first(),
            KfuncId::RbtreeAdd => self.check_rbtree_add(),
            KfuncId::KptrXchg => self.check_kptr_xchg(),
            KfuncId::IterNumNew => self.check_iter_new(kfunc),
            KfuncId::IterNumNext => self.check_iter_next(kfunc),
            KfuncId::IterNumDestroy => self.check_iter_destroy(kfunc),
        }
    }

    /// Calls scrub the caller-saved registers; `r0` gets `out` when the
    /// function returns a value.
    fn scrub_after_kfunc(&mut self, out: Option<RegState>) {
        clobber_caller_saved(self.cur.cur_frame_mut());
        if let Some(mut out) = out {
            out.live = Live::WRITTEN;
            *self.cur.reg_mut(RegId::R0) = out;
        }
    }

    fn acquire_here(&mut self) -> u32 {
        let id = self.next_id();
        let callback_ref = if self.cur.cur_frame().in_callback {
            self.cur.curframe as u32 + 1
        } else {
            0
        };
        let insn_idx = self.insn_idx;
        self.cur
            .cur_frame_mut()
            .acquire_ref(id, insn_idx, callback_ref);
        id
    }

    fn check_obj_new(&mut self) -> VResult<Flow> {
        let type_arg = self.read_reg(RegId::R1, Live::READ64)?;
        let Some(type_id) = type_arg.const_value() else {
            return Err(self.reject(
                Reject::BadCallArgument,
                "obj_new needs a constant type id",
            ));
        };
        self.mark_chain_precision(self.cur.curframe, RegId::R1.index())?;
        let id = KtypeId(type_id as u32);
        self.ktypes.resolve(id, self.insn_idx)?;

        let ref_id = self.acquire_here();
        let mut out = RegState::pointer(
            PtrBase::Ktype { id },
            PtrFlags::ALLOC | PtrFlags::TRUSTED | PtrFlags::MAYBE_NULL,
        );
        out.id = ref_id;
        out.ref_obj_id = ref_id;
        self.scrub_after_kfunc(Some(out));
        Ok(Flow::Next(self.insn_idx + 1))
    }

    fn check_obj_drop(&mut self) -> VResult<Flow> {
        let obj = self.read_reg(RegId::R1, Live::READ64)?;
        let owning_alloc = matches!(obj.ptr_base(), Some(PtrBase::Ktype { .. }))
            && obj.ptr_flags().contains(PtrFlags::ALLOC)
            && obj.ref_obj_id != 0;
        if !owning_alloc {
            return Err(self.reject(
                Reject::BadCallArgument,
                format!("R1 type={obj} expected an owned allocation"),
            ));
        }
        if obj.maybe_null() {
            return Err(self.reject(
                Reject::MaybeNullDeref,
                "R1 may be null; check before dropping",
            ));
        }
        self.release_id(obj.ref_obj_id)?;
        self.scrub_after_kfunc(None);
        Ok(Flow::Next(self.insn_idx + 1))
    }

    fn release_id(&mut self, id: u32) -> VResult<()> {
        if !self.cur.cur_frame_mut().release_ref(id) {
            return Err(self.reject(
                Reject::ReleaseWithoutAcquire,
                format!("release of reference id={id} that was not acquired"),
            ));
        }
        self.cur.invalidate_ref(id);
        Ok(())
    }

    fn check_refcount_acquire(&mut self) -> VResult<Flow> {
        let obj = self.read_reg(RegId::R1, Live::READ64)?;
        let Some(PtrBase::Ktype { id }) = obj.ptr_base() else {
            return Err(self.reject(
                Reject::BadCallArgument,
                format!("R1 type={obj} expected an allocation"),
            ));
        };
        let shared = obj.ptr_flags().contains(PtrFlags::ALLOC)
            || obj.ptr_flags().contains(PtrFlags::NON_OWN_REF);
        if !shared || obj.maybe_null() {
            return Err(self.reject(
                Reject::BadCallArgument,
                "refcount_acquire needs a non-null allocation view",
            ));
        }
        let ref_id = self.acquire_here();
        let mut out = RegState::pointer(
            PtrBase::Ktype { id },
            PtrFlags::ALLOC | PtrFlags::TRUSTED,
        );
        out.id = ref_id;
        out.ref_obj_id = ref_id;
        self.scrub_after_kfunc(Some(out));
        Ok(Flow::Next(self.insn_idx + 1))
    }

    /// Head-or-root argument shared by the collection calls: a map value
    /// pointing exactly at the declared field.
    fn collection_anchor(
        &mut self,
        regno: RegId,
        want: impl Fn(&FieldKind) -> bool,
        what: &str,
    ) -> VResult<(crate::map::MapId, FieldKind)> {
        let reg = self.read_reg(regno, Live::READ64)?;
        let Some(PtrBase::MapValue { map, .. }) = reg.ptr_base() else {
            return Err(self.reject(
                Reject::BadCallArgument,
                format!("R{} type={} expected a {}", regno.val(), reg, what),
            ));
        };
        if reg.maybe_null() || !reg.fixed_off() || reg.off < 0 {
            return Err(self.reject(
                Reject::BadCallArgument,
                format!("R{} must point exactly at the {}", regno.val(), what),
            ));
        }
        let def = self.map_def(map)?;
        let field = def
            .field_at(reg.off as u32)
            .filter(|f| want(&f.kind))
            .map(|f| f.kind);
        let Some(kind) = field else {
            return Err(self.reject(
                Reject::BadCallArgument,
                format!("R{} does not point at a {}", regno.val(), what),
            ));
        };
        Ok((map, kind))
    }

    fn check_list_push(&mut self, kfunc: KfuncId) -> VResult<Flow> {
        let (_, head) = self.collection_anchor(
            RegId::R1,
            |k| matches!(k, FieldKind::ListHead { .. }),
            "list head",
        )?;
        let FieldKind::ListHead { node: node_type } = head else {
            return Err(Bug::new(BugVariant::UnexpectedRegState, self.insn_idx).into());
        };
        self.take_owned_node(RegId::R2, node_type, kfunc)?;
        let mut out = RegState::unknown_scalar();
        out.smin = -crate::consts::MAX_ERRNO;
        out.smax = 0;
        crate::bounds::sync_bounds(&mut out);
        self.scrub_after_kfunc(Some(out));
        Ok(Flow::Next(self.insn_idx + 1))
    }

    /// Consume an owned allocation argument, leaving non-owning views of it
    /// behind.
    fn take_owned_node(
        &mut self,
        regno: RegId,
        node_type: KtypeId,
        kfunc: KfuncId,
    ) -> VResult<()> {
        let node = self.read_reg(regno, Live::READ64)?;
        let owned = matches!(node.ptr_base(), Some(PtrBase::Ktype { id }) if id == node_type)
            && node.ptr_flags().contains(PtrFlags::ALLOC)
            && node.ref_obj_id != 0
            && !node.maybe_null();
        if !owned {
            return Err(self.reject(
                Reject::BadCallArgument,
                format!(
                    "R{} type={} expected an owned node for {}",
                    regno.val(),
                    node,
                    kfunc.name()
                ),
            ));
        }
        let ref_id = node.ref_obj_id;
        if !self.cur.cur_frame_mut().release_ref(ref_id) {
            return Err(self.reject(
                Reject::ReleaseWithoutAcquire,
                format!("node reference id={ref_id} was not acquired"),
            ));
        }
        // The collection owns the node now; program copies become
        // non-owning views valid until the lock is dropped.
        for frame in &mut self.cur.frames {
            for reg in frame.regs.iter_mut() {
                if reg.ref_obj_id == ref_id {
                    reg.ref_obj_id = 0;
                    if let Some(flags) = reg.ptr_flags_mut() {
                        flags.insert(PtrFlags::NON_OWN_REF);
                    }
                }
            }
            for (_, slot) in frame.stack.iter_mut() {
                if slot.is_spilled_reg() && slot.spilled.ref_obj_id == ref_id {
                    slot.spilled.ref_obj_id = 0;
                    if let Some(flags) = slot.spilled.ptr_flags_mut() {
                        flags.insert(PtrFlags::NON_OWN_REF);
                    }
                }
            }
        }
        Ok(())
    }

    fn check_collection_take(
        &mut self,
        _kfunc: KfuncId,
        want: impl Fn(&FieldKind) -> bool,
        what: &str,
    ) -> VResult<Flow> {
        let (_, kind) = self.collection_anchor(RegId::R1, want, what)?;
        let node_type = match kind {
            FieldKind::ListHead { node } | FieldKind::RbRoot { node } => node,
            _ => return Err(Bug::new(BugVariant::UnexpectedRegState, self.insn_idx).into()),
        };
        let ref_id = self.acquire_here();
        let mut out = RegState::pointer(
            PtrBase::Ktype { id: node_type },
            PtrFlags::ALLOC | PtrFlags::TRUSTED | PtrFlags::MAYBE_NULL,
        );
        out.id = ref_id;
        out.ref_obj_id = ref_id;
        self.scrub_after_kfunc(Some(out));
        Ok(Flow::Next(self.insn_idx + 1))
    }

    fn check_rbtree_first(&mut self) -> VResult<Flow> {
        let (_, kind) = self.collection_anchor(
            RegId::R1,
            |k| matches!(k, FieldKind::RbRoot { .. }),
            "rb root",
        )?;
        let FieldKind::RbRoot { node } = kind else {
            return Err(Bug::new(BugVariant::UnexpectedRegState, self.insn_idx).into());
        };
        let id = self.next_id();
        let mut out = RegState::pointer(
            PtrBase::Ktype { id: node },
            PtrFlags::ALLOC | PtrFlags::NON_OWN_REF | PtrFlags::MAYBE_NULL,
        );
        out.id = id;
        self.scrub_after_kfunc(Some(out));
        Ok(Flow::Next(self.insn_idx + 1))
    }

    fn check_rbtree_add(&mut self) -> VResult<Flow> {
        let (_, kind) = self.collection_anchor(
            RegId::R1,
            |k| matches!(k, FieldKind::RbRoot { .. }),
            "rb root",
        )?;
        let FieldKind::RbRoot { node } = kind else {
            return Err(Bug::new(BugVariant::UnexpectedRegState, self.insn_idx).into());
        };
        let less = self.read_reg(RegId::R3, Live::READ64)?;
        let Some(PtrBase::Func { subprog }) = less.ptr_base() else {
            return Err(self.reject(
                Reject::BadCallArgument,
                "rbtree_add needs a comparator callback",
            ));
        };
        self.take_owned_node(RegId::R2, node, KfuncId::RbtreeAdd)?;
        self.scrub_after_kfunc(Some(RegState::constant(0)));

        // Verify the comparator with two non-owning node views.
        if self.cur.frames.len() >= crate::consts::MAX_CALL_FRAMES {
            return Err(self.reject(
                Reject::CallStackTooDeep,
                "comparator nests the call stack too deep",
            ));
        }
        let frameno = self.cur.frames.len();
        let subprog = subprog as usize;
        let target = self.cfg.subprogs[subprog].start;
        let mut callee =
            crate::frame::FuncState::new(frameno, subprog, Some(self.insn_idx));
        callee.refs = self.cur.cur_frame().refs.clone();
        callee.in_callback = true;
        for r in [RegId::R1, RegId::R2] {
            let mut arg = RegState::pointer(
                PtrBase::Ktype { id: node },
                PtrFlags::ALLOC | PtrFlags::NON_OWN_REF,
            );
            arg.id = self.next_id();
            arg.live = Live::WRITTEN;
            *callee.reg_mut(r) = arg;
        }
        self.cur.frames.push(callee);
        self.cur.curframe = frameno;
        Ok(Flow::Next(target))
    }

    fn check_kptr_xchg(&mut self) -> VResult<Flow> {
        let cell = self.read_reg(RegId::R1, Live::READ64)?;
        let Some(PtrBase::MapValue { map, .. }) = cell.ptr_base() else {
            return Err(self.reject(
                Reject::BadCallArgument,
                format!("R1 type={cell} expected a kptr cell"),
            ));
        };
        if cell.maybe_null() || !cell.fixed_off() || cell.off < 0 {
            return Err(self.reject(
                Reject::BadCallArgument,
                "R1 must point exactly at the kptr cell",
            ));
        }
        let def = self.map_def(map)?;
        let Some(FieldKind::Kptr { target, .. }) = def
            .field_at(cell.off as u32)
            .map(|f| f.kind)
        else {
            return Err(self.reject(
                Reject::BadCallArgument,
                "R1 does not point at a kptr cell",
            ));
        };

        let new = self.read_reg(RegId::R2, Live::READ64)?;
        let is_null = new.const_value() == Some(0);
        if !is_null {
            let owned = matches!(new.ptr_base(), Some(PtrBase::Ktype { id }) if id == target)
                && new.ref_obj_id != 0;
            if !owned {
                return Err(self.reject(
                    Reject::BadCallArgument,
                    format!("R2 type={new} expected an owned pointer or null"),
                ));
            }
            // Ownership moves into the cell; the entry is gone but the
            // registers keep their (now unowned) view.
            let ref_id = new.ref_obj_id;
            if !self.cur.cur_frame_mut().release_ref(ref_id) {
                return Err(self.reject(
                    Reject::ReleaseWithoutAcquire,
                    format!("reference id={ref_id} was not acquired"),
                ));
            }
            for frame in &mut self.cur.frames {
                for reg in frame.regs.iter_mut() {
                    if reg.ref_obj_id == ref_id {
                        reg.ref_obj_id = 0;
                    }
                }
                for (_, slot) in frame.stack.iter_mut() {
                    if slot.is_spilled_reg() && slot.spilled.ref_obj_id == ref_id {
                        slot.spilled.ref_obj_id = 0;
                    }
                }
            }
        }

        // The previous occupant comes back owned.
        let ref_id = self.acquire_here();
        let mut out = RegState::pointer(
            PtrBase::Ktype { id: target },
            PtrFlags::ALLOC | PtrFlags::TRUSTED | PtrFlags::MAYBE_NULL,
        );
        out.id = ref_id;
        out.ref_obj_id = ref_id;
        self.scrub_after_kfunc(Some(out));
        Ok(Flow::Next(self.insn_idx + 1))
    }

    // ------------------------------------------------------------------
    // Iterators
    // ------------------------------------------------------------------

    /// The iterator argument: a fixed stack pointer at the object's first
    /// slot.
    fn iter_slots_of(&mut self, regno: RegId, kind: IterKind) -> VResult<(usize, usize, usize)> {
        let reg = self.read_reg(regno, Live::READ64)?;
        let Some(PtrBase::Stack { frameno }) = reg.ptr_base() else {
            return Err(self.reject(
                Reject::BadCallArgument,
                format!("R{} type={} expected an iterator slot", regno.val(), reg),
            ));
        };
        if !reg.fixed_off() || reg.off % SLOT_SIZE as i32 != 0 {
            return Err(self.reject(
                Reject::BadCallArgument,
                format!("R{} iterator must sit at an aligned stack offset", regno.val()),
            ));
        }
        let slots = (kind.size() / SLOT_SIZE) as usize;
        let end = reg.off as i64 + (slots as i64 * SLOT_SIZE as i64);
        if reg.off >= 0 || end > 0 || (reg.off as i64) < -(crate::consts::MAX_STACK as i64) {
            return Err(self.reject(
                Reject::OutOfBounds,
                format!("R{} iterator slots out of stack bounds", regno.val()),
            ));
        }
        let first_slot = Stack::slot_of(end - 1).expect("range-checked");
        Ok((frameno as usize, first_slot, slots))
    }

    fn check_iter_new(&mut self, kfunc: KfuncId) -> VResult<Flow> {
        let kind = kfunc.iter_kind().expect("iterator kfunc");
        let (frameno, first_slot, slots) = self.iter_slots_of(RegId::R1, kind)?;
        // Bounds arguments are plain scalars.
        for r in [RegId::R2, RegId::R3] {
            let reg = self.read_reg(r, Live::READ64)?;
            if !reg.is_scalar() {
                return Err(self.reject(
                    Reject::BadCallArgument,
                    format!("R{} iterator bound must be a scalar", r.val()),
                ));
            }
        }
        let occupied = (first_slot..first_slot + slots).any(|idx| {
            self.cur.frames[frameno]
                .stack
                .slot(idx)
                .is_some_and(|s| s.holds_typed_obj() || s.is_spilled_reg())
        });
        if occupied {
            return Err(self.reject(
                Reject::BadCallArgument,
                "iterator slots are already in use",
            ));
        }

        let ref_id = self.acquire_here();
        let frame = &mut self.cur.frames[frameno];
        let grow_off = -((first_slot as i64 + slots as i64) * SLOT_SIZE as i64);
        frame.stack.grow_to(grow_off);
        for (i, idx) in (first_slot..first_slot + slots).enumerate() {
            let slot = frame
                .stack
                .slot_mut(idx)
                .expect("stack was grown to cover the iterator");
            let mut state = RegState::not_init();
            if i == 0 {
                state.iter = Some(IterState {
                    kind,
                    phase: IterPhase::Active,
                    depth: 0,
                });
                state.ref_obj_id = ref_id;
            }
            state.live = Live::WRITTEN;
            slot.spilled = state;
            slot.tags = [SlotTag::Iter; 8];
        }

        let mut out = RegState::unknown_scalar();
        out.smin = -crate::consts::MAX_ERRNO;
        out.smax = 0;
        crate::bounds::sync_bounds(&mut out);
        self.scrub_after_kfunc(Some(out));
        Ok(Flow::Next(self.insn_idx + 1))
    }

    /// Advance: the drained outcome continues in place; an active twin with
    /// one more step is queued. Convergence at this instruction's prune
    /// point is the termination proof.
    fn check_iter_next(&mut self, kfunc: KfuncId) -> VResult<Flow> {
        let kind = kfunc.iter_kind().expect("iterator kfunc");
        let (frameno, first_slot, _slots) = self.iter_slots_of(RegId::R1, kind)?;
        let head = self.cur.frames[frameno]
            .stack
            .slot(first_slot)
            .and_then(|s| s.spilled.iter)
            .filter(|it| it.kind == kind);
        let Some(head) = head else {
            return Err(self.reject(
                Reject::BadCallArgument,
                "R1 expected an initialized iterator",
            ));
        };
        self.mark_stack_read_at(frameno, first_slot, Live::READ64)?;

        if head.phase == IterPhase::Active {
            // Twin: the advance produced an element.
            let insn_idx = self.insn_idx;
            let twin = self.push_fork(insn_idx + 1, false)?;
            let slot = twin.frames[frameno]
                .stack
                .slot_mut(first_slot)
                .expect("iterator slot exists in the fork");
            if let Some(it) = slot.spilled.iter.as_mut() {
                it.depth += 1;
            }
            clobber_caller_saved(&mut twin.frames[twin.curframe]);
            let mut item = RegState::pointer(
                PtrBase::Mem { size: SLOT_SIZE },
                PtrFlags::RDONLY,
            );
            item.live = Live::WRITTEN;
            let curframe = twin.curframe;
            *twin.frames[curframe].reg_mut(RegId::R0) = item;
        }

        // This path: drained.
        let slot = self.cur.frames[frameno]
            .stack
            .slot_mut(first_slot)
            .expect("iterator slot exists");
        if let Some(it) = slot.spilled.iter.as_mut() {
            it.phase = IterPhase::Drained;
        }
        self.scrub_after_kfunc(Some(RegState::constant(0)));
        Ok(Flow::Next(self.insn_idx + 1))
    }

    fn check_iter_destroy(&mut self, kfunc: KfuncId) -> VResult<Flow> {
        let kind = kfunc.iter_kind().expect("iterator kfunc");
        let (frameno, first_slot, slots) = self.iter_slots_of(RegId::R1, kind)?;
        let ref_id = self.cur.frames[frameno]
            .stack
            .slot(first_slot)
            .filter(|s| s.spilled.iter.is_some())
            .map(|s| s.spilled.ref_obj_id);
        let Some(ref_id) = ref_id else {
            return Err(self.reject(
                Reject::BadCallArgument,
                "R1 expected an initialized iterator",
            ));
        };
        if !self.cur.cur_frame_mut().release_ref(ref_id) {
            return Err(self.reject(
                Reject::ReleaseWithoutAcquire,
                format!("iterator reference id={ref_id} was not acquired"),
            ));
        }
        let frame = &mut self.cur.frames[frameno];
        for idx in first_slot..first_slot + slots {
            if let Some(slot) = frame.stack.slot_mut(idx) {
                slot.invalidate();
            }
        }
        self.scrub_after_kfunc(None);
        Ok(Flow::Next(self.insn_idx + 1))
    }
}

/// Closing the RCU bracket strips protection: protected pointers become
/// untrusted and must not be dereferenced further.
fn demote_rcu_pointers(state: &mut crate::state::VerifierState) {
    let demote = |reg: &mut RegState| {
        if let Some(flags) = reg.ptr_flags_mut() {
            if flags.contains(PtrFlags::RCU) {
                flags.remove(PtrFlags::RCU | PtrFlags::TRUSTED);
                flags.insert(PtrFlags::UNTRUSTED);
            }
        }
    };
    for frame in &mut state.frames {
        for reg in frame.regs.iter_mut() {
            demote(reg);
        }
        for (_, slot) in frame.stack.iter_mut() {
            if slot.is_spilled_reg() {
                demote(&mut slot.spilled);
            }
        }
    }
}
