//! Precision backtracking.
//!
//! A scalar is precise when its exact abstraction is load-bearing: a
//! constant map key, a bounded size, a decided branch, or a value folded
//! into pointer bounds. The demand is raised at the use site and replayed
//! backward through the instruction history, at each step computing which
//! ancestor registers and stack slots must also be precise, hopping from
//! the in-flight state to its checkpoint ancestry. Opcodes the replay
//! cannot see through degrade to marking every scalar precise, which is
//! always sound.

use krait_asm::{
    AluOp,
    Class,
    Instruction,
    JmpOp,
    Mode,
    PseudoCall,
    RegId,
    SrcKind,
};

use crate::consts::MAX_CALL_FRAMES;
use crate::error::VResult;
use crate::log::vtrace;
use crate::stack::Stack;
use crate::state::JmpHistoryEntry;

use super::Verifier;

/// Pending precision demands per frame, registers as a bitmask and stack
/// slots as a bitmask.
#[derive(Debug, Default, Clone)]
pub(crate) struct BacktrackState {
    reg_masks: [u16; MAX_CALL_FRAMES],
    stack_masks: [u64; MAX_CALL_FRAMES],
    frame: usize,
}

impl BacktrackState {
    fn new(frame: usize) -> Self {
        Self {
            frame,
            ..Self::default()
        }
    }

    fn set_reg(&mut self, frame: usize, regno: usize) {
        self.reg_masks[frame] |= 1 << regno;
    }

    fn clear_reg(&mut self, frame: usize, regno: usize) {
        self.reg_masks[frame] &= !(1 << regno);
    }

    fn has_reg(&self, frame: usize, regno: usize) -> bool {
        self.reg_masks[frame] & (1 << regno) != 0
    }

    fn set_slot(&mut self, frame: usize, slot: usize) {
        if slot < 64 {
            self.stack_masks[frame] |= 1 << slot;
        }
    }

    fn clear_slot(&mut self, frame: usize, slot: usize) {
        if slot < 64 {
            self.stack_masks[frame] &= !(1 << slot);
        }
    }

    fn has_slot(&self, frame: usize, slot: usize) -> bool {
        slot < 64 && self.stack_masks[frame] & (1 << slot) != 0
    }

    fn any_slots(&self, frame: usize) -> bool {
        self.stack_masks[frame] != 0
    }

    fn is_empty(&self) -> bool {
        self.reg_masks.iter().all(|&m| m == 0) && self.stack_masks.iter().all(|&m| m == 0)
    }
}

/// What the demand initially points at.
#[derive(Debug, Clone, Copy)]
pub(crate) enum PrecisionTarget {
    Reg(usize),
    Slot(usize),
}

/// The replay gave up; the caller falls back to marking everything.
struct NotSupported;

impl Verifier<'_> {
    /// Demand that `regno` in `frameno` be precise, back-propagating the
    /// demand through the history.
    pub(crate) fn mark_chain_precision(
        &mut self,
        frameno: usize,
        regno: usize,
    ) -> VResult<()> {
        self.mark_chain_precision_at(frameno, PrecisionTarget::Reg(regno))
    }

    /// Demand precision of a stack slot.
    pub(crate) fn mark_chain_precision_slot(
        &mut self,
        frameno: usize,
        slot: usize,
    ) -> VResult<()> {
        self.mark_chain_precision_at(frameno, PrecisionTarget::Slot(slot))
    }

    pub(crate) fn mark_chain_precision_at(
        &mut self,
        frameno: usize,
        target: PrecisionTarget,
    ) -> VResult<()> {
        let mut bt = BacktrackState::new(self.cur.curframe);
        match target {
            PrecisionTarget::Reg(regno) => {
                let reg = &mut self.cur.frames[frameno].regs[regno];
                if !reg.is_scalar() || reg.precise {
                    return Ok(());
                }
                reg.precise = true;
                bt.set_reg(frameno, regno);
            }
            PrecisionTarget::Slot(slot) => {
                let Some(s) = self.cur.frames[frameno].stack.slot_mut(slot) else {
                    return Ok(());
                };
                if !s.spilled.is_scalar() || s.spilled.precise {
                    return Ok(());
                }
                s.spilled.precise = true;
                bt.set_slot(frameno, slot);
            }
        }

        match self.backtrack(&mut bt) {
            Ok(()) => Ok(()),
            Err(NotSupported) => {
                vtrace!(
                    self.log,
                    "{}: precision replay gave up, marking all scalars precise",
                    self.insn_idx
                );
                self.mark_all_scalars_precise();
                Ok(())
            }
        }
    }

    fn backtrack(&mut self, bt: &mut BacktrackState) -> Result<(), NotSupported> {
        // Segment of the in-flight state first.
        let mut last_idx = self.insn_idx;
        let mut first_idx = self.cur.first_insn_idx;
        let mut hist: Vec<JmpHistoryEntry> = self.cur.jmp_history.clone();
        let mut skip_first = true;
        let mut cursor = self.cur.parent;

        loop {
            let mut i = last_idx;
            loop {
                if skip_first {
                    skip_first = false;
                } else {
                    let insn = self.insns.get(i).copied().ok_or(NotSupported)?;
                    self.backtrack_insn(i, insn, bt)?;
                }
                if bt.is_empty() {
                    return Ok(());
                }
                if i == first_idx {
                    break;
                }
                let prev = match hist.last() {
                    Some(entry) if entry.idx as usize == i => {
                        let entry = *entry;
                        hist.pop();
                        entry.prev_idx as usize
                    }
                    _ => i.checked_sub(1).ok_or(NotSupported)?,
                };
                self.cross_edge(prev, i, bt)?;
                i = prev;
            }

            // Apply pending demands to the ancestor checkpoint and keep
            // walking inside it.
            let Some(id) = cursor else {
                // Demands that reach past the entry cannot be satisfied.
                return Err(NotSupported);
            };
            let Some(node) = self.arena.get_mut(id) else {
                return Err(NotSupported);
            };
            for frame in 0..node.frames.len().min(MAX_CALL_FRAMES) {
                for regno in 0..16usize {
                    if !bt.has_reg(frame, regno) {
                        continue;
                    }
                    let Some(reg) = node.frames[frame].regs.get_mut(regno) else {
                        bt.clear_reg(frame, regno);
                        continue;
                    };
                    if !reg.is_scalar() || reg.precise {
                        bt.clear_reg(frame, regno);
                        continue;
                    }
                    reg.precise = true;
                }
                let slot_count = node.frames[frame].stack.slot_count();
                for slot in 0..64usize {
                    if !bt.has_slot(frame, slot) {
                        continue;
                    }
                    if slot >= slot_count {
                        bt.clear_slot(frame, slot);
                        continue;
                    }
                    let s = node.frames[frame]
                        .stack
                        .slot_mut(slot)
                        .expect("slot index below count");
                    if !s.spilled.is_scalar() || s.spilled.precise {
                        bt.clear_slot(frame, slot);
                        continue;
                    }
                    s.spilled.precise = true;
                }
            }
            if bt.is_empty() {
                return Ok(());
            }
            last_idx = node.last_insn_idx;
            first_idx = node.first_insn_idx;
            hist = node.jmp_history.clone();
            cursor = node.parent;
            skip_first = false;
            if last_idx < first_idx {
                return Err(NotSupported);
            }
        }
    }

    /// Frame transitions when the backward step from `i` to `prev` crosses
    /// a call entry or a return.
    fn cross_edge(
        &self,
        prev: usize,
        i: usize,
        bt: &mut BacktrackState,
    ) -> Result<(), NotSupported> {
        let Some(insn) = self.insns.get(prev).copied() else {
            return Err(NotSupported);
        };
        if insn.pseudo_call() == Some(PseudoCall::Subprog) {
            let callee_start = (prev as i64 + 1 + insn.imm() as i64) as usize;
            if callee_start == i {
                // Backing over a call entry: argument demands move to the
                // caller's argument registers.
                let fr = bt.frame;
                if fr == 0 {
                    return Err(NotSupported);
                }
                let args = bt.reg_masks[fr] & 0b111110;
                let rest = bt.reg_masks[fr] & !0b111110;
                if rest != 0 || bt.any_slots(fr) {
                    // Anything else was uninitialized at entry.
                    return Err(NotSupported);
                }
                bt.reg_masks[fr] = 0;
                bt.reg_masks[fr - 1] |= args;
                bt.frame = fr - 1;
            }
        } else if insn.is_exit() {
            // Backing over a return: the caller's r0 demand becomes the
            // callee's r0 demand.
            let fr = bt.frame;
            if fr + 1 >= MAX_CALL_FRAMES {
                return Err(NotSupported);
            }
            if bt.has_reg(fr, RegId::R0.index()) {
                bt.clear_reg(fr, RegId::R0.index());
                bt.set_reg(fr + 1, RegId::R0.index());
            }
            if bt.reg_masks[fr] & 0b111110 != 0 {
                // Caller r1..r5 were scrubbed by the call.
                return Err(NotSupported);
            }
            bt.frame = fr + 1;
        }
        Ok(())
    }

    /// One instruction of the backward replay.
    fn backtrack_insn(
        &self,
        _idx: usize,
        insn: Instruction,
        bt: &mut BacktrackState,
    ) -> Result<(), NotSupported> {
        let fr = bt.frame;
        match insn.class() {
            Class::Alu32 | Class::Alu64 => {
                let dst = insn.dst_field() as usize;
                if !bt.has_reg(fr, dst) {
                    return Ok(());
                }
                let Some(op) = insn.alu_op() else {
                    return Err(NotSupported);
                };
                match op {
                    AluOp::Mov => {
                        bt.clear_reg(fr, dst);
                        if insn.src_kind() == SrcKind::Reg {
                            bt.set_reg(fr, insn.src_field() as usize);
                        }
                    }
                    AluOp::Neg | AluOp::End => {}
                    _ => {
                        if insn.src_kind() == SrcKind::Reg {
                            bt.set_reg(fr, insn.src_field() as usize);
                        }
                    }
                }
                Ok(())
            }
            Class::Ldx => {
                let dst = insn.dst_field() as usize;
                if !bt.has_reg(fr, dst) {
                    return Ok(());
                }
                bt.clear_reg(fr, dst);
                if insn.src_field() != RegId::FP.val() {
                    // Loads through arbitrary pointers defeat the replay.
                    return Err(NotSupported);
                }
                match Stack::slot_of(insn.off() as i64) {
                    Some(slot) => {
                        bt.set_slot(fr, slot);
                        Ok(())
                    }
                    None => Err(NotSupported),
                }
            }
            Class::St | Class::Stx => {
                if insn.mode() == Some(Mode::Atomic) {
                    // Read-modify-write through a pointer.
                    if bt.any_slots(fr) || bt.has_reg(fr, insn.src_field() as usize) {
                        return Err(NotSupported);
                    }
                    return Ok(());
                }
                if insn.dst_field() == RegId::FP.val() {
                    let Some(slot) = Stack::slot_of(insn.off() as i64) else {
                        return Err(NotSupported);
                    };
                    if bt.has_slot(fr, slot) {
                        bt.clear_slot(fr, slot);
                        if insn.class() == Class::Stx {
                            bt.set_reg(fr, insn.src_field() as usize);
                        }
                    }
                    Ok(())
                } else if bt.any_slots(fr) {
                    // A store through a non-frame pointer may alias any
                    // tracked slot.
                    Err(NotSupported)
                } else {
                    Ok(())
                }
            }
            Class::Jmp | Class::Jmp32 => match insn.jmp_op() {
                Some(JmpOp::Call) => {
                    match insn.pseudo_call() {
                        Some(PseudoCall::Subprog) => Ok(()),
                        _ => {
                            // Helpers scrub r0..r5; a demand on an argument
                            // register here would mean the demand crossed a
                            // clobber.
                            bt.clear_reg(fr, RegId::R0.index());
                            if bt.reg_masks[fr] & 0b111110 != 0 {
                                return Err(NotSupported);
                            }
                            Ok(())
                        }
                    }
                }
                Some(_) => Ok(()),
                None => Err(NotSupported),
            },
            Class::Ld => {
                if insn.is_ld_imm64() {
                    // A constant load is where a demand resolves.
                    bt.clear_reg(fr, insn.dst_field() as usize);
                    Ok(())
                } else {
                    bt.clear_reg(fr, RegId::R0.index());
                    if bt.reg_masks[fr] & 0b111110 != 0 {
                        return Err(NotSupported);
                    }
                    Ok(())
                }
            }
        }
    }

    /// Conservative fallback: every scalar in the in-flight state and its
    /// whole ancestry becomes precise.
    pub(crate) fn mark_all_scalars_precise(&mut self) {
        let mark = |state: &mut crate::state::VerifierState| {
            for frame in &mut state.frames {
                for reg in frame.regs.iter_mut() {
                    if reg.is_scalar() {
                        reg.precise = true;
                    }
                }
                for (_, slot) in frame.stack.iter_mut() {
                    if slot.is_spilled_reg() && slot.spilled.is_scalar() {
                        slot.spilled.precise = true;
                    }
                }
            }
        };
        mark(&mut self.cur);
        let mut cursor = self.cur.parent;
        while let Some(id) = cursor {
            let Some(node) = self.arena.get_mut(id) else {
                break;
            };
            mark(node);
            cursor = node.parent;
        }
    }

    /// On a prune, precision facts of the subsuming state become demands on
    /// the pruned path's ancestry.
    pub(crate) fn propagate_precision(
        &mut self,
        old_id: crate::state::StateId,
    ) -> VResult<()> {
        let Some(old) = self.arena.get(old_id) else {
            return Ok(());
        };
        let mut targets: Vec<(usize, PrecisionTarget)> = Vec::new();
        for (f, frame) in old.frames.iter().enumerate() {
            for (r, reg) in frame.regs.iter().enumerate() {
                if reg.is_scalar() && reg.precise {
                    targets.push((f, PrecisionTarget::Reg(r)));
                }
            }
            for (s, slot) in frame.stack.iter() {
                if slot.is_spilled_reg() && slot.spilled.is_scalar() && slot.spilled.precise
                {
                    targets.push((f, PrecisionTarget::Slot(s)));
                }
            }
        }
        for (f, target) in targets {
            if f < self.cur.frames.len() {
                self.mark_chain_precision_at(f, target)?;
            }
        }
        Ok(())
    }
}
