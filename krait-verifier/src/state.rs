//! Whole-program verifier states, the parent DAG, and the fork worklist.
//!
//! Explored states live in an arena addressed by generational ids; the
//! parent chain is a DAG over those ids, never raw pointers. The state being
//! actively simulated is owned by the driver and only enters the arena when
//! it is checkpointed at a prune point.

use core::fmt;

use itertools::Itertools;
use krait_asm::RegId;

use crate::consts::MAX_CALL_FRAMES;
use crate::frame::FuncState;
use crate::map::MapId;
use crate::reg::RegState;

/// Generational handle of an arena-resident state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateId {
    index: u32,
    gen: u32,
}

/// What object the held spinlock protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockObject {
    /// The lock field of a map value.
    MapValue(MapId),
    /// The lock field of a program-allocated object.
    Alloc,
}

/// The at-most-one held spinlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveLock {
    /// Object class the lock lives in.
    pub object: LockObject,
    /// Correlation id of the locked object's pointer.
    pub id: u32,
}

/// One recorded non-linear control-flow edge, for history replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JmpHistoryEntry {
    /// Instruction arrived at.
    pub idx: u32,
    /// Instruction the edge left from.
    pub prev_idx: u32,
}

/// Full analysis state at one instruction.
#[derive(Debug, Clone)]
pub struct VerifierState {
    /// Live call frames, entry frame first.
    pub frames: Vec<FuncState>,
    /// Index of the executing frame.
    pub curframe: usize,
    /// The held spinlock, if any.
    pub active_lock: Option<ActiveLock>,
    /// Whether an RCU read-side bracket is open.
    pub active_rcu: bool,
    /// Whether this state simulates a mispredicted path.
    pub speculative: bool,
    /// Still-unexplored descendants of this state.
    pub branches: u32,
    /// Checkpoint this state was forked from.
    pub parent: Option<StateId>,
    /// First instruction covered since the parent checkpoint.
    pub first_insn_idx: usize,
    /// Most recent instruction simulated in this state.
    pub last_insn_idx: usize,
    /// Non-linear edges taken since the parent checkpoint.
    pub jmp_history: Vec<JmpHistoryEntry>,
}

impl VerifierState {
    /// Entry state: frame 0 with the given subprogram.
    pub fn entry() -> Self {
        Self {
            frames: vec![FuncState::new(0, 0, None)],
            curframe: 0,
            active_lock: None,
            active_rcu: false,
            speculative: false,
            branches: 0,
            parent: None,
            first_insn_idx: 0,
            last_insn_idx: 0,
            jmp_history: Vec::new(),
        }
    }

    /// The executing frame.
    pub fn cur_frame(&self) -> &FuncState {
        &self.frames[self.curframe]
    }

    /// The executing frame, mutably.
    pub fn cur_frame_mut(&mut self) -> &mut FuncState {
        &mut self.frames[self.curframe]
    }

    /// Register of the executing frame.
    pub fn reg(&self, r: RegId) -> &RegState {
        self.cur_frame().reg(r)
    }

    /// Register of the executing frame, mutably.
    pub fn reg_mut(&mut self, r: RegId) -> &mut RegState {
        self.cur_frame_mut().reg_mut(r)
    }

    /// Whether another frame can be pushed.
    pub fn can_push_frame(&self) -> bool {
        self.frames.len() < MAX_CALL_FRAMES
    }

    /// Record a taken non-linear edge.
    pub fn push_jmp_history(&mut self, prev_idx: usize, idx: usize) {
        self.jmp_history.push(JmpHistoryEntry {
            idx: idx as u32,
            prev_idx: prev_idx as u32,
        });
    }

    /// Acquired references across all frames.
    pub fn refs(&self) -> &[crate::frame::RefEntry] {
        &self.cur_frame().refs
    }

    /// Drop the correlation id `id` from every register in every frame,
    /// invalidating registers that held the released reference.
    pub fn invalidate_ref(&mut self, ref_obj_id: u32) {
        for frame in &mut self.frames {
            for reg in frame.regs.iter_mut() {
                if reg.ref_obj_id == ref_obj_id {
                    let live = reg.live;
                    *reg = RegState::not_init();
                    reg.live = live;
                }
            }
            for (_, slot) in frame.stack.iter_mut() {
                if slot.is_spilled_reg() && slot.spilled.ref_obj_id == ref_obj_id {
                    slot.invalidate();
                }
            }
        }
    }

    /// Fork a deep copy for an alternative path.
    pub fn fork(&self) -> Self {
        self.clone()
    }
}

impl fmt::Display for VerifierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let frame = self.cur_frame();
        let regs = frame
            .regs
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_init())
            .map(|(i, r)| format!("R{i}={r}"))
            .join(" ");
        write!(f, "frame{}: {}", self.curframe, regs)?;
        let slots = frame
            .stack
            .iter()
            .map(|(_, slot)| slot.tags.iter().map(|t| t.glyph()).collect::<String>())
            .join("|");
        if !slots.is_empty() {
            write!(f, " stack: {slots}")?;
        }
        if self.speculative {
            f.write_str(" (spec)")?;
        }
        Ok(())
    }
}

/// A pending exploration pushed at a fork.
#[derive(Debug)]
pub struct BranchEntry {
    /// The forked state.
    pub state: VerifierState,
    /// Instruction to resume at.
    pub insn_idx: usize,
    /// Instruction the fork happened at.
    pub prev_insn_idx: Option<usize>,
    /// Instruction whose hardening forked this path, when speculative.
    pub spec_origin: Option<usize>,
}

/// Arena of checkpointed states with generational ids.
#[derive(Debug, Default)]
pub struct StateArena {
    slots: Vec<ArenaSlot>,
    free: Vec<u32>,
    live: usize,
    peak: usize,
}

#[derive(Debug)]
struct ArenaSlot {
    gen: u32,
    state: Option<VerifierState>,
}

impl StateArena {
    /// Empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live states.
    pub fn live(&self) -> usize {
        self.live
    }

    /// High-water mark of live states.
    pub fn peak(&self) -> usize {
        self.peak
    }

    /// Store a state, returning its handle.
    pub fn alloc(&mut self, state: VerifierState) -> StateId {
        self.live += 1;
        self.peak = self.peak.max(self.live);
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.state = Some(state);
                StateId {
                    index,
                    gen: slot.gen,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(ArenaSlot {
                    gen: 0,
                    state: Some(state),
                });
                StateId { index, gen: 0 }
            }
        }
    }

    /// Resolve a handle; `None` when the state was freed.
    pub fn get(&self, id: StateId) -> Option<&VerifierState> {
        let slot = self.slots.get(id.index as usize)?;
        (slot.gen == id.gen).then_some(slot.state.as_ref()).flatten()
    }

    /// Resolve a handle mutably.
    pub fn get_mut(&mut self, id: StateId) -> Option<&mut VerifierState> {
        let slot = self.slots.get_mut(id.index as usize)?;
        (slot.gen == id.gen).then_some(slot.state.as_mut()).flatten()
    }

    /// Free a state; its handle and any copies become stale.
    pub fn free(&mut self, id: StateId) {
        if let Some(slot) = self.slots.get_mut(id.index as usize) {
            if slot.gen == id.gen && slot.state.is_some() {
                slot.state = None;
                slot.gen = slot.gen.wrapping_add(1);
                self.free.push(id.index);
                self.live -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_generations() {
        let mut arena = StateArena::new();
        let a = arena.alloc(VerifierState::entry());
        assert!(arena.get(a).is_some());
        arena.free(a);
        assert!(arena.get(a).is_none());

        // The recycled slot gets a new generation; the stale handle stays
        // dead.
        let b = arena.alloc(VerifierState::entry());
        assert!(arena.get(a).is_none());
        assert!(arena.get(b).is_some());
        assert_eq!(arena.live(), 1);
        assert_eq!(arena.peak(), 1);
    }

    #[test]
    fn invalidate_ref_clears_copies() {
        let mut state = VerifierState::entry();
        let mut reg = RegState::unknown_scalar();
        reg.ref_obj_id = 9;
        *state.reg_mut(RegId::R1) = reg.clone();
        *state.reg_mut(RegId::R6) = reg;
        state.invalidate_ref(9);
        assert!(!state.reg(RegId::R1).is_init());
        assert!(!state.reg(RegId::R6).is_init());
    }

    #[test]
    fn fork_is_deep() {
        let mut state = VerifierState::entry();
        let fork = state.fork();
        state.reg_mut(RegId::R1).set_constant(1);
        assert!(!fork.reg(RegId::R1).is_init());
    }
}
