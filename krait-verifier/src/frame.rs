//! Per-call-frame analysis state.

use krait_asm::RegId;

use crate::reg::{
    PtrBase,
    PtrFlags,
    RegState,
};
use crate::stack::Stack;

/// An acquired resource that must be released before the program exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefEntry {
    /// Reference id, as carried in `ref_obj_id` of registers.
    pub id: u32,
    /// Instruction that acquired the reference, for diagnostics.
    pub insn_idx: usize,
    /// Frame number of the callback that acquired it, when the release must
    /// happen inside that callback; zero otherwise.
    pub callback_ref: u32,
}

/// Analysis state of one function frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncState {
    /// The eleven registers.
    pub regs: [RegState; RegId::COUNT],
    /// Tracked stack slots.
    pub stack: Stack,
    /// References acquired and not yet released, program-wide; kept on
    /// every frame so release checks see the full set.
    pub refs: Vec<RefEntry>,
    /// Call instruction in the caller; `None` for the entry frame.
    pub callsite: Option<usize>,
    /// Position in the frame stack.
    pub frameno: usize,
    /// Subprogram this frame executes.
    pub subprogno: usize,
    /// Whether this frame runs a helper-invoked callback.
    pub in_callback: bool,
    /// Whether the callback runs asynchronously after the program returns.
    pub in_async_callback: bool,
}

impl FuncState {
    /// A frame with every register uninitialized except the frame pointer.
    pub fn new(frameno: usize, subprogno: usize, callsite: Option<usize>) -> Self {
        let mut regs: [RegState; RegId::COUNT] = Default::default();
        regs[RegId::FP.index()] = RegState::pointer(
            PtrBase::Stack {
                frameno: frameno as u32,
            },
            PtrFlags::empty(),
        );
        Self {
            regs,
            stack: Stack::new(),
            refs: Vec::new(),
            callsite,
            frameno,
            subprogno,
            in_callback: false,
            in_async_callback: false,
        }
    }

    /// Register access by id.
    pub fn reg(&self, r: RegId) -> &RegState {
        &self.regs[r.index()]
    }

    /// Mutable register access by id.
    pub fn reg_mut(&mut self, r: RegId) -> &mut RegState {
        &mut self.regs[r.index()]
    }

    /// Record an acquired reference.
    pub fn acquire_ref(&mut self, id: u32, insn_idx: usize, callback_ref: u32) {
        self.refs.push(RefEntry {
            id,
            insn_idx,
            callback_ref,
        });
    }

    /// Drop a reference by id; false when it was never acquired.
    pub fn release_ref(&mut self, id: u32) -> bool {
        match self.refs.iter().position(|r| r.id == id) {
            Some(pos) => {
                self.refs.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Whether a reference id is currently held.
    pub fn holds_ref(&self, id: u32) -> bool {
        self.refs.iter().any(|r| r.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_frame_shape() {
        let frame = FuncState::new(0, 0, None);
        assert!(frame.reg(RegId::FP).is_ptr());
        assert!(!frame.reg(RegId::R1).is_init());
        assert_eq!(frame.stack.depth(), 0);
    }

    #[test]
    fn reference_bookkeeping() {
        let mut frame = FuncState::new(0, 0, None);
        frame.acquire_ref(7, 3, 0);
        assert!(frame.holds_ref(7));
        assert!(frame.release_ref(7));
        assert!(!frame.release_ref(7));
    }
}
