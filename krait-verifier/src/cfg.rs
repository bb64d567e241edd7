//! First-pass control-flow analysis.
//!
//! A depth-first walk over the instruction graph validates every jump
//! target, discovers subprogram boundaries, rejects unreachable code and
//! loops formed by ordinary jumps, and marks the instructions where the
//! abstract interpreter will consult or create checkpoints.
//!
//! Back-edges are rejected outright unless the jumped-over region contains
//! an iterator-advance call; iterator loops are the one sanctioned looping
//! construct, and their termination proof happens later via state
//! equivalence at the advance site.

use krait_asm::{
    Class,
    Instruction,
    JmpOp,
    PseudoCall,
    PseudoLd,
};

use crate::consts::MAX_PROG_INSNS;
use crate::error::{
    Reject,
    VResult,
    VerifierError,
};

/// Boundaries and accumulated facts of one subprogram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubprogInfo {
    /// First instruction.
    pub start: usize,
    /// One past the last instruction.
    pub end: usize,
    /// High-water stack depth, filled in during abstract interpretation.
    pub stack_depth: u32,
}

/// Checkpoint-related marks of one instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CfgMarks {
    /// The interpreter consults the explored-state cache here.
    pub prune_point: bool,
    /// A jump lands here; history entries are recorded at this granularity.
    pub jmp_point: bool,
    /// A checkpoint is created here even inside the loop-throttling window.
    pub force_checkpoint: bool,
}

/// Result of the first pass.
#[derive(Debug)]
pub struct CfgInfo {
    /// Subprograms ordered by start offset; entry 0 is the main program.
    pub subprogs: Vec<SubprogInfo>,
    /// Per-instruction marks.
    pub marks: Vec<CfgMarks>,
}

impl CfgInfo {
    /// Subprogram containing `insn_idx`.
    pub fn subprog_of(&self, insn_idx: usize) -> usize {
        match self
            .subprogs
            .binary_search_by_key(&insn_idx, |s| s.start)
        {
            Ok(i) => i,
            Err(i) => i - 1,
        }
    }

    /// Subprogram starting exactly at `insn_idx`, if any.
    pub fn subprog_starting_at(&self, insn_idx: usize) -> Option<usize> {
        self.subprogs
            .binary_search_by_key(&insn_idx, |s| s.start)
            .ok()
    }
}

const DISCOVERED: u8 = 1;
const EXPLORED: u8 = 2;

/// Build the control-flow facts for `insns`.
///
/// `is_iter_next[i]` flags instruction `i` as an iterator-advance call;
/// loops are only tolerated around those.
pub fn build_cfg(insns: &[Instruction], is_iter_next: &[bool]) -> VResult<CfgInfo> {
    if insns.is_empty() {
        return Err(VerifierError::new(
            Reject::OversizedProgram,
            0,
            "program is empty",
        ));
    }
    if insns.len() > MAX_PROG_INSNS {
        return Err(VerifierError::new(
            Reject::OversizedProgram,
            0,
            format!("program of {} insns exceeds limit", insns.len()),
        ));
    }

    let mut cfg = Walker::new(insns, is_iter_next);
    cfg.find_subprogs()?;
    cfg.walk()?;
    cfg.finish()
}

struct Walker<'a> {
    insns: &'a [Instruction],
    is_iter_next: &'a [bool],
    insn_state: Vec<u8>,
    marks: Vec<CfgMarks>,
    subprog_starts: Vec<usize>,
}

/// Outgoing edges of one instruction: up to a fall-through, a branch
/// target, and a callee entry.
#[derive(Default, Clone, Copy)]
struct Edges {
    targets: [Option<usize>; 3],
}

impl<'a> Walker<'a> {
    fn new(insns: &'a [Instruction], is_iter_next: &'a [bool]) -> Self {
        Self {
            insns,
            is_iter_next,
            insn_state: vec![0; insns.len()],
            marks: vec![CfgMarks::default(); insns.len()],
            subprog_starts: vec![0],
        }
    }

    fn err(&self, reject: Reject, idx: usize, msg: impl Into<String>) -> VerifierError {
        VerifierError::new(reject, idx, msg)
    }

    /// Whether `idx` is the second word of an immediate-load pair.
    fn is_ld_imm64_cont(&self, idx: usize) -> bool {
        idx > 0 && self.insns[idx - 1].is_ld_imm64()
    }

    fn check_target(&self, from: usize, target: i64) -> VResult<usize> {
        if target < 0 || target as usize >= self.insns.len() {
            return Err(self.err(
                Reject::JumpOutOfRange,
                from,
                format!("jump out of range from insn {from} to {target}"),
            ));
        }
        let target = target as usize;
        if self.is_ld_imm64_cont(target) {
            return Err(self.err(
                Reject::JumpOutOfRange,
                from,
                format!("jump into the middle of a 64-bit immediate load at {target}"),
            ));
        }
        Ok(target)
    }

    /// Record every subprogram entry reachable through calls and function
    /// addresses.
    fn find_subprogs(&mut self) -> VResult<()> {
        let mut idx = 0;
        while idx < self.insns.len() {
            let insn = self.insns[idx];
            if insn.pseudo_call() == Some(PseudoCall::Subprog)
                || insn.pseudo_ld() == Some(PseudoLd::Func)
            {
                let target = idx as i64 + 1 + insn.imm() as i64;
                let target = self.check_target(idx, target)?;
                if target == 0 {
                    return Err(self.err(
                        Reject::JumpOutOfRange,
                        idx,
                        "the entry point is not callable",
                    ));
                }
                if !self.subprog_starts.contains(&target) {
                    self.subprog_starts.push(target);
                }
            }
            idx += if insn.is_ld_imm64() { 2 } else { 1 };
        }
        self.subprog_starts.sort_unstable();
        Ok(())
    }

    /// Subprogram call edges never cross a subprogram boundary implicitly:
    /// straight-line flow running past a subprogram start is malformed.
    fn check_boundary(&self, from: usize, to: usize) -> VResult<()> {
        if to != from + 1 && to != from + 2 {
            return Ok(());
        }
        if self.subprog_starts.binary_search(&to).is_ok() {
            return Err(self.err(
                Reject::FallOffEnd,
                from,
                format!("control flow falls through into subprogram at {to}"),
            ));
        }
        Ok(())
    }

    fn edges(&mut self, t: usize) -> VResult<Edges> {
        let insn = self.insns[t];
        let mut edges = Edges::default();
        let mut n = 0;
        let mut push = |target: usize| {
            edges.targets[n] = Some(target);
            n += 1;
        };

        let fallthrough = |w: &Self, width: usize| -> VResult<usize> {
            let next = t + width;
            if next >= w.insns.len() {
                return Err(w.err(
                    Reject::FallOffEnd,
                    t,
                    "control flow falls off the end of the program",
                ));
            }
            Ok(next)
        };

        match insn.class() {
            Class::Jmp | Class::Jmp32 => {
                let op = insn.jmp_op().ok_or_else(|| {
                    self.err(Reject::UnknownOpcode, t, format!("invalid opcode {:#04x}", insn.opcode()))
                })?;
                match op {
                    JmpOp::Exit => {}
                    JmpOp::Ja => {
                        if insn.class() == Class::Jmp32 {
                            return Err(self.err(
                                Reject::UnknownOpcode,
                                t,
                                "32-bit unconditional jump is not defined",
                            ));
                        }
                        let target =
                            self.check_target(t, t as i64 + 1 + insn.off() as i64)?;
                        self.marks[target].prune_point = true;
                        self.marks[target].jmp_point = true;
                        push(target);
                    }
                    JmpOp::Call => {
                        if self.is_iter_next.get(t).copied().unwrap_or(false) {
                            self.marks[t].prune_point = true;
                            self.marks[t].force_checkpoint = true;
                        }
                        let next = fallthrough(self, 1)?;
                        self.check_boundary(t, next)?;
                        push(next);
                        if insn.pseudo_call() == Some(PseudoCall::Subprog) {
                            self.marks[t].prune_point = true;
                            let callee =
                                self.check_target(t, t as i64 + 1 + insn.imm() as i64)?;
                            self.marks[callee].jmp_point = true;
                            push(callee);
                        }
                    }
                    _ => {
                        // Conditional: both successors.
                        self.marks[t].prune_point = true;
                        let target =
                            self.check_target(t, t as i64 + 1 + insn.off() as i64)?;
                        self.marks[target].jmp_point = true;
                        let next = fallthrough(self, 1)?;
                        self.check_boundary(t, next)?;
                        push(next);
                        push(target);
                    }
                }
            }
            Class::Ld if insn.is_ld_imm64() => {
                if insn.pseudo_ld() == Some(PseudoLd::Func) {
                    let callee = self.check_target(t, t as i64 + 1 + insn.imm() as i64)?;
                    self.marks[t].prune_point = true;
                    push(callee);
                }
                let next = fallthrough(self, 2)?;
                self.check_boundary(t, next)?;
                push(next);
            }
            _ => {
                let next = fallthrough(self, 1)?;
                self.check_boundary(t, next)?;
                push(next);
            }
        }
        Ok(edges)
    }

    /// Whether the natural loop region `[head, tail]` contains an
    /// iterator-advance call, making the back-edge tolerable.
    fn loop_has_iter_next(&self, head: usize, tail: usize) -> bool {
        (head..=tail).any(|i| self.is_iter_next.get(i).copied().unwrap_or(false))
    }

    fn walk(&mut self) -> VResult<()> {
        let mut stack: Vec<(usize, usize)> = vec![(0, 0)];
        self.insn_state[0] = DISCOVERED;

        while let Some(&(t, edge_idx)) = stack.last() {
            let edges = self.edges(t)?;
            match edges.targets.get(edge_idx).copied().flatten() {
                None => {
                    self.insn_state[t] |= EXPLORED;
                    stack.pop();
                }
                Some(w) => {
                    stack.last_mut().expect("stack is nonempty").1 += 1;
                    let state = self.insn_state[w];
                    if state & DISCOVERED == 0 {
                        self.insn_state[w] = DISCOVERED;
                        stack.push((w, 0));
                    } else if state & EXPLORED == 0 {
                        // On the DFS stack: a back-edge.
                        if w <= t && self.loop_has_iter_next(w, t) {
                            // Iterator loop; convergence is proven later.
                        } else {
                            return Err(self.err(
                                Reject::BackEdge,
                                t,
                                format!("back-edge from insn {t} to {w}"),
                            ));
                        }
                    }
                }
            }
        }

        // Skipped immediate-halves aside, everything must have been visited.
        for idx in 0..self.insns.len() {
            if self.is_ld_imm64_cont(idx) {
                continue;
            }
            if self.insn_state[idx] & EXPLORED == 0 {
                return Err(self.err(
                    Reject::UnreachableInsn,
                    idx,
                    format!("unreachable insn {idx}"),
                ));
            }
        }
        Ok(())
    }

    fn finish(self) -> VResult<CfgInfo> {
        let mut subprogs: Vec<SubprogInfo> = Vec::with_capacity(self.subprog_starts.len());
        for (i, &start) in self.subprog_starts.iter().enumerate() {
            let end = self
                .subprog_starts
                .get(i + 1)
                .copied()
                .unwrap_or(self.insns.len());
            subprogs.push(SubprogInfo {
                start,
                end,
                stack_depth: 0,
            });
        }
        Ok(CfgInfo {
            subprogs,
            marks: self.marks,
        })
    }
}

#[cfg(test)]
mod tests {
    use krait_asm::op;

    use super::*;

    fn cfg(insns: &[Instruction]) -> VResult<CfgInfo> {
        let iter_marks = vec![false; insns.len()];
        build_cfg(insns, &iter_marks)
    }

    #[test]
    fn straight_line() {
        let insns = [op::mov64_imm(0u8, 0), op::exit()];
        let info = cfg(&insns).unwrap();
        assert_eq!(info.subprogs.len(), 1);
        assert_eq!(info.subprogs[0].end, 2);
    }

    #[test]
    fn jump_out_of_range() {
        let insns = [
            op::mov64_imm(1u8, 1),
            op::jmp_imm(krait_asm::JmpOp::Jgt, 1u8, 0, 1000),
            op::exit(),
        ];
        let err = cfg(&insns).unwrap_err();
        assert_eq!(err.reject, Reject::JumpOutOfRange);
        assert_eq!(err.insn_idx, 1);
    }

    #[test]
    fn back_edge_rejected() {
        let insns = [
            op::mov64_imm(0u8, 0),
            op::add64_imm(0u8, 1),
            op::jmp_imm(krait_asm::JmpOp::Jlt, 0u8, 10, -2),
            op::exit(),
        ];
        let err = cfg(&insns).unwrap_err();
        assert_eq!(err.reject, Reject::BackEdge);
    }

    #[test]
    fn back_edge_with_iter_next_tolerated() {
        let insns = [
            op::mov64_imm(0u8, 0),
            op::call_kfunc(1),
            op::jmp_imm(krait_asm::JmpOp::Jne, 0u8, 0, -2),
            op::exit(),
        ];
        let mut iter_marks = vec![false; insns.len()];
        iter_marks[1] = true;
        let info = build_cfg(&insns, &iter_marks).unwrap();
        assert!(info.marks[1].force_checkpoint);
    }

    #[test]
    fn unreachable_rejected() {
        let insns = [
            op::ja(1),
            op::mov64_imm(0u8, 0), // skipped forever
            op::exit(),
        ];
        let err = cfg(&insns).unwrap_err();
        assert_eq!(err.reject, Reject::UnreachableInsn);
        assert_eq!(err.insn_idx, 1);
    }

    #[test]
    fn fall_off_end_rejected() {
        let insns = [op::mov64_imm(0u8, 0)];
        let err = cfg(&insns).unwrap_err();
        assert_eq!(err.reject, Reject::FallOffEnd);
    }

    #[test]
    fn jump_into_ld_imm64_rejected() {
        let [lo, hi] = op::ld_imm64(1u8, 77);
        let insns = [op::ja(2), lo, hi, op::exit()];
        let err = cfg(&insns).unwrap_err();
        assert_eq!(err.reject, Reject::JumpOutOfRange);
    }

    #[test]
    fn subprog_discovery() {
        let insns = [
            op::call_rel(2), // calls insn 3
            op::mov64_imm(0u8, 0),
            op::exit(),
            op::mov64_imm(0u8, 7), // subprog
            op::exit(),
        ];
        let info = cfg(&insns).unwrap();
        assert_eq!(info.subprogs.len(), 2);
        assert_eq!(info.subprogs[1].start, 3);
        assert_eq!(info.subprog_of(4), 1);
        assert_eq!(info.subprog_of(1), 0);
        assert_eq!(info.subprog_starting_at(3), Some(1));
    }

    #[test]
    fn fallthrough_into_subprog_rejected() {
        let insns = [
            op::call_rel(1), // calls insn 2
            op::mov64_imm(0u8, 0),
            op::mov64_imm(0u8, 7), // subprog start, reached by fallthrough
            op::exit(),
        ];
        let err = cfg(&insns).unwrap_err();
        assert_eq!(err.reject, Reject::FallOffEnd);
    }

    #[test]
    fn marks_on_branches() {
        let insns = [
            op::mov64_imm(0u8, 1),
            op::jmp_imm(krait_asm::JmpOp::Jeq, 0u8, 0, 1),
            op::mov64_imm(0u8, 2),
            op::exit(),
        ];
        let info = cfg(&insns).unwrap();
        assert!(info.marks[1].prune_point);
        assert!(info.marks[3].jmp_point);
    }
}
