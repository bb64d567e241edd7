//! Post-verification instruction rewriting.
//!
//! Everything the analysis learned per instruction lives in [`InsnAux`],
//! indexed in lockstep with the instruction stream. The patcher splices
//! replacement sequences while keeping that index, every relative jump and
//! call, subprogram boundaries, and line-info offsets consistent. Only
//! rewrites that affect verified semantics happen here: dead-code
//! neutralization and the bounds-misprediction masking; zero-extension
//! marks are recorded for the code generator but not expanded.

use krait_asm::{
    AluOp,
    Class,
    Instruction,
    PseudoCall,
    PseudoLd,
    SrcKind,
    op,
};

use crate::cfg::SubprogInfo;
use crate::error::{
    Bug,
    BugVariant,
    Reject,
    VResult,
    VerifierError,
};
use crate::map::MapId;
use crate::reg::PtrBase;

/// Map-object knowledge at a call site, for downstream inlining decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MapPtrState {
    /// No map argument seen here yet.
    #[default]
    Unseen,
    /// Every path passes this map.
    Known(MapId),
    /// Different paths pass different maps.
    Poisoned,
}

/// Constant-key knowledge at a lookup site.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MapKeyState {
    /// No key argument seen here yet.
    #[default]
    Unseen,
    /// Every path passes this constant key.
    Known(u64),
    /// The key varies.
    Poisoned,
}

/// Masking parameters of a sanitized pointer-arithmetic site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AluSanitize {
    /// Largest in-bounds magnitude of the variable offset.
    pub limit: u32,
    /// Whether the offset moves toward lower addresses.
    pub neg: bool,
}

/// Per-instruction facts accumulated during analysis.
#[derive(Debug, Clone, Default)]
pub struct InsnAux {
    /// The instruction was simulated on at least one path.
    pub seen: bool,
    /// A 32-bit write whose upper-half zeroing the code generator must
    /// preserve.
    pub zext_dst: bool,
    /// The explored-state cache is consulted here.
    pub prune_point: bool,
    /// A jump lands here.
    pub jmp_point: bool,
    /// Checkpoints are forced here despite loop throttling.
    pub force_checkpoint: bool,
    /// This is an iterator-advance call.
    pub is_iter_next: bool,
    /// Pointer kind of the memory access, uniform across all paths.
    pub ptr_base: Option<PtrBase>,
    /// The run is unprivileged; inlining rewrites must stay conservative.
    pub unpriv: bool,
    /// Map-object knowledge for this call site.
    pub map_ptr_state: MapPtrState,
    /// Constant-key knowledge for this lookup site.
    pub map_key_state: MapKeyState,
    /// Masking parameters when this pointer arithmetic needs hardening.
    pub alu_state: Option<AluSanitize>,
    /// A pointer spill that needs a store barrier against speculative
    /// bypass.
    pub sanitize_stack_spill: bool,
    /// Resolved callee of a subprogram call or function-address load.
    pub call_subprog: Option<usize>,
    /// Load folded to a constant from frozen read-only map data.
    pub const_fold: Option<u64>,
}

impl InsnAux {
    /// Merge the observed map argument into the call-site knowledge.
    pub fn observe_map_ptr(&mut self, map: MapId) {
        self.map_ptr_state = match self.map_ptr_state {
            MapPtrState::Unseen => MapPtrState::Known(map),
            MapPtrState::Known(prev) if prev == map => MapPtrState::Known(map),
            _ => MapPtrState::Poisoned,
        };
    }

    /// Merge the observed key constant into the lookup-site knowledge.
    pub fn observe_map_key(&mut self, key: Option<u64>) {
        self.map_key_state = match (self.map_key_state, key) {
            (MapKeyState::Unseen, Some(k)) => MapKeyState::Known(k),
            (MapKeyState::Known(prev), Some(k)) if prev == k => MapKeyState::Known(k),
            _ => MapKeyState::Poisoned,
        };
    }
}

/// One source-line attribution, kept monotone across patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineInfo {
    /// Instruction the line starts at.
    pub insn_off: usize,
    /// Opaque line reference for the loader.
    pub line: u32,
}

/// Register field reserved for rewrite scratch. The wire format has sixteen
/// register encodings; programs may only name eleven, leaving this one for
/// post-verification sequences.
const SCRATCH_REG: u8 = 11;

/// The instruction stream and its per-instruction facts, spliced together.
#[derive(Debug)]
pub struct Patcher {
    insns: Vec<Instruction>,
    aux: Vec<InsnAux>,
    subprogs: Vec<SubprogInfo>,
    line_info: Vec<LineInfo>,
}

impl Patcher {
    /// Take ownership of the verified stream.
    pub fn new(
        insns: Vec<Instruction>,
        aux: Vec<InsnAux>,
        subprogs: Vec<SubprogInfo>,
        line_info: Vec<LineInfo>,
    ) -> Self {
        debug_assert_eq!(insns.len(), aux.len());
        Self {
            insns,
            aux,
            subprogs,
            line_info,
        }
    }

    /// Final instruction stream.
    pub fn insns(&self) -> &[Instruction] {
        &self.insns
    }

    /// Final aux table.
    pub fn aux(&self) -> &[InsnAux] {
        &self.aux
    }

    /// Final subprogram table.
    pub fn subprogs(&self) -> &[SubprogInfo] {
        &self.subprogs
    }

    /// Final line table.
    pub fn line_info(&self) -> &[LineInfo] {
        &self.line_info
    }

    /// Give up all tables.
    pub fn into_parts(self) -> (Vec<Instruction>, Vec<InsnAux>, Vec<SubprogInfo>) {
        (self.insns, self.aux, self.subprogs)
    }

    /// Replace the instruction at `pos` with `replacement`, shifting
    /// everything after it and fixing every relative reference that crosses
    /// the splice.
    pub fn patch(&mut self, pos: usize, replacement: &[Instruction]) -> VResult<()> {
        if pos >= self.insns.len() || replacement.is_empty() {
            return Err(Bug::new(BugVariant::PatchOutOfRange, pos).into());
        }
        let delta = replacement.len() - 1;
        if delta == 0 {
            self.insns[pos] = replacement[0];
            return Ok(());
        }

        self.insns.splice(pos..=pos, replacement.iter().copied());

        // The first patched word inherits the original's aux; the rest get
        // fresh entries already marked seen.
        let mut fresh = InsnAux {
            seen: true,
            ..InsnAux::default()
        };
        fresh.unpriv = self.aux[pos].unpriv;
        self.aux
            .splice(pos + 1..pos + 1, core::iter::repeat(fresh).take(delta));

        self.adjust_relative(pos, delta)?;
        for subprog in &mut self.subprogs {
            if subprog.start > pos {
                subprog.start += delta;
            }
            if subprog.end > pos {
                subprog.end += delta;
            }
        }
        for line in &mut self.line_info {
            if line.insn_off > pos {
                line.insn_off += delta;
            }
        }
        Ok(())
    }

    /// Fix jump offsets and relative call/function immediates spanning the
    /// splice at `pos` of width `delta`.
    fn adjust_relative(&mut self, pos: usize, delta: usize) -> VResult<()> {
        let delta_i = i64::try_from(delta)
            .map_err(|_| VerifierError::from(Bug::new(BugVariant::PatchOutOfRange, pos)))?;
        let len = self.insns.len();
        let mut idx = 0;
        while idx < len {
            let insn = self.insns[idx];
            let width = if insn.is_ld_imm64() { 2 } else { 1 };
            // Skip words inside the fresh patch; their offsets are final.
            if (pos..pos + delta + 1).contains(&idx) {
                idx += width;
                continue;
            }
            if insn.class().is_jmp() {
                if let Some(op) = insn.jmp_op() {
                    let uses_off =
                        !matches!(op, krait_asm::JmpOp::Exit | krait_asm::JmpOp::Call);
                    if uses_off {
                        // `idx` is a new-stream position; the stored offset
                        // is still in old coordinates.
                        let target = idx as i64 + 1 + insn.off() as i64;
                        let crosses = if idx < pos {
                            target > pos as i64
                        } else {
                            target - delta_i <= pos as i64
                        };
                        if crosses {
                            let new_off = if idx < pos {
                                insn.off() as i64 + delta_i
                            } else {
                                insn.off() as i64 - delta_i
                            };
                            let new_off = i16::try_from(new_off).map_err(|_| {
                                VerifierError::new(
                                    Reject::JumpOutOfRange,
                                    idx,
                                    "patched jump displacement overflows",
                                )
                            })?;
                            self.insns[idx] = Instruction::new(
                                insn.opcode(),
                                insn.dst_field(),
                                insn.src_field(),
                                new_off,
                                insn.imm(),
                            );
                        }
                    }
                    if matches!(op, krait_asm::JmpOp::Call)
                        && insn.pseudo_call() == Some(PseudoCall::Subprog)
                    {
                        self.adjust_rel_imm(idx, pos, delta_i)?;
                    }
                }
            } else if insn.pseudo_ld() == Some(PseudoLd::Func) {
                self.adjust_rel_imm(idx, pos, delta_i)?;
            }
            idx += width;
        }
        Ok(())
    }

    fn adjust_rel_imm(&mut self, idx: usize, pos: usize, delta_i: i64) -> VResult<()> {
        let insn = self.insns[idx];
        let target = idx as i64 + 1 + insn.imm() as i64;
        let crosses = if idx < pos {
            target > pos as i64
        } else {
            target - delta_i <= pos as i64
        };
        if !crosses {
            return Ok(());
        }
        let new_imm = if idx < pos {
            insn.imm() as i64 + delta_i
        } else {
            insn.imm() as i64 - delta_i
        };
        let new_imm = i32::try_from(new_imm).map_err(|_| {
            VerifierError::new(Reject::JumpOutOfRange, idx, "patched call displacement overflows")
        })?;
        self.insns[idx] = Instruction::new(
            insn.opcode(),
            insn.dst_field(),
            insn.src_field(),
            insn.off(),
            new_imm,
        );
        Ok(())
    }

    /// Neutralize instructions no path ever reached. Unreachable code was
    /// rejected structurally, so these are only conditionally-dead bodies;
    /// they are replaced by self-contained jumps that can never trap.
    pub fn neutralize_dead_code(&mut self) {
        let mut idx = 0;
        while idx < self.insns.len() {
            let width = if self.insns[idx].is_ld_imm64() { 2 } else { 1 };
            if !self.aux[idx].seen {
                for w in 0..width {
                    self.insns[idx + w] = op::ja(0);
                    self.aux[idx + w].seen = true;
                }
            }
            idx += width;
        }
    }

    /// Expand every sanitized pointer-arithmetic site into its masking
    /// sequence, guaranteeing in-bounds offsets even under branch
    /// misprediction.
    pub fn apply_sanitation(&mut self) -> VResult<()> {
        let mut idx = 0;
        while idx < self.insns.len() {
            let width = if self.insns[idx].is_ld_imm64() { 2 } else { 1 };
            if let Some(san) = self.aux[idx].alu_state {
                let seq = self.masking_sequence(idx, san)?;
                self.patch(idx, &seq)?;
                idx += seq.len();
                continue;
            }
            idx += width;
        }
        Ok(())
    }

    /// `dst = ptr ± off_reg` becomes, via the scratch register `ax`:
    /// `ax = limit; ax -= off_reg; ax |= off_reg; ax = -ax; ax s>>= 63;
    /// ax &= off_reg; dst ± ax` — off is forced to zero whenever it would
    /// exceed the limit, with no data-dependent branch.
    fn masking_sequence(&self, idx: usize, san: AluSanitize) -> VResult<Vec<Instruction>> {
        let insn = self.insns[idx];
        let alu_op = insn
            .alu_op()
            .filter(|op| matches!(op, AluOp::Add | AluOp::Sub))
            .ok_or_else(|| VerifierError::from(Bug::new(BugVariant::PatchOutOfRange, idx)))?;
        if insn.src_kind() != SrcKind::Reg || insn.class() != Class::Alu64 {
            return Err(Bug::new(BugVariant::PatchOutOfRange, idx).into());
        }
        let off_reg = insn.src_field();
        let dst = insn.dst_field();
        let alu64 = |op: AluOp, d: u8, s: u8| {
            Instruction::new(Class::Alu64 as u8 | op as u8 | SrcKind::Reg as u8, d, s, 0, 0)
        };
        let alu64_imm = |op: AluOp, d: u8, imm: i32| {
            Instruction::new(Class::Alu64 as u8 | op as u8 | SrcKind::Imm as u8, d, 0, 0, imm)
        };
        let final_op = if san.neg {
            match alu_op {
                AluOp::Add => AluOp::Sub,
                _ => AluOp::Add,
            }
        } else {
            alu_op
        };
        Ok(vec![
            alu64_imm(AluOp::Mov, SCRATCH_REG, san.limit as i32),
            alu64(AluOp::Sub, SCRATCH_REG, off_reg),
            alu64(AluOp::Or, SCRATCH_REG, off_reg),
            alu64_imm(AluOp::Neg, SCRATCH_REG, 0),
            alu64_imm(AluOp::Arsh, SCRATCH_REG, 63),
            alu64(AluOp::And, SCRATCH_REG, off_reg),
            alu64(final_op, dst, SCRATCH_REG),
        ])
    }
}

#[cfg(test)]
mod tests {
    use krait_asm::{
        JmpOp,
        MemSize,
    };

    use super::*;

    fn plain_aux(n: usize) -> Vec<InsnAux> {
        vec![InsnAux::default(); n]
    }

    fn one_subprog(n: usize) -> Vec<SubprogInfo> {
        vec![SubprogInfo {
            start: 0,
            end: n,
            stack_depth: 0,
        }]
    }

    #[test]
    fn patch_adjusts_forward_jump_over_site() {
        let insns = vec![
            op::jmp_imm(JmpOp::Jeq, 1u8, 0, 2), // to insn 3
            op::mov64_imm(0u8, 1),
            op::mov64_imm(0u8, 2),
            op::exit(),
        ];
        let n = insns.len();
        let mut patcher = Patcher::new(insns, plain_aux(n), one_subprog(n), vec![]);
        patcher
            .patch(1, &[op::mov64_imm(0u8, 1), op::mov64_imm(5u8, 0)])
            .unwrap();
        // jump must now skip one more word
        assert_eq!(patcher.insns()[0].off(), 3);
        assert_eq!(patcher.insns().len(), 5);
        assert!(patcher.insns()[4].is_exit());
    }

    #[test]
    fn patch_adjusts_backward_jump_and_subprogs() {
        let insns = vec![
            op::mov64_imm(0u8, 0),
            op::exit(),
            // subprog 1
            op::mov64_imm(0u8, 1),
            op::jmp_imm(JmpOp::Jeq, 0u8, 0, -2), // within subprog? backward over patch
            op::exit(),
        ];
        let mut subprogs = one_subprog(5);
        subprogs[0].end = 2;
        subprogs.push(SubprogInfo {
            start: 2,
            end: 5,
            stack_depth: 0,
        });
        let mut patcher = Patcher::new(insns, plain_aux(5), subprogs, vec![]);
        patcher
            .patch(0, &[op::mov64_imm(0u8, 0), op::mov64_imm(5u8, 0)])
            .unwrap();
        assert_eq!(patcher.subprogs()[1].start, 3);
        // insn 3 became insn 4; its backward target (insn 2, now 3) is on
        // the same side of the patch, so the offset is unchanged.
        assert_eq!(patcher.insns()[4].off(), -2);
    }

    #[test]
    fn patch_adjusts_relative_call() {
        let insns = vec![
            op::call_rel(2), // to insn 3
            op::mov64_imm(0u8, 0),
            op::exit(),
            op::exit(),
        ];
        let mut subprogs = one_subprog(4);
        subprogs[0].end = 3;
        subprogs.push(SubprogInfo {
            start: 3,
            end: 4,
            stack_depth: 0,
        });
        let mut patcher = Patcher::new(insns, plain_aux(4), subprogs, vec![]);
        patcher
            .patch(1, &[op::mov64_imm(0u8, 0), op::mov64_imm(5u8, 0)])
            .unwrap();
        assert_eq!(patcher.insns()[0].imm(), 3);
    }

    #[test]
    fn line_info_stays_monotone() {
        let insns = vec![op::mov64_imm(0u8, 0), op::mov64_imm(1u8, 0), op::exit()];
        let lines = vec![
            LineInfo {
                insn_off: 0,
                line: 10,
            },
            LineInfo {
                insn_off: 2,
                line: 11,
            },
        ];
        let mut patcher = Patcher::new(insns, plain_aux(3), one_subprog(3), lines);
        patcher
            .patch(1, &[op::mov64_imm(1u8, 0), op::mov64_imm(2u8, 0)])
            .unwrap();
        let offs: Vec<_> = patcher.line_info().iter().map(|l| l.insn_off).collect();
        assert_eq!(offs, vec![0, 3]);
        assert!(offs.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn dead_code_becomes_self_jumps() {
        let insns = vec![
            op::mov64_imm(0u8, 0),
            op::mov64_imm(0u8, 1), // never seen
            op::exit(),
        ];
        let mut aux = plain_aux(3);
        aux[0].seen = true;
        aux[2].seen = true;
        let mut patcher = Patcher::new(insns, aux, one_subprog(3), vec![]);
        patcher.neutralize_dead_code();
        assert_eq!(patcher.insns()[1], op::ja(0));
    }

    #[test]
    fn sanitation_expands_masking() {
        let insns = vec![
            op::mov64_imm(2u8, 4),
            op::add64_reg(1u8, 2u8),
            op::ldx(MemSize::Word, 0u8, 1u8, 0),
            op::exit(),
        ];
        let mut aux = plain_aux(4);
        for a in aux.iter_mut() {
            a.seen = true;
        }
        aux[1].alu_state = Some(AluSanitize {
            limit: 16,
            neg: false,
        });
        let mut patcher = Patcher::new(insns, aux, one_subprog(4), vec![]);
        patcher.apply_sanitation().unwrap();
        // one insn became seven
        assert_eq!(patcher.insns().len(), 10);
        assert!(patcher.insns()[9].is_exit());
        // the scratch register only appears in the patched range
        assert_eq!(patcher.insns()[1].dst_field(), SCRATCH_REG);
    }
}
