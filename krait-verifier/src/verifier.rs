//! The abstract interpreter driving verification.
//!
//! One [`Verifier`] instance analyzes one program: it walks the instruction
//! graph from the entry point, forking at conditional branches onto a
//! worklist, consulting the explored-state cache at prune points, and
//! checkpointing the current path so later forks can be subsumed. All
//! per-instruction typing rules live in the submodules; this file owns the
//! loop, the state lifecycle, and liveness bookkeeping.

use hashbrown::HashMap;
use krait_asm::{
    Class,
    Instruction,
    JmpOp,
    Mode,
    RegId,
};

use crate::cfg::{
    self,
    CfgInfo,
};
use crate::consts::{
    CHECKPOINT_EVICT_RATIO,
    CHECKPOINT_INSN_GAP,
    CHECKPOINT_JMP_GAP,
    MAX_CHECKPOINTS_PER_INSN,
};
use crate::ctx::{
    ProgOps,
    ProgramKind,
    VerifierConfig,
};
use crate::error::{
    Bug,
    BugVariant,
    Reject,
    VResult,
    VerifierError,
};
use crate::frame::FuncState;
use crate::helper::HelperId;
use crate::kfunc::KfuncId;
use crate::ktype::KtypeDb;
use crate::log::{
    vlog,
    vtrace,
    VerifierLog,
};
use crate::map::MapDef;
use crate::patch::{
    InsnAux,
    LineInfo,
    Patcher,
};
use crate::reg::{
    Live,
    PtrBase,
    PtrFlags,
    RegState,
};
use crate::state::{
    BranchEntry,
    StateArena,
    StateId,
    VerifierState,
};

mod alu;
mod branch;
mod call;
mod equiv;
mod kfunc_call;
mod ld;
mod mem;
mod precision;

/// Everything the caller provides for one verification run.
pub struct VerifierInput<'a> {
    /// The program.
    pub insns: Vec<Instruction>,
    /// Program kind selecting the context vtable.
    pub kind: ProgramKind,
    /// Maps addressable by the program; the index is the file descriptor
    /// namespace instruction immediates resolve through.
    pub maps: Vec<MapDef>,
    /// Kernel type database.
    pub ktypes: &'a KtypeDb,
    /// Limits and switches.
    pub config: VerifierConfig,
    /// Source-line attributions, if the loader has them.
    pub line_info: Vec<LineInfo>,
}

/// Counters reported after a successful run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifierStats {
    /// Simulated instructions.
    pub insn_processed: usize,
    /// States checkpointed over the whole run.
    pub total_states: usize,
    /// Peak simultaneously-live checkpoints.
    pub peak_states: usize,
    /// Prune-cache hits.
    pub prune_hits: usize,
    /// Prune-cache misses.
    pub prune_misses: usize,
}

/// Successful verification result.
#[derive(Debug)]
pub struct VerifiedProgram {
    /// The possibly rewritten instruction stream.
    pub insns: Vec<Instruction>,
    /// Indices into the input map table, in order of first use.
    pub used_maps: Vec<usize>,
    /// Per-instruction facts aligned with `insns`.
    pub aux: Vec<InsnAux>,
    /// Subprogram boundaries (post-rewrite) with their stack high-water
    /// marks.
    pub subprogs: Vec<crate::cfg::SubprogInfo>,
    /// Counters.
    pub stats: VerifierStats,
}

/// Verify `input`, returning the rewritten program or the first rejection.
pub fn verify(input: VerifierInput<'_>) -> Result<VerifiedProgram, VerifierError> {
    verify_full(input).0
}

/// Like [`verify`], additionally handing back the rendered log; on failure
/// its last line is the rejection diagnostic.
pub fn verify_full(
    input: VerifierInput<'_>,
) -> (Result<VerifiedProgram, VerifierError>, String) {
    let mut verifier = match Verifier::new(input) {
        Ok(v) => v,
        Err(err) => return (Err(err), String::new()),
    };
    let result = verifier.run();
    verifier.finish(result)
}

#[derive(Debug)]
pub(crate) struct Checkpoint {
    id: StateId,
    hit: u32,
    miss: u32,
}

/// Outcome of one instruction step.
pub(crate) enum Flow {
    /// Fall through to the given instruction.
    Next(usize),
    /// This path is fully explored.
    PathDone,
}

pub(crate) struct Verifier<'a> {
    pub(crate) insns: Vec<Instruction>,
    pub(crate) kind: ProgramKind,
    pub(crate) ops: &'static dyn ProgOps,
    pub(crate) maps: Vec<MapDef>,
    pub(crate) used_maps: Vec<usize>,
    pub(crate) ktypes: &'a KtypeDb,
    pub(crate) config: VerifierConfig,
    pub(crate) log: VerifierLog,
    pub(crate) aux: Vec<InsnAux>,
    pub(crate) cfg: CfgInfo,
    pub(crate) line_info: Vec<LineInfo>,

    pub(crate) cur: VerifierState,
    pub(crate) arena: StateArena,
    explored: HashMap<u64, Vec<Checkpoint>>,
    pub(crate) worklist: Vec<BranchEntry>,

    pub(crate) insn_idx: usize,
    pub(crate) prev_insn_idx: usize,
    /// Sanitizer origin when the current path is speculative.
    pub(crate) spec_origin: Option<usize>,

    pub(crate) insn_processed: usize,
    jmps_processed: usize,
    prev_insn_processed: usize,
    prev_jmps_processed: usize,
    id_gen: u32,
    stats: VerifierStats,
}

impl<'a> Verifier<'a> {
    pub(crate) fn new(input: VerifierInput<'a>) -> VResult<Self> {
        let ops = input.kind.ops();
        let iter_marks = iter_next_marks(&input.insns);
        let cfg = cfg::build_cfg(&input.insns, &iter_marks)?;

        let mut aux = vec![InsnAux::default(); input.insns.len()];
        for (idx, marks) in cfg.marks.iter().enumerate() {
            aux[idx].prune_point = marks.prune_point;
            aux[idx].jmp_point = marks.jmp_point;
            aux[idx].force_checkpoint = marks.force_checkpoint;
            aux[idx].is_iter_next = iter_marks[idx];
            aux[idx].unpriv = !input.config.privileged_mode();
        }

        let log = VerifierLog::new(input.config.log_level);
        let mut cur = VerifierState::entry();
        *cur.reg_mut(RegId::R1) = RegState::pointer(PtrBase::Ctx, PtrFlags::empty());
        cur.reg_mut(RegId::R1).live = Live::WRITTEN;
        cur.branches = 1;

        Ok(Self {
            insns: input.insns,
            kind: input.kind,
            ops,
            maps: input.maps,
            used_maps: Vec::new(),
            ktypes: input.ktypes,
            config: input.config,
            log,
            aux,
            cfg,
            line_info: input.line_info,
            cur,
            arena: StateArena::new(),
            explored: HashMap::new(),
            worklist: Vec::new(),
            insn_idx: 0,
            prev_insn_idx: 0,
            spec_origin: None,
            insn_processed: 0,
            jmps_processed: 0,
            prev_insn_processed: 0,
            prev_jmps_processed: 0,
            id_gen: 0,
            stats: VerifierStats::default(),
        })
    }

    /// Rewrites and result assembly after the analysis loop finished.
    pub(crate) fn finish(
        mut self,
        result: VResult<()>,
    ) -> (Result<VerifiedProgram, VerifierError>, String) {
        if let Err(mut err) = result {
            // Speculative-path failures point at the instruction whose
            // arithmetic forked the twin, not the twin's own location.
            if let Some(origin) = self.spec_origin {
                err.insn_idx = origin;
            }
            self.log.line(format_args!("{}", err.message));
            return (Err(err), self.log.into_contents());
        }

        let mut patcher = Patcher::new(
            self.insns,
            self.aux,
            self.cfg.subprogs.clone(),
            self.line_info,
        );
        patcher.neutralize_dead_code();
        if let Err(err) = patcher.apply_sanitation() {
            self.log.line(format_args!("{}", err.message));
            return (Err(err), self.log.into_contents());
        }
        let (insns, aux, subprogs) = patcher.into_parts();

        self.stats.insn_processed = self.insn_processed;
        self.stats.peak_states = self.arena.peak();

        (
            Ok(VerifiedProgram {
                insns,
                used_maps: self.used_maps,
                aux,
                subprogs,
                stats: self.stats,
            }),
            self.log.into_contents(),
        )
    }

    /// The main loop: simulate until every pending path is explored.
    pub(crate) fn run(&mut self) -> VResult<()> {
        let _span = tracing::debug_span!("verify", kind = self.ops.name()).entered();
        loop {
            if self.insn_processed > self.config.insn_limit {
                return Err(self.reject(
                    Reject::InsnLimit,
                    format!("processed {} insns, budget exhausted", self.insn_processed),
                ));
            }

            let insn = self.insn_at(self.insn_idx)?;

            if self.aux[self.insn_idx].prune_point && self.is_state_visited()? {
                // Subsumed by an earlier exploration.
                if !self.next_path()? {
                    break;
                }
                continue;
            }

            self.aux[self.insn_idx].seen = true;
            self.insn_processed += 1;
            if self.log.enabled(crate::log::LogLevel::Info) {
                vlog!(self.log, "{}: {}", self.insn_idx, insn);
            }
            tracing::trace!(insn_idx = self.insn_idx, %insn, "step");

            let flow = self.step(insn)?;
            match flow {
                Flow::Next(next) => {
                    let width = if insn.is_ld_imm64() { 2 } else { 1 };
                    if next != self.insn_idx + width {
                        self.jmps_processed += 1;
                        self.cur.push_jmp_history(self.insn_idx, next);
                    }
                    self.prev_insn_idx = self.insn_idx;
                    self.insn_idx = next;
                    self.cur.last_insn_idx = self.prev_insn_idx;
                }
                Flow::PathDone => {
                    if !self.next_path()? {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// One instruction's typing rules.
    fn step(&mut self, insn: Instruction) -> VResult<Flow> {
        match insn.class() {
            Class::Alu32 | Class::Alu64 => {
                self.check_alu(insn)?;
                Ok(Flow::Next(self.insn_idx + 1))
            }
            Class::Ldx => {
                self.check_load(insn)?;
                Ok(Flow::Next(self.insn_idx + 1))
            }
            Class::St | Class::Stx => {
                if insn.mode() == Some(Mode::Atomic) {
                    self.check_atomic(insn)?;
                } else {
                    self.check_store(insn)?;
                }
                Ok(Flow::Next(self.insn_idx + 1))
            }
            Class::Ld => {
                if insn.is_ld_imm64() {
                    self.check_ld_imm64(insn)?;
                    Ok(Flow::Next(self.insn_idx + 2))
                } else {
                    self.check_ld_abs(insn)?;
                    Ok(Flow::Next(self.insn_idx + 1))
                }
            }
            Class::Jmp | Class::Jmp32 => self.check_jmp(insn),
        }
    }

    // ------------------------------------------------------------------
    // Path and state lifecycle
    // ------------------------------------------------------------------

    /// Pop the next pending fork; false when exploration is complete.
    pub(crate) fn next_path(&mut self) -> VResult<bool> {
        self.update_branch_counts(self.cur.parent)?;
        match self.worklist.pop() {
            Some(entry) => {
                self.cur = entry.state;
                self.insn_idx = entry.insn_idx;
                self.prev_insn_idx = entry.prev_insn_idx.unwrap_or(entry.insn_idx);
                self.spec_origin = entry.spec_origin;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Fork the current state to resume at `insn_idx`, returning a handle
    /// to the pushed copy for branch-side refinement.
    pub(crate) fn push_fork(
        &mut self,
        insn_idx: usize,
        speculative: bool,
    ) -> VResult<&mut VerifierState> {
        if self.worklist.len() >= self.config.fork_limit {
            return Err(self.reject(
                Reject::ForkLimit,
                format!("{} pending paths, fork budget exhausted", self.worklist.len()),
            ));
        }
        let mut state = self.cur.fork();
        state.speculative |= speculative;
        state.push_jmp_history(self.insn_idx, insn_idx);
        // The shared parent gains one more active descendant.
        if let Some(parent) = state.parent {
            if let Some(node) = self.arena.get_mut(parent) {
                node.branches += 1;
            }
        }
        let spec_origin = if speculative {
            self.spec_origin.or(Some(self.insn_idx))
        } else {
            self.spec_origin
        };
        self.worklist.push(BranchEntry {
            state,
            insn_idx,
            prev_insn_idx: Some(self.insn_idx),
            spec_origin,
        });
        Ok(&mut self
            .worklist
            .last_mut()
            .expect("entry was just pushed")
            .state)
    }

    /// A finished path releases its claim on the parent chain.
    fn update_branch_counts(&mut self, from: Option<StateId>) -> VResult<()> {
        let mut cursor = from;
        while let Some(id) = cursor {
            let Some(node) = self.arena.get_mut(id) else {
                break;
            };
            if node.branches == 0 {
                return Err(Bug::new(BugVariant::BranchCountUnderflow, self.insn_idx).into());
            }
            node.branches -= 1;
            if node.branches > 0 {
                break;
            }
            cursor = node.parent;
        }
        Ok(())
    }

    /// Explored-state cache key.
    fn state_key(&self) -> u64 {
        let callsite = self
            .cur
            .cur_frame()
            .callsite
            .map(|c| c as u64 + 1)
            .unwrap_or(0);
        (self.insn_idx as u64) ^ (callsite << 32)
    }

    /// Consult the cache; true when the current path is subsumed. Otherwise
    /// possibly record a new checkpoint.
    fn is_state_visited(&mut self) -> VResult<bool> {
        let key = self.state_key();
        let iter_convergence = self.aux[self.insn_idx].is_iter_next;

        let mut pruned = None;
        let mut evict = Vec::new();
        if let Some(list) = self.explored.get_mut(&key) {
            let list_len = list.len();
            for (pos, cp) in list.iter_mut().enumerate() {
                let Some(old) = self.arena.get(cp.id) else {
                    evict.push(pos);
                    continue;
                };
                if equiv::states_equal(old, &self.cur, iter_convergence) {
                    cp.hit += 1;
                    self.stats.prune_hits += 1;
                    pruned = Some(cp.id);
                    break;
                }
                cp.miss += 1;
                self.stats.prune_misses += 1;
                let old_done = old.branches == 0;
                if old_done
                    && cp.miss > cp.hit.saturating_mul(CHECKPOINT_EVICT_RATIO)
                    && list_len > MAX_CHECKPOINTS_PER_INSN
                {
                    evict.push(pos);
                }
            }
            for pos in evict.into_iter().rev() {
                let cp = list.remove(pos);
                self.arena.free(cp.id);
            }
        }

        if let Some(old_id) = pruned {
            vtrace!(self.log, "{}: pruned by earlier state", self.insn_idx);
            self.propagate_liveness(old_id)?;
            self.propagate_precision(old_id)?;
            return Ok(true);
        }

        // Inside loops, throttle checkpoint creation.
        let force = self.aux[self.insn_idx].force_checkpoint;
        let enough_progress = self.jmps_processed - self.prev_jmps_processed
            >= CHECKPOINT_JMP_GAP as usize
            && self.insn_processed - self.prev_insn_processed >= CHECKPOINT_INSN_GAP as usize;
        if !force && !enough_progress {
            return Ok(false);
        }
        self.prev_jmps_processed = self.jmps_processed;
        self.prev_insn_processed = self.insn_processed;

        self.checkpoint_here();
        Ok(false)
    }

    /// Record the current state as a checkpoint and re-home the live path
    /// under it.
    fn checkpoint_here(&mut self) {
        let mut snapshot = self.cur.fork();
        snapshot.branches = 1;
        snapshot.last_insn_idx = self.prev_insn_idx;
        let id = self.arena.alloc(snapshot);
        self.stats.total_states += 1;

        let key = self.state_key();
        self.explored.entry(key).or_default().push(Checkpoint {
            id,
            hit: 0,
            miss: 0,
        });

        self.cur.parent = Some(id);
        self.cur.first_insn_idx = self.insn_idx;
        self.cur.jmp_history.clear();
        // Reads below this point are not reads the checkpoint performed.
        for frame in &mut self.cur.frames {
            for reg in frame.regs.iter_mut() {
                reg.live = Live::empty();
            }
            for (_, slot) in frame.stack.iter_mut() {
                slot.spilled.live = Live::empty();
            }
        }
        if self.log.enabled(crate::log::LogLevel::Debug) {
            vtrace!(self.log, "{}: checkpoint {}", self.insn_idx, self.cur);
        }
    }

    // ------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------

    /// Mark a register read and propagate it up the parent chain.
    pub(crate) fn mark_reg_read_at(
        &mut self,
        frameno: usize,
        regno: usize,
        mark: Live,
    ) -> VResult<()> {
        let frame = self
            .cur
            .frames
            .get(frameno)
            .ok_or_else(|| VerifierError::from(Bug::new(BugVariant::FrameOutOfRange, self.insn_idx)))?;
        if frame.regs[regno].live.contains(Live::WRITTEN) {
            return Ok(());
        }
        let callsite = frame.callsite;
        let mut cursor = self.cur.parent;
        while let Some(id) = cursor {
            let Some(node) = self.arena.get_mut(id) else {
                break;
            };
            let Some(nframe) = node.frames.get_mut(frameno) else {
                break;
            };
            if nframe.callsite != callsite {
                break;
            }
            let reg = &mut nframe.regs[regno];
            if reg.live.contains(mark) || reg.live.contains(Live::DONE) {
                break;
            }
            reg.live |= mark;
            if reg.live.contains(Live::WRITTEN) {
                break;
            }
            cursor = node.parent;
        }
        Ok(())
    }

    /// Mark a stack-slot read and propagate it up the parent chain.
    pub(crate) fn mark_stack_read_at(
        &mut self,
        frameno: usize,
        slot_idx: usize,
        mark: Live,
    ) -> VResult<()> {
        let frame = self
            .cur
            .frames
            .get_mut(frameno)
            .ok_or_else(|| VerifierError::from(Bug::new(BugVariant::FrameOutOfRange, self.insn_idx)))?;
        if let Some(slot) = frame.stack.slot(slot_idx) {
            if slot.spilled.live.contains(Live::WRITTEN) {
                return Ok(());
            }
        }
        let callsite = frame.callsite;
        let mut cursor = self.cur.parent;
        while let Some(id) = cursor {
            let Some(node) = self.arena.get_mut(id) else {
                break;
            };
            let Some(nframe) = node.frames.get_mut(frameno) else {
                break;
            };
            if nframe.callsite != callsite {
                break;
            }
            let Some(slot) = nframe.stack.slot_mut(slot_idx) else {
                break;
            };
            if slot.spilled.live.contains(mark) || slot.spilled.live.contains(Live::DONE) {
                break;
            }
            slot.spilled.live |= mark;
            if slot.spilled.live.contains(Live::WRITTEN) {
                break;
            }
            cursor = node.parent;
        }
        Ok(())
    }

    /// After a prune, reads the subsuming state performed must count as
    /// reads of the current path's ancestry.
    fn propagate_liveness(&mut self, old_id: StateId) -> VResult<()> {
        let Some(old) = self.arena.get(old_id) else {
            return Ok(());
        };
        let mut reg_marks = Vec::new();
        let mut slot_marks = Vec::new();
        for (f, frame) in old.frames.iter().enumerate() {
            for (r, reg) in frame.regs.iter().enumerate() {
                let marks = reg.live & (Live::READ32 | Live::READ64);
                if !marks.is_empty() {
                    reg_marks.push((f, r, marks));
                }
            }
            for (s, slot) in frame.stack.iter() {
                let marks = slot.spilled.live & (Live::READ32 | Live::READ64);
                if !marks.is_empty() {
                    slot_marks.push((f, s, marks));
                }
            }
        }
        for (f, r, marks) in reg_marks {
            if f < self.cur.frames.len() {
                self.mark_reg_read_at(f, r, marks)?;
            }
        }
        for (f, s, marks) in slot_marks {
            if f < self.cur.frames.len() {
                self.mark_stack_read_at(f, s, marks)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shared utilities
    // ------------------------------------------------------------------

    pub(crate) fn insn_at(&self, idx: usize) -> VResult<Instruction> {
        self.insns.get(idx).copied().ok_or_else(|| {
            VerifierError::new(
                Reject::JumpOutOfRange,
                idx,
                format!("instruction index {idx} out of range"),
            )
        })
    }

    /// Fresh correlation or reference id.
    pub(crate) fn next_id(&mut self) -> u32 {
        self.id_gen += 1;
        self.id_gen
    }

    /// Build a rejection at the current instruction, recording it in the
    /// log.
    pub(crate) fn reject(&mut self, reject: Reject, message: impl Into<String>) -> VerifierError {
        let message = message.into();
        vlog!(self.log, "{}: {}", self.insn_idx, message);
        VerifierError::new(reject, self.insn_idx, message)
    }

    /// Read access to a source register: checks initialization and marks
    /// liveness.
    pub(crate) fn read_reg(&mut self, r: RegId, mark: Live) -> VResult<RegState> {
        let frameno = self.cur.curframe;
        if !self.cur.reg(r).is_init() {
            return Err(self.reject(
                Reject::UninitRegister,
                format!("R{} !read_ok", r.val()),
            ));
        }
        let snapshot = self.cur.reg(r).clone();
        self.mark_reg_read_at(frameno, r.index(), mark)?;
        Ok(snapshot)
    }

    /// Write access to a destination register: rejects the frame pointer
    /// and sets the write mark.
    pub(crate) fn writable_reg(&mut self, r: RegId) -> VResult<()> {
        if r.is_fp() {
            return Err(self.reject(
                Reject::BadRegisterType,
                "frame pointer is read only",
            ));
        }
        self.cur.reg_mut(r).live |= Live::WRITTEN;
        Ok(())
    }

    /// Whether the run is privileged.
    pub(crate) fn privileged(&self) -> bool {
        self.config.privileged_mode()
    }

    /// Track a map as used, returning its table index.
    pub(crate) fn use_map(&mut self, fd: usize) -> Option<usize> {
        if fd >= self.maps.len() {
            return None;
        }
        if !self.used_maps.contains(&fd) {
            self.used_maps.push(fd);
        }
        Some(fd)
    }

    /// Look up a used map definition.
    pub(crate) fn map_def(&self, id: crate::map::MapId) -> VResult<&MapDef> {
        self.maps.get(id.0 as usize).ok_or_else(|| {
            VerifierError::from(Bug::new(BugVariant::UnexpectedRegState, self.insn_idx))
        })
    }

    /// Give every register currently sharing `id` the refinement in
    /// `template` (bounds only; kinds are left alone).
    pub(crate) fn find_equal_scalars(&mut self, id: u32, template: &RegState) {
        if id == 0 {
            return;
        }
        for frame in &mut self.cur.frames {
            for reg in frame.regs.iter_mut() {
                if reg.is_scalar() && reg.id == id {
                    let live = reg.live;
                    let precise = reg.precise;
                    let rid = reg.id;
                    *reg = template.clone();
                    reg.live = live;
                    reg.precise = precise;
                    reg.id = rid;
                }
            }
            for (_, slot) in frame.stack.iter_mut() {
                if slot.is_spilled_reg()
                    && slot.spilled.is_scalar()
                    && slot.spilled.id == id
                {
                    let live = slot.spilled.live;
                    let rid = slot.spilled.id;
                    slot.spilled = template.clone();
                    slot.spilled.live = live;
                    slot.spilled.id = rid;
                }
            }
        }
    }

    /// Finalization at a frame-0 exit: resource discipline and the return
    /// contract.
    pub(crate) fn check_frame0_exit(&mut self) -> VResult<()> {
        let r0 = self.read_reg(RegId::R0, Live::READ64)?;
        if !r0.is_scalar() {
            return Err(self.reject(
                Reject::BadRegisterType,
                format!("R0 is {} but exit needs a scalar verdict", r0),
            ));
        }
        let (lo, hi) = self.ops.return_range();
        if !(lo == 0 && hi == u64::MAX) && (r0.umin < lo || r0.umax > hi) {
            return Err(self.reject(
                Reject::ValueOutOfRange,
                format!(
                    "exit value must be in [{lo}, {hi}], got [{}, {}]",
                    r0.umin, r0.umax
                ),
            ));
        }
        if let Some(entry) = self.cur.cur_frame().refs.first().copied() {
            return Err(self.reject(
                Reject::UnreleasedReference,
                format!(
                    "Unreleased reference id={} acquired at insn {}",
                    entry.id, entry.insn_idx
                ),
            ));
        }
        if self.cur.active_lock.is_some() {
            return Err(self.reject(Reject::DoubleLock, "lock is still held at exit"));
        }
        if self.cur.active_rcu {
            return Err(self.reject(
                Reject::BadRcuBracket,
                "RCU bracket is still open at exit",
            ));
        }
        // Iterators constructed on the stack must have been destroyed; they
        // carry references, so the check above already caught them. Nothing
        // else to do.
        Ok(())
    }
}

/// Which instructions are iterator-advance calls, needed before the CFG
/// pass runs.
fn iter_next_marks(insns: &[Instruction]) -> Vec<bool> {
    insns
        .iter()
        .map(|insn| {
            insn.pseudo_call() == Some(krait_asm::PseudoCall::Kfunc)
                && KfuncId::from_imm(insn.imm()).is_some_and(KfuncId::is_iter_next)
        })
        .collect()
}

/// Registers every call scrubs in the caller.
pub(crate) fn clobber_caller_saved(frame: &mut FuncState) {
    for r in crate::consts::CALLER_SAVED {
        let live = frame.regs[r.index()].live;
        frame.regs[r.index()] = RegState::not_init();
        frame.regs[r.index()].live = live | Live::WRITTEN;
    }
}

/// Helper id of a helper call instruction.
pub(crate) fn helper_of(insn: Instruction) -> Option<HelperId> {
    (insn.pseudo_call() == Some(krait_asm::PseudoCall::Helper))
        .then(|| HelperId::from_imm(insn.imm()))
        .flatten()
}

impl Verifier<'_> {
    /// Branch dispatch shared by `Jmp` and `Jmp32`.
    fn check_jmp(&mut self, insn: Instruction) -> VResult<Flow> {
        let op = insn.jmp_op().ok_or_else(|| {
            self.reject(
                Reject::UnknownOpcode,
                format!("invalid opcode {:#04x}", insn.opcode()),
            )
        })?;
        match op {
            JmpOp::Exit => self.check_exit(insn),
            JmpOp::Call => self.check_call(insn),
            JmpOp::Ja => {
                if insn.dst_field() != 0 || insn.src_field() != 0 || insn.imm() != 0 {
                    return Err(self.reject(
                        Reject::ReservedFieldSet,
                        "reserved fields of ja must be zero",
                    ));
                }
                let target = (self.insn_idx as i64 + 1 + insn.off() as i64) as usize;
                Ok(Flow::Next(target))
            }
            _ => self.check_cond_jmp(insn, op),
        }
    }
}
