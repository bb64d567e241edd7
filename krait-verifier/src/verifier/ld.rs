//! Wide immediate loads and legacy packet loads.

use krait_asm::{
    Instruction,
    MemSize,
    Mode,
    PseudoLd,
    RegId,
};

use crate::error::{
    Bug,
    BugVariant,
    Reject,
    VResult,
};
use crate::ktype::KtypeKind;
use crate::map::MapId;
use crate::reg::{
    Live,
    PtrBase,
    PtrFlags,
    RegState,
};

use super::{
    clobber_caller_saved,
    Verifier,
};

impl Verifier<'_> {
    /// The two-word immediate load: a raw constant or a pseudo-source
    /// resolved through the fd array, the type database, or the subprogram
    /// table.
    pub(crate) fn check_ld_imm64(&mut self, insn: Instruction) -> VResult<()> {
        let hi = self.insn_at(self.insn_idx + 1)?;
        if hi.opcode() != 0 || hi.dst_field() != 0 || hi.src_field() != 0 || hi.off() != 0 {
            return Err(self.reject(
                Reject::ReservedFieldSet,
                "reserved fields of the second immediate word must be zero",
            ));
        }
        let dst = insn.dst().ok_or_else(|| {
            self.reject(Reject::BadRegisterType, "invalid destination register field")
        })?;
        let pseudo = insn.pseudo_ld().ok_or_else(|| {
            self.reject(
                Reject::ReservedFieldSet,
                format!("invalid immediate-load pseudo source {}", insn.src_field()),
            )
        })?;

        // Only the value-address forms use the second immediate.
        if !matches!(pseudo, PseudoLd::Raw | PseudoLd::MapValue | PseudoLd::MapIdxValue)
            && hi.imm() != 0
        {
            return Err(self.reject(
                Reject::ReservedFieldSet,
                "second immediate must be zero for this pseudo source",
            ));
        }

        self.writable_reg(dst)?;
        let live = self.cur.reg(dst).live;
        let out = match pseudo {
            PseudoLd::Raw => {
                let value = (insn.imm() as u32 as u64) | ((hi.imm() as u32 as u64) << 32);
                RegState::constant(value)
            }
            PseudoLd::MapFd | PseudoLd::MapIdx => {
                let map = self.resolve_map(insn.imm())?;
                RegState::pointer(PtrBase::ConstMap(map), PtrFlags::empty())
            }
            PseudoLd::MapValue | PseudoLd::MapIdxValue => {
                let map = self.resolve_map(insn.imm())?;
                let def = self.map_def(map)?;
                let direct = def.kind.direct_value_addr();
                let value_size = def.value_size;
                let name = def.name.clone();
                if !direct {
                    return Err(self.reject(
                        Reject::ReservedFieldSet,
                        format!("{name} does not expose direct value addresses"),
                    ));
                }
                let off = hi.imm();
                if off < 0 || off as u32 >= value_size {
                    return Err(self.reject(
                        Reject::OutOfBounds,
                        format!(
                            "direct value offset {off} outside value of {value_size} bytes"
                        ),
                    ));
                }
                let mut reg = RegState::pointer(
                    PtrBase::MapValue { map, uid: 0 },
                    PtrFlags::empty(),
                );
                reg.off = off;
                reg
            }
            PseudoLd::KtypeId => {
                let id = crate::ktype::KtypeId(insn.imm() as u32);
                let ktypes = self.ktypes;
                let ktype = ktypes.resolve(id, self.insn_idx)?;
                let size = ktype.size;
                let var = match &ktype.kind {
                    KtypeKind::Var { rdonly, percpu } => Some((*rdonly, *percpu)),
                    _ => None,
                };
                let name = ktype.name.clone();
                let Some((rdonly, percpu)) = var else {
                    return Err(self.reject(
                        Reject::ReservedFieldSet,
                        format!("{name} is not an addressable variable"),
                    ));
                };
                let mut flags = PtrFlags::empty();
                if rdonly {
                    flags |= PtrFlags::RDONLY;
                }
                if percpu {
                    flags |= PtrFlags::PERCPU;
                }
                RegState::pointer(PtrBase::Mem { size }, flags)
            }
            PseudoLd::Func => {
                let target = (self.insn_idx as i64 + 1 + insn.imm() as i64) as usize;
                let subprog = self.cfg.subprog_starting_at(target).ok_or_else(|| {
                    crate::error::VerifierError::from(Bug::new(
                        BugVariant::FrameOutOfRange,
                        self.insn_idx,
                    ))
                })?;
                self.aux[self.insn_idx].call_subprog = Some(subprog);
                RegState::pointer(
                    PtrBase::Func {
                        subprog: subprog as u32,
                    },
                    PtrFlags::empty(),
                )
            }
        };
        let reg = self.cur.reg_mut(dst);
        *reg = out;
        reg.live = live | Live::WRITTEN;
        Ok(())
    }

    fn resolve_map(&mut self, fd: i32) -> VResult<MapId> {
        let Ok(fd) = usize::try_from(fd) else {
            return Err(self.reject(
                Reject::ReservedFieldSet,
                format!("negative map descriptor {fd}"),
            ));
        };
        match self.use_map(fd) {
            Some(idx) => Ok(MapId(idx as u32)),
            None => Err(self.reject(
                Reject::ReservedFieldSet,
                format!("map descriptor {fd} does not resolve"),
            )),
        }
    }

    /// Legacy absolute and indirect packet loads: an implicit helper call
    /// that expects the context in r6, scratches the caller-saved
    /// registers, and leaves a scalar in r0.
    pub(crate) fn check_ld_abs(&mut self, insn: Instruction) -> VResult<()> {
        let mode = insn.mode();
        if !matches!(mode, Some(Mode::Abs | Mode::Ind)) {
            return Err(self.reject(
                Reject::UnknownOpcode,
                format!("invalid load mode in opcode {:#04x}", insn.opcode()),
            ));
        }
        if !self.ops.allows_ld_abs() {
            return Err(self.reject(
                Reject::BadRegisterType,
                format!("legacy packet loads are undefined for {}", self.ops.name()),
            ));
        }
        if insn.mem_size() == MemSize::Double {
            return Err(self.reject(
                Reject::ReservedFieldSet,
                "legacy packet loads are at most word sized",
            ));
        }
        if insn.dst_field() != 0 || insn.off() != 0 {
            return Err(self.reject(
                Reject::ReservedFieldSet,
                "reserved fields of a legacy packet load must be zero",
            ));
        }

        // The implicit call convention pins the context in r6.
        let r6 = self.read_reg(RegId::R6, Live::READ64)?;
        if r6.ptr_base() != Some(PtrBase::Ctx) {
            return Err(self.reject(
                Reject::BadRegisterType,
                "at the time of a legacy packet load r6 must hold the context",
            ));
        }
        if mode == Some(Mode::Ind) {
            let src = insn.src().ok_or_else(|| {
                self.reject(Reject::BadRegisterType, "invalid source register field")
            })?;
            let idx = self.read_reg(src, Live::READ64)?;
            if !idx.is_scalar() {
                return Err(self.reject(
                    Reject::BadRegisterType,
                    format!("R{} packet index must be a scalar", src.val()),
                ));
            }
        } else if insn.src_field() != 0 {
            return Err(self.reject(
                Reject::ReservedFieldSet,
                "reserved source register of an absolute packet load",
            ));
        }

        // The load aborts the program on a bad offset, so references would
        // leak past the implicit exit.
        if let Some(entry) = self.cur.cur_frame().refs.first().copied() {
            return Err(self.reject(
                Reject::UnreleasedReference,
                format!(
                    "legacy packet load with unreleased reference id={}",
                    entry.id
                ),
            ));
        }

        clobber_caller_saved(self.cur.cur_frame_mut());
        let out = self.cur.reg_mut(RegId::R0);
        *out = RegState::unknown_scalar();
        out.live = Live::WRITTEN;
        Ok(())
    }
}
