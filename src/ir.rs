/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Instruction-stream data model consumed by the allocator.
//!
//! The program is a flat, ordered instruction array; loops and
//! conditionals are delimited by structured marker opcodes rather than a
//! pointer-linked CFG. Each *original* instruction owns one instruction
//! pointer (ip) in program order; instructions synthesized while spilling
//! (scratch loads/stores) do not advance the ip, which keeps previously
//! computed live ranges valid across spill iterations.

use crate::VirtReg;
use smallvec::SmallVec;

/// Bytes per physical register.
pub const REG_BYTES: u32 = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    /// Ordinary computation; reads its sources, writes its destination.
    Alu,
    /// Message-style instruction; `srcs[0]` is the payload block and, when
    /// `ex_mlen > 0`, `srcs[1]` is the extended payload block.
    Send,
    /// Loop head marker. Bodies nest; the matching `LoopEnd` closes the
    /// innermost open loop.
    LoopStart,
    /// Loop tail marker; execution may branch back to the matching
    /// `LoopStart`.
    LoopEnd,
    /// Conditional entry marker.
    CondStart,
    /// Conditional exit marker.
    CondEnd,
    /// Declares its destination written without producing data. Spilling
    /// drops the write instead of emitting scratch traffic for it.
    Undef,
    /// Synthesized fill: scratch memory at the given byte offset into the
    /// destination.
    ScratchLoad { offset: u32 },
    /// Synthesized spill: the source into scratch memory at the given byte
    /// offset.
    ScratchStore { offset: u32 },
}

impl Opcode {
    /// Scratch traffic synthesized by the spiller; never owns an ip and is
    /// never itself a spill candidate.
    #[inline(always)]
    pub fn is_scratch(self) -> bool {
        matches!(
            self,
            Opcode::ScratchLoad { .. } | Opcode::ScratchStore { .. }
        )
    }
}

/// Which storage an operand names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RegFile {
    /// No storage (absent operand, or a write discarded while spilling).
    #[default]
    None,
    /// A virtual register, subject to allocation.
    Virt,
    /// A fixed physical register (payload reads, post-allocation operands).
    Fixed,
}

/// A register reference within an instruction: a virtual or fixed register
/// number, a byte offset into it, and a per-channel region shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Operand {
    pub file: RegFile,
    /// Virtual register index, or physical register number once fixed.
    pub nr: u32,
    /// Byte offset from the start of the register.
    pub offset: u32,
    /// Components accessed per channel.
    pub comps: u16,
    /// Bytes per component element.
    pub elem_bytes: u16,
}

impl Operand {
    #[inline(always)]
    pub fn none() -> Self {
        Operand::default()
    }

    /// One 32-bit component per channel of virtual register `reg`.
    pub fn virt(reg: VirtReg) -> Self {
        Operand {
            file: RegFile::Virt,
            nr: reg.raw_u32(),
            offset: 0,
            comps: 1,
            elem_bytes: 4,
        }
    }

    pub fn virt_sized(reg: VirtReg, offset: u32, comps: u16, elem_bytes: u16) -> Self {
        Operand {
            file: RegFile::Virt,
            nr: reg.raw_u32(),
            offset,
            comps,
            elem_bytes,
        }
    }

    /// One 32-bit component per channel of fixed physical register `nr`.
    pub fn fixed(nr: u32) -> Self {
        Operand {
            file: RegFile::Fixed,
            nr,
            offset: 0,
            comps: 1,
            elem_bytes: 4,
        }
    }

    #[inline(always)]
    pub fn vreg(&self) -> Option<VirtReg> {
        match self.file {
            RegFile::Virt => Some(VirtReg(self.nr)),
            _ => None,
        }
    }

    /// Bytes touched at the given execution width.
    #[inline(always)]
    pub fn byte_span(&self, exec_width: u32) -> u32 {
        self.comps as u32 * self.elem_bytes as u32 * exec_width
    }

    /// Physical registers touched at the given execution width.
    #[inline(always)]
    pub fn reg_span(&self, exec_width: u32) -> u32 {
        self.byte_span(exec_width).div_ceil(REG_BYTES).max(1)
    }
}

#[derive(Clone, Debug)]
pub struct Instruction {
    pub opcode: Opcode,
    pub dst: Operand,
    pub srcs: SmallVec<[Operand; 3]>,
    /// SIMD channels executed.
    pub exec_width: u32,
    /// Executes all channels regardless of the dispatch mask.
    pub force_writemask_all: bool,
    /// Program terminator; the final payload must come from the top of the
    /// register file.
    pub eot: bool,
    /// The write covers only part of its destination's bytes.
    pub is_partial_write: bool,
    /// Execution semantics forbid destination/source storage overlap.
    pub has_src_dst_hazard: bool,
    /// Extended-payload length for split sends, in physical registers.
    pub ex_mlen: u32,
}

impl Instruction {
    fn new(opcode: Opcode, dst: Operand) -> Self {
        Instruction {
            opcode,
            dst,
            srcs: SmallVec::new(),
            exec_width: 8,
            force_writemask_all: false,
            eot: false,
            is_partial_write: false,
            has_src_dst_hazard: false,
            ex_mlen: 0,
        }
    }

    pub fn alu(dst: Operand, srcs: &[Operand]) -> Self {
        let mut inst = Instruction::new(Opcode::Alu, dst);
        inst.srcs.extend_from_slice(srcs);
        inst
    }

    pub fn send(dst: Operand, payload: Operand) -> Self {
        let mut inst = Instruction::new(Opcode::Send, dst);
        inst.srcs.push(payload);
        inst
    }

    /// A split send whose extended payload occupies `ex_mlen` physical
    /// registers.
    pub fn send_split(dst: Operand, payload: Operand, ex_payload: Operand, ex_mlen: u32) -> Self {
        debug_assert!(ex_mlen > 0);
        let mut inst = Instruction::new(Opcode::Send, dst);
        inst.srcs.push(payload);
        inst.srcs.push(ex_payload);
        inst.ex_mlen = ex_mlen;
        inst
    }

    pub fn undef(dst: Operand) -> Self {
        Instruction::new(Opcode::Undef, dst)
    }

    /// A structured control-flow marker with no operands.
    pub fn marker(opcode: Opcode) -> Self {
        debug_assert!(matches!(
            opcode,
            Opcode::LoopStart | Opcode::LoopEnd | Opcode::CondStart | Opcode::CondEnd
        ));
        Instruction::new(opcode, Operand::none())
    }

    /// A scratch fill produced by the spiller; writes every channel so
    /// the temporary is fully defined regardless of the surrounding
    /// predication.
    pub(crate) fn scratch_load(dst: Operand, offset: u32) -> Self {
        let mut inst = Instruction::new(Opcode::ScratchLoad { offset }, dst);
        inst.force_writemask_all = true;
        inst
    }

    /// A scratch spill produced by the spiller.
    pub(crate) fn scratch_store(src: Operand, offset: u32) -> Self {
        let mut inst = Instruction::new(Opcode::ScratchStore { offset }, Operand::none());
        inst.srcs.push(src);
        inst.force_writemask_all = true;
        inst
    }

    /// Physical registers read through source `i`.
    #[inline(always)]
    pub fn regs_read(&self, i: usize) -> u32 {
        self.srcs[i].reg_span(self.exec_width)
    }

    /// Physical registers written through the destination.
    #[inline(always)]
    pub fn regs_written(&self) -> u32 {
        self.dst.reg_span(self.exec_width)
    }

    /// Message whose payload is sourced from the general register file.
    #[inline(always)]
    pub fn is_send_from_grf(&self) -> bool {
        self.opcode == Opcode::Send
            && self
                .srcs
                .first()
                .map_or(false, |s| s.file == RegFile::Virt)
    }
}

/// Sizes of all virtual registers, in physical registers. Growable with
/// stable indices; the spiller appends temporaries at the tail.
#[derive(Clone, Debug, Default)]
pub struct VirtRegTable {
    sizes: Vec<u32>,
}

impl VirtRegTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, size_regs: u32) -> VirtReg {
        debug_assert!(size_regs > 0);
        let r = VirtReg::new(self.sizes.len());
        self.sizes.push(size_regs);
        r
    }

    #[inline(always)]
    pub fn count(&self) -> usize {
        self.sizes.len()
    }

    /// Size in physical registers.
    #[inline(always)]
    pub fn size(&self, r: VirtReg) -> u32 {
        self.sizes[r.index()]
    }

    /// Size in allocation units of `reg_unit` physical registers.
    #[inline(always)]
    pub fn size_units(&self, r: VirtReg, reg_unit: u32) -> u32 {
        self.size(r).div_ceil(reg_unit)
    }
}

/// A compilation unit's instruction stream plus its virtual-register size
/// table.
#[derive(Clone, Debug, Default)]
pub struct Program {
    pub insts: Vec<Instruction>,
    pub vregs: VirtRegTable,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, inst: Instruction) {
        self.insts.push(inst);
    }

    /// Number of instructions owning an ip (scratch traffic excluded).
    pub fn ip_count(&self) -> usize {
        self.insts
            .iter()
            .filter(|i| !i.opcode.is_scratch())
            .count()
    }
}
