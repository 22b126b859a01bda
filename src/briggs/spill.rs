/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Spill-cost estimation and the spill rewrite itself.
//!
//! Costs approximate dynamic access counts: each register touched by an
//! instruction contributes its operand width, scaled up inside loops and
//! down inside conditionals, then normalized by the logarithm of the live
//! length so short, hot ranges outrank long, cold ones. A register whose
//! value already flows through scratch is never spilled again.

use core::mem;

use smallvec::SmallVec;

use crate::coloring::ColorGraph;
use crate::ir::{Instruction, Opcode, Operand, REG_BYTES};
use crate::VirtReg;

use super::RegAlloc;

const LOOP_SCALE: f32 = 10.0;
const COND_SCALE: f32 = 0.5;

impl<'a, G: ColorGraph> RegAlloc<'a, G> {
    pub(super) fn set_spill_costs(&mut self) {
        let count = self.prog.vregs.count();
        let mut costs = vec![0.0f32; count];
        let mut no_spill = vec![false; count];

        let mut block_scale = 1.0f32;
        for inst in &self.prog.insts {
            for (i, src) in inst.srcs.iter().enumerate() {
                if let Some(v) = src.vreg() {
                    costs[v.index()] += inst.regs_read(i) as f32 * block_scale;
                }
            }
            if let Some(v) = inst.dst.vreg() {
                costs[v.index()] += inst.regs_written() as f32 * block_scale;
            }

            // Registers feeding scratch traffic must stay in the file,
            // or the rewrite could recurse forever.
            if inst.opcode.is_scratch() {
                for src in &inst.srcs {
                    if let Some(v) = src.vreg() {
                        no_spill[v.index()] = true;
                    }
                }
                if let Some(v) = inst.dst.vreg() {
                    no_spill[v.index()] = true;
                }
            }

            match inst.opcode {
                Opcode::LoopStart => block_scale *= LOOP_SCALE,
                Opcode::LoopEnd => block_scale /= LOOP_SCALE,
                Opcode::CondStart => block_scale *= COND_SCALE,
                Opcode::CondEnd => block_scale /= COND_SCALE,
                _ => {}
            }
        }

        for i in 0..count {
            let v = VirtReg::new(i);
            if no_spill[i] || self.is_spill_temp(v) || self.spilled.contains_key(&v) {
                continue;
            }
            let len = self.live.end(v) - self.live.start(v);
            // A degenerate range would blow up the normalization; leave
            // the cost at zero so the register is never picked.
            if len <= 0 || costs[i] <= 0.0 {
                continue;
            }
            let adjusted = costs[i] / (len as f32).ln();
            self.g.set_spill_cost(self.node(v), adjusted);
        }
    }

    pub(super) fn choose_spill_reg(&mut self) -> Option<VirtReg> {
        if !self.have_spill_costs {
            self.set_spill_costs();
            self.have_spill_costs = true;
        }
        let n = self.g.best_spill_candidate()?;
        debug_assert!(n.index() >= self.first_vreg_node);
        Some(VirtReg::new(n.index() - self.first_vreg_node))
    }

    /// A fresh register holding the in-file image of part of a spilled
    /// register at instruction `ip`. Rounded up to whole allocation units
    /// so the scratch operations stay unit-aligned.
    fn alloc_spill_temp(&mut self, count_regs: u32, ip: i32) -> VirtReg {
        let regs = count_regs.next_multiple_of(self.dev.reg_unit);
        let v = self.prog.vregs.alloc(regs);
        debug_assert!(self
            .classes
            .class_for_units(self.prog.vregs.size_units(v, self.dev.reg_unit))
            .is_some());
        self.spill_temp_ip.push(ip);
        v
    }

    /// Rewrite every use of `reg` through a scratch slot: reads become a
    /// fill into a fresh temporary, writes a store out of one. Instruction
    /// pointers are preserved because scratch operations do not own an ip.
    pub(super) fn spill_reg(&mut self, reg: VirtReg) {
        let size_regs = self.prog.vregs.size(reg);
        let spill_offset = self.last_scratch;
        debug_assert_eq!(spill_offset % 16, 0);
        self.last_scratch += size_regs * REG_BYTES;
        self.spilled.insert(reg, spill_offset);
        trace!(
            "spilling {} ({} regs) to scratch offset {}",
            reg,
            size_regs,
            spill_offset
        );

        let old = mem::take(&mut self.prog.insts);
        let mut out = Vec::with_capacity(old.len() + 8);
        let mut ip: i32 = 0;

        for mut inst in old {
            let owns_ip = !inst.opcode.is_scratch();
            let mut before: SmallVec<[Instruction; 2]> = SmallVec::new();
            let mut after: SmallVec<[Instruction; 2]> = SmallVec::new();

            for i in 0..inst.srcs.len() {
                if inst.srcs[i].vreg() != Some(reg) {
                    continue;
                }
                let regs = inst.regs_read(i);
                let sub_offset = spill_offset + round_down(inst.srcs[i].offset);
                let temp = self.alloc_spill_temp(regs, ip);
                inst.srcs[i].nr = temp.raw_u32();
                inst.srcs[i].offset %= REG_BYTES;
                self.emit_fills(&mut before, temp, sub_offset, regs);
            }

            if inst.dst.vreg() == Some(reg) {
                if inst.opcode == Opcode::Undef {
                    // The register is no longer defined in the file;
                    // dropping the destination keeps the ip layout while
                    // avoiding a dead store.
                    inst.dst = Operand::none();
                } else {
                    let regs = inst.regs_written();
                    let sub_offset = spill_offset + round_down(inst.dst.offset);
                    let temp = self.alloc_spill_temp(regs, ip);
                    inst.dst.nr = temp.raw_u32();
                    inst.dst.offset %= REG_BYTES;
                    // A partial write merges with prior contents, so the
                    // temporary must start out holding them.
                    if inst.is_partial_write {
                        self.emit_fills(&mut before, temp, sub_offset, regs);
                    }
                    self.emit_spills(&mut after, temp, sub_offset, regs);
                }
            }

            out.extend(before);
            out.push(inst);
            out.extend(after);
            if owns_ip {
                ip += 1;
            }
        }

        debug_assert_eq!(ip, self.live_ip_count);
        self.prog.insts = out;
    }

    fn emit_fills(&mut self, out: &mut SmallVec<[Instruction; 2]>, temp: VirtReg, offset: u32, regs: u32) {
        let max = self.dev.spill_max_regs;
        let mut done = 0;
        while done < regs {
            let block = max.min(regs - done);
            let dst = scratch_operand(temp, done, block);
            out.push(Instruction::scratch_load(dst, offset + done * REG_BYTES));
            self.fill_count += 1;
            done += block;
        }
    }

    fn emit_spills(&mut self, out: &mut SmallVec<[Instruction; 2]>, temp: VirtReg, offset: u32, regs: u32) {
        let max = self.dev.spill_max_regs;
        let mut done = 0;
        while done < regs {
            let block = max.min(regs - done);
            let src = scratch_operand(temp, done, block);
            out.push(Instruction::scratch_store(src, offset + done * REG_BYTES));
            self.spill_count += 1;
            done += block;
        }
    }
}

#[inline]
fn round_down(offset: u32) -> u32 {
    offset / REG_BYTES * REG_BYTES
}

/// An operand spanning `regs` whole physical registers starting
/// `reg_offset` registers into `temp`. With the scratch operations' fixed
/// execution width of 8 and dword elements, one component covers exactly
/// one 32-byte register.
fn scratch_operand(temp: VirtReg, reg_offset: u32, regs: u32) -> Operand {
    Operand::virt_sized(temp, reg_offset * REG_BYTES, regs as u16, 4)
}
