/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Live ranges and payload last-use computation.
//!
//! Virtual-register live ranges are an input to the allocator: a real
//! compiler front end runs a dataflow liveness pass and hands the result
//! over as [`LiveIntervals`]. The [`LiveIntervals::compute`] helper builds
//! a conservative def-to-last-use approximation directly from the
//! instruction stream, which is sufficient for structured programs and for
//! tests.
//!
//! Ranges are half-open `[start_ip, end_ip)`. A source read at ip `i`
//! extends the range to end at `i` (exclusive), so a value whose last read
//! is at `i` may share storage with a value defined at `i`; instructions
//! for which that in-place overlap is unsafe carry explicit hazard flags
//! handled during interference construction.

use crate::ir::{Opcode, Program, RegFile};
use crate::VirtReg;

/// Per-virtual-register live ranges, indexed by [`VirtReg`].
#[derive(Clone, Debug, Default)]
pub struct LiveIntervals {
    start: Vec<i32>,
    end: Vec<i32>,
}

impl LiveIntervals {
    /// Build from explicit `[start, end)` pairs, e.g. from an external
    /// liveness pass.
    pub fn from_ranges(ranges: &[(i32, i32)]) -> Self {
        LiveIntervals {
            start: ranges.iter().map(|r| r.0).collect(),
            end: ranges.iter().map(|r| r.1).collect(),
        }
    }

    /// Conservative ranges computed from def/use positions. Any mention
    /// inside a loop is stretched through the outermost enclosing loop's
    /// end, since the value may travel the back edge.
    pub fn compute(prog: &Program) -> Self {
        let n = prog.vregs.count();
        let mut start = vec![i32::MAX; n];
        let mut end = vec![i32::MIN; n];

        let mut loop_depth = 0;
        let mut loop_end = 0;
        let mut ip: i32 = 0;
        for (idx, inst) in prog.insts.iter().enumerate() {
            match inst.opcode {
                Opcode::LoopStart => {
                    loop_depth += 1;
                    if loop_depth == 1 {
                        loop_end = loop_end_ip(prog, idx, ip);
                    }
                }
                Opcode::LoopEnd => loop_depth -= 1,
                _ => {}
            }

            // Reads keep the value live up to (but not through) this ip;
            // writes keep it live through this ip. Inside a loop both
            // stretch past the back edge.
            let read_end = if loop_depth > 0 { loop_end + 1 } else { ip };
            let write_end = if loop_depth > 0 { loop_end + 1 } else { ip + 1 };

            for src in &inst.srcs {
                if let Some(v) = src.vreg() {
                    start[v.index()] = start[v.index()].min(ip);
                    end[v.index()] = end[v.index()].max(read_end);
                }
            }
            if let Some(v) = inst.dst.vreg() {
                start[v.index()] = start[v.index()].min(ip);
                end[v.index()] = end[v.index()].max(write_end);
            }

            if !inst.opcode.is_scratch() {
                ip += 1;
            }
        }

        // Registers never mentioned get an empty range at ip 0.
        for v in 0..n {
            if start[v] == i32::MAX {
                start[v] = 0;
                end[v] = 0;
            }
        }

        LiveIntervals { start, end }
    }

    #[inline(always)]
    pub fn start(&self, v: VirtReg) -> i32 {
        self.start[v.index()]
    }

    #[inline(always)]
    pub fn end(&self, v: VirtReg) -> i32 {
        self.end[v.index()]
    }

    pub fn count(&self) -> usize {
        self.start.len()
    }
}

/// The ip of the `LoopEnd` matching the `LoopStart` at `insts[start_idx]`
/// (which owns ip `start_ip`).
fn loop_end_ip(prog: &Program, start_idx: usize, start_ip: i32) -> i32 {
    let mut depth = 1;
    let mut ip = start_ip;
    for inst in &prog.insts[start_idx + 1..] {
        if !inst.opcode.is_scratch() {
            ip += 1;
        }
        match inst.opcode {
            Opcode::LoopStart => depth += 1,
            Opcode::LoopEnd => {
                depth -= 1;
                if depth == 0 {
                    return ip;
                }
            }
            _ => {}
        }
    }
    debug_assert!(false, "unterminated loop");
    ip
}

/// Last use ip per payload unit, `-1` for units the program never touches.
///
/// Payload registers are defined once at dispatch, so a use anywhere inside
/// a loop means the value must survive to the outermost loop's end. A
/// program terminator always reserves payload unit 0 regardless of its
/// operands.
pub fn payload_last_use(prog: &Program, payload_units: u32, reg_unit: u32) -> Vec<i32> {
    let count = payload_units as usize;
    let mut last_use = vec![-1; count];

    let mut loop_depth = 0;
    let mut loop_end = 0;
    let mut ip: i32 = 0;
    for (idx, inst) in prog.insts.iter().enumerate() {
        match inst.opcode {
            Opcode::LoopStart => {
                loop_depth += 1;
                if loop_depth == 1 {
                    loop_end = loop_end_ip(prog, idx, ip);
                }
            }
            Opcode::LoopEnd => loop_depth -= 1,
            _ => {}
        }

        let use_ip = if loop_depth > 0 { loop_end } else { ip };

        for (i, src) in inst.srcs.iter().enumerate() {
            if src.file == RegFile::Fixed {
                mark_fixed_use(&mut last_use, src.nr, inst.regs_read(i), reg_unit, use_ip);
            }
        }
        if inst.dst.file == RegFile::Fixed {
            mark_fixed_use(&mut last_use, inst.dst.nr, inst.regs_written(), reg_unit, use_ip);
        }

        if inst.eot && count > 0 {
            // The terminator's message header implicitly reads unit 0.
            last_use[0] = use_ip;
        }

        if !inst.opcode.is_scratch() {
            ip += 1;
        }
    }

    last_use
}

fn mark_fixed_use(last_use: &mut [i32], reg_nr: u32, regs: u32, reg_unit: u32, use_ip: i32) {
    let first = (reg_nr / reg_unit) as usize;
    if first >= last_use.len() {
        return;
    }
    let past = ((reg_nr + regs).div_ceil(reg_unit) as usize).min(last_use.len());
    for unit in first..past {
        last_use[unit] = use_ip;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{Instruction, Operand, Program};

    #[test]
    fn test_compute_simple_spans() {
        let mut prog = Program::new();
        let a = prog.vregs.alloc(1);
        let b = prog.vregs.alloc(1);
        // ip 0: a = ...
        prog.push(Instruction::alu(Operand::virt(a), &[]));
        // ip 1: b = a
        prog.push(Instruction::alu(Operand::virt(b), &[Operand::virt(a)]));
        // ip 2: use b
        prog.push(Instruction::alu(Operand::none(), &[Operand::virt(b)]));

        let live = LiveIntervals::compute(&prog);
        assert_eq!((live.start(a), live.end(a)), (0, 1));
        assert_eq!((live.start(b), live.end(b)), (1, 2));
    }

    #[test]
    fn test_compute_stretches_through_loop() {
        let mut prog = Program::new();
        let a = prog.vregs.alloc(1);
        // ip 0: a = ...
        prog.push(Instruction::alu(Operand::virt(a), &[]));
        // ip 1: loop {
        prog.push(Instruction::marker(Opcode::LoopStart));
        // ip 2: use a
        prog.push(Instruction::alu(Operand::none(), &[Operand::virt(a)]));
        // ip 3: }
        prog.push(Instruction::marker(Opcode::LoopEnd));
        // ip 4: unrelated
        prog.push(Instruction::alu(Operand::none(), &[]));

        let live = LiveIntervals::compute(&prog);
        // The read at ip 2 must survive the back edge at ip 3.
        assert_eq!((live.start(a), live.end(a)), (0, 4));
    }

    #[test]
    fn test_payload_last_use_loop_extension() {
        let mut prog = Program::new();
        // ip 0: read payload reg 1 outside any loop
        prog.push(Instruction::alu(Operand::none(), &[Operand::fixed(1)]));
        // ip 1: loop {
        prog.push(Instruction::marker(Opcode::LoopStart));
        // ip 2: read payload reg 0 inside the loop
        prog.push(Instruction::alu(Operand::none(), &[Operand::fixed(0)]));
        // ip 3: }
        prog.push(Instruction::marker(Opcode::LoopEnd));

        let last = payload_last_use(&prog, 4, 1);
        assert_eq!(last[0], 3); // stretched to the loop's end ip
        assert_eq!(last[1], 0);
        assert_eq!(last[2], -1);
        assert_eq!(last[3], -1);
    }

    #[test]
    fn test_eot_reserves_unit_zero() {
        let mut prog = Program::new();
        let p = prog.vregs.alloc(1);
        let mut send = Instruction::send(Operand::none(), Operand::virt(p));
        send.eot = true;
        prog.push(send);

        let last = payload_last_use(&prog, 2, 1);
        assert_eq!(last[0], 0);
        assert_eq!(last[1], -1);
    }
}
