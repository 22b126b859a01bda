/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! End-to-end allocator runs over small hand-built programs.

use shaderalloc::ir::{Instruction, Opcode, Operand, Program, RegFile};
use shaderalloc::liveness::LiveIntervals;
use shaderalloc::{
    allocate_registers, AllocOptions, Assignment, DeviceLimits, HazardFlags, RegAllocError,
    VirtReg,
};

fn device(file_regs: u32) -> DeviceLimits {
    DeviceLimits {
        file_regs,
        reg_unit: 1,
        payload_regs: 0,
        max_vreg_regs: file_regs.min(4),
        spill_max_regs: 2,
        hazards: HazardFlags::default(),
    }
}

fn nop() -> Instruction {
    Instruction::alu(Operand::none(), &[])
}

/// A full-width operand covering `regs` physical registers of `v`.
fn wide(v: VirtReg, regs: u32) -> Operand {
    Operand::virt_sized(v, 0, regs as u16, 4)
}

fn def(v: VirtReg, regs: u32) -> Instruction {
    Instruction::alu(wide(v, regs), &[])
}

fn read(v: VirtReg, regs: u32) -> Instruction {
    Instruction::alu(Operand::none(), &[wide(v, regs)])
}

fn spans_disjoint(a: (u32, u32), b: (u32, u32)) -> bool {
    a.1 <= b.0 || b.1 <= a.0
}

fn ranges_overlap(a: (i32, i32), b: (i32, i32)) -> bool {
    !(a.1 <= b.0 || b.1 <= a.0)
}

/// Three size-1 registers under mutual pressure on a two-register file,
/// each defined once and read once.
fn pressure_program() -> (Program, LiveIntervals) {
    let mut prog = Program::new();
    let v0 = prog.vregs.alloc(1);
    let v1 = prog.vregs.alloc(1);
    let v2 = prog.vregs.alloc(1);
    prog.push(def(v0, 1));
    prog.push(def(v1, 1));
    prog.push(def(v2, 1));
    prog.push(read(v0, 1));
    prog.push(read(v1, 1));
    prog.push(read(v2, 1));
    for _ in 0..4 {
        prog.push(nop());
    }
    let live = LiveIntervals::from_ranges(&[(0, 10), (0, 10), (0, 10)]);
    (prog, live)
}

#[test]
fn test_no_aliasing_between_live_registers() {
    let mut prog = Program::new();
    let sizes = [2u32, 3, 1, 2];
    let ranges = [(0, 10), (2, 8), (4, 6), (5, 12)];
    let vs: Vec<VirtReg> = sizes.iter().map(|&s| prog.vregs.alloc(s)).collect();
    for (i, &v) in vs.iter().enumerate() {
        prog.push(def(v, sizes[i]));
    }
    for (i, &v) in vs.iter().enumerate() {
        prog.push(read(v, sizes[i]));
    }
    for _ in 0..4 {
        prog.push(nop());
    }
    let live = LiveIntervals::from_ranges(&ranges);

    let out = allocate_registers(&mut prog, &live, &device(16), &AllocOptions::default()).unwrap();
    assert_eq!(out.spill_count, 0);
    assert!(out.units_used <= 16);

    let span = |i: usize| match out.assignments[i] {
        Assignment::Reg(base) => (base, base + sizes[i]),
        Assignment::Spilled { .. } => panic!("unexpected spill"),
    };
    for i in 0..sizes.len() {
        for j in i + 1..sizes.len() {
            if ranges_overlap(ranges[i], ranges[j]) {
                assert!(
                    spans_disjoint(span(i), span(j)),
                    "v{} and v{} overlap in both time and space",
                    i,
                    j
                );
            }
        }
    }
}

#[test]
fn test_chain_reuses_registers_without_spilling() {
    // Three registers whose ranges form a chain fit a two-register file
    // with no spilling: the two non-adjacent ones share a register.
    let mut prog = Program::new();
    for _ in 0..3 {
        prog.vregs.alloc(1);
    }
    for _ in 0..10 {
        prog.push(nop());
    }
    let live = LiveIntervals::from_ranges(&[(0, 5), (2, 8), (6, 10)]);

    let opts = AllocOptions {
        allow_spilling: false,
        ..Default::default()
    };
    let out = allocate_registers(&mut prog, &live, &device(2), &opts).unwrap();
    assert_eq!(out.spill_count, 0);
    assert_eq!(out.units_used, 2);
    let base = |i: usize| match out.assignments[i] {
        Assignment::Reg(b) => b,
        Assignment::Spilled { .. } => panic!("unexpected spill"),
    };
    assert_ne!(base(0), base(1));
    assert_ne!(base(1), base(2));
    // Pigeonhole on a two-register file.
    assert_eq!(base(0), base(2));
}

#[test]
fn test_infeasible_without_spilling_is_fatal() {
    let (mut prog, live) = pressure_program();
    let opts = AllocOptions {
        allow_spilling: false,
        ..Default::default()
    };
    let err = allocate_registers(&mut prog, &live, &device(2), &opts).unwrap_err();
    // The failure names the register left without a placement.
    assert_eq!(err, RegAllocError::SpillingDisallowed(VirtReg::new(0)));
}

#[test]
fn test_pressure_spills_until_feasible() {
    let (mut prog, live) = pressure_program();
    let out = allocate_registers(&mut prog, &live, &device(2), &AllocOptions::default()).unwrap();

    assert_eq!(out.assignments[0], Assignment::Spilled { offset: 0 });
    assert_eq!(out.assignments[1], Assignment::Spilled { offset: 32 });
    assert_eq!(out.assignments[2], Assignment::Reg(0));
    assert_eq!(out.spill_count, 2);
    assert_eq!(out.fill_count, 2);
    assert_eq!(out.scratch_bytes, 64);
    assert_eq!(out.units_used, 2);

    // Spill temporaries got real registers.
    for a in &out.assignments[3..] {
        assert!(!a.is_spilled());
    }

    // The rewritten stream no longer mentions any virtual register, and
    // the synthesized scratch traffic matches the counters.
    let mut loads = 0;
    let mut stores = 0;
    for inst in &prog.insts {
        assert_ne!(inst.dst.file, RegFile::Virt);
        for src in &inst.srcs {
            assert_ne!(src.file, RegFile::Virt);
        }
        match inst.opcode {
            Opcode::ScratchLoad { .. } => loads += 1,
            Opcode::ScratchStore { .. } => stores += 1,
            _ => {}
        }
    }
    assert_eq!(loads, out.fill_count);
    assert_eq!(stores, out.spill_count);
}

#[test]
fn test_spilled_undef_write_emits_no_store() {
    // v0 is declared with an undef write; spilling it must drop the write
    // instead of storing garbage, while its read still gets a fill.
    let mut prog = Program::new();
    let v0 = prog.vregs.alloc(1);
    let v1 = prog.vregs.alloc(1);
    let v2 = prog.vregs.alloc(1);
    prog.push(Instruction::undef(wide(v0, 1)));
    prog.push(def(v1, 1));
    prog.push(def(v2, 1));
    prog.push(read(v0, 1));
    prog.push(read(v1, 1));
    prog.push(read(v2, 1));
    for _ in 0..4 {
        prog.push(nop());
    }
    let live = LiveIntervals::from_ranges(&[(0, 10), (0, 10), (0, 10)]);

    let out = allocate_registers(&mut prog, &live, &device(2), &AllocOptions::default()).unwrap();
    assert_eq!(out.assignments[0], Assignment::Spilled { offset: 0 });
    assert_eq!(out.assignments[1], Assignment::Spilled { offset: 32 });
    assert_eq!(out.spill_count, 1);
    assert_eq!(out.fill_count, 2);

    // No store ever targets v0's scratch slot, and the undef write now
    // has no destination.
    for inst in &prog.insts {
        if let Opcode::ScratchStore { offset } = inst.opcode {
            assert_eq!(offset, 32);
        }
        if inst.opcode == Opcode::Undef {
            assert_eq!(inst.dst.file, RegFile::None);
        }
    }
}

#[test]
fn test_deterministic_output() {
    let (mut prog_a, live_a) = pressure_program();
    let (mut prog_b, live_b) = pressure_program();
    let out_a =
        allocate_registers(&mut prog_a, &live_a, &device(2), &AllocOptions::default()).unwrap();
    let out_b =
        allocate_registers(&mut prog_b, &live_b, &device(2), &AllocOptions::default()).unwrap();
    assert_eq!(out_a.assignments, out_b.assignments);
    assert_eq!(out_a.units_used, out_b.units_used);
    assert_eq!(out_a.scratch_bytes, out_b.scratch_bytes);
    assert_eq!(prog_a.insts.len(), prog_b.insts.len());
}

#[test]
fn test_degenerate_range_never_spilled() {
    // An empty range gets no competitive spill cost: even under pressure
    // that spills every other register, it stays resident.
    let mut prog = Program::new();
    let v0 = prog.vregs.alloc(1);
    let v1 = prog.vregs.alloc(1);
    let v2 = prog.vregs.alloc(1);
    let v3 = prog.vregs.alloc(1);
    prog.push(def(v1, 1));
    prog.push(def(v2, 1));
    prog.push(def(v3, 1));
    prog.push(def(v0, 1));
    prog.push(read(v1, 1));
    prog.push(read(v2, 1));
    prog.push(read(v3, 1));
    for _ in 0..3 {
        prog.push(nop());
    }
    let live = LiveIntervals::from_ranges(&[(3, 3), (0, 10), (0, 10), (0, 10)]);

    let out = allocate_registers(&mut prog, &live, &device(2), &AllocOptions::default()).unwrap();
    assert!(out.spill_count > 0);
    assert!(!out.assignments[0].is_spilled());
}

#[test]
fn test_no_spill_candidate_is_fatal() {
    // Pressure with no recorded uses: every register has a zero spill
    // cost, so nothing can be chosen and the failure is hard.
    let mut prog = Program::new();
    prog.vregs.alloc(1);
    prog.vregs.alloc(1);
    for _ in 0..4 {
        prog.push(nop());
    }
    let live = LiveIntervals::from_ranges(&[(0, 4), (0, 4)]);

    let err =
        allocate_registers(&mut prog, &live, &device(1), &AllocOptions::default()).unwrap_err();
    assert_eq!(err, RegAllocError::NoSpillCandidate(VirtReg::new(0)));
}

#[test]
fn test_oversized_register_is_rejected() {
    let mut prog = Program::new();
    let v = prog.vregs.alloc(5);
    prog.push(def(v, 5));
    let live = LiveIntervals::from_ranges(&[(0, 1)]);

    let err =
        allocate_registers(&mut prog, &live, &device(16), &AllocOptions::default()).unwrap_err();
    assert_eq!(err, RegAllocError::OversizedVirtReg(VirtReg::new(0)));
}

#[test]
fn test_payload_respected_until_last_use() {
    let mut dev = device(8);
    dev.payload_regs = 2;

    let mut prog = Program::new();
    let v0 = prog.vregs.alloc(2);
    let v1 = prog.vregs.alloc(1);
    // v0 is computed from payload register 1 and is live across its use.
    prog.push(Instruction::alu(wide(v0, 2), &[Operand::fixed(1)]));
    prog.push(nop());
    prog.push(def(v1, 1));
    prog.push(read(v1, 1));
    let live = LiveIntervals::from_ranges(&[(0, 3), (2, 4)]);

    let out = allocate_registers(&mut prog, &live, &dev, &AllocOptions::default()).unwrap();
    // v0 overlaps the payload's lifetime, so it lands above both payload
    // registers even though register 0 is never read.
    assert_eq!(out.assignments[0], Assignment::Reg(2));
    // v1 starts after the payload's last use and may reclaim register 0.
    assert_eq!(out.assignments[1], Assignment::Reg(0));
}

#[test]
fn test_eot_payloads_pinned_to_top_of_file() {
    let mut dev = device(128);
    dev.hazards.split_payload_alias = true;

    let mut prog = Program::new();
    let p0 = prog.vregs.alloc(2);
    let p1 = prog.vregs.alloc(1);
    prog.push(def(p0, 2));
    prog.push(def(p1, 1));
    let mut send = Instruction::send_split(Operand::none(), wide(p0, 2), wide(p1, 1), 1);
    send.eot = true;
    prog.push(send);
    let live = LiveIntervals::from_ranges(&[(0, 3), (1, 3)]);

    let out = allocate_registers(&mut prog, &live, &dev, &AllocOptions::default()).unwrap();
    assert_eq!(out.assignments[0], Assignment::Reg(126));
    assert_eq!(out.assignments[1], Assignment::Reg(125));
}

#[test]
fn test_eot_payload_shifts_below_workaround_register() {
    let mut dev = device(128);
    dev.hazards.send_retaddr_erratum = true;

    let mut prog = Program::new();
    let p0 = prog.vregs.alloc(2);
    prog.push(def(p0, 2));
    let mut send = Instruction::send(Operand::none(), wide(p0, 2));
    send.eot = true;
    prog.push(send);
    let live = LiveIntervals::from_ranges(&[(0, 2)]);

    let out = allocate_registers(&mut prog, &live, &dev, &AllocOptions::default()).unwrap();
    // Register 127 is reserved for the return-address workaround.
    assert_eq!(out.assignments[0], Assignment::Reg(125));
}

#[test]
fn test_narrow_send_destination_avoids_workaround_register() {
    // A payload read keeps registers 0..3 protected, so the send
    // destination's only placement is the top of a four-register file.
    // The return-address erratum forbids exactly that placement for a
    // narrow send writing a virtual destination.
    let run = |flag: bool| {
        let mut dev = device(4);
        dev.payload_regs = 3;
        dev.hazards.send_retaddr_erratum = flag;

        let mut prog = Program::new();
        let d = prog.vregs.alloc(1);
        let p = prog.vregs.alloc(1);
        let mut payload = Operand::fixed(0);
        payload.comps = 3;
        prog.push(Instruction::alu(Operand::none(), &[payload]));
        prog.push(def(p, 1));
        prog.push(Instruction::send(wide(d, 1), wide(p, 1)));
        prog.push(read(d, 1));
        let live = LiveIntervals::from_ranges(&[(0, 4), (1, 3)]);

        let opts = AllocOptions {
            allow_spilling: false,
            ..Default::default()
        };
        allocate_registers(&mut prog, &live, &dev, &opts).map(|out| out.assignments[0])
    };

    assert_eq!(run(false), Ok(Assignment::Reg(3)));
    assert_eq!(
        run(true),
        Err(RegAllocError::SpillingDisallowed(VirtReg::new(0)))
    );
}

#[test]
fn test_src_dst_hazard_separates_operands() {
    // The ranges are disjoint, so without the per-instruction hazard the
    // destination would reuse the source's register.
    let run = |hazard: bool| {
        let mut prog = Program::new();
        let a = prog.vregs.alloc(1);
        let b = prog.vregs.alloc(1);
        prog.push(def(a, 1));
        let mut inst = Instruction::alu(wide(b, 1), &[wide(a, 1)]);
        inst.has_src_dst_hazard = hazard;
        prog.push(inst);
        prog.push(read(b, 1));
        let live = LiveIntervals::from_ranges(&[(0, 1), (1, 3)]);
        let out =
            allocate_registers(&mut prog, &live, &device(4), &AllocOptions::default()).unwrap();
        (out.assignments[0], out.assignments[1])
    };

    let (a, b) = run(false);
    assert_eq!(a, b);
    let (a, b) = run(true);
    assert_ne!(a, b);
}

#[test]
fn test_compressed_write_separates_operands() {
    let run = |flag: bool| {
        let mut dev = device(8);
        dev.hazards.compressed_overwrite = flag;
        let mut prog = Program::new();
        let a = prog.vregs.alloc(1);
        let b = prog.vregs.alloc(2);
        prog.push(def(a, 1));
        // A two-register write retires as two sub-instructions.
        prog.push(Instruction::alu(wide(b, 2), &[wide(a, 1)]));
        prog.push(read(b, 2));
        let live = LiveIntervals::from_ranges(&[(0, 1), (1, 3)]);
        let out = allocate_registers(&mut prog, &live, &dev, &AllocOptions::default()).unwrap();
        (out.assignments[0], out.assignments[1])
    };

    let (a, b) = run(false);
    assert_eq!(a, Assignment::Reg(0));
    assert_eq!(b, Assignment::Reg(0));
    let (a, b) = run(true);
    let (Assignment::Reg(a), Assignment::Reg(b)) = (a, b) else {
        panic!("unexpected spill");
    };
    assert!(spans_disjoint((a, a + 1), (b, b + 2)));
}

#[test]
fn test_split_send_payloads_do_not_alias() {
    let run = |flag: bool| {
        let mut dev = device(8);
        dev.hazards.split_payload_alias = flag;
        let mut prog = Program::new();
        let p0 = prog.vregs.alloc(1);
        let p1 = prog.vregs.alloc(1);
        prog.push(def(p0, 1));
        prog.push(def(p1, 1));
        prog.push(Instruction::send_split(
            Operand::none(),
            wide(p0, 1),
            wide(p1, 1),
            1,
        ));
        // Disjoint ranges: only the aliasing rule can separate them.
        let live = LiveIntervals::from_ranges(&[(0, 1), (1, 3)]);
        let out = allocate_registers(&mut prog, &live, &dev, &AllocOptions::default()).unwrap();
        (out.assignments[0], out.assignments[1])
    };

    let (a, b) = run(false);
    assert_eq!(a, b);
    let (a, b) = run(true);
    assert_ne!(a, b);
}

#[test]
fn test_spill_all_round_trips_every_register() {
    let mut prog = Program::new();
    let v0 = prog.vregs.alloc(1);
    let v1 = prog.vregs.alloc(1);
    let v2 = prog.vregs.alloc(1);
    prog.push(def(v0, 1));
    prog.push(def(v1, 1));
    prog.push(def(v2, 1));
    prog.push(read(v0, 1));
    prog.push(read(v1, 1));
    prog.push(read(v2, 1));
    for _ in 0..4 {
        prog.push(nop());
    }
    let live = LiveIntervals::from_ranges(&[(0, 10), (0, 10), (0, 10)]);

    let opts = AllocOptions {
        spill_all: true,
        ..Default::default()
    };
    // The file is wide enough that no spill is needed; every one here is
    // forced by the option.
    let out = allocate_registers(&mut prog, &live, &device(8), &opts).unwrap();

    let mut offsets = vec![];
    for a in &out.assignments[..3] {
        match *a {
            Assignment::Spilled { offset } => offsets.push(offset),
            Assignment::Reg(_) => panic!("register survived spill-all"),
        }
    }
    offsets.sort_unstable();
    assert_eq!(offsets, [0, 32, 64]);
    assert_eq!(out.spill_count, 3);
    assert_eq!(out.fill_count, 3);
    assert_eq!(out.scratch_bytes, 96);
    for a in &out.assignments[3..] {
        assert!(!a.is_spilled());
    }
}

#[test]
fn test_partial_write_spill_fills_before_store_and_splits_transfers() {
    // A partial write to a spilled register must fill the slot's old
    // contents before the redirected write runs, and a four-register slot
    // moves through scratch in two-register transactions.
    let mut prog = Program::new();
    let v = prog.vregs.alloc(4);
    let mut write = Instruction::alu(wide(v, 4), &[]);
    write.is_partial_write = true;
    prog.push(write);
    prog.push(read(v, 4));
    let live = LiveIntervals::from_ranges(&[(0, 2)]);

    let opts = AllocOptions {
        spill_all: true,
        ..Default::default()
    };
    let out = allocate_registers(&mut prog, &live, &device(16), &opts).unwrap();

    assert_eq!(out.assignments[0], Assignment::Spilled { offset: 0 });
    assert_eq!(out.fill_count, 4);
    assert_eq!(out.spill_count, 2);
    assert_eq!(out.scratch_bytes, 128);

    let ops: Vec<Opcode> = prog.insts.iter().map(|inst| inst.opcode).collect();
    assert_eq!(
        ops,
        [
            Opcode::ScratchLoad { offset: 0 },
            Opcode::ScratchLoad { offset: 64 },
            Opcode::Alu,
            Opcode::ScratchStore { offset: 0 },
            Opcode::ScratchStore { offset: 64 },
            Opcode::ScratchLoad { offset: 0 },
            Opcode::ScratchLoad { offset: 64 },
            Opcode::Alu,
        ]
    );
}

#[test]
fn test_loop_use_protects_register_from_spilling() {
    // a, b and c each have one def and one read, but b's read sits inside
    // a loop and c's inside a conditional. Under pressure the discounted
    // c spills first, then a; the loop-hot b keeps its register.
    let mut prog = Program::new();
    let a = prog.vregs.alloc(1);
    let b = prog.vregs.alloc(1);
    let c = prog.vregs.alloc(1);
    prog.push(def(a, 1));
    prog.push(def(b, 1));
    prog.push(def(c, 1));
    prog.push(Instruction::marker(Opcode::LoopStart));
    prog.push(read(b, 1));
    prog.push(Instruction::marker(Opcode::LoopEnd));
    prog.push(read(a, 1));
    prog.push(Instruction::marker(Opcode::CondStart));
    prog.push(read(c, 1));
    prog.push(Instruction::marker(Opcode::CondEnd));
    let live = LiveIntervals::from_ranges(&[(0, 10), (0, 10), (0, 10)]);

    let out = allocate_registers(&mut prog, &live, &device(2), &AllocOptions::default()).unwrap();
    assert_eq!(out.assignments[2], Assignment::Spilled { offset: 0 });
    assert_eq!(out.assignments[0], Assignment::Spilled { offset: 32 });
    assert_eq!(out.assignments[1], Assignment::Reg(0));
    assert_eq!(out.spill_count, 2);
    assert_eq!(out.fill_count, 2);
}
