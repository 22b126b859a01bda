/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Briggs-style optimistic graph-coloring allocator.
//!
//! The driver is a small state machine: build the interference graph,
//! attempt a coloring, and on failure pick a spill candidate, rewrite its
//! uses through scratch memory, and rebuild. Spilling mutates the
//! instruction stream (fills and spills are inserted around every use), so
//! the graph is reconstructed from scratch after every spill; the loop is
//! bounded because each iteration permanently removes one spillable
//! virtual register from contention.

use crate::coloring::{ColorGraph, RegClassSet};
use crate::ir::{Operand, Program, RegFile, REG_BYTES};
use crate::liveness::LiveIntervals;
use crate::{AllocOutput, Assignment, DeviceLimits, Node, RegAllocError, VirtReg};
use hashbrown::HashMap;
use rustc_hash::FxBuildHasher;

pub(crate) mod interference;
pub(crate) mod spill;

pub(crate) struct RegAlloc<'a, G: ColorGraph> {
    prog: &'a mut Program,
    live: &'a LiveIntervals,
    dev: &'a DeviceLimits,
    g: &'a mut G,
    classes: RegClassSet,

    /// Number of ip-owning instructions; constant across spill rewrites.
    live_ip_count: i32,

    payload_node_count: u32,
    payload_last_use: Vec<i32>,
    first_vreg_node: usize,
    /// Workaround node pinned to the top of the file, when the device
    /// carries the send return-address erratum.
    grf_end_node: Option<Node>,

    /// Virtual registers present before any spilling; everything at or
    /// past this index is a spill temporary.
    orig_vreg_count: usize,
    /// Scratch byte offset per spilled register.
    spilled: HashMap<VirtReg, u32, FxBuildHasher>,
    /// The ip each spill temporary serves; index is relative to
    /// `orig_vreg_count`. Grows monotonically so temporary indices stay
    /// valid across rebuilds.
    spill_temp_ip: Vec<i32>,

    last_scratch: u32,
    spill_count: u32,
    fill_count: u32,
    have_spill_costs: bool,
}

impl<'a, G: ColorGraph> RegAlloc<'a, G> {
    pub(crate) fn new(
        prog: &'a mut Program,
        live: &'a LiveIntervals,
        dev: &'a DeviceLimits,
        g: &'a mut G,
    ) -> Result<Self, RegAllocError> {
        debug_assert!(dev.reg_unit >= 1);
        debug_assert!(dev.spill_max_regs >= 1);
        debug_assert!(dev.payload_units() <= dev.unit_capacity());
        debug_assert!(live.count() >= prog.vregs.count());

        let classes = RegClassSet::new(dev.unit_capacity(), dev.class_count());
        for i in 0..prog.vregs.count() {
            let v = VirtReg::new(i);
            let units = prog.vregs.size_units(v, dev.reg_unit);
            if classes.class_for_units(units).is_none() {
                return Err(RegAllocError::OversizedVirtReg(v));
            }
        }

        let live_ip_count = prog.ip_count() as i32;
        let orig_vreg_count = prog.vregs.count();
        Ok(RegAlloc {
            prog,
            live,
            dev,
            g,
            classes,
            live_ip_count,
            payload_node_count: dev.payload_units(),
            payload_last_use: vec![],
            first_vreg_node: 0,
            grf_end_node: None,
            orig_vreg_count,
            spilled: HashMap::default(),
            spill_temp_ip: vec![],
            last_scratch: 0,
            spill_count: 0,
            fill_count: 0,
            have_spill_costs: false,
        })
    }

    #[inline(always)]
    fn node(&self, v: VirtReg) -> Node {
        Node::new(self.first_vreg_node + v.index())
    }

    #[inline(always)]
    fn is_spill_temp(&self, v: VirtReg) -> bool {
        v.index() >= self.orig_vreg_count
    }

    /// The register the coloring engine could not place. Pinned nodes are
    /// never popped during select, so a failure always lands on a virtual
    /// register (possibly a spill temporary).
    fn failed_vreg(&self) -> VirtReg {
        match self.g.failed_node() {
            Some(n) if n.index() >= self.first_vreg_node => {
                VirtReg::new(n.index() - self.first_vreg_node)
            }
            _ => VirtReg::invalid(),
        }
    }

    /// Live range of `v`: the oracle's for ordinary registers, the
    /// recorded one-instruction window for spill temporaries.
    fn vreg_range(&self, v: VirtReg) -> (i32, i32) {
        if self.is_spill_temp(v) {
            let ip = self.spill_temp_ip[v.index() - self.orig_vreg_count];
            (ip - 1, ip + 1)
        } else {
            (self.live.start(v), self.live.end(v))
        }
    }

    pub(crate) fn run(
        mut self,
        allow_spilling: bool,
        spill_all: bool,
    ) -> Result<AllocOutput, RegAllocError> {
        self.build_interference_graph();

        let mut spills = 0usize;
        loop {
            // Debug of register spilling: go spill everything up front.
            if spill_all {
                if let Some(reg) = self.choose_spill_reg() {
                    trace!("spill-all: spilling {}", reg);
                    self.spill_reg(reg);
                    self.build_interference_graph();
                    continue;
                }
            }

            // Costs must be on the nodes before coloring: the simplify
            // phase uses them to decide which node to optimistically
            // remove, and that choice steers which register spills next.
            if !self.have_spill_costs {
                self.set_spill_costs();
                self.have_spill_costs = true;
            }

            if self.g.allocate() {
                break;
            }

            if !allow_spilling {
                self.dump_on_failure();
                return Err(RegAllocError::SpillingDisallowed(self.failed_vreg()));
            }

            let reg = match self.choose_spill_reg() {
                Some(reg) => reg,
                None => {
                    self.dump_on_failure();
                    return Err(RegAllocError::NoSpillCandidate(self.failed_vreg()));
                }
            };
            self.spill_reg(reg);
            spills += 1;
            // Each spill removes one register from contention for good.
            debug_assert!(spills <= self.orig_vreg_count);
            self.build_interference_graph();
        }

        Ok(self.finish())
    }

    /// Translate colors into physical registers and rewrite every operand.
    fn finish(self) -> AllocOutput {
        let reg_unit = self.dev.reg_unit;
        let count = self.prog.vregs.count();
        let mut hw_map = vec![0u32; count];
        let mut assignments = Vec::with_capacity(count);
        let mut units_used = self.payload_node_count;

        for i in 0..count {
            let v = VirtReg::new(i);
            if let Some(&offset) = self.spilled.get(&v) {
                assignments.push(Assignment::Spilled { offset });
                continue;
            }
            let color = self.g.assigned_reg(self.node(v));
            hw_map[i] = reg_unit * color;
            units_used = units_used.max(color + self.prog.vregs.size_units(v, reg_unit));
            assignments.push(Assignment::Reg(hw_map[i]));
        }

        for inst in &mut self.prog.insts {
            assign_reg(&mut inst.dst, &hw_map);
            for src in &mut inst.srcs {
                assign_reg(src, &hw_map);
            }
        }

        trace!(
            "allocation done: {} units used, {} scratch bytes",
            units_used,
            self.last_scratch
        );
        AllocOutput {
            assignments,
            units_used,
            scratch_bytes: self.last_scratch,
            spill_count: self.spill_count,
            fill_count: self.fill_count,
        }
    }

    fn dump_on_failure(&self) {
        if trace_enabled!() {
            trace!("allocation infeasible; instruction stream so far:");
            for (i, inst) in self.prog.insts.iter().enumerate() {
                trace!("{:4}: {:?}", i, inst);
            }
        }
    }
}

fn assign_reg(op: &mut Operand, hw_map: &[u32]) {
    if op.file == RegFile::Virt {
        op.nr = hw_map[op.nr as usize] + op.offset / REG_BYTES;
        op.offset %= REG_BYTES;
        op.file = RegFile::Fixed;
    }
}
