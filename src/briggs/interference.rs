/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Interference-graph construction.
//!
//! Node layout is fixed per build: one pinned node per payload unit at
//! the bottom of the file, an optional pinned workaround node at the top,
//! then one node per virtual register in id order. Spilled registers keep
//! their node so indices stay aligned with the register table; with no
//! edges they color trivially and cost nothing.

use crate::coloring::ColorGraph;
use crate::ir::{Instruction, Opcode, VirtRegTable, REG_BYTES};
use crate::liveness;
use crate::{DeviceLimits, Node, VirtReg};

use super::RegAlloc;

impl<'a, G: ColorGraph> RegAlloc<'a, G> {
    pub(super) fn build_interference_graph(&mut self) {
        self.g.clear();
        self.have_spill_costs = false;

        let unit_class = self
            .classes
            .class_for_units(1)
            .expect("a size-1 register class always exists");

        for i in 0..self.payload_node_count {
            let n = self.g.add_node(unit_class);
            self.g.pin_node(n, i);
        }

        // Messages narrower than the full execution width must not have
        // their return address clobbered by the destination write; keep the
        // top register of the file out of such destinations by pinning a
        // node there and making those destinations interfere with it.
        self.grf_end_node = if self.dev.hazards.send_retaddr_erratum {
            let n = self.g.add_node(unit_class);
            self.g.pin_node(n, self.dev.unit_capacity() - 1);
            Some(n)
        } else {
            None
        };

        self.first_vreg_node =
            self.payload_node_count as usize + self.grf_end_node.is_some() as usize;

        for i in 0..self.prog.vregs.count() {
            let units = self.prog.vregs.size_units(VirtReg::new(i), self.dev.reg_unit);
            let class = self
                .classes
                .class_for_units(units)
                .expect("register sizes validated against the class catalog");
            let n = self.g.add_node(class);
            debug_assert_eq!(n.index(), self.first_vreg_node + i);
        }

        self.payload_last_use =
            liveness::payload_last_use(self.prog, self.payload_node_count, self.dev.reg_unit);

        for i in 0..self.prog.vregs.count() {
            let v = VirtReg::new(i);
            if self.spilled.contains_key(&v) {
                continue;
            }
            self.setup_live_interference(v);
        }

        let g = &mut *self.g;
        let prog = &*self.prog;
        for inst in &prog.insts {
            setup_inst_interference(
                g,
                self.dev,
                self.grf_end_node,
                self.first_vreg_node,
                &prog.vregs,
                inst,
            );
        }
    }

    /// Range-overlap edges for `v` against the payload and every
    /// lower-numbered live register.
    fn setup_live_interference(&mut self, v: VirtReg) {
        let node = self.node(v);
        let (start, end) = self.vreg_range(v);

        // A payload register is clobbered by whatever lands on top of it,
        // so anything live before its last read must stay off it.
        for u in 0..self.payload_last_use.len() {
            let last_use = self.payload_last_use[u];
            if last_use == -1 {
                continue;
            }
            if start <= last_use {
                self.g.add_edge(node, Node::new(u));
            }
        }

        let v_is_temp = self.is_spill_temp(v);
        for other in self.first_vreg_node..node.index() {
            let v2 = VirtReg::new(other - self.first_vreg_node);
            if self.spilled.contains_key(&v2) {
                continue;
            }
            // Temporaries from different instructions may share a
            // register even though their bracketing ranges touch; only
            // temporaries serving the same ip truly conflict.
            if v_is_temp && self.is_spill_temp(v2) {
                if self.vreg_range(v2).0 == start {
                    self.g.add_edge(node, Node::new(other));
                }
                continue;
            }
            let (start2, end2) = self.vreg_range(v2);
            if !(end <= start2 || end2 <= start) {
                self.g.add_edge(node, Node::new(other));
            }
        }
    }
}

/// Edges and pins implied by a single instruction, independent of live
/// ranges.
fn setup_inst_interference<G: ColorGraph>(
    g: &mut G,
    dev: &DeviceLimits,
    grf_end_node: Option<Node>,
    first_vreg_node: usize,
    vregs: &VirtRegTable,
    inst: &Instruction,
) {
    let node = |v: VirtReg| Node::new(first_vreg_node + v.index());

    if let Some(dst) = inst.dst.vreg() {
        // Certain operations read sources after the destination write has
        // begun; overlap would corrupt the sources.
        if inst.has_src_dst_hazard {
            for src in &inst.srcs {
                if let Some(s) = src.vreg() {
                    if s != dst {
                        g.add_edge(node(dst), node(s));
                    }
                }
            }
        }

        // A write spanning more than one physical register retires its
        // halves separately, so the first half can clobber a source still
        // pending for the second.
        if dev.hazards.compressed_overwrite && inst.dst.byte_span(inst.exec_width) > REG_BYTES {
            for src in &inst.srcs {
                if let Some(s) = src.vreg() {
                    if s != dst {
                        g.add_edge(node(dst), node(s));
                    }
                }
            }
        }

        if let Some(end) = grf_end_node {
            if inst.exec_width < 16 && inst.is_send_from_grf() {
                g.add_edge(node(dst), end);
            }
        }
    }

    // The two payload halves of a split send are addressed as one
    // contiguous block by some decoders; keep them from overlapping.
    if dev.hazards.split_payload_alias && inst.opcode == Opcode::Send && inst.ex_mlen > 0 {
        let p0 = inst.srcs.first().and_then(|s| s.vreg());
        let p1 = inst.srcs.get(1).and_then(|s| s.vreg());
        if let (Some(p0), Some(p1)) = (p0, p1) {
            if p0 != p1 {
                g.add_edge(node(p0), node(p1));
            }
        }
    }

    // A terminating message's payload must sit in the high registers of
    // the file, below the workaround register when one is reserved.
    if inst.eot {
        if let Some(p0) = inst.srcs.first().and_then(|s| s.vreg()) {
            let size = vregs.size_units(p0, dev.reg_unit);
            let mut reg = dev.unit_capacity() - size;
            if grf_end_node.is_some() {
                reg -= 1;
            }
            g.pin_node(node(p0), reg);

            if inst.ex_mlen > 0 {
                if let Some(p1) = inst.srcs.get(1).and_then(|s| s.vreg()) {
                    reg -= vregs.size_units(p1, dev.reg_unit);
                    g.pin_node(node(p1), reg);
                }
            }
        }
    }
}
