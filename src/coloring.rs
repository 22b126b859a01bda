/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Pluggable graph-coloring engine.
//!
//! The allocator driver talks to the coloring engine only through the
//! [`ColorGraph`] trait, so a different engine (e.g. one with smarter
//! class handling) can be swapped in. The default [`SimplifySelect`]
//! engine is the classic scheme: repeatedly remove trivially colorable
//! nodes onto a stack, optimistically removing the node with the worst
//! spill-cost-to-degree ratio when none is trivial, then pop the stack
//! assigning each node the lowest legal base register not blocked by an
//! already-colored neighbor.
//!
//! Colors are contiguous base offsets in a flat register file: a node of
//! size `s` may be placed at any base `b` with `b + s <= capacity`, and
//! two nodes overlap iff their `[base, base + size)` ranges intersect.

use crate::{Node, RegUnit};
use hashbrown::HashSet;
use rustc_hash::FxBuildHasher;
use smallvec::SmallVec;

/// A register class: all contiguous placements of one allocation size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeClass {
    size: u32,
}

impl SizeClass {
    /// Size of members of this class, in allocation units.
    #[inline(always)]
    pub fn size(self) -> u32 {
        self.size
    }
}

/// The catalog of register classes for one register file: one class per
/// allocation size `1..=max_size`, each containing every base offset `o`
/// with `o + size <= capacity`.
#[derive(Clone, Copy, Debug)]
pub struct RegClassSet {
    capacity: u32,
    max_size: u32,
}

impl RegClassSet {
    pub fn new(capacity: u32, max_size: u32) -> Self {
        debug_assert!(max_size >= 1 && max_size <= capacity);
        RegClassSet { capacity, max_size }
    }

    /// File capacity in allocation units.
    #[inline(always)]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn class_for_units(&self, units: u32) -> Option<SizeClass> {
        if units >= 1 && units <= self.max_size {
            Some(SizeClass { size: units })
        } else {
            None
        }
    }

    /// Number of legal base offsets for the class.
    #[inline(always)]
    pub fn placements(&self, class: SizeClass) -> u32 {
        self.capacity - class.size + 1
    }
}

/// Contract between the allocation driver and a coloring engine.
///
/// The driver rebuilds the graph from scratch after every spill, so an
/// engine must support `clear()` without losing its class catalog. Spill
/// costs default to the non-competitive 0.0, which marks a node
/// unspillable; `best_spill_candidate` must never return such a node.
pub trait ColorGraph {
    /// Drop all nodes and edges, keeping the register-class catalog.
    fn clear(&mut self);

    /// Append a node; indices are dense and assigned in call order.
    fn add_node(&mut self, class: SizeClass) -> Node;

    /// Make two nodes interfere. Self- and duplicate edges are ignored.
    fn add_edge(&mut self, a: Node, b: Node);

    /// Force a node to a specific base register. Pinned nodes are never
    /// simplified, spilled, or recolored.
    fn pin_node(&mut self, n: Node, reg: RegUnit);

    fn set_spill_cost(&mut self, n: Node, cost: f32);

    /// Attempt a full coloring. Returns false if some node ended up with
    /// no legal base register.
    fn allocate(&mut self) -> bool;

    /// The most profitable node to spill, or `None` when every candidate
    /// is unspillable. After a failed `allocate()`, spillable nodes that
    /// were optimistically removed during simplification take priority.
    fn best_spill_candidate(&self) -> Option<Node>;

    /// The node the last `allocate()` left without a legal base register,
    /// or `None` if it succeeded.
    fn failed_node(&self) -> Option<Node>;

    /// The base register chosen for `n` by the last successful
    /// `allocate()` (or set by `pin_node`).
    fn assigned_reg(&self, n: Node) -> RegUnit;
}

#[derive(Clone, Debug)]
struct NodeData {
    size: u32,
    adjacent: SmallVec<[Node; 8]>,
    pin: Option<RegUnit>,
    reg: Option<RegUnit>,
    spill_cost: f32,
    /// Currently removed from the graph (on the select stack).
    removed: bool,
    /// Removed optimistically, i.e. a potential spill.
    optimistic: bool,
    /// Upper bound on the number of placements blocked by the node's
    /// still-present neighbors.
    q_total: u32,
}

/// The default coloring engine.
#[derive(Clone, Debug)]
pub struct SimplifySelect {
    classes: RegClassSet,
    nodes: Vec<NodeData>,
    edges: HashSet<(u32, u32), FxBuildHasher>,
    stack: Vec<Node>,
    failed: Option<Node>,
}

/// A size-`b` neighbor can block at most `a + b - 1` placements of a
/// size-`a` node.
#[inline(always)]
fn blocking(a: u32, b: u32) -> u32 {
    a + b - 1
}

impl SimplifySelect {
    pub fn new(classes: RegClassSet) -> Self {
        SimplifySelect {
            classes,
            nodes: vec![],
            edges: HashSet::default(),
            stack: vec![],
            failed: None,
        }
    }

    fn ranges_overlap(base_a: u32, size_a: u32, base_b: u32, size_b: u32) -> bool {
        base_a < base_b + size_b && base_b < base_a + size_a
    }

    /// Lowest legal base for node `i` not blocked by a colored or pinned
    /// neighbor, treating nodes still on the stack as absent.
    fn lowest_free_base(&self, i: usize) -> Option<u32> {
        let size = self.nodes[i].size;
        let placements = self.classes.placements(SizeClass { size });
        'bases: for base in 0..placements {
            for &j in &self.nodes[i].adjacent {
                let nb = &self.nodes[j.index()];
                if nb.removed {
                    continue;
                }
                if let Some(r) = nb.reg {
                    if Self::ranges_overlap(base, size, r, nb.size) {
                        continue 'bases;
                    }
                }
            }
            return Some(base);
        }
        None
    }

    fn remove_node(&mut self, i: usize, optimistic: bool) {
        self.nodes[i].removed = true;
        self.nodes[i].optimistic = optimistic;
        self.stack.push(Node::new(i));
        let adj_len = self.nodes[i].adjacent.len();
        for k in 0..adj_len {
            let j = self.nodes[i].adjacent[k].index();
            if !self.nodes[j].removed && self.nodes[j].pin.is_none() {
                let b = blocking(self.nodes[j].size, self.nodes[i].size);
                self.nodes[j].q_total -= b;
            }
        }
    }
}

impl ColorGraph for SimplifySelect {
    fn clear(&mut self) {
        self.nodes.clear();
        self.edges.clear();
        self.stack.clear();
        self.failed = None;
    }

    fn add_node(&mut self, class: SizeClass) -> Node {
        let n = Node::new(self.nodes.len());
        self.nodes.push(NodeData {
            size: class.size(),
            adjacent: SmallVec::new(),
            pin: None,
            reg: None,
            spill_cost: 0.0,
            removed: false,
            optimistic: false,
            q_total: 0,
        });
        n
    }

    fn add_edge(&mut self, a: Node, b: Node) {
        if a == b {
            return;
        }
        let key = (a.raw_u32().min(b.raw_u32()), a.raw_u32().max(b.raw_u32()));
        if self.edges.insert(key) {
            self.nodes[a.index()].adjacent.push(b);
            self.nodes[b.index()].adjacent.push(a);
        }
    }

    fn pin_node(&mut self, n: Node, reg: RegUnit) {
        debug_assert!(reg + self.nodes[n.index()].size <= self.classes.capacity());
        self.nodes[n.index()].pin = Some(reg);
        self.nodes[n.index()].reg = Some(reg);
    }

    fn set_spill_cost(&mut self, n: Node, cost: f32) {
        self.nodes[n.index()].spill_cost = cost;
    }

    fn allocate(&mut self) -> bool {
        // Reset per-attempt state; pinned nodes keep their register.
        self.failed = None;
        let mut unpinned = 0;
        for i in 0..self.nodes.len() {
            let q: u32 = self.nodes[i]
                .adjacent
                .iter()
                .map(|j| blocking(self.nodes[i].size, self.nodes[j.index()].size))
                .sum();
            let nd = &mut self.nodes[i];
            nd.reg = nd.pin;
            nd.removed = false;
            nd.optimistic = false;
            nd.q_total = q;
            if nd.pin.is_none() {
                unpinned += 1;
            }
        }
        self.stack.clear();

        // Simplify. Scans are in index order so the outcome is a pure
        // function of the graph contents.
        while self.stack.len() < unpinned {
            let mut trivial = None;
            for (i, nd) in self.nodes.iter().enumerate() {
                if nd.removed || nd.pin.is_some() {
                    continue;
                }
                let placements = self.classes.placements(SizeClass { size: nd.size });
                if nd.q_total < placements {
                    trivial = Some(i);
                    break;
                }
            }

            match trivial {
                Some(i) => self.remove_node(i, false),
                None => {
                    // No trivially colorable node left: optimistically
                    // remove the one cheapest to spill per unit of
                    // interference, and remember it as a spill candidate.
                    let mut best = None;
                    let mut best_ratio = f32::INFINITY;
                    for (i, nd) in self.nodes.iter().enumerate() {
                        if nd.removed || nd.pin.is_some() {
                            continue;
                        }
                        let ratio = nd.spill_cost / nd.q_total as f32;
                        if ratio < best_ratio {
                            best_ratio = ratio;
                            best = Some(i);
                        }
                    }
                    match best {
                        Some(i) => self.remove_node(i, true),
                        // All remaining ratios are NaN-free and finite or
                        // infinite, so this only happens on an empty set.
                        None => break,
                    }
                }
            }
        }

        // Select.
        while let Some(n) = self.stack.pop() {
            let i = n.index();
            self.nodes[i].removed = false;
            match self.lowest_free_base(i) {
                Some(base) => self.nodes[i].reg = Some(base),
                None => {
                    trace!("coloring failed at node {:?}", n);
                    self.failed = Some(n);
                    return false;
                }
            }
        }
        true
    }

    fn best_spill_candidate(&self) -> Option<Node> {
        // Prefer the nodes optimistically removed by the last allocate();
        // they are where coloring actually came apart. When none of them
        // can be spilled (they may all be spill temporaries), fall back to
        // every unpinned node so remaining pressure from ordinary
        // registers can still be relieved.
        let restrict = self
            .nodes
            .iter()
            .any(|nd| nd.optimistic && nd.spill_cost > 0.0);

        let mut best = None;
        let mut best_ratio = 0.0f32;
        for (i, nd) in self.nodes.iter().enumerate() {
            if nd.pin.is_some() || (restrict && !nd.optimistic) {
                continue;
            }
            if !(nd.spill_cost > 0.0) {
                continue;
            }
            let benefit: u32 = nd
                .adjacent
                .iter()
                .map(|j| blocking(nd.size, self.nodes[j.index()].size))
                .sum();
            let ratio = benefit as f32 / nd.spill_cost;
            if best.is_none() || ratio > best_ratio {
                best_ratio = ratio;
                best = Some(Node::new(i));
            }
        }
        best
    }

    fn failed_node(&self) -> Option<Node> {
        self.failed
    }

    fn assigned_reg(&self, n: Node) -> RegUnit {
        self.nodes[n.index()]
            .reg
            .expect("assigned_reg called before a successful allocate()")
    }
}
