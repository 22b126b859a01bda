/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Graph-coloring register allocator for SIMD shader backends.
//!
//! The allocator maps an unbounded set of virtual registers produced by
//! earlier compilation stages onto a bounded, physically addressed register
//! file, spilling to scratch memory when pressure exceeds capacity. The
//! input is a flat, basic-block structured instruction stream plus live
//! ranges supplied by an external liveness oracle; the output is the same
//! stream with every virtual-register operand rewritten to a physical
//! register, together with the file high-water mark and spill statistics.
//!
//! The coloring engine itself is pluggable (see [`coloring::ColorGraph`]);
//! the default is a classic simplify/select engine with optimistic spill
//! selection.

// Detailed logging, gated on the `trace-log` feature so release builds of
// enclosing compilers don't pay for the formatting.
macro_rules! trace {
    ($($tt:tt)*) => {
        if cfg!(feature = "trace-log") {
            ::log::trace!($($tt)*);
        }
    };
}

macro_rules! trace_enabled {
    () => {
        cfg!(feature = "trace-log") && ::log::log_enabled!(::log::Level::Trace)
    };
}

#[macro_use]
mod index;
pub use index::{Node, VirtReg};

pub mod coloring;
pub mod ir;
pub mod liveness;

pub(crate) mod briggs;

use crate::coloring::{ColorGraph, RegClassSet, SimplifySelect};
use crate::ir::Program;
use crate::liveness::LiveIntervals;

/// A physical register-file index, in allocation units.
pub type RegUnit = u32;

/// Generation-specific interference rules, keyed off explicit capability
/// flags rather than hard-coded device checks.
#[derive(Clone, Copy, Debug, Default)]
pub struct HazardFlags {
    /// The top register of the file must not be used as a message return
    /// address when a narrow send has destination/source overlap. Reserves
    /// a pinned workaround node at the top of the file.
    pub send_retaddr_erratum: bool,
    /// A destination spanning more than one register executes as two
    /// lockstep sub-instructions; a one-register misalignment would let the
    /// first sub-instruction clobber data the second still reads.
    pub compressed_overwrite: bool,
    /// The two payload blocks of a split send must not alias.
    pub split_payload_alias: bool,
}

/// Immutable description of one device's register file, passed explicitly
/// into each allocator run. Sizes are in physical registers; allocation
/// happens in units of `reg_unit` contiguous physical registers.
#[derive(Clone, Copy, Debug)]
pub struct DeviceLimits {
    /// Number of physical registers in the file.
    pub file_regs: u32,
    /// Allocation granularity: physical registers per allocation unit.
    pub reg_unit: u32,
    /// Physical registers pre-loaded with shader inputs at dispatch.
    pub payload_regs: u32,
    /// Largest virtual register the allocator must place, in physical
    /// registers.
    pub max_vreg_regs: u32,
    /// Largest single scratch load/store transaction, in physical
    /// registers. Larger transfers are split.
    pub spill_max_regs: u32,
    pub hazards: HazardFlags,
}

impl DeviceLimits {
    /// Register-file capacity in allocation units.
    pub fn unit_capacity(&self) -> u32 {
        self.file_regs / self.reg_unit
    }

    /// Number of allocation units covered by the dispatch payload.
    pub fn payload_units(&self) -> u32 {
        self.payload_regs.div_ceil(self.reg_unit)
    }

    /// Number of register classes (one per allocation size 1..=K).
    pub fn class_count(&self) -> u32 {
        self.max_vreg_regs.div_ceil(self.reg_unit)
    }
}

impl Default for DeviceLimits {
    fn default() -> Self {
        DeviceLimits {
            file_regs: 128,
            reg_unit: 1,
            payload_regs: 0,
            max_vreg_regs: 16,
            spill_max_regs: 2,
            hazards: HazardFlags::default(),
        }
    }
}

/// Options for one allocator run.
#[derive(Clone, Copy, Debug)]
pub struct AllocOptions {
    /// Whether the allocator may rewrite virtual registers through scratch
    /// memory when coloring fails. When false, pressure failures are fatal.
    pub allow_spilling: bool,
    /// Debug mode: spill every spillable register before the first coloring
    /// attempt, to stress the spill path.
    pub spill_all: bool,
}

impl Default for AllocOptions {
    fn default() -> Self {
        AllocOptions {
            allow_spilling: true,
            spill_all: false,
        }
    }
}

/// Final placement of one virtual register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Assignment {
    /// Resident: base physical register of the assigned contiguous range.
    Reg(u32),
    /// Routed through scratch memory at the given byte offset.
    Spilled { offset: u32 },
}

impl Assignment {
    pub fn is_spilled(self) -> bool {
        matches!(self, Assignment::Spilled { .. })
    }
}

/// The result of a successful run. The instruction stream itself is
/// rewritten in place.
#[derive(Clone, Debug)]
pub struct AllocOutput {
    /// Placement per virtual register, indexed by `VirtReg`. Covers the
    /// spill temporaries appended during the run.
    pub assignments: Vec<Assignment>,
    /// Register-file high-water mark, in allocation units.
    pub units_used: u32,
    /// Scratch memory consumed by spilled registers, in bytes.
    pub scratch_bytes: u32,
    /// Number of scratch store instructions synthesized.
    pub spill_count: u32,
    /// Number of scratch load instructions synthesized.
    pub fill_count: u32,
}

/// An error that prevents allocation. No partial result is usable; the
/// (possibly rewritten) instruction stream is retained only for debug
/// dumps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegAllocError {
    /// Coloring failed and spilling is disallowed by the caller. Carries
    /// the register (possibly a spill temporary) left without a placement.
    SpillingDisallowed(VirtReg),
    /// Coloring failed and every remaining candidate is unspillable (e.g.
    /// all remaining pressure comes from spill temporaries). Carries the
    /// register left without a placement.
    NoSpillCandidate(VirtReg),
    /// A virtual register is larger than the largest register class.
    OversizedVirtReg(VirtReg),
}

impl core::fmt::Display for RegAllocError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            RegAllocError::SpillingDisallowed(v) => {
                write!(
                    f,
                    "register pressure too high at {} and spilling is disallowed",
                    v
                )
            }
            RegAllocError::NoSpillCandidate(v) => {
                write!(
                    f,
                    "register pressure too high at {} and no spillable register remains",
                    v
                )
            }
            RegAllocError::OversizedVirtReg(v) => {
                write!(
                    f,
                    "virtual register {:?} exceeds the largest register class",
                    v
                )
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for RegAllocError {}

/// Run the allocator with the default simplify/select coloring engine.
pub fn allocate_registers(
    prog: &mut Program,
    live: &LiveIntervals,
    dev: &DeviceLimits,
    opts: &AllocOptions,
) -> Result<AllocOutput, RegAllocError> {
    let classes = RegClassSet::new(dev.unit_capacity(), dev.class_count());
    let mut g = SimplifySelect::new(classes);
    allocate_registers_with(prog, live, dev, opts, &mut g)
}

/// Run the allocator with a caller-supplied coloring engine.
pub fn allocate_registers_with<G: ColorGraph>(
    prog: &mut Program,
    live: &LiveIntervals,
    dev: &DeviceLimits,
    opts: &AllocOptions,
    g: &mut G,
) -> Result<AllocOutput, RegAllocError> {
    briggs::RegAlloc::new(prog, live, dev, g)?.run(opts.allow_spilling, opts.spill_all)
}
