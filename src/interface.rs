/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! The top level interface for the allocator library.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;

use crate::data_structures::{Function, Reg, VarId};
use crate::linear_scan::RegAllocator;

// Re-export the model types a client needs to build input and inspect
// output.

pub use crate::data_structures::{
  format_bb_label, is_valid_immediate, make_register, parse_bb_label,
  AddrMode, Cond, CtrlValue, Inst, InstKind, Interval, Map, MemLoc,
  MemOffset, MemoryOperand, Op, Operand2, RegKind, RegisterOperand, Set,
  Shift, CALLEE_SAVED, CALLER_SAVED, REG_FP, REG_IP, REG_LR, REG_PC, REG_SP,
  TEMP_REGS,
};

/// The per-function variable-to-virtual-register map produced by the
/// instruction selector.  Ordered, because iteration order decides spill
/// slot assignment and the output must be deterministic.
pub type VarMap = BTreeMap<VarId, Reg>;

/// The graph-coloring result: `Some(c)` assigns `CALLEE_SAVED[c]`, `None`
/// marks the variable as spilled cross-block.  Variables absent from the
/// map are purely local and allocated online.
pub type ColorMap = BTreeMap<VarId, Option<u32>>;

/// Per-pass switches, threaded into the allocator as a plain value.
#[derive(Clone, Debug)]
pub struct AllocOptions {
  /// Run copy-affinity coalescing before the scan.
  pub coalesce: bool,
  /// Render the active set into `OutOfRegisters` errors.
  pub dump_on_error: bool,
}

impl Default for AllocOptions {
  fn default() -> AllocOptions {
    AllocOptions { coalesce: true, dump_on_error: true }
  }
}

/// Allocation failures.  Anything else (evictions, spills, promotions) is a
/// normal operation, not an error.
#[derive(Clone, Debug)]
pub enum AllocError {
  /// Every physical register in both pools is pinned and nothing can be
  /// evicted.  Not recoverable; `dump` renders the active set.
  OutOfRegisters { dump: String },

  /// A construct the rewriter does not support (the selector must not emit
  /// it).
  NotImplemented(&'static str),
}

impl fmt::Display for AllocError {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      AllocError::OutOfRegisters { dump } => {
        if dump.is_empty() {
          write!(fmt, "failed to allocate: all active registers are pinned")
        } else {
          write!(
            fmt,
            "failed to allocate: all active registers are pinned\ndump:\n{}",
            dump
          )
        }
      }
      AllocError::NotImplemented(what) => {
        write!(fmt, "not implemented: {}", what)
      }
    }
  }
}

impl Error for AllocError {}

/// Allocate registers for one function.
///
/// On success, `func.insts` holds the rewritten list in which every operand
/// is a physical register, `func.stack_size` has grown by the spill area,
/// and `func.is_leaf_func` records whether any call was seen.  Functions
/// are independent; an outer driver may allocate them in parallel.
pub fn allocate_registers(
  func: &mut Function, var_map: &VarMap, coloring: &ColorMap,
  opts: &AllocOptions,
) -> Result<(), AllocError> {
  RegAllocator::new(func, var_map, coloring, opts).run()
}
