/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Liveness and call-site analysis: a single forward pass over a function's
//! instruction list that computes a live interval per register, counts
//! assignments, records call sites and block-label positions, and collects
//! `mov` copy-affinity candidates for the coalescer.

use log::{info, warn};
use std::collections::{BTreeMap, BTreeSet};

use crate::data_structures::{
  parse_bb_label, Function, InstKind, Interval, Map, MemLoc, MemOffset,
  MemoryOperand, Op, Operand2, Reg,
};

/// The result of the analysis pass, consumed by the linear-scan allocator.
pub struct Liveness {
  /// Live interval per register (physical registers included).
  pub intervals: Map<Reg, Interval>,
  /// How many times each register is written.
  pub assign_count: Map<Reg, u32>,
  /// `(dst, src)` pairs from unshifted register `mov`s, in program order,
  /// first copy wins per destination.
  pub affinities: Vec<(Reg, Reg)>,
  /// Instruction indices of `bl` instructions.
  pub bl_points: BTreeSet<u32>,
  /// Instruction index of each `.bb_` label, keyed by index, value is the
  /// parsed block id.
  pub block_starts: BTreeMap<u32, u32>,
}

impl Liveness {
  pub fn empty() -> Liveness {
    Liveness {
      intervals: Map::default(),
      assign_count: Map::default(),
      affinities: Vec::new(),
      bl_points: BTreeSet::new(),
      block_starts: BTreeMap::new(),
    }
  }

  fn read(&mut self, reg: Reg, point: u32) {
    match self.intervals.get_mut(&reg) {
      Some(interval) => interval.extend_end(point),
      None => {
        self.intervals.insert(reg, Interval::at(point));
      }
    }
  }

  fn write(&mut self, reg: Reg, point: u32) {
    match self.intervals.get_mut(&reg) {
      Some(interval) => interval.extend_start(point),
      None => {
        self.intervals.insert(reg, Interval::at(point));
      }
    }
    *self.assign_count.entry(reg).or_insert(0) += 1;
  }

  fn read_operand2(&mut self, op2: &Operand2, point: u32) {
    if let Operand2::Reg(r) = op2 {
      self.read(r.reg, point);
    }
  }

  fn read_mem(&mut self, mem: &MemoryOperand, point: u32) {
    self.read(mem.base, point);
    if let MemOffset::Reg(r) = &mem.offset {
      self.read(r.reg, point);
    }
  }

  fn record_affinity(&mut self, dst: Reg, src: Reg) {
    if self.affinities.iter().any(|&(d, _)| d == dst) {
      return;
    }
    self.affinities.push((dst, src));
  }
}

/// Walk the instruction list once, classifying each operand as a read or a
/// write per the instruction's shape.
pub fn analyze(func: &Function) -> Liveness {
  info!("analysis: begin ({})", func.name);
  let mut lv = Liveness::empty();

  for (i, inst) in func.insts.iter().enumerate() {
    let i = i as u32;
    match &inst.kind {
      InstKind::Pure { .. } => {}
      InstKind::Arith4 { rd, r1, r2, r3, .. } => {
        lv.read(*r1, i);
        lv.read(*r2, i);
        lv.read(*r3, i);
        lv.write(*rd, i);
      }
      InstKind::Arith3 { rd, r1, r2, .. } => {
        lv.read(*r1, i);
        lv.read_operand2(r2, i);
        lv.write(*rd, i);
      }
      InstKind::Arith2 { op, r1, r2 } => match op {
        Op::Mov | Op::Mvn => {
          lv.write(*r1, i);
          lv.read_operand2(r2, i);
          if *op == Op::Mov {
            if let Operand2::Reg(ro) = r2 {
              if ro.is_plain() && r1.is_gp_class() && ro.reg.is_gp_class() {
                lv.record_affinity(*r1, ro.reg);
              }
            }
          }
        }
        Op::Movt => {
          // movt modifies only the high half; the low half flows through.
          lv.read(*r1, i);
          lv.write(*r1, i);
          lv.read_operand2(r2, i);
        }
        _ => {
          lv.read(*r1, i);
          lv.read_operand2(r2, i);
        }
      },
      InstKind::Br { op, .. } => {
        if *op == Op::Bl {
          lv.bl_points.insert(i);
        }
      }
      InstKind::LoadStore { op, rd, mem } => {
        if *op == Op::Ldr {
          lv.write(*rd, i);
        } else {
          lv.read(*rd, i);
        }
        if let MemLoc::Mem(m) = mem {
          lv.read_mem(m, i);
        }
      }
      InstKind::MultLoadStore { op, rn, regs } => {
        if *op == Op::Ldm {
          for rd in regs {
            lv.write(*rd, i);
          }
        } else {
          for rd in regs {
            lv.read(*rd, i);
          }
        }
        lv.read(*rn, i);
      }
      InstKind::PushPop { op, regs } => {
        // Deliberately inverted relative to the architectural semantics:
        // the only push/pop are the prologue/epilogue skeleton, whose
        // register lists are rewritten after the scan, and this keeps the
        // saved registers out of the entry/exit live ranges.
        if *op == Op::Push {
          for rd in regs {
            lv.write(*rd, i);
          }
        } else {
          for rd in regs {
            lv.read(*rd, i);
          }
        }
      }
      InstKind::Label { name } => {
        if name.starts_with(".bb_") {
          match parse_bb_label(name) {
            Some(id) => {
              lv.block_starts.insert(i, id);
            }
            None => {
              warn!("malformed block label treated as opaque: {}", name);
            }
          }
        }
      }
      InstKind::Ctrl { .. } => {}
    }
  }

  info!(
    "analysis: end ({} intervals, {} calls, {} blocks)",
    lv.intervals.len(),
    lv.bl_points.len(),
    lv.block_starts.len()
  );
  lv
}
