/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Checker: verifies that the rewritten code is fully physical and that
//! spills/reloads retain the dataflow of the original, virtual-register
//! code.
//!
//! The second half is a small A32 interpreter over the instruction subset
//! the allocator handles.  It honors virtual registers, so the same machine
//! can execute a function before allocation (virtual operands, no spill
//! code) and after (physical operands, spill slots, patched frame); if both
//! runs produce the same architectural effects -- the return value in r0
//! and the stores outside the stack -- the allocation preserved the
//! program's meaning.  Calls are modeled as a deterministic clobber of the
//! caller-saved file, so both runs see identical call behavior.

use rustc_hash::FxHashMap;

use crate::data_structures::{
  AddrMode, Cond, Inst, InstKind, MemLoc, MemOffset, MemoryOperand, Op,
  Operand2, Reg, RegisterOperand, Shift, CALLER_SAVED, REG_LR, REG_PC,
  REG_SP,
};

//=============================================================================
// Structural check: no virtual operand survives allocation.

fn each_reg(inst: &Inst, visit: &mut dyn FnMut(Reg)) {
  let visit_op2 = |op2: &Operand2, visit: &mut dyn FnMut(Reg)| {
    if let Operand2::Reg(r) = op2 {
      visit(r.reg);
    }
  };
  let visit_mem = |mem: &MemLoc, visit: &mut dyn FnMut(Reg)| {
    if let MemLoc::Mem(m) = mem {
      visit(m.base);
      if let MemOffset::Reg(r) = &m.offset {
        visit(r.reg);
      }
    }
  };
  match &inst.kind {
    InstKind::Pure { .. } | InstKind::Br { .. } | InstKind::Label { .. }
    | InstKind::Ctrl { .. } => {}
    InstKind::Arith2 { r1, r2, .. } => {
      visit(*r1);
      visit_op2(r2, visit);
    }
    InstKind::Arith3 { rd, r1, r2, .. } => {
      visit(*rd);
      visit(*r1);
      visit_op2(r2, visit);
    }
    InstKind::Arith4 { rd, r1, r2, r3, .. } => {
      visit(*rd);
      visit(*r1);
      visit(*r2);
      visit(*r3);
    }
    InstKind::LoadStore { rd, mem, .. } => {
      visit(*rd);
      visit_mem(mem, visit);
    }
    InstKind::MultLoadStore { rn, regs, .. } => {
      visit(*rn);
      for r in regs {
        visit(*r);
      }
    }
    InstKind::PushPop { regs, .. } => {
      for r in regs {
        visit(*r);
      }
    }
  }
}

/// Check that every operand of every instruction is a physical register.
/// Returns the first offending register.
pub fn check_no_virtuals(insts: &[Inst]) -> Result<(), Reg> {
  for inst in insts {
    let mut bad = None;
    each_reg(inst, &mut |r| {
      if bad.is_none() && r.is_virtual() {
        bad = Some(r);
      }
    });
    if let Some(r) = bad {
      return Err(r);
    }
  }
  Ok(())
}

//=============================================================================
// The interpreter.

const STACK_TOP: u32 = 0x8000_0000;
const STACK_SIZE: u32 = 0x1_0000;
const RETURN_SENTINEL: u32 = 0xdead_beef;

/// An observable run: the returned r0 and all stores that escaped the
/// stack.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RunResult {
  pub r0: u32,
  pub stores: Vec<(u32, u32)>,
}

#[derive(Clone, Copy, Default)]
struct Flags {
  n: bool,
  z: bool,
  c: bool,
  v: bool,
}

pub struct Machine {
  regs: FxHashMap<Reg, u32>,
  mem: FxHashMap<u32, u32>,
  flags: Flags,
  stores: Vec<(u32, u32)>,
  call_count: u32,
}

impl Machine {
  pub fn new() -> Machine {
    let mut regs = FxHashMap::default();
    regs.insert(REG_SP, STACK_TOP);
    regs.insert(REG_LR, RETURN_SENTINEL);
    Machine {
      regs,
      mem: FxHashMap::default(),
      flags: Flags::default(),
      stores: Vec::new(),
      call_count: 0,
    }
  }

  /// Preset a register, e.g. an incoming argument.
  pub fn set_reg(&mut self, r: Reg, val: u32) {
    self.regs.insert(r, val);
  }

  fn get(&self, r: Reg) -> u32 {
    self.regs.get(&r).copied().unwrap_or(0)
  }

  fn set(&mut self, r: Reg, val: u32) {
    self.regs.insert(r, val);
  }

  fn eval_shifted(&self, ro: &RegisterOperand) -> u32 {
    let v = self.get(ro.reg);
    let amt = ro.amount as u32;
    match ro.shift {
      Shift::Lsl => v.wrapping_shl(amt),
      Shift::Lsr => {
        if amt == 0 {
          v
        } else {
          v.wrapping_shr(amt)
        }
      }
      Shift::Asr => (v as i32).wrapping_shr(amt) as u32,
      Shift::Ror => v.rotate_right(amt),
      Shift::Rrx => ((self.flags.c as u32) << 31) | (v >> 1),
    }
  }

  fn eval_op2(&self, op2: &Operand2) -> u32 {
    match op2 {
      Operand2::Reg(ro) => self.eval_shifted(ro),
      Operand2::Imm(v) => *v as u32,
    }
  }

  fn mem_addr(&self, m: &MemoryOperand) -> Result<u32, String> {
    if m.mode != AddrMode::Offset {
      return Err("indexed addressing not modeled".to_string());
    }
    let base = self.get(m.base);
    let off = match &m.offset {
      MemOffset::Imm(v) => *v as i32,
      MemOffset::Reg(ro) => {
        let v = self.eval_shifted(ro) as i32;
        if m.neg_index {
          -v
        } else {
          v
        }
      }
    };
    Ok(base.wrapping_add(off as u32))
  }

  fn in_stack(addr: u32) -> bool {
    addr >= STACK_TOP - STACK_SIZE && addr <= STACK_TOP
  }

  fn store(&mut self, addr: u32, val: u32) {
    self.mem.insert(addr, val);
    if !Machine::in_stack(addr) {
      self.stores.push((addr, val));
    }
  }

  fn cond_holds(&self, cond: Cond) -> bool {
    let f = self.flags;
    match cond {
      Cond::Eq => f.z,
      Cond::Ne => !f.z,
      Cond::Cs | Cond::Hs => f.c,
      Cond::Cc | Cond::Lo => !f.c,
      Cond::Mi => f.n,
      Cond::Pl => !f.n,
      Cond::Vs => f.v,
      Cond::Vc => !f.v,
      Cond::Hi => f.c && !f.z,
      Cond::Ls => !f.c || f.z,
      Cond::Ge => f.n == f.v,
      Cond::Lt => f.n != f.v,
      Cond::Gt => !f.z && f.n == f.v,
      Cond::Le => f.z || f.n != f.v,
      Cond::Al => true,
    }
  }

  fn set_cmp_flags(&mut self, a: u32, b: u32) {
    let res = a.wrapping_sub(b);
    self.flags.n = (res as i32) < 0;
    self.flags.z = res == 0;
    self.flags.c = a >= b;
    self.flags.v = ((a ^ b) & (a ^ res)) >> 31 != 0;
  }

  /// A `bl` clobbers the caller-saved file with values derived from the
  /// call ordinal, so two runs with the same call sequence agree.
  fn do_call(&mut self) {
    let n = self.call_count;
    self.call_count += 1;
    for (k, &r) in CALLER_SAVED.iter().enumerate() {
      self.set(r, 0xc10b_0000 ^ (n << 8) ^ k as u32);
    }
    self.set(REG_LR, 0xc10b_0000 ^ (n << 8) ^ 0xff);
  }

  /// Deterministic pseudo-value for a literal-pool load.
  fn label_value(label: &str) -> u32 {
    label.bytes().fold(0x811c_9dc5u32, |h, b| {
      (h ^ b as u32).wrapping_mul(0x0100_0193)
    })
  }

  /// Execute `insts` until the function returns (pop into pc, `bx lr` to
  /// the return sentinel, or falling off the end) or `fuel` instructions
  /// have run.
  pub fn run(&mut self, insts: &[Inst], fuel: usize) -> Result<RunResult, String> {
    let mut labels = FxHashMap::default();
    for (i, inst) in insts.iter().enumerate() {
      if let InstKind::Label { name } = &inst.kind {
        labels.insert(name.clone(), i);
      }
    }

    let mut pc = 0usize;
    let mut steps = 0usize;
    while pc < insts.len() {
      steps += 1;
      if steps > fuel {
        return Err("out of fuel".to_string());
      }
      let inst = &insts[pc];
      pc += 1;
      if !self.cond_holds(inst.cond) {
        continue;
      }
      match &inst.kind {
        InstKind::Pure { .. } | InstKind::Label { .. }
        | InstKind::Ctrl { .. } => {}
        InstKind::Arith2 { op, r1, r2 } => match op {
          Op::Mov => {
            let v = self.eval_op2(r2);
            self.set(*r1, v);
          }
          Op::Mvn => {
            let v = !self.eval_op2(r2);
            self.set(*r1, v);
          }
          Op::Movt => {
            let v = self.eval_op2(r2);
            let old = self.get(*r1);
            self.set(*r1, (old & 0xffff) | (v << 16));
          }
          Op::Cmp => {
            let a = self.get(*r1);
            let b = self.eval_op2(r2);
            self.set_cmp_flags(a, b);
          }
          Op::Cmn => {
            let a = self.get(*r1);
            let b = self.eval_op2(r2).wrapping_neg();
            self.set_cmp_flags(a, b);
          }
          Op::Bx => {
            if self.get(*r1) == RETURN_SENTINEL {
              break;
            }
            return Err("bx to a non-return target".to_string());
          }
          _ => return Err(format!("unmodeled arith2 op {}", op)),
        },
        InstKind::Arith3 { op, rd, r1, r2 } => {
          let a = self.get(*r1);
          let b = self.eval_op2(r2);
          let res = match op {
            Op::Add => a.wrapping_add(b),
            Op::Sub => a.wrapping_sub(b),
            Op::Rsb => b.wrapping_sub(a),
            Op::Mul => a.wrapping_mul(b),
            Op::Smmul => {
              ((a as i32 as i64).wrapping_mul(b as i32 as i64) >> 32) as u32
            }
            Op::Sdiv => {
              if b == 0 {
                0
              } else {
                (a as i32).wrapping_div(b as i32) as u32
              }
            }
            Op::Lsl => a.wrapping_shl(b),
            Op::Lsr => a.wrapping_shr(b),
            Op::Asr => (a as i32).wrapping_shr(b) as u32,
            Op::And => a & b,
            Op::Orr => a | b,
            Op::Eor => a ^ b,
            Op::Bic => a & !b,
            _ => return Err(format!("unmodeled arith3 op {}", op)),
          };
          self.set(*rd, res);
        }
        InstKind::Arith4 { op, rd, r1, r2, r3 } => {
          let a = self.get(*r1);
          let b = self.get(*r2);
          let c = self.get(*r3);
          let res = match op {
            Op::Mla => a.wrapping_mul(b).wrapping_add(c),
            Op::Smmla => c.wrapping_add(
              ((a as i32 as i64).wrapping_mul(b as i32 as i64) >> 32) as u32,
            ),
            _ => return Err(format!("unmodeled arith4 op {}", op)),
          };
          self.set(*rd, res);
        }
        InstKind::LoadStore { op, rd, mem } => match mem {
          MemLoc::Label(l) => {
            if *op == Op::Ldr {
              let v = Machine::label_value(l);
              self.set(*rd, v);
            } else {
              return Err("store to a label".to_string());
            }
          }
          MemLoc::Mem(m) => {
            let addr = self.mem_addr(m)?;
            if *op == Op::Ldr {
              let v = self.mem.get(&addr).copied().unwrap_or(0);
              self.set(*rd, v);
            } else {
              let v = self.get(*rd);
              self.store(addr, v);
            }
          }
        },
        InstKind::MultLoadStore { .. } => {
          return Err("ldm/stm not modeled".to_string());
        }
        InstKind::PushPop { op, regs } => {
          if *op == Op::Push {
            let sp = self.get(REG_SP).wrapping_sub(4 * regs.len() as u32);
            self.set(REG_SP, sp);
            for (k, &r) in regs.iter().enumerate() {
              let v = self.get(r);
              self.store(sp.wrapping_add(4 * k as u32), v);
            }
          } else {
            let sp = self.get(REG_SP);
            let mut saw_pc = false;
            for (k, &r) in regs.iter().enumerate() {
              let addr = sp.wrapping_add(4 * k as u32);
              let v = self.mem.get(&addr).copied().unwrap_or(0);
              if r == REG_PC {
                saw_pc = true;
              } else {
                self.set(r, v);
              }
            }
            self.set(REG_SP, sp.wrapping_add(4 * regs.len() as u32));
            if saw_pc {
              break;
            }
          }
        }
        InstKind::Br { op, target, .. } => match op {
          Op::Bl => self.do_call(),
          Op::B => match labels.get(target) {
            Some(&idx) => pc = idx,
            None => return Err(format!("branch to unknown label {}", target)),
          },
          _ => return Err(format!("unmodeled branch op {}", op)),
        },
      }
    }

    Ok(RunResult { r0: self.get(Reg::phys(0)), stores: self.stores.clone() })
  }
}
