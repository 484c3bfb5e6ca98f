/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Data structures for the whole crate: the A32 register and instruction
//! model shared by the analysis and the allocator.

use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;
use std::collections::BTreeSet;
use std::fmt;

//=============================================================================
// Maps and sets

pub type Map<K, V> = FxHashMap<K, V>;
pub type Set<T> = FxHashSet<T>;

//=============================================================================
// Registers.
//
// A register is a single u32, partitioned into six kinds by disjoint numeric
// ranges:
//
//   [0, 16)          physical general-purpose    r0..r15 (sp/lr/pc included)
//   [16, 48)         physical double-vector      d0..d31
//   [48, 64)         physical quad-vector        q0..q15
//   [64, 2^31)       virtual general-purpose
//   [2^31, 3*2^30)   virtual double-vector
//   [3*2^30, 2^32)   virtual quad-vector
//
// Only the general-purpose file is allocated by this crate; the vector
// ranges exist so that instructions mentioning them survive the pass
// untouched.

#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Reg(u32);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RegKind {
  Gp,
  DoubleVec,
  QuadVec,
  VirtGp,
  VirtDoubleVec,
  VirtQuadVec,
}

const REG_DOUBLE_START: u32 = 16;
const REG_QUAD_START: u32 = 48;
const REG_VIRT_GP_START: u32 = 64;
const REG_VIRT_DOUBLE_START: u32 = 1 << 31;
const REG_VIRT_QUAD_START: u32 = 3 << 30;

pub const REG_FP: Reg = Reg(11);
pub const REG_IP: Reg = Reg(12);
pub const REG_SP: Reg = Reg(13);
pub const REG_LR: Reg = Reg(14);
pub const REG_PC: Reg = Reg(15);

/// Clobbered at every call site.
pub const CALLER_SAVED: [Reg; 5] = [Reg(0), Reg(1), Reg(2), Reg(3), Reg(12)];

/// Candidate homes for graph-colored registers; the subset actually used
/// must be saved in the prologue and restored in the epilogue.
pub const CALLEE_SAVED: [Reg; 7] =
  [Reg(4), Reg(5), Reg(6), Reg(7), Reg(8), Reg(9), Reg(10)];

/// Preferred homes for short-lived transients whose live range does not
/// cross a call.  Searched in array order.
pub const TEMP_REGS: [Reg; 5] = [Reg(0), Reg(1), Reg(2), Reg(3), Reg(12)];

impl Reg {
  pub fn phys(n: u32) -> Reg {
    debug_assert!(n < REG_DOUBLE_START);
    Reg(n)
  }

  pub fn virt(n: u32) -> Reg {
    debug_assert!(n < REG_VIRT_DOUBLE_START - REG_VIRT_GP_START);
    Reg(REG_VIRT_GP_START + n)
  }

  pub fn kind(self) -> RegKind {
    if self.0 < REG_DOUBLE_START {
      RegKind::Gp
    } else if self.0 < REG_QUAD_START {
      RegKind::DoubleVec
    } else if self.0 < REG_VIRT_GP_START {
      RegKind::QuadVec
    } else if self.0 < REG_VIRT_DOUBLE_START {
      RegKind::VirtGp
    } else if self.0 < REG_VIRT_QUAD_START {
      RegKind::VirtDoubleVec
    } else {
      RegKind::VirtQuadVec
    }
  }

  /// The zero-based number within the register's own kind.
  pub fn number(self) -> u32 {
    match self.kind() {
      RegKind::Gp => self.0,
      RegKind::DoubleVec => self.0 - REG_DOUBLE_START,
      RegKind::QuadVec => self.0 - REG_QUAD_START,
      RegKind::VirtGp => self.0 - REG_VIRT_GP_START,
      RegKind::VirtDoubleVec => self.0 - REG_VIRT_DOUBLE_START,
      RegKind::VirtQuadVec => self.0 - REG_VIRT_QUAD_START,
    }
  }

  pub fn is_virtual(self) -> bool {
    self.0 >= REG_VIRT_GP_START
  }

  pub fn is_gp_class(self) -> bool {
    match self.kind() {
      RegKind::Gp | RegKind::VirtGp => true,
      _ => false,
    }
  }
}

pub fn make_register(kind: RegKind, num: u32) -> Reg {
  match kind {
    RegKind::Gp => Reg(num),
    RegKind::DoubleVec => Reg(num + REG_DOUBLE_START),
    RegKind::QuadVec => Reg(num + REG_QUAD_START),
    RegKind::VirtGp => Reg(num + REG_VIRT_GP_START),
    RegKind::VirtDoubleVec => Reg(num + REG_VIRT_DOUBLE_START),
    RegKind::VirtQuadVec => Reg(num + REG_VIRT_QUAD_START),
  }
}

impl fmt::Display for Reg {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    if *self == REG_SP {
      return write!(fmt, "sp");
    }
    if *self == REG_LR {
      return write!(fmt, "lr");
    }
    if *self == REG_PC {
      return write!(fmt, "pc");
    }
    let prefix = match self.kind() {
      RegKind::Gp => "r",
      RegKind::DoubleVec => "d",
      RegKind::QuadVec => "q",
      RegKind::VirtGp => "v",
      RegKind::VirtDoubleVec => "vd",
      RegKind::VirtQuadVec => "vq",
    };
    write!(fmt, "{}{}", prefix, self.number())
  }
}

impl fmt::Debug for Reg {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    fmt::Display::fmt(self, fmt)
  }
}

//=============================================================================
// Variable ids, as handed over by the instruction selector.

#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct VarId(pub u32);

impl fmt::Display for VarId {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "${}", self.0)
  }
}

//=============================================================================
// Live intervals.
//
// `start` is the index of the first define, the stored `end` is the index of
// the last read; the live range represented is the half-open
// [start, end + 1).  The overlap test compares the stored fields directly,
// so the two sides of a copy whose source dies at the copy are disjoint --
// which is exactly what copy coalescing keys on.

#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Interval {
  pub start: u32,
  pub end: u32,
}

impl Interval {
  pub fn at(point: u32) -> Interval {
    Interval { start: point, end: point }
  }

  pub fn new(start: u32, end: u32) -> Interval {
    let end = if end < start { start } else { end };
    Interval { start, end }
  }

  pub fn extend_start(&mut self, start: u32) {
    if start < self.start {
      self.start = start;
    }
  }

  pub fn extend_end(&mut self, end: u32) {
    if end > self.end {
      self.end = end;
    }
  }

  pub fn with_start(self, start: u32) -> Interval {
    Interval { start, end: self.end }
  }

  pub fn overlaps(self, other: Interval) -> bool {
    self.end > other.start && self.start < other.end
  }
}

impl fmt::Debug for Interval {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "[{}, {}]", self.start, self.end)
  }
}

//=============================================================================
// Condition codes.

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Cond {
  Eq,
  Ne,
  Cs,
  Cc,
  Hs,
  Ls,
  Hi,
  Lo,
  Mi,
  Pl,
  Vs,
  Vc,
  Ge,
  Lt,
  Gt,
  Le,
  Al,
}

impl Cond {
  /// The logical negation: `invert(c)` holds exactly when `c` does not.
  pub fn invert(self) -> Cond {
    match self {
      Cond::Eq => Cond::Ne,
      Cond::Ne => Cond::Eq,
      Cond::Cs => Cond::Cc,
      Cond::Cc => Cond::Cs,
      Cond::Hs => Cond::Lo,
      Cond::Lo => Cond::Hs,
      Cond::Hi => Cond::Ls,
      Cond::Ls => Cond::Hi,
      Cond::Mi => Cond::Pl,
      Cond::Pl => Cond::Mi,
      Cond::Vs => Cond::Vc,
      Cond::Vc => Cond::Vs,
      Cond::Ge => Cond::Lt,
      Cond::Lt => Cond::Ge,
      Cond::Gt => Cond::Le,
      Cond::Le => Cond::Gt,
      Cond::Al => Cond::Al,
    }
  }

  /// The operand-swap dual: `a <cmp> b` holds iff `b <reverse(cmp)> a`.
  /// Symmetric conditions map to themselves; the bare carry conditions are
  /// flag predicates, not comparisons, and are left fixed.
  pub fn reverse(self) -> Cond {
    match self {
      Cond::Hs => Cond::Ls,
      Cond::Ls => Cond::Hs,
      Cond::Hi => Cond::Lo,
      Cond::Lo => Cond::Hi,
      Cond::Ge => Cond::Le,
      Cond::Le => Cond::Ge,
      Cond::Gt => Cond::Lt,
      Cond::Lt => Cond::Gt,
      other => other,
    }
  }
}

impl fmt::Display for Cond {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    let s = match self {
      Cond::Eq => "eq",
      Cond::Ne => "ne",
      Cond::Cs => "cs",
      Cond::Cc => "cc",
      Cond::Hs => "hs",
      Cond::Ls => "ls",
      Cond::Hi => "hi",
      Cond::Lo => "lo",
      Cond::Mi => "mi",
      Cond::Pl => "pl",
      Cond::Vs => "vs",
      Cond::Vc => "vc",
      Cond::Ge => "ge",
      Cond::Lt => "lt",
      Cond::Gt => "gt",
      Cond::Le => "le",
      // AL is the default and is never printed.
      Cond::Al => "",
    };
    write!(fmt, "{}", s)
  }
}

//=============================================================================
// A32 rotated-immediate encoding check: a value is encodable as an
// `Operand2` immediate iff some even left-rotation of it fits in 8 bits.

pub fn is_valid_immediate(val: u32) -> bool {
  let mut rot = 0;
  while rot < 32 {
    if val.rotate_left(rot) <= 0xff {
      return true;
    }
    rot += 2;
  }
  false
}

//=============================================================================
// Opcodes.

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Op {
  Nop,
  B,
  Bl,
  Bx,
  Cbz,
  Cbnz,
  Mov,
  Movt,
  Mvn,
  Add,
  Sub,
  Rsb,
  Mul,
  Smmul,
  Mla,
  Smmla,
  Sdiv,
  Lsl,
  Lsr,
  Asr,
  And,
  Orr,
  Eor,
  Bic,
  Cmp,
  Cmn,
  Ldr,
  Ldm,
  Str,
  Stm,
  Push,
  Pop,
}

impl fmt::Display for Op {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    let s = match self {
      Op::Nop => "nop",
      Op::B => "b",
      Op::Bl => "bl",
      Op::Bx => "bx",
      Op::Cbz => "cbz",
      Op::Cbnz => "cbnz",
      Op::Mov => "mov",
      Op::Movt => "movt",
      Op::Mvn => "mvn",
      Op::Add => "add",
      Op::Sub => "sub",
      Op::Rsb => "rsb",
      Op::Mul => "mul",
      Op::Smmul => "smmul",
      Op::Mla => "mla",
      Op::Smmla => "smmla",
      Op::Sdiv => "sdiv",
      Op::Lsl => "lsl",
      Op::Lsr => "lsr",
      Op::Asr => "asr",
      Op::And => "and",
      Op::Orr => "orr",
      Op::Eor => "eor",
      Op::Bic => "bic",
      Op::Cmp => "cmp",
      Op::Cmn => "cmn",
      Op::Ldr => "ldr",
      Op::Ldm => "ldm",
      Op::Str => "str",
      Op::Stm => "stm",
      Op::Push => "push",
      Op::Pop => "pop",
    };
    write!(fmt, "{}", s)
  }
}

//=============================================================================
// Operands.

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Shift {
  Lsl,
  Lsr,
  Asr,
  Ror,
  Rrx,
}

impl fmt::Display for Shift {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    let s = match self {
      Shift::Lsl => "LSL",
      Shift::Lsr => "LSR",
      Shift::Asr => "ASR",
      Shift::Ror => "ROR",
      Shift::Rrx => "RRX",
    };
    write!(fmt, "{}", s)
  }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct RegisterOperand {
  pub reg: Reg,
  pub shift: Shift,
  pub amount: u8,
}

impl RegisterOperand {
  pub fn plain(reg: Reg) -> RegisterOperand {
    RegisterOperand { reg, shift: Shift::Lsl, amount: 0 }
  }

  pub fn is_plain(&self) -> bool {
    self.shift == Shift::Lsl && self.amount == 0
  }
}

impl fmt::Display for RegisterOperand {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{}", self.reg)?;
    if !self.is_plain() {
      write!(fmt, ", {}", self.shift)?;
      if self.shift != Shift::Rrx {
        write!(fmt, " #{}", self.amount)?;
      }
    }
    Ok(())
  }
}

/// The flexible second operand of data-processing instructions.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Operand2 {
  Reg(RegisterOperand),
  Imm(i32),
}

impl Operand2 {
  pub fn reg(r: Reg) -> Operand2 {
    Operand2::Reg(RegisterOperand::plain(r))
  }

  pub fn imm(v: i32) -> Operand2 {
    Operand2::Imm(v)
  }
}

impl fmt::Display for Operand2 {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Operand2::Reg(r) => write!(fmt, "{}", r),
      Operand2::Imm(v) => write!(fmt, "#{}", v),
    }
  }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MemOffset {
  Reg(RegisterOperand),
  Imm(i16),
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AddrMode {
  Offset,
  PostIndex,
  PreIndex,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct MemoryOperand {
  pub base: Reg,
  pub offset: MemOffset,
  pub neg_index: bool,
  pub mode: AddrMode,
}

impl MemoryOperand {
  pub fn offset(base: Reg, off: i16) -> MemoryOperand {
    MemoryOperand {
      base,
      offset: MemOffset::Imm(off),
      neg_index: false,
      mode: AddrMode::Offset,
    }
  }

  /// An sp-relative word address, as used for spill slots.
  pub fn sp_offset(off: i32) -> MemoryOperand {
    MemoryOperand::offset(REG_SP, off as i16)
  }
}

impl fmt::Display for MemoryOperand {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    let show_offset = |fmt: &mut fmt::Formatter| match &self.offset {
      MemOffset::Reg(r) => {
        if self.neg_index {
          write!(fmt, "-{}", r)
        } else {
          write!(fmt, "{}", r)
        }
      }
      MemOffset::Imm(v) => write!(fmt, "#{}", v),
    };
    match self.mode {
      AddrMode::Offset => {
        write!(fmt, "[{}, ", self.base)?;
        show_offset(fmt)?;
        write!(fmt, "]")
      }
      AddrMode::PostIndex => {
        write!(fmt, "[{}, ", self.base)?;
        show_offset(fmt)?;
        write!(fmt, "]!")
      }
      AddrMode::PreIndex => {
        write!(fmt, "[{}], ", self.base)?;
        show_offset(fmt)
      }
    }
  }
}

/// A load/store source or target: a literal/label reference, or a register
/// address.
#[derive(Clone, PartialEq, Debug)]
pub enum MemLoc {
  Label(String),
  Mem(MemoryOperand),
}

impl fmt::Display for MemLoc {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      MemLoc::Label(l) => write!(fmt, "{}", l),
      MemLoc::Mem(m) => write!(fmt, "{}", m),
    }
  }
}

#[derive(Clone, PartialEq, Debug)]
pub enum CtrlValue {
  Int(i32),
  Text(String),
}

impl fmt::Display for CtrlValue {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      CtrlValue::Int(v) => write!(fmt, "{}", v),
      CtrlValue::Text(s) => write!(fmt, "{}", s),
    }
  }
}

//=============================================================================
// Instructions.  One variant per shape; the condition code is carried by
// the enclosing `Inst`, so allocator-inserted spills can inherit the
// predicate of the instruction they are emitted around.

#[derive(Clone, PartialEq, Debug)]
pub enum InstKind {
  Pure { op: Op },
  Arith2 { op: Op, r1: Reg, r2: Operand2 },
  Arith3 { op: Op, rd: Reg, r1: Reg, r2: Operand2 },
  Arith4 { op: Op, rd: Reg, r1: Reg, r2: Reg, r3: Reg },
  Br { op: Op, target: String, param_count: usize },
  LoadStore { op: Op, rd: Reg, mem: MemLoc },
  MultLoadStore { op: Op, rn: Reg, regs: Vec<Reg> },
  PushPop { op: Op, regs: BTreeSet<Reg> },
  Label { name: String },
  Ctrl { key: String, value: CtrlValue },
}

#[derive(Clone, PartialEq, Debug)]
pub struct Inst {
  pub kind: InstKind,
  pub cond: Cond,
}

impl Inst {
  pub fn new(kind: InstKind) -> Inst {
    Inst { kind, cond: Cond::Al }
  }

  pub fn with_cond(kind: InstKind, cond: Cond) -> Inst {
    Inst { kind, cond }
  }

  pub fn pure(op: Op) -> Inst {
    Inst::new(InstKind::Pure { op })
  }

  pub fn arith2(op: Op, r1: Reg, r2: Operand2) -> Inst {
    Inst::new(InstKind::Arith2 { op, r1, r2 })
  }

  pub fn arith3(op: Op, rd: Reg, r1: Reg, r2: Operand2) -> Inst {
    Inst::new(InstKind::Arith3 { op, rd, r1, r2 })
  }

  pub fn arith4(op: Op, rd: Reg, r1: Reg, r2: Reg, r3: Reg) -> Inst {
    Inst::new(InstKind::Arith4 { op, rd, r1, r2, r3 })
  }

  pub fn branch(op: Op, target: &str, param_count: usize) -> Inst {
    Inst::new(InstKind::Br { op, target: target.to_string(), param_count })
  }

  pub fn load(rd: Reg, mem: MemoryOperand, cond: Cond) -> Inst {
    Inst::with_cond(
      InstKind::LoadStore { op: Op::Ldr, rd, mem: MemLoc::Mem(mem) },
      cond,
    )
  }

  pub fn store(rd: Reg, mem: MemoryOperand, cond: Cond) -> Inst {
    Inst::with_cond(
      InstKind::LoadStore { op: Op::Str, rd, mem: MemLoc::Mem(mem) },
      cond,
    )
  }

  pub fn push(regs: BTreeSet<Reg>) -> Inst {
    Inst::new(InstKind::PushPop { op: Op::Push, regs })
  }

  pub fn pop(regs: BTreeSet<Reg>) -> Inst {
    Inst::new(InstKind::PushPop { op: Op::Pop, regs })
  }

  pub fn label(name: &str) -> Inst {
    Inst::new(InstKind::Label { name: name.to_string() })
  }

  pub fn ctrl(key: &str, value: CtrlValue) -> Inst {
    Inst::new(InstKind::Ctrl { key: key.to_string(), value })
  }
}

impl fmt::Display for Inst {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    let cond = self.cond;
    match &self.kind {
      InstKind::Pure { op } => write!(fmt, "{}{}", op, cond),
      InstKind::Arith2 { op, r1, r2 } => {
        if *op == Op::Bx {
          write!(fmt, "{}{} {}", op, cond, r1)
        } else {
          write!(fmt, "{}{} {}, {}", op, cond, r1, r2)
        }
      }
      InstKind::Arith3 { op, rd, r1, r2 } => {
        write!(fmt, "{}{} {}, {}, {}", op, cond, rd, r1, r2)
      }
      InstKind::Arith4 { op, rd, r1, r2, r3 } => {
        write!(fmt, "{}{} {}, {}, {}, {}", op, cond, rd, r1, r2, r3)
      }
      InstKind::Br { op, target, .. } => {
        write!(fmt, "{}{} {}", op, cond, target)
      }
      InstKind::LoadStore { op, rd, mem } => {
        write!(fmt, "{}{} {}, {}", op, cond, rd, mem)
      }
      InstKind::MultLoadStore { op, rn, regs } => {
        write!(fmt, "{}{} {}, {{", op, cond, rn)?;
        for (i, r) in regs.iter().enumerate() {
          if i > 0 {
            write!(fmt, ", ")?;
          }
          write!(fmt, "{}", r)?;
        }
        write!(fmt, "}}")
      }
      InstKind::PushPop { op, regs } => {
        write!(fmt, "{}{} {{", op, cond)?;
        for (i, r) in regs.iter().enumerate() {
          if i > 0 {
            write!(fmt, ", ")?;
          }
          write!(fmt, "{}", r)?;
        }
        write!(fmt, "}}")
      }
      InstKind::Label { name } => write!(fmt, "{}:", name),
      InstKind::Ctrl { key, value } => {
        write!(fmt, "@ {}(value={})", key, value)
      }
    }
  }
}

//=============================================================================
// Functions.

#[derive(Clone, Debug)]
pub struct Function {
  pub name: String,
  pub param_count: usize,
  pub insts: Vec<Inst>,
  /// On input, the outgoing stack-argument area reserved by the selector;
  /// after allocation, that plus all spill slots.
  pub stack_size: u32,
  pub is_leaf_func: bool,
}

impl Function {
  pub fn new(name: &str, param_count: usize) -> Function {
    Function {
      name: name.to_string(),
      param_count,
      insts: Vec::new(),
      stack_size: 0,
      is_leaf_func: true,
    }
  }
}

impl fmt::Display for Function {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    writeln!(fmt, "{}:", self.name)?;
    for inst in &self.insts {
      match inst.kind {
        InstKind::Label { .. } => writeln!(fmt, "{}", inst)?,
        _ => writeln!(fmt, "\t{}", inst)?,
      }
    }
    Ok(())
  }
}

//=============================================================================
// Label conventions.  Basic-block labels carry their block id after the
// last '$'; `.ld_pc` labels mark pc-relative constant loads and interact
// with the constant-pool emitter (see the rewriter's swap at that label).

pub fn format_bb_label(func_name: &str, bb_id: u32) -> String {
  format!(".bb_{}${}", func_name, bb_id)
}

/// Parse the block id out of a `.bb_<name>$<id>` label.  Returns `None` for
/// labels of any other shape, including `.bb_` labels with an unparsable id
/// (which callers report and then treat as opaque).
pub fn parse_bb_label(label: &str) -> Option<u32> {
  if !label.starts_with(".bb_") {
    return None;
  }
  let dollar = label.rfind('$')?;
  label[dollar + 1..].parse::<u32>().ok()
}
