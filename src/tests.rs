/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Test suite: unit tests for the model, plus end-to-end allocation
//! scenarios checked structurally and by interpreting the function before
//! and after allocation and comparing the architectural effects.

use std::collections::BTreeSet;

use crate::checker::{check_no_virtuals, Machine};
use crate::data_structures::{
  format_bb_label, is_valid_immediate, parse_bb_label, Cond, CtrlValue,
  Function, Inst, InstKind, Interval, MemLoc, MemoryOperand, Op, Operand2,
  Reg, RegKind, REG_FP, REG_IP, REG_LR, REG_PC, REG_SP,
};
use crate::interface::{
  allocate_registers, AllocError, AllocOptions, ColorMap, VarMap,
};

mod test_utils {
  use super::*;
  use crate::data_structures::VarId;

  pub fn v(n: u32) -> Reg {
    Reg::virt(n)
  }

  pub fn r(n: u32) -> Reg {
    Reg::phys(n)
  }

  pub fn mov(rd: Reg, src: Operand2) -> Inst {
    Inst::arith2(Op::Mov, rd, src)
  }

  pub fn add(rd: Reg, r1: Reg, r2: Operand2) -> Inst {
    Inst::arith3(Op::Add, rd, r1, r2)
  }

  pub fn regset(regs: &[Reg]) -> BTreeSet<Reg> {
    regs.iter().copied().collect()
  }

  /// Wrap a body in the skeleton the selector hands over:
  /// `push {fp, lr}; mov fp, sp; <body>; mov sp, fp; pop {fp, pc}`.
  pub fn with_skeleton(
    name: &str, param_count: usize, body: Vec<Inst>,
  ) -> Function {
    let mut f = Function::new(name, param_count);
    f.insts.push(Inst::push(regset(&[REG_FP, REG_LR])));
    f.insts.push(mov(REG_FP, Operand2::reg(REG_SP)));
    f.insts.extend(body);
    f.insts.push(mov(REG_SP, Operand2::reg(REG_FP)));
    f.insts.push(Inst::pop(regset(&[REG_FP, REG_PC])));
    f
  }

  pub fn alloc(f: &mut Function) {
    alloc_with(f, &VarMap::new(), &ColorMap::new());
  }

  pub fn alloc_with(f: &mut Function, var_map: &VarMap, coloring: &ColorMap) {
    let _ = pretty_env_logger::try_init();
    allocate_registers(f, var_map, coloring, &AllocOptions::default())
      .unwrap_or_else(|err| panic!("allocation failed: {}", err));
    if let Err(reg) = check_no_virtuals(&f.insts) {
      panic!("virtual register {} survived allocation:\n{}", reg, f);
    }
  }

  /// A one-variable map marking the variable spilled cross-block.
  pub fn cross_block(vreg: Reg) -> (VarMap, ColorMap) {
    let mut vm = VarMap::new();
    vm.insert(VarId(0), vreg);
    let mut cm = ColorMap::new();
    cm.insert(VarId(0), None);
    (vm, cm)
  }

  /// A one-variable map coloring the variable with `CALLEE_SAVED[color]`.
  pub fn colored(vreg: Reg, color: u32) -> (VarMap, ColorMap) {
    let mut vm = VarMap::new();
    vm.insert(VarId(0), vreg);
    let mut cm = ColorMap::new();
    cm.insert(VarId(0), Some(color));
    (vm, cm)
  }

  /// Run both versions with the same incoming arguments and require the
  /// same observable effects.
  pub fn check_equivalent(
    before: &Function, after: &Function, args: &[(Reg, u32)],
  ) {
    let mut m1 = Machine::new();
    let mut m2 = Machine::new();
    for &(reg, val) in args {
      m1.set_reg(reg, val);
      m2.set_reg(reg, val);
    }
    let r1 = m1
      .run(&before.insts, 100_000)
      .unwrap_or_else(|e| panic!("before-run failed: {}\n{}", e, before));
    let r2 = m2
      .run(&after.insts, 100_000)
      .unwrap_or_else(|e| panic!("after-run failed: {}\n{}", e, after));
    assert_eq!(r1, r2, "before:\n{}\nafter:\n{}", before, after);
  }

  pub fn position<F: Fn(&Inst) -> bool>(insts: &[Inst], pred: F) -> usize {
    match insts.iter().position(|i| pred(i)) {
      Some(p) => p,
      None => panic!("expected instruction not found"),
    }
  }

  pub fn count<F: Fn(&Inst) -> bool>(insts: &[Inst], pred: F) -> usize {
    insts.iter().filter(|i| pred(i)).count()
  }

  pub fn is_str(inst: &Inst) -> bool {
    matches!(inst.kind, InstKind::LoadStore { op: Op::Str, .. })
  }

  pub fn is_ldr(inst: &Inst) -> bool {
    matches!(inst.kind, InstKind::LoadStore { op: Op::Ldr, .. })
  }

  pub fn push_regs(f: &Function) -> BTreeSet<Reg> {
    match &f.insts.first() {
      Some(Inst { kind: InstKind::PushPop { op: Op::Push, regs }, .. }) => {
        regs.clone()
      }
      _ => panic!("function does not start with a push"),
    }
  }

  pub fn pop_regs(f: &Function) -> BTreeSet<Reg> {
    match &f.insts.last() {
      Some(Inst { kind: InstKind::PushPop { op: Op::Pop, regs }, .. }) => {
        regs.clone()
      }
      _ => panic!("function does not end with a pop"),
    }
  }
}

use test_utils::*;

//=============================================================================
// Model unit tests.

#[test]
fn interval_basics() {
  let mut iv = Interval::at(4);
  assert_eq!(iv, Interval::new(4, 4));
  iv.extend_end(7);
  iv.extend_start(2);
  assert_eq!(iv, Interval::new(2, 7));
  iv.extend_end(5); // no shrink
  iv.extend_start(3);
  assert_eq!(iv, Interval::new(2, 7));
  assert_eq!(iv.with_start(6), Interval::new(6, 7));
  // new() clamps an inverted range
  assert_eq!(Interval::new(9, 3), Interval::new(9, 9));

  assert!(Interval::new(0, 5).overlaps(Interval::new(4, 8)));
  assert!(Interval::new(4, 8).overlaps(Interval::new(0, 5)));
  assert!(!Interval::new(0, 3).overlaps(Interval::new(3, 8)));
  // A copy at point 3 whose source dies there and whose dest is born
  // there: disjoint, which is what coalescing relies on.
  assert!(!Interval::new(3, 5).overlaps(Interval::new(0, 3)));
  // Empty intervals never overlap, not even themselves.
  assert!(!Interval::at(3).overlaps(Interval::at(3)));
}

#[test]
fn register_model() {
  assert!(!r(0).is_virtual());
  assert!(!r(15).is_virtual());
  assert!(v(0).is_virtual());
  assert_eq!(r(5).kind(), RegKind::Gp);
  assert_eq!(v(9).kind(), RegKind::VirtGp);
  assert_eq!(v(9).number(), 9);
  assert!(r(3).is_gp_class() && v(3).is_gp_class());
  let d7 = crate::data_structures::make_register(RegKind::DoubleVec, 7);
  assert_eq!(d7.kind(), RegKind::DoubleVec);
  assert_eq!(d7.number(), 7);
  assert!(!d7.is_gp_class());

  assert_eq!(format!("{}", REG_SP), "sp");
  assert_eq!(format!("{}", REG_LR), "lr");
  assert_eq!(format!("{}", REG_PC), "pc");
  assert_eq!(format!("{}", REG_FP), "r11");
  assert_eq!(format!("{}", v(3)), "v3");
  assert_eq!(format!("{}", d7), "d7");
}

#[test]
fn rotated_immediates() {
  assert!(is_valid_immediate(0));
  assert!(is_valid_immediate(255));
  assert!(is_valid_immediate(256)); // 0x1 ror 24
  assert!(!is_valid_immediate(257)); // nine significant bits
  assert!(is_valid_immediate(0xff00_0000));
  assert!(is_valid_immediate(0xf000_000f)); // wraps around
  assert!(!is_valid_immediate(0x0000_0102)); // needs an odd rotation
  assert!(!is_valid_immediate(0x0001_0001));
  // Every 4-aligned value below 1024 must be encodable, which is what the
  // frame patcher's threshold relies on.
  let mut k = 0;
  while k < 1024 {
    assert!(is_valid_immediate(k));
    k += 4;
  }
}

#[test]
fn condition_tables() {
  let all = [
    Cond::Eq,
    Cond::Ne,
    Cond::Cs,
    Cond::Cc,
    Cond::Hs,
    Cond::Ls,
    Cond::Hi,
    Cond::Lo,
    Cond::Mi,
    Cond::Pl,
    Cond::Vs,
    Cond::Vc,
    Cond::Ge,
    Cond::Lt,
    Cond::Gt,
    Cond::Le,
    Cond::Al,
  ];
  for &c in all.iter() {
    assert_eq!(c.invert().invert(), c);
    assert_eq!(c.reverse().reverse(), c);
  }
  assert_eq!(Cond::Lt.reverse(), Cond::Gt);
  assert_eq!(Cond::Ge.reverse(), Cond::Le);
  assert_eq!(Cond::Hs.reverse(), Cond::Ls);
  assert_eq!(Cond::Hi.reverse(), Cond::Lo);
  assert_eq!(Cond::Eq.reverse(), Cond::Eq);
  assert_eq!(Cond::Cs.reverse(), Cond::Cs);
  assert_eq!(Cond::Mi.invert(), Cond::Pl);
  assert_eq!(Cond::Hs.invert(), Cond::Lo);
  assert_eq!(Cond::Al.invert(), Cond::Al);
}

#[test]
fn block_labels() {
  assert_eq!(parse_bb_label(".bb_main$7"), Some(7));
  assert_eq!(parse_bb_label(&format_bb_label("f", 12)), Some(12));
  assert_eq!(parse_bb_label(".bb_main$x7"), None);
  assert_eq!(parse_bb_label(".bb_main"), None);
  assert_eq!(parse_bb_label(".ld_pc_0"), None);
}

#[test]
fn liveness_small_function() {
  let f = with_skeleton(
    "f",
    1,
    vec![
      mov(v(0), Operand2::reg(r(0))),
      add(v(1), v(0), Operand2::imm(1)),
      Inst::branch(Op::Bl, "g", 0),
      Inst::label(&format_bb_label("f", 1)),
      mov(r(0), Operand2::reg(v(1))),
    ],
  );
  let lv = crate::analysis::analyze(&f);
  // v0 defined at 2, last read at 3.
  assert_eq!(lv.intervals[&v(0)], Interval::new(2, 3));
  // v1 defined at 3, last read at 6.
  assert_eq!(lv.intervals[&v(1)], Interval::new(3, 6));
  assert_eq!(lv.assign_count[&v(1)], 1);
  assert!(lv.bl_points.contains(&4));
  assert_eq!(lv.block_starts.get(&5), Some(&1));
  // Copies recorded in program order: fp<-sp from the skeleton, then the
  // two from the body.
  assert_eq!(lv.affinities[0], (REG_FP, REG_SP));
  assert!(lv.affinities.contains(&(v(0), r(0))));
  assert!(lv.affinities.contains(&(r(0), v(1))));
}

#[test]
fn malformed_block_label_is_opaque() {
  let f = with_skeleton(
    "f",
    0,
    vec![Inst::label(".bb_f$oops"), mov(r(0), Operand2::imm(0))],
  );
  let lv = crate::analysis::analyze(&f);
  assert!(lv.block_starts.is_empty());
}

#[test]
fn checker_rejects_virtuals() {
  let insts = vec![add(v(0), r(1), Operand2::imm(1))];
  assert_eq!(check_no_virtuals(&insts), Err(v(0)));
}

//=============================================================================
// Interpreter sanity.

#[test]
fn machine_arithmetic_and_predicates() {
  let mut m = Machine::new();
  let prog = vec![
    mov(r(0), Operand2::imm(5)),
    Inst::arith2(Op::Cmp, r(0), Operand2::imm(3)),
    Inst::with_cond(
      InstKind::Arith2 { op: Op::Mov, r1: r(1), r2: Operand2::imm(1) },
      Cond::Gt,
    ),
    Inst::with_cond(
      InstKind::Arith2 { op: Op::Mov, r1: r(1), r2: Operand2::imm(9) },
      Cond::Le,
    ),
    Inst::arith3(Op::Mul, r(2), r(0), Operand2::reg(r(1))),
    add(r(0), r(2), Operand2::imm(2)),
  ];
  let res = m.run(&prog, 1000).unwrap();
  // 5 > 3, so r1 = 1, r2 = 5, r0 = 7.
  assert_eq!(res.r0, 7);
}

#[test]
fn machine_stack_roundtrip() {
  let mut m = Machine::new();
  let prog = vec![
    Inst::arith3(Op::Sub, REG_SP, REG_SP, Operand2::imm(16)),
    mov(r(0), Operand2::imm(42)),
    Inst::store(r(0), MemoryOperand::sp_offset(8), Cond::Al),
    mov(r(0), Operand2::imm(0)),
    Inst::load(r(1), MemoryOperand::sp_offset(8), Cond::Al),
    mov(r(0), Operand2::reg(r(1))),
  ];
  let res = m.run(&prog, 1000).unwrap();
  assert_eq!(res.r0, 42);
  // Stack traffic is not an observable effect.
  assert!(res.stores.is_empty());
}

//=============================================================================
// End-to-end scenarios.

// Scenario 1: identity coalescing.  `mov v, r0; add w, v, #1; mov r0, w`
// collapses to a single `add r0, r0, #1`.
#[test]
fn identity_coalescing() {
  let mut f = with_skeleton(
    "id",
    1,
    vec![
      mov(v(0), Operand2::reg(r(0))),
      add(v(1), v(0), Operand2::imm(1)),
      mov(r(0), Operand2::reg(v(1))),
    ],
  );
  let before = f.clone();
  alloc(&mut f);
  // push {lr}; add r0, r0, #1; pop {pc}
  assert_eq!(f.insts.len(), 3, "{}", f);
  assert_eq!(f.insts[1], add(r(0), r(0), Operand2::imm(1)));
  assert!(f.is_leaf_func);
  assert_eq!(f.stack_size, 0);
  check_equivalent(&before, &f, &[(r(0), 7)]);
}

// Virtual-virtual copies coalesce outright.
#[test]
fn virt_virt_coalescing() {
  let mut f = with_skeleton(
    "vv",
    0,
    vec![
      mov(v(0), Operand2::imm(5)),
      mov(v(1), Operand2::reg(v(0))),
      mov(r(0), Operand2::reg(v(1))),
    ],
  );
  let before = f.clone();
  alloc(&mut f);
  // push {lr}; mov r0, #5; pop {pc}
  assert_eq!(f.insts.len(), 3, "{}", f);
  assert_eq!(f.insts[1], mov(r(0), Operand2::imm(5)));
  check_equivalent(&before, &f, &[]);
}

// Scenario 2: spill under pressure.  Thirteen simultaneously-live
// transients overflow the twelve allocatable registers; the allocator
// spills and reloads, and the store/load pair is not elidable.
#[test]
fn spill_under_pressure() {
  let mut body = Vec::new();
  for k in 0..13u32 {
    body.push(mov(v(k), Operand2::imm(k as i32)));
  }
  body.push(add(v(100), v(0), Operand2::reg(v(1))));
  for k in 2..13u32 {
    body.push(add(v(99 + k), v(98 + k), Operand2::reg(v(k))));
  }
  body.push(mov(r(0), Operand2::reg(v(111))));
  let mut f = with_skeleton("pressure", 0, body);
  let before = f.clone();
  alloc(&mut f);

  assert!(count(&f.insts, is_str) >= 1, "{}", f);
  assert!(count(&f.insts, is_ldr) >= 1, "{}", f);
  assert!(f.stack_size >= 4);
  // 0 + 1 + ... + 12
  check_equivalent(&before, &f, &[]);
  let mut m = Machine::new();
  assert_eq!(m.run(&f.insts, 100_000).unwrap().r0, 78);
}

// Scenario 3: a transient whose interval crosses a call is promoted to a
// callee-saved register, which the prologue then saves.
#[test]
fn call_clobber_promotes_to_callee_saved() {
  let mut f = with_skeleton(
    "call",
    0,
    vec![
      mov(v(0), Operand2::imm(1)),
      Inst::branch(Op::Bl, "foo", 0),
      add(r(0), v(0), Operand2::imm(2)),
    ],
  );
  let before = f.clone();
  alloc(&mut f);

  assert!(!f.is_leaf_func);
  assert!(push_regs(&f).contains(&r(4)), "{}", f);
  assert!(pop_regs(&f).contains(&r(4)));
  let i_mov = position(&f.insts, |i| *i == mov(r(4), Operand2::imm(1)));
  let i_bl = position(&f.insts, |i| {
    matches!(i.kind, InstKind::Br { op: Op::Bl, .. })
  });
  let i_add = position(&f.insts, |i| *i == add(r(0), r(4), Operand2::imm(2)));
  assert!(i_mov < i_bl && i_bl < i_add);
  check_equivalent(&before, &f, &[]);
}

// Scenario 4: a cross-block register written and immediately re-read: the
// eager write-back store is cancelled and re-committed after the consumer;
// no load is emitted.
#[test]
fn crossblock_writeback_peephole() {
  let (vm, cm) = cross_block(v(0));
  let mut f = with_skeleton(
    "wb",
    1,
    vec![
      Inst::label(&format_bb_label("wb", 0)),
      add(v(0), r(0), Operand2::imm(1)),
      add(v(1), v(0), Operand2::imm(2)),
      mov(r(0), Operand2::reg(v(1))),
      Inst::branch(Op::B, &format_bb_label("wb", 1), 0),
      Inst::label(&format_bb_label("wb", 1)),
    ],
  );
  let before = f.clone();
  alloc_with(&mut f, &vm, &cm);

  assert_eq!(count(&f.insts, is_ldr), 0, "{}", f);
  assert_eq!(count(&f.insts, is_str), 1, "{}", f);
  let i_consumer = position(&f.insts, |i| {
    matches!(&i.kind, InstKind::Arith3 { op: Op::Add, r2: Operand2::Imm(2), .. })
  });
  let i_str = position(&f.insts, is_str);
  let i_b = position(&f.insts, |i| {
    matches!(i.kind, InstKind::Br { op: Op::B, .. })
  });
  // The store sinks below its consumer but stays inside the block.
  assert!(i_consumer < i_str && i_str < i_b, "{}", f);
  assert_eq!(f.stack_size, 4);
  check_equivalent(&before, &f, &[(r(0), 10)]);
}

// A cross-block register defined in one block and read in the next goes
// through memory: store before the terminator, load at the use.
#[test]
fn crossblock_reload_in_next_block() {
  let (vm, cm) = cross_block(v(0));
  let mut f = with_skeleton(
    "xb",
    1,
    vec![
      Inst::label(&format_bb_label("xb", 0)),
      add(v(0), r(0), Operand2::imm(1)),
      Inst::branch(Op::B, &format_bb_label("xb", 1), 0),
      Inst::label(&format_bb_label("xb", 1)),
      add(v(1), v(0), Operand2::imm(2)),
      mov(r(0), Operand2::reg(v(1))),
    ],
  );
  let before = f.clone();
  alloc_with(&mut f, &vm, &cm);

  let i_str = position(&f.insts, is_str);
  let i_b = position(&f.insts, |i| {
    matches!(i.kind, InstKind::Br { op: Op::B, .. })
  });
  let i_ldr = position(&f.insts, is_ldr);
  assert!(i_str < i_b && i_b < i_ldr, "{}", f);
  check_equivalent(&before, &f, &[(r(0), 10)]);
}

// Scenario 5: frames of 1024 bytes or more are materialized through ip.
#[test]
fn large_frame_goes_through_ip() {
  let mut f =
    with_skeleton("big", 0, vec![mov(r(0), Operand2::imm(0))]);
  f.stack_size = 2048;
  let before = f.clone();
  alloc(&mut f);

  assert_eq!(f.insts[2], Inst::arith2(Op::Mov, REG_IP, Operand2::imm(2048)));
  assert_eq!(
    f.insts[3],
    Inst::arith3(Op::Sub, REG_SP, REG_SP, Operand2::reg(REG_IP))
  );
  assert_eq!(f.stack_size, 2048);
  check_equivalent(&before, &f, &[]);
}

// A small positive frame uses a plain immediate subtract.
#[test]
fn small_frame_uses_immediate() {
  let mut f =
    with_skeleton("small", 0, vec![mov(r(0), Operand2::imm(0))]);
  f.stack_size = 16;
  alloc(&mut f);
  assert_eq!(
    f.insts[2],
    Inst::arith3(Op::Sub, REG_SP, REG_SP, Operand2::imm(16))
  );
  // fp stays saved while the frame is live.
  assert!(push_regs(&f).contains(&REG_FP));
}

// Scenario 6: more than four parameters means stack arguments: fp is
// saved and biased past the saved-register area.
#[test]
fn stack_args_bias_fp() {
  let mut f =
    with_skeleton("many", 6, vec![mov(r(0), Operand2::imm(7))]);
  let before = f.clone();
  alloc(&mut f);

  assert!(push_regs(&f).contains(&REG_FP), "{}", f);
  // Two saved registers (fp, lr): the bias is 8.
  let i_add_fp = position(&f.insts, |i| {
    *i == add(REG_FP, REG_FP, Operand2::imm(8))
  });
  let i_sub_fp = position(&f.insts, |i| {
    *i == Inst::arith3(Op::Sub, REG_FP, REG_FP, Operand2::imm(8))
  });
  let i_pop = f.insts.len() - 1;
  assert!(i_add_fp == 2);
  assert!(i_sub_fp < i_pop);
  check_equivalent(&before, &f, &[]);
}

// Graph-colored variables live in their assigned callee-saved home, which
// the prologue saves.
#[test]
fn graph_colored_home() {
  let (vm, cm) = colored(v(0), 0);
  let mut f = with_skeleton(
    "col",
    2,
    vec![
      mov(v(0), Operand2::reg(r(1))),
      add(v(1), v(0), Operand2::imm(3)),
      mov(r(0), Operand2::reg(v(1))),
    ],
  );
  let before = f.clone();
  alloc_with(&mut f, &vm, &cm);

  assert!(push_regs(&f).contains(&r(4)), "{}", f);
  let i_mov = position(&f.insts, |i| *i == mov(r(4), Operand2::reg(r(1))));
  let i_add = position(&f.insts, |i| *i == add(r(0), r(4), Operand2::imm(3)));
  assert!(i_mov < i_add);
  check_equivalent(&before, &f, &[(r(1), 5)]);
}

// When every allocatable register is pinned by physical defs, demanding a
// transient is a fatal, diagnosable error.
#[test]
fn out_of_registers_is_fatal() {
  let _ = pretty_env_logger::try_init();
  let mut body = Vec::new();
  for k in 0..4u32 {
    body.push(mov(r(k), Operand2::imm(k as i32)));
  }
  body.push(mov(REG_IP, Operand2::imm(4)));
  for k in 4..11u32 {
    body.push(mov(r(k), Operand2::imm(k as i32)));
  }
  body.push(mov(v(0), Operand2::imm(99)));
  let mut f = with_skeleton("pinned", 0, body);
  let err = allocate_registers(
    &mut f,
    &VarMap::new(),
    &ColorMap::new(),
    &AllocOptions::default(),
  )
  .unwrap_err();
  match err {
    AllocError::OutOfRegisters { dump } => {
      assert!(dump.contains("r0"));
    }
    other => panic!("unexpected error: {}", other),
  }
}

// ldm/stm are the selector's responsibility; the rewriter refuses them.
#[test]
fn mult_load_store_not_implemented() {
  let mut f = with_skeleton(
    "ldm",
    0,
    vec![Inst::new(InstKind::MultLoadStore {
      op: Op::Ldm,
      rn: r(0),
      regs: vec![r(1), r(2)],
    })],
  );
  let err = allocate_registers(
    &mut f,
    &VarMap::new(),
    &ColorMap::new(),
    &AllocOptions::default(),
  )
  .unwrap_err();
  assert!(matches!(err, AllocError::NotImplemented(_)));
}

// `offset_stack` shifts spill addressing while sp is temporarily moved.
#[test]
fn offset_stack_biases_spill_addresses() {
  let (vm, cm) = cross_block(v(0));
  let mut f = with_skeleton(
    "off",
    1,
    vec![
      Inst::ctrl("offset_stack", CtrlValue::Int(8)),
      add(v(0), r(0), Operand2::imm(1)),
      Inst::ctrl("offset_stack", CtrlValue::Int(-8)),
    ],
  );
  alloc_with(&mut f, &vm, &cm);

  let i_str = position(&f.insts, is_str);
  match &f.insts[i_str].kind {
    InstKind::LoadStore { mem: MemLoc::Mem(m), .. } => {
      assert_eq!(*m, MemoryOperand::sp_offset(8), "{}", f);
    }
    _ => unreachable!(),
  }
  // The control pseudo-instructions pass through unchanged.
  assert_eq!(
    count(&f.insts, |i| matches!(i.kind, InstKind::Ctrl { .. })),
    2
  );
}

// `.ld_pc` labels swap ahead of a store emitted just before them, for the
// constant-pool emitter.
#[test]
fn ld_pc_label_precedes_store() {
  let (vm, cm) = cross_block(v(0));
  let mut f = with_skeleton(
    "ldpc",
    1,
    vec![
      add(v(0), r(0), Operand2::imm(1)),
      Inst::label(".ld_pc_0"),
      mov(r(0), Operand2::imm(0)),
    ],
  );
  alloc_with(&mut f, &vm, &cm);

  let i_label = position(&f.insts, |i| {
    matches!(&i.kind, InstKind::Label { name } if name == ".ld_pc_0")
  });
  let i_str = position(&f.insts, is_str);
  assert_eq!(i_label + 1, i_str, "{}", f);
}

// With coalescing off the allocation is still correct, copies and all.
#[test]
fn coalescing_can_be_disabled() {
  let _ = pretty_env_logger::try_init();
  let mut f = with_skeleton(
    "noc",
    1,
    vec![
      mov(v(0), Operand2::reg(r(0))),
      add(v(1), v(0), Operand2::imm(1)),
      mov(r(0), Operand2::reg(v(1))),
    ],
  );
  let before = f.clone();
  let opts = AllocOptions { coalesce: false, ..AllocOptions::default() };
  allocate_registers(&mut f, &VarMap::new(), &ColorMap::new(), &opts)
    .unwrap_or_else(|err| panic!("allocation failed: {}", err));
  assert!(check_no_virtuals(&f.insts).is_ok());
  check_equivalent(&before, &f, &[(r(0), 7)]);
}

// Same inputs, same output, byte for byte.
#[test]
fn allocation_is_deterministic() {
  let build = || {
    let mut body = Vec::new();
    for k in 0..13u32 {
      body.push(mov(v(k), Operand2::imm(k as i32)));
    }
    body.push(add(v(100), v(0), Operand2::reg(v(1))));
    for k in 2..13u32 {
      body.push(add(v(99 + k), v(98 + k), Operand2::reg(v(k))));
    }
    body.push(mov(r(0), Operand2::reg(v(111))));
    with_skeleton("det", 0, body)
  };
  let mut f1 = build();
  let mut f2 = build();
  alloc(&mut f1);
  alloc(&mut f2);
  assert_eq!(format!("{}", f1), format!("{}", f2));
}
