//! Whole-pipeline scenarios driven directly through the public API, since
//! the parser that would normally feed it is out of scope for this crate.
//! Each test plays out one statement or expression shape end to end and
//! checks the instruction stream / constant pool / line info it produces.

use std::rc::Rc;

use vela_codegen::konst::Constant;
use vela_codegen::opcode::{self, OpCode};
use vela_codegen::{BinOpr, ExpDesc, FuncState};

fn fs() -> FuncState {
    FuncState::open(None, Rc::from("chunk"), false, 0)
}

/// `local a, b, c` with no initializers: three pinned locals backed by one
/// merged `LOADNIL` rather than one per variable.
#[test]
fn local_declaration_with_no_initializers_collapses_to_one_loadnil() {
    let mut f = fs();
    f.reserve_regs(3).unwrap();
    f.nil(0, 3);
    f.nactvar = 3;

    assert_eq!(f.code.len(), 1);
    assert_eq!(opcode::get_opcode(f.code[0]), OpCode::LoadNil);
    assert_eq!(opcode::get_arg_a(f.code[0]), 0);
    assert_eq!(opcode::get_arg_b(f.code[0]), 2);
}

/// `return 1 + 2`: folds at compile time, so the constant pool stays empty
/// and the literal rides in on `LOADI`.
#[test]
fn return_of_constant_sum_folds_and_uses_loadi() {
    let mut f = fs();
    let mut lhs = ExpDesc::kint(1);
    let rhs = ExpDesc::kint(2);
    f.infix(BinOpr::Add, &mut lhs).unwrap();
    let mut rhs = rhs;
    f.posfix(BinOpr::Add, &mut lhs, &mut rhs, 1).unwrap();

    assert_eq!(lhs.kind, vela_codegen::ExpKind::KInt(3));

    f.exp2nextreg(&mut lhs).unwrap();
    let reg = lhs.nonreloc_reg().unwrap();
    f.ret(reg, 1);

    assert!(f.pool.k.is_empty());
    assert_eq!(f.code.len(), 2);
    assert_eq!(opcode::get_opcode(f.code[0]), OpCode::LoadI);
    assert_eq!(opcode::get_arg_sbx(f.code[0]), 3);
    assert_eq!(opcode::get_opcode(f.code[1]), OpCode::Return1);
    assert_eq!(opcode::get_arg_a(f.code[1]), reg as i32);
}

/// `return 1 + x` with `x` already a local in r0: no fold possible, so the
/// narrower `ADDI` immediate form is used instead of materializing a
/// second register for the literal.
#[test]
fn return_of_literal_plus_local_uses_addi() {
    let mut f = fs();
    f.nactvar = 1;
    f.freereg = 1;
    f.maxstacksize = 1;

    let mut one = ExpDesc::kint(1);
    f.infix(BinOpr::Add, &mut one).unwrap();
    let mut x = ExpDesc::local(0);
    f.posfix(BinOpr::Add, &mut one, &mut x, 7).unwrap();
    f.exp2nextreg(&mut one).unwrap();
    let dest = one.nonreloc_reg().unwrap();

    assert!(f.pool.k.is_empty());
    assert_eq!(f.code.len(), 1);
    assert_eq!(opcode::get_opcode(f.code[0]), OpCode::AddI);
    assert_eq!(opcode::get_arg_a(f.code[0]), dest as i32);
    assert_eq!(opcode::get_arg_b(f.code[0]), 0);

    f.ret(dest, 1);
    assert_eq!(f.code.len(), 2);
    assert_eq!(opcode::get_opcode(f.code[1]), OpCode::Return1);
}

/// `if a and b then f() end` with `a`, `b` locals and `f` an upvalue: the
/// two short-circuit tests both thread into one false-exit list, which
/// lands on the instruction right after the call once the (else-less)
/// `if` closes.
#[test]
fn and_guarded_if_threads_both_tests_to_one_exit() {
    let mut f = fs();
    f.nactvar = 2;
    f.freereg = 2;
    f.maxstacksize = 2;

    let mut a = ExpDesc::local(0);
    f.infix(BinOpr::And, &mut a).unwrap();
    let mut b = ExpDesc::local(1);
    f.posfix(BinOpr::And, &mut a, &mut b, 10).unwrap();
    let mut cond = a;
    f.goiftrue(&mut cond).unwrap();
    let false_list = cond.f;

    let mut callee = ExpDesc::upval(0);
    f.exp2nextreg(&mut callee).unwrap();
    let funcreg = callee.nonreloc_reg().unwrap();
    f.code_abc(OpCode::Call, funcreg as i32, 1, 1);

    f.patchtohere(false_list).unwrap();
    let after = f.pc() as i32;

    let testsets: Vec<_> = f
        .code
        .iter()
        .filter(|&&i| opcode::get_opcode(i) == OpCode::TestSet)
        .collect();
    assert_eq!(testsets.len(), 2, "and's test plus the if's own test");

    let jumps: Vec<(usize, u32)> = f
        .code
        .iter()
        .enumerate()
        .filter(|&(_, &i)| opcode::get_opcode(i) == OpCode::Jmp)
        .map(|(idx, &i)| (idx, i))
        .collect();
    assert_eq!(jumps.len(), 2, "one false-exit jump per short-circuited test");
    for (idx, instr) in jumps {
        let target = idx as i32 + 1 + opcode::get_arg_sj(instr);
        assert_eq!(target, after, "every false-branch jump skips straight past the call");
    }

    assert_eq!(opcode::get_opcode(f.code[f.code.len() - 2]), OpCode::GetUpval);
    assert_eq!(opcode::get_opcode(f.code[f.code.len() - 1]), OpCode::Call);
}

/// `x = 1<<62` then `y = 1.5<<62`-equivalent whole float, both into
/// upvalues: same magnitude, int vs. float, so the pool must keep them as
/// two distinct entries rather than collapsing them.
#[test]
fn int_and_float_of_equal_magnitude_get_distinct_constants() {
    let mut f = fs();
    let huge_int: i64 = 1 << 62;
    let huge_float = huge_int as f64;

    let x = ExpDesc::upval(0);
    let mut rhs_int = ExpDesc::kint(huge_int);
    f.storevar(&x, &mut rhs_int).unwrap();

    let y = ExpDesc::upval(1);
    let mut rhs_float = ExpDesc::kflt(huge_float);
    f.storevar(&y, &mut rhs_float).unwrap();

    assert_eq!(f.pool.k.len(), 2);
    assert_eq!(f.pool.k[0], Constant::Int(huge_int));
    assert_eq!(f.pool.k[1], Constant::Float(huge_float));

    assert_eq!(opcode::get_opcode(f.code[0]), OpCode::LoadK);
    assert_eq!(opcode::get_opcode(f.code[1]), OpCode::SetUpval);
    assert_eq!(opcode::get_opcode(f.code[2]), OpCode::LoadK);
    assert_eq!(opcode::get_opcode(f.code[3]), OpCode::SetUpval);
}

/// 200 statements on strictly increasing lines (delta 1 apiece): small
/// enough deltas that only the periodic anchor at `MAX_IWTHABS` forces an
/// absolute entry, not the line jump itself.
#[test]
fn two_hundred_statements_get_exactly_one_periodic_anchor() {
    let mut f = fs();
    for line in 1..=200i32 {
        f.lastline = line;
        f.code_abc(OpCode::LoadNil, 0, 0, 0);
    }

    assert_eq!(f.lines.lineinfo.len(), 200);
    assert_eq!(f.lines.abslineinfo.len(), 1);

    let anchor_positions: Vec<usize> = f
        .lines
        .lineinfo
        .iter()
        .enumerate()
        .filter(|&(_, &b)| b == vela_codegen::lineinfo::ABSLINEINFO)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(anchor_positions, vec![120]);
}
