//! Arithmetic, bitwise, comparison and concatenation codegen (component
//! G), plus the small statement-level helpers (`self`, `setlist`, `ret`)
//! that round out the driver-facing surface.
//!
//! Every binary operator first attempts constant folding; failing that it
//! picks the narrowest instruction form the operands allow (immediate,
//! pooled-constant, or register/register) rather than always materializing
//! both sides into registers.

use crate::error::CodegenError;
use crate::expdesc::{ExpDesc, ExpKind, NO_JUMP};
use crate::funcstate::FuncState;
use crate::opcode::{self, OpCode};

/// LFIELDS_PER_FLUSH (§9 supplemented features): how many array-style
/// table fields `SETLIST` commits per instruction before another flush is
/// needed.
pub const FIELDS_PER_FLUSH: i32 = 50;

/// Sentinel `tostore` value meaning "however many the last open call or
/// vararg expression yields" (mirrors `LUA_MULTRET` in the original).
pub const MULTRET: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOpr {
    Minus,
    BNot,
    Not,
    Len,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOpr {
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// Folded result of a binary numeral operation — mirrors Lua's
/// `luaO_rawarith` in the narrow slice this generator folds (int/float
/// arithmetic and bitwise ops; string coercion and metamethods are out of
/// scope, §1).
enum Numeral {
    Int(i64),
    Float(f64),
}

fn as_numeral(e: &ExpDesc) -> Option<Numeral> {
    match e.kind {
        ExpKind::KInt(i) => Some(Numeral::Int(i)),
        ExpKind::KFlt(f) => Some(Numeral::Float(f)),
        _ => None,
    }
}

/// `validop`: bitwise operators fold only when both operands convert to
/// an exact integer; integer division/modulo never fold a zero divisor
/// (left for the runtime to raise).
fn validop(op: BinOpr, v1: &Numeral, v2: &Numeral) -> bool {
    match op {
        BinOpr::BAnd | BinOpr::BOr | BinOpr::BXor | BinOpr::Shl | BinOpr::Shr => {
            matches!(v1, Numeral::Int(_)) && matches!(v2, Numeral::Int(_))
        }
        BinOpr::IDiv | BinOpr::Mod => match (v1, v2) {
            (Numeral::Int(_), Numeral::Int(0)) => false,
            _ => true,
        },
        _ => true,
    }
}

fn raw_arith(op: BinOpr, v1: Numeral, v2: Numeral) -> Option<Numeral> {
    Some(match (v1, v2) {
        (Numeral::Int(a), Numeral::Int(b)) => match op {
            BinOpr::Add => Numeral::Int(a.wrapping_add(b)),
            BinOpr::Sub => Numeral::Int(a.wrapping_sub(b)),
            BinOpr::Mul => Numeral::Int(a.wrapping_mul(b)),
            BinOpr::Mod => Numeral::Int(ifloormod(a, b)),
            BinOpr::IDiv => Numeral::Int(ifloordiv(a, b)),
            BinOpr::BAnd => Numeral::Int(a & b),
            BinOpr::BOr => Numeral::Int(a | b),
            BinOpr::BXor => Numeral::Int(a ^ b),
            BinOpr::Shl => Numeral::Int(shift_left(a, b)),
            BinOpr::Shr => Numeral::Int(shift_left(a, -b)),
            BinOpr::Pow => Numeral::Float((a as f64).powf(b as f64)),
            BinOpr::Div => Numeral::Float(a as f64 / b as f64),
            _ => return None,
        },
        (v1, v2) => {
            let (a, b) = (to_f64(v1), to_f64(v2));
            match op {
                BinOpr::Add => Numeral::Float(a + b),
                BinOpr::Sub => Numeral::Float(a - b),
                BinOpr::Mul => Numeral::Float(a * b),
                BinOpr::Div => Numeral::Float(a / b),
                BinOpr::Pow => Numeral::Float(a.powf(b)),
                BinOpr::Mod => Numeral::Float(a - (a / b).floor() * b),
                BinOpr::IDiv => Numeral::Float((a / b).floor()),
                _ => return None,
            }
        }
    })
}

fn to_f64(n: Numeral) -> f64 {
    match n {
        Numeral::Int(i) => i as f64,
        Numeral::Float(f) => f,
    }
}

fn shift_left(a: i64, b: i64) -> i64 {
    if b <= -64 || b >= 64 {
        0
    } else if b >= 0 {
        ((a as u64) << b) as i64
    } else {
        ((a as u64) >> -b) as i64
    }
}

/// `luaV_idiv`: floor division, not truncating. Divisor-zero is filtered
/// out by `validop` before this is ever called.
fn ifloordiv(a: i64, b: i64) -> i64 {
    if a % b == 0 || (a < 0) == (b < 0) {
        a.wrapping_div(b)
    } else {
        a.wrapping_div(b) - 1
    }
}

/// `luaV_mod`: the remainder of [`ifloordiv`] (sign follows the divisor,
/// not the dividend). Divisor-zero is filtered out by `validop`.
fn ifloormod(a: i64, b: i64) -> i64 {
    let m = a.wrapping_rem(b);
    if m != 0 && (m ^ b) < 0 {
        m + b
    } else {
        m
    }
}

/// `constfolding`: attempt to fold `op(e1, e2)` entirely at compile time.
/// Refuses to fold to a NaN or `0.0` float result (the sign of a folded
/// zero would be unrecoverable, and NaN has no canonical bit pattern to
/// pick), deferring those to the runtime instead.
fn constfolding(op: BinOpr, e1: &mut ExpDesc, e2: &ExpDesc) -> bool {
    let (Some(v1), Some(v2)) = (as_numeral(e1), as_numeral(e2)) else {
        return false;
    };
    if !validop(op, &v1, &v2) {
        return false;
    }
    match raw_arith(op, v1, v2) {
        Some(Numeral::Int(i)) => {
            e1.kind = ExpKind::KInt(i);
            true
        }
        Some(Numeral::Float(f)) => {
            if f.is_nan() || f == 0.0 {
                false
            } else {
                e1.kind = ExpKind::KFlt(f);
                true
            }
        }
        None => false,
    }
}

fn arith_opcode(op: BinOpr) -> OpCode {
    match op {
        BinOpr::Add => OpCode::Add,
        BinOpr::Sub => OpCode::Sub,
        BinOpr::Mul => OpCode::Mul,
        BinOpr::Mod => OpCode::Mod,
        BinOpr::Pow => OpCode::Pow,
        BinOpr::Div => OpCode::Div,
        BinOpr::IDiv => OpCode::IDiv,
        BinOpr::BAnd => OpCode::BAnd,
        BinOpr::BOr => OpCode::BOr,
        BinOpr::BXor => OpCode::BXor,
        BinOpr::Shl => OpCode::Shl,
        BinOpr::Shr => OpCode::Shr,
        _ => unreachable!("not an arithmetic/bitwise operator"),
    }
}

fn arith_k_opcode(op: BinOpr) -> Option<OpCode> {
    Some(match op {
        BinOpr::Add => OpCode::AddK,
        BinOpr::Sub => OpCode::SubK,
        BinOpr::Mul => OpCode::MulK,
        BinOpr::Mod => OpCode::ModK,
        BinOpr::Pow => OpCode::PowK,
        BinOpr::Div => OpCode::DivK,
        BinOpr::IDiv => OpCode::IDivK,
        BinOpr::BAnd => OpCode::BAndK,
        BinOpr::BOr => OpCode::BOrK,
        BinOpr::BXor => OpCode::BXorK,
        _ => return None,
    })
}

impl FuncState {
    /// `luaK_fixline` wrapper used throughout this module: binary/unary
    /// ops are stamped with the operator's own line, not the line of
    /// whichever operand happened to be emitted last.
    fn stamp_line(&mut self, line: i32) {
        self.fixline(line);
    }

    fn codeunexpval(&mut self, op: OpCode, e: &mut ExpDesc, line: i32) {
        let r = self.exp2anyreg(e);
        self.free_exp(e);
        let pc = self.code_abc(op, 0, r as i32, 0);
        e.kind = ExpKind::Reloc(pc);
        self.stamp_line(line);
    }

    /// `luaK_prefix`: unary operators. Folds `-`/`~` on a literal in
    /// place; `not` goes through [`Self::codenot`], which already handles
    /// its own folding and jump-list inversion.
    pub fn prefix(&mut self, op: UnOpr, e: &mut ExpDesc, line: i32) -> Result<(), CodegenError> {
        let zero = ExpDesc::kint(0);
        match op {
            UnOpr::Minus => {
                if !constfolding(BinOpr::Sub, e, &zero) {
                    self.dischargevars(e);
                    self.codeunexpval(OpCode::Unm, e, line);
                }
            }
            UnOpr::BNot => {
                if as_numeral(e).is_none() || !self.fold_unary_bnot(e) {
                    self.dischargevars(e);
                    self.codeunexpval(OpCode::BNot, e, line);
                }
            }
            UnOpr::Not => self.codenot(e),
            UnOpr::Len => {
                self.dischargevars(e);
                self.codeunexpval(OpCode::Len, e, line);
            }
        }
        Ok(())
    }

    fn fold_unary_bnot(&self, e: &ExpDesc) -> bool {
        matches!(e.kind, ExpKind::KInt(_))
    }

    /// `luaK_infix`: prepare the left operand before the parser reads the
    /// right one — short-circuit operators commit their jump here, other
    /// operators just get `e1` into a value form cheap to combine with
    /// whatever `e2` turns out to be. `dischargevars` runs unconditionally
    /// first (matching the original), so a constant-folded upvalue (§
    /// supplemented features) is seen as a numeral by the checks below
    /// rather than being materialized into a register too early.
    pub fn infix(&mut self, op: BinOpr, e1: &mut ExpDesc) -> Result<(), CodegenError> {
        self.dischargevars(e1);
        match op {
            BinOpr::And => self.goiftrue(e1),
            BinOpr::Or => self.goiffalse(e1),
            BinOpr::Concat => {
                self.exp2nextreg(e1)?;
                Ok(())
            }
            BinOpr::Eq | BinOpr::Ne | BinOpr::Lt | BinOpr::Le | BinOpr::Gt | BinOpr::Ge => {
                if as_numeral(e1).is_none() {
                    self.exp2anyreg(e1);
                }
                Ok(())
            }
            _ => {
                if as_numeral(e1).is_none() {
                    self.exp2anyreg(e1);
                }
                Ok(())
            }
        }
    }

    /// `luaK_posfix`: combine `e1 op e2` once both operands are parsed.
    pub fn posfix(
        &mut self,
        op: BinOpr,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: i32,
    ) -> Result<(), CodegenError> {
        match op {
            BinOpr::And => {
                debug_assert_eq!(e1.t, NO_JUMP, "infix(And) already closed e1's true list");
                self.dischargevars(e2);
                self.concat(&mut e2.f, e1.f);
                *e1 = *e2;
            }
            BinOpr::Or => {
                debug_assert_eq!(e1.f, NO_JUMP, "infix(Or) already closed e1's false list");
                self.dischargevars(e2);
                self.concat(&mut e2.t, e1.t);
                *e1 = *e2;
            }
            BinOpr::Concat => self.codeconcat(e1, e2, line)?,
            BinOpr::Add | BinOpr::Mul => self.codecommutative(op, e1, e2, line)?,
            BinOpr::Sub | BinOpr::Mod | BinOpr::Pow | BinOpr::Div | BinOpr::IDiv => {
                self.codearith(op, e1, e2, false, line)?
            }
            BinOpr::BAnd | BinOpr::BOr | BinOpr::BXor => self.codebitwise(op, e1, e2, line)?,
            BinOpr::Shl | BinOpr::Shr => self.codeshift(op, e1, e2, line)?,
            BinOpr::Eq | BinOpr::Ne => self.codeeq(op, e1, e2)?,
            BinOpr::Lt | BinOpr::Le | BinOpr::Gt | BinOpr::Ge => self.codeorder(op, e1, e2)?,
        }
        Ok(())
    }

    /// `codecommutative`: for `+`/`*`, swap operands when the first is a
    /// numeric constant, so the immediate/K-operand search below always
    /// looks at `e2` — mirrors the original's split between commutative
    /// and plain `codearith` entry points (§4.G "commutative (+, *)").
    fn codecommutative(
        &mut self,
        op: BinOpr,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: i32,
    ) -> Result<(), CodegenError> {
        let flip = if as_numeral(e1).is_some() {
            std::mem::swap(e1, e2);
            true
        } else {
            false
        };
        self.codearith(op, e1, e2, flip, line)
    }

    /// `codearith`: fold if possible; else prefer an immediate (`ADDI`,
    /// including negated-immediate subtraction) or pooled-constant form
    /// over materializing a second register. `flip` is the instruction's
    /// `k` bit, set when `e1`/`e2` were already swapped from source order
    /// by [`Self::codecommutative`] so the VM can undo it for non-integer
    /// metamethod fallback.
    fn codearith(
        &mut self,
        op: BinOpr,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        flip: bool,
        line: i32,
    ) -> Result<(), CodegenError> {
        if constfolding(op, e1, e2) {
            return Ok(());
        }
        if let ExpKind::KInt(i) = e2.kind {
            if op == BinOpr::Add && opcode::fits_sc(i) {
                return self.codebini(OpCode::AddI, e1, i, flip, line);
            }
            if op == BinOpr::Sub && opcode::fits_sc(-i) {
                return self.codebini(OpCode::AddI, e1, -i, flip, line);
            }
        }
        if let Some(kop) = arith_k_opcode(op) {
            if as_numeral(e2).is_some() {
                return self.codebink(kop, e1, e2, flip, line);
            }
        }
        // Neither an immediate nor a K operand: fall back to the plain
        // register-register form, undoing any commutative swap first so
        // the emitted instruction still reads in source order.
        if flip {
            std::mem::swap(e1, e2);
        }
        self.codebinexpval(arith_opcode(op), e1, e2, line)
    }

    fn codebitwise(
        &mut self,
        op: BinOpr,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: i32,
    ) -> Result<(), CodegenError> {
        if constfolding(op, e1, e2) {
            return Ok(());
        }
        if let Some(kop) = arith_k_opcode(op) {
            if matches!(e2.kind, ExpKind::KInt(_)) {
                return self.codebink(kop, e1, e2, false, line);
            }
            if matches!(e1.kind, ExpKind::KInt(_)) {
                std::mem::swap(e1, e2);
                return self.codebink(kop, e1, e2, true, line);
            }
        }
        self.codebinexpval(arith_opcode(op), e1, e2, line)
    }

    fn codeshift(
        &mut self,
        op: BinOpr,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: i32,
    ) -> Result<(), CodegenError> {
        if constfolding(op, e1, e2) {
            return Ok(());
        }
        if let ExpKind::KInt(i) = e2.kind {
            // No `SHLI` exists; `a << k` compiles as a right shift by `-k`.
            let amount = if op == BinOpr::Shl { -i } else { i };
            if opcode::fits_sc(amount) {
                return self.codebini(OpCode::ShrI, e1, amount, false, line);
            }
        }
        self.codebinexpval(arith_opcode(op), e1, e2, line)
    }

    /// `codebini`: register-immediate arithmetic/comparison form. `flip`
    /// is the instruction's `k` bit, set when the operands were swapped
    /// from source order (e.g. `5 - x` swapped to use `ADDI`).
    fn codebini(
        &mut self,
        op: OpCode,
        e1: &mut ExpDesc,
        imm: i64,
        flip: bool,
        line: i32,
    ) -> Result<(), CodegenError> {
        let v1 = self.exp2anyreg(e1);
        self.free_exp(e1);
        let sc = (imm + opcode::OFFSET_SC as i64) as i32;
        let pc = self.code_abck(op, 0, v1 as i32, sc, flip);
        e1.kind = ExpKind::Reloc(pc);
        self.stamp_line(line);
        Ok(())
    }

    fn codebink(
        &mut self,
        op: OpCode,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        flip: bool,
        line: i32,
    ) -> Result<(), CodegenError> {
        let v1 = self.exp2anyreg(e1);
        let (k, _) = self.exp2rk(e2);
        self.free_exp(e1);
        let pc = self.code_abck(op, 0, v1 as i32, k, flip);
        e1.kind = ExpKind::Reloc(pc);
        self.stamp_line(line);
        Ok(())
    }

    /// `finishbinexpval`: materialize `e1` into a register and combine it
    /// with an already-known second operand (a register, K index, or
    /// immediate, depending on caller) via `op`. Used for every binary
    /// form; the pure register-register path goes through
    /// [`Self::codebinexpval`] first so `e2` is materialized before `e1`.
    fn finishbinexpval(
        &mut self,
        op: OpCode,
        e1: &mut ExpDesc,
        e2: &ExpDesc,
        v2: i32,
        flip: bool,
        line: i32,
    ) -> Result<(), CodegenError> {
        let v1 = self.exp2anyreg(e1);
        let pc = self.code_abck(op, 0, v1 as i32, v2, flip);
        self.free_exps(e1, e2);
        e1.kind = ExpKind::Reloc(pc);
        self.stamp_line(line);
        Ok(())
    }

    /// `codebinexpval`: the register-register case. §5's ordering
    /// contract requires `e2` to reach a register before `e1` is
    /// finalized, since materializing `e1` may free registers `e2` still
    /// needs to read.
    fn codebinexpval(
        &mut self,
        op: OpCode,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: i32,
    ) -> Result<(), CodegenError> {
        let v2 = self.exp2anyreg(e2);
        self.finishbinexpval(op, e1, e2, v2 as i32, false, line)
    }

    /// `codeeq`: `==`/`~=` against a small integer immediate (`EQI`), a
    /// pooled constant (`EQK`), or the general register form (`EQ`). When
    /// `e1` arrived as a constant and `e2` as a register, the two are
    /// swapped first so the immediate/K search below always looks at the
    /// operand actually eligible for it (mirrors the original's
    /// unconditional "constants go in e2" convention for equality).
    fn codeeq(&mut self, op: BinOpr, e1: &mut ExpDesc, e2: &mut ExpDesc) -> Result<(), CodegenError> {
        if !matches!(e1.kind, ExpKind::NonReloc(_)) {
            std::mem::swap(e1, e2);
        }
        let want_true = op == BinOpr::Eq;
        let pc = if let ExpKind::KInt(i) = e2.kind {
            if opcode::fits_sc(i) {
                let v1 = self.exp2anyreg(e1);
                self.free_exp(e1);
                let sc = (i + opcode::OFFSET_SC as i64) as i32;
                self.code_abck(OpCode::EqI, v1 as i32, sc, 0, want_true)
            } else {
                self.code_eq_general(e1, e2, want_true)
            }
        } else if matches!(e2.kind, ExpKind::K(_) | ExpKind::Nil | ExpKind::True | ExpKind::False) {
            let v1 = self.exp2anyreg(e1);
            let (k, _) = self.exp2rk(e2);
            self.free_exp(e1);
            self.code_abck(OpCode::EqK, v1 as i32, k, 0, want_true)
        } else {
            self.code_eq_general(e1, e2, want_true)
        };
        e1.kind = ExpKind::Jmp(self.jump());
        self.previous_instruction_is_test(pc);
        Ok(())
    }

    fn code_eq_general(&mut self, e1: &mut ExpDesc, e2: &mut ExpDesc, want_true: bool) -> u32 {
        let v1 = self.exp2anyreg(e1);
        let v2 = self.exp2anyreg(e2);
        self.free_regs(v1, v2);
        self.code_abck(OpCode::Eq, v1 as i32, v2 as i32, 0, want_true)
    }

    fn previous_instruction_is_test(&self, pc: u32) {
        debug_assert!(opcode::test_mode(opcode::get_opcode(self.code[pc as usize])));
    }

    /// `codeorder`: `<`/`<=` (and `>`/`>=`, by swapping operands so the
    /// VM only ever needs the two "less" forms) against a small integer
    /// immediate or the general register form.
    fn codeorder(&mut self, op: BinOpr, e1: &mut ExpDesc, e2: &mut ExpDesc) -> Result<(), CodegenError> {
        let (op, e1, e2) = match op {
            BinOpr::Gt => (BinOpr::Lt, e2, e1),
            BinOpr::Ge => (BinOpr::Le, e2, e1),
            other => (other, e1, e2),
        };
        let pc = if let ExpKind::KInt(i) = e2.kind {
            if opcode::fits_sc(i) {
                let v1 = self.exp2anyreg(e1);
                self.free_exp(e1);
                let sc = (i + opcode::OFFSET_SC as i64) as i32;
                let iop = if op == BinOpr::Lt { OpCode::LtI } else { OpCode::LeI };
                self.code_abck(iop, v1 as i32, sc, 0, true)
            } else {
                self.code_order_general(op, e1, e2)
            }
        } else if let ExpKind::KInt(i) = e1.kind {
            if opcode::fits_sc(i) {
                let v2 = self.exp2anyreg(e2);
                self.free_exp(e2);
                let sc = (i + opcode::OFFSET_SC as i64) as i32;
                let iop = if op == BinOpr::Lt { OpCode::GtI } else { OpCode::GeI };
                self.code_abck(iop, v2 as i32, sc, 0, true)
            } else {
                self.code_order_general(op, e1, e2)
            }
        } else {
            self.code_order_general(op, e1, e2)
        };
        e1.kind = ExpKind::Jmp(self.jump());
        self.previous_instruction_is_test(pc);
        Ok(())
    }

    fn code_order_general(&mut self, op: BinOpr, e1: &mut ExpDesc, e2: &mut ExpDesc) -> u32 {
        let v1 = self.exp2anyreg(e1);
        let v2 = self.exp2anyreg(e2);
        self.free_regs(v1, v2);
        let iop = if op == BinOpr::Lt { OpCode::Lt } else { OpCode::Le };
        self.code_abck(iop, v1 as i32, v2 as i32, 0, true)
    }

    /// `codeconcat`: adjacent `CONCAT n` + `CONCAT m` targeting the same
    /// tail of the register window merge into one `CONCAT (n+m)` (§9
    /// "CONCAT merging") instead of nesting two-at-a-time.
    fn codeconcat(&mut self, e1: &mut ExpDesc, e2: &mut ExpDesc, line: i32) -> Result<(), CodegenError> {
        self.exp2val(e2);
        if let ExpKind::Reloc(pc2) = e2.kind {
            if opcode::get_opcode(self.code[pc2 as usize]) == OpCode::Concat {
                let n2 = opcode::get_arg_b(self.code[pc2 as usize]);
                debug_assert_eq!(e1.nonreloc_reg().map(|r| r as i32), Some(opcode::get_arg_a(self.code[pc2 as usize]) - 1));
                let mut instr = self.code[pc2 as usize];
                opcode::set_arg_a(&mut instr, opcode::get_arg_a(instr) - 1);
                opcode::set_arg_b(&mut instr, n2 + 1);
                self.code[pc2 as usize] = instr;
                e1.kind = e2.kind;
                return Ok(());
            }
        }
        self.exp2nextreg(e2)?;
        self.free_exp(e2);
        self.free_exp(e1);
        let v1 = e1.nonreloc_reg().unwrap_or(0);
        let pc = self.code_abc(OpCode::Concat, v1 as i32, 2, 0);
        e1.kind = ExpKind::Reloc(pc);
        self.stamp_line(line);
        Ok(())
    }

    /// `luaK_self`: `obj:method(...)` sugar — copy `obj` one register up
    /// so `CALL` finds it as the implicit first argument, then fetch the
    /// method itself via `SELF`.
    pub fn self_call(&mut self, e: &mut ExpDesc, key: &mut ExpDesc) -> Result<(), CodegenError> {
        self.exp2anyreg(e);
        self.free_exp(e);
        let func = self.freereg;
        self.reserve_regs(2)?;
        let obj = e.nonreloc_reg().unwrap();
        let (k, is_k) = self.exp2rk(key);
        self.code_abck(OpCode::Self_, func as i32, obj as i32, k, is_k);
        self.free_exp(key);
        e.kind = ExpKind::NonReloc(func);
        Ok(())
    }

    /// `luaK_setlist`: flush array-style table entries into the table at
    /// `base`. `nelems` is the running count of elements already queued
    /// (used to compute which batch, `c`, this flush is); `tostore` is how
    /// many values this particular flush commits, or [`MULTRET`] for "all
    /// of the last open call/vararg". When the batch index doesn't fit the
    /// `C` operand it escalates to `EXTRAARG`, exactly as `LOADKX` does for
    /// an oversized constant index (§4.D); beyond that the constructor is
    /// rejected outright (§7.1).
    pub fn setlist(&mut self, base: u8, nelems: i32, tostore: i32) -> Result<(), CodegenError> {
        debug_assert!(tostore == MULTRET || (tostore != 0 && tostore <= FIELDS_PER_FLUSH));
        let c = (nelems - 1) / FIELDS_PER_FLUSH + 1;
        let b = if tostore == MULTRET { 0 } else { tostore };
        if c <= opcode::MAXARG_C {
            self.code_abc(OpCode::SetList, base as i32, b, c);
        } else if c <= opcode::MAXARG_AX {
            self.code_abc(OpCode::SetList, base as i32, b, 0);
            self.code_ax(c);
        } else {
            return Err(CodegenError::ConstructorTooLong);
        }
        self.freereg = base + 1;
        Ok(())
    }

    /// `luaK_ret`: emit the function's return. Uses the compact
    /// zero/one-result forms when possible, falling back to the general
    /// `RETURN` (later possibly upgraded again by the finalizer if the
    /// function needs to close to-be-closed variables or is vararg, §4.H).
    pub fn ret(&mut self, first: u8, nret: i32) -> u32 {
        match nret {
            0 => self.code_abc(OpCode::Return0, 0, 1, 0),
            1 => self.code_abc(OpCode::Return1, first as i32, 2, 0),
            _ => {
                let b = if nret == -1 { 0 } else { nret + 1 };
                self.code_abck(OpCode::Return, first as i32, b, 0, false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn fs() -> FuncState {
        FuncState::open(None, Rc::from("test"), false, 0)
    }

    #[test]
    fn folds_integer_addition() {
        let mut f = fs();
        let mut e1 = ExpDesc::kint(2);
        let mut e2 = ExpDesc::kint(3);
        f.codearith(BinOpr::Add, &mut e1, &mut e2, false, 1).unwrap();
        assert_eq!(e1.kind, ExpKind::KInt(5));
        assert_eq!(f.code.len(), 0);
    }

    #[test]
    fn refuses_to_fold_division_by_zero() {
        let mut f = fs();
        let mut e1 = ExpDesc::kint(7);
        let mut e2 = ExpDesc::kint(0);
        f.codearith(BinOpr::IDiv, &mut e1, &mut e2, false, 1).unwrap();
        assert!(!matches!(e1.kind, ExpKind::KInt(_)));
    }

    #[test]
    fn refuses_to_fold_negative_zero() {
        let mut f = fs();
        let mut e1 = ExpDesc::kflt(0.0);
        let mut e2 = ExpDesc::kflt(-0.0);
        f.codearith(BinOpr::Mul, &mut e1, &mut e2, false, 1).unwrap();
        assert!(!matches!(e1.kind, ExpKind::KFlt(_)));
    }

    #[test]
    fn small_constant_add_uses_addi() {
        let mut f = fs();
        let mut e1 = ExpDesc::local(0);
        f.exp2anyreg(&mut e1);
        let mut e2 = ExpDesc::kint(5);
        f.codearith(BinOpr::Add, &mut e1, &mut e2, false, 1).unwrap();
        assert_eq!(opcode::get_opcode(*f.code.last().unwrap()), OpCode::AddI);
    }

    #[test]
    fn literal_plus_local_swaps_to_use_addi() {
        // `1 + x`, x already a local in r0: the literal arrives as e1, so
        // codecommutative must swap it behind x before the immediate-form
        // search runs, same as a parser-authored `x + 1` would.
        let mut f = fs();
        let mut x = ExpDesc::local(0);
        f.exp2anyreg(&mut x);
        let mut one = ExpDesc::kint(1);
        f.infix(BinOpr::Add, &mut one).unwrap();
        f.posfix(BinOpr::Add, &mut one, &mut x, 1).unwrap();
        assert_eq!(opcode::get_opcode(*f.code.last().unwrap()), OpCode::AddI);
        assert_eq!(opcode::get_arg_b(*f.code.last().unwrap()), 0);
    }

    #[test]
    fn huge_constant_add_uses_addk() {
        let mut f = fs();
        let mut e1 = ExpDesc::local(0);
        f.exp2anyreg(&mut e1);
        let mut e2 = ExpDesc::kflt(1.5);
        f.codearith(BinOpr::Add, &mut e1, &mut e2, false, 1).unwrap();
        assert_eq!(opcode::get_opcode(*f.code.last().unwrap()), OpCode::AddK);
    }

    #[test]
    fn setlist_first_batch_uses_c_one() {
        let mut f = fs();
        f.freereg = 10;
        f.setlist(0, FIELDS_PER_FLUSH, FIELDS_PER_FLUSH).unwrap();
        assert_eq!(opcode::get_arg_c(f.code[0]), 1);
        assert_eq!(opcode::get_arg_b(f.code[0]), FIELDS_PER_FLUSH);
    }

    #[test]
    fn setlist_second_batch_uses_c_two() {
        let mut f = fs();
        f.freereg = 10;
        f.setlist(0, 2 * FIELDS_PER_FLUSH, FIELDS_PER_FLUSH).unwrap();
        assert_eq!(opcode::get_arg_c(f.code[0]), 2);
    }

    #[test]
    fn setlist_multret_encodes_b_zero() {
        let mut f = fs();
        f.freereg = 10;
        f.setlist(0, 1, MULTRET).unwrap();
        assert_eq!(opcode::get_arg_b(f.code[0]), 0);
    }

    #[test]
    fn setlist_overflowing_c_escalates_to_extraarg() {
        let mut f = fs();
        f.freereg = 10;
        let huge = (opcode::MAXARG_C + 5) * FIELDS_PER_FLUSH;
        f.setlist(0, huge, FIELDS_PER_FLUSH).unwrap();
        assert_eq!(opcode::get_arg_c(f.code[0]), 0);
        assert_eq!(opcode::get_opcode(f.code[1]), OpCode::ExtraArg);
    }

    #[test]
    fn ret_zero_uses_compact_form() {
        let mut f = fs();
        f.ret(0, 0);
        assert_eq!(opcode::get_opcode(f.code[0]), OpCode::Return0);
    }
}
