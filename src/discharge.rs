//! Expression materialization (component E): turning an [`ExpDesc`] of any
//! kind into a concrete value somewhere — a register, a constant-table
//! slot, or an `R/K` operand — which every higher-level operation
//! (arithmetic, assignment, table indexing) builds on.

use crate::error::CodegenError;
use crate::expdesc::{ExpDesc, ExpKind};
use crate::funcstate::FuncState;
use crate::konst::{ConstPool, Constant};
use crate::opcode::{self, OpCode};

impl FuncState {
    /// `luaK_nil`, with its adjacent-range merging peephole: consecutive
    /// `LOADNIL` spans that touch or overlap collapse into one instruction
    /// (§9 "LOADNIL merging"), as long as nothing has jumped into the gap.
    pub fn nil(&mut self, from: u8, n: u8) {
        let l = from as i32 + n as i32 - 1;
        if let Some(previous) = self.previous_instruction() {
            if opcode::get_opcode(previous) == OpCode::LoadNil {
                let pfrom = opcode::get_arg_a(previous);
                let pl = pfrom + opcode::get_arg_b(previous);
                if (pfrom <= from as i32 && from as i32 <= pl + 1)
                    || (from as i32 <= pfrom && pfrom <= l + 1)
                {
                    let new_from = pfrom.min(from as i32);
                    let new_l = pl.max(l);
                    let idx = self.code.len() - 1;
                    let mut instr = self.code[idx];
                    opcode::set_arg_a(&mut instr, new_from);
                    opcode::set_arg_b(&mut instr, new_l - new_from);
                    self.code[idx] = instr;
                    log::trace!("merged LOADNIL into r{}..r{}", new_from, new_l);
                    return;
                }
            }
        }
        self.code_abc(OpCode::LoadNil, from as i32, n as i32 - 1, 0);
    }

    /// `luaK_codek`: load constant `k` into `reg`, spilling to `LOADKX` +
    /// `EXTRAARG` when the index doesn't fit a plain `Bx`.
    fn codek(&mut self, reg: u8, k: u32) -> u32 {
        if k as i32 <= opcode::MAXARG_BX {
            self.code_abx(OpCode::LoadK, reg as i32, k)
        } else {
            let pc = self.code_abx(OpCode::LoadKx, reg as i32, 0);
            self.code_ax(k as i32);
            pc
        }
    }

    /// `luaK_int`: `LOADI` when the literal fits `sBx`, else a pooled
    /// constant.
    pub fn int(&mut self, reg: u8, i: i64) -> u32 {
        if opcode::fits_sbx(i) {
            self.code_asbx(OpCode::LoadI, reg as i32, i as i32)
        } else {
            let k = self.pool.int(i);
            self.codek(reg, k)
        }
    }

    /// `luaK_float`: `LOADF` when `f` is a whole number that fits `sBx`
    /// (the op reconstructs the float by converting that integer back),
    /// else a pooled constant — never folds `-0.0` into `LOADF 0`, since
    /// the sign would be lost on that round trip.
    fn load_float(&mut self, reg: u8, f: f64) -> u32 {
        let fi = f as i64;
        if f == fi as f64 && f.is_sign_positive() && opcode::fits_sbx(fi) {
            self.code_asbx(OpCode::LoadF, reg as i32, fi as i32)
        } else {
            let k = self.pool.float(f);
            self.codek(reg, k)
        }
    }

    /// `luaK_dischargevars`: collapse a descriptor's kind down to something
    /// that carries an actual value, emitting whatever load is needed to
    /// fetch it (locals already do, and just get relabeled).
    pub fn dischargevars(&mut self, e: &mut ExpDesc) {
        match e.kind {
            ExpKind::Local(r) => e.kind = ExpKind::NonReloc(r),
            ExpKind::Upval(u) => match self.const_upval(u).cloned() {
                Some(Constant::Int(i)) => e.kind = ExpKind::KInt(i),
                Some(Constant::Float(f)) => e.kind = ExpKind::KFlt(f),
                _ => {
                    let pc = self.code_abc(OpCode::GetUpval, 0, u as i32, 0);
                    e.kind = ExpKind::Reloc(pc);
                }
            },
            ExpKind::IndexUp { t, k } => {
                let pc = self.code_abc(OpCode::GetTabUp, 0, t as i32, k as i32);
                e.kind = ExpKind::Reloc(pc);
            }
            ExpKind::IndexI { t, idx } => {
                let pc = self.code_abc(OpCode::GetI, 0, t as i32, idx);
                self.free_reg(t);
                e.kind = ExpKind::Reloc(pc);
            }
            ExpKind::IndexStr { t, k } => {
                let pc = self.code_abc(OpCode::GetField, 0, t as i32, k as i32);
                self.free_reg(t);
                e.kind = ExpKind::Reloc(pc);
            }
            ExpKind::Indexed { t, k } => {
                let pc = self.code_abc(OpCode::GetTable, 0, t as i32, k as i32);
                self.free_regs(t, k);
                e.kind = ExpKind::Reloc(pc);
            }
            ExpKind::Call(_) => self.setoneret(e),
            ExpKind::Vararg(pc) => {
                let mut instr = self.code[pc as usize];
                opcode::set_arg_c(&mut instr, 2);
                self.code[pc as usize] = instr;
                e.kind = ExpKind::Reloc(pc);
            }
            _ => {}
        }
    }

    /// `luaK_setoneret`: an open call that needs exactly one result either
    /// stays where its sole result already lands (register call form) or
    /// becomes relocatable.
    pub fn setoneret(&mut self, e: &mut ExpDesc) {
        let ExpKind::Call(pc) = e.kind else {
            unreachable!("setoneret on a non-call descriptor")
        };
        let mut instr = self.code[pc as usize];
        opcode::set_arg_c(&mut instr, 2);
        self.code[pc as usize] = instr;
        e.kind = ExpKind::NonReloc(opcode::get_arg_a(instr) as u8);
    }

    /// `luaK_setreturns`: fix an open call or vararg's result count.
    pub fn setreturns(&mut self, e: &ExpDesc, nresults: i32) {
        let pc = match e.kind {
            ExpKind::Call(pc) | ExpKind::Vararg(pc) => pc,
            _ => return,
        };
        let mut instr = self.code[pc as usize];
        opcode::set_arg_c(&mut instr, nresults + 1);
        self.code[pc as usize] = instr;
    }

    /// `luaK_stringK`: intern a string constant and return its pool index.
    pub fn string_k(&mut self, s: impl Into<std::rc::Rc<str>>) -> u32 {
        self.pool.string(s)
    }

    /// `discharge2reg`: force `e`'s value into register `reg`, emitting
    /// whichever load the descriptor's kind calls for.
    pub(crate) fn discharge2reg(&mut self, e: &mut ExpDesc, reg: u8) {
        self.dischargevars(e);
        match e.kind {
            ExpKind::Nil => self.nil(reg, 1),
            ExpKind::False => {
                self.code_abc(OpCode::LoadBool, reg as i32, 0, 0);
            }
            ExpKind::True => {
                self.code_abc(OpCode::LoadBool, reg as i32, 1, 0);
            }
            ExpKind::K(k) => {
                self.codek(reg, k);
            }
            ExpKind::KInt(i) => {
                self.int(reg, i);
            }
            ExpKind::KFlt(f) => {
                self.load_float(reg, f);
            }
            ExpKind::Reloc(pc) => {
                let mut instr = self.code[pc as usize];
                opcode::set_arg_a(&mut instr, reg as i32);
                self.code[pc as usize] = instr;
            }
            ExpKind::NonReloc(r) => {
                if r != reg {
                    self.code_abc(OpCode::Move, reg as i32, r as i32, 0);
                }
            }
            _ => return,
        }
        e.kind = ExpKind::NonReloc(reg);
    }

    /// `luaK_exp2nextreg`: discharge into the next free register.
    pub fn exp2nextreg(&mut self, e: &mut ExpDesc) -> Result<(), CodegenError> {
        self.dischargevars(e);
        self.free_exp(e);
        self.reserve_regs(1)?;
        let reg = self.freereg - 1;
        self.exp2reg(e, reg)
    }

    /// `luaK_exp2anyreg`: discharge into whatever register is cheapest —
    /// reusing `e`'s own register if it already has one live past the
    /// point where locals are pinned.
    pub(crate) fn discharge2anyreg(&mut self, e: &mut ExpDesc) {
        self.dischargevars(e);
        if let ExpKind::NonReloc(r) = e.kind {
            if !e.has_jumps() {
                return;
            }
            if r >= self.nactvar {
                self.exp2reg(e, r).expect("patching e's own register cannot overflow sJ");
                return;
            }
        }
        self.exp2nextreg(e).expect("reserving one register cannot overflow stack limits here");
    }

    pub fn exp2anyreg(&mut self, e: &mut ExpDesc) -> u8 {
        self.discharge2anyreg(e);
        e.nonreloc_reg().expect("discharge2anyreg always yields NonReloc")
    }

    /// `luaK_exp2anyregup`: like [`Self::exp2anyreg`], but an upvalue with
    /// no pending jumps can be used directly without materializing it.
    pub fn exp2anyregup(&mut self, e: &mut ExpDesc) -> Result<(), CodegenError> {
        if !matches!(e.kind, ExpKind::Upval(_)) || e.has_jumps() {
            self.exp2anyreg(e);
        }
        Ok(())
    }

    /// `luaK_exp2val`: ensure `e` has a concrete value, without forcing a
    /// register unless a pending jump list demands one.
    pub fn exp2val(&mut self, e: &mut ExpDesc) {
        if e.has_jumps() {
            self.exp2anyreg(e);
        } else {
            self.dischargevars(e);
        }
    }

    /// `exp2K` / `luaK_exp2K` combined: intern `e` as a pooled constant
    /// when it is one and has no pending jumps, reporting whether that
    /// succeeded (and whether the resulting index fits an `R/K` operand).
    fn exp2k(&mut self, e: &mut ExpDesc) -> bool {
        if e.has_jumps() {
            return false;
        }
        let info = match e.kind {
            ExpKind::True => self.pool.bool(true),
            ExpKind::False => self.pool.bool(false),
            ExpKind::Nil => self.pool.nil(),
            ExpKind::KInt(i) => self.pool.int(i),
            ExpKind::KFlt(f) => self.pool.float(f),
            ExpKind::K(k) => k,
            _ => return false,
        };
        if ConstPool::fits_rk(info) {
            e.kind = ExpKind::K(info);
            true
        } else {
            false
        }
    }

    /// `luaK_exp2RK`: yield `(operand, is_constant)` for use as an
    /// instruction's `R/K`-tagged operand, materializing into a register
    /// when `e` isn't eligible for the constant table.
    pub fn exp2rk(&mut self, e: &mut ExpDesc) -> (i32, bool) {
        if self.exp2k(e) {
            let ExpKind::K(k) = e.kind else { unreachable!() };
            (k as i32, true)
        } else {
            (self.exp2anyreg(e) as i32, false)
        }
    }

    /// `luaK_storevar`: emit whatever assignment form `var`'s kind
    /// requires to store `ex` into it.
    pub fn storevar(&mut self, var: &ExpDesc, ex: &mut ExpDesc) -> Result<(), CodegenError> {
        match var.kind {
            ExpKind::Local(r) => {
                self.free_exp(ex);
                self.exp2reg(ex, r)?;
                return Ok(());
            }
            ExpKind::Upval(u) => {
                let r = self.exp2anyreg(ex);
                self.code_abc(OpCode::SetUpval, r as i32, u as i32, 0);
            }
            ExpKind::IndexUp { t, k } => {
                let (rk, is_k) = self.exp2rk(ex);
                self.code_abck(OpCode::SetTabUp, t as i32, k as i32, rk, is_k);
            }
            ExpKind::IndexI { t, idx } => {
                let (rk, is_k) = self.exp2rk(ex);
                self.code_abck(OpCode::SetI, t as i32, idx, rk, is_k);
            }
            ExpKind::IndexStr { t, k } => {
                let (rk, is_k) = self.exp2rk(ex);
                self.code_abck(OpCode::SetField, t as i32, k as i32, rk, is_k);
            }
            ExpKind::Indexed { t, k } => {
                let (rk, is_k) = self.exp2rk(ex);
                self.code_abck(OpCode::SetTable, t as i32, k as i32, rk, is_k);
            }
            _ => unreachable!("storevar on a non-variable descriptor"),
        }
        self.free_exp(ex);
        Ok(())
    }

    /// `luaK_indexed`: build the indexing descriptor for `t[k]`, picking
    /// the narrowest `ExpKind` the operands allow (string-field, small
    /// integer, upvalue-rooted, or the fully general register form).
    pub fn indexed(&mut self, t: &mut ExpDesc, k: &mut ExpDesc) -> ExpDesc {
        if let ExpKind::Upval(u) = t.kind {
            if let ExpKind::K(kidx) = k.kind {
                return ExpDesc::new(ExpKind::IndexUp { t: u, k: kidx });
            }
            self.discharge2anyreg(t);
        }
        let treg = t.nonreloc_reg().expect("indexed target must already be in a register");
        if let ExpKind::K(kidx) = k.kind {
            return ExpDesc::new(ExpKind::IndexStr { t: treg, k: kidx });
        }
        if let ExpKind::KInt(i) = k.kind {
            if opcode::fits_sc(i) {
                return ExpDesc::new(ExpKind::IndexI { t: treg, idx: i as i32 });
            }
        }
        let kreg = self.exp2anyreg(k);
        ExpDesc::new(ExpKind::Indexed { t: treg, k: kreg })
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
    fn adjacent_loadnil_ranges_merge() {
        let mut f = fs();
        f.nil(0, 2);
        f.nil(2, 1);
        assert_eq!(f.code.len(), 1);
        assert_eq!(opcode::get_arg_a(f.code[0]), 0);
        assert_eq!(opcode::get_arg_b(f.code[0]), 2);
    }

    #[test]
    fn non_adjacent_loadnil_ranges_stay_separate() {
        let mut f = fs();
        f.nil(0, 1);
        f.nil(5, 1);
        assert_eq!(f.code.len(), 2);
    }

    #[test]
    fn small_int_uses_loadi() {
        let mut f = fs();
        let mut e = ExpDesc::kint(42);
        f.exp2nextreg(&mut e).unwrap();
        assert_eq!(opcode::get_opcode(f.code[0]), OpCode::LoadI);
    }

    #[test]
    fn huge_int_uses_constant_pool() {
        let mut f = fs();
        let mut e = ExpDesc::kint(i64::MAX);
        f.exp2nextreg(&mut e).unwrap();
        assert!(matches!(
            opcode::get_opcode(f.code[0]),
            OpCode::LoadK | OpCode::LoadKx
        ));
    }

    #[test]
    fn local_discharges_without_emitting() {
        let mut f = fs();
        let mut e = ExpDesc::local(3);
        f.dischargevars(&mut e);
        assert_eq!(e.kind, ExpKind::NonReloc(3));
        assert_eq!(f.code.len(), 0);
    }

    #[test]
    fn exp2rk_prefers_constant_table() {
        let mut f = fs();
        let mut e = ExpDesc::kint(7);
        let (operand, is_k) = f.exp2rk(&mut e);
        assert!(is_k);
        assert_eq!(f.pool.k[operand as usize], crate::konst::Constant::Int(7));
    }
}
