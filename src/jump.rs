//! Jump list engine (component F).
//!
//! A jump list is the head pc of a chain threaded through the `sJ` operand
//! of pending `JMP` instructions, terminated by [`NO_JUMP`]. This module
//! also hosts the short-circuit compilation driven from `goiftrue`/
//! `goiffalse` (AND/OR) and `codenot`.

use crate::error::CodegenError;
use crate::expdesc::{ExpDesc, ExpKind, NO_JUMP};
use crate::funcstate::FuncState;
use crate::opcode::{self, OpCode};

impl FuncState {
    /// `getjump`: read the sJ operand at `pc`, turning a relative offset
    /// into the next absolute list position (or `NO_JUMP` at list end).
    fn getjump(&self, pc: u32) -> i32 {
        let offset = opcode::get_arg_sj(self.code[pc as usize]);
        if offset == NO_JUMP {
            NO_JUMP
        } else {
            pc as i32 + 1 + offset
        }
    }

    /// `fixjump`: point the jump at `pc` at `dest` (which must already be
    /// behind it or ahead of it within sJ range — no other constraint,
    /// callers enforce direction where it matters, e.g. `patchlist`).
    fn fixjump(&mut self, pc: u32, dest: u32) -> Result<(), CodegenError> {
        let offset = dest as i32 - (pc as i32 + 1);
        debug_assert_eq!(opcode::get_opcode(self.code[pc as usize]), OpCode::Jmp);
        let mut instr = self.code[pc as usize];
        opcode::set_arg_sj(&mut instr, offset)?;
        self.code[pc as usize] = instr;
        Ok(())
    }

    /// `luaK_concat`: append jump list `l2` onto `l1`.
    pub fn concat(&mut self, l1: &mut i32, l2: i32) {
        if l2 == NO_JUMP {
            return;
        }
        if *l1 == NO_JUMP {
            *l1 = l2;
            return;
        }
        let mut list = *l1 as u32;
        loop {
            let next = self.getjump(list);
            if next == NO_JUMP {
                break;
            }
            list = next as u32;
        }
        self.fixjump(list, l2 as u32)
            .expect("appending an already-live jump cannot overflow sJ range");
    }

    /// `luaK_patchlist`: patch every jump in `list` to `target`. `target`
    /// must already have been emitted (§5 ordering contract: forward
    /// jumps stay open until their destination pc is known).
    pub fn patchlist(&mut self, list: i32, target: u32) -> Result<(), CodegenError> {
        debug_assert!(target <= self.pc());
        self.patchlist_aux(list, target as i32, opcode::NO_REG, target as i32)
    }

    /// `luaK_patchtohere`: mark "here" as a target, then patch `list` here.
    pub fn patchtohere(&mut self, list: i32) -> Result<(), CodegenError> {
        let here = self.getlabel();
        self.patchlist(list, here)
    }

    /// Index of the instruction that "controls" the jump at `pc` — the
    /// preceding test/comparison opcode, if any, else the jump itself.
    fn getjumpcontrol(&self, pc: u32) -> u32 {
        if pc >= 1 && opcode::test_mode(opcode::get_opcode(self.code[pc as usize - 1])) {
            pc - 1
        } else {
            pc
        }
    }

    /// `patchtestreg`: if the jump at `node`'s controller is a `TESTSET`,
    /// either repoint its destination register to `reg`, or (when no
    /// register is wanted, or it already holds the value) demote it to a
    /// plain value-less `TEST`. Returns false for any other controller.
    fn patchtestreg(&mut self, node: u32, reg: i32) -> bool {
        let ctrl = self.getjumpcontrol(node);
        let instr = self.code[ctrl as usize];
        if opcode::get_opcode(instr) != OpCode::TestSet {
            return false;
        }
        let b = opcode::get_arg_b(instr);
        if reg != opcode::NO_REG && reg != b {
            let mut instr = instr;
            opcode::set_arg_a(&mut instr, reg);
            self.code[ctrl as usize] = instr;
        } else {
            self.code[ctrl as usize] =
                opcode::create_abck(OpCode::Test, b, 0, 0, opcode::get_arg_k(instr));
        }
        true
    }

    /// `removevalues`: demote every `TESTSET` in `list` to a plain `TEST`
    /// — used when a jump list's boolean result becomes unreachable
    /// (`codenot` discards the value both lists would have produced).
    fn remove_values(&mut self, mut list: i32) {
        while list != NO_JUMP {
            self.patchtestreg(list as u32, opcode::NO_REG);
            list = self.getjump(list as u32);
        }
    }

    /// `patchlistaux`: patch every node in `list`; value-producing tests
    /// jump to `vtarget` (storing into `reg`), others to `dtarget`.
    fn patchlist_aux(
        &mut self,
        mut list: i32,
        vtarget: i32,
        reg: i32,
        dtarget: i32,
    ) -> Result<(), CodegenError> {
        while list != NO_JUMP {
            let next = self.getjump(list as u32);
            if self.patchtestreg(list as u32, reg) {
                self.fixjump(list as u32, vtarget as u32)?;
            } else {
                self.fixjump(list as u32, dtarget as u32)?;
            }
            list = next;
        }
        Ok(())
    }

    /// Ensure the final result of `e` (including any pending jump lists)
    /// lands in register `reg`.
    pub(crate) fn exp2reg(&mut self, e: &mut ExpDesc, reg: u8) -> Result<(), CodegenError> {
        self.discharge2reg(e, reg);
        if let ExpKind::Jmp(pc) = e.kind {
            self.concat(&mut e.t, pc as i32);
        }
        if e.has_jumps() {
            let mut p_f = NO_JUMP;
            let mut p_t = NO_JUMP;
            if self.need_value(e.t) || self.need_value(e.f) {
                let fj = if matches!(e.kind, ExpKind::Jmp(_)) {
                    NO_JUMP
                } else {
                    self.jump() as i32
                };
                p_f = self.code_loadbool(reg as i32, false, true) as i32;
                p_t = self.code_loadbool(reg as i32, true, false) as i32;
                self.patchtohere(fj)?;
            }
            let final_pc = self.getlabel() as i32;
            self.patchlist_aux(e.f, final_pc, reg as i32, p_f)?;
            self.patchlist_aux(e.t, final_pc, reg as i32, p_t)?;
        }
        e.f = NO_JUMP;
        e.t = NO_JUMP;
        e.kind = ExpKind::NonReloc(reg);
        Ok(())
    }

    /// Does any jump in `list` fail to produce a value (i.e. is not a
    /// `TESTSET`)? If so, `exp2reg` must synthesize explicit load-bool
    /// instructions for it.
    fn need_value(&self, mut list: i32) -> bool {
        while list != NO_JUMP {
            let ctrl = self.getjumpcontrol(list as u32);
            if opcode::get_opcode(self.code[ctrl as usize]) != OpCode::TestSet {
                return true;
            }
            list = self.getjump(list as u32);
        }
        false
    }

    fn code_loadbool(&mut self, a: i32, b: bool, skip: bool) -> u32 {
        self.getlabel(); // these may be jump targets
        self.code_abc(OpCode::LoadBool, a, b as i32, skip as i32)
    }

    /// `negatecondition`: flip the `k` bit of the comparison controlling
    /// a `JMP` descriptor, inverting which branch it takes.
    fn negate_condition(&mut self, e: &ExpDesc) {
        let ExpKind::Jmp(pc) = e.kind else {
            unreachable!("negate_condition called on a non-JMP descriptor")
        };
        let ctrl = self.getjumpcontrol(pc);
        let mut instr = self.code[ctrl as usize];
        debug_assert!(opcode::test_mode(opcode::get_opcode(instr)));
        debug_assert!(!matches!(
            opcode::get_opcode(instr),
            OpCode::TestSet | OpCode::Test
        ));
        let k = opcode::get_arg_k(instr);
        opcode::set_arg_k(&mut instr, !k);
        self.code[ctrl as usize] = instr;
    }

    /// `jumponcond`: emit a jump taken when `e` equals `cond`. Folds away
    /// a trailing `NOT` by inverting the condition instead.
    fn jumponcond(&mut self, e: &mut ExpDesc, cond: bool) -> u32 {
        if let ExpKind::Reloc(pc) = e.kind {
            if opcode::get_opcode(self.code[pc as usize]) == OpCode::Not {
                let b = opcode::get_arg_b(self.code[pc as usize]);
                self.remove_last_instruction();
                let test = self.code_abck(OpCode::Test, b, 0, 0, !cond);
                return self.jump_after(test);
            }
        }
        self.discharge2anyreg(e);
        self.free_exp(e);
        let reg = e.nonreloc_reg().expect("discharge2anyreg always yields NonReloc");
        let test = self.code_abck(OpCode::TestSet, opcode::NO_REG, reg as i32, 0, cond);
        self.jump_after(test)
    }

    fn jump_after(&mut self, _test_pc: u32) -> u32 {
        self.jump()
    }

    /// `luaK_goiftrue`: emit code to fall through when `e` is true, jump
    /// when false.
    pub fn goiftrue(&mut self, e: &mut ExpDesc) -> Result<(), CodegenError> {
        self.dischargevars(e);
        let pc = match e.kind {
            ExpKind::Jmp(_) => {
                self.negate_condition(e);
                let ExpKind::Jmp(pc) = e.kind else { unreachable!() };
                pc as i32
            }
            ExpKind::K(_) | ExpKind::KFlt(_) | ExpKind::KInt(_) | ExpKind::True => NO_JUMP,
            _ => self.jumponcond(e, false) as i32,
        };
        self.concat(&mut e.f, pc);
        self.patchtohere(e.t)?;
        e.t = NO_JUMP;
        Ok(())
    }

    /// `luaK_goiffalse`: dual of [`Self::goiftrue`].
    pub fn goiffalse(&mut self, e: &mut ExpDesc) -> Result<(), CodegenError> {
        self.dischargevars(e);
        let pc = match e.kind {
            ExpKind::Jmp(pc) => pc as i32,
            ExpKind::Nil | ExpKind::False => NO_JUMP,
            _ => self.jumponcond(e, true) as i32,
        };
        self.concat(&mut e.t, pc);
        self.patchtohere(e.f)?;
        e.f = NO_JUMP;
        Ok(())
    }

    /// `codenot`: fold `not e` at compile time where possible, else emit
    /// `NOT`; either way, swap the true/false lists and strip any value
    /// they would have produced (useless once negated).
    pub(crate) fn codenot(&mut self, e: &mut ExpDesc) {
        self.dischargevars(e);
        match e.kind {
            ExpKind::Nil | ExpKind::False => e.kind = ExpKind::True,
            ExpKind::K(_) | ExpKind::KFlt(_) | ExpKind::KInt(_) | ExpKind::True => {
                e.kind = ExpKind::False
            }
            ExpKind::Jmp(_) => self.negate_condition(e),
            ExpKind::Reloc(_) | ExpKind::NonReloc(_) => {
                self.discharge2anyreg(e);
                self.free_exp(e);
                let reg = e.nonreloc_reg().unwrap();
                let pc = self.code_abc(OpCode::Not, 0, reg as i32, 0);
                e.kind = ExpKind::Reloc(pc);
            }
            _ => unreachable!("codenot on a non-value-producing descriptor"),
        }
        std::mem::swap(&mut e.t, &mut e.f);
        self.remove_values(e.f);
        self.remove_values(e.t);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expdesc::ExpDesc;
    use std::rc::Rc;

    fn fs() -> FuncState {
        FuncState::open(None, Rc::from("test"), false, 0)
    }

    #[test]
    fn concat_two_lists() {
        let mut f = fs();
        let j1 = f.jump() as i32;
        let j2 = f.jump() as i32;
        let mut l1 = j1;
        f.concat(&mut l1, j2);
        assert_eq!(f.getjump(j1 as u32), j2);
    }

    #[test]
    fn patchlist_resolves_all_nodes() {
        let mut f = fs();
        let j1 = f.jump() as i32;
        let j2 = f.jump() as i32;
        let mut l1 = j1;
        f.concat(&mut l1, j2);
        let target = f.pc();
        f.patchlist(l1, target).unwrap();
        assert_eq!(f.getjump(j1 as u32), NO_JUMP);
    }

    #[test]
    fn and_short_circuit_produces_testset_chain() {
        let mut f = fs();
        let mut a = ExpDesc::local(0);
        f.goiftrue(&mut a).unwrap();
        assert!(matches!(
            opcode::get_opcode(f.code[0]),
            OpCode::TestSet
        ));
        assert_eq!(opcode::get_opcode(f.code[1]), OpCode::Jmp);
    }

    #[test]
    fn goiftrue_on_constant_emits_nothing() {
        let mut f = fs();
        let mut k = ExpDesc::ktrue();
        f.goiftrue(&mut k).unwrap();
        assert_eq!(f.code.len(), 0);
    }

    #[test]
    fn codenot_twice_restores_jump_lists() {
        let mut f = fs();
        let mut a = ExpDesc::local(0);
        f.goiftrue(&mut a).unwrap();
        let (t0, f0) = (a.t, a.f);
        f.codenot(&mut a);
        f.codenot(&mut a);
        assert_eq!((a.t, a.f), (t0, f0));
    }
}
