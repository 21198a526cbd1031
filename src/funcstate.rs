//! Function-under-construction state: the struct every component operates
//! on, plus the instruction-encoder (component A), register-allocator
//! (component C), and lifecycle/finalizer (component H) pieces that don't
//! belong to a more specific module.

use std::collections::HashMap;
use std::rc::Rc;

use crate::error::CodegenError;
use crate::expdesc::{ExpDesc, NO_JUMP};
use crate::konst::{ConstPool, Constant};
use crate::lineinfo::LineInfoRecorder;
use crate::opcode::{self, OpCode, OpMode};
use crate::proto::Proto;

/// Registers must fit an 8-bit operand; `255` itself is reserved as
/// [`opcode::NO_REG`].
pub const MAXREGS: u8 = 255;

/// Bound on jump-to-jump chain following in the finalizer (§4.H, §9): any
/// value at least as large as the longest realistic chain is acceptable.
pub const MAX_JUMP_CHAIN: u32 = 100;

pub struct FuncState {
    pub code: Vec<u32>,
    pub lines: LineInfoRecorder,
    pub pool: ConstPool,

    pub nactvar: u8,
    pub freereg: u8,
    pub maxstacksize: u8,

    pub lasttarget: u32,

    pub needclose: bool,
    pub is_vararg: bool,
    pub numparams: u8,

    /// Current source line, set by the driver before each emitting call
    /// (§6: "lastline: int — the current source line").
    pub lastline: i32,

    /// Ambient: enclosing function, for upvalue constant-folding hand-off.
    pub parent: Option<Box<FuncState>>,
    /// Ambient: chunk name, carried only for diagnostics.
    pub source: Rc<str>,

    /// `const2exp`: upvalues the driver has already resolved to a
    /// `<const>` binding with a known numeral value. Populated by the
    /// parser-equivalent driver, not by this crate — the generator only
    /// needs a place to receive the fact so `dischargevars` can fold it
    /// away instead of emitting `GETUPVAL` (§ supplemented features).
    const_upvals: HashMap<u8, Constant>,
}

impl FuncState {
    pub fn open(parent: Option<Box<FuncState>>, source: Rc<str>, is_vararg: bool, numparams: u8) -> Self {
        FuncState {
            code: Vec::new(),
            lines: LineInfoRecorder::default(),
            pool: ConstPool::default(),
            nactvar: 0,
            freereg: 0,
            maxstacksize: 0,
            lasttarget: 0,
            needclose: false,
            is_vararg,
            numparams,
            lastline: 0,
            parent,
            source,
            const_upvals: HashMap::new(),
        }
    }

    pub fn pc(&self) -> u32 {
        self.code.len() as u32
    }

    /// Record that upvalue `idx` is a `<const>` binding with a known
    /// numeral value, so later `dischargevars` folds references to it
    /// instead of emitting `GETUPVAL`.
    pub fn bind_const_upval(&mut self, idx: u8, value: Constant) {
        self.const_upvals.insert(idx, value);
    }

    pub(crate) fn const_upval(&self, idx: u8) -> Option<&Constant> {
        self.const_upvals.get(&idx)
    }

    // ---- component A: instruction encoder -----------------------------

    fn code(&mut self, instr: u32) -> u32 {
        self.code.push(instr);
        let pc = self.pc();
        self.lines.save(pc, self.lastline);
        pc - 1
    }

    pub fn code_abck(&mut self, op: OpCode, a: i32, b: i32, c: i32, k: bool) -> u32 {
        debug_assert_eq!(op.mode(), OpMode::ABC);
        self.code(opcode::create_abck(op, a, b, c, k))
    }

    pub fn code_abc(&mut self, op: OpCode, a: i32, b: i32, c: i32) -> u32 {
        self.code_abck(op, a, b, c, false)
    }

    pub fn code_abx(&mut self, op: OpCode, a: i32, bx: u32) -> u32 {
        debug_assert!(matches!(op.mode(), OpMode::ABx));
        self.code(opcode::create_abx(op, a, bx))
    }

    pub fn code_asbx(&mut self, op: OpCode, a: i32, bc: i32) -> u32 {
        debug_assert!(matches!(op.mode(), OpMode::AsBx));
        let b = (bc + opcode::OFFSET_SBX) as u32;
        self.code(opcode::create_abx(op, a, b))
    }

    pub fn code_sj(&mut self, op: OpCode, sj: i32) -> u32 {
        let j = (sj + opcode::OFFSET_SJ) as u32;
        self.code(opcode::create_sj(op, j))
    }

    pub fn code_ax(&mut self, a: i32) -> u32 {
        self.code(opcode::create_ax(OpCode::ExtraArg, a as u32))
    }

    /// `luaK_jump`: emit an unresolved jump, returning its pc so the
    /// destination can be patched later.
    pub fn jump(&mut self) -> u32 {
        self.code_sj(OpCode::Jmp, NO_JUMP)
    }

    /// Instruction at `pc`, or `None` if a jump target lies between it and
    /// the current instruction — the only basic-block barrier this
    /// generator tracks (§9 "Peephole adjacency").
    pub fn previous_instruction(&self) -> Option<u32> {
        if self.pc() > self.lasttarget {
            self.code.last().copied()
        } else {
            None
        }
    }

    /// `luaK_getlabel`: mark "here" as a jump target and return it.
    pub fn getlabel(&mut self) -> u32 {
        self.lasttarget = self.pc();
        self.lasttarget
    }

    /// Undo the most recently emitted instruction, including its line
    /// info. Used when a peephole rewrite (e.g. removing a `NOT` before
    /// negating a jump condition) supersedes it.
    pub fn remove_last_instruction(&mut self) {
        self.lines.rewind(self.pc());
        self.code.pop();
    }

    /// `luaK_fixline`: re-stamp the most recently emitted instruction with
    /// a different source line (used after constant-folding/relocating an
    /// operation to the line of its operator rather than its operands).
    pub fn fixline(&mut self, line: i32) {
        self.lines.rewind(self.pc());
        let pc = self.pc();
        self.lines.save(pc, line);
    }

    // ---- component C: register allocator -------------------------------

    pub fn checkstack(&mut self, n: u8) -> Result<(), CodegenError> {
        let newstack = self.freereg as u32 + n as u32;
        if newstack > self.maxstacksize as u32 {
            if newstack >= MAXREGS as u32 {
                return Err(CodegenError::TooManyRegisters);
            }
            self.maxstacksize = newstack as u8;
        }
        Ok(())
    }

    pub fn reserve_regs(&mut self, n: u8) -> Result<(), CodegenError> {
        self.checkstack(n)?;
        self.freereg += n;
        Ok(())
    }

    /// `freereg`: release a register, but only if it isn't a pinned local
    /// (invariant 1: freeing below `nactvar` is a no-op).
    pub fn free_reg(&mut self, reg: u8) {
        if reg >= self.nactvar {
            debug_assert_eq!(reg, self.freereg - 1, "register frees must be LIFO");
            self.freereg -= 1;
        }
    }

    /// `freeregs`: release the higher-numbered register first (§5
    /// ordering contract).
    pub fn free_regs(&mut self, r1: u8, r2: u8) {
        if r1 > r2 {
            self.free_reg(r1);
            self.free_reg(r2);
        } else {
            self.free_reg(r2);
            self.free_reg(r1);
        }
    }

    /// `freeexp`: release the register `e` holds, if any (only `NonReloc`
    /// expressions hold one).
    pub fn free_exp(&mut self, e: &ExpDesc) {
        if let Some(r) = e.nonreloc_reg() {
            self.free_reg(r);
        }
    }

    /// `freeexps`: release both expressions' registers in proper order.
    pub fn free_exps(&mut self, e1: &ExpDesc, e2: &ExpDesc) {
        let r1 = e1.nonreloc_reg();
        let r2 = e2.nonreloc_reg();
        match (r1, r2) {
            (Some(a), Some(b)) => self.free_regs(a, b),
            (Some(a), None) => self.free_reg(a),
            (None, Some(b)) => self.free_reg(b),
            (None, None) => {}
        }
    }

    // ---- lifecycle / finalizer (component H) ---------------------------

    /// Close this function, running the finalizer pass and handing back
    /// its immutable prototype.
    pub fn finish(mut self) -> Proto {
        self.finalize();
        log::debug!(
            "closed function \"{}\": {} instructions, {} constants, {} registers",
            self.source,
            self.code.len(),
            self.pool.k.len(),
            self.maxstacksize
        );
        Proto {
            code: self.code,
            lineinfo: self.lines.lineinfo,
            abslineinfo: self.lines.abslineinfo,
            k: self.pool.k,
            maxstacksize: self.maxstacksize,
            numparams: self.numparams,
            is_vararg: self.is_vararg,
        }
    }

    fn finalize(&mut self) {
        let pc_count = self.code.len();
        for i in 0..pc_count {
            if i > 0 {
                debug_assert_eq!(
                    opcode::is_output_tail(opcode::get_opcode(self.code[i - 1])),
                    opcode::is_input_tail(opcode::get_opcode(self.code[i])),
                );
            }
            let op = opcode::get_opcode(self.code[i]);
            match op {
                OpCode::Return0 | OpCode::Return1 => {
                    if self.needclose || self.is_vararg {
                        // Upgrade to the general RETURN form so the extra
                        // close/vararg operand has somewhere to live.
                        let instr = self.code[i];
                        self.code[i] = opcode::create_abck(
                            OpCode::Return,
                            opcode::get_arg_a(instr),
                            opcode::get_arg_b(instr),
                            opcode::get_arg_c(instr),
                            opcode::get_arg_k(instr),
                        );
                        self.finish_return(i);
                    }
                }
                OpCode::Return | OpCode::TailCall => self.finish_return(i),
                OpCode::Jmp => {
                    let target = self.final_target(i as u32);
                    if target != i as u32 + 1 + opcode::get_arg_sj(self.code[i]) as u32 {
                        log::trace!("collapsed jump chain at pc {} to pc {}", i, target);
                    }
                    let mut instr = self.code[i];
                    let offset = target as i32 - (i as i32 + 1);
                    opcode::set_arg_sj(&mut instr, offset)
                        .expect("jump chain collapsing cannot overflow a range already checked");
                    self.code[i] = instr;
                }
                _ => {}
            }
        }
    }

    fn finish_return(&mut self, i: usize) {
        if self.needclose || self.is_vararg {
            let mut instr = self.code[i];
            let c = if self.is_vararg { self.numparams as i32 + 1 } else { 0 };
            opcode::set_arg_c(&mut instr, c);
            opcode::set_arg_k(&mut instr, true);
            self.code[i] = instr;
        }
    }

    /// `finaltarget`: follow a chain of jump-to-jump instructions to its
    /// terminal destination, bounded to avoid an infinite loop on a
    /// pathological (self-referential) chain.
    fn final_target(&self, mut i: u32) -> u32 {
        for _ in 0..MAX_JUMP_CHAIN {
            let instr = self.code[i as usize];
            if opcode::get_opcode(instr) != OpCode::Jmp {
                break;
            }
            i = (i as i32 + opcode::get_arg_sj(instr) + 1) as u32;
        }
        i
    }
}
