//! Expression-and-jump code generator for a register-based bytecode
//! compiler.
//!
//! This crate is the part of a compiler that sits between a parser and a
//! register VM: it owns one [`FuncState`] per nested function being
//! compiled, accepts [`ExpDesc`] values as the parser resolves names,
//! literals, and operators, and emits a packed [`OpCode`] stream plus a
//! constant pool and line-info table, bundled into a [`Proto`] once the
//! function closes.
//!
//! Lexing, grammar dispatch, symbol-table bookkeeping, and the VM's
//! execution loop are the driver's job, not this crate's — see each
//! module's doc comment for the slice of the pipeline it owns.

pub mod arith;
pub mod discharge;
pub mod error;
pub mod expdesc;
pub mod funcstate;
pub mod jump;
pub mod konst;
pub mod lineinfo;
pub mod opcode;
pub mod proto;

pub use arith::{BinOpr, UnOpr};
pub use error::CodegenError;
pub use expdesc::{ExpDesc, ExpKind, NO_JUMP};
pub use funcstate::FuncState;
pub use konst::{ConstPool, Constant};
pub use lineinfo::AbsLineInfo;
pub use opcode::{OpCode, OpMode};
pub use proto::Proto;
