//! The immutable output of one finished function compilation (§6
//! "Prototype outputs").

use crate::konst::Constant;
use crate::lineinfo::AbsLineInfo;

#[derive(Debug, Clone)]
pub struct Proto {
    pub code: Vec<u32>,
    pub lineinfo: Vec<i8>,
    pub abslineinfo: Vec<AbsLineInfo>,
    pub k: Vec<Constant>,
    pub maxstacksize: u8,
    pub numparams: u8,
    pub is_vararg: bool,
}
