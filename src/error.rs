//! Capacity errors (§7.1). These are the only failures the generator's
//! public API can return; everything else is an internal-invariant
//! assertion (§7.2), since it marks a generator bug rather than bad input.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodegenError {
    #[error("function or expression needs too many registers")]
    TooManyRegisters,

    #[error("control structure too long")]
    ControlStructureTooLong,

    #[error("constructor too long")]
    ConstructorTooLong,

    /// Raised by the driver's array-growth primitive (§6: "memory-growing
    /// primitive for dynamic arrays" is consumed from the parser, not owned
    /// by this crate), not constructed anywhere in this module.
    #[error("too many {what} in function")]
    ArrayOverflow { what: &'static str },
}
