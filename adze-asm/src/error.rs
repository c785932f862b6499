//! Assembler error variants.

use thiserror::Error;

/// Errors surfaced by operand construction and instruction encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Error {
    /// An 8-bit PC-relative encoding cannot reach the requested target from
    /// the current location. The caller should retry with a 32-bit reach.
    #[error("target {target:#010x} is out of 8-bit reach from {location:#010x}")]
    EncodingOutOfRange {
        /// Location of the instruction being encoded.
        location: u32,
        /// Absolute branch target.
        target: u32,
    },
    /// The caller supplied a structurally forbidden operand or value.
    #[error("invalid operand: {0}")]
    InvalidOperand(&'static str),
}
