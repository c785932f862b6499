//! A mutable, analyzable basic-block graph for x86-32 rewriting.
//!
//! The crate represents the code of one decomposed block as a subgraph of
//! basic blocks (code, data, and an end sentinel), each carrying decoded
//! instructions, typed successor edges, and symbolic references with a
//! bidirectional referrer relation. On top of the IR sit a structural
//! control-flow analysis, a backward register and flag liveness analysis, a
//! forward redundant memory-access analysis, and a peephole transform with
//! liveness-driven dead code elimination.
//!
//! The IR does not decode machine code; it consumes decoded records shaped
//! like [`Decoded`] from an external [`Decoder`], and it serializes back
//! through the `adze-asm` assembler.

#![warn(missing_docs)]

mod block;
mod decoded;
mod error;
mod instruction;
mod subgraph;

pub mod analysis;
pub mod transform;

#[cfg(any(test, feature = "test-helpers"))]
pub mod helpers;

pub use block::{
    BasicBlock, BasicBlockReference, BlockAttributes, CodeBlock, Condition, DataBlock, EndBlock,
    ReferenceTarget, ReferenceType, Referrer, Successor,
};
pub use decoded::{
    Decoded, Decoder, EFlags, InstructionClass, Opcode, OperandDesc, OperandKind, Prefixes,
};
pub use error::Error;
pub use instruction::{invert_conditional_branch_opcode, Instruction, SourceRange};
pub use subgraph::{
    BasicBlockId, BlockDescription, BlockType, ExternalBlock, ExternalBlockId, Subgraph,
};
