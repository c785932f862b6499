//! Graph and analysis error variants.

use crate::decoded::Opcode;
use crate::subgraph::BasicBlockId;
use thiserror::Error;

/// Errors surfaced by the basic-block graph and its analyses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The structural analysis settled without collapsing the flow graph to
    /// a single region node.
    #[error("the flow graph is irreducible")]
    Irreducible,
    /// The opcode has no complementary conditional branch. `JCXZ`/`JECXZ`
    /// and the `LOOP` family cannot be inverted in place; callers must
    /// trampoline instead.
    #[error("{0} is not invertible")]
    Uninvertible(Opcode),
    /// A basic block's successor or terminator shape does not satisfy the
    /// code block invariant, or a reference landed outside its container.
    #[error("invariant violated: {0}")]
    InvariantViolated(&'static str),
    /// A block handle did not resolve inside the subgraph.
    #[error("unknown basic block {0:?}")]
    UnknownBlock(BasicBlockId),
}
