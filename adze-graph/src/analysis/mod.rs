//! Dataflow analyses over the basic-block graph.
//!
//! Each analysis is read-only over the IR and keeps its own per-block state
//! map; mutating the subgraph invalidates any analysis results held.

pub mod control_flow;
pub mod liveness;
pub mod memory_access;

pub use control_flow::{build_structural_tree, flatten_post_order, StructuralNode};
pub use liveness::LivenessAnalysis;
pub use memory_access::MemoryAccessAnalysis;
