//! Transforms that rewrite instructions inside basic blocks.

pub mod peephole;

pub use peephole::PeepholeTransform;
