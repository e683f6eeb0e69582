//! Primitives for building LLM inferences.

mod attention;
mod layernorm;
mod linear;
mod softmax;
mod unary;

pub use attention::{CachedAttention, CausalMask, CausalSelfAttention};
pub use layernorm::LayerNorm;
pub use linear::Linear;
pub use softmax::SoftMax;
pub use unary::{Unary, UnaryOp};
