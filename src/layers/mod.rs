//! Neural Network Layers
//!
//! Every layer of the language model, each with an explicit forward and
//! backward pass.
//!
//! ## Layers
//!
//! - **linear**: Fully connected layer, optionally without bias
//! - **embedding**: Lookup table (token and position embeddings)
//! - **layer_norm**: Layer normalization
//! - **activation**: ReLU
//! - **dropout**: Inverted dropout, active only in training mode
//! - **attention**: One causal self-attention head and the shared causal mask
//! - **multi_head**: Parallel heads, concatenation and output projection
//! - **feed_forward**: Position-wise two-layer network
//! - **block**: Pre-norm residual transformer block
//!
//! ## Design Pattern
//!
//! ```rust,ignore
//! impl Layer {
//!     pub fn new(..., rng: &mut StdRng) -> Self { }
//!     pub fn forward(&self, x: &Tensor) -> (Tensor, LayerCache) { }
//!     pub fn backward(&self, grad: &Tensor, cache: &LayerCache) -> LayerGradients { }
//! }
//! ```
//!
//! Layers and their gradient structs both implement [`Visit`], walking their
//! tensors in the same order under the same dotted names. The optimizer pairs
//! parameters with gradients by that order and checkpoints store tensors by
//! those names.

pub mod activation;
pub mod attention;
pub mod block;
pub mod dropout;
pub mod embedding;
pub mod feed_forward;
pub mod layer_norm;
pub mod linear;
pub mod multi_head;

use crate::tensor::Tensor;

pub use activation::{relu_backward, relu_forward};
pub use attention::{AttentionHead, CausalMask, HeadCache, HeadGradients};
pub use block::{BlockCache, BlockGradients, TransformerBlock};
pub use dropout::{Dropout, DropoutCache};
pub use embedding::{Embedding, EmbeddingGradients};
pub use feed_forward::{FeedForward, FeedForwardCache, FeedForwardGradients};
pub use layer_norm::{LayerNorm, LayerNormCache, LayerNormGradients};
pub use linear::{Linear, LinearCache, LinearGradients, INIT_STD};
pub use multi_head::{MultiHeadAttention, MultiHeadCache, MultiHeadGradients};

/// Read-only walk over named tensors.
pub trait Visit {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Tensor));
}

/// Mutable walk over named parameters, in the same order as [`Visit`].
pub trait VisitMut {
    fn visit_mut<'a>(&'a mut self, prefix: &str, f: &mut dyn FnMut(&str, &'a mut Tensor));
}

/// Join a parent prefix and a child name with a dot.
pub(crate) fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}
