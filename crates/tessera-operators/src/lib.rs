//! Reference CPU operators for tessera nets.
//!
//! Every operator computes on logical values and leaves storage layout to
//! the runtime's negotiation API: it picks a capability tier, binds input
//! and output layouts during reshape, and reads and writes through them
//! during forward.
//!
//! # Operators
//!
//! - Graph plumbing (Input, Split, Concat with in-place aliasing)
//! - Convolution with fused activation, fused sum, and quantized output
//! - Pooling (max, average, global)
//! - Normalization (BatchNorm with merged affine, Scale)
//! - Elementwise (ReLU, Eltwise sum/product/max)
//! - InnerProduct

pub mod operators;

mod helpers;
mod registry;

pub use operators::{
    BatchNormOp, ConcatOp, ConvolutionOp, ElementwiseOp, InnerProductOp, InputOp, PoolingOp,
    ReluOp, ScaleOp, SplitOp,
};
pub use registry::core_operator_registry;
