//! Operator implementations, one module per layer family.

pub mod activation;
pub mod concat;
pub mod convolution;
pub mod eltwise;
pub mod inner_product;
pub mod input;
pub mod normalization;
pub mod pooling;
pub mod split;

// Re-export all operators
pub use activation::ReluOp;
pub use concat::ConcatOp;
pub use convolution::ConvolutionOp;
pub use eltwise::ElementwiseOp;
pub use inner_product::InnerProductOp;
pub use input::InputOp;
pub use normalization::{BatchNormOp, ScaleOp};
pub use pooling::PoolingOp;
pub use split::SplitOp;
