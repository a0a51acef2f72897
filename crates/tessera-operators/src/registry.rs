//! Core operator registry.
//!
//! Provides a pre-populated registry covering every layer type the graph
//! model knows.

use tessera_runtime::OperatorRegistry;

use crate::operators::{
    BatchNormOp, ConcatOp, ConvolutionOp, ElementwiseOp, InnerProductOp, InputOp, PoolingOp,
    ReluOp, ScaleOp, SplitOp,
};

/// Returns an operator registry pre-populated with the 10 core operators.
///
/// The registry includes:
/// - Graph plumbing (Input, Split, Concat)
/// - Compute layers (Convolution, InnerProduct, Pooling)
/// - Normalization (BatchNorm, Scale)
/// - Elementwise layers (ReLU, Eltwise)
///
/// Custom operators can be added to the returned registry via
/// `registry.register(name, operator)`.
pub fn core_operator_registry() -> OperatorRegistry {
    let mut registry = OperatorRegistry::new();

    // Graph plumbing
    registry.register("Input", InputOp);
    registry.register("Split", SplitOp);
    registry.register("Concat", ConcatOp);

    // Compute layers
    registry.register("Convolution", ConvolutionOp);
    registry.register("InnerProduct", InnerProductOp);
    registry.register("Pooling", PoolingOp);

    // Normalization
    registry.register("BatchNorm", BatchNormOp);
    registry.register("Scale", ScaleOp);

    // Elementwise
    registry.register("ReLU", ReluOp);
    registry.register("Eltwise", ElementwiseOp);

    registry
}
