//! Rewrite rules, one module per rule.

mod activation;
mod conv_norm_folding;
mod conv_sum;
mod inplace_rename;
mod norm_affine;
mod stride_redistribution;

pub use activation::{ActivationFusionPass, ActivationProducer};
pub use conv_norm_folding::ConvNormFoldingPass;
pub use conv_sum::ConvSumFusionPass;
pub use inplace_rename::NormInplaceRenamePass;
pub use norm_affine::NormAffineFusionPass;
pub use stride_redistribution::StrideRedistributionPass;

use tessera_core::{Consumer, GraphModel, GraphNode, LayerConfig, Pass};

/// All built-in passes, in pipeline order.
pub fn builtin_passes() -> Vec<Box<dyn Pass>> {
    vec![
        Box::new(ConvNormFoldingPass::new()),
        Box::new(NormAffineFusionPass::new()),
        Box::new(ActivationFusionPass::new(ActivationProducer::Convolution)),
        Box::new(ActivationFusionPass::new(ActivationProducer::BatchNorm)),
        Box::new(NormInplaceRenamePass::new()),
        Box::new(StrideRedistributionPass::new()),
        Box::new(ConvSumFusionPass::new()),
    ]
}

/// The single reader of the value `producer` writes to `edge`, or `None`
/// when that value has zero or several readers.
///
/// Every fusion rule goes through this so that a producer feeding more than
/// one node is never fused into just one of them.
pub(crate) fn sole_consumer(graph: &GraphModel, edge: &str, producer: usize) -> Option<Consumer> {
    match graph.readers_of(edge, producer).as_slice() {
        [only] => Some(*only),
        _ => None,
    }
}

/// A zero-slope rectifier reading exactly one input.
pub(crate) fn is_plain_relu(graph: &GraphModel, index: usize) -> bool {
    graph.node(index).is_some_and(|node| {
        node.inputs.len() == 1
            && matches!(&node.config, LayerConfig::ReLU(relu) if relu.negative_slope == 0.0)
    })
}

/// False for nodes pinned to the reference engine; they run as declared.
pub(crate) fn fusable(node: &GraphNode) -> bool {
    !node
        .engine
        .as_deref()
        .is_some_and(|engine| engine.trim().starts_with("REFERENCE"))
}
