//! Normalization + affine fusion.

use super::{fusable, sole_consumer};
use std::collections::HashSet;
use tessera_core::{GraphModel, LayerConfig, Pass, Result, RewriteStage};

/// Merges a Scale node into the BatchNorm that feeds it.
///
/// Applies when the normalization output has exactly one reader and that
/// reader is a single-input Scale. The normalization takes over the Scale's
/// output name and appends the Scale weights to its own.
pub struct NormAffineFusionPass;

impl NormAffineFusionPass {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NormAffineFusionPass {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for NormAffineFusionPass {
    fn name(&self) -> &str {
        "norm_affine_fusion"
    }

    fn stage(&self) -> RewriteStage {
        RewriteStage::NormAffineFusion
    }

    fn run(&self, graph: &GraphModel) -> Result<GraphModel> {
        let mut output = graph.empty_like();
        let mut dropped: HashSet<usize> = HashSet::new();

        for (index, original) in graph.nodes().iter().enumerate() {
            if dropped.contains(&index) {
                continue;
            }

            let mut node = original.clone();
            if let LayerConfig::BatchNorm(bn) = &mut node.config
                && !bn.scale_bias
                && fusable(original)
                && node.outputs.len() == 1
                && let Some(consumer) = sole_consumer(graph, &node.outputs[0], index)
                && let Some(scale_node) = graph.node(consumer.node)
                && let LayerConfig::Scale(scale) = &scale_node.config
                && scale_node.inputs.len() == 1
                && fusable(scale_node)
            {
                tracing::debug!(
                    norm = %node.name,
                    affine = %scale_node.name,
                    "merging affine into normalization"
                );
                bn.scale_bias = true;
                bn.bias_term = scale.bias_term;
                node.outputs[0] = scale_node.outputs[0].clone();
                node.weights.extend(scale_node.weights.iter().cloned());
                output.compile_state.norm_affine_merged = true;
                dropped.insert(consumer.node);
            }
            output.push(node);
        }

        Ok(output)
    }
}
