//! Rename in-place normalization outputs.

use std::collections::HashSet;
use tessera_core::{GraphModel, LayerConfig, Pass, Result, RewriteStage};

const SUFFIX: &str = "_x";

/// Gives an in-place BatchNorm its own output edge.
///
/// A normalization computing in place shares its edge name with its input,
/// so the next in-place node on that edge would collide with it. The pass
/// appends `_x` to the normalization output and to every later reference of
/// the edge: consumer inputs, and consumer outputs that are themselves in
/// place on it.
///
/// Edges that are graph outputs keep their name, so the rule skips a
/// normalization whose in-place chain ends at a graph output.
pub struct NormInplaceRenamePass;

impl NormInplaceRenamePass {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NormInplaceRenamePass {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for NormInplaceRenamePass {
    fn name(&self) -> &str {
        "norm_inplace_rename"
    }

    fn stage(&self) -> RewriteStage {
        RewriteStage::NormInplaceRename
    }

    fn run(&self, graph: &GraphModel) -> Result<GraphModel> {
        let graph_outputs: HashSet<String> = graph.output_edges().into_iter().collect();
        let mut output = graph.clone();

        for index in 0..output.len() {
            let node = &output.nodes()[index];
            if !matches!(node.config, LayerConfig::BatchNorm(_)) || !node.is_in_place(0) {
                continue;
            }
            let edge = node.outputs[0].clone();
            let consumers = output.consumers(&edge, index + 1);
            if consumers.is_empty() || graph_outputs.contains(&edge) {
                tracing::debug!(
                    norm = %node.name,
                    edge = %edge,
                    "in-place output is a graph output, rename skipped"
                );
                continue;
            }

            let renamed = format!("{}{}", edge, SUFFIX);
            tracing::debug!(norm = %node.name, from = %edge, to = %renamed, "renaming in-place output");

            let nodes = output.nodes_mut();
            nodes[index].outputs[0] = renamed.clone();
            for consumer in consumers {
                let reader = &mut nodes[consumer.node];
                if reader.is_in_place(consumer.slot) {
                    reader.outputs[consumer.slot] = renamed.clone();
                }
                reader.inputs[consumer.slot] = renamed.clone();
            }
        }

        Ok(output)
    }
}
