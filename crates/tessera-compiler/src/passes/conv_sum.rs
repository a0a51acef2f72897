//! Convolution + elementwise-sum fusion.

use super::{fusable, is_plain_relu, sole_consumer};
use std::collections::HashSet;
use tessera_core::{
    FusionType, GraphModel, GraphNode, LayerConfig, Pass, Result, RewriteStage,
};

/// Folds a two-input add into the convolution producing one of its operands.
///
/// The convolution's output must have exactly one reader: a unit-coefficient
/// Eltwise sum with two inputs. The other operand becomes the convolution's
/// second (accumulation) input, so it must already be produced when the
/// convolution runs; when it is not, the convolution producing that operand
/// later in the graph picks up the fusion instead. A zero-slope ReLU that is
/// the sum's only reader is fused as well.
///
/// Outputs of a Split with more than two outputs (all but the last) are
/// marked as fanned out while scanning; a sum reading any of them is left
/// alone so the accumulation does not run on a shared branch.
pub struct ConvSumFusionPass;

impl ConvSumFusionPass {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ConvSumFusionPass {
    fn default() -> Self {
        Self::new()
    }
}

/// Planned rewrite for one convolution.
struct SumFusion {
    other: String,
    output: String,
    relu: bool,
    dropped: Vec<usize>,
}

fn plan(
    graph: &GraphModel,
    index: usize,
    node: &GraphNode,
    fanned_out: &HashSet<String>,
) -> Option<SumFusion> {
    let LayerConfig::Convolution(conv) = &node.config else {
        return None;
    };
    if conv.relu || conv.fusion != FusionType::None || node.outputs.len() != 1 || !fusable(node) {
        return None;
    }

    let top = &node.outputs[0];
    let consumer = sole_consumer(graph, top, index)?;
    let sum = graph.node(consumer.node)?;
    let LayerConfig::Eltwise(eltwise) = &sum.config else {
        return None;
    };
    if !eltwise.is_plain_sum() || sum.inputs.len() != 2 || sum.outputs.len() != 1 || !fusable(sum)
    {
        return None;
    }
    if let Some(edge) = sum.inputs.iter().find(|e| fanned_out.contains(*e)) {
        tracing::debug!(conv = %node.name, edge = %edge, "sum reads a fanned-out edge, fusion skipped");
        return None;
    }

    // The fused node runs at the convolution's position, so the value the
    // sum reads must already exist there and not be rewritten in between.
    let other = sum.inputs[1 - consumer.slot].clone();
    if &other == top {
        return None;
    }
    match graph.producer_before(&other, consumer.node) {
        Some(producer) if producer < index => {}
        Some(producer) if producer > index => {
            tracing::debug!(
                conv = %node.name,
                edge = %other,
                writer = %graph.nodes()[producer].name,
                "operand rewritten between convolution and sum, fusion skipped"
            );
            return None;
        }
        _ => return None,
    }

    let mut fusion = SumFusion {
        other,
        output: sum.outputs[0].clone(),
        relu: false,
        dropped: vec![consumer.node],
    };
    if let Some(next) = sole_consumer(graph, &sum.outputs[0], consumer.node)
        && is_plain_relu(graph, next.node)
        && let Some(relu) = graph.node(next.node)
        && fusable(relu)
    {
        fusion.relu = true;
        fusion.output = relu.outputs[0].clone();
        fusion.dropped.push(next.node);
    }
    Some(fusion)
}

impl Pass for ConvSumFusionPass {
    fn name(&self) -> &str {
        "conv_sum_fusion"
    }

    fn stage(&self) -> RewriteStage {
        RewriteStage::ConvSumFusion
    }

    fn run(&self, graph: &GraphModel) -> Result<GraphModel> {
        let mut output = graph.empty_like();
        let mut fanned_out: HashSet<String> = HashSet::new();
        let mut dropped: HashSet<usize> = HashSet::new();

        for (index, original) in graph.nodes().iter().enumerate() {
            if dropped.contains(&index) {
                continue;
            }
            if matches!(original.config, LayerConfig::Split) && original.outputs.len() > 2 {
                let shared = &original.outputs[..original.outputs.len() - 1];
                fanned_out.extend(shared.iter().cloned());
            }

            let mut node = original.clone();
            if let Some(fusion) = plan(graph, index, original, &fanned_out)
                && let LayerConfig::Convolution(conv) = &mut node.config
            {
                tracing::debug!(
                    conv = %original.name,
                    accumulate = %fusion.other,
                    relu = fusion.relu,
                    "fusing elementwise sum into convolution"
                );
                conv.fusion = FusionType::Sum;
                conv.relu = fusion.relu;
                node.outputs[0] = fusion.output;
                node.inputs.push(fusion.other);
                dropped.extend(fusion.dropped);
            }
            output.push(node);
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{ConvolutionConfig, EltwiseConfig, GraphBuilder};

    fn residual(with_relu: bool) -> GraphModel {
        let builder = GraphBuilder::new("res")
            .input("data", &[1, 4, 8, 8])
            .convolution("shortcut", "data", "a", ConvolutionConfig::new(4, 1))
            .convolution("branch", "data", "b", ConvolutionConfig::new(4, 3).with_pad(1))
            .eltwise("sum", &["a", "b"], "s", EltwiseConfig::sum());
        if with_relu {
            builder.relu("relu", "s", "s").build()
        } else {
            builder.build()
        }
    }

    #[test]
    fn test_fuses_later_operand() {
        let out = ConvSumFusionPass::new().run(&residual(false)).unwrap();
        assert_eq!(out.len(), 3);
        let branch = &out.nodes()[2];
        assert_eq!(branch.inputs, vec!["data", "a"]);
        assert_eq!(branch.outputs, vec!["s"]);
        assert!(matches!(
            &branch.config,
            LayerConfig::Convolution(c) if c.fusion == FusionType::Sum && !c.relu
        ));
        // The first operand's producer is untouched.
        assert_eq!(out.nodes()[1], residual(false).nodes()[1]);
    }

    #[test]
    fn test_fuses_trailing_relu() {
        let out = ConvSumFusionPass::new().run(&residual(true)).unwrap();
        assert_eq!(out.len(), 3);
        assert!(matches!(
            &out.nodes()[2].config,
            LayerConfig::Convolution(c) if c.fusion == FusionType::Sum && c.relu
        ));
        assert_eq!(out.output_edges(), vec!["s"]);
    }

    #[test]
    fn test_operand_rewritten_in_place_blocks_fusion() {
        let graph = GraphBuilder::new("res")
            .input("data", &[1, 4, 8, 8])
            .convolution("shortcut", "data", "a", ConvolutionConfig::new(4, 1))
            .convolution("branch", "data", "b", ConvolutionConfig::new(4, 3).with_pad(1))
            .leaky_relu("r", "a", "a", 0.1)
            .eltwise("sum", &["a", "b"], "s", EltwiseConfig::sum())
            .build();
        assert_eq!(ConvSumFusionPass::new().run(&graph).unwrap(), graph);
    }

    #[test]
    fn test_reference_engine_nodes_are_not_fused() {
        let mut graph = residual(false);
        let branch = graph.find_node("branch").unwrap();
        graph.nodes_mut()[branch].engine = Some("REFERENCE".to_string());
        assert_eq!(ConvSumFusionPass::new().run(&graph).unwrap(), graph);
    }

    #[test]
    fn test_fanned_out_split_blocks_fusion() {
        let graph = GraphBuilder::new("res")
            .input("data", &[1, 4, 8, 8])
            .split("split", "data", &["d0", "d1", "d2"])
            .convolution("branch", "d2", "b", ConvolutionConfig::new(4, 3).with_pad(1))
            .eltwise("sum", &["d0", "b"], "s", EltwiseConfig::sum())
            .relu("r", "d1", "side")
            .build();
        assert_eq!(ConvSumFusionPass::new().run(&graph).unwrap(), graph);
    }

    #[test]
    fn test_two_way_split_does_not_block() {
        let graph = GraphBuilder::new("res")
            .input("data", &[1, 4, 8, 8])
            .split("split", "data", &["d0", "d1"])
            .convolution("branch", "d1", "b", ConvolutionConfig::new(4, 3).with_pad(1))
            .eltwise("sum", &["d0", "b"], "s", EltwiseConfig::sum())
            .build();
        let out = ConvSumFusionPass::new().run(&graph).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out.nodes()[2].inputs, vec!["d1", "d0"]);
    }
}
