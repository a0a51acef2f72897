//! Activation fusion for convolution and normalization producers.

use super::{fusable, is_plain_relu, sole_consumer};
use std::collections::HashSet;
use tessera_core::{GraphModel, GraphNode, LayerConfig, Pass, Result, RewriteStage};

/// Which producer type an [`ActivationFusionPass`] targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationProducer {
    Convolution,
    BatchNorm,
}

/// Folds a rectifier into the node that produces its input.
///
/// The producer's output must have exactly one reader, a single-input ReLU.
/// A leaky rectifier (nonzero negative slope) is left in place since the
/// fused flag only expresses a plain rectifier.
pub struct ActivationFusionPass {
    producer: ActivationProducer,
}

impl ActivationFusionPass {
    pub fn new(producer: ActivationProducer) -> Self {
        Self { producer }
    }

    /// The producer's `relu` flag, if `node` is the targeted type and has
    /// not been fused yet.
    fn relu_flag<'a>(&self, node: &'a mut GraphNode) -> Option<&'a mut bool> {
        match (&mut node.config, self.producer) {
            (LayerConfig::Convolution(conv), ActivationProducer::Convolution) if !conv.relu => {
                Some(&mut conv.relu)
            }
            (LayerConfig::BatchNorm(bn), ActivationProducer::BatchNorm) if !bn.relu => {
                Some(&mut bn.relu)
            }
            _ => None,
        }
    }
}

impl Pass for ActivationFusionPass {
    fn name(&self) -> &str {
        match self.producer {
            ActivationProducer::Convolution => "conv_activation_fusion",
            ActivationProducer::BatchNorm => "norm_activation_fusion",
        }
    }

    fn stage(&self) -> RewriteStage {
        match self.producer {
            ActivationProducer::Convolution => RewriteStage::ConvActivationFusion,
            ActivationProducer::BatchNorm => RewriteStage::NormActivationFusion,
        }
    }

    fn run(&self, graph: &GraphModel) -> Result<GraphModel> {
        let mut output = graph.empty_like();
        let mut dropped: HashSet<usize> = HashSet::new();

        for (index, original) in graph.nodes().iter().enumerate() {
            if dropped.contains(&index) {
                continue;
            }

            let mut node = original.clone();
            if self.relu_flag(&mut node).is_some()
                && fusable(original)
                && node.outputs.len() == 1
                && let Some(consumer) = sole_consumer(graph, &node.outputs[0], index)
                && let Some(relu) = graph.node(consumer.node)
                && matches!(relu.config, LayerConfig::ReLU(_))
                && fusable(relu)
            {
                if !is_plain_relu(graph, consumer.node) {
                    tracing::debug!(
                        producer = %node.name,
                        activation = %relu.name,
                        "leaky or multi-input activation, fusion skipped"
                    );
                } else if let Some(flag) = self.relu_flag(&mut node) {
                    tracing::debug!(
                        producer = %original.name,
                        activation = %relu.name,
                        "fusing activation"
                    );
                    *flag = true;
                    node.outputs[0] = relu.outputs[0].clone();
                    dropped.insert(consumer.node);
                }
            }
            output.push(node);
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{BatchNormConfig, ConvolutionConfig, GraphBuilder};

    fn conv_relu(slope: f32) -> GraphModel {
        GraphBuilder::new("g")
            .input("data", &[1, 3, 8, 8])
            .convolution("conv", "data", "conv", ConvolutionConfig::new(4, 3))
            .leaky_relu("relu", "conv", "act", slope)
            .build()
    }

    #[test]
    fn test_fuses_conv_relu() {
        let pass = ActivationFusionPass::new(ActivationProducer::Convolution);
        let out = pass.run(&conv_relu(0.0)).unwrap();
        assert_eq!(out.len(), 2);
        let conv = &out.nodes()[1];
        assert_eq!(conv.outputs, vec!["act"]);
        assert!(matches!(&conv.config, LayerConfig::Convolution(c) if c.relu));
    }

    #[test]
    fn test_leaky_relu_is_kept() {
        let pass = ActivationFusionPass::new(ActivationProducer::Convolution);
        let graph = conv_relu(0.1);
        let out = pass.run(&graph).unwrap();
        assert_eq!(out, graph);
    }

    #[test]
    fn test_reference_engine_activation_is_kept() {
        let pass = ActivationFusionPass::new(ActivationProducer::Convolution);
        let mut graph = conv_relu(0.0);
        graph.nodes_mut()[2].engine = Some("REFERENCE".to_string());
        assert_eq!(pass.run(&graph).unwrap(), graph);
    }

    #[test]
    fn test_norm_pass_ignores_convolutions() {
        let pass = ActivationFusionPass::new(ActivationProducer::BatchNorm);
        let graph = conv_relu(0.0);
        assert_eq!(pass.run(&graph).unwrap(), graph);
    }

    #[test]
    fn test_fuses_norm_relu_in_place() {
        let graph = GraphBuilder::new("g")
            .input("data", &[1, 3, 8, 8])
            .batch_norm("bn", "data", "x", BatchNormConfig::default())
            .relu("relu", "x", "x")
            .build();
        let pass = ActivationFusionPass::new(ActivationProducer::BatchNorm);
        let out = pass.run(&graph).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out.nodes()[1].outputs, vec!["x"]);
        assert!(matches!(&out.nodes()[1].config, LayerConfig::BatchNorm(b) if b.relu));
    }

    #[test]
    fn test_multi_consumer_guard() {
        let graph = GraphBuilder::new("g")
            .input("data", &[1, 3, 8, 8])
            .convolution("conv", "data", "conv", ConvolutionConfig::new(4, 3))
            .relu("relu", "conv", "act")
            .relu("other", "conv", "side")
            .build();
        let pass = ActivationFusionPass::new(ActivationProducer::Convolution);
        assert_eq!(pass.run(&graph).unwrap(), graph);
    }
}
