//! Fluent construction of graph models.
//!
//! Loading a serialized network description is left to callers; this builder
//! is the programmatic equivalent and is what the test suites use.

use crate::config::{
    BatchNormConfig, ConcatConfig, ConvolutionConfig, EltwiseConfig, InnerProductConfig,
    LayerConfig, PoolingConfig, ReluConfig, ScaleConfig,
};
use crate::graph::{GraphModel, GraphNode, WeightBlob};

/// Appends nodes to a `GraphModel` in order.
///
/// # Example
///
/// ```
/// use tessera_core::builder::GraphBuilder;
/// use tessera_core::config::ConvolutionConfig;
///
/// let graph = GraphBuilder::new("tiny")
///     .input("data", &[1, 3, 8, 8])
///     .convolution("conv1", "data", "conv1", ConvolutionConfig::new(8, 3))
///     .relu("relu1", "conv1", "conv1")
///     .build();
/// assert_eq!(graph.len(), 3);
/// ```
pub struct GraphBuilder {
    graph: GraphModel,
}

impl GraphBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            graph: GraphModel::new(name),
        }
    }

    /// Append an arbitrary node.
    pub fn node(mut self, node: GraphNode) -> Self {
        self.graph.push(node);
        self
    }

    /// Attach weights to the most recently added node.
    pub fn weights(mut self, weights: Vec<WeightBlob>) -> Self {
        if let Some(last) = self.graph.nodes_mut().last_mut() {
            last.weights = weights;
        }
        self
    }

    /// Set the engine tag of the most recently added node.
    pub fn engine(mut self, engine: &str) -> Self {
        if let Some(last) = self.graph.nodes_mut().last_mut() {
            last.engine = Some(engine.to_string());
        }
        self
    }

    pub fn input(self, name: &str, shape: &[usize]) -> Self {
        self.node(
            GraphNode::new(
                name,
                LayerConfig::Input {
                    shapes: vec![shape.to_vec()],
                },
            )
            .with_outputs(&[name]),
        )
    }

    pub fn convolution(
        self,
        name: &str,
        bottom: &str,
        top: &str,
        config: ConvolutionConfig,
    ) -> Self {
        self.unary(name, bottom, top, LayerConfig::Convolution(config))
    }

    pub fn batch_norm(self, name: &str, bottom: &str, top: &str, config: BatchNormConfig) -> Self {
        self.unary(name, bottom, top, LayerConfig::BatchNorm(config))
    }

    pub fn scale(self, name: &str, bottom: &str, top: &str, config: ScaleConfig) -> Self {
        self.unary(name, bottom, top, LayerConfig::Scale(config))
    }

    pub fn relu(self, name: &str, bottom: &str, top: &str) -> Self {
        self.unary(name, bottom, top, LayerConfig::ReLU(ReluConfig::default()))
    }

    pub fn leaky_relu(self, name: &str, bottom: &str, top: &str, negative_slope: f32) -> Self {
        self.unary(
            name,
            bottom,
            top,
            LayerConfig::ReLU(ReluConfig { negative_slope }),
        )
    }

    pub fn pooling(self, name: &str, bottom: &str, top: &str, config: PoolingConfig) -> Self {
        self.unary(name, bottom, top, LayerConfig::Pooling(config))
    }

    pub fn inner_product(
        self,
        name: &str,
        bottom: &str,
        top: &str,
        config: InnerProductConfig,
    ) -> Self {
        self.unary(name, bottom, top, LayerConfig::InnerProduct(config))
    }

    pub fn eltwise(self, name: &str, bottoms: &[&str], top: &str, config: EltwiseConfig) -> Self {
        self.node(
            GraphNode::new(name, LayerConfig::Eltwise(config))
                .with_inputs(bottoms)
                .with_outputs(&[top]),
        )
    }

    pub fn concat(self, name: &str, bottoms: &[&str], top: &str, config: ConcatConfig) -> Self {
        self.node(
            GraphNode::new(name, LayerConfig::Concat(config))
                .with_inputs(bottoms)
                .with_outputs(&[top]),
        )
    }

    pub fn split(self, name: &str, bottom: &str, tops: &[&str]) -> Self {
        self.node(
            GraphNode::new(name, LayerConfig::Split)
                .with_inputs(&[bottom])
                .with_outputs(tops),
        )
    }

    pub fn build(self) -> GraphModel {
        self.graph
    }

    fn unary(self, name: &str, bottom: &str, top: &str, config: LayerConfig) -> Self {
        self.node(
            GraphNode::new(name, config)
                .with_inputs(&[bottom])
                .with_outputs(&[top]),
        )
    }
}
