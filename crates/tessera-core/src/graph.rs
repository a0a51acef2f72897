//! Graph model for the rewriter.
//!
//! The model is an ordered list of operator nodes wired by tensor (edge)
//! names:
//! - **Nodes** (`GraphNode`) are operators in topological order
//! - **Edges** are plain strings; a node produces an edge by listing it in
//!   `outputs` and consumes it by listing it in `inputs`
//!
//! A node whose output name equals its input name at the same slot computes
//! in place and does not count as a second producer of that edge.
//!
//! Rewrite passes never mutate a model they are given; each builds a fresh
//! `GraphModel` from the nodes it keeps.

use crate::config::LayerConfig;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Topo;
use std::collections::{HashMap, HashSet};
use std::fmt;

// ──────────────────────────────── WeightBlob ────────────────────────────────

/// A trained parameter tensor attached to a node.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightBlob {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl WeightBlob {
    /// Create a blob, checking that `data` fills `shape`.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> crate::Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(crate::Error::Shape(format!(
                "weight data length {} does not match shape {:?}",
                data.len(),
                shape
            )));
        }
        Ok(Self { shape, data })
    }

    /// Zero-filled blob of the given shape.
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    /// Constant-filled blob of the given shape.
    pub fn filled(shape: Vec<usize>, value: f32) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![value; len],
        }
    }

    pub fn count(&self) -> usize {
        self.data.len()
    }

    /// Human-readable shape, e.g. `8 3 3 3 (216)`.
    pub fn shape_string(&self) -> String {
        shape_string(&self.shape)
    }
}

/// Format a shape the way diagnostics print it: dimensions then element count.
pub fn shape_string(shape: &[usize]) -> String {
    let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
    let count: usize = shape.iter().product();
    format!("{} ({})", dims.join(" "), count)
}

// ──────────────────────────────── GraphNode ────────────────────────────────

/// One operator in the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    /// Unique node name (also the key for weight loading).
    pub name: String,
    /// Ordered input edge names.
    pub inputs: Vec<String>,
    /// Ordered output edge names.
    pub outputs: Vec<String>,
    pub config: LayerConfig,
    /// Optional engine-affinity tag such as `NATIVE:BLOCKED`.
    pub engine: Option<String>,
    pub weights: Vec<WeightBlob>,
}

impl GraphNode {
    pub fn new(name: impl Into<String>, config: LayerConfig) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            config,
            engine: None,
            weights: Vec::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: &[&str]) -> Self {
        self.inputs = inputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_outputs(mut self, outputs: &[&str]) -> Self {
        self.outputs = outputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = Some(engine.into());
        self
    }

    pub fn with_weights(mut self, weights: Vec<WeightBlob>) -> Self {
        self.weights = weights;
        self
    }

    pub fn op_type(&self) -> &'static str {
        self.config.op_type()
    }

    /// True if output `slot` reuses the input edge at the same slot.
    pub fn is_in_place(&self, slot: usize) -> bool {
        matches!(
            (self.outputs.get(slot), self.inputs.get(slot)),
            (Some(out), Some(inp)) if out == inp
        )
    }
}

/// A reader of an edge: node position plus the input slot it reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Consumer {
    pub node: usize,
    pub slot: usize,
}

/// Facts recorded by rewrite passes for later stages (weight loading).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompileState {
    /// At least one normalization absorbed its affine successor.
    pub norm_affine_merged: bool,
    /// Normalization layers folded into a preceding convolution.
    pub folded_norm_layers: Vec<String>,
}

// ──────────────────────────────── GraphModel ────────────────────────────────

/// Ordered operator graph.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GraphModel {
    pub name: String,
    nodes: Vec<GraphNode>,
    pub compile_state: CompileState,
}

impl GraphModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            compile_state: CompileState::default(),
        }
    }

    /// Empty model with the same name and compile state, used by passes to
    /// start their output graph.
    pub fn empty_like(&self) -> Self {
        Self {
            name: self.name.clone(),
            nodes: Vec::with_capacity(self.nodes.len()),
            compile_state: self.compile_state.clone(),
        }
    }

    pub fn push(&mut self, node: GraphNode) {
        self.nodes.push(node);
    }

    pub fn insert(&mut self, index: usize, node: GraphNode) {
        self.nodes.insert(index, node);
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut [GraphNode] {
        &mut self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&GraphNode> {
        self.nodes.get(index)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Position of the node called `name`.
    pub fn find_node(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }

    /// Every `(node, slot)` reading `edge`, restricted to nodes at or after
    /// `from`, in graph order.
    pub fn consumers(&self, edge: &str, from: usize) -> Vec<Consumer> {
        self.nodes
            .iter()
            .enumerate()
            .skip(from)
            .flat_map(|(index, node)| {
                node.inputs
                    .iter()
                    .enumerate()
                    .filter(move |(_, input)| input.as_str() == edge)
                    .map(move |(slot, _)| Consumer { node: index, slot })
            })
            .collect()
    }

    /// Readers of the value node `producer` writes to `edge`.
    ///
    /// Unlike [`consumers`](Self::consumers) this stops after the first later
    /// node that writes `edge` again (an in-place successor), so readers of a
    /// newer version of the same name are not included.
    pub fn readers_of(&self, edge: &str, producer: usize) -> Vec<Consumer> {
        let mut readers = Vec::new();
        for (index, node) in self.nodes.iter().enumerate().skip(producer + 1) {
            for (slot, input) in node.inputs.iter().enumerate() {
                if input == edge {
                    readers.push(Consumer { node: index, slot });
                }
            }
            if node.outputs.iter().any(|o| o == edge) {
                break;
            }
        }
        readers
    }

    /// The latest node before `before` that lists `edge` as an output.
    pub fn producer_before(&self, edge: &str, before: usize) -> Option<usize> {
        self.nodes[..before.min(self.nodes.len())]
            .iter()
            .rposition(|n| n.outputs.iter().any(|o| o == edge))
    }

    /// Edges not read by any node after their final producer.
    ///
    /// These are the externally observable outputs of the graph.
    pub fn output_edges(&self) -> Vec<String> {
        let mut last_producer: HashMap<&str, usize> = HashMap::new();
        for (index, node) in self.nodes.iter().enumerate() {
            for output in &node.outputs {
                last_producer.insert(output.as_str(), index);
            }
        }

        let mut seen = HashSet::new();
        let mut outputs = Vec::new();
        for node in &self.nodes {
            for output in &node.outputs {
                if !seen.insert(output.as_str()) {
                    continue;
                }
                let producer = last_producer[output.as_str()];
                if self.consumers(output, producer + 1).is_empty() {
                    outputs.push(output.clone());
                }
            }
        }
        outputs
    }

    /// Dependency graph: one vertex per node, one arc per consumed edge from
    /// its latest producer to the consumer.
    pub fn dependency_graph(&self) -> DiGraph<String, String> {
        let mut graph = DiGraph::new();
        let indices: Vec<NodeIndex> = self
            .nodes
            .iter()
            .map(|n| graph.add_node(format!("{} ({})", n.name, n.op_type())))
            .collect();

        let mut producer: HashMap<&str, usize> = HashMap::new();
        for (index, node) in self.nodes.iter().enumerate() {
            for input in &node.inputs {
                if let Some(&from) = producer.get(input.as_str()) {
                    graph.add_edge(indices[from], indices[index], input.clone());
                }
            }
            for output in &node.outputs {
                producer.insert(output.as_str(), index);
            }
        }
        graph
    }

    /// Node positions in a topological order of the dependency graph.
    pub fn topological_order(&self) -> Vec<usize> {
        let graph = self.dependency_graph();
        let mut topo = Topo::new(&graph);
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(index) = topo.next(&graph) {
            order.push(index.index());
        }
        order
    }

    /// Render the dependency graph in Graphviz DOT format.
    pub fn to_dot(&self) -> String {
        let graph = self.dependency_graph();
        format!("{}", petgraph::dot::Dot::new(&graph))
    }
}

impl fmt::Display for GraphModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph {} ({} nodes)", self.name, self.nodes.len())?;
        for node in &self.nodes {
            writeln!(
                f,
                "  {:<12} {:<24} [{}] -> [{}]",
                node.op_type(),
                node.name,
                node.inputs.join(", "),
                node.outputs.join(", ")
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConvolutionConfig, ReluConfig};

    fn chain() -> GraphModel {
        let mut graph = GraphModel::new("chain");
        graph.push(
            GraphNode::new(
                "data",
                LayerConfig::Input {
                    shapes: vec![vec![1, 3, 4, 4]],
                },
            )
            .with_outputs(&["data"]),
        );
        graph.push(
            GraphNode::new(
                "conv",
                LayerConfig::Convolution(ConvolutionConfig::new(4, 3)),
            )
            .with_inputs(&["data"])
            .with_outputs(&["conv"]),
        );
        graph.push(
            GraphNode::new("relu", LayerConfig::ReLU(ReluConfig::default()))
                .with_inputs(&["conv"])
                .with_outputs(&["conv"]),
        );
        graph.push(
            GraphNode::new("relu2", LayerConfig::ReLU(ReluConfig::default()))
                .with_inputs(&["data"])
                .with_outputs(&["side"]),
        );
        graph
    }

    #[test]
    fn test_consumers_respects_from_index() {
        let graph = chain();
        let all = graph.consumers("data", 0);
        assert_eq!(
            all,
            vec![Consumer { node: 1, slot: 0 }, Consumer { node: 3, slot: 0 }]
        );
        let later = graph.consumers("data", 2);
        assert_eq!(later, vec![Consumer { node: 3, slot: 0 }]);
        assert!(graph.consumers("missing", 0).is_empty());
    }

    #[test]
    fn test_readers_stop_at_in_place_writer() {
        let graph = chain();
        assert_eq!(graph.readers_of("conv", 1), vec![Consumer { node: 2, slot: 0 }]);
        assert!(graph.readers_of("conv", 2).is_empty());
        assert_eq!(graph.readers_of("data", 0).len(), 2);
    }

    #[test]
    fn test_in_place_detection() {
        let graph = chain();
        assert!(graph.nodes()[2].is_in_place(0));
        assert!(!graph.nodes()[1].is_in_place(0));
    }

    #[test]
    fn test_output_edges() {
        let graph = chain();
        assert_eq!(graph.output_edges(), vec!["conv", "side"]);
    }

    #[test]
    fn test_producer_before() {
        let graph = chain();
        assert_eq!(graph.producer_before("conv", 4), Some(2));
        assert_eq!(graph.producer_before("conv", 2), Some(1));
        assert_eq!(graph.producer_before("data", 0), None);
    }

    #[test]
    fn test_topological_order_covers_all_nodes() {
        let graph = chain();
        let order = graph.topological_order();
        assert_eq!(order.len(), 4);
        let pos = |i: usize| order.iter().position(|&x| x == i).unwrap();
        assert!(pos(0) < pos(1));
        assert!(pos(1) < pos(2));
    }

    #[test]
    fn test_dot_mentions_nodes() {
        let dot = chain().to_dot();
        assert!(dot.contains("digraph"));
        assert!(dot.contains("conv (Convolution)"));
    }

    #[test]
    fn test_weight_blob_shape_check() {
        assert!(WeightBlob::new(vec![2, 2], vec![0.0; 4]).is_ok());
        assert!(WeightBlob::new(vec![2, 2], vec![0.0; 3]).is_err());
        assert_eq!(WeightBlob::zeros(vec![2, 3]).shape_string(), "2 3 (6)");
    }
}
