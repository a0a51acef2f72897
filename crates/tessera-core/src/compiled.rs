//! Validated, indexed graph handed from the compiler to the executor.

use crate::graph::GraphModel;
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};

/// Where an edge is produced: node position and output slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeLocation {
    pub node: usize,
    pub slot: usize,
}

/// A graph whose edge references all resolve, plus an edge → producer index.
///
/// Immutable once built. For in-place chains the index points at the last
/// node that wrote the edge.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledGraph {
    graph: GraphModel,
    producers: HashMap<String, EdgeLocation>,
}

impl CompiledGraph {
    /// Validate `graph` and index its producers.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if:
    /// - a node reads an edge no earlier node produced
    /// - an edge is produced twice without being computed in place
    pub fn new(graph: GraphModel) -> Result<Self> {
        let producers = index_producers(&graph)?;
        Ok(Self { graph, producers })
    }

    pub fn graph(&self) -> &GraphModel {
        &self.graph
    }

    pub fn into_graph(self) -> GraphModel {
        self.graph
    }

    /// Latest producer of `edge`.
    pub fn producer(&self, edge: &str) -> Option<EdgeLocation> {
        self.producers.get(edge).copied()
    }

    pub fn edge_count(&self) -> usize {
        self.producers.len()
    }
}

/// Check edge references in order and build the producer index.
pub fn index_producers(graph: &GraphModel) -> Result<HashMap<String, EdgeLocation>> {
    let mut available: HashSet<&str> = HashSet::new();
    let mut producers = HashMap::new();

    for (index, node) in graph.nodes().iter().enumerate() {
        for (slot, input) in node.inputs.iter().enumerate() {
            if !available.contains(input.as_str()) {
                return Err(Error::Configuration(format!(
                    "Unknown bottom blob '{}' (layer '{}', bottom index {})",
                    input, node.name, slot
                )));
            }
        }
        for (slot, output) in node.outputs.iter().enumerate() {
            let in_place = node.is_in_place(slot);
            if !in_place && producers.contains_key(output) {
                return Err(Error::Configuration(format!(
                    "Top blob '{}' produced by multiple sources.",
                    output
                )));
            }
            producers.insert(output.clone(), EdgeLocation { node: index, slot });
            available.insert(output.as_str());
        }
    }
    Ok(producers)
}
