//! Split insertion for edges read by more than one node.

use std::collections::HashMap;
use tessera_core::{GraphModel, GraphNode, LayerConfig};

/// Name of the `k`-th output of the split fanning out `edge`.
pub fn split_blob_name(edge: &str, producer: &str, slot: usize, k: usize) -> String {
    format!("{}_{}_{}_split_{}", edge, producer, slot, k)
}

/// Name of the split node fanning out `edge`.
pub fn split_layer_name(edge: &str, producer: &str, slot: usize) -> String {
    format!("{}_{}_{}_split", edge, producer, slot)
}

/// Give every multiply-read value its own Split node.
///
/// Each value (a producer output, tracked through in-place rewrites of the
/// same edge name) read by more than one input slot gets a Split placed
/// right after its producer, and each reader is rewired to its own split
/// output in graph order. Unresolved references are left as they are; the
/// caller validates the graph.
pub fn insert_splits(graph: &GraphModel) -> GraphModel {
    // (node, output slot) of the producer each input slot reads
    let mut last_producer: HashMap<&str, (usize, usize)> = HashMap::new();
    let mut source: HashMap<(usize, usize), (usize, usize)> = HashMap::new();
    let mut read_count: HashMap<(usize, usize), usize> = HashMap::new();

    for (index, node) in graph.nodes().iter().enumerate() {
        for (slot, input) in node.inputs.iter().enumerate() {
            if let Some(&top) = last_producer.get(input.as_str()) {
                source.insert((index, slot), top);
                *read_count.entry(top).or_default() += 1;
            }
        }
        for (slot, output) in node.outputs.iter().enumerate() {
            last_producer.insert(output.as_str(), (index, slot));
        }
    }

    let mut output = graph.empty_like();
    let mut next_split: HashMap<(usize, usize), usize> = HashMap::new();
    for (index, original) in graph.nodes().iter().enumerate() {
        let mut node = original.clone();
        for slot in 0..node.inputs.len() {
            let Some(&top) = source.get(&(index, slot)) else {
                continue;
            };
            if read_count[&top] > 1 {
                let producer = &graph.nodes()[top.0].name;
                let k = next_split.entry(top).or_default();
                node.inputs[slot] = split_blob_name(&node.inputs[slot], producer, top.1, *k);
                *k += 1;
            }
        }
        output.push(node);

        for (slot, edge) in original.outputs.iter().enumerate() {
            let count = read_count.get(&(index, slot)).copied().unwrap_or(0);
            if count < 2 {
                continue;
            }
            let tops: Vec<String> = (0..count)
                .map(|k| split_blob_name(edge, &original.name, slot, k))
                .collect();
            let tops: Vec<&str> = tops.iter().map(String::as_str).collect();
            let split = GraphNode::new(
                split_layer_name(edge, &original.name, slot),
                LayerConfig::Split,
            )
            .with_inputs(&[edge.as_str()])
            .with_outputs(&tops);
            tracing::debug!(edge = %edge, producer = %original.name, count, "inserting split");
            output.push(split);
        }
    }
    output
}
