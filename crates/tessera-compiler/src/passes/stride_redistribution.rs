//! Stride redistribution onto a shared ancestor convolution.
//!
//! Motif (a residual block whose downsampling happens in its 1x1 entries):
//!
//! ```text
//!   ancestor (kernel > 1) ──> ... ──> region ──> edge ──┬──> sibling 1x1/s ──> ...──┐
//!                                       ^               └──> sibling 1x1/s ──> ...──┴──> Eltwise
//!                       shortcut ───────┘
//! ```
//!
//! The siblings' stride moves onto the ancestor. Every node between the
//! ancestor and the siblings that reads the ancestor's output then sees a
//! smaller tensor, so each of their inputs that does not descend from the
//! ancestor (a shortcut) gets a `kernel 1 / stride s` max-pool inserted in
//! front of it, named `<edge>_p`.

use std::collections::{BTreeMap, HashSet};
use tessera_core::{
    GraphModel, GraphNode, LayerConfig, Pass, PoolingConfig, Result, RewriteStage,
};

pub struct StrideRedistributionPass;

impl StrideRedistributionPass {
    pub fn new() -> Self {
        Self
    }
}

impl Default for StrideRedistributionPass {
    fn default() -> Self {
        Self::new()
    }
}

/// 1x1 strided convolutions sharing an input, grouped under the last
/// larger-kernel convolution seen before them.
#[derive(Debug)]
struct SiblingGroup {
    ancestor: usize,
    input: String,
    siblings: Vec<usize>,
}

/// Everything needed to apply one redistribution.
#[derive(Debug)]
struct Redistribution {
    ancestor: usize,
    stride: [usize; 2],
    siblings: Vec<usize>,
    /// Node position → (input slot, shortcut edge) pairs needing a pool.
    shortcuts: BTreeMap<usize, Vec<(usize, String)>>,
}

fn conv_config(node: &GraphNode) -> Option<&tessera_core::ConvolutionConfig> {
    match &node.config {
        LayerConfig::Convolution(conv) => Some(conv),
        _ => None,
    }
}

fn sibling_groups(graph: &GraphModel) -> Vec<SiblingGroup> {
    let mut groups: Vec<SiblingGroup> = Vec::new();
    let mut ancestor = None;

    for (index, node) in graph.nodes().iter().enumerate() {
        let Some(conv) = conv_config(node) else {
            continue;
        };
        if conv.kernel[0] > 1 || conv.kernel[1] > 1 {
            ancestor = Some(index);
            continue;
        }
        let strided = conv.stride[0] > 1 || conv.stride[1] > 1;
        if !conv.is_pointwise() || !strided || node.inputs.len() != 1 {
            continue;
        }
        let Some(ancestor) = ancestor else {
            continue;
        };
        match groups.last_mut() {
            Some(group) if group.ancestor == ancestor && group.input == node.inputs[0] => {
                group.siblings.push(index);
            }
            _ => groups.push(SiblingGroup {
                ancestor,
                input: node.inputs[0].clone(),
                siblings: vec![index],
            }),
        }
    }

    groups.retain(|g| g.siblings.len() > 1);
    groups
}

/// Nodes after `from` that read `start` or anything derived from it.
fn reachable_nodes(graph: &GraphModel, start: &str, from: usize) -> HashSet<usize> {
    let mut edges: HashSet<&str> = HashSet::from([start]);
    let mut nodes = HashSet::new();
    for (index, node) in graph.nodes().iter().enumerate().skip(from + 1) {
        if node.inputs.iter().any(|i| edges.contains(i.as_str())) {
            nodes.insert(index);
            edges.extend(node.outputs.iter().map(String::as_str));
        }
    }
    nodes
}

fn plan(graph: &GraphModel, group: &SiblingGroup, outputs: &HashSet<String>) -> Option<Redistribution> {
    let nodes = graph.nodes();
    let ancestor = &nodes[group.ancestor];
    let stride = conv_config(&nodes[group.siblings[0]])?.stride;

    let names = || {
        group
            .siblings
            .iter()
            .map(|&i| nodes[i].name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };

    if group
        .siblings
        .iter()
        .any(|&i| conv_config(&nodes[i]).map(|c| c.stride) != Some(stride))
    {
        tracing::debug!(
            ancestor = %ancestor.name,
            siblings = %names(),
            "sibling strides disagree, redistribution not applicable"
        );
        return None;
    }
    if ancestor.outputs.len() != 1 {
        return None;
    }

    // Region: nodes between the ancestor and the first sibling that descend
    // from the ancestor's output.
    let first = group.siblings[0];
    let mut derived: HashSet<&str> = HashSet::from([ancestor.outputs[0].as_str()]);
    let mut region: Vec<usize> = Vec::new();
    for (index, node) in nodes.iter().enumerate().take(first).skip(group.ancestor + 1) {
        if node.inputs.iter().any(|i| derived.contains(i.as_str())) {
            region.push(index);
            derived.extend(node.outputs.iter().map(String::as_str));
        }
    }

    if !derived.contains(group.input.as_str()) {
        tracing::debug!(ancestor = %ancestor.name, siblings = %names(), "siblings do not descend from ancestor");
        return None;
    }

    for &index in &region {
        let node = &nodes[index];
        let spatial_ok = match &node.config {
            LayerConfig::Convolution(conv) => conv.is_pointwise() && conv.stride == [1, 1],
            LayerConfig::Pooling(_) | LayerConfig::InnerProduct(_) | LayerConfig::Input { .. } => {
                false
            }
            _ => true,
        };
        if !spatial_ok {
            tracing::debug!(node = %node.name, "region node cannot absorb a stride change");
            return None;
        }
    }

    // The smaller tensors must not escape the motif.
    let siblings: HashSet<usize> = group.siblings.iter().copied().collect();
    let members: HashSet<usize> = region.iter().copied().chain(siblings.iter().copied()).collect();
    for edge in &derived {
        if outputs.contains(*edge) {
            return None;
        }
        let escapes = graph
            .consumers(edge, group.ancestor + 1)
            .iter()
            .any(|c| c.node < first && !members.contains(&c.node))
            || graph
                .consumers(edge, first)
                .iter()
                .any(|c| !siblings.contains(&c.node) && *edge != group.input.as_str());
        if escapes {
            tracing::debug!(ancestor = %ancestor.name, edge = %edge, "ancestor output escapes the motif");
            return None;
        }
    }
    if graph
        .consumers(&group.input, first)
        .iter()
        .any(|c| !siblings.contains(&c.node))
    {
        tracing::debug!(edge = %group.input, "sibling input has other readers");
        return None;
    }

    // The siblings must merge again at an elementwise node.
    let mut common: Option<HashSet<usize>> = None;
    for &sibling in &group.siblings {
        let output = nodes[sibling].outputs.first()?;
        let reach = reachable_nodes(graph, output, sibling);
        common = Some(match common {
            Some(acc) => acc.intersection(&reach).copied().collect(),
            None => reach,
        });
    }
    let merges = common
        .unwrap_or_default()
        .into_iter()
        .any(|i| matches!(nodes[i].config, LayerConfig::Eltwise(_)));
    if !merges {
        tracing::debug!(siblings = %names(), "siblings do not meet at an elementwise node");
        return None;
    }

    let mut shortcuts: BTreeMap<usize, Vec<(usize, String)>> = BTreeMap::new();
    for &index in &region {
        for (slot, input) in nodes[index].inputs.iter().enumerate() {
            if !derived.contains(input.as_str()) {
                let pooled = format!("{}_p", input);
                if graph.producer_before(&pooled, nodes.len()).is_some() {
                    return None;
                }
                shortcuts.entry(index).or_default().push((slot, input.clone()));
            }
        }
    }

    Some(Redistribution {
        ancestor: group.ancestor,
        stride,
        siblings: group.siblings.clone(),
        shortcuts,
    })
}

impl Pass for StrideRedistributionPass {
    fn name(&self) -> &str {
        "stride_redistribution"
    }

    fn stage(&self) -> RewriteStage {
        RewriteStage::StrideRedistribution
    }

    fn run(&self, graph: &GraphModel) -> Result<GraphModel> {
        let outputs: HashSet<String> = graph.output_edges().into_iter().collect();
        let mut used_ancestors = HashSet::new();
        let plans: Vec<Redistribution> = sibling_groups(graph)
            .iter()
            .filter_map(|group| plan(graph, group, &outputs))
            .filter(|p| used_ancestors.insert(p.ancestor))
            .collect();

        if plans.is_empty() {
            return Ok(graph.clone());
        }

        let mut output = graph.empty_like();
        let mut pooled: HashSet<String> = HashSet::new();
        for (index, original) in graph.nodes().iter().enumerate() {
            let mut node = original.clone();
            for plan in &plans {
                if let LayerConfig::Convolution(conv) = &mut node.config {
                    if index == plan.ancestor {
                        conv.stride = [conv.stride[0] * plan.stride[0], conv.stride[1] * plan.stride[1]];
                        tracing::debug!(conv = %node.name, stride = ?conv.stride, "ancestor stride raised");
                    } else if plan.siblings.contains(&index) {
                        conv.stride = [1, 1];
                    }
                }

                let Some(shortcuts) = plan.shortcuts.get(&index) else {
                    continue;
                };
                for (slot, edge) in shortcuts {
                    let name = format!("{}_p", edge);
                    if pooled.insert(name.clone()) {
                        tracing::debug!(pool = %name, stride = ?plan.stride, "inserting shortcut pool");
                        let mut pool = PoolingConfig::max(1, 1);
                        pool.stride = plan.stride;
                        output.push(
                            GraphNode::new(name.clone(), LayerConfig::Pooling(pool))
                                .with_inputs(&[edge.as_str()])
                                .with_outputs(&[name.as_str()]),
                        );
                    }
                    node.inputs[*slot] = name;
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
    use tessera_core::{ConvolutionConfig, EltwiseConfig, GraphBuilder};

    fn stride_of(graph: &GraphModel, name: &str) -> [usize; 2] {
        let index = graph.find_node(name).unwrap();
        conv_config(&graph.nodes()[index]).unwrap().stride
    }

    fn block(second_stride: usize) -> GraphModel {
        GraphBuilder::new("block")
            .input("data", &[1, 4, 8, 8])
            .convolution("stem", "data", "a", ConvolutionConfig::new(4, 3).with_pad(1))
            .convolution("c", "a", "c", ConvolutionConfig::new(4, 3).with_pad(1))
            .eltwise("res", &["a", "c"], "s", EltwiseConfig::sum())
            .relu("res_relu", "s", "s")
            .convolution("d1", "s", "d1", ConvolutionConfig::new(8, 1).with_stride(2))
            .convolution("d2", "s", "d2", ConvolutionConfig::new(8, 1).with_stride(second_stride))
            .eltwise("merge", &["d1", "d2"], "out", EltwiseConfig::sum())
            .build()
    }

    #[test]
    fn test_redistributes_stride() {
        let out = StrideRedistributionPass::new().run(&block(2)).unwrap();
        assert_eq!(stride_of(&out, "c"), [2, 2]);
        assert_eq!(stride_of(&out, "d1"), [1, 1]);
        assert_eq!(stride_of(&out, "d2"), [1, 1]);
        assert_eq!(stride_of(&out, "stem"), [1, 1]);

        let pool_index = out.find_node("a_p").unwrap();
        let res_index = out.find_node("res").unwrap();
        assert_eq!(pool_index + 1, res_index);
        assert_eq!(out.nodes()[res_index].inputs, vec!["a_p", "c"]);
        assert!(matches!(
            &out.nodes()[pool_index].config,
            LayerConfig::Pooling(p) if p.kernel == [1, 1] && p.stride == [2, 2]
        ));
        assert_eq!(out.output_edges(), vec!["out"]);
    }

    #[test]
    fn test_disagreeing_strides_skip() {
        let graph = block(3);
        assert_eq!(StrideRedistributionPass::new().run(&graph).unwrap(), graph);
    }

    #[test]
    fn test_second_run_is_stable() {
        let pass = StrideRedistributionPass::new();
        let once = pass.run(&block(2)).unwrap();
        assert_eq!(pass.run(&once).unwrap(), once);
    }

    #[test]
    fn test_escaping_ancestor_output_skips() {
        let graph = GraphBuilder::new("block")
            .input("data", &[1, 4, 8, 8])
            .convolution("c", "data", "c", ConvolutionConfig::new(4, 3).with_pad(1))
            .relu("tap", "c", "tap")
            .convolution("d1", "c", "d1", ConvolutionConfig::new(8, 1).with_stride(2))
            .convolution("d2", "c", "d2", ConvolutionConfig::new(8, 1).with_stride(2))
            .eltwise("merge", &["d1", "d2"], "out", EltwiseConfig::sum())
            .build();
        assert_eq!(StrideRedistributionPass::new().run(&graph).unwrap(), graph);
    }
}
