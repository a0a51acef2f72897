//! Fold normalization (and affine) weights into a preceding convolution.

use super::sole_consumer;
use std::collections::HashSet;
use tessera_core::{
    Error, GraphModel, GraphNode, LayerConfig, Pass, Result, RewriteStage, WeightBlob,
};

/// Removes a BatchNorm (and the Scale after it) that directly follows a
/// convolution by rescaling the convolution's weights and bias.
///
/// For each output channel `o`:
///
/// ```text
/// k[o] = gamma[o] / sqrt(var[o] * f + eps)
/// w'[o, ..] = w[o, ..] * k[o]
/// b'[o] = (b[o] - mean[o] * f) * k[o] + beta[o]
/// ```
///
/// where `f` is the reciprocal of the stored moving-average factor (0 when
/// the factor is 0). When none of the nodes carry weights the rewrite is
/// structural only: the convolution gains a bias term and takes over the
/// output name. Mixed weighted/unweighted motifs are skipped.
pub struct ConvNormFoldingPass;

impl ConvNormFoldingPass {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ConvNormFoldingPass {
    fn default() -> Self {
        Self::new()
    }
}

struct Motif<'a> {
    norm: (usize, &'a GraphNode),
    affine: Option<(usize, &'a GraphNode)>,
}

fn find_motif<'a>(graph: &'a GraphModel, index: usize, conv: &GraphNode) -> Option<Motif<'a>> {
    let LayerConfig::Convolution(cfg) = &conv.config else {
        return None;
    };
    if cfg.relu || conv.outputs.len() != 1 || conv.is_in_place(0) {
        return None;
    }

    let norm_ref = sole_consumer(graph, &conv.outputs[0], index)?;
    let norm = graph.node(norm_ref.node)?;
    let LayerConfig::BatchNorm(bn) = &norm.config else {
        return None;
    };
    if bn.relu || norm.inputs.len() != 1 {
        tracing::debug!(conv = %conv.name, norm = %norm.name, "normalization has fused activation, folding skipped");
        return None;
    }

    let mut motif = Motif {
        norm: (norm_ref.node, norm),
        affine: None,
    };
    if !bn.scale_bias
        && let Some(affine_ref) = sole_consumer(graph, &norm.outputs[0], norm_ref.node)
        && let Some(affine) = graph.node(affine_ref.node)
        && matches!(affine.config, LayerConfig::Scale(_))
        && affine.inputs.len() == 1
    {
        motif.affine = Some((affine_ref.node, affine));
    }
    Some(motif)
}

/// Normalization statistics and affine parameters for one channel range.
struct FoldFactors {
    multiplier: Vec<f32>,
    shift: Vec<f32>,
}

fn fold_factors(norm: &GraphNode, affine: Option<&GraphNode>) -> Result<FoldFactors> {
    let LayerConfig::BatchNorm(bn) = &norm.config else {
        return Err(Error::InvalidGraph(format!(
            "'{}' is not a normalization node",
            norm.name
        )));
    };
    if norm.weights.len() < 3 {
        return Err(Error::InvalidGraph(format!(
            "normalization '{}' carries {} weight blobs, expected at least 3",
            norm.name,
            norm.weights.len()
        )));
    }

    let mean = &norm.weights[0].data;
    let var = &norm.weights[1].data;
    let stored = norm.weights[2].data.first().copied().unwrap_or(0.0);
    let factor = if stored == 0.0 { 0.0 } else { 1.0 / stored };
    let channels = mean.len();

    let (gamma, beta): (Vec<f32>, Vec<f32>) = match affine {
        Some(scale) => {
            let bias_term = matches!(&scale.config, LayerConfig::Scale(s) if s.bias_term);
            let gamma = scale.weights.first().map(|b| b.data.clone());
            let beta = if bias_term {
                scale.weights.get(1).map(|b| b.data.clone())
            } else {
                Some(vec![0.0; channels])
            };
            (
                gamma.unwrap_or_else(|| vec![1.0; channels]),
                beta.unwrap_or_else(|| vec![0.0; channels]),
            )
        }
        None if bn.scale_bias => (
            norm.weights
                .get(3)
                .map(|b| b.data.clone())
                .unwrap_or_else(|| vec![1.0; channels]),
            norm.weights
                .get(4)
                .map(|b| b.data.clone())
                .unwrap_or_else(|| vec![0.0; channels]),
        ),
        None => (vec![1.0; channels], vec![0.0; channels]),
    };

    if var.len() != channels || gamma.len() != channels || beta.len() != channels {
        return Err(Error::Shape(format!(
            "normalization '{}' statistics disagree on channel count",
            norm.name
        )));
    }

    let mut multiplier = Vec::with_capacity(channels);
    let mut shift = Vec::with_capacity(channels);
    for c in 0..channels {
        let k = gamma[c] / (var[c] * factor + bn.eps).sqrt();
        multiplier.push(k);
        shift.push(beta[c] - mean[c] * factor * k);
    }
    Ok(FoldFactors { multiplier, shift })
}

fn fold_weights(conv: &mut GraphNode, factors: &FoldFactors) -> Result<()> {
    let channels = factors.multiplier.len();
    let Some(kernel) = conv.weights.first_mut() else {
        return Err(Error::InvalidGraph(format!(
            "convolution '{}' has no kernel weights",
            conv.name
        )));
    };
    if kernel.shape.first() != Some(&channels) {
        return Err(Error::Shape(format!(
            "convolution '{}' has {:?} kernel, normalization has {} channels",
            conv.name, kernel.shape, channels
        )));
    }
    let per_channel = kernel.count() / channels;
    for (o, chunk) in kernel.data.chunks_mut(per_channel).enumerate() {
        for w in chunk {
            *w *= factors.multiplier[o];
        }
    }

    let bias = match conv.weights.get(1) {
        Some(bias) => bias.data.clone(),
        None => vec![0.0; channels],
    };
    let folded: Vec<f32> = (0..channels)
        .map(|o| bias[o] * factors.multiplier[o] + factors.shift[o])
        .collect();
    conv.weights.truncate(1);
    conv.weights.push(WeightBlob::new(vec![channels], folded)?);
    Ok(())
}

impl Pass for ConvNormFoldingPass {
    fn name(&self) -> &str {
        "conv_norm_folding"
    }

    fn stage(&self) -> RewriteStage {
        RewriteStage::ConvNormFolding
    }

    fn run(&self, graph: &GraphModel) -> Result<GraphModel> {
        let mut output = graph.empty_like();
        let mut dropped: HashSet<usize> = HashSet::new();

        for (index, original) in graph.nodes().iter().enumerate() {
            if dropped.contains(&index) {
                continue;
            }
            let Some(motif) = find_motif(graph, index, original) else {
                output.push(original.clone());
                continue;
            };

            let (norm_index, norm) = motif.norm;
            let affine = motif.affine.map(|(_, node)| node);
            let weighted = [Some(original), Some(norm), affine]
                .iter()
                .flatten()
                .filter(|n| !n.weights.is_empty())
                .count();
            let total = 2 + usize::from(affine.is_some());
            if weighted != 0 && weighted != total {
                tracing::debug!(conv = %original.name, norm = %norm.name, "partially weighted motif, folding skipped");
                output.push(original.clone());
                continue;
            }

            let mut conv = original.clone();
            if weighted == total {
                let factors = fold_factors(norm, affine)?;
                fold_weights(&mut conv, &factors)?;
            }
            if let LayerConfig::Convolution(cfg) = &mut conv.config {
                cfg.bias_term = true;
            }
            let last = affine.unwrap_or(norm);
            conv.outputs[0] = last.outputs[0].clone();

            tracing::debug!(
                conv = %conv.name,
                norm = %norm.name,
                affine = affine.map(|a| a.name.as_str()).unwrap_or("-"),
                "folding normalization into convolution"
            );
            output.compile_state.folded_norm_layers.push(norm.name.clone());
            dropped.insert(norm_index);
            if let Some((affine_index, _)) = motif.affine {
                dropped.insert(affine_index);
            }
            output.push(conv);
        }

        Ok(output)
    }
}
