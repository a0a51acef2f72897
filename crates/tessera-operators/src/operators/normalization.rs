//! Normalization and per-channel affine operators.

use crate::helpers::{channel_planes, checked_weights, same_shape_layouts};
use tessera_core::{BatchNormConfig, Error, LayerConfig, ScaleConfig, WeightBlob};
use tessera_runtime::{
    EngineSpec, ExecutionContext, Layer, LayerCtx, LayoutNegotiator, Operator, Result,
    TensorArena, TensorId,
};

/// Batch normalization operator with stored global statistics.
///
/// **Weights:**
/// - mean `[C]`, variance `[C]`: accumulated sums
/// - factor `[1]`: the moving-average normalizer the sums are divided by;
///   a factor of 0 zeroes the statistics
/// - gamma `[C]` and beta `[C]`: present once an affine layer has been
///   merged in (`scale_bias`), beta only with `bias_term`
///
/// **Implementation:**
/// - `y = (x - mean / f) / sqrt(var / f + eps)`, then `y * gamma + beta`
///   when merged, then the fused rectifier when `relu` is set
/// - Any shape with a channel axis at position 1 is accepted
pub struct BatchNormOp;

impl Operator for BatchNormOp {
    fn name(&self) -> &str {
        "BatchNorm"
    }

    fn create_layer(&self, ctx: &LayerCtx) -> Result<Box<dyn Layer>> {
        let LayerConfig::BatchNorm(config) = &ctx.node.config else {
            return Err(Error::Configuration(format!(
                "layer '{}' is not a batch normalization",
                ctx.name()
            ))
            .into());
        };
        ctx.expect_arity(1, 1)?;
        Ok(Box::new(BatchNormLayer {
            name: ctx.name().to_string(),
            engine: ctx.engine.clone(),
            config: config.clone(),
            weights: ctx.node.weights.clone(),
            negotiator: LayoutNegotiator::new(),
            planes: (0, 0, 0),
        }))
    }
}

struct BatchNormLayer {
    name: String,
    engine: EngineSpec,
    config: BatchNormConfig,
    weights: Vec<WeightBlob>,
    negotiator: LayoutNegotiator,
    /// `(n, c, plane)` from the last reshape.
    planes: (usize, usize, usize),
}

impl BatchNormLayer {
    /// Per-channel `(multiplier, offset)` with every weight folded in.
    fn coefficients(&self) -> Vec<(f32, f32)> {
        let mean = &self.weights[0].data;
        let var = &self.weights[1].data;
        let factor = self.weights[2].data[0];
        let inverse = if factor == 0.0 { 0.0 } else { 1.0 / factor };
        let gamma = self
            .config
            .scale_bias
            .then(|| self.weights[3].data.as_slice());
        let beta = self.weights.get(4).map(|b| b.data.as_slice());

        (0..mean.len())
            .map(|c| {
                let std = (var[c] * inverse + self.config.eps).sqrt();
                let g = gamma.map_or(1.0, |g| g[c]);
                let multiplier = g / std;
                let offset = -mean[c] * inverse * multiplier + beta.map_or(0.0, |b| b[c]);
                (multiplier, offset)
            })
            .collect()
    }
}

impl Layer for BatchNormLayer {
    fn op_type(&self) -> &str {
        "BatchNorm"
    }

    fn layer_setup(
        &mut self,
        bottoms: &[TensorId],
        _tops: &[TensorId],
        arena: &mut TensorArena,
    ) -> Result<()> {
        let (_, channels, _) = channel_planes(&self.name, arena.shape(bottoms[0])?)?;
        let mut defaults = vec![
            WeightBlob::zeros(vec![channels]),
            WeightBlob::filled(vec![channels], 1.0),
            WeightBlob::filled(vec![1], 1.0),
        ];
        if self.config.scale_bias {
            defaults.push(WeightBlob::filled(vec![channels], 1.0));
            if self.config.bias_term {
                defaults.push(WeightBlob::zeros(vec![channels]));
            }
        }
        self.weights = checked_weights(&self.name, &self.weights, defaults)?;
        Ok(())
    }

    fn reshape(
        &mut self,
        bottoms: &[TensorId],
        tops: &[TensorId],
        arena: &mut TensorArena,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        let shape = arena.shape(bottoms[0])?.to_vec();
        self.planes = channel_planes(&self.name, &shape)?;
        let in_place = tops[0] == bottoms[0];
        let (tier, input, output) =
            same_shape_layouts(&self.name, &self.engine, arena, bottoms[0], in_place)?;
        arena.reshape(tops[0], &shape)?;
        self.negotiator.set_tier(tier);
        self.negotiator.bind_input(0, bottoms[0], input)?;
        self.negotiator.bind_output(0, tops[0], output, arena, ctx)
    }

    fn forward(
        &mut self,
        bottoms: &[TensorId],
        tops: &[TensorId],
        arena: &mut TensorArena,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        let mut x = self.negotiator.read_input(0, arena, ctx, false)?;
        let (_, channels, plane) = self.planes;
        let coefficients = self.coefficients();
        for (i, chunk) in x.chunks_mut(plane.max(1)).enumerate() {
            let (multiplier, offset) = coefficients[i % channels];
            for v in chunk {
                *v = *v * multiplier + offset;
                if self.config.relu {
                    *v = v.max(0.0);
                }
            }
        }
        self.negotiator
            .write_output(0, arena, ctx, &x, tops[0] == bottoms[0], &self.name)
    }

    fn weights(&self) -> &[WeightBlob] {
        &self.weights
    }

    fn weights_mut(&mut self) -> &mut [WeightBlob] {
        &mut self.weights
    }
}

/// Scale operator: per-channel `y = x * gamma + beta`.
///
/// **Weights:** gamma `[C]`, and beta `[C]` with `bias_term`.
pub struct ScaleOp;

impl Operator for ScaleOp {
    fn name(&self) -> &str {
        "Scale"
    }

    fn create_layer(&self, ctx: &LayerCtx) -> Result<Box<dyn Layer>> {
        let LayerConfig::Scale(config) = &ctx.node.config else {
            return Err(Error::Configuration(format!("layer '{}' is not a scale", ctx.name())).into());
        };
        ctx.expect_arity(1, 1)?;
        Ok(Box::new(ScaleLayer {
            name: ctx.name().to_string(),
            engine: ctx.engine.clone(),
            config: config.clone(),
            weights: ctx.node.weights.clone(),
            negotiator: LayoutNegotiator::new(),
            planes: (0, 0, 0),
        }))
    }
}

struct ScaleLayer {
    name: String,
    engine: EngineSpec,
    config: ScaleConfig,
    weights: Vec<WeightBlob>,
    negotiator: LayoutNegotiator,
    planes: (usize, usize, usize),
}

impl Layer for ScaleLayer {
    fn op_type(&self) -> &str {
        "Scale"
    }

    fn layer_setup(
        &mut self,
        bottoms: &[TensorId],
        _tops: &[TensorId],
        arena: &mut TensorArena,
    ) -> Result<()> {
        let (_, channels, _) = channel_planes(&self.name, arena.shape(bottoms[0])?)?;
        let mut defaults = vec![WeightBlob::filled(vec![channels], 1.0)];
        if self.config.bias_term {
            defaults.push(WeightBlob::zeros(vec![channels]));
        }
        self.weights = checked_weights(&self.name, &self.weights, defaults)?;
        Ok(())
    }

    fn reshape(
        &mut self,
        bottoms: &[TensorId],
        tops: &[TensorId],
        arena: &mut TensorArena,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        let shape = arena.shape(bottoms[0])?.to_vec();
        self.planes = channel_planes(&self.name, &shape)?;
        let in_place = tops[0] == bottoms[0];
        let (tier, input, output) =
            same_shape_layouts(&self.name, &self.engine, arena, bottoms[0], in_place)?;
        arena.reshape(tops[0], &shape)?;
        self.negotiator.set_tier(tier);
        self.negotiator.bind_input(0, bottoms[0], input)?;
        self.negotiator.bind_output(0, tops[0], output, arena, ctx)
    }

    fn forward(
        &mut self,
        bottoms: &[TensorId],
        tops: &[TensorId],
        arena: &mut TensorArena,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        let mut x = self.negotiator.read_input(0, arena, ctx, false)?;
        let (_, channels, plane) = self.planes;
        let gamma = &self.weights[0].data;
        let beta = self.weights.get(1).map(|b| b.data.as_slice());
        for (i, chunk) in x.chunks_mut(plane.max(1)).enumerate() {
            let c = i % channels;
            let offset = beta.map_or(0.0, |b| b[c]);
            for v in chunk {
                *v = *v * gamma[c] + offset;
            }
        }
        self.negotiator
            .write_output(0, arena, ctx, &x, tops[0] == bottoms[0], &self.name)
    }

    fn weights(&self) -> &[WeightBlob] {
        &self.weights
    }

    fn weights_mut(&mut self) -> &mut [WeightBlob] {
        &mut self.weights
    }
}
