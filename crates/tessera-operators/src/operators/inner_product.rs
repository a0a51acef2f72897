//! Fully connected operator.

use crate::helpers::{checked_weights, select_tier};
use tessera_core::{Error, InnerProductConfig, LayerConfig, WeightBlob};
use tessera_runtime::{
    CapabilityTier, DataType, EngineSpec, ExecutionContext, Layer, LayerCtx, Layout,
    LayoutNegotiator, Operator, Result, RuntimeError, TensorArena, TensorId, output_layout,
    unavailable,
};

/// InnerProduct operator: `y = x W^T + b` over the flattened input.
///
/// **Weights:** weight `[num_output, K]` where `K` is the product of every
/// input dimension after the first, and bias `[num_output]` with
/// `bias_term`.
///
/// Flattening needs logical element order, so only the plain tier is
/// accepted; an engine restricted to other tiers fails to build.
pub struct InnerProductOp;

impl Operator for InnerProductOp {
    fn name(&self) -> &str {
        "InnerProduct"
    }

    fn create_layer(&self, ctx: &LayerCtx) -> Result<Box<dyn Layer>> {
        let LayerConfig::InnerProduct(config) = &ctx.node.config else {
            return Err(Error::Configuration(format!(
                "layer '{}' is not an inner product",
                ctx.name()
            ))
            .into());
        };
        ctx.expect_arity(1, 1)?;
        if ctx.node.is_in_place(0) {
            return Err(Error::Configuration(format!(
                "inner product '{}' cannot compute in place",
                ctx.name()
            ))
            .into());
        }
        Ok(Box::new(InnerProductLayer {
            name: ctx.name().to_string(),
            engine: ctx.engine.clone(),
            config: config.clone(),
            weights: ctx.node.weights.clone(),
            negotiator: LayoutNegotiator::new(),
            rows: 0,
            depth: 0,
        }))
    }
}

struct InnerProductLayer {
    name: String,
    engine: EngineSpec,
    config: InnerProductConfig,
    weights: Vec<WeightBlob>,
    negotiator: LayoutNegotiator,
    rows: usize,
    depth: usize,
}

fn flattened(layer: &str, shape: &[usize]) -> Result<(usize, usize)> {
    match shape.split_first() {
        Some((&rows, rest)) if !rest.is_empty() => Ok((rows, rest.iter().product())),
        _ => Err(RuntimeError::DimensionError(format!(
            "inner product '{}' needs at least rank 2, got {:?}",
            layer, shape
        ))),
    }
}

impl Layer for InnerProductLayer {
    fn op_type(&self) -> &str {
        "InnerProduct"
    }

    fn layer_setup(
        &mut self,
        bottoms: &[TensorId],
        _tops: &[TensorId],
        arena: &mut TensorArena,
    ) -> Result<()> {
        let (_, depth) = flattened(&self.name, arena.shape(bottoms[0])?)?;
        let mut defaults = vec![WeightBlob::zeros(vec![self.config.num_output, depth])];
        if self.config.bias_term {
            defaults.push(WeightBlob::zeros(vec![self.config.num_output]));
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
        let (rows, depth) = flattened(&self.name, &shape)?;
        if depth != self.weights[0].shape[1] {
            return Err(RuntimeError::DimensionError(format!(
                "inner product '{}' was set up for {} inputs per row, got {}",
                self.name, self.weights[0].shape[1], depth
            )));
        }
        self.rows = rows;
        self.depth = depth;

        let tier = select_tier(&self.name, &self.engine, |tier| match tier {
            CapabilityTier::Plain => Ok(()),
            _ => unavailable("inner product reads its input flattened"),
        })?;
        let out_dims = [rows, self.config.num_output];
        arena.reshape(tops[0], &out_dims)?;
        self.negotiator.set_tier(tier);
        self.negotiator
            .bind_input(0, bottoms[0], Layout::canonical(&shape))?;
        let output = output_layout(&out_dims, tier, DataType::F32, 1.0)?;
        self.negotiator.bind_output(0, tops[0], output, arena, ctx)
    }

    fn forward(
        &mut self,
        _bottoms: &[TensorId],
        _tops: &[TensorId],
        arena: &mut TensorArena,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        let x = self.negotiator.read_input(0, arena, ctx, false)?;
        let outputs = self.config.num_output;
        let weight = &self.weights[0].data;
        let bias = self.weights.get(1).map(|b| b.data.as_slice());

        let mut y = vec![0.0; self.rows * outputs];
        for (row, out) in y.chunks_mut(outputs.max(1)).enumerate() {
            let input = &x[row * self.depth..(row + 1) * self.depth];
            for (o, value) in out.iter_mut().enumerate() {
                let w = &weight[o * self.depth..(o + 1) * self.depth];
                *value = input.iter().zip(w).map(|(a, b)| a * b).sum::<f32>()
                    + bias.map_or(0.0, |b| b[o]);
            }
        }
        self.negotiator
            .write_output(0, arena, ctx, &y, false, &self.name)
    }

    fn weights(&self) -> &[WeightBlob] {
        &self.weights
    }

    fn weights_mut(&mut self) -> &mut [WeightBlob] {
        &mut self.weights
    }
}
