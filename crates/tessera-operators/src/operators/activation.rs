//! Rectifier activation.

use crate::helpers::follow_layout;
use tessera_core::{Error, LayerConfig};
use tessera_runtime::{
    EngineSpec, ExecutionContext, Layer, LayerCtx, LayoutNegotiator, Operator, Result,
    TensorArena, TensorId, current_layout,
};

/// ReLU operator: `max(x, 0) + negative_slope * min(x, 0)`.
///
/// Usually runs in place. The output keeps the input's layout, so a
/// quantized producer stays quantized through the activation.
pub struct ReluOp;

impl Operator for ReluOp {
    fn name(&self) -> &str {
        "ReLU"
    }

    fn create_layer(&self, ctx: &LayerCtx) -> Result<Box<dyn Layer>> {
        let LayerConfig::ReLU(config) = &ctx.node.config else {
            return Err(Error::Configuration(format!("layer '{}' is not a ReLU", ctx.name())).into());
        };
        ctx.expect_arity(1, 1)?;
        Ok(Box::new(ReluLayer {
            name: ctx.name().to_string(),
            engine: ctx.engine.clone(),
            negative_slope: config.negative_slope,
            negotiator: LayoutNegotiator::new(),
        }))
    }
}

struct ReluLayer {
    name: String,
    engine: EngineSpec,
    negative_slope: f32,
    negotiator: LayoutNegotiator,
}

impl Layer for ReluLayer {
    fn op_type(&self) -> &str {
        "ReLU"
    }

    fn reshape(
        &mut self,
        bottoms: &[TensorId],
        tops: &[TensorId],
        arena: &mut TensorArena,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        let layout = if tops[0] == bottoms[0] {
            current_layout(arena, bottoms[0])?
        } else {
            let shape = arena.shape(bottoms[0])?.to_vec();
            arena.reshape(tops[0], &shape)?;
            follow_layout(&self.name, arena, bottoms[0], &self.engine)?
        };
        self.negotiator.bind_input(0, bottoms[0], layout.clone())?;
        self.negotiator.bind_output(0, tops[0], layout, arena, ctx)
    }

    fn forward(
        &mut self,
        bottoms: &[TensorId],
        tops: &[TensorId],
        arena: &mut TensorArena,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        let mut x = self.negotiator.read_input(0, arena, ctx, false)?;
        for v in &mut x {
            if *v < 0.0 {
                *v *= self.negative_slope;
            }
        }
        self.negotiator
            .write_output(0, arena, ctx, &x, tops[0] == bottoms[0], &self.name)
    }
}
