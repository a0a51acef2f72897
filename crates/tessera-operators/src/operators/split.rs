//! Fan-out copy operator.

use crate::helpers::follow_layout;
use tessera_runtime::{
    EngineSpec, ExecutionContext, Layer, LayerCtx, LayoutNegotiator, Operator, Result,
    RuntimeError, TensorArena, TensorId,
};

/// Split operator: copies its input to every output.
///
/// Inserted by the compiler wherever one edge feeds several consumers.
/// Outputs share the input's layout, so each copy is a straight write.
pub struct SplitOp;

impl Operator for SplitOp {
    fn name(&self) -> &str {
        "Split"
    }

    fn create_layer(&self, ctx: &LayerCtx) -> Result<Box<dyn Layer>> {
        if ctx.node.outputs.is_empty() {
            return Err(RuntimeError::InvalidInputOutput(format!(
                "split '{}' has no outputs",
                ctx.name()
            )));
        }
        ctx.expect_arity(1, ctx.node.outputs.len())?;
        Ok(Box::new(SplitLayer {
            name: ctx.name().to_string(),
            engine: ctx.engine.clone(),
            negotiator: LayoutNegotiator::new(),
        }))
    }
}

struct SplitLayer {
    name: String,
    engine: EngineSpec,
    negotiator: LayoutNegotiator,
}

impl Layer for SplitLayer {
    fn op_type(&self) -> &str {
        "Split"
    }

    fn reshape(
        &mut self,
        bottoms: &[TensorId],
        tops: &[TensorId],
        arena: &mut TensorArena,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        let shape = arena.shape(bottoms[0])?.to_vec();
        let layout = follow_layout(&self.name, arena, bottoms[0], &self.engine)?;
        self.negotiator.bind_input(0, bottoms[0], layout.clone())?;
        for (i, &top) in tops.iter().enumerate() {
            if top != bottoms[0] {
                arena.reshape(top, &shape)?;
            }
            self.negotiator
                .bind_output(i, top, layout.clone(), arena, ctx)?;
        }
        Ok(())
    }

    fn forward(
        &mut self,
        bottoms: &[TensorId],
        tops: &[TensorId],
        arena: &mut TensorArena,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        let x = self.negotiator.read_input(0, arena, ctx, false)?;
        for (i, &top) in tops.iter().enumerate() {
            if top == bottoms[0] {
                continue;
            }
            self.negotiator
                .write_output(i, arena, ctx, &x, false, &self.name)?;
        }
        Ok(())
    }
}
