//! Graph input operator.

use tessera_runtime::{ExecutionContext, Layer, LayerCtx, Operator, Result, TensorArena, TensorId};

/// Input operator.
///
/// Declares the net's input blobs. The net creates and shapes the blobs
/// itself from the node's declared shapes; the layer computes nothing and
/// leaves the blobs canonical so that callers write them directly.
pub struct InputOp;

impl Operator for InputOp {
    fn name(&self) -> &str {
        "Input"
    }

    fn create_layer(&self, ctx: &LayerCtx) -> Result<Box<dyn Layer>> {
        ctx.expect_arity(0, ctx.node.outputs.len())?;
        Ok(Box::new(InputLayer))
    }
}

struct InputLayer;

impl Layer for InputLayer {
    fn op_type(&self) -> &str {
        "Input"
    }

    fn reshape(
        &mut self,
        _bottoms: &[TensorId],
        _tops: &[TensorId],
        _arena: &mut TensorArena,
        _ctx: &mut ExecutionContext,
    ) -> Result<()> {
        Ok(())
    }

    fn forward(
        &mut self,
        _bottoms: &[TensorId],
        _tops: &[TensorId],
        _arena: &mut TensorArena,
        _ctx: &mut ExecutionContext,
    ) -> Result<()> {
        Ok(())
    }
}
