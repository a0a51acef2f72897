//! Common test utilities for runtime integration tests.
//!
//! Provides a minimal operator set built on the layout negotiation API so
//! that nets can be exercised without the full operator crate:
//! - `Input`: declares input blobs
//! - `ReLU`: stand-in that adds one, computing in its engine's first tier
//! - `Split`: copies its input to every output

#![allow(dead_code)]

use tessera_runtime::{
    CapabilityTier, DataType, EngineSpec, ExecutionContext, Layer, LayerCtx, LayoutNegotiator,
    Operator, OperatorRegistry, Result, TensorArena, TensorId, output_layout, preferred_layout,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .with_target(false)
        .try_init();
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

struct InputOp;

impl Operator for InputOp {
    fn name(&self) -> &str {
        "Input"
    }

    fn create_layer(&self, _ctx: &LayerCtx) -> Result<Box<dyn Layer>> {
        Ok(Box::new(InputLayer))
    }
}

/// Adds `offset` to every element of its first input and writes the result
/// to each output, computing in the first tier of its engine.
struct AddLayer {
    name: String,
    engine: EngineSpec,
    offset: f32,
    negotiator: LayoutNegotiator,
}

impl Layer for AddLayer {
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
        let tier: Option<CapabilityTier> = self.engine.tiers().first().copied();
        self.negotiator.set_tier(tier);
        let shape = arena.shape(bottoms[0])?.to_vec();
        let format = tier.map(|t| t.format()).unwrap_or(tessera_runtime::MemoryFormat::Plain);
        let input = preferred_layout(arena, bottoms[0], format)?;
        self.negotiator.bind_input(0, bottoms[0], input)?;
        for (i, &top) in tops.iter().enumerate() {
            if top != bottoms[0] {
                arena.reshape(top, &shape)?;
            }
            let layout = output_layout(&shape, tier, DataType::F32, 1.0)?;
            self.negotiator.bind_output(i, top, layout, arena, ctx)?;
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
        let values: Vec<f32> = self
            .negotiator
            .read_input(0, arena, ctx, false)?
            .into_iter()
            .map(|v| v + self.offset)
            .collect();
        for (i, &top) in tops.iter().enumerate() {
            self.negotiator
                .write_output(i, arena, ctx, &values, top == bottoms[0], &self.name)?;
        }
        Ok(())
    }
}

struct AddOp {
    type_name: &'static str,
    offset: f32,
}

impl Operator for AddOp {
    fn name(&self) -> &str {
        self.type_name
    }

    fn create_layer(&self, ctx: &LayerCtx) -> Result<Box<dyn Layer>> {
        Ok(Box::new(AddLayer {
            name: ctx.name().to_string(),
            engine: ctx.engine.clone(),
            offset: self.offset,
            negotiator: LayoutNegotiator::new(),
        }))
    }
}

/// `Input`, `ReLU` (adds one), and `Split` (copies).
pub fn test_registry() -> OperatorRegistry {
    let mut registry = OperatorRegistry::new();
    registry
        .register("Input", InputOp)
        .register(
            "ReLU",
            AddOp {
                type_name: "ReLU",
                offset: 1.0,
            },
        )
        .register(
            "Split",
            AddOp {
                type_name: "Split",
                offset: 0.0,
            },
        );
    registry
}
