//! Elementwise combination of same-shaped inputs.

use crate::helpers::{same_shape_layouts, tier_input_layout};
use tessera_core::{EltwiseConfig, EltwiseOp, Error, LayerConfig};
use tessera_runtime::{
    EngineSpec, ExecutionContext, Layer, LayerCtx, LayoutNegotiator, Operator, Result,
    RuntimeError, TensorArena, TensorId,
};

/// Eltwise operator.
///
/// Combines two or more inputs of identical shape element by element.
///
/// **Operations:**
/// - `Sum`: weighted sum, one coefficient per input (all 1 when empty)
/// - `Prod`: product
/// - `Max`: maximum
///
/// **Implementation:**
/// - Inputs are read at full precision in the selected tier's format
/// - Accumulates input by input into the first input's values
pub struct ElementwiseOp;

impl Operator for ElementwiseOp {
    fn name(&self) -> &str {
        "Eltwise"
    }

    fn create_layer(&self, ctx: &LayerCtx) -> Result<Box<dyn Layer>> {
        let LayerConfig::Eltwise(config) = &ctx.node.config else {
            return Err(Error::Configuration(format!("layer '{}' is not an eltwise", ctx.name())).into());
        };
        let inputs = ctx.node.inputs.len();
        if inputs < 2 {
            return Err(RuntimeError::InvalidInputOutput(format!(
                "eltwise '{}' needs at least two inputs, got {}",
                ctx.name(),
                inputs
            )));
        }
        ctx.expect_arity(inputs, 1)?;
        if !config.coeffs.is_empty() {
            if config.operation != EltwiseOp::Sum {
                return Err(Error::Configuration(format!(
                    "eltwise '{}': coefficients only apply to SUM",
                    ctx.name()
                ))
                .into());
            }
            if config.coeffs.len() != inputs {
                return Err(Error::Configuration(format!(
                    "eltwise '{}' has {} coefficients for {} inputs",
                    ctx.name(),
                    config.coeffs.len(),
                    inputs
                ))
                .into());
            }
        }
        Ok(Box::new(ElementwiseLayer {
            name: ctx.name().to_string(),
            engine: ctx.engine.clone(),
            config: config.clone(),
            negotiator: LayoutNegotiator::new(),
        }))
    }
}

struct ElementwiseLayer {
    name: String,
    engine: EngineSpec,
    config: EltwiseConfig,
    negotiator: LayoutNegotiator,
}

impl ElementwiseLayer {
    fn coeff(&self, input: usize) -> f32 {
        self.config.coeffs.get(input).copied().unwrap_or(1.0)
    }
}

impl Layer for ElementwiseLayer {
    fn op_type(&self) -> &str {
        "Eltwise"
    }

    fn reshape(
        &mut self,
        bottoms: &[TensorId],
        tops: &[TensorId],
        arena: &mut TensorArena,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        let shape = arena.shape(bottoms[0])?.to_vec();
        for &bottom in &bottoms[1..] {
            let other = arena.shape(bottom)?;
            if other != shape.as_slice() {
                return Err(RuntimeError::DimensionError(format!(
                    "eltwise '{}' inputs differ in shape: {:?} vs {:?}",
                    self.name, shape, other
                )));
            }
        }

        let (tier, first, output) =
            same_shape_layouts(&self.name, &self.engine, arena, bottoms[0], tops[0] == bottoms[0])?;
        self.negotiator.set_tier(tier);
        self.negotiator.bind_input(0, bottoms[0], first)?;
        for (i, &bottom) in bottoms.iter().enumerate().skip(1) {
            let layout = tier_input_layout(arena, bottom, tier)?;
            self.negotiator.bind_input(i, bottom, layout)?;
        }
        arena.reshape(tops[0], &shape)?;
        self.negotiator.bind_output(0, tops[0], output, arena, ctx)
    }

    fn forward(
        &mut self,
        bottoms: &[TensorId],
        tops: &[TensorId],
        arena: &mut TensorArena,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        let mut acc = self.negotiator.read_input(0, arena, ctx, false)?;
        if self.config.operation == EltwiseOp::Sum {
            let c = self.coeff(0);
            if c != 1.0 {
                acc.iter_mut().for_each(|v| *v *= c);
            }
        }
        for i in 1..bottoms.len() {
            let x = self.negotiator.read_input(i, arena, ctx, false)?;
            match self.config.operation {
                EltwiseOp::Sum => {
                    let c = self.coeff(i);
                    acc.iter_mut().zip(&x).for_each(|(a, v)| *a += c * v);
                }
                EltwiseOp::Prod => acc.iter_mut().zip(&x).for_each(|(a, v)| *a *= v),
                EltwiseOp::Max => acc.iter_mut().zip(&x).for_each(|(a, v)| *a = a.max(*v)),
            }
        }
        self.negotiator
            .write_output(0, arena, ctx, &acc, tops[0] == bottoms[0], &self.name)
    }
}
