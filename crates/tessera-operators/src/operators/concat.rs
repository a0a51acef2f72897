//! Concatenation operator with in-place aliasing.

use tessera_core::{ConcatConfig, Error, LayerConfig};
use tessera_runtime::{
    CHANNEL_BLOCK, EngineSpec, ExecutionContext, Layer, LayerCtx, Layout, LayoutNegotiator,
    MemoryFormat, Operator, Result, RuntimeError, TensorArena, TensorId, current_layout,
};

/// Concat operator.
///
/// Joins its inputs along `axis`; every other dimension must agree.
///
/// **Layouts:**
/// - When all inputs share a format and element type (and the engine
///   allows that format), the output uses them too, with the smallest
///   input scale. Inputs with a larger scale are rescaled while merging.
/// - Otherwise everything is merged at full precision in canonical layout.
///
/// **In-place aliasing:** on axis 1 with a leading dimension of 1, inputs
/// that already sit in the merged layout (plain, or blocked with every
/// input but the last a whole number of blocks) are redirected into the
/// output buffer at their channel offsets. Producers then write straight
/// into the output and forward only publishes it. A reshape that breaks
/// the condition gives the inputs their own storage back.
pub struct ConcatOp;

impl Operator for ConcatOp {
    fn name(&self) -> &str {
        "Concat"
    }

    fn create_layer(&self, ctx: &LayerCtx) -> Result<Box<dyn Layer>> {
        let LayerConfig::Concat(config) = &ctx.node.config else {
            return Err(Error::Configuration(format!("layer '{}' is not a concat", ctx.name())).into());
        };
        let inputs = ctx.node.inputs.len();
        if inputs == 0 {
            return Err(RuntimeError::InvalidInputOutput(format!(
                "concat '{}' has no inputs",
                ctx.name()
            )));
        }
        ctx.expect_arity(inputs, 1)?;
        if ctx.node.inputs.iter().any(|i| i == &ctx.node.outputs[0]) {
            return Err(Error::Configuration(format!(
                "concat '{}' cannot compute in place",
                ctx.name()
            ))
            .into());
        }
        Ok(Box::new(ConcatLayer {
            name: ctx.name().to_string(),
            engine: ctx.engine.clone(),
            config: config.clone(),
            negotiator: LayoutNegotiator::new(),
            axis_sizes: Vec::new(),
            out_dims: Vec::new(),
            aliased: false,
        }))
    }
}

struct ConcatLayer {
    name: String,
    engine: EngineSpec,
    config: ConcatConfig,
    negotiator: LayoutNegotiator,
    axis_sizes: Vec<usize>,
    out_dims: Vec<usize>,
    aliased: bool,
}

impl ConcatLayer {
    fn output_dims(&mut self, bottoms: &[TensorId], arena: &TensorArena) -> Result<Vec<usize>> {
        let axis = self.config.axis;
        let first = arena.shape(bottoms[0])?;
        if axis >= first.len() {
            return Err(RuntimeError::DimensionError(format!(
                "concat '{}' axis {} is out of range for rank {}",
                self.name,
                axis,
                first.len()
            )));
        }
        let mut dims = first.to_vec();
        dims[axis] = 0;
        self.axis_sizes.clear();
        for &bottom in bottoms {
            let shape = arena.shape(bottom)?;
            let agrees = shape.len() == dims.len()
                && shape
                    .iter()
                    .zip(&dims)
                    .enumerate()
                    .all(|(d, (a, b))| d == axis || a == b);
            if !agrees {
                return Err(RuntimeError::DimensionError(format!(
                    "concat '{}' input {:?} does not match {:?} outside axis {}",
                    self.name,
                    shape,
                    first,
                    axis
                )));
            }
            self.axis_sizes.push(shape[axis]);
            dims[axis] += shape[axis];
        }
        Ok(dims)
    }

    /// Merged layout and the layout each input is read in.
    fn layouts(
        &self,
        bottoms: &[TensorId],
        arena: &TensorArena,
    ) -> Result<(Layout, Vec<Layout>)> {
        let canonical = || -> Result<(Layout, Vec<Layout>)> {
            let inputs = bottoms
                .iter()
                .map(|&b| Ok(Layout::canonical(arena.shape(b)?)))
                .collect::<Result<Vec<_>>>()?;
            Ok((Layout::canonical(&self.out_dims), inputs))
        };
        if self.engine.is_reference() {
            return canonical();
        }

        let current = bottoms
            .iter()
            .map(|&b| current_layout(arena, b))
            .collect::<Result<Vec<_>>>()?;
        let first = &current[0];
        let shared = current.iter().all(|l| l.same_encoding(first));
        let allowed = self
            .engine
            .tiers()
            .iter()
            .any(|tier| tier.format() == first.format());
        if !shared || !allowed {
            tracing::debug!(layer = %self.name, "inputs disagree on layout, merging canonically");
            return canonical();
        }

        let scale = current
            .iter()
            .map(Layout::scale)
            .fold(f32::INFINITY, f32::min);
        let output = Layout::new(&self.out_dims, first.format(), first.dtype(), scale)?;
        let inputs = current
            .iter()
            .map(|l| Layout::new(l.dims(), l.format(), l.dtype(), scale))
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(layer = %self.name, output = %output, "merged concat layout");
        Ok((output, inputs))
    }

    fn can_alias(
        &self,
        bottoms: &[TensorId],
        top: TensorId,
        arena: &TensorArena,
        output: &Layout,
        inputs: &[Layout],
    ) -> Result<bool> {
        if self.config.axis != 1
            || self.out_dims.first() != Some(&1)
            || output.is_canonical()
            || !matches!(output.format(), MemoryFormat::Plain | MemoryFormat::Blocked8)
        {
            return Ok(false);
        }
        for (i, (&bottom, layout)) in bottoms.iter().zip(inputs).enumerate() {
            if bottom == top || bottoms[..i].contains(&bottom) || arena.is_alias_target(bottom) {
                return Ok(false);
            }
            let resident = arena
                .get(bottom)?
                .native_layout()
                .is_some_and(|l| l.key() == layout.key());
            if !resident {
                return Ok(false);
            }
            let last = i + 1 == bottoms.len();
            if output.format() == MemoryFormat::Blocked8
                && !last
                && self.axis_sizes[i] % CHANNEL_BLOCK != 0
            {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl Layer for ConcatLayer {
    fn op_type(&self) -> &str {
        "Concat"
    }

    fn reshape(
        &mut self,
        bottoms: &[TensorId],
        tops: &[TensorId],
        arena: &mut TensorArena,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        for &bottom in bottoms {
            arena.unalias(bottom)?;
        }
        self.aliased = false;

        self.out_dims = self.output_dims(bottoms, arena)?;
        arena.reshape(tops[0], &self.out_dims)?;
        let (output, inputs) = self.layouts(bottoms, arena)?;
        let alias = self.can_alias(bottoms, tops[0], arena, &output, &inputs)?;

        for (i, (&bottom, layout)) in bottoms.iter().zip(inputs).enumerate() {
            self.negotiator.bind_input(i, bottom, layout)?;
        }
        self.negotiator
            .bind_output(0, tops[0], output.clone(), arena, ctx)?;

        if alias {
            let mut channel = 0;
            for (&bottom, &channels) in bottoms.iter().zip(&self.axis_sizes) {
                arena.alias(bottom, tops[0], output.channel_offset(channel), ctx)?;
                channel += channels;
            }
            self.aliased = true;
            tracing::debug!(layer = %self.name, inputs = bottoms.len(), "concat inputs aliased into output");
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
        if self.aliased {
            // Inputs written canonically still have to land in the shared buffer.
            for &bottom in bottoms {
                arena.sync_native(bottom, ctx)?;
            }
            let stream = ctx.submit(self.name.as_str());
            return arena.mark_native_written(tops[0], Some(stream));
        }

        let axis = self.config.axis;
        let inner: usize = self.out_dims[axis + 1..].iter().product();
        let outer: usize = self.out_dims[..axis].iter().product();
        let mut inputs = Vec::with_capacity(bottoms.len());
        for i in 0..bottoms.len() {
            inputs.push(self.negotiator.read_input(i, arena, ctx, false)?);
        }

        let mut y = Vec::with_capacity(self.out_dims.iter().product());
        for o in 0..outer {
            for (x, &size) in inputs.iter().zip(&self.axis_sizes) {
                let len = size * inner;
                y.extend_from_slice(&x[o * len..(o + 1) * len]);
            }
        }
        self.negotiator
            .write_output(0, arena, ctx, &y, false, &self.name)
    }
}
