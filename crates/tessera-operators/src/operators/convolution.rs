//! Convolution operator with fused activation and fused sum.

use crate::helpers::{checked_weights, conv_out_dim, nchw, select_tier};
use tessera_core::{ConvolutionConfig, Error, FusionType, LayerConfig, WeightBlob};
use tessera_runtime::{
    CHANNEL_BLOCK, CapabilityTier, DataType, EngineSpec, ExecutionContext, Layer, LayerCtx, Layout,
    LayoutNegotiator, Operator, Result, RuntimeError, TensorArena, TensorId, current_layout,
    output_layout, preferred_layout, unavailable,
};

/// Convolution operator.
///
/// 2-D convolution over NCHW input with groups, dilation, and an optional
/// bias.
///
/// **Weights:**
/// - kernel `[num_output, channels / group, kernel_h, kernel_w]`
/// - bias `[num_output]` (only with `bias_term`)
///
/// **Fusion:**
/// - `relu`: the output is rectified
/// - `FusionType::Sum`: a second input of the output's shape is added to
///   the convolution result before the activation
///
/// **Layouts:**
/// - Tiers come from the layer's engine. The blocked tier refuses grouped
///   convolutions whose per-group channel counts are not whole blocks.
/// - With `output_scale` set the output is stored quantized: `S8`, or `U8`
///   when the activation guarantees a non-negative result. The reference
///   engine ignores the scale and writes canonical output.
pub struct ConvolutionOp;

impl Operator for ConvolutionOp {
    fn name(&self) -> &str {
        "Convolution"
    }

    fn create_layer(&self, ctx: &LayerCtx) -> Result<Box<dyn Layer>> {
        let LayerConfig::Convolution(config) = &ctx.node.config else {
            return Err(Error::Configuration(format!(
                "layer '{}' is not a convolution",
                ctx.name()
            ))
            .into());
        };
        let inputs = match config.fusion {
            FusionType::None => 1,
            FusionType::Sum => 2,
        };
        ctx.expect_arity(inputs, 1)?;
        if ctx.node.is_in_place(0) {
            return Err(Error::Configuration(format!(
                "convolution '{}' cannot compute in place",
                ctx.name()
            ))
            .into());
        }
        if config.group == 0 || config.num_output % config.group != 0 {
            return Err(Error::Configuration(format!(
                "convolution '{}': num_output {} is not divisible by group {}",
                ctx.name(),
                config.num_output,
                config.group
            ))
            .into());
        }
        if config.kernel.contains(&0) || config.stride.contains(&0) || config.dilation.contains(&0)
        {
            return Err(Error::Configuration(format!(
                "convolution '{}' needs positive kernel, stride, and dilation",
                ctx.name()
            ))
            .into());
        }

        Ok(Box::new(ConvolutionLayer {
            name: ctx.name().to_string(),
            engine: ctx.engine.clone(),
            config: config.clone(),
            weights: ctx.node.weights.clone(),
            negotiator: LayoutNegotiator::new(),
            input_dims: [0; 4],
            output_hw: [0; 2],
        }))
    }
}

struct ConvolutionLayer {
    name: String,
    engine: EngineSpec,
    config: ConvolutionConfig,
    weights: Vec<WeightBlob>,
    negotiator: LayoutNegotiator,
    /// Input `[n, c, h, w]` as of the last reshape.
    input_dims: [usize; 4],
    output_hw: [usize; 2],
}

impl ConvolutionLayer {
    fn probe(&self, tier: CapabilityTier, channels: usize) -> Result<()> {
        let group = self.config.group;
        if tier == CapabilityTier::Blocked && group > 1 {
            let (per_in, per_out) = (channels / group, self.config.num_output / group);
            if per_in % CHANNEL_BLOCK != 0 || per_out % CHANNEL_BLOCK != 0 {
                return unavailable(format!(
                    "{} input and {} output channels per group are not whole blocks",
                    per_in, per_out
                ));
            }
        }
        Ok(())
    }

    fn output_encoding(&self) -> (DataType, f32) {
        match self.config.output_scale {
            Some(scale) if self.config.relu => (DataType::U8, scale),
            Some(scale) => (DataType::S8, scale),
            None => (DataType::F32, 1.0),
        }
    }

    fn convolve(&self, x: &[f32]) -> Vec<f32> {
        let [n, c, h, w] = self.input_dims;
        let [oh, ow] = self.output_hw;
        let [kh, kw] = self.config.kernel;
        let [sh, sw] = self.config.stride;
        let [ph, pw] = self.config.pad;
        let [dh, dw] = self.config.dilation;
        let outputs = self.config.num_output;
        let per_in = c / self.config.group;
        let per_out = outputs / self.config.group;
        let kernel = &self.weights[0].data;
        let bias = self.weights.get(1).map(|b| b.data.as_slice());

        let mut y = vec![0.0; n * outputs * oh * ow];
        for b in 0..n {
            for oc in 0..outputs {
                let first_channel = (oc / per_out) * per_in;
                let init = bias.map_or(0.0, |bias| bias[oc]);
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut acc = init;
                        for ic in 0..per_in {
                            let plane = (b * c + first_channel + ic) * h;
                            for ky in 0..kh {
                                let Some(iy) = (oy * sh + ky * dh).checked_sub(ph) else {
                                    continue;
                                };
                                if iy >= h {
                                    continue;
                                }
                                for kx in 0..kw {
                                    let Some(ix) = (ox * sw + kx * dw).checked_sub(pw) else {
                                        continue;
                                    };
                                    if ix >= w {
                                        continue;
                                    }
                                    acc += kernel[((oc * per_in + ic) * kh + ky) * kw + kx]
                                        * x[(plane + iy) * w + ix];
                                }
                            }
                        }
                        y[((b * outputs + oc) * oh + oy) * ow + ox] = acc;
                    }
                }
            }
        }
        y
    }
}

impl Layer for ConvolutionLayer {
    fn op_type(&self) -> &str {
        "Convolution"
    }

    fn layer_setup(
        &mut self,
        bottoms: &[TensorId],
        _tops: &[TensorId],
        arena: &mut TensorArena,
    ) -> Result<()> {
        let [_, channels, _, _] = nchw(&self.name, arena.shape(bottoms[0])?)?;
        if channels % self.config.group != 0 {
            return Err(Error::Configuration(format!(
                "convolution '{}': {} input channels are not divisible by group {}",
                self.name, channels, self.config.group
            ))
            .into());
        }
        let [kh, kw] = self.config.kernel;
        let outputs = self.config.num_output;
        let mut defaults = vec![WeightBlob::zeros(vec![
            outputs,
            channels / self.config.group,
            kh,
            kw,
        ])];
        if self.config.bias_term {
            defaults.push(WeightBlob::zeros(vec![outputs]));
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
        let [n, c, h, w] = nchw(&self.name, &shape)?;
        let [kh, kw] = self.config.kernel;
        let [sh, sw] = self.config.stride;
        let [ph, pw] = self.config.pad;
        let [dh, dw] = self.config.dilation;
        let oh = conv_out_dim(h, kh, sh, ph, dh)?;
        let ow = conv_out_dim(w, kw, sw, pw, dw)?;
        let out_dims = [n, self.config.num_output, oh, ow];
        self.input_dims = [n, c, h, w];
        self.output_hw = [oh, ow];

        let tier = select_tier(&self.name, &self.engine, |tier| self.probe(tier, c))?;
        let input = match tier {
            Some(tier) => preferred_layout(arena, bottoms[0], tier.format())?,
            None => Layout::canonical(&shape),
        };
        let (dtype, scale) = self.output_encoding();
        let output = output_layout(&out_dims, tier, dtype, scale)?;
        tracing::debug!(
            layer = %self.name,
            input = %input,
            output = %output,
            "convolution layouts"
        );

        arena.reshape(tops[0], &out_dims)?;
        self.negotiator.set_tier(tier);
        self.negotiator.bind_input(0, bottoms[0], input)?;
        self.negotiator.bind_output(0, tops[0], output, arena, ctx)?;

        if self.config.fusion == FusionType::Sum {
            let other = arena.shape(bottoms[1])?;
            if other != out_dims {
                return Err(RuntimeError::DimensionError(format!(
                    "convolution '{}' sums an input of shape {:?} into output {:?}",
                    self.name, other, out_dims
                )));
            }
            let layout = current_layout(arena, bottoms[1])?;
            self.negotiator.bind_input(1, bottoms[1], layout)?;
        }
        Ok(())
    }

    fn forward(
        &mut self,
        _bottoms: &[TensorId],
        _tops: &[TensorId],
        arena: &mut TensorArena,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        let x = self.negotiator.read_input(0, arena, ctx, true)?;
        let mut y = self.convolve(&x);
        if self.config.fusion == FusionType::Sum {
            let other = self.negotiator.read_input(1, arena, ctx, false)?;
            for (v, o) in y.iter_mut().zip(&other) {
                *v += o;
            }
        }
        if self.config.relu {
            for v in &mut y {
                *v = v.max(0.0);
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
