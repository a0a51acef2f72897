//! Spatial pooling operator.

use crate::helpers::{follow_layout, nchw, pool_out_dim};
use tessera_core::{Error, LayerConfig, PoolMethod, PoolingConfig};
use tessera_runtime::{
    EngineSpec, ExecutionContext, Layer, LayerCtx, LayoutNegotiator, Operator, Result,
    TensorArena, TensorId,
};

/// Pooling operator.
///
/// Max or average pooling over each channel plane of an NCHW tensor.
///
/// **Implementation:**
/// - Output extents round up; a last window that would start inside the
///   trailing padding is dropped
/// - Average pooling divides by the window size clipped to the padded
///   input, so padded cells count toward the divisor
/// - Global pooling uses the whole plane as the window
/// - The output keeps the input's layout, including its precision
pub struct PoolingOp;

impl Operator for PoolingOp {
    fn name(&self) -> &str {
        "Pooling"
    }

    fn create_layer(&self, ctx: &LayerCtx) -> Result<Box<dyn Layer>> {
        let LayerConfig::Pooling(config) = &ctx.node.config else {
            return Err(Error::Configuration(format!("layer '{}' is not a pooling", ctx.name())).into());
        };
        ctx.expect_arity(1, 1)?;
        if ctx.node.is_in_place(0) {
            return Err(Error::Configuration(format!(
                "pooling '{}' cannot compute in place",
                ctx.name()
            ))
            .into());
        }
        if !config.global && (config.kernel.contains(&0) || config.stride.contains(&0)) {
            return Err(Error::Configuration(format!(
                "pooling '{}' needs a positive kernel and stride",
                ctx.name()
            ))
            .into());
        }
        Ok(Box::new(PoolingLayer {
            name: ctx.name().to_string(),
            engine: ctx.engine.clone(),
            config: config.clone(),
            negotiator: LayoutNegotiator::new(),
            window: Window::default(),
        }))
    }
}

/// Window geometry resolved at reshape.
#[derive(Debug, Default, Clone, Copy)]
struct Window {
    input: [usize; 4],
    output: [usize; 2],
    kernel: [usize; 2],
    stride: [usize; 2],
    pad: [usize; 2],
}

struct PoolingLayer {
    name: String,
    engine: EngineSpec,
    config: PoolingConfig,
    negotiator: LayoutNegotiator,
    window: Window,
}

impl PoolingLayer {
    fn pool(&self, x: &[f32]) -> Vec<f32> {
        let Window {
            input: [n, c, h, w],
            output: [oh, ow],
            kernel: [kh, kw],
            stride: [sh, sw],
            pad: [ph, pw],
        } = self.window;
        let (h, w) = (h as isize, w as isize);
        let (ph, pw) = (ph as isize, pw as isize);

        let mut y = vec![0.0; n * c * oh * ow];
        for (plane, out) in y.chunks_mut(oh * ow).enumerate() {
            let values = &x[plane * (h * w) as usize..][..(h * w) as usize];
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut hstart = (oy * sh) as isize - ph;
                    let mut wstart = (ox * sw) as isize - pw;
                    let mut hend = (hstart + kh as isize).min(h + ph);
                    let mut wend = (wstart + kw as isize).min(w + pw);
                    let pool_size = ((hend - hstart) * (wend - wstart)) as f32;
                    hstart = hstart.max(0);
                    wstart = wstart.max(0);
                    hend = hend.min(h);
                    wend = wend.min(w);

                    let cells = (hstart..hend)
                        .flat_map(|iy| (wstart..wend).map(move |ix| (iy * w + ix) as usize));
                    out[oy * ow + ox] = match self.config.method {
                        PoolMethod::Max => {
                            let max = cells.map(|i| values[i]).fold(f32::NEG_INFINITY, f32::max);
                            if max.is_finite() { max } else { 0.0 }
                        }
                        PoolMethod::Average => cells.map(|i| values[i]).sum::<f32>() / pool_size,
                    };
                }
            }
        }
        y
    }
}

impl Layer for PoolingLayer {
    fn op_type(&self) -> &str {
        "Pooling"
    }

    fn reshape(
        &mut self,
        bottoms: &[TensorId],
        tops: &[TensorId],
        arena: &mut TensorArena,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        let [n, c, h, w] = nchw(&self.name, arena.shape(bottoms[0])?)?;
        let (kernel, stride, pad) = if self.config.global {
            ([h, w], [1, 1], [0, 0])
        } else {
            (self.config.kernel, self.config.stride, self.config.pad)
        };
        let oh = pool_out_dim(h, kernel[0], stride[0], pad[0])?;
        let ow = pool_out_dim(w, kernel[1], stride[1], pad[1])?;
        self.window = Window {
            input: [n, c, h, w],
            output: [oh, ow],
            kernel,
            stride,
            pad,
        };

        let input = follow_layout(&self.name, arena, bottoms[0], &self.engine)?;
        let output = input.with_dims(&[n, c, oh, ow]);
        arena.reshape(tops[0], &[n, c, oh, ow])?;
        self.negotiator.bind_input(0, bottoms[0], input)?;
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
        let y = self.pool(&x);
        self.negotiator
            .write_output(0, arena, ctx, &y, false, &self.name)
    }
}
