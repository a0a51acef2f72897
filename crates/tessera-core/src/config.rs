//! Typed per-layer configuration records.
//!
//! Every graph node carries exactly one `LayerConfig`. The variant doubles as
//! the node's operator-type tag (see [`LayerConfig::op_type`]), so a rewrite
//! that changes what a node computes edits its config in place of a separate
//! attribute map.

/// How a convolution combines its result with an auxiliary input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FusionType {
    /// Plain convolution.
    #[default]
    None,
    /// The second input is accumulated into the convolution output.
    Sum,
}

/// Convolution parameters. Spatial pairs are `[height, width]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvolutionConfig {
    pub num_output: usize,
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub pad: [usize; 2],
    pub dilation: [usize; 2],
    pub group: usize,
    pub bias_term: bool,
    /// Rectifying activation fused into the output.
    pub relu: bool,
    pub fusion: FusionType,
    /// Quantized output scale. `None` keeps the output in full precision.
    pub output_scale: Option<f32>,
}

impl ConvolutionConfig {
    /// Square kernel with unit stride, no padding, and a bias term.
    pub fn new(num_output: usize, kernel: usize) -> Self {
        Self {
            num_output,
            kernel: [kernel, kernel],
            stride: [1, 1],
            pad: [0, 0],
            dilation: [1, 1],
            group: 1,
            bias_term: true,
            relu: false,
            fusion: FusionType::None,
            output_scale: None,
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = [stride, stride];
        self
    }

    pub fn with_pad(mut self, pad: usize) -> Self {
        self.pad = [pad, pad];
        self
    }

    pub fn with_group(mut self, group: usize) -> Self {
        self.group = group;
        self
    }

    pub fn with_bias(mut self, bias_term: bool) -> Self {
        self.bias_term = bias_term;
        self
    }

    pub fn with_output_scale(mut self, scale: f32) -> Self {
        self.output_scale = Some(scale);
        self
    }

    /// True for an unpadded 1x1 kernel.
    pub fn is_pointwise(&self) -> bool {
        self.kernel == [1, 1] && self.pad == [0, 0]
    }
}

/// Batch normalization with stored global statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormConfig {
    pub eps: f32,
    /// Set when an affine layer was merged in; weights then carry the
    /// affine scale (and bias if `bias_term`).
    pub scale_bias: bool,
    pub bias_term: bool,
    pub relu: bool,
}

impl Default for BatchNormConfig {
    fn default() -> Self {
        Self {
            eps: 1e-5,
            scale_bias: false,
            bias_term: true,
            relu: false,
        }
    }
}

/// Per-channel affine transform.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleConfig {
    pub bias_term: bool,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self { bias_term: true }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReluConfig {
    pub negative_slope: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EltwiseOp {
    Prod,
    #[default]
    Sum,
    Max,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct EltwiseConfig {
    pub operation: EltwiseOp,
    /// One coefficient per input, only meaningful for `Sum`. Empty means all 1.
    pub coeffs: Vec<f32>,
}

impl EltwiseConfig {
    pub fn sum() -> Self {
        Self::default()
    }

    /// A sum with unit coefficients.
    pub fn is_plain_sum(&self) -> bool {
        self.operation == EltwiseOp::Sum && self.coeffs.iter().all(|&c| c == 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolMethod {
    #[default]
    Max,
    Average,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolingConfig {
    pub method: PoolMethod,
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub pad: [usize; 2],
    pub global: bool,
}

impl PoolingConfig {
    pub fn max(kernel: usize, stride: usize) -> Self {
        Self {
            method: PoolMethod::Max,
            kernel: [kernel, kernel],
            stride: [stride, stride],
            pad: [0, 0],
            global: false,
        }
    }

    pub fn average(kernel: usize, stride: usize) -> Self {
        Self {
            method: PoolMethod::Average,
            ..Self::max(kernel, stride)
        }
    }

    pub fn global_average() -> Self {
        Self {
            global: true,
            ..Self::average(1, 1)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConcatConfig {
    pub axis: usize,
}

impl Default for ConcatConfig {
    fn default() -> Self {
        Self { axis: 1 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InnerProductConfig {
    pub num_output: usize,
    pub bias_term: bool,
}

/// Operator configuration, one variant per supported layer type.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerConfig {
    /// Graph input; one shape per output edge.
    Input { shapes: Vec<Vec<usize>> },
    Convolution(ConvolutionConfig),
    BatchNorm(BatchNormConfig),
    Scale(ScaleConfig),
    ReLU(ReluConfig),
    Eltwise(EltwiseConfig),
    Pooling(PoolingConfig),
    Concat(ConcatConfig),
    Split,
    InnerProduct(InnerProductConfig),
}

impl LayerConfig {
    /// Operator-type tag used for registry lookup and logging.
    pub fn op_type(&self) -> &'static str {
        match self {
            LayerConfig::Input { .. } => "Input",
            LayerConfig::Convolution(_) => "Convolution",
            LayerConfig::BatchNorm(_) => "BatchNorm",
            LayerConfig::Scale(_) => "Scale",
            LayerConfig::ReLU(_) => "ReLU",
            LayerConfig::Eltwise(_) => "Eltwise",
            LayerConfig::Pooling(_) => "Pooling",
            LayerConfig::Concat(_) => "Concat",
            LayerConfig::Split => "Split",
            LayerConfig::InnerProduct(_) => "InnerProduct",
        }
    }
}
