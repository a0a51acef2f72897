//! Helper functions shared by the operator implementations.
//!
//! Shape arithmetic, weight validation, and the layout choices that several
//! operators make the same way.

use tessera_core::WeightBlob;
use tessera_runtime::{
    CapabilityTier, DataType, EngineSpec, Layout, Result, RuntimeError, TensorArena, TensorId,
    current_layout, negotiate, output_layout, preferred_layout, unavailable,
};

/// Split a rank-4 shape into `[n, c, h, w]`.
pub fn nchw(layer: &str, shape: &[usize]) -> Result<[usize; 4]> {
    match *shape {
        [n, c, h, w] => Ok([n, c, h, w]),
        _ => Err(RuntimeError::DimensionError(format!(
            "layer '{}' needs a rank-4 input, got {:?}",
            layer, shape
        ))),
    }
}

/// Channel count and the number of elements per channel plane, for any
/// shape with a channel axis at position 1.
pub fn channel_planes(layer: &str, shape: &[usize]) -> Result<(usize, usize, usize)> {
    if shape.len() < 2 {
        return Err(RuntimeError::DimensionError(format!(
            "layer '{}' needs a channel axis, got {:?}",
            layer, shape
        )));
    }
    Ok((shape[0], shape[1], shape[2..].iter().product()))
}

/// Convolution output extent with floor rounding.
pub fn conv_out_dim(
    input: usize,
    kernel: usize,
    stride: usize,
    pad: usize,
    dilation: usize,
) -> Result<usize> {
    if kernel == 0 || stride == 0 {
        return Err(RuntimeError::DimensionError(format!(
            "kernel {} and stride {} must be positive",
            kernel, stride
        )));
    }
    let extent = dilation * (kernel - 1) + 1;
    if input + 2 * pad < extent {
        return Err(RuntimeError::DimensionError(format!(
            "kernel extent {} with stride {} does not fit input {} padded by {}",
            extent, stride, input, pad
        )));
    }
    Ok((input + 2 * pad - extent) / stride + 1)
}

/// Pooling output extent with ceil rounding.
///
/// A last window that would start in the trailing padding is dropped. The
/// same clamp applies to 1x1 windows, so a strided 1x1 pool yields exactly
/// the extent a strided 1x1 convolution would.
pub fn pool_out_dim(input: usize, kernel: usize, stride: usize, pad: usize) -> Result<usize> {
    if stride == 0 || kernel == 0 || input + 2 * pad < kernel {
        return Err(RuntimeError::DimensionError(format!(
            "pooling window {} with stride {} does not fit input {} padded by {}",
            kernel, stride, input, pad
        )));
    }
    let mut out = (input + 2 * pad - kernel).div_ceil(stride) + 1;
    if (pad > 0 || kernel == 1) && (out - 1) * stride >= input + pad {
        out -= 1;
    }
    Ok(out)
}

/// The node's own weights if it carries any, checked blob by blob against
/// `defaults`; otherwise `defaults`.
pub fn checked_weights(
    layer: &str,
    given: &[WeightBlob],
    defaults: Vec<WeightBlob>,
) -> Result<Vec<WeightBlob>> {
    if given.is_empty() {
        return Ok(defaults);
    }
    if given.len() != defaults.len() {
        return Err(RuntimeError::BlobCountMismatch {
            layer: layer.to_string(),
            source_count: given.len(),
            target_count: defaults.len(),
        });
    }
    for (index, (blob, expected)) in given.iter().zip(&defaults).enumerate() {
        if blob.shape != expected.shape {
            return Err(RuntimeError::ShapeMismatch {
                layer: layer.to_string(),
                index,
                source_shape: blob.shape_string(),
                target_shape: expected.shape_string(),
            });
        }
    }
    Ok(given.to_vec())
}

/// Non-plain tiers only describe rank-4 tensors.
pub fn require_rank4(tier: CapabilityTier, shape: &[usize]) -> Result<()> {
    if tier != CapabilityTier::Plain && shape.len() != 4 {
        return unavailable(format!(
            "{:?} layout needs a rank-4 tensor, got rank {}",
            tier,
            shape.len()
        ));
    }
    Ok(())
}

/// The engine's first tier that `probe` accepts, or `None` on the
/// reference engine.
pub fn select_tier(
    layer: &str,
    engine: &EngineSpec,
    probe: impl FnMut(CapabilityTier) -> Result<()>,
) -> Result<Option<CapabilityTier>> {
    if engine.is_reference() {
        return Ok(None);
    }
    let (tier, ()) = negotiate(layer, engine.tiers(), probe)?;
    Ok(Some(tier))
}

/// Full-precision layout in `tier`'s format for reading `tensor`;
/// canonical without a tier.
pub fn tier_input_layout(
    arena: &TensorArena,
    tensor: TensorId,
    tier: Option<CapabilityTier>,
) -> Result<Layout> {
    match tier {
        Some(tier) => preferred_layout(arena, tensor, tier.format()),
        None => Ok(Layout::canonical(arena.shape(tensor)?)),
    }
}

/// Tier, input layout, and output layout of an operator whose output has
/// its input's shape.
///
/// An in-place operator keeps the storage's current layout on both sides;
/// anything else would have producer and consumer rebinding the shared
/// storage on every pass.
pub fn same_shape_layouts(
    layer: &str,
    engine: &EngineSpec,
    arena: &TensorArena,
    bottom: TensorId,
    in_place: bool,
) -> Result<(Option<CapabilityTier>, Layout, Layout)> {
    let shape = arena.shape(bottom)?.to_vec();
    if in_place {
        let layout = current_layout(arena, bottom)?;
        let tier = CapabilityTier::ALL
            .into_iter()
            .find(|tier| tier.format() == layout.format());
        return Ok((tier, layout.clone(), layout));
    }
    let tier = select_tier(layer, engine, |tier| require_rank4(tier, &shape))?;
    let input = tier_input_layout(arena, bottom, tier)?;
    let output = output_layout(&shape, tier, DataType::F32, 1.0)?;
    Ok((tier, input, output))
}

/// Layout for an operator that computes in whatever layout its input
/// arrives in (activation, pooling, split).
///
/// The producer's own layout is tried first when the engine allows its
/// format; the remaining tiers follow in engine order at full precision.
pub fn follow_layout(
    layer: &str,
    arena: &TensorArena,
    tensor: TensorId,
    engine: &EngineSpec,
) -> Result<Layout> {
    let shape = arena.shape(tensor)?.to_vec();
    if engine.is_reference() {
        return Ok(Layout::canonical(&shape));
    }
    let current = current_layout(arena, tensor)?;
    let mut tiers = engine.tiers().to_vec();
    if let Some(pos) = tiers.iter().position(|t| t.format() == current.format()) {
        let preferred = tiers.remove(pos);
        tiers.insert(0, preferred);
    }
    let (_, layout) = negotiate(layer, &tiers, |tier| {
        if tier.format() == current.format() {
            return Ok(current.clone());
        }
        require_rank4(tier, &shape)?;
        Layout::new(&shape, tier.format(), DataType::F32, 1.0)
    })?;
    Ok(layout)
}
