//! Layout negotiation for one operator instance.
//!
//! Operators hold a [`LayoutNegotiator`] rather than implementing layout
//! handling themselves. During reshape the operator picks a layout per input
//! and output (usually after [`negotiate`](crate::capability::negotiate)
//! chose a capability tier) and binds them; during forward it reads and
//! writes logical values through the bound descriptors.

use crate::capability::CapabilityTier;
use crate::descriptor::LayoutDescriptor;
use crate::error::{Result, RuntimeError};
use crate::layout::{DataType, Layout, MemoryFormat};
use crate::storage::{TensorArena, TensorId};
use crate::stream::ExecutionContext;

/// Input and output descriptors of one operator.
#[derive(Debug, Default)]
pub struct LayoutNegotiator {
    inputs: Vec<LayoutDescriptor>,
    outputs: Vec<LayoutDescriptor>,
    tier: Option<CapabilityTier>,
}

impl LayoutNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tier the operator settled on; `None` for canonical-only operation.
    pub fn tier(&self) -> Option<CapabilityTier> {
        self.tier
    }

    pub fn set_tier(&mut self, tier: Option<CapabilityTier>) {
        self.tier = tier;
    }

    /// Bind input `index` to `tensor` read in `layout`.
    pub fn bind_input(&mut self, index: usize, tensor: TensorId, layout: Layout) -> Result<()> {
        bind(&mut self.inputs, "input", index, tensor, layout)
    }

    /// Bind output `index` to `tensor` written in `layout`. The storage's
    /// native side is set up right away so that downstream operators see
    /// the layout during their own reshape.
    pub fn bind_output(
        &mut self,
        index: usize,
        tensor: TensorId,
        layout: Layout,
        arena: &mut TensorArena,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        bind(&mut self.outputs, "output", index, tensor, layout)?;
        self.outputs[index].create_output(arena, ctx)
    }

    pub fn input(&self, index: usize) -> Result<&LayoutDescriptor> {
        self.inputs.get(index).ok_or_else(|| unbound("input", index))
    }

    pub fn output(&self, index: usize) -> Result<&LayoutDescriptor> {
        self.outputs.get(index).ok_or_else(|| unbound("output", index))
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Logical values of input `index` as seen through its layout.
    pub fn read_input(
        &mut self,
        index: usize,
        arena: &mut TensorArena,
        ctx: &mut ExecutionContext,
        materialize: bool,
    ) -> Result<Vec<f32>> {
        let desc = self
            .inputs
            .get_mut(index)
            .ok_or_else(|| unbound("input", index))?;
        desc.create_input(arena, ctx, materialize)?;
        desc.sync_before_read(arena, ctx)?;
        desc.read_values(arena)
    }

    /// Write logical `values` to output `index`.
    pub fn write_output(
        &mut self,
        index: usize,
        arena: &mut TensorArena,
        ctx: &mut ExecutionContext,
        values: &[f32],
        inplace: bool,
        label: &str,
    ) -> Result<()> {
        let desc = self
            .outputs
            .get_mut(index)
            .ok_or_else(|| unbound("output", index))?;
        desc.create_output(arena, ctx)?;
        desc.sync_before_write(arena, ctx, inplace)?;
        desc.write_values(arena, ctx, values, label)
    }
}

fn bind(
    slots: &mut Vec<LayoutDescriptor>,
    side: &str,
    index: usize,
    tensor: TensorId,
    layout: Layout,
) -> Result<()> {
    match index.cmp(&slots.len()) {
        std::cmp::Ordering::Less => slots[index].rebind(tensor, layout),
        std::cmp::Ordering::Equal => slots.push(LayoutDescriptor::new(tensor, layout)),
        std::cmp::Ordering::Greater => {
            return Err(RuntimeError::ExecutionError(format!(
                "{} {} bound before {}",
                side,
                index,
                slots.len()
            )));
        }
    }
    Ok(())
}

fn unbound(side: &str, index: usize) -> RuntimeError {
    RuntimeError::ExecutionError(format!("{} {} has no layout bound", side, index))
}

/// The layout a tensor's producer chose: its native layout if it has one,
/// canonical otherwise.
pub fn current_layout(arena: &TensorArena, tensor: TensorId) -> Result<Layout> {
    let storage = arena.get(tensor)?;
    Ok(storage
        .native_layout()
        .cloned()
        .unwrap_or_else(|| storage.canonical_layout()))
}

/// Full-precision layout in `format` for reading `tensor`, reusing the
/// producer's layout when it already has that format so that no
/// conversion is needed.
pub fn preferred_layout(
    arena: &TensorArena,
    tensor: TensorId,
    format: MemoryFormat,
) -> Result<Layout> {
    let storage = arena.get(tensor)?;
    if let Some(layout) = storage.native_layout()
        && layout.format() == format
    {
        return Ok(layout.clone());
    }
    if format == MemoryFormat::Plain {
        return Ok(storage.canonical_layout());
    }
    Layout::new(storage.shape(), format, DataType::F32, 1.0)
}

/// Layout for an output of shape `dims` in `tier`'s format, or canonical
/// when no tier is in use.
pub fn output_layout(
    dims: &[usize],
    tier: Option<CapabilityTier>,
    dtype: DataType,
    scale: f32,
) -> Result<Layout> {
    match tier {
        Some(tier) => Layout::new(dims, tier.format(), dtype, scale),
        None => Ok(Layout::canonical(dims)),
    }
}
