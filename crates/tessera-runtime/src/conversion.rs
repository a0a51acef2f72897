//! Cached transforms between physical layouts.

use crate::buffer::TensorBuffer;
use crate::error::{Result, RuntimeError};
use crate::layout::{Layout, LayoutKey};
use crate::stream::ExecutionContext;

/// Structural identity of a conversion: source and destination layout keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversionKey {
    pub src: LayoutKey,
    pub dst: LayoutKey,
}

/// An immutable transform from one layout to another.
///
/// Building precomputes the physical offset of every logical element on
/// both sides. Executing moves each element and multiplies it by
/// `dst.scale / src.scale`. Identical layouts reduce to a byte copy.
#[derive(Debug, Clone)]
pub struct ConversionPrimitive {
    src: Layout,
    dst: Layout,
    factor: f32,
    /// `(src offset, dst offset)` per logical element; empty for a byte copy.
    offsets: Vec<(usize, usize)>,
}

impl ConversionPrimitive {
    /// Compile a conversion from `src` to `dst`.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::DimensionError` if the layouts disagree on the
    /// number of logical elements.
    pub fn new(src: &Layout, dst: &Layout) -> Result<Self> {
        if src.dims() != dst.dims() {
            return Err(RuntimeError::DimensionError(format!(
                "cannot convert {:?} to {:?}",
                src.dims(),
                dst.dims()
            )));
        }
        let offsets = if src.key() == dst.key() {
            Vec::new()
        } else {
            (0..src.count())
                .map(|i| (src.offset_of(i), dst.offset_of(i)))
                .collect()
        };
        Ok(Self {
            src: src.clone(),
            dst: dst.clone(),
            factor: dst.scale() / src.scale(),
            offsets,
        })
    }

    pub fn src(&self) -> &Layout {
        &self.src
    }

    pub fn dst(&self) -> &Layout {
        &self.dst
    }

    /// Multiplier applied to every element.
    pub fn factor(&self) -> f32 {
        self.factor
    }

    pub fn key(&self) -> ConversionKey {
        ConversionKey {
            src: self.src.key(),
            dst: self.dst.key(),
        }
    }

    /// True if this primitive was built for exactly these layouts.
    pub fn matches(&self, src: &Layout, dst: &Layout) -> bool {
        self.src.key() == src.key() && self.dst.key() == dst.key()
    }

    /// Convert the tensor stored at `src[src_base..]` into `dst[dst_base..]`.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::TensorError` if either buffer has the wrong
    /// element type or is too short for its layout at the given base.
    pub fn execute(
        &self,
        src: &TensorBuffer,
        src_base: usize,
        dst: &mut TensorBuffer,
        dst_base: usize,
    ) -> Result<()> {
        check_buffer("source", src, &self.src, src_base)?;
        check_buffer("destination", dst, &self.dst, dst_base)?;

        if self.offsets.is_empty() {
            let size = self.src.dtype().size();
            let len = self.src.physical_len() * size;
            let from = &src.as_bytes()[src_base * size..src_base * size + len];
            dst.as_bytes_mut()[dst_base * size..dst_base * size + len].copy_from_slice(from);
            return Ok(());
        }

        if self.factor == 1.0
            && let (Some(s), Some(d)) = (src.as_f32(), dst.as_f32_mut())
        {
            for &(so, dof) in &self.offsets {
                d[dst_base + dof] = s[src_base + so];
            }
            return Ok(());
        }
        for &(so, dof) in &self.offsets {
            dst.set(dst_base + dof, src.get(src_base + so) * self.factor);
        }
        Ok(())
    }
}

fn check_buffer(side: &str, buffer: &TensorBuffer, layout: &Layout, base: usize) -> Result<()> {
    if buffer.dtype() != layout.dtype() {
        return Err(RuntimeError::TensorError(format!(
            "{} buffer holds {:?}, layout expects {:?}",
            side,
            buffer.dtype(),
            layout.dtype()
        )));
    }
    if buffer.len() < base + layout.physical_len() {
        return Err(RuntimeError::TensorError(format!(
            "{} buffer of {} elements cannot hold {} at offset {}",
            side,
            buffer.len(),
            layout,
            base
        )));
    }
    Ok(())
}

/// Counters for primitive reuse, kept per execution context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConversionStats {
    /// Primitives built (first use or rebuilt after a key mismatch).
    pub builds: u64,
    /// Lookups that reused a cached primitive.
    pub hits: u64,
    /// Conversions executed.
    pub executions: u64,
}

impl ConversionStats {
    /// Fraction of lookups served from cache; 1.0 when nothing was looked up.
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.builds;
        if lookups == 0 {
            1.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

/// A lazily built, self-validating cache entry for one conversion direction.
#[derive(Debug, Clone, Default)]
pub struct ConversionSlot {
    primitive: Option<ConversionPrimitive>,
}

impl ConversionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached primitive for `src -> dst`, rebuilt if the cached one was
    /// built for different layouts.
    pub fn get_or_build(
        &mut self,
        src: &Layout,
        dst: &Layout,
        ctx: &mut ExecutionContext,
    ) -> Result<&ConversionPrimitive> {
        let stale = !self.primitive.as_ref().is_some_and(|p| p.matches(src, dst));
        if stale {
            tracing::trace!(src = %src, dst = %dst, rebuilt = self.primitive.is_some(), "building conversion");
            self.primitive = Some(ConversionPrimitive::new(src, dst)?);
            ctx.stats_mut().builds += 1;
        } else {
            ctx.stats_mut().hits += 1;
        }
        self.primitive
            .as_ref()
            .ok_or_else(|| RuntimeError::ExecutionError("conversion slot is empty".to_string()))
    }

    /// Look up (or build) the primitive and run it, submitting the work to
    /// the current stream.
    #[allow(clippy::too_many_arguments)]
    pub fn convert(
        &mut self,
        src_layout: &Layout,
        src: &TensorBuffer,
        src_base: usize,
        dst_layout: &Layout,
        dst: &mut TensorBuffer,
        dst_base: usize,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        let primitive = self.get_or_build(src_layout, dst_layout, ctx)?;
        primitive.execute(src, src_base, dst, dst_base)?;
        ctx.stats_mut().executions += 1;
        ctx.submit("conversion");
        Ok(())
    }

    /// Drop the cached primitive.
    pub fn reset(&mut self) {
        self.primitive = None;
    }

    pub fn primitive(&self) -> Option<&ConversionPrimitive> {
        self.primitive.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{DataType, MemoryFormat};

    fn blocked(dims: &[usize], dtype: DataType, scale: f32) -> Layout {
        Layout::new(dims, MemoryFormat::Blocked8, dtype, scale).unwrap()
    }

    #[test]
    fn test_reorder_and_back() {
        let canonical = Layout::canonical(&[1, 3, 2, 2]);
        let native = Layout::new(&[1, 3, 2, 2], MemoryFormat::ChannelsLast, DataType::F32, 1.0)
            .unwrap();
        let values: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let src = TensorBuffer::F32(values.clone());

        let mut mid = TensorBuffer::zeros(DataType::F32, native.physical_len());
        ConversionPrimitive::new(&canonical, &native)
            .unwrap()
            .execute(&src, 0, &mut mid, 0)
            .unwrap();
        // first pixel holds channels 0, 1, 2 = logical 0, 4, 8
        assert_eq!(&mid.as_f32().unwrap()[..3], &[0.0, 4.0, 8.0]);

        let mut back = TensorBuffer::zeros(DataType::F32, 12);
        ConversionPrimitive::new(&native, &canonical)
            .unwrap()
            .execute(&mid, 0, &mut back, 0)
            .unwrap();
        assert_eq!(back.as_f32().unwrap(), values.as_slice());
    }

    #[test]
    fn test_rescale_between_quantized_layouts() {
        let a = blocked(&[1, 2, 1, 1], DataType::S8, 1.0);
        let b = blocked(&[1, 2, 1, 1], DataType::S8, 0.5);
        let primitive = ConversionPrimitive::new(&a, &b).unwrap();
        assert_eq!(primitive.factor(), 0.5);

        let mut src = TensorBuffer::zeros(DataType::S8, a.physical_len());
        src.set(0, 10.0);
        src.set(1, -7.0);
        let mut dst = TensorBuffer::zeros(DataType::S8, b.physical_len());
        primitive.execute(&src, 0, &mut dst, 0).unwrap();
        assert_eq!(dst.get(0), 5.0);
        assert_eq!(dst.get(1), -4.0);
    }

    #[test]
    fn test_identical_layouts_copy_at_offsets() {
        let layout = Layout::canonical(&[2]);
        let primitive = ConversionPrimitive::new(&layout, &layout).unwrap();
        let src = TensorBuffer::F32(vec![9.0, 1.0, 2.0]);
        let mut dst = TensorBuffer::F32(vec![0.0; 4]);
        primitive.execute(&src, 1, &mut dst, 2).unwrap();
        assert_eq!(dst.as_f32().unwrap(), &[0.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_rejects_wrong_buffers() {
        let a = Layout::canonical(&[4]);
        let b = Layout::canonical(&[5]);
        assert!(ConversionPrimitive::new(&a, &b).is_err());

        let primitive = ConversionPrimitive::new(&a, &a).unwrap();
        let short = TensorBuffer::F32(vec![0.0; 3]);
        let mut dst = TensorBuffer::F32(vec![0.0; 4]);
        assert!(primitive.execute(&short, 0, &mut dst, 0).is_err());
        let wrong = TensorBuffer::S8(vec![0; 4]);
        assert!(primitive.execute(&wrong, 0, &mut dst, 0).is_err());
    }

    #[test]
    fn test_slot_rebuilds_on_key_change() {
        let mut ctx = ExecutionContext::new();
        let mut slot = ConversionSlot::new();
        let canonical = Layout::canonical(&[1, 8, 1, 1]);
        let native = blocked(&[1, 8, 1, 1], DataType::F32, 1.0);

        slot.get_or_build(&canonical, &native, &mut ctx).unwrap();
        slot.get_or_build(&canonical, &native, &mut ctx).unwrap();
        assert_eq!(ctx.stats().builds, 1);
        assert_eq!(ctx.stats().hits, 1);

        // The destination was renegotiated with a new scale.
        slot.get_or_build(&canonical, &native.with_scale(2.0), &mut ctx)
            .unwrap();
        assert_eq!(ctx.stats().builds, 2);
        assert_eq!(slot.primitive().unwrap().factor(), 2.0);
    }

    #[test]
    fn test_hit_ratio() {
        let stats = ConversionStats {
            builds: 1,
            hits: 3,
            executions: 4,
        };
        assert_eq!(stats.hit_ratio(), 0.75);
        assert_eq!(ConversionStats::default().hit_ratio(), 1.0);
    }
}
