//! Physical tensor layouts.
//!
//! A [`Layout`] pairs a logical shape (always NCHW order for rank-4 tensors)
//! with the physical order, element type, and quantization scale of one
//! buffer. The canonical layout is plain row-major `f32` with scale 1; every
//! other layout is a native layout some operator prefers.
//!
//! Quantized element types store `round(value * scale)`, so a larger scale
//! means finer resolution and a smaller representable range.

use crate::error::{Result, RuntimeError};
use std::fmt;

/// Channel block width of [`MemoryFormat::Blocked8`].
pub const CHANNEL_BLOCK: usize = 8;

/// Element type of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    F16,
    S8,
    U8,
}

impl DataType {
    /// Size in bytes of one element.
    pub fn size(&self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F16 => 2,
            DataType::S8 | DataType::U8 => 1,
        }
    }

    /// True for integer types that carry a scale.
    pub fn is_quantized(&self) -> bool {
        matches!(self, DataType::S8 | DataType::U8)
    }
}

/// Physical element order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryFormat {
    /// Row-major in logical order (NCHW for rank 4).
    Plain,
    /// NHWC: channels innermost.
    ChannelsLast,
    /// nChw8c: channels split into blocks of 8, the block innermost.
    /// The channel count is padded up to a multiple of 8.
    Blocked8,
}

/// Shape, physical order, element type, and scale of a buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    dims: Vec<usize>,
    format: MemoryFormat,
    dtype: DataType,
    scale: f32,
}

/// Hashable structural identity of a layout. Two layouts with equal keys
/// describe byte-identical buffers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LayoutKey {
    dims: Vec<usize>,
    format: MemoryFormat,
    dtype: DataType,
    scale_bits: u32,
}

impl Layout {
    /// Plain `f32` layout with unit scale.
    pub fn canonical(dims: &[usize]) -> Self {
        Self {
            dims: dims.to_vec(),
            format: MemoryFormat::Plain,
            dtype: DataType::F32,
            scale: 1.0,
        }
    }

    /// A native layout.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::DimensionError` if a non-plain format is asked
    /// for a tensor that is not rank 4, or if the scale is not a positive
    /// finite number.
    pub fn new(dims: &[usize], format: MemoryFormat, dtype: DataType, scale: f32) -> Result<Self> {
        if format != MemoryFormat::Plain && dims.len() != 4 {
            return Err(RuntimeError::DimensionError(format!(
                "{:?} needs a rank-4 shape, got {:?}",
                format, dims
            )));
        }
        if !(scale.is_finite() && scale > 0.0) {
            return Err(RuntimeError::DimensionError(format!(
                "layout scale must be positive, got {}",
                scale
            )));
        }
        Ok(Self {
            dims: dims.to_vec(),
            format,
            dtype,
            scale,
        })
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn format(&self) -> MemoryFormat {
        self.format
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Same layout with a different shape.
    pub fn with_dims(&self, dims: &[usize]) -> Self {
        Self {
            dims: dims.to_vec(),
            ..self.clone()
        }
    }

    /// Same layout with a different scale.
    pub fn with_scale(&self, scale: f32) -> Self {
        Self {
            scale,
            ..self.clone()
        }
    }

    pub fn is_canonical(&self) -> bool {
        self.format == MemoryFormat::Plain && self.dtype == DataType::F32 && self.scale == 1.0
    }

    /// Number of logical elements.
    pub fn count(&self) -> usize {
        self.dims.iter().product()
    }

    /// Number of stored elements, including channel padding.
    pub fn physical_len(&self) -> usize {
        match self.format {
            MemoryFormat::Blocked8 => {
                let [n, c, h, w] = self.nchw();
                n * c.div_ceil(CHANNEL_BLOCK) * CHANNEL_BLOCK * h * w
            }
            _ => self.count(),
        }
    }

    /// Physical position of the element at logical (row-major) index
    /// `linear`.
    pub fn offset_of(&self, linear: usize) -> usize {
        match self.format {
            MemoryFormat::Plain => linear,
            MemoryFormat::ChannelsLast => {
                let [_, c, h, w] = self.nchw();
                let (n, ch, y, x) = split_nchw(linear, c, h, w);
                ((n * h + y) * w + x) * c + ch
            }
            MemoryFormat::Blocked8 => {
                let [_, c, h, w] = self.nchw();
                let (n, ch, y, x) = split_nchw(linear, c, h, w);
                let blocks = c.div_ceil(CHANNEL_BLOCK);
                (((n * blocks + ch / CHANNEL_BLOCK) * h + y) * w + x) * CHANNEL_BLOCK
                    + ch % CHANNEL_BLOCK
            }
        }
    }

    /// Physical offset of channel `channel` in a batch-1 tensor stored in a
    /// layout whose channel planes are contiguous (plain or blocked).
    pub fn channel_offset(&self, channel: usize) -> usize {
        let [_, _, h, w] = self.nchw();
        channel * h * w
    }

    pub fn key(&self) -> LayoutKey {
        LayoutKey {
            dims: self.dims.clone(),
            format: self.format,
            dtype: self.dtype,
            scale_bits: self.scale.to_bits(),
        }
    }

    /// Same physical order and element type, ignoring shape and scale.
    pub fn same_encoding(&self, other: &Layout) -> bool {
        self.format == other.format && self.dtype == other.dtype
    }

    /// Dimensions padded to rank 4 (`[n, c, h, w]`).
    fn nchw(&self) -> [usize; 4] {
        let mut dims = [1usize; 4];
        for (slot, d) in dims.iter_mut().zip(&self.dims) {
            *slot = *d;
        }
        dims
    }
}

fn split_nchw(linear: usize, c: usize, h: usize, w: usize) -> (usize, usize, usize, usize) {
    let x = linear % w;
    let y = (linear / w) % h;
    let ch = (linear / (w * h)) % c;
    let n = linear / (w * h * c);
    (n, ch, y, x)
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{:?} {:?} x{}",
            self.format, self.dtype, self.dims, self.scale
        )
    }
}
