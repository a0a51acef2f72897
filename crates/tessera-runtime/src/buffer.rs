//! Typed host buffers backing tensor storage.

use crate::layout::DataType;
use half::f16;

/// A host buffer of one element type.
///
/// Element access goes through `f32`: integer types round to nearest and
/// saturate on store.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorBuffer {
    F32(Vec<f32>),
    F16(Vec<f16>),
    S8(Vec<i8>),
    U8(Vec<u8>),
}

impl TensorBuffer {
    /// Zero-filled buffer of `len` elements.
    pub fn zeros(dtype: DataType, len: usize) -> Self {
        match dtype {
            DataType::F32 => TensorBuffer::F32(vec![0.0; len]),
            DataType::F16 => TensorBuffer::F16(vec![f16::ZERO; len]),
            DataType::S8 => TensorBuffer::S8(vec![0; len]),
            DataType::U8 => TensorBuffer::U8(vec![0; len]),
        }
    }

    pub fn dtype(&self) -> DataType {
        match self {
            TensorBuffer::F32(_) => DataType::F32,
            TensorBuffer::F16(_) => DataType::F16,
            TensorBuffer::S8(_) => DataType::S8,
            TensorBuffer::U8(_) => DataType::U8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorBuffer::F32(v) => v.len(),
            TensorBuffer::F16(v) => v.len(),
            TensorBuffer::S8(v) => v.len(),
            TensorBuffer::U8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored value at `index`, widened to `f32`.
    #[inline]
    pub fn get(&self, index: usize) -> f32 {
        match self {
            TensorBuffer::F32(v) => v[index],
            TensorBuffer::F16(v) => v[index].to_f32(),
            TensorBuffer::S8(v) => f32::from(v[index]),
            TensorBuffer::U8(v) => f32::from(v[index]),
        }
    }

    /// Store `value` at `index`, rounding and saturating for integer types.
    #[inline]
    pub fn set(&mut self, index: usize, value: f32) {
        match self {
            TensorBuffer::F32(v) => v[index] = value,
            TensorBuffer::F16(v) => v[index] = f16::from_f32(value),
            // `as` saturates float-to-int casts
            TensorBuffer::S8(v) => v[index] = value.round() as i8,
            TensorBuffer::U8(v) => v[index] = value.round() as u8,
        }
    }

    /// Raw bytes of the buffer.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            TensorBuffer::F32(v) => bytemuck::cast_slice(v),
            TensorBuffer::F16(v) => bytemuck::cast_slice(v),
            TensorBuffer::S8(v) => bytemuck::cast_slice(v),
            TensorBuffer::U8(v) => v.as_slice(),
        }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        match self {
            TensorBuffer::F32(v) => bytemuck::cast_slice_mut(v),
            TensorBuffer::F16(v) => bytemuck::cast_slice_mut(v),
            TensorBuffer::S8(v) => bytemuck::cast_slice_mut(v),
            TensorBuffer::U8(v) => v.as_mut_slice(),
        }
    }

    /// `f32` contents, if this is an `f32` buffer.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            TensorBuffer::F32(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        match self {
            TensorBuffer::F32(v) => Some(v.as_mut_slice()),
            _ => None,
        }
    }

    /// Fill every element with zero.
    pub fn clear(&mut self) {
        self.as_bytes_mut().fill(0);
    }
}
