//! Per-operator views of a tensor in the operator's native layout.
//!
//! A [`LayoutDescriptor`] binds one operator input or output to a storage in
//! the arena and to the layout the operator wants to compute in. Reads go
//! through one of three sources:
//!
//! - the canonical buffer, when the operator's layout is canonical;
//! - the storage's own native side, when it already has the wanted layout
//!   (or the caller asked to materialize it there);
//! - a private buffer filled by a cached conversion, preferably straight
//!   from the producer's native layout.
//!
//! Writes always go to the storage: the native side is bound to the
//! operator's layout and conversion back to canonical is left to whoever
//! reads it.

use crate::buffer::TensorBuffer;
use crate::conversion::ConversionSlot;
use crate::error::{Result, RuntimeError};
use crate::layout::Layout;
use crate::storage::{TensorArena, TensorId};
use crate::stream::ExecutionContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadSource {
    Canonical,
    Storage,
    Private,
}

/// One tensor as seen by one operator slot.
#[derive(Debug)]
pub struct LayoutDescriptor {
    tensor: TensorId,
    native: Layout,
    /// canonical -> private
    from_canonical: ConversionSlot,
    /// producer's native layout -> private
    from_native: ConversionSlot,
    private: Option<TensorBuffer>,
    source: ReadSource,
    /// Storage version the private buffer was filled from.
    synced_version: Option<u64>,
}

impl LayoutDescriptor {
    pub fn new(tensor: TensorId, native: Layout) -> Self {
        Self {
            tensor,
            native,
            from_canonical: ConversionSlot::new(),
            from_native: ConversionSlot::new(),
            private: None,
            source: ReadSource::Canonical,
            synced_version: None,
        }
    }

    pub fn tensor(&self) -> TensorId {
        self.tensor
    }

    /// Layout the operator computes in.
    pub fn native(&self) -> &Layout {
        &self.native
    }

    /// False when the operator works on canonical data directly.
    pub fn conversion_needed(&self) -> bool {
        !self.native.is_canonical()
    }

    /// Point the descriptor at a (possibly) different tensor or layout.
    ///
    /// Cached primitives are kept: they are validated against the actual
    /// layouts on every use.
    pub fn rebind(&mut self, tensor: TensorId, native: Layout) {
        if self.tensor == tensor && self.native.key() == native.key() {
            return;
        }
        self.tensor = tensor;
        self.native = native;
        self.private = None;
        self.synced_version = None;
    }

    /// Prepare to read the tensor in the descriptor's layout.
    ///
    /// Does no work when the storage already holds that layout. With
    /// `materialize`, a storage without a native side gets one in this
    /// layout, so later readers share the conversion.
    pub fn create_input(
        &mut self,
        arena: &mut TensorArena,
        ctx: &mut ExecutionContext,
        materialize: bool,
    ) -> Result<()> {
        self.source = if !self.conversion_needed() {
            ReadSource::Canonical
        } else {
            let resident = arena
                .get(self.tensor)?
                .native_layout()
                .map(|layout| layout.key() == self.native.key());
            match resident {
                Some(true) => ReadSource::Storage,
                None if materialize => {
                    arena.bind_native(self.tensor, &self.native, ctx)?;
                    ReadSource::Storage
                }
                _ => ReadSource::Private,
            }
        };
        if self.source == ReadSource::Private
            && !self
                .private
                .as_ref()
                .is_some_and(|b| b.dtype() == self.native.dtype() && b.len() == self.native.physical_len())
        {
            self.private = Some(TensorBuffer::zeros(
                self.native.dtype(),
                self.native.physical_len(),
            ));
            self.synced_version = None;
        }
        Ok(())
    }

    /// Bring the read view up to date. A no-op when nothing was written
    /// since the last call.
    pub fn sync_before_read(
        &mut self,
        arena: &mut TensorArena,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        match self.source {
            ReadSource::Canonical => {
                arena.canonical(self.tensor, ctx)?;
            }
            ReadSource::Storage => arena.sync_native(self.tensor, ctx)?,
            ReadSource::Private => {
                let storage = arena.get(self.tensor)?;
                let version = storage.version();
                if self.synced_version == Some(version) {
                    return Ok(());
                }
                let native_current = storage.native().is_some() && storage.state().native_valid();
                let private = self.private.get_or_insert_with(|| {
                    TensorBuffer::zeros(self.native.dtype(), self.native.physical_len())
                });
                if native_current {
                    let (layout, source, base) = arena.native_buffer(self.tensor)?;
                    self.from_native
                        .convert(layout, source, base, &self.native, private, 0, ctx)?;
                } else {
                    let canonical = Layout::canonical(self.native.dims());
                    let values = TensorBuffer::F32(arena.canonical(self.tensor, ctx)?.to_vec());
                    self.from_canonical
                        .convert(&canonical, &values, 0, &self.native, private, 0, ctx)?;
                }
                self.synced_version = Some(version);
            }
        }
        Ok(())
    }

    /// Logical values of the read view, unscaled.
    pub fn read_values(&self, arena: &TensorArena) -> Result<Vec<f32>> {
        match self.source {
            ReadSource::Canonical => Ok(arena.canonical_unsynced(self.tensor)?.to_vec()),
            ReadSource::Storage => arena.read_native(self.tensor),
            ReadSource::Private => {
                let buffer = self.private.as_ref().ok_or_else(|| {
                    RuntimeError::ExecutionError("read before create_input".to_string())
                })?;
                let inverse = 1.0 / self.native.scale();
                Ok((0..self.native.count())
                    .map(|i| buffer.get(self.native.offset_of(i)) * inverse)
                    .collect())
            }
        }
    }

    /// Prepare the storage to be written in the descriptor's layout.
    /// Conversion back to canonical is deferred to the next canonical read.
    pub fn create_output(&mut self, arena: &mut TensorArena, ctx: &mut ExecutionContext) -> Result<()> {
        if self.conversion_needed() {
            arena.bind_native(self.tensor, &self.native, ctx)?;
        }
        Ok(())
    }

    /// Called right before the operator writes. An `inplace` operator reads
    /// the buffer it writes, so its current contents are synced into the
    /// written layout first.
    pub fn sync_before_write(
        &mut self,
        arena: &mut TensorArena,
        ctx: &mut ExecutionContext,
        inplace: bool,
    ) -> Result<()> {
        if !inplace {
            return Ok(());
        }
        if self.conversion_needed() {
            arena.sync_native(self.tensor, ctx)
        } else {
            arena.canonical(self.tensor, ctx).map(|_| ())
        }
    }

    /// Store logical `values` through the write view and submit the write
    /// to the current stream under `label`.
    pub fn write_values(
        &mut self,
        arena: &mut TensorArena,
        ctx: &mut ExecutionContext,
        values: &[f32],
        label: &str,
    ) -> Result<()> {
        let stream = ctx.submit(label);
        if self.conversion_needed() {
            arena.write_native(self.tensor, values, Some(stream))
        } else {
            arena.write_canonical(self.tensor, values)
        }
    }
}
