//! Tensor storage with a canonical and an optional native side.
//!
//! Every tensor keeps a canonical `f32` buffer. An operator that prefers a
//! different layout binds a native side; the two are kept coherent by the
//! state machine below:
//!
//! ```text
//! Uninitialized --write canonical--> AtCanonical --read native---> SyncedNative
//! Uninitialized --write native-----> AtNative    --read canonical-> SyncedCanonical
//! any state     --write canonical--> AtCanonical
//! any state     --write native-----> AtNative
//! ```
//!
//! Storages live in a [`TensorArena`] and are addressed by [`TensorId`];
//! descriptors hold ids, never references. A storage's native side may be
//! an alias into another storage's native buffer, which is how a
//! concatenation writes its inputs in place.

use crate::buffer::TensorBuffer;
use crate::conversion::ConversionSlot;
use crate::error::{Result, RuntimeError};
use crate::layout::Layout;
use crate::stream::{ExecutionContext, StreamId};

/// Index of a storage in its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TensorId(pub usize);

/// Which side(s) of a storage hold current data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Uninitialized,
    /// Only the canonical buffer is current.
    AtCanonical,
    /// Only the native buffer is current.
    AtNative,
    /// Native was written, canonical has since been refreshed from it.
    SyncedCanonical,
    /// Canonical was written, native has since been refreshed from it.
    SyncedNative,
}

impl SyncState {
    pub fn canonical_valid(&self) -> bool {
        matches!(
            self,
            SyncState::AtCanonical | SyncState::SyncedCanonical | SyncState::SyncedNative
        )
    }

    pub fn native_valid(&self) -> bool {
        matches!(
            self,
            SyncState::AtNative | SyncState::SyncedCanonical | SyncState::SyncedNative
        )
    }
}

/// Where a native side's elements live.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeData {
    Owned(TensorBuffer),
    /// Elements start at `offset` inside `target`'s native buffer.
    Alias { target: TensorId, offset: usize },
}

/// The native half of a storage.
#[derive(Debug)]
pub struct NativeSide {
    layout: Layout,
    data: NativeData,
    /// native -> canonical
    to_canonical: ConversionSlot,
    /// canonical -> native
    from_canonical: ConversionSlot,
}

impl NativeSide {
    fn owned(layout: Layout) -> Self {
        let buffer = TensorBuffer::zeros(layout.dtype(), layout.physical_len());
        Self {
            layout,
            data: NativeData::Owned(buffer),
            to_canonical: ConversionSlot::new(),
            from_canonical: ConversionSlot::new(),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn data(&self) -> &NativeData {
        &self.data
    }
}

/// Canonical buffer, optional native side, and their synchronization state.
#[derive(Debug)]
pub struct TensorStorage {
    name: String,
    shape: Vec<usize>,
    canonical: Vec<f32>,
    native: Option<NativeSide>,
    state: SyncState,
    /// Bumped on every write through either side.
    version: u64,
    /// Stream the last native write was submitted to.
    pending: Option<StreamId>,
}

impl TensorStorage {
    fn new(name: &str, shape: &[usize]) -> Self {
        Self {
            name: name.to_string(),
            shape: shape.to_vec(),
            canonical: vec![0.0; shape.iter().product()],
            native: None,
            state: SyncState::Uninitialized,
            version: 0,
            pending: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn count(&self) -> usize {
        self.canonical.len()
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn native(&self) -> Option<&NativeSide> {
        self.native.as_ref()
    }

    pub fn native_layout(&self) -> Option<&Layout> {
        self.native.as_ref().map(|n| &n.layout)
    }

    pub fn canonical_layout(&self) -> Layout {
        Layout::canonical(&self.shape)
    }

    pub fn alias_target(&self) -> Option<(TensorId, usize)> {
        match self.native.as_ref().map(|n| &n.data) {
            Some(NativeData::Alias { target, offset }) => Some((*target, *offset)),
            _ => None,
        }
    }

    fn mark_written(&mut self, state: SyncState) {
        self.state = state;
        self.version += 1;
    }
}

/// Owner of every tensor storage of a net.
#[derive(Debug, Default)]
pub struct TensorArena {
    storages: Vec<TensorStorage>,
}

impl TensorArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a storage and return its id.
    pub fn create(&mut self, name: &str, shape: &[usize]) -> TensorId {
        self.storages.push(TensorStorage::new(name, shape));
        TensorId(self.storages.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.storages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storages.is_empty()
    }

    pub fn get(&self, id: TensorId) -> Result<&TensorStorage> {
        self.storages
            .get(id.0)
            .ok_or_else(|| RuntimeError::TensorNotFound(format!("tensor #{}", id.0)))
    }

    fn get_mut(&mut self, id: TensorId) -> Result<&mut TensorStorage> {
        self.storages
            .get_mut(id.0)
            .ok_or_else(|| RuntimeError::TensorNotFound(format!("tensor #{}", id.0)))
    }

    /// Two distinct storages, the first mutably.
    fn pair_mut(&mut self, a: TensorId, b: TensorId) -> Result<(&mut TensorStorage, &TensorStorage)> {
        if a == b || a.0 >= self.storages.len() || b.0 >= self.storages.len() {
            return Err(RuntimeError::TensorError(format!(
                "cannot pair tensors #{} and #{}",
                a.0, b.0
            )));
        }
        if a.0 < b.0 {
            let (left, right) = self.storages.split_at_mut(b.0);
            Ok((&mut left[a.0], &right[0]))
        } else {
            let (left, right) = self.storages.split_at_mut(a.0);
            Ok((&mut right[0], &left[b.0]))
        }
    }

    pub fn shape(&self, id: TensorId) -> Result<&[usize]> {
        Ok(self.get(id)?.shape())
    }

    /// Change a storage's shape.
    ///
    /// A new shape discards the contents and the native side; reshaping to
    /// the current shape keeps everything.
    pub fn reshape(&mut self, id: TensorId, shape: &[usize]) -> Result<()> {
        let storage = self.get_mut(id)?;
        if storage.shape == shape {
            return Ok(());
        }
        tracing::trace!(tensor = %storage.name, from = ?storage.shape, to = ?shape, "reshape storage");
        storage.shape = shape.to_vec();
        storage.canonical = vec![0.0; shape.iter().product()];
        storage.native = None;
        storage.state = SyncState::Uninitialized;
        storage.version += 1;
        Ok(())
    }

    /// Give a storage a native side in `layout`, keeping the existing one if
    /// it already matches. A storage aliased with a different layout regains
    /// its own buffer.
    ///
    /// Contents held only on a replaced native side are refreshed into the
    /// canonical buffer first.
    pub fn bind_native(&mut self, id: TensorId, layout: &Layout, ctx: &mut ExecutionContext) -> Result<()> {
        let storage = self.get(id)?;
        if layout.dims() != storage.shape() {
            return Err(RuntimeError::DimensionError(format!(
                "native layout {:?} does not match tensor '{}' shape {:?}",
                layout.dims(),
                storage.name,
                storage.shape
            )));
        }
        if storage.native_layout().is_some_and(|l| l.key() == layout.key()) {
            return Ok(());
        }
        if storage.native.is_some() && storage.state == SyncState::AtNative {
            self.sync_canonical(id, ctx)?;
        }

        let storage = self.get_mut(id)?;
        tracing::trace!(tensor = %storage.name, layout = %layout, "bind native layout");
        storage.native = Some(NativeSide::owned(layout.clone()));
        storage.state = match storage.state {
            SyncState::Uninitialized => SyncState::Uninitialized,
            _ => SyncState::AtCanonical,
        };
        Ok(())
    }

    /// Drop a storage's native side; canonical data is refreshed first.
    pub fn unbind_native(&mut self, id: TensorId, ctx: &mut ExecutionContext) -> Result<()> {
        if self.get(id)?.native.is_none() {
            return Ok(());
        }
        self.sync_canonical(id, ctx)?;
        let storage = self.get_mut(id)?;
        storage.native = None;
        if storage.state != SyncState::Uninitialized {
            storage.state = SyncState::AtCanonical;
        }
        Ok(())
    }

    /// Redirect `id`'s native side into `target`'s native buffer at
    /// `offset`. Both must already have native sides with the same encoding
    /// and scale. Current contents move to the canonical side.
    pub fn alias(
        &mut self,
        id: TensorId,
        target: TensorId,
        offset: usize,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        if self.is_alias_target(id) {
            return Err(RuntimeError::TensorError(format!(
                "'{}' is an alias target and cannot alias",
                self.get(id)?.name
            )));
        }
        self.sync_canonical(id, ctx)?;
        let (storage, target_storage) = self.pair_mut(id, target)?;
        let (Some(own), Some(theirs)) = (storage.native.as_mut(), target_storage.native.as_ref())
        else {
            return Err(RuntimeError::TensorError(format!(
                "cannot alias '{}' into '{}' without native layouts",
                storage.name, target_storage.name
            )));
        };
        if !own.layout.same_encoding(&theirs.layout)
            || own.layout.scale() != theirs.layout.scale()
            || offset + own.layout.physical_len() > theirs.layout.physical_len()
        {
            return Err(RuntimeError::TensorError(format!(
                "'{}' ({}) does not fit in '{}' ({}) at offset {}",
                storage.name, own.layout, target_storage.name, theirs.layout, offset
            )));
        }
        if matches!(theirs.data, NativeData::Alias { .. }) {
            return Err(RuntimeError::TensorError(format!(
                "'{}' is itself an alias",
                target_storage.name
            )));
        }
        tracing::trace!(tensor = %storage.name, target = %target_storage.name, offset, "alias native buffer");
        own.data = NativeData::Alias { target, offset };
        // The target region does not hold this tensor's values yet.
        if storage.state != SyncState::Uninitialized {
            storage.state = SyncState::AtCanonical;
        }
        Ok(())
    }

    /// True if some storage's native side points into `id`'s buffer.
    pub fn is_alias_target(&self, id: TensorId) -> bool {
        self.storages
            .iter()
            .any(|s| s.alias_target().is_some_and(|(target, _)| target == id))
    }

    /// Give an aliased storage its own native buffer again, copying the
    /// current contents out of the alias target.
    pub fn unalias(&mut self, id: TensorId) -> Result<()> {
        let Some((target, offset)) = self.get(id)?.alias_target() else {
            return Ok(());
        };
        let (storage, target_storage) = self.pair_mut(id, target)?;
        let Some(own) = storage.native.as_mut() else {
            return Ok(());
        };
        let mut buffer = TensorBuffer::zeros(own.layout.dtype(), own.layout.physical_len());
        if let Some(NativeSide {
            data: NativeData::Owned(source),
            ..
        }) = target_storage.native.as_ref()
        {
            let size = own.layout.dtype().size();
            let len = own.layout.physical_len() * size;
            let bytes = source.as_bytes();
            if offset * size + len <= bytes.len() {
                buffer
                    .as_bytes_mut()
                    .copy_from_slice(&bytes[offset * size..offset * size + len]);
            }
        }
        tracing::trace!(tensor = %storage.name, "alias dropped");
        own.data = NativeData::Owned(buffer);
        Ok(())
    }

    /// Native buffer and base offset for reading `id`'s native side.
    pub fn native_buffer(&self, id: TensorId) -> Result<(&Layout, &TensorBuffer, usize)> {
        let storage = self.get(id)?;
        let native = storage.native.as_ref().ok_or_else(|| {
            RuntimeError::TensorError(format!("tensor '{}' has no native layout", storage.name))
        })?;
        match &native.data {
            NativeData::Owned(buffer) => Ok((&native.layout, buffer, 0)),
            NativeData::Alias { target, offset } => match self.get(*target)?.native.as_ref() {
                Some(NativeSide {
                    data: NativeData::Owned(buffer),
                    ..
                }) => Ok((&native.layout, buffer, *offset)),
                _ => Err(RuntimeError::TensorError(format!(
                    "alias target of '{}' has no buffer",
                    storage.name
                ))),
            },
        }
    }

    /// Native buffer and base offset for writing `id`'s native side.
    fn native_buffer_mut(&mut self, id: TensorId) -> Result<(Layout, &mut TensorBuffer, usize)> {
        let (layout, target, offset) = {
            let storage = self.get(id)?;
            let native = storage.native.as_ref().ok_or_else(|| {
                RuntimeError::TensorError(format!("tensor '{}' has no native layout", storage.name))
            })?;
            match &native.data {
                NativeData::Owned(_) => (native.layout.clone(), id, 0),
                NativeData::Alias { target, offset } => (native.layout.clone(), *target, *offset),
            }
        };
        let storage = self.get_mut(target)?;
        match storage.native.as_mut().map(|n| &mut n.data) {
            Some(NativeData::Owned(buffer)) => Ok((layout, buffer, offset)),
            _ => Err(RuntimeError::TensorError(format!(
                "tensor '{}' has no writable native buffer",
                storage.name
            ))),
        }
    }

    /// Refresh the canonical buffer from the native side if it is stale.
    ///
    /// The conversion is submitted to the current stream, which is then
    /// waited on: canonical data is only handed out once complete.
    fn sync_canonical(&mut self, id: TensorId, ctx: &mut ExecutionContext) -> Result<()> {
        let storage = self.get(id)?;
        if storage.state != SyncState::AtNative {
            return Ok(());
        }
        if let Some(stream) = storage.pending {
            ctx.wait_for(stream);
        }

        // Take the slot and buffer out so the arena can lend the source.
        let mut slot = match self.get_mut(id)?.native.as_mut() {
            Some(native) => std::mem::take(&mut native.to_canonical),
            None => return Ok(()),
        };
        let mut canonical = TensorBuffer::F32(std::mem::take(&mut self.get_mut(id)?.canonical));
        let result = self.native_buffer(id).and_then(|(layout, source, base)| {
            let dst = Layout::canonical(layout.dims());
            slot.convert(layout, source, base, &dst, &mut canonical, 0, ctx)
        });
        ctx.wait_current();

        let storage = self.get_mut(id)?;
        if let TensorBuffer::F32(values) = canonical {
            storage.canonical = values;
        }
        if let Some(native) = storage.native.as_mut() {
            native.to_canonical = slot;
        }
        result?;
        storage.state = SyncState::SyncedCanonical;
        storage.pending = None;
        Ok(())
    }

    /// Refresh the native side from the canonical buffer if it is stale.
    pub fn sync_native(&mut self, id: TensorId, ctx: &mut ExecutionContext) -> Result<()> {
        let storage = self.get(id)?;
        if storage.native.is_none() || storage.state.native_valid() {
            return Ok(());
        }
        let canonical = TensorBuffer::F32(storage.canonical.clone());
        let canonical_layout = storage.canonical_layout();

        let mut slot = match self.get_mut(id)?.native.as_mut() {
            Some(native) => std::mem::take(&mut native.from_canonical),
            None => return Ok(()),
        };
        let result = self.native_buffer_mut(id).and_then(|(layout, buffer, base)| {
            slot.convert(&canonical_layout, &canonical, 0, &layout, buffer, base, ctx)
        });

        let storage = self.get_mut(id)?;
        if let Some(native) = storage.native.as_mut() {
            native.from_canonical = slot;
        }
        result?;
        if storage.state != SyncState::Uninitialized {
            storage.state = SyncState::SyncedNative;
        }
        Ok(())
    }

    /// Current canonical contents, converting from the native side first
    /// if needed.
    pub fn canonical(&mut self, id: TensorId, ctx: &mut ExecutionContext) -> Result<&[f32]> {
        self.sync_canonical(id, ctx)?;
        Ok(&self.get(id)?.canonical)
    }

    /// Canonical contents for writing. Invalidates the native side.
    pub fn canonical_mut(&mut self, id: TensorId, ctx: &mut ExecutionContext) -> Result<&mut [f32]> {
        self.sync_canonical(id, ctx)?;
        let storage = self.get_mut(id)?;
        storage.mark_written(SyncState::AtCanonical);
        Ok(&mut storage.canonical)
    }

    /// Overwrite the whole canonical buffer. Nothing is converted first.
    pub fn write_canonical(&mut self, id: TensorId, values: &[f32]) -> Result<()> {
        let storage = self.get_mut(id)?;
        if values.len() != storage.canonical.len() {
            return Err(RuntimeError::DimensionError(format!(
                "{} values for tensor '{}' of shape {:?}",
                values.len(),
                storage.name,
                storage.shape
            )));
        }
        storage.canonical.copy_from_slice(values);
        storage.mark_written(SyncState::AtCanonical);
        storage.pending = None;
        Ok(())
    }

    /// Canonical contents without synchronizing. Callers check the state.
    pub fn canonical_unsynced(&self, id: TensorId) -> Result<&[f32]> {
        Ok(&self.get(id)?.canonical)
    }

    /// Write `values` (logical order) through the native side and mark it
    /// as the only current side. `stream` is where the write was submitted.
    pub fn write_native(
        &mut self,
        id: TensorId,
        values: &[f32],
        stream: Option<StreamId>,
    ) -> Result<()> {
        let (layout, buffer, base) = self.native_buffer_mut(id)?;
        if values.len() != layout.count() {
            return Err(RuntimeError::DimensionError(format!(
                "{} values for a {} tensor",
                values.len(),
                layout
            )));
        }
        let factor = layout.scale();
        for (i, &v) in values.iter().enumerate() {
            buffer.set(base + layout.offset_of(i), v * factor);
        }
        self.mark_native_written(id, stream)
    }

    /// Record that the native side was written by other means (an alias
    /// target filled by its inputs' producers).
    pub fn mark_native_written(&mut self, id: TensorId, stream: Option<StreamId>) -> Result<()> {
        let storage = self.get_mut(id)?;
        storage.mark_written(SyncState::AtNative);
        storage.pending = stream;
        Ok(())
    }

    /// Logical values of the native side, unscaled.
    pub fn read_native(&self, id: TensorId) -> Result<Vec<f32>> {
        let (layout, buffer, base) = self.native_buffer(id)?;
        let inverse = 1.0 / layout.scale();
        Ok((0..layout.count())
            .map(|i| buffer.get(base + layout.offset_of(i)) * inverse)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{DataType, MemoryFormat};

    fn blocked(dims: &[usize]) -> Layout {
        Layout::new(dims, MemoryFormat::Blocked8, DataType::F32, 1.0).unwrap()
    }

    #[test]
    fn test_state_machine_canonical_first() {
        let mut ctx = ExecutionContext::new();
        let mut arena = TensorArena::new();
        let id = arena.create("t", &[1, 2, 2, 2]);
        assert_eq!(arena.get(id).unwrap().state(), SyncState::Uninitialized);

        arena.canonical_mut(id, &mut ctx).unwrap()[3] = 7.0;
        assert_eq!(arena.get(id).unwrap().state(), SyncState::AtCanonical);

        arena.bind_native(id, &blocked(&[1, 2, 2, 2]), &mut ctx).unwrap();
        arena.sync_native(id, &mut ctx).unwrap();
        assert_eq!(arena.get(id).unwrap().state(), SyncState::SyncedNative);
        assert_eq!(arena.read_native(id).unwrap()[3], 7.0);

        // A canonical write invalidates the native copy.
        arena.canonical_mut(id, &mut ctx).unwrap()[0] = 1.0;
        assert_eq!(arena.get(id).unwrap().state(), SyncState::AtCanonical);
    }

    #[test]
    fn test_state_machine_native_first() {
        let mut ctx = ExecutionContext::new();
        let mut arena = TensorArena::new();
        let id = arena.create("t", &[1, 3, 1, 2]);
        arena.bind_native(id, &blocked(&[1, 3, 1, 2]), &mut ctx).unwrap();

        let values: Vec<f32> = (0..6).map(|v| v as f32).collect();
        let stream = ctx.submit("producer");
        arena.write_native(id, &values, Some(stream)).unwrap();
        assert_eq!(arena.get(id).unwrap().state(), SyncState::AtNative);

        assert_eq!(arena.canonical(id, &mut ctx).unwrap(), values.as_slice());
        assert_eq!(arena.get(id).unwrap().state(), SyncState::SyncedCanonical);
        // Reading canonical waited on the producing stream.
        assert_eq!(ctx.current_id(), None);

        arena.write_native(id, &[0.0; 6], None).unwrap();
        assert_eq!(arena.get(id).unwrap().state(), SyncState::AtNative);
    }

    #[test]
    fn test_reshape_resets_storage() {
        let mut ctx = ExecutionContext::new();
        let mut arena = TensorArena::new();
        let id = arena.create("t", &[1, 2, 2, 2]);
        arena.bind_native(id, &blocked(&[1, 2, 2, 2]), &mut ctx).unwrap();
        arena.reshape(id, &[1, 2, 2, 2]).unwrap();
        assert!(arena.get(id).unwrap().native().is_some());

        arena.reshape(id, &[2, 2, 2, 2]).unwrap();
        let storage = arena.get(id).unwrap();
        assert!(storage.native().is_none());
        assert_eq!(storage.count(), 16);
        assert_eq!(storage.state(), SyncState::Uninitialized);
    }

    #[test]
    fn test_alias_writes_land_in_target() {
        let mut ctx = ExecutionContext::new();
        let mut arena = TensorArena::new();
        let a = arena.create("a", &[1, 8, 1, 1]);
        let b = arena.create("b", &[1, 2, 1, 1]);
        let out = arena.create("out", &[1, 10, 1, 1]);
        arena.bind_native(a, &blocked(&[1, 8, 1, 1]), &mut ctx).unwrap();
        arena.bind_native(b, &blocked(&[1, 2, 1, 1]), &mut ctx).unwrap();
        arena.bind_native(out, &blocked(&[1, 10, 1, 1]), &mut ctx).unwrap();
        arena.alias(a, out, 0, &mut ctx).unwrap();
        arena.alias(b, out, 8, &mut ctx).unwrap();

        arena.write_native(a, &[1.0; 8], None).unwrap();
        arena.write_native(b, &[2.0, 3.0], None).unwrap();
        arena.mark_native_written(out, None).unwrap();

        let mut expected = vec![1.0; 8];
        expected.extend([2.0, 3.0]);
        assert_eq!(arena.canonical(out, &mut ctx).unwrap(), expected.as_slice());
        assert_eq!(arena.canonical(b, &mut ctx).unwrap(), &[2.0, 3.0]);

        arena.unalias(b).unwrap();
        assert_eq!(arena.get(b).unwrap().alias_target(), None);
        assert_eq!(arena.read_native(b).unwrap(), vec![2.0, 3.0]);
    }

    #[test]
    fn test_alias_requires_same_encoding() {
        let mut ctx = ExecutionContext::new();
        let mut arena = TensorArena::new();
        let a = arena.create("a", &[1, 8, 1, 1]);
        let out = arena.create("out", &[1, 16, 1, 1]);
        arena.bind_native(a, &blocked(&[1, 8, 1, 1]), &mut ctx).unwrap();
        let plain = Layout::new(&[1, 16, 1, 1], MemoryFormat::Plain, DataType::S8, 1.0).unwrap();
        arena.bind_native(out, &plain, &mut ctx).unwrap();
        assert!(arena.alias(a, out, 0, &mut ctx).is_err());
    }
}
