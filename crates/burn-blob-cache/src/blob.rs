use alloc::sync::Arc;
use alloc::vec::Vec;
use burn_tensor::{DType, Shape, TensorData};
use core::fmt;
use spin::Mutex;

use crate::sharding::{DeviceId, ParallelAttr};

/// Process-unique identity of a [`BlobObject`].
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Wraps a raw id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw id.
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hook notified when the last owner of a [`BlobObject`] lets it go.
///
/// Runtimes use it to free the device memory backing the object, cache registries to evict
/// the object's cache.
pub trait ObjectReleaser: Send + Sync {
    /// Frees the runtime resources held for `id`.
    fn release(&self, id: ObjectId);
}

/// Opaque handle to a value living inside the distributed runtime.
///
/// Blob objects are shared through [`Arc`]. When the last owner drops its handle, every
/// release hook is invoked exactly once with the object's id, the latest attached first.
pub struct BlobObject {
    id: ObjectId,
    parallel_attr: ParallelAttr,
    dtype: DType,
    releasers: Mutex<Vec<Arc<dyn ObjectReleaser>>>,
}

impl BlobObject {
    /// Creates a handle with no release hook.
    pub fn new(id: ObjectId, parallel_attr: ParallelAttr, dtype: DType) -> Self {
        Self {
            id,
            parallel_attr,
            dtype,
            releasers: Mutex::new(Vec::new()),
        }
    }

    /// Attaches the hook called when the handle is dropped.
    pub fn with_releaser(mut self, releaser: Arc<dyn ObjectReleaser>) -> Self {
        self.releasers.get_mut().push(releaser);
        self
    }

    /// Attaches another hook to a shared handle.
    pub fn add_releaser(&self, releaser: Arc<dyn ObjectReleaser>) {
        self.releasers.lock().push(releaser);
    }

    /// Identity of the object.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Placement of the value.
    pub fn parallel_attr(&self) -> &ParallelAttr {
        &self.parallel_attr
    }

    /// Element type of the value.
    pub fn dtype(&self) -> DType {
        self.dtype
    }
}

impl fmt::Debug for BlobObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobObject")
            .field("id", &self.id)
            .field("parallel_attr", &self.parallel_attr)
            .field("dtype", &self.dtype)
            .finish_non_exhaustive()
    }
}

impl Drop for BlobObject {
    fn drop(&mut self) {
        let releasers = core::mem::take(self.releasers.get_mut());
        if !releasers.is_empty() {
            log::trace!("Releasing blob object {}", self.id);
        }
        for releaser in releasers.iter().rev() {
            releaser.release(self.id);
        }
    }
}

/// Metadata of a blob: logical shape and element type.
#[derive(Clone, Debug, PartialEq)]
pub struct BlobHeader {
    /// Logical (global) shape.
    pub shape: Shape,
    /// Element type.
    pub dtype: DType,
}

/// Device-resident realized value of a blob: the local piece held by each device.
#[derive(Clone, Debug)]
pub struct DeviceBody {
    /// One entry per device, in mesh order.
    pub shards: Vec<(DeviceId, TensorData)>,
}
