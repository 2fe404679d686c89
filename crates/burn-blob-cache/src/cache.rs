use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use burn_tensor::TensorData;
use hashbrown::HashMap;
use spin::{Mutex, Once};

use crate::blob::{BlobHeader, BlobObject, DeviceBody, ObjectId};
use crate::error::{BlobCacheError, Result};
use crate::sharding::ParallelAttr;

/// Memoizes the values derived from one [`BlobObject`].
///
/// Each slot is filled at most once, by the first successful fetch, and is never
/// recomputed afterwards. A failed fetch leaves its slot empty so a later call may try
/// again. The only way to force recomputation is to drop the cache (see
/// [`BlobCacheRegistry::try_disable`](crate::BlobCacheRegistry::try_disable)).
///
/// The cache only keeps a weak reference to its blob object. Fetching a missing slot
/// after the object has been dropped fails with [`BlobCacheError::ObjectReleased`];
/// slots that were already populated stay readable.
///
/// Callers must evict the cache before reading it again if the value behind the blob
/// object has been mutated; stale reads are not detected.
pub struct BlobCache {
    object_id: ObjectId,
    blob_object: Weak<BlobObject>,
    header: Once<Arc<BlobHeader>>,
    body: Once<Arc<DeviceBody>>,
    delegate_blob_objects: Mutex<HashMap<ParallelAttr, Arc<BlobObject>>>,
    numpy: Once<Arc<TensorData>>,
    numpy_mirrored_list: Once<Arc<Vec<TensorData>>>,
}

impl BlobCache {
    /// Creates an empty cache for `blob_object`.
    pub fn new(blob_object: &Arc<BlobObject>) -> Self {
        Self {
            object_id: blob_object.id(),
            blob_object: Arc::downgrade(blob_object),
            header: Once::new(),
            body: Once::new(),
            delegate_blob_objects: Mutex::new(HashMap::new()),
            numpy: Once::new(),
            numpy_mirrored_list: Once::new(),
        }
    }

    /// Identity of the cached blob object.
    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    /// The cached blob object, if it is still alive.
    pub fn blob_object(&self) -> Result<Arc<BlobObject>> {
        self.blob_object
            .upgrade()
            .ok_or(BlobCacheError::ObjectReleased(self.object_id))
    }

    /// Returns the cached header, fetching it on first use.
    pub fn header<F>(&self, fetch: F) -> Result<Arc<BlobHeader>>
    where
        F: FnOnce(&Arc<BlobObject>) -> Result<BlobHeader>,
    {
        self.get_or_fetch(&self.header, fetch)
    }

    /// Returns the cached device-resident value, fetching it on first use.
    pub fn body<F>(&self, fetch: F) -> Result<Arc<DeviceBody>>
    where
        F: FnOnce(&Arc<BlobObject>) -> Result<DeviceBody>,
    {
        self.get_or_fetch(&self.body, fetch)
    }

    /// Returns the copy of the blob redistributed to `parallel_attr`.
    ///
    /// `fetch` runs only for the first request of a given placement; later requests with an
    /// equal placement return the same handle. The cache owns every delegate it stores and
    /// releases them when dropped.
    ///
    /// The delegate map stays locked while `fetch` runs, and the lock is not reentrant:
    /// `fetch` (and the transport it drives) must not request a delegate from this same
    /// cache, or the call never returns. Delegates of other blob objects may be requested.
    pub fn delegate_blob_object<F>(
        &self,
        parallel_attr: &ParallelAttr,
        fetch: F,
    ) -> Result<Arc<BlobObject>>
    where
        F: FnOnce(&Arc<BlobObject>, &ParallelAttr) -> Result<Arc<BlobObject>>,
    {
        let mut delegates = self.delegate_blob_objects.lock();
        if let Some(delegate) = delegates.get(parallel_attr) {
            return Ok(delegate.clone());
        }

        let blob_object = self.blob_object()?;
        let delegate = fetch(&blob_object, parallel_attr)?;
        log::debug!(
            "Caching delegate {} of blob object {} for {}",
            delegate.id(),
            self.object_id,
            parallel_attr
        );
        delegates.insert(parallel_attr.clone(), delegate.clone());

        Ok(delegate)
    }

    /// Number of cached delegates.
    pub fn num_delegates(&self) -> usize {
        self.delegate_blob_objects.lock().len()
    }

    /// Returns the cached host snapshot, fetching it on first use.
    pub fn numpy<F>(&self, fetch: F) -> Result<Arc<TensorData>>
    where
        F: FnOnce(&Arc<BlobObject>) -> Result<TensorData>,
    {
        self.get_or_fetch(&self.numpy, fetch)
    }

    /// Returns the cached per-replica host snapshots, fetching them on first use.
    pub fn numpy_mirrored_list<F>(&self, fetch: F) -> Result<Arc<Vec<TensorData>>>
    where
        F: FnOnce(&Arc<BlobObject>) -> Result<Vec<TensorData>>,
    {
        self.get_or_fetch(&self.numpy_mirrored_list, fetch)
    }

    fn get_or_fetch<T, F>(&self, slot: &Once<Arc<T>>, fetch: F) -> Result<Arc<T>>
    where
        F: FnOnce(&Arc<BlobObject>) -> Result<T>,
    {
        slot.try_call_once(|| {
            let blob_object = self.blob_object()?;
            fetch(&blob_object).map(Arc::new)
        })
        .cloned()
    }
}

impl core::fmt::Debug for BlobCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlobCache")
            .field("object_id", &self.object_id)
            .field("header", &self.header.is_completed())
            .field("body", &self.body.is_completed())
            .field("delegates", &self.num_delegates())
            .field("numpy", &self.numpy.is_completed())
            .field("numpy_mirrored_list", &self.numpy_mirrored_list.is_completed())
            .finish()
    }
}

impl Drop for BlobCache {
    fn drop(&mut self) {
        let delegates = core::mem::take(self.delegate_blob_objects.get_mut());
        for (parallel_attr, delegate) in delegates {
            log::trace!(
                "Dropping delegate {} of blob object {} for {}",
                delegate.id(),
                self.object_id,
                parallel_attr
            );
            drop(delegate);
        }
    }
}
