use alloc::string::String;
use alloc::sync::{Arc, Weak};
use hashbrown::HashMap;
use spin::Mutex;

use crate::blob::{BlobObject, ObjectId, ObjectReleaser};
use crate::cache::BlobCache;

type CacheMap = Mutex<HashMap<ObjectId, Arc<BlobCache>>>;

/// Maps each live blob object to its [`BlobCache`].
///
/// Caches are created on first lookup. An entry is removed when its blob object is disabled
/// or dropped. Removing an entry drops the registry's reference to the cache; the cache (and
/// the delegates it owns) is destroyed once callers holding an [`Arc`] to it let go.
#[derive(Debug, Default)]
pub struct BlobCacheRegistry {
    caches: Arc<CacheMap>,
}

/// Evicts the cache of a blob object once the object is dropped.
struct EvictOnRelease {
    caches: Weak<CacheMap>,
}

impl ObjectReleaser for EvictOnRelease {
    fn release(&self, id: ObjectId) {
        if let Some(caches) = self.caches.upgrade() {
            evict(&caches, id);
        }
    }
}

fn evict(caches: &CacheMap, id: ObjectId) {
    // Dropped outside of the lock, releasing delegates may run arbitrary hooks.
    let removed = caches.lock().remove(&id);
    if let Some(cache) = removed {
        log::trace!("Evicting blob cache for {id}");
        drop(cache);
    }
}

impl BlobCacheRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cache of `blob_object`, creating it if needed.
    ///
    /// A created cache is evicted when `blob_object` is dropped.
    pub fn find_or_create(&self, blob_object: &Arc<BlobObject>) -> Arc<BlobCache> {
        self.caches
            .lock()
            .entry(blob_object.id())
            .or_insert_with(|| {
                log::trace!("Creating blob cache for {}", blob_object.id());
                blob_object.add_releaser(Arc::new(EvictOnRelease {
                    caches: Arc::downgrade(&self.caches),
                }));
                Arc::new(BlobCache::new(blob_object))
            })
            .clone()
    }

    /// Removes the cache of `blob_object`. Does nothing if there is none.
    pub fn try_disable(&self, blob_object: &BlobObject) {
        self.try_disable_id(blob_object.id());
    }

    /// Removes the cache registered for `id`. Does nothing if there is none.
    pub fn try_disable_id(&self, id: ObjectId) {
        evict(&self.caches, id);
    }

    /// Whether a cache exists for `id`.
    pub fn contains(&self, id: ObjectId) -> bool {
        self.caches.lock().contains_key(&id)
    }

    /// Number of caches.
    pub fn len(&self) -> usize {
        self.caches.lock().len()
    }

    /// Whether the registry holds no cache.
    pub fn is_empty(&self) -> bool {
        self.caches.lock().is_empty()
    }

    /// Removes every cache.
    pub fn clear(&self) {
        let caches = core::mem::take(&mut *self.caches.lock());
        drop(caches);
    }
}

/// Shared registry of blob objects by name.
#[derive(Debug, Default)]
pub struct BlobRegister {
    objects: Mutex<HashMap<String, Arc<BlobObject>>>,
}

impl BlobRegister {
    /// Creates an empty register.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `name` is registered.
    pub fn has_object(&self, name: &str) -> bool {
        self.objects.lock().contains_key(name)
    }

    /// Registers `blob_object` under `name`.
    ///
    /// Returns `false` and leaves the register untouched if the name is already taken.
    pub fn set_object(&self, name: &str, blob_object: Arc<BlobObject>) -> bool {
        let mut objects = self.objects.lock();
        if objects.contains_key(name) {
            return false;
        }
        objects.insert(String::from(name), blob_object);
        true
    }

    /// The blob object registered under `name`.
    pub fn get_object(&self, name: &str) -> Option<Arc<BlobObject>> {
        self.objects.lock().get(name).cloned()
    }

    /// Unregisters `name`, returning the object it referred to.
    pub fn clear_object(&self, name: &str) -> Option<Arc<BlobObject>> {
        self.objects.lock().remove(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharding::ParallelAttr;
    use crate::test_utils::{CountingReleaser, blob_object, header_of, split_attr};
    use alloc::vec;
    use burn_tensor::DType;

    #[test]
    fn test_find_or_create_is_idempotent() {
        let registry = BlobCacheRegistry::new();
        let blob = blob_object(3);

        let first = registry.find_or_create(&blob);
        let second = registry.find_or_create(&blob);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_disable_then_create_gives_a_fresh_cache() {
        let registry = BlobCacheRegistry::new();
        let blob = blob_object(3);
        let first = registry.find_or_create(&blob);
        first.header(|blob| Ok(header_of(blob, [2]))).unwrap();

        registry.try_disable(&blob);
        let second = registry.find_or_create(&blob);

        assert!(!Arc::ptr_eq(&first, &second));
        let mut fetched = false;
        second
            .header(|blob| {
                fetched = true;
                Ok(header_of(blob, [2]))
            })
            .unwrap();
        assert!(fetched);
    }

    #[test]
    fn test_disable_unknown_id_is_a_noop() {
        let registry = BlobCacheRegistry::new();
        let blob = blob_object(3);

        registry.try_disable(&blob);

        assert!(registry.is_empty());
    }

    #[test]
    fn test_disable_releases_all_delegates() {
        let registry = BlobCacheRegistry::new();
        let releaser = CountingReleaser::new();
        let blob = blob_object(3);

        let cache = registry.find_or_create(&blob);
        for axis in 0..4 {
            cache
                .delegate_blob_object(&split_attr(axis), |_, attr: &ParallelAttr| {
                    Ok(Arc::new(
                        BlobObject::new(ObjectId::new(100 + axis as u64), attr.clone(), DType::F32)
                            .with_releaser(releaser.clone()),
                    ))
                })
                .unwrap();
        }
        drop(cache);

        registry.try_disable(&blob);

        assert_eq!(releaser.count(), 4);
        assert!(!registry.contains(blob.id()));
    }

    #[test]
    fn test_dropped_object_evicts_its_cache() {
        let registry = BlobCacheRegistry::new();
        let releaser = CountingReleaser::new();
        let blob = blob_object(3);

        let cache = registry.find_or_create(&blob);
        cache
            .delegate_blob_object(&split_attr(1), |_, attr: &ParallelAttr| {
                Ok(Arc::new(
                    BlobObject::new(ObjectId::new(100), attr.clone(), DType::F32)
                        .with_releaser(releaser.clone()),
                ))
            })
            .unwrap();
        drop(cache);
        assert_eq!(registry.len(), 1);

        drop(blob);

        assert!(registry.is_empty());
        assert_eq!(releaser.released(), vec![ObjectId::new(100)]);
    }

    #[test]
    fn test_object_may_outlive_its_registry() {
        let registry = BlobCacheRegistry::new();
        let blob = blob_object(3);
        registry.find_or_create(&blob);

        drop(registry);
        drop(blob);
    }

    #[test]
    fn test_register_does_not_overwrite() {
        let register = BlobRegister::new();
        let first = blob_object(1);

        assert!(register.set_object("numpy-tmp-0", first.clone()));
        assert!(!register.set_object("numpy-tmp-0", blob_object(2)));
        assert!(register.has_object("numpy-tmp-0"));
        assert!(Arc::ptr_eq(&register.get_object("numpy-tmp-0").unwrap(), &first));

        assert!(register.clear_object("numpy-tmp-0").is_some());
        assert!(!register.has_object("numpy-tmp-0"));
    }
}
