use alloc::sync::Arc;

use crate::blob::{BlobHeader, BlobObject, DeviceBody};
use crate::cache::BlobCache;
use crate::config::BlobCacheConfig;
use crate::error::Result;
use crate::id::UniqueNames;
use crate::registry::{BlobCacheRegistry, BlobRegister};
use crate::runtime::Transport;

/// Process-scoped state shared by every blob read: the cache registry, the blob name
/// register, the temporary name generator and the transport.
///
/// There is no global instance; create one per runtime and pass it to the call sites.
pub struct Session<T> {
    transport: T,
    caches: BlobCacheRegistry,
    blob_register: BlobRegister,
    names: UniqueNames,
    config: BlobCacheConfig,
}

impl<T: Transport> Session<T> {
    /// Creates a session with the default configuration.
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, BlobCacheConfig::default())
    }

    /// Creates a session.
    pub fn with_config(transport: T, config: BlobCacheConfig) -> Self {
        Self {
            transport,
            caches: BlobCacheRegistry::new(),
            blob_register: BlobRegister::new(),
            names: UniqueNames::new(),
            config,
        }
    }

    /// The device runtime.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Blob caches by object id.
    pub fn caches(&self) -> &BlobCacheRegistry {
        &self.caches
    }

    /// Blob objects by name.
    pub fn blob_register(&self) -> &BlobRegister {
        &self.blob_register
    }

    /// Configuration.
    pub fn config(&self) -> &BlobCacheConfig {
        &self.config
    }

    pub(crate) fn names(&self) -> &UniqueNames {
        &self.names
    }

    /// Returns the cache of `blob_object`, creating it on first access.
    pub fn find_or_create_cache(&self, blob_object: &Arc<BlobObject>) -> Arc<BlobCache> {
        self.caches.find_or_create(blob_object)
    }

    /// Drops the cache of `blob_object`, releasing the delegates it owns.
    pub fn disable_cache(&self, blob_object: &BlobObject) {
        self.caches.try_disable(blob_object);
    }

    /// Cached header of `blob_object`.
    pub fn header(&self, blob_object: &Arc<BlobObject>) -> Result<Arc<BlobHeader>> {
        self.find_or_create_cache(blob_object)
            .header(|blob_object| self.transport.fetch_header(blob_object))
    }

    /// Cached device-resident value of `blob_object`.
    pub fn body(&self, blob_object: &Arc<BlobObject>) -> Result<Arc<DeviceBody>> {
        self.find_or_create_cache(blob_object)
            .body(|blob_object| self.transport.fetch_body(blob_object))
    }
}
