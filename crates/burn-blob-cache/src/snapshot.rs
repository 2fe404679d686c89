//! Host snapshots of blob objects.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use burn_tensor::{DType, Shape, TensorData};

use crate::blob::{BlobHeader, BlobObject};
use crate::boxing::{boxing_to_single_device, canonical_parallel_attr};
use crate::error::{BlobCacheError, Result};
use crate::runtime::{ExecutionContext, Transport};
use crate::session::Session;

/// Rank whose value host snapshots are taken from.
pub const PRIMARY_RANK: usize = 0;

/// Fails unless `rank` designates the primary rank.
pub fn check_rank(rank: Option<usize>) -> Result<()> {
    match rank {
        None | Some(PRIMARY_RANK) => Ok(()),
        Some(rank) => Err(BlobCacheError::UnsupportedRank { rank }),
    }
}

/// View of a blob object registered by name, on a single device.
#[derive(Clone, Debug)]
pub struct PhysicalBlob {
    name: String,
    blob_object: Arc<BlobObject>,
    header: Arc<BlobHeader>,
}

impl PhysicalBlob {
    /// Binds a view to the blob object registered as `name`.
    ///
    /// The header comes from the blob object's own cache.
    pub fn new<T: Transport>(session: &Session<T>, name: &str) -> Result<Self> {
        let blob_object = session
            .blob_register()
            .get_object(name)
            .ok_or_else(|| BlobCacheError::BlobNameNotFound(String::from(name)))?;
        let header = session.header(&blob_object)?;

        Ok(Self {
            name: String::from(name),
            blob_object,
            header,
        })
    }

    /// Name the blob object is registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The viewed blob object.
    pub fn blob_object(&self) -> &Arc<BlobObject> {
        &self.blob_object
    }

    /// Shape of the value.
    pub fn shape(&self) -> &Shape {
        &self.header.shape
    }

    /// Element type of the value.
    pub fn dtype(&self) -> DType {
        self.header.dtype
    }

    /// Copies the value to the host.
    pub fn numpy(&self, transport: &dyn Transport) -> Result<TensorData> {
        transport.copy_to_host(self)
    }
}

impl<T: Transport> Session<T> {
    /// Boxes `blob_object` to the canonical device and copies it to the host, without caching.
    ///
    /// The boxed blob object is registered as `tmp_name` while it is read, unless that name is
    /// already taken, in which case the registered object is read instead.
    pub fn fetch_blob_numpy(
        &self,
        ctx: &mut dyn ExecutionContext,
        blob_object: &Arc<BlobObject>,
        tmp_name: &str,
    ) -> Result<TensorData> {
        let canonical = if self.config().skip_boxing_when_canonical
            && blob_object.parallel_attr() == &canonical_parallel_attr(blob_object.parallel_attr())
        {
            log::trace!("{} is already on the canonical device", blob_object.id());
            blob_object.clone()
        } else {
            boxing_to_single_device(ctx, self.transport(), blob_object)?
        };

        let registered = self.blob_register().set_object(tmp_name, canonical.clone());

        let result = ctx
            .synchronize()
            .and_then(|_| PhysicalBlob::new(self, tmp_name))
            .and_then(|view| view.numpy(self.transport()));

        if registered {
            self.blob_register().clear_object(tmp_name);
        }
        if canonical.id() != blob_object.id() {
            self.disable_cache(&canonical);
        }

        result
    }

    /// Cached host snapshot of `blob_object`.
    ///
    /// On a cache miss, boxes the blob to the canonical device and copies it to the host.
    /// `tmp_name` defaults to a fresh name built from the configured prefix.
    pub fn blob_object_numpy(
        &self,
        ctx: &mut dyn ExecutionContext,
        blob_object: &Arc<BlobObject>,
        tmp_name: Option<&str>,
    ) -> Result<Arc<TensorData>> {
        self.find_or_create_cache(blob_object).numpy(|blob_object| {
            let tmp_name = match tmp_name {
                Some(name) => String::from(name),
                None => self.names().unique_str(&self.config().numpy_tmp_prefix),
            };
            self.fetch_blob_numpy(ctx, blob_object, &tmp_name)
        })
    }

    /// Cached per-replica host snapshots of `blob_object`.
    ///
    /// Only the primary rank is supported, so the list holds a single array equal to
    /// [`blob_object_numpy`](Self::blob_object_numpy). Any other rank fails before touching
    /// the device.
    pub fn blob_object_numpy_list(
        &self,
        ctx: &mut dyn ExecutionContext,
        blob_object: &Arc<BlobObject>,
        rank: Option<usize>,
        tmp_name: Option<&str>,
    ) -> Result<Arc<Vec<TensorData>>> {
        check_rank(rank)?;

        self.find_or_create_cache(blob_object)
            .numpy_mirrored_list(|blob_object| {
                let numpy = self.blob_object_numpy(ctx, blob_object, tmp_name)?;
                Ok(vec![numpy.as_ref().clone()])
            })
    }
}
