//! Remote blobs: the user facing handles over logical blobs.
//!
//! A remote blob belongs to one of four families, picked once when it is resolved:
//!
//! | execution | consistent view      | mirrored view      |
//! |-----------|----------------------|--------------------|
//! | deferred  | `LazyConsistent`     | `LazyMirrored`     |
//! | immediate | `EagerConsistent`    | `EagerMirrored`    |
//!
//! Only eager blobs own a value that can be read on the host.

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use burn_tensor::{DType, TensorData};
use derive_new::new;

use crate::blob::{BlobHeader, BlobObject, DeviceBody};
use crate::error::{BlobCacheError, Result};
use crate::runtime::{ExecutionContext, ExecutionModeOracle, Transport};
use crate::session::Session;
use crate::snapshot::check_rank;

const LAZY_CONSISTENT_IN_MIRRORED_VIEW: &str = "WARNING:\n\
    You access a consistent blob shape in mirrored view, there may be problems,\n\
    you should add 'x = flow.cast_to_current_logical_view(x)'.";

const LAZY_MIRRORED_IN_CONSISTENT_VIEW: &str = "WARNING:\n\
    You access a mirrored blob shape in consistent view, there may be problems,\n\
    you should add 'x = flow.cast_to_current_logical_view(x)'.";

/// Identifies a logical blob: the output `blob_name` of operator `op_name`.
#[derive(new, Clone, Debug, Hash, PartialEq, Eq)]
pub struct LogicalBlobId {
    /// Producing operator.
    pub op_name: String,
    /// Output name.
    pub blob_name: String,
}

impl LogicalBlobId {
    /// `"op_name/blob_name"`.
    pub fn logical_blob_name(&self) -> String {
        format!("{}/{}", self.op_name, self.blob_name)
    }
}

/// How a blob should be distributed when consumed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Distribute {
    /// Let the consumer decide.
    #[default]
    Auto,
    /// Replicate on every device.
    Broadcast,
    /// Split along the given axis.
    Split(usize),
}

/// Optional arguments of [`RemoteBlob::resolve`].
#[derive(Clone, Debug, Default)]
pub struct RemoteBlobOptions {
    /// Job owning the blob. Empty when not given.
    pub job_name: Option<String>,
    /// Value of an eager blob. Looked up by logical blob name when not given.
    pub blob_object: Option<Arc<BlobObject>>,
    /// Distribution hint.
    pub distribute: Distribute,
    /// Element type of a lazy blob, as declared by the graph. Eager blobs read it from their
    /// blob object.
    pub dtype: Option<DType>,
}

/// Remote blob in deferred (graph-building) mode.
#[derive(Clone, Debug)]
pub struct LazyBlob {
    lbi: LogicalBlobId,
    job_name: String,
    distribute: Distribute,
    dtype: Option<DType>,
}

/// Remote blob in immediate mode, owning a blob object.
#[derive(Clone, Debug)]
pub struct EagerBlob {
    lbi: LogicalBlobId,
    blob_object: Arc<BlobObject>,
    job_name: String,
    distribute: Distribute,
}

/// A remote blob. The variant is fixed for the blob's lifetime.
#[derive(Clone, Debug)]
pub enum RemoteBlob {
    /// Deferred, single global shape.
    LazyConsistent(LazyBlob),
    /// Deferred, one shape per replica.
    LazyMirrored(LazyBlob),
    /// Immediate, single global shape.
    EagerConsistent(EagerBlob),
    /// Immediate, one shape per replica.
    EagerMirrored(EagerBlob),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Family {
    Eager,
    Lazy,
}

impl RemoteBlob {
    /// Builds the remote blob matching the current execution mode and view.
    ///
    /// The eager family requires immediate execution in global mode, the lazy family
    /// requires deferred execution. Anything else matches zero families and fails with
    /// [`BlobCacheError::AmbiguousDispatch`].
    pub fn resolve<T: Transport>(
        session: &Session<T>,
        oracle: &dyn ExecutionModeOracle,
        lbi: LogicalBlobId,
        options: RemoteBlobOptions,
    ) -> Result<Self> {
        let immediate = oracle.is_immediate_execution_active();
        let candidates = [
            (Family::Eager, oracle.in_global_mode() && immediate),
            (Family::Lazy, !immediate),
        ];
        let matching: Vec<Family> = candidates
            .iter()
            .filter(|(_, matches)| *matches)
            .map(|(family, _)| *family)
            .collect();
        let family = match matching.as_slice() {
            [family] => *family,
            _ => {
                return Err(BlobCacheError::AmbiguousDispatch {
                    matched: matching.len(),
                });
            }
        };

        let mirrored = oracle.is_mirrored_view_active(&oracle.current_job_name());
        let job_name = options.job_name.unwrap_or_default();

        let blob = match family {
            Family::Lazy => {
                let blob = LazyBlob {
                    lbi,
                    job_name,
                    distribute: options.distribute,
                    dtype: options.dtype,
                };
                match mirrored {
                    true => RemoteBlob::LazyMirrored(blob),
                    false => RemoteBlob::LazyConsistent(blob),
                }
            }
            Family::Eager => {
                let lbn = lbi.logical_blob_name();
                let blob_object = match options.blob_object {
                    Some(blob_object) => blob_object,
                    None => session
                        .blob_register()
                        .get_object(&lbn)
                        .ok_or(BlobCacheError::BlobNameNotFound(lbn))?,
                };
                let blob = EagerBlob {
                    lbi,
                    blob_object,
                    job_name,
                    distribute: options.distribute,
                };
                match mirrored {
                    true => RemoteBlob::EagerMirrored(blob),
                    false => RemoteBlob::EagerConsistent(blob),
                }
            }
        };
        log::trace!("Resolved {} as {}", blob.logical_blob_name(), blob.kind());

        Ok(blob)
    }

    /// Name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteBlob::LazyConsistent(_) => "LazyConsistentBlob",
            RemoteBlob::LazyMirrored(_) => "LazyMirroredBlob",
            RemoteBlob::EagerConsistent(_) => "EagerConsistentBlob",
            RemoteBlob::EagerMirrored(_) => "EagerMirroredBlob",
        }
    }

    /// Whether the blob owns a value.
    pub fn is_eager(&self) -> bool {
        matches!(
            self,
            RemoteBlob::EagerConsistent(_) | RemoteBlob::EagerMirrored(_)
        )
    }

    /// Whether the blob is seen as per-replica values.
    pub fn is_mirrored(&self) -> bool {
        matches!(
            self,
            RemoteBlob::LazyMirrored(_) | RemoteBlob::EagerMirrored(_)
        )
    }

    /// Logical blob id.
    pub fn lbi(&self) -> &LogicalBlobId {
        match self {
            RemoteBlob::LazyConsistent(blob) | RemoteBlob::LazyMirrored(blob) => &blob.lbi,
            RemoteBlob::EagerConsistent(blob) | RemoteBlob::EagerMirrored(blob) => &blob.lbi,
        }
    }

    /// `"op_name/blob_name"`.
    pub fn logical_blob_name(&self) -> String {
        self.lbi().logical_blob_name()
    }

    /// Owning job, empty if unknown.
    pub fn job_name(&self) -> &str {
        match self {
            RemoteBlob::LazyConsistent(blob) | RemoteBlob::LazyMirrored(blob) => &blob.job_name,
            RemoteBlob::EagerConsistent(blob) | RemoteBlob::EagerMirrored(blob) => &blob.job_name,
        }
    }

    /// Distribution hint.
    pub fn distribute(&self) -> Distribute {
        match self {
            RemoteBlob::LazyConsistent(blob) | RemoteBlob::LazyMirrored(blob) => blob.distribute,
            RemoteBlob::EagerConsistent(blob) | RemoteBlob::EagerMirrored(blob) => {
                blob.distribute
            }
        }
    }

    /// Element type, `None` for a lazy blob whose type was not declared.
    pub fn dtype(&self) -> Option<DType> {
        match self {
            RemoteBlob::LazyConsistent(blob) | RemoteBlob::LazyMirrored(blob) => blob.dtype,
            RemoteBlob::EagerConsistent(blob) | RemoteBlob::EagerMirrored(blob) => {
                Some(blob.blob_object.dtype())
            }
        }
    }

    /// Same blob, same variant, with another distribution hint.
    pub fn with_distribute(&self, distribute: Distribute) -> Self {
        let mut blob = self.clone();
        match &mut blob {
            RemoteBlob::LazyConsistent(lazy) | RemoteBlob::LazyMirrored(lazy) => {
                lazy.distribute = distribute
            }
            RemoteBlob::EagerConsistent(eager) | RemoteBlob::EagerMirrored(eager) => {
                eager.distribute = distribute
            }
        }
        blob
    }

    /// The blob object of an eager blob.
    pub fn blob_object(&self) -> Option<&Arc<BlobObject>> {
        self.eager().ok().map(|blob| &blob.blob_object)
    }

    /// Warning to show when the shape of a lazy blob is read in the other logical view.
    pub fn shape_view_warning(&self, oracle: &dyn ExecutionModeOracle) -> Option<&'static str> {
        let mirrored_view = oracle.is_mirrored_view_active(&oracle.current_job_name());
        let warning = match self {
            RemoteBlob::LazyConsistent(_) if mirrored_view => LAZY_CONSISTENT_IN_MIRRORED_VIEW,
            RemoteBlob::LazyMirrored(_) if !mirrored_view => LAZY_MIRRORED_IN_CONSISTENT_VIEW,
            _ => return None,
        };
        log::warn!("{warning}");
        Some(warning)
    }

    /// Cached header of an eager blob.
    pub fn header<T: Transport>(&self, session: &Session<T>) -> Result<Arc<BlobHeader>> {
        session.header(&self.eager()?.blob_object)
    }

    /// Cached device-resident value of an eager blob.
    pub fn body<T: Transport>(&self, session: &Session<T>) -> Result<Arc<DeviceBody>> {
        session.body(&self.eager()?.blob_object)
    }

    /// Host copy of the value, read from `rank`.
    ///
    /// Only the primary rank (`None` or `Some(0)`) is supported.
    pub fn numpy<T: Transport>(
        &self,
        session: &Session<T>,
        ctx: &mut dyn ExecutionContext,
        rank: Option<usize>,
    ) -> Result<Arc<TensorData>> {
        check_rank(rank)?;
        let blob = self.eager()?;
        let tmp_name = blob.consistent_name();

        session.blob_object_numpy(ctx, &blob.blob_object, Some(&tmp_name))
    }

    /// Host copies of the value, one per replica of `rank`.
    ///
    /// Only the primary rank (`None` or `Some(0)`) is supported, the list holds one array.
    pub fn numpy_list<T: Transport>(
        &self,
        session: &Session<T>,
        ctx: &mut dyn ExecutionContext,
        rank: Option<usize>,
    ) -> Result<Arc<Vec<TensorData>>> {
        check_rank(rank)?;
        let blob = self.eager()?;
        let tmp_name = blob.consistent_name();

        session.blob_object_numpy_list(ctx, &blob.blob_object, rank, Some(&tmp_name))
    }

    /// Drops the cache of an eager blob. Does nothing for lazy blobs.
    pub fn disable_cache<T: Transport>(&self, session: &Session<T>) {
        if let Ok(blob) = self.eager() {
            session.disable_cache(&blob.blob_object);
        }
    }

    fn eager(&self) -> Result<&EagerBlob> {
        match self {
            RemoteBlob::EagerConsistent(blob) | RemoteBlob::EagerMirrored(blob) => Ok(blob),
            RemoteBlob::LazyConsistent(blob) | RemoteBlob::LazyMirrored(blob) => Err(
                BlobCacheError::LazyBlobNotReadable(blob.lbi.logical_blob_name()),
            ),
        }
    }
}

impl EagerBlob {
    fn consistent_name(&self) -> String {
        format!("{}-consistent", self.lbi.logical_blob_name())
    }
}
