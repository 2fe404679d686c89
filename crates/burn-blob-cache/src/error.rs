use alloc::string::String;

use crate::blob::ObjectId;
use crate::sharding::{DeviceTag, ShardingError};

/// Errors raised while materializing, redistributing or snapshotting a blob.
///
/// Errors coming from the transport or the execution context are propagated unchanged;
/// nothing in this crate retries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlobCacheError {
    /// Boxing between incompatible device families.
    #[error("cannot box from {source_tag} to {target_tag}")]
    PlacementMismatch {
        /// Device family of the source blob.
        source_tag: DeviceTag,
        /// Device family that was requested.
        target_tag: DeviceTag,
    },
    /// A host snapshot was requested for a rank other than the primary rank.
    #[error("host snapshots are only supported for rank 0, got rank {rank}")]
    UnsupportedRank {
        /// Requested rank.
        rank: usize,
    },
    /// Remote blob construction matched zero or several blob families.
    #[error("expected exactly one remote blob family to match, {matched} matched")]
    AmbiguousDispatch {
        /// Number of matching families.
        matched: usize,
    },
    /// The active execution context refused a recorded action.
    #[error("action rejected: {0}")]
    ActionRejected(String),
    /// The blob object a cache refers to has been dropped.
    #[error("blob object {0} has been released")]
    ObjectReleased(ObjectId),
    /// No blob object is registered under the given name.
    #[error("no blob object registered as `{0}`")]
    BlobNameNotFound(String),
    /// Lazy (graph-building) blobs have no value to read.
    #[error("lazy blob `{0}` can not be read on the host")]
    LazyBlobNotReadable(String),
    /// Invalid placement description.
    #[error(transparent)]
    Sharding(#[from] ShardingError),
    /// Failure reported by the device runtime.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Result type of the crate.
pub type Result<T> = core::result::Result<T, BlobCacheError>;
