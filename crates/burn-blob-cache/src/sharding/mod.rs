//! Placement of distributed values: devices, meshes, distributions.

mod attr;
mod mesh;
mod spec;

pub use attr::*;
pub use mesh::*;
pub use spec::*;

use alloc::string::String;

/// Represents errors that can occur when describing a placement.
///
/// These errors are typically related to invalid dimension mappings, mismatches
/// between the device count and the mesh shape, or unparsable string forms.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShardingError {
    /// An invalid dimension was specified.
    #[error("invalid dimension: {0}")]
    InvalidDimension(String),
    /// The mesh configuration is invalid.
    #[error("invalid mesh: {0}")]
    InvalidMesh(String),
    /// A device id could not be parsed.
    #[error("invalid device `{0}`")]
    InvalidDevice(String),
    /// A distribution could not be parsed.
    #[error("invalid distribution `{0}`")]
    InvalidDistribution(String),
    /// A mirrored policy could not be parsed.
    #[error("invalid mirrored policy `{0}`")]
    InvalidMirroredPolicy(String),
}
