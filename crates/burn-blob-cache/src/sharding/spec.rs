use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::str::FromStr;

use super::{DeviceMesh, ShardingError};

/// Specifies how a value is distributed along one mesh dimension.
///
/// Rendered as `S(axis)`, `B` and `P` respectively.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Distribution {
    /// The value is split along the given tensor axis across the devices of the mesh dimension.
    Split {
        /// Tensor axis being split.
        axis: usize,
    },
    /// Every device of the mesh dimension holds the full value.
    Broadcast,
    /// Every device holds a partial value; the logical value is their element-wise sum.
    PartialSum,
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Distribution::Split { axis } => write!(f, "S({axis})"),
            Distribution::Broadcast => f.write_str("B"),
            Distribution::PartialSum => f.write_str("P"),
        }
    }
}

impl FromStr for Distribution {
    type Err = ShardingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "B" => Ok(Distribution::Broadcast),
            "P" => Ok(Distribution::PartialSum),
            other => other
                .strip_prefix("S(")
                .and_then(|rest| rest.strip_suffix(')'))
                .and_then(|axis| axis.trim().parse().ok())
                .map(|axis| Distribution::Split { axis })
                .ok_or_else(|| ShardingError::InvalidDistribution(String::from(s))),
        }
    }
}

/// Describes how a value is distributed across the devices of a mesh.
///
/// Holds exactly one [`Distribution`] per mesh dimension.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ShardingSpec<T> {
    /// Distribution pattern for each mesh dimension
    distributions: Vec<Distribution>,
    /// Description of the device mesh
    device_mesh: DeviceMesh<T>,
}

impl<T> ShardingSpec<T> {
    /// Creates a sharding spec, checking that every mesh dimension has a distribution.
    pub fn new(
        distributions: Vec<Distribution>,
        device_mesh: DeviceMesh<T>,
    ) -> Result<Self, ShardingError> {
        if distributions.len() != device_mesh.ndim() {
            return Err(ShardingError::InvalidDimension(format!(
                "Got {} distributions for a mesh with {} dimensions",
                distributions.len(),
                device_mesh.ndim()
            )));
        }

        Ok(Self {
            distributions,
            device_mesh,
        })
    }

    /// Full replication on a single device.
    pub fn single(device: T) -> Self {
        Self {
            distributions: alloc::vec![Distribution::Broadcast],
            device_mesh: DeviceMesh::single(device),
        }
    }

    /// Per mesh dimension distributions.
    pub fn distributions(&self) -> &[Distribution] {
        &self.distributions
    }

    /// The device mesh.
    pub fn device_mesh(&self) -> &DeviceMesh<T> {
        &self.device_mesh
    }

    /// Whether every mesh dimension broadcasts the value.
    pub fn is_broadcast(&self) -> bool {
        self.distributions
            .iter()
            .all(|d| matches!(d, Distribution::Broadcast))
    }
}

/// Formats the distributions only, e.g. `(S(0), B)`.
pub(crate) struct DistributionsDisplay<'a>(pub &'a [Distribution]);

impl fmt::Display for DistributionsDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, dist) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{dist}")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharding::{DeviceId, DeviceMeshBuilder, MeshDim};
    use alloc::vec;

    #[test]
    fn test_distribution_parse() {
        assert_eq!(
            "S(2)".parse::<Distribution>().unwrap(),
            Distribution::Split { axis: 2 }
        );
        assert_eq!("B".parse::<Distribution>().unwrap(), Distribution::Broadcast);
        assert_eq!("P".parse::<Distribution>().unwrap(), Distribution::PartialSum);
        assert_eq!(Distribution::Split { axis: 1 }.to_string(), "S(1)");
    }

    #[test]
    #[should_panic = "InvalidDistribution(\"S(x)\")"]
    fn test_distribution_parse_rejects_bad_axis() {
        let _dist = "S(x)".parse::<Distribution>().unwrap();
    }

    #[test]
    #[should_panic = "InvalidDimension(\"Got 2 distributions for a mesh with 1 dimensions\")"]
    fn test_sharding_spec_requires_one_distribution_per_mesh_dim() {
        let mesh = DeviceMeshBuilder::new(vec![DeviceId::new(0, 0), DeviceId::new(0, 1)], [2])
            .with_dim(0, MeshDim::new("x"))
            .build()
            .unwrap();

        let _spec = ShardingSpec::new(
            vec![Distribution::Split { axis: 0 }, Distribution::Broadcast],
            mesh,
        )
        .unwrap();
    }

    #[test]
    fn test_single_is_broadcast() {
        let spec = ShardingSpec::single(DeviceId::canonical());

        assert!(spec.is_broadcast());
        assert_eq!(DistributionsDisplay(spec.distributions()).to_string(), "(B)");
    }
}
