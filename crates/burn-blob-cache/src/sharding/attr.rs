use alloc::string::String;
use core::fmt;

use strum::{Display, EnumString};

use super::spec::DistributionsDisplay;
use super::{DeviceId, DeviceMesh, Distribution, ShardingError, ShardingSpec};

/// Device family a placement lives on.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum DeviceTag {
    /// Host processors.
    Cpu,
    /// CUDA devices.
    Gpu,
    /// Cambricon MLU devices.
    Cambricon,
}

/// Whether a value is seen as independent per-rank replicas.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Display, EnumString)]
pub enum MirroredPolicy {
    /// Single logical value.
    #[default]
    #[strum(serialize = "none")]
    Disabled,
    /// One independent value per replica.
    #[strum(serialize = "mirrored")]
    Mirrored,
}

/// Placement attribute of a distributed value: device family, devices, distribution
/// and mirrored policy.
///
/// Used as the key of redistributed copies in the blob cache, so two attributes
/// compare equal only if they describe the exact same placement.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ParallelAttr {
    device_tag: DeviceTag,
    sharding: ShardingSpec<DeviceId>,
    mirrored: MirroredPolicy,
}

impl ParallelAttr {
    /// Creates a placement attribute.
    pub fn new(
        device_tag: DeviceTag,
        sharding: ShardingSpec<DeviceId>,
        mirrored: MirroredPolicy,
    ) -> Self {
        Self {
            device_tag,
            sharding,
            mirrored,
        }
    }

    /// Builds an attribute from the string forms of its distribution and mirrored policy,
    /// e.g. `"S(0), B"` and `"none"`.
    pub fn from_parts(
        device_tag: DeviceTag,
        device_mesh: DeviceMesh<DeviceId>,
        distributions: &str,
        mirrored: &str,
    ) -> Result<Self, ShardingError> {
        let distributions = distributions.trim();
        let distributions = distributions
            .strip_prefix('(')
            .and_then(|inner| inner.strip_suffix(')'))
            .unwrap_or(distributions)
            .split(',')
            .map(str::parse::<Distribution>)
            .collect::<Result<_, _>>()?;
        let mirrored = mirrored
            .trim()
            .parse()
            .map_err(|_| ShardingError::InvalidMirroredPolicy(String::from(mirrored)))?;

        Ok(Self::new(
            device_tag,
            ShardingSpec::new(distributions, device_mesh)?,
            mirrored,
        ))
    }

    /// Device family.
    pub fn device_tag(&self) -> DeviceTag {
        self.device_tag
    }

    /// Devices and distribution.
    pub fn sharding(&self) -> &ShardingSpec<DeviceId> {
        &self.sharding
    }

    /// Mirrored policy.
    pub fn mirrored(&self) -> MirroredPolicy {
        self.mirrored
    }

    /// Devices holding the value.
    pub fn devices(&self) -> &[DeviceId] {
        self.sharding.device_mesh().devices()
    }
}

impl fmt::Display for ParallelAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.device_tag,
            self.sharding.device_mesh(),
            DistributionsDisplay(self.sharding.distributions()),
            self.mirrored
        )
    }
}
