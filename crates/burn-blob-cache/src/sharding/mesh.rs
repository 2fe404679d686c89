use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::str::FromStr;
use hashbrown::{HashMap, HashSet};

use super::ShardingError;

/// Identifies one physical device: the device `index` on the node of rank `rank`.
///
/// Rendered as `"rank:index"`, e.g. `"0:1"` for the second device of the first node.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeviceId {
    /// Rank of the node (process) owning the device.
    pub rank: usize,
    /// Index of the device on its node.
    pub index: usize,
}

impl DeviceId {
    /// Creates a new device id.
    pub const fn new(rank: usize, index: usize) -> Self {
        Self { rank, index }
    }

    /// The canonical device used for host materialization: device 0 of rank 0.
    pub const fn canonical() -> Self {
        Self::new(0, 0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.rank, self.index)
    }
}

impl FromStr for DeviceId {
    type Err = ShardingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ShardingError::InvalidDevice(String::from(s));
        let (rank, index) = s.split_once(':').ok_or_else(invalid)?;
        let rank = rank.trim().parse().map_err(|_| invalid())?;
        let index = index.trim().parse().map_err(|_| invalid())?;

        Ok(Self::new(rank, index))
    }
}

/// Represents a logical mesh dimension, identified by a unique name.
///
/// Mesh dimensions are used to define the logical structure of a device mesh.
/// Each mesh dimension carries its own distribution in a [`ShardingSpec`](super::ShardingSpec),
/// so hierarchical placements (e.g. split across nodes, broadcast within a node)
/// are expressed with one dimension per level.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct MeshDim {
    /// A name that uniquely identifies the mesh dimension.
    name: String,
}

impl MeshDim {
    /// Constructs a new [`MeshDim`] with the given name.
    pub fn new<S: Into<String>>(name: S) -> Self {
        MeshDim { name: name.into() }
    }

    /// Name of the dimension.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Represents a logical arrangement of devices holding a distributed value.
///
/// A `DeviceMesh` defines a structured, N-dimensional topology over a set of physical devices,
/// where each dimension is given a unique name. Devices are stored in row-major order over
/// the mesh shape.
///
/// The mesh is hashable so that placements built on top of it can key caches.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct DeviceMesh<T> {
    /// Physical devices in an n-dimensional logical arrangement
    devices: Vec<T>,
    /// Shape of the logical mesh
    shape: Vec<usize>,
    /// Dimension names, ordered by their index in the mesh
    dims: Vec<MeshDim>,
}

impl<T> DeviceMesh<T> {
    /// A one-dimensional mesh holding a single device.
    pub fn single(device: T) -> Self {
        Self {
            devices: alloc::vec![device],
            shape: alloc::vec![1],
            dims: alloc::vec![MeshDim::new("device")],
        }
    }

    /// Physical devices, row-major over [`shape`](Self::shape).
    pub fn devices(&self) -> &[T] {
        &self.devices
    }

    /// Shape of the logical mesh.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Dimension names, ordered by index.
    pub fn dims(&self) -> &[MeshDim] {
        &self.dims
    }

    /// Number of mesh dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of devices in the mesh.
    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }
}

impl<T: fmt::Display> fmt::Display for DeviceMesh<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, device) in self.devices.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{device}")?;
        }
        write!(f, "] {:?}", self.shape)
    }
}

/// A builder for constructing a [`DeviceMesh`].
///
/// This builder allows you to define a logical mesh structure with a shape and
/// specific dimension mappings. Once all dimensions are mapped, the builder can
/// be used to construct the [`DeviceMesh`] instance.
#[derive(Clone, Debug)]
pub struct DeviceMeshBuilder<T> {
    /// Physical devices in an n-dimensional logical arrangement.
    devices: Vec<T>,
    /// Shape of the logical mesh.
    shape: Vec<usize>,
    /// Maps dimension names to their indices in the mesh.
    dims: HashMap<MeshDim, usize>,
}

impl<T> DeviceMeshBuilder<T> {
    /// Creates a new [`DeviceMeshBuilder`] with the given devices and shape.
    ///
    /// # Arguments
    /// * `devices` - A vector of devices to be arranged in the mesh.
    /// * `shape` - A vector representing the shape (dimensions) of the mesh.
    pub fn new<S: Into<Vec<usize>>>(devices: Vec<T>, shape: S) -> Self {
        Self {
            devices,
            shape: shape.into(),
            dims: HashMap::new(),
        }
    }

    /// Adds a dimension to the logical mesh, associating it with a specific index.
    ///
    /// Each dimension should correspond to a unique index in the shape of the mesh.
    /// Validation happens in [`build`](Self::build).
    ///
    /// # Example
    ///
    /// ```rust
    /// use burn_blob_cache::sharding::{DeviceId, DeviceMeshBuilder, MeshDim};
    ///
    /// let devices = vec![
    ///     DeviceId::new(0, 0),
    ///     DeviceId::new(0, 1),
    ///     DeviceId::new(1, 0),
    ///     DeviceId::new(1, 1),
    /// ];
    /// let mesh = DeviceMeshBuilder::new(devices, [2, 2])
    ///     .with_dim(0, MeshDim::new("node"))
    ///     .with_dim(1, MeshDim::new("device"))
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(mesh.num_devices(), 4);
    /// ```
    pub fn with_dim(mut self, idx: usize, dim: MeshDim) -> Self {
        self.dims.insert(dim, idx);
        self
    }

    /// Builds a [`DeviceMesh`] from the current configuration.
    ///
    /// This method performs validation to ensure that all dimensions are correctly
    /// mapped and that the number of devices matches the expected shape.
    pub fn build(self) -> Result<DeviceMesh<T>, ShardingError> {
        let ndim = self.shape.len();
        let mut seen_indices = HashSet::new();

        for &idx in self.dims.values() {
            if idx >= ndim {
                return Err(ShardingError::InvalidDimension(format!(
                    "Index {} exceeds mesh shape {:?}",
                    idx, self.shape
                )));
            }
            if !seen_indices.insert(idx) {
                return Err(ShardingError::InvalidDimension(format!(
                    "Dimension {} already mapped",
                    idx
                )));
            }
        }

        if seen_indices.len() != ndim {
            return Err(ShardingError::InvalidMesh(format!(
                "Not all mesh dimensions are mapped. Got {}, expected {}",
                seen_indices.len(),
                ndim
            )));
        }

        let expected_devices = self.shape.iter().product::<usize>();
        if self.devices.len() != expected_devices {
            return Err(ShardingError::InvalidMesh(format!(
                "Device count ({}) doesn't match mesh shape {:?}",
                self.devices.len(),
                self.shape,
            )));
        }

        let mut dims: Vec<(MeshDim, usize)> = self.dims.into_iter().collect();
        dims.sort_by_key(|(_, idx)| *idx);

        Ok(DeviceMesh {
            devices: self.devices,
            shape: self.shape,
            dims: dims.into_iter().map(|(dim, _)| dim).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devices(n: usize) -> Vec<DeviceId> {
        (0..n).map(|i| DeviceId::new(i / 2, i % 2)).collect()
    }

    #[test]
    fn test_device_mesh_2x2() {
        let mesh = DeviceMeshBuilder::new(devices(4), [2, 2])
            .with_dim(1, MeshDim::new("y"))
            .with_dim(0, MeshDim::new("x"))
            .build()
            .unwrap();

        assert_eq!(mesh.ndim(), 2);
        assert_eq!(mesh.dims()[0].name(), "x");
        assert_eq!(mesh.dims()[1].name(), "y");
    }

    #[test]
    fn test_device_mesh_same_layout_is_equal() {
        let build = || {
            DeviceMeshBuilder::new(devices(2), [2])
                .with_dim(0, MeshDim::new("x"))
                .build()
                .unwrap()
        };

        assert_eq!(build(), build());
    }

    #[test]
    #[should_panic = "InvalidDimension(\"Index 2 exceeds mesh shape [2, 2]\")"]
    fn test_device_mesh_dim_should_be_in_bound() {
        let _mesh = DeviceMeshBuilder::new(devices(4), [2, 2])
            .with_dim(0, MeshDim::new("x"))
            .with_dim(2, MeshDim::new("y")) // out of bounds
            .build()
            .unwrap();
    }

    #[test]
    #[should_panic = "InvalidDimension(\"Dimension 0 already mapped\")"]
    fn test_device_mesh_dim_should_be_unique() {
        let _mesh = DeviceMeshBuilder::new(devices(4), [2, 2])
            .with_dim(0, MeshDim::new("x"))
            .with_dim(0, MeshDim::new("y")) // already mapped
            .build()
            .unwrap();
    }

    #[test]
    #[should_panic = "InvalidMesh(\"Not all mesh dimensions are mapped."]
    fn test_device_mesh_dim_name_should_be_unique() {
        let _mesh = DeviceMeshBuilder::new(devices(4), [2, 2])
            .with_dim(0, MeshDim::new("x"))
            .with_dim(1, MeshDim::new("x")) // same name is invalid
            .build()
            .unwrap();
    }

    #[test]
    #[should_panic = "InvalidMesh(\"Device count (4) doesn't match mesh shape [3, 2]"]
    fn test_device_mesh_devices_should_match_shape() {
        let _mesh = DeviceMeshBuilder::new(devices(4), [3, 2])
            .with_dim(0, MeshDim::new("x"))
            .with_dim(1, MeshDim::new("y"))
            .build()
            .unwrap();
    }

    #[test]
    fn test_device_id_parse() {
        assert_eq!("1:3".parse::<DeviceId>().unwrap(), DeviceId::new(1, 3));
        assert_eq!(DeviceId::canonical().to_string(), "0:0");
        assert!("gpu".parse::<DeviceId>().is_err());
    }

    #[test]
    fn test_single_device_mesh() {
        let mesh = DeviceMesh::single(DeviceId::canonical());

        assert_eq!(mesh.devices(), &[DeviceId::new(0, 0)]);
        assert_eq!(mesh.shape(), &[1]);
        assert_eq!(mesh.to_string(), "[0:0] [1]");
    }
}
