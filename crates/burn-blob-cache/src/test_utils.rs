use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use burn_tensor::{DType, Shape};
use spin::Mutex;

use crate::blob::{BlobHeader, BlobObject, ObjectId, ObjectReleaser};
use crate::sharding::{
    DeviceId, DeviceMeshBuilder, DeviceTag, Distribution, MeshDim, MirroredPolicy, ParallelAttr,
    ShardingSpec,
};

/// Records every released object id.
#[derive(Default)]
pub(crate) struct CountingReleaser {
    released: Mutex<Vec<ObjectId>>,
}

impl CountingReleaser {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn count(&self) -> usize {
        self.released.lock().len()
    }

    pub(crate) fn released(&self) -> Vec<ObjectId> {
        let mut released = self.released.lock().clone();
        released.sort();
        released
    }
}

impl ObjectReleaser for CountingReleaser {
    fn release(&self, id: ObjectId) {
        self.released.lock().push(id);
    }
}

/// Two cpu devices, split along `axis`.
pub(crate) fn split_attr(axis: usize) -> ParallelAttr {
    let mesh = DeviceMeshBuilder::new(vec![DeviceId::new(0, 0), DeviceId::new(0, 1)], [2])
        .with_dim(0, MeshDim::new("x"))
        .build()
        .unwrap();

    ParallelAttr::new(
        DeviceTag::Cpu,
        ShardingSpec::new(vec![Distribution::Split { axis }], mesh).unwrap(),
        MirroredPolicy::Disabled,
    )
}

pub(crate) fn blob_object(id: u64) -> Arc<BlobObject> {
    Arc::new(BlobObject::new(ObjectId::new(id), split_attr(0), DType::F32))
}

pub(crate) fn header_of<const D: usize>(blob: &BlobObject, dims: [usize; D]) -> BlobHeader {
    BlobHeader {
        shape: Shape::new(dims),
        dtype: blob.dtype(),
    }
}
