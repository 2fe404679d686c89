//! In-memory transport simulating a set of devices on the host.
//!
//! Every blob object keeps its logical value next to the per-device pieces computed from its
//! placement. Only `f32` values are supported.

use alloc::format;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use burn_tensor::{DType, Shape, TensorData};
use hashbrown::HashMap;
use portable_atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use crate::blob::{BlobHeader, BlobObject, DeviceBody, ObjectId, ObjectReleaser};
use crate::error::{BlobCacheError, Result};
use crate::id::ObjectIdAllocator;
use crate::runtime::{BoxingAction, Transport};
use crate::sharding::{DeviceId, Distribution, ParallelAttr};
use crate::snapshot::PhysicalBlob;

/// Counters of the work done by a [`LocalTransport`].
#[derive(Debug, Default)]
pub struct LocalStats {
    allocated: AtomicUsize,
    executed: AtomicUsize,
    host_copies: AtomicUsize,
}

impl LocalStats {
    /// Blob objects created, by upload or allocation.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Boxing actions executed.
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::Relaxed)
    }

    /// Copies to the host.
    pub fn host_copies(&self) -> usize {
        self.host_copies.load(Ordering::Relaxed)
    }
}

struct Stored {
    parallel_attr: ParallelAttr,
    /// Logical value, `None` until the boxing producing it has run.
    value: Option<TensorData>,
}

#[derive(Default)]
struct LocalStore {
    objects: Mutex<HashMap<ObjectId, Stored>>,
}

impl ObjectReleaser for LocalStore {
    fn release(&self, id: ObjectId) {
        self.objects.lock().remove(&id);
    }
}

/// [`Transport`] keeping every device's memory on the host.
#[derive(Default)]
pub struct LocalTransport {
    ids: ObjectIdAllocator,
    store: Arc<LocalStore>,
    stats: LocalStats,
}

impl LocalTransport {
    /// Creates a transport with no object.
    pub fn new() -> Self {
        Self::default()
    }

    /// Work counters.
    pub fn stats(&self) -> &LocalStats {
        &self.stats
    }

    /// Number of blob objects still alive.
    pub fn num_live_objects(&self) -> usize {
        self.store.objects.lock().len()
    }

    /// Places a host value on the devices described by `parallel_attr`.
    pub fn upload(&self, data: TensorData, parallel_attr: ParallelAttr) -> Result<Arc<BlobObject>> {
        check_dtype(data.dtype)?;
        shards(&data, &parallel_attr)?;

        Ok(self.allocate(parallel_attr, data.dtype, Some(data)))
    }

    fn allocate(
        &self,
        parallel_attr: ParallelAttr,
        dtype: DType,
        value: Option<TensorData>,
    ) -> Arc<BlobObject> {
        let id = self.ids.allocate();
        self.stats.allocated.fetch_add(1, Ordering::Relaxed);
        self.store.objects.lock().insert(
            id,
            Stored {
                parallel_attr: parallel_attr.clone(),
                value,
            },
        );
        let releaser: Arc<dyn ObjectReleaser> = self.store.clone();

        Arc::new(BlobObject::new(id, parallel_attr, dtype).with_releaser(releaser))
    }

    fn value_of(&self, id: ObjectId) -> Result<(ParallelAttr, TensorData)> {
        let objects = self.store.objects.lock();
        let stored = objects
            .get(&id)
            .ok_or_else(|| BlobCacheError::Transport(format!("unknown blob object {id}")))?;
        let value = stored.value.clone().ok_or_else(|| {
            BlobCacheError::Transport(format!("blob object {id} is not materialized"))
        })?;

        Ok((stored.parallel_attr.clone(), value))
    }
}

impl Transport for LocalTransport {
    fn new_blob_object(
        &self,
        parallel_attr: ParallelAttr,
        dtype: DType,
    ) -> Result<Arc<BlobObject>> {
        check_dtype(dtype)?;
        Ok(self.allocate(parallel_attr, dtype, None))
    }

    fn execute(&self, action: &BoxingAction) -> Result<()> {
        let (_, value) = self.value_of(action.input.id())?;
        // Validates that the value can be laid out on the target devices.
        shards(&value, &action.target)?;

        let mut objects = self.store.objects.lock();
        let output = objects.get_mut(&action.output.id()).ok_or_else(|| {
            BlobCacheError::Transport(format!("unknown blob object {}", action.output.id()))
        })?;
        output.value = Some(value);
        self.stats.executed.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    fn fetch_header(&self, blob_object: &BlobObject) -> Result<BlobHeader> {
        let (_, value) = self.value_of(blob_object.id())?;

        Ok(BlobHeader {
            shape: Shape::from(value.shape.clone()),
            dtype: value.dtype,
        })
    }

    fn fetch_body(&self, blob_object: &BlobObject) -> Result<DeviceBody> {
        let (parallel_attr, value) = self.value_of(blob_object.id())?;

        Ok(DeviceBody {
            shards: shards(&value, &parallel_attr)?,
        })
    }

    fn copy_to_host(&self, view: &PhysicalBlob) -> Result<TensorData> {
        let (parallel_attr, value) = self.value_of(view.blob_object().id())?;
        if parallel_attr.devices().len() != 1 || !parallel_attr.sharding().is_broadcast() {
            return Err(BlobCacheError::Transport(format!(
                "`{}` is placed on {}, copies to the host need a single device",
                view.name(),
                parallel_attr
            )));
        }
        if value.shape != view.shape().dims {
            return Err(BlobCacheError::Transport(format!(
                "`{}` has shape {:?}, its header says {:?}",
                view.name(),
                value.shape,
                view.shape().dims
            )));
        }
        self.stats.host_copies.fetch_add(1, Ordering::Relaxed);

        Ok(value)
    }
}

fn check_dtype(dtype: DType) -> Result<()> {
    match dtype {
        DType::F32 => Ok(()),
        other => Err(BlobCacheError::Transport(format!(
            "the local transport only holds f32 values, got {other:?}"
        ))),
    }
}

/// Piece of `value` held by each device of `parallel_attr`, in mesh order.
///
/// Mesh dimensions apply one after the other: a device at mesh coordinate `c` takes part
/// `c[d]` of the piece left by the previous dimensions.
fn shards(
    value: &TensorData,
    parallel_attr: &ParallelAttr,
) -> Result<Vec<(DeviceId, TensorData)>> {
    let mesh = parallel_attr.sharding().device_mesh();
    let distributions = parallel_attr.sharding().distributions();
    let values = value
        .to_vec::<f32>()
        .map_err(|err| BlobCacheError::Transport(format!("{err:?}")))?;

    mesh.devices()
        .iter()
        .enumerate()
        .map(|(flat, device)| -> Result<(DeviceId, TensorData)> {
            let coords = unravel(flat, mesh.shape());
            let mut piece = (values.clone(), value.shape.clone());
            for (dist, (&coord, &size)) in distributions
                .iter()
                .zip(coords.iter().zip(mesh.shape().iter()))
            {
                piece = match dist {
                    Distribution::Broadcast => piece,
                    Distribution::PartialSum if coord == 0 => piece,
                    Distribution::PartialSum => (vec![0.0; piece.0.len()], piece.1),
                    Distribution::Split { axis } => split(&piece.0, &piece.1, *axis, size, coord)?,
                };
            }
            Ok((*device, TensorData::new(piece.0, piece.1)))
        })
        .collect()
}

fn unravel(mut flat: usize, shape: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; shape.len()];
    for (coord, &size) in coords.iter_mut().zip(shape.iter()).rev() {
        *coord = flat % size;
        flat /= size;
    }
    coords
}

/// Part `index` of `parts` balanced parts of `values` along `axis`.
///
/// The first `len % parts` parts hold one more row than the others.
fn split(
    values: &[f32],
    shape: &[usize],
    axis: usize,
    parts: usize,
    index: usize,
) -> Result<(Vec<f32>, Vec<usize>)> {
    if axis >= shape.len() {
        return Err(BlobCacheError::Transport(format!(
            "can not split axis {axis} of a value with shape {shape:?}"
        )));
    }

    let len = shape[axis];
    let base = len / parts;
    let extra = len % parts;
    let start = index * base + index.min(extra);
    let part_len = base + usize::from(index < extra);

    let outer: usize = shape[..axis].iter().product();
    let inner: usize = shape[axis + 1..].iter().product();

    let mut out = Vec::with_capacity(outer * part_len * inner);
    for o in 0..outer {
        let begin = (o * len + start) * inner;
        out.extend_from_slice(&values[begin..begin + part_len * inner]);
    }

    let mut part_shape = shape.to_vec();
    part_shape[axis] = part_len;

    Ok((out, part_shape))
}
