//! Redistribution ("boxing") of blob objects.

use alloc::sync::Arc;

use crate::blob::BlobObject;
use crate::error::{BlobCacheError, Result};
use crate::runtime::{BoxingAction, ExecutionContext, Transport, with_placement};
use crate::session::Session;
use crate::sharding::{DeviceId, MirroredPolicy, ParallelAttr, ShardingSpec};

/// Placement a blob is boxed to before being read on the host: the same device family,
/// device 0 of rank 0, broadcast, not mirrored.
///
/// Only the device family of `source` matters.
pub fn canonical_parallel_attr(source: &ParallelAttr) -> ParallelAttr {
    ParallelAttr::new(
        source.device_tag(),
        ShardingSpec::single(DeviceId::canonical()),
        MirroredPolicy::Disabled,
    )
}

/// Records one action redistributing `blob_object` to `target` into `ctx`.
///
/// Returns the handle receiving the value. The value is only available once `ctx` has run
/// the action.
pub fn boxing_to(
    ctx: &mut dyn ExecutionContext,
    transport: &dyn Transport,
    blob_object: &Arc<BlobObject>,
    target: &ParallelAttr,
) -> Result<Arc<BlobObject>> {
    let source_tag = blob_object.parallel_attr().device_tag();
    if source_tag != target.device_tag() {
        return Err(BlobCacheError::PlacementMismatch {
            source_tag,
            target_tag: target.device_tag(),
        });
    }

    let output = transport.new_blob_object(target.clone(), blob_object.dtype())?;
    let output_tag = output.parallel_attr().device_tag();
    if output_tag != target.device_tag() {
        return Err(BlobCacheError::PlacementMismatch {
            source_tag,
            target_tag: output_tag,
        });
    }

    log::trace!(
        "Boxing {} from {} to {}",
        blob_object.id(),
        blob_object.parallel_attr(),
        target
    );
    ctx.record(BoxingAction::new(
        blob_object.clone(),
        output.clone(),
        target.clone(),
    ))?;

    Ok(output)
}

/// Boxes `blob_object` to its [canonical placement](canonical_parallel_attr), inside a
/// placement scope set to that placement.
pub fn boxing_to_single_device(
    ctx: &mut dyn ExecutionContext,
    transport: &dyn Transport,
    blob_object: &Arc<BlobObject>,
) -> Result<Arc<BlobObject>> {
    let target = canonical_parallel_attr(blob_object.parallel_attr());
    with_placement(ctx, target.clone(), |ctx| {
        boxing_to(ctx, transport, blob_object, &target)
    })
}

impl<T: Transport> Session<T> {
    /// Boxes `blob_object` to `target`, at most once per distinct target.
    ///
    /// The redistributed handle is kept as a delegate in the blob cache of `blob_object`.
    pub fn boxing_to_cached(
        &self,
        ctx: &mut dyn ExecutionContext,
        blob_object: &Arc<BlobObject>,
        target: &ParallelAttr,
    ) -> Result<Arc<BlobObject>> {
        self.find_or_create_cache(blob_object)
            .delegate_blob_object(target, |blob_object, target| {
                with_placement(ctx, target.clone(), |ctx| {
                    boxing_to(ctx, self.transport(), blob_object, target)
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalTransport;
    use crate::runtime::{DeferredContext, ImmediateContext};
    use crate::sharding::{DeviceMesh, DeviceMeshBuilder, DeviceTag, Distribution, MeshDim};
    use alloc::vec;
    use alloc::vec::Vec;
    use burn_tensor::TensorData;
    use rstest::rstest;

    fn mesh(devices: Vec<DeviceId>, shape: Vec<usize>) -> DeviceMesh<DeviceId> {
        let ndim = shape.len();
        ["node", "device"]
            .into_iter()
            .take(ndim)
            .enumerate()
            .fold(DeviceMeshBuilder::new(devices, shape), |builder, (idx, name)| {
                builder.with_dim(idx, MeshDim::new(name))
            })
            .build()
            .unwrap()
    }

    fn attr(
        tag: DeviceTag,
        distributions: Vec<Distribution>,
        mesh: DeviceMesh<DeviceId>,
    ) -> ParallelAttr {
        ParallelAttr::new(
            tag,
            ShardingSpec::new(distributions, mesh).unwrap(),
            MirroredPolicy::Disabled,
        )
    }

    #[rstest]
    #[case::split_axis_0(attr(
        DeviceTag::Gpu,
        vec![Distribution::Split { axis: 0 }],
        mesh(vec![DeviceId::new(0, 0), DeviceId::new(0, 1)], vec![2]),
    ))]
    #[case::split_axis_1_other_devices(attr(
        DeviceTag::Gpu,
        vec![Distribution::Split { axis: 1 }],
        mesh(vec![DeviceId::new(1, 2), DeviceId::new(1, 3)], vec![2]),
    ))]
    #[case::hierarchy(attr(
        DeviceTag::Gpu,
        vec![Distribution::Split { axis: 0 }, Distribution::PartialSum],
        mesh(
            vec![DeviceId::new(0, 0), DeviceId::new(0, 1), DeviceId::new(1, 0), DeviceId::new(1, 1)],
            vec![2, 2],
        ),
    ))]
    #[case::mirrored(ParallelAttr::new(
        DeviceTag::Gpu,
        ShardingSpec::single(DeviceId::new(0, 1)),
        MirroredPolicy::Mirrored,
    ))]
    fn test_canonical_target_only_depends_on_device_tag(#[case] source: ParallelAttr) {
        let target = canonical_parallel_attr(&source);

        assert_eq!(target.device_tag(), DeviceTag::Gpu);
        assert_eq!(target.devices(), &[DeviceId::new(0, 0)]);
        assert!(target.sharding().is_broadcast());
        assert_eq!(target.mirrored(), MirroredPolicy::Disabled);
        assert_eq!(target.to_string(), "gpu [0:0] [1] (B) none");
    }

    #[test]
    fn test_boxing_records_exactly_one_action_in_scope() {
        let transport = LocalTransport::new();
        let source = attr(
            DeviceTag::Cpu,
            vec![Distribution::Split { axis: 0 }],
            mesh(vec![DeviceId::new(0, 0), DeviceId::new(0, 1)], vec![2]),
        );
        let blob = transport
            .upload(TensorData::new(vec![1.0f32, 2.0, 3.0, 4.0], [4]), source)
            .unwrap();
        let mut ctx = DeferredContext::new(&transport);

        let boxed = boxing_to_single_device(&mut ctx, &transport, &blob).unwrap();

        assert_eq!(ctx.num_recorded(), 1);
        assert_eq!(ctx.num_pending(), 1);
        assert!(ctx.current_placement().is_none());
        assert_eq!(boxed.parallel_attr(), &canonical_parallel_attr(blob.parallel_attr()));
        assert_eq!(transport.stats().executed(), 0);

        ctx.synchronize().unwrap();
        assert_eq!(transport.stats().executed(), 1);
    }

    #[test]
    fn test_boxing_across_device_families_is_rejected() {
        let transport = LocalTransport::new();
        let blob = transport
            .upload(
                TensorData::new(vec![1.0f32, 2.0], [2]),
                ParallelAttr::new(
                    DeviceTag::Cpu,
                    ShardingSpec::single(DeviceId::canonical()),
                    MirroredPolicy::Disabled,
                ),
            )
            .unwrap();
        let target = ParallelAttr::new(
            DeviceTag::Gpu,
            ShardingSpec::single(DeviceId::canonical()),
            MirroredPolicy::Disabled,
        );
        let mut ctx = ImmediateContext::new(&transport);

        let err = boxing_to(&mut ctx, &transport, &blob, &target).unwrap_err();

        assert_eq!(
            err,
            BlobCacheError::PlacementMismatch {
                source_tag: DeviceTag::Cpu,
                target_tag: DeviceTag::Gpu,
            }
        );
        assert_eq!(ctx.num_recorded(), 0);
    }

    #[test]
    fn test_scope_mismatch_is_rejected_by_the_context() {
        let transport = LocalTransport::new();
        let source = attr(
            DeviceTag::Cpu,
            vec![Distribution::Broadcast],
            mesh(vec![DeviceId::new(0, 0), DeviceId::new(0, 1)], vec![2]),
        );
        let blob = transport
            .upload(TensorData::new(vec![5.0f32], [1]), source.clone())
            .unwrap();
        let mut ctx = ImmediateContext::new(&transport);
        ctx.push_placement(source);

        let boxed = boxing_to_single_device(&mut ctx, &transport, &blob);
        assert!(boxed.is_ok(), "the builder opens its own scope");

        let target = canonical_parallel_attr(blob.parallel_attr());
        let err = boxing_to(&mut ctx, &transport, &blob, &target).unwrap_err();
        assert!(matches!(err, BlobCacheError::ActionRejected(_)));
    }

    #[test]
    fn test_cached_boxing_runs_once_per_target() {
        let session = Session::new(LocalTransport::new());
        let source = attr(
            DeviceTag::Cpu,
            vec![Distribution::Split { axis: 0 }],
            mesh(vec![DeviceId::new(0, 0), DeviceId::new(0, 1)], vec![2]),
        );
        let blob = session
            .transport()
            .upload(TensorData::new(vec![1.0f32, 2.0], [2]), source)
            .unwrap();
        let broadcast = attr(
            DeviceTag::Cpu,
            vec![Distribution::Broadcast],
            mesh(vec![DeviceId::new(0, 0), DeviceId::new(0, 1)], vec![2]),
        );
        let single = canonical_parallel_attr(blob.parallel_attr());
        let mut ctx = ImmediateContext::new(session.transport());

        let first = session.boxing_to_cached(&mut ctx, &blob, &broadcast).unwrap();
        let again = session.boxing_to_cached(&mut ctx, &blob, &broadcast).unwrap();
        let other = session.boxing_to_cached(&mut ctx, &blob, &single).unwrap();

        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(ctx.num_recorded(), 2);
        assert_eq!(session.find_or_create_cache(&blob).num_delegates(), 2);

        let body = session.body(&first).unwrap();
        assert_eq!(body.shards.len(), 2);
        for (_, shard) in body.shards.iter() {
            assert_eq!(shard.to_vec::<f32>().unwrap(), vec![1.0, 2.0]);
        }
    }

    #[test]
    fn test_dropping_the_source_releases_cached_delegates() {
        let session = Session::new(LocalTransport::new());
        let source = attr(
            DeviceTag::Cpu,
            vec![Distribution::Split { axis: 0 }],
            mesh(vec![DeviceId::new(0, 0), DeviceId::new(0, 1)], vec![2]),
        );
        let blob = session
            .transport()
            .upload(TensorData::new(vec![1.0f32, 2.0], [2]), source)
            .unwrap();
        let broadcast = attr(
            DeviceTag::Cpu,
            vec![Distribution::Broadcast],
            mesh(vec![DeviceId::new(0, 0), DeviceId::new(0, 1)], vec![2]),
        );
        let mut ctx = ImmediateContext::new(session.transport());

        let delegate = session.boxing_to_cached(&mut ctx, &blob, &broadcast).unwrap();
        session.body(&delegate).unwrap();
        assert_eq!(session.caches().len(), 2);
        assert_eq!(session.transport().num_live_objects(), 2);

        drop(delegate);
        drop(blob);

        assert_eq!(session.caches().len(), 0);
        assert_eq!(session.transport().num_live_objects(), 0);
    }
}
