//! Seams towards the execution-mode layer and the device runtime.

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use burn_tensor::{DType, TensorData};
use derive_new::new;

use crate::blob::{BlobHeader, BlobObject, DeviceBody};
use crate::error::{BlobCacheError, Result};
use crate::sharding::ParallelAttr;
use crate::snapshot::PhysicalBlob;

/// Whether operations are recorded for later execution or run right away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Operations are recorded into a graph and executed later.
    Deferred,
    /// Operations run as soon as they are recorded.
    Immediate,
}

/// Answers the questions the execution-mode layer owns.
pub trait ExecutionModeOracle {
    /// Whether operations currently run immediately.
    fn is_immediate_execution_active(&self) -> bool;
    /// Whether the global (consistent) scope is active.
    fn in_global_mode(&self) -> bool;
    /// Whether blobs of `job_name` are seen as per-rank replicas.
    fn is_mirrored_view_active(&self, job_name: &str) -> bool;
    /// Name of the job being built or run.
    fn current_job_name(&self) -> String;
}

/// Redistribution of one blob object into another placement.
#[derive(new, Clone, Debug)]
pub struct BoxingAction {
    /// Blob being read.
    pub input: Arc<BlobObject>,
    /// Blob receiving the redistributed value.
    pub output: Arc<BlobObject>,
    /// Placement of `output`.
    pub target: ParallelAttr,
}

/// The device runtime: allocates handles, runs boxing and moves data to the host.
pub trait Transport {
    /// Allocates an empty blob object with the given placement.
    fn new_blob_object(&self, parallel_attr: ParallelAttr, dtype: DType)
    -> Result<Arc<BlobObject>>;

    /// Performs the data movement described by `action`.
    fn execute(&self, action: &BoxingAction) -> Result<()>;

    /// Shape and dtype of a blob object.
    fn fetch_header(&self, blob_object: &BlobObject) -> Result<BlobHeader>;

    /// Per-device values of a blob object.
    fn fetch_body(&self, blob_object: &BlobObject) -> Result<DeviceBody>;

    /// Copies the value behind `view` into host memory.
    ///
    /// This is a blocking call: it returns once the value is on the host.
    fn copy_to_host(&self, view: &PhysicalBlob) -> Result<TensorData>;
}

/// The pipeline boxing actions are recorded into.
pub trait ExecutionContext {
    /// Kind of pipeline.
    fn mode(&self) -> ExecutionMode;

    /// Enters a placement scope.
    fn push_placement(&mut self, parallel_attr: ParallelAttr);

    /// Leaves the innermost placement scope.
    fn pop_placement(&mut self) -> Option<ParallelAttr>;

    /// Innermost placement scope.
    fn current_placement(&self) -> Option<&ParallelAttr>;

    /// Appends an action, after every action recorded before it.
    fn record(&mut self, action: BoxingAction) -> Result<()>;

    /// Blocks until every recorded action has completed.
    fn synchronize(&mut self) -> Result<()>;

    /// Number of actions recorded so far.
    fn num_recorded(&self) -> usize;
}

/// Runs `f` with `parallel_attr` as the innermost placement scope of `ctx`.
///
/// The scope is left even if `f` fails.
pub fn with_placement<R, F>(
    ctx: &mut dyn ExecutionContext,
    parallel_attr: ParallelAttr,
    f: F,
) -> Result<R>
where
    F: FnOnce(&mut dyn ExecutionContext) -> Result<R>,
{
    ctx.push_placement(parallel_attr);
    let result = f(&mut *ctx);
    ctx.pop_placement();
    result
}

fn validate(scope: Option<&ParallelAttr>, action: &BoxingAction) -> Result<()> {
    if action.output.parallel_attr() != &action.target {
        return Err(BlobCacheError::ActionRejected(format!(
            "output {} is placed on {}, expected {}",
            action.output.id(),
            action.output.parallel_attr(),
            action.target
        )));
    }
    match scope {
        Some(scope) if scope != &action.target => Err(BlobCacheError::ActionRejected(format!(
            "boxing to {} inside placement scope {}",
            action.target, scope
        ))),
        _ => Ok(()),
    }
}

/// Context executing every action as soon as it is recorded.
pub struct ImmediateContext<'t> {
    transport: &'t dyn Transport,
    placements: Vec<ParallelAttr>,
    recorded: usize,
}

impl<'t> ImmediateContext<'t> {
    /// Creates a context running actions on `transport`.
    pub fn new(transport: &'t dyn Transport) -> Self {
        Self {
            transport,
            placements: Vec::new(),
            recorded: 0,
        }
    }
}

impl ExecutionContext for ImmediateContext<'_> {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Immediate
    }

    fn push_placement(&mut self, parallel_attr: ParallelAttr) {
        self.placements.push(parallel_attr);
    }

    fn pop_placement(&mut self) -> Option<ParallelAttr> {
        self.placements.pop()
    }

    fn current_placement(&self) -> Option<&ParallelAttr> {
        self.placements.last()
    }

    fn record(&mut self, action: BoxingAction) -> Result<()> {
        validate(self.current_placement(), &action)?;
        self.recorded += 1;
        log::debug!(
            "Running boxing {} -> {} on {}",
            action.input.id(),
            action.output.id(),
            action.target
        );
        self.transport.execute(&action)
    }

    fn synchronize(&mut self) -> Result<()> {
        Ok(())
    }

    fn num_recorded(&self) -> usize {
        self.recorded
    }
}

/// Context queueing actions until [`synchronize`](ExecutionContext::synchronize).
pub struct DeferredContext<'t> {
    transport: &'t dyn Transport,
    placements: Vec<ParallelAttr>,
    pending: Vec<BoxingAction>,
    recorded: usize,
}

impl<'t> DeferredContext<'t> {
    /// Creates a context running actions on `transport` when synchronized.
    pub fn new(transport: &'t dyn Transport) -> Self {
        Self {
            transport,
            placements: Vec::new(),
            pending: Vec::new(),
            recorded: 0,
        }
    }

    /// Number of recorded actions not executed yet.
    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }
}

impl ExecutionContext for DeferredContext<'_> {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Deferred
    }

    fn push_placement(&mut self, parallel_attr: ParallelAttr) {
        self.placements.push(parallel_attr);
    }

    fn pop_placement(&mut self) -> Option<ParallelAttr> {
        self.placements.pop()
    }

    fn current_placement(&self) -> Option<&ParallelAttr> {
        self.placements.last()
    }

    fn record(&mut self, action: BoxingAction) -> Result<()> {
        validate(self.current_placement(), &action)?;
        self.recorded += 1;
        log::debug!(
            "Recording boxing {} -> {} on {}",
            action.input.id(),
            action.output.id(),
            action.target
        );
        self.pending.push(action);
        Ok(())
    }

    fn synchronize(&mut self) -> Result<()> {
        // Actions left after a failure are dropped with the failed one: no partial retry.
        let pending = core::mem::take(&mut self.pending);
        for action in pending.iter() {
            self.transport.execute(action)?;
        }
        Ok(())
    }

    fn num_recorded(&self) -> usize {
        self.recorded
    }
}
