//! Collective-communication contracts and the per-worker grid context
//!
//! The actual distributed runtime (process groups, all-reduce, barriers) is an
//! external primitive; this module defines the seam it is consumed through.
//! All collective calls block the calling worker until every peer in its
//! group reaches the same call.

use crate::topology::WorkerCoordinate;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Process-group axes available for collective operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessGroup {
    /// All workers in the grid
    World,

    /// All tensor/pipeline-parallel peers of a worker (one group per
    /// data-parallel replica)
    ModelParallel,

    /// All data-parallel replicas of a worker's (tp, pp) position
    DataParallel,

    /// Peers along the tensor-parallel axis only
    TensorParallel,

    /// Peers along the pipeline-parallel axis only
    PipelineParallel,
}

impl fmt::Display for ProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessGroup::World => "world",
            ProcessGroup::ModelParallel => "model_parallel",
            ProcessGroup::DataParallel => "data_parallel",
            ProcessGroup::TensorParallel => "tensor_parallel",
            ProcessGroup::PipelineParallel => "pipeline_parallel",
        };
        f.write_str(name)
    }
}

/// Contract for the external collective-communication runtime.
///
/// Implementations must guarantee that `all_reduce_max` returns the same
/// value to every participant of the group, and that `barrier` releases no
/// worker before all peers have arrived.
#[async_trait]
pub trait Collective: Send + Sync {
    /// True if the distributed runtime has been initialized.
    fn is_initialized(&self) -> bool;

    /// The coordinate the runtime believes this worker occupies, if any.
    fn coordinate(&self) -> Option<WorkerCoordinate>;

    /// Block until all peers in the group reach the barrier.
    async fn barrier(&self, group: ProcessGroup) -> Result<()>;

    /// Max-reduce a scalar across all peers in the group.
    async fn all_reduce_max(&self, value: f64, group: ProcessGroup) -> Result<f64>;
}

impl fmt::Debug for dyn Collective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collective")
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

/// Trivial collective for a single uninitialized process.
///
/// Reductions return their input and barriers release immediately. Used for
/// single-process tests and tooling that runs outside a launched job.
#[derive(Debug, Default, Clone)]
pub struct SingleProcess;

#[async_trait]
impl Collective for SingleProcess {
    fn is_initialized(&self) -> bool {
        false
    }

    fn coordinate(&self) -> Option<WorkerCoordinate> {
        None
    }

    async fn barrier(&self, _group: ProcessGroup) -> Result<()> {
        Ok(())
    }

    async fn all_reduce_max(&self, value: f64, _group: ProcessGroup) -> Result<f64> {
        Ok(value)
    }
}

/// Per-worker view of the parallelism grid.
///
/// Bundles the worker's immutable coordinate with an optionally attached
/// collective runtime. Components that need collectives call [`collective`]
/// and fail fast with a typed error when none is attached, instead of
/// deferring to an unrelated crash downstream.
///
/// [`collective`]: GridContext::collective
#[derive(Clone)]
pub struct GridContext {
    coordinate: WorkerCoordinate,
    collective: Option<Arc<dyn Collective>>,
}

impl GridContext {
    /// Context for a worker with no collective runtime attached.
    pub fn detached(coordinate: WorkerCoordinate) -> Self {
        Self {
            coordinate,
            collective: None,
        }
    }

    /// Context for a single-process run with no parallelism.
    pub fn single_process() -> Self {
        Self::detached(WorkerCoordinate::single())
    }

    /// Attach a collective runtime, validating that the runtime's view of
    /// this worker's position matches the precomputed coordinate.
    pub fn attach(coordinate: WorkerCoordinate, collective: Arc<dyn Collective>) -> Result<Self> {
        if collective.is_initialized() {
            if let Some(actual) = collective.coordinate() {
                if actual != coordinate {
                    return Err(Error::TopologyMismatch {
                        expected: coordinate.to_string(),
                        actual: actual.to_string(),
                    });
                }
            }
        }

        info!(coordinate = %coordinate, "Attached collective runtime to grid context");

        Ok(Self {
            coordinate,
            collective: Some(collective),
        })
    }

    /// This worker's coordinate.
    pub fn coordinate(&self) -> &WorkerCoordinate {
        &self.coordinate
    }

    /// The attached collective runtime, or a typed error naming the
    /// operation that required it.
    pub fn collective(&self, operation: &str) -> Result<&Arc<dyn Collective>> {
        self.collective
            .as_ref()
            .ok_or_else(|| Error::ParallelRuntimeUnavailable {
                operation: operation.to_string(),
            })
    }

    /// The attached collective runtime if present and initialized.
    pub fn initialized_collective(&self) -> Option<&Arc<dyn Collective>> {
        self.collective.as_ref().filter(|c| c.is_initialized())
    }

    /// True if collective decisions must span peers (a model-parallel grid is
    /// in use), as opposed to being decidable locally.
    pub fn requires_collective(&self) -> bool {
        self.coordinate.topology.is_model_parallel()
    }
}

impl fmt::Debug for GridContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GridContext")
            .field("coordinate", &self.coordinate)
            .field("collective_attached", &self.collective.is_some())
            .finish()
    }
}
