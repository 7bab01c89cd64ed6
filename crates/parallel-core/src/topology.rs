//! 3-D parallelism grid topology and worker coordinates
//!
//! A worker's position is a point in a (tensor, pipeline, data) parallel grid.
//! Coordinates are constructed explicitly at startup and passed by reference
//! into every component that needs them; there is no process-global state.

use crate::collective::ProcessGroup;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sizes of the three parallelism axes.
///
/// The product of the three sizes is the total world size. Global ranks are
/// laid out model-parallel-contiguous: all tensor/pipeline peers of a worker
/// occupy a consecutive rank range, and data-parallel replicas are strided by
/// `model_parallel_size()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridTopology {
    /// Tensor-model-parallel size
    pub tensor_parallel: usize,

    /// Pipeline-model-parallel size
    pub pipeline_parallel: usize,

    /// Data-parallel size
    pub data_parallel: usize,
}

impl GridTopology {
    /// Create a validated topology. All axis sizes must be at least 1.
    pub fn new(tensor_parallel: usize, pipeline_parallel: usize, data_parallel: usize) -> Result<Self> {
        if tensor_parallel == 0 || pipeline_parallel == 0 || data_parallel == 0 {
            return Err(Error::InvalidTopology {
                message: format!(
                    "axis sizes must be >= 1, got tp={} pp={} dp={}",
                    tensor_parallel, pipeline_parallel, data_parallel
                ),
            });
        }
        Ok(Self {
            tensor_parallel,
            pipeline_parallel,
            data_parallel,
        })
    }

    /// Topology for a single process with no parallelism.
    pub fn single() -> Self {
        Self {
            tensor_parallel: 1,
            pipeline_parallel: 1,
            data_parallel: 1,
        }
    }

    /// Total number of workers in the grid.
    pub fn world_size(&self) -> usize {
        self.tensor_parallel * self.pipeline_parallel * self.data_parallel
    }

    /// Number of workers forming one logical model replica (tp * pp).
    pub fn model_parallel_size(&self) -> usize {
        self.tensor_parallel * self.pipeline_parallel
    }

    /// True if the model is split across multiple workers.
    pub fn is_model_parallel(&self) -> bool {
        self.model_parallel_size() > 1
    }

    /// Number of peers in the given process group.
    pub fn group_size(&self, group: ProcessGroup) -> usize {
        match group {
            ProcessGroup::World => self.world_size(),
            ProcessGroup::ModelParallel => self.model_parallel_size(),
            ProcessGroup::DataParallel => self.data_parallel,
            ProcessGroup::TensorParallel => self.tensor_parallel,
            ProcessGroup::PipelineParallel => self.pipeline_parallel,
        }
    }
}

impl fmt::Display for GridTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tp={} pp={} dp={}",
            self.tensor_parallel, self.pipeline_parallel, self.data_parallel
        )
    }
}

/// A worker's immutable position in the parallelism grid.
///
/// Invariant: each rank is strictly less than the corresponding axis size.
/// Set once at process startup, read-only afterward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCoordinate {
    /// Grid shape this coordinate lives in
    pub topology: GridTopology,

    /// Rank along the tensor-parallel axis
    pub tensor_parallel_rank: usize,

    /// Rank along the pipeline-parallel axis
    pub pipeline_parallel_rank: usize,

    /// Rank along the data-parallel axis
    pub data_parallel_rank: usize,
}

impl WorkerCoordinate {
    /// Create a validated coordinate.
    pub fn new(
        topology: GridTopology,
        tensor_parallel_rank: usize,
        pipeline_parallel_rank: usize,
        data_parallel_rank: usize,
    ) -> Result<Self> {
        if tensor_parallel_rank >= topology.tensor_parallel
            || pipeline_parallel_rank >= topology.pipeline_parallel
            || data_parallel_rank >= topology.data_parallel
        {
            return Err(Error::InvalidTopology {
                message: format!(
                    "rank out of range: tp={}/{} pp={}/{} dp={}/{}",
                    tensor_parallel_rank,
                    topology.tensor_parallel,
                    pipeline_parallel_rank,
                    topology.pipeline_parallel,
                    data_parallel_rank,
                    topology.data_parallel
                ),
            });
        }
        Ok(Self {
            topology,
            tensor_parallel_rank,
            pipeline_parallel_rank,
            data_parallel_rank,
        })
    }

    /// Coordinate for a single-process run.
    pub fn single() -> Self {
        Self {
            topology: GridTopology::single(),
            tensor_parallel_rank: 0,
            pipeline_parallel_rank: 0,
            data_parallel_rank: 0,
        }
    }

    /// Derive the coordinate of the worker at `global_rank`.
    pub fn from_global_rank(topology: GridTopology, global_rank: usize) -> Result<Self> {
        if global_rank >= topology.world_size() {
            return Err(Error::InvalidTopology {
                message: format!(
                    "global rank {} out of range for world size {}",
                    global_rank,
                    topology.world_size()
                ),
            });
        }
        let mp = topology.model_parallel_size();
        let data_parallel_rank = global_rank / mp;
        let within_replica = global_rank % mp;
        let pipeline_parallel_rank = within_replica / topology.tensor_parallel;
        let tensor_parallel_rank = within_replica % topology.tensor_parallel;
        Self::new(
            topology,
            tensor_parallel_rank,
            pipeline_parallel_rank,
            data_parallel_rank,
        )
    }

    /// This worker's global rank under the model-parallel-contiguous layout.
    pub fn global_rank(&self) -> usize {
        self.data_parallel_rank * self.topology.model_parallel_size()
            + self.pipeline_parallel_rank * self.topology.tensor_parallel
            + self.tensor_parallel_rank
    }

    /// True if this worker writes the shard for its checkpoint partition
    /// (data-parallel replicas hold numerically identical weights, so only
    /// data-parallel rank 0 persists them).
    pub fn is_partition_writer(&self) -> bool {
        self.data_parallel_rank == 0
    }

    /// True if this worker is the single global merge leader.
    pub fn is_global_leader(&self) -> bool {
        self.tensor_parallel_rank == 0 && self.data_parallel_rank == 0
    }

    /// Index identifying which concrete subgroup of `group` this worker
    /// belongs to. Workers share a subgroup iff they share this index.
    pub fn group_index(&self, group: ProcessGroup) -> usize {
        let t = self.topology.tensor_parallel;
        let p = self.topology.pipeline_parallel;
        match group {
            ProcessGroup::World => 0,
            // One model-parallel group per data-parallel replica.
            ProcessGroup::ModelParallel => self.data_parallel_rank,
            // One data-parallel group per (tp, pp) position.
            ProcessGroup::DataParallel => {
                self.pipeline_parallel_rank * t + self.tensor_parallel_rank
            }
            // One tensor-parallel group per (pp, dp) position.
            ProcessGroup::TensorParallel => {
                self.data_parallel_rank * p + self.pipeline_parallel_rank
            }
            // One pipeline-parallel group per (tp, dp) position.
            ProcessGroup::PipelineParallel => {
                self.data_parallel_rank * t + self.tensor_parallel_rank
            }
        }
    }

    /// Number of peers in this worker's subgroup of `group`.
    pub fn group_size(&self, group: ProcessGroup) -> usize {
        self.topology.group_size(group)
    }
}

impl fmt::Display for WorkerCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tp_rank={} pp_rank={} dp_rank={} ({})",
            self.tensor_parallel_rank,
            self.pipeline_parallel_rank,
            self.data_parallel_rank,
            self.topology
        )
    }
}
