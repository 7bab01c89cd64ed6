//! Distributed strategy: grid setup and model-parallel-aware decisions
//!
//! Under model parallelism the workers sharing a model replica form one
//! "logical GPU": data-parallel groups are non-trivial, every member of a
//! replica must receive the same batch, and gradients sync across the
//! data-parallel group only.

use async_trait::async_trait;
use checkpoint::layout::inject_model_parallel_rank;
use parallel_core::{Error, GridContext, ProcessGroup, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Distributed-sampler parameters for this worker.
///
/// Replicas of one logical model all consume the same data slice, so the
/// sampler is parameterized by the data-parallel axis, not global rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Number of data-parallel replicas
    pub num_replicas: usize,

    /// This worker's data-parallel rank
    pub rank: usize,
}

/// Capability interface for the distributed side of a training job.
#[async_trait]
pub trait DistributedStrategy: Send + Sync {
    /// Grid context for this worker.
    fn context(&self) -> &GridContext;

    /// Validate the parallel runtime before training starts.
    async fn setup(&mut self) -> Result<()>;

    /// Sampler parameters for this worker's data slice.
    fn sampler_config(&self) -> SamplerConfig;

    /// Whether gradients synchronize automatically every backward pass.
    fn sync_grads_each_step(&self) -> bool {
        true
    }

    /// Process group gradients reduce over.
    fn grad_sync_group(&self) -> ProcessGroup {
        ProcessGroup::World
    }

    /// Rewrite a per-rank trainer checkpoint path for this worker.
    fn checkpoint_path(&self, path: &Path) -> PathBuf {
        path.to_path_buf()
    }

    /// Remove this worker's per-rank trainer checkpoint.
    async fn remove_checkpoint(&self, path: &Path) -> Result<()> {
        let path = self.checkpoint_path(path);
        info!(path = %path.display(), "Removing checkpoint");
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Strategy for jobs running on a (possibly trivial) model-parallel grid.
#[derive(Debug, Clone)]
pub struct ModelParallelStrategy {
    ctx: GridContext,
}

impl ModelParallelStrategy {
    /// Strategy over the given grid context.
    pub fn new(ctx: GridContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl DistributedStrategy for ModelParallelStrategy {
    fn context(&self) -> &GridContext {
        &self.ctx
    }

    /// Fail fast if a model-parallel grid is configured without an
    /// initialized collective runtime, and re-check that the runtime's view
    /// of this worker's position matches the precomputed coordinate.
    async fn setup(&mut self) -> Result<()> {
        if self.ctx.requires_collective() {
            let collective = self.ctx.collective("model-parallel setup")?;
            if !collective.is_initialized() {
                return Err(Error::ParallelRuntimeUnavailable {
                    operation: "model-parallel setup".to_string(),
                });
            }
            if let Some(actual) = collective.coordinate() {
                if actual != *self.ctx.coordinate() {
                    return Err(Error::TopologyMismatch {
                        expected: self.ctx.coordinate().to_string(),
                        actual: actual.to_string(),
                    });
                }
            }
            info!(coordinate = %self.ctx.coordinate(), "Configured grad sync for model parallelism");
        }
        Ok(())
    }

    fn sampler_config(&self) -> SamplerConfig {
        let coord = self.ctx.coordinate();
        SamplerConfig {
            num_replicas: coord.topology.data_parallel,
            rank: coord.data_parallel_rank,
        }
    }

    /// Deferred under model parallelism so activation-recomputation backward
    /// passes do not trigger redundant reductions.
    fn sync_grads_each_step(&self) -> bool {
        !self.ctx.coordinate().topology.is_model_parallel()
    }

    fn grad_sync_group(&self) -> ProcessGroup {
        ProcessGroup::DataParallel
    }

    fn checkpoint_path(&self, path: &Path) -> PathBuf {
        inject_model_parallel_rank(path, self.ctx.coordinate())
    }
}
