//! The training-step driver
//!
//! Glues the fetch -> forward/backward -> gated step -> scale update ->
//! periodic checkpoint sequence together. The driver owns the sequencing
//! only; all decisions live in the strategy objects.

use crate::fetcher::{BatchSource, GlobalBatch, GlobalBatchFetcher};
use crate::precision_strategy::PrecisionStrategy;
use crate::strategy::DistributedStrategy;
use async_trait::async_trait;
use checkpoint::{ModelSnapshot, PartitionedWriter};
use parallel_core::Result;
use precision::{Optimizer, OverflowReport};
use std::path::PathBuf;
use tracing::{debug, info};

/// User-supplied training module: the model, its optimizer, and the
/// forward/backward computation.
#[async_trait]
pub trait TrainModule: Send {
    /// Micro-batch item type.
    type Batch: Send + Sync;

    /// Optimizer type gated by the precision strategy.
    type Opt: Optimizer + Send;

    /// Run forward and backward over one global batch at the given loss
    /// scale, reporting any inf/NaN observed in the gradients.
    async fn forward_backward(
        &mut self,
        batch: &GlobalBatch<Self::Batch>,
        loss_scale: f64,
    ) -> Result<OverflowReport>;

    /// The optimizer to step this iteration.
    fn optimizer(&mut self) -> &mut Self::Opt;

    /// Snapshot of this worker's model state for checkpointing.
    fn snapshot(&self) -> Result<ModelSnapshot>;
}

/// Counters reported after a training run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrainSummary {
    /// Global batches processed
    pub steps: u64,

    /// Steps skipped by the overflow gate
    pub skipped_steps: u64,

    /// Packaged/saved checkpoints this worker participated in
    pub checkpoints_saved: u64,
}

/// Step driver over pluggable strategies.
pub struct StepDriver<D, P> {
    distributed: D,
    precision: P,
    fetcher: GlobalBatchFetcher,
    writer: PartitionedWriter,
    save_interval_steps: u64,
    archive_path: PathBuf,
}

impl<D, P> StepDriver<D, P>
where
    D: DistributedStrategy,
    P: PrecisionStrategy,
{
    /// Assemble a driver from its strategies.
    pub fn new(
        distributed: D,
        precision: P,
        fetcher: GlobalBatchFetcher,
        writer: PartitionedWriter,
        save_interval_steps: u64,
        archive_path: PathBuf,
    ) -> Self {
        Self {
            distributed,
            precision,
            fetcher,
            writer,
            save_interval_steps,
            archive_path,
        }
    }

    /// The distributed strategy in use.
    pub fn distributed(&self) -> &D {
        &self.distributed
    }

    /// Drive training until the batch source is exhausted.
    pub async fn fit<M, S>(&mut self, module: &mut M, source: &mut S) -> Result<TrainSummary>
    where
        M: TrainModule,
        S: BatchSource<Batch = M::Batch>,
        <M::Opt as Optimizer>::Output: Send,
    {
        self.distributed.setup().await?;
        let ctx = self.distributed.context().clone();
        info!(
            coordinate = %ctx.coordinate(),
            micro_batches = self.fetcher.micro_batches(),
            "Starting training run"
        );

        let mut summary = TrainSummary::default();

        while let Some(batch) = self.fetcher.fetch(source).await? {
            let report = module
                .forward_backward(&batch, self.precision.loss_scale())
                .await?;

            let stepped = self
                .precision
                .step(module.optimizer(), report, &ctx)
                .await?;
            if stepped.is_none() {
                summary.skipped_steps += 1;
            }
            self.precision.finish_iteration(&ctx).await?;

            summary.steps += 1;
            debug!(step = summary.steps, skipped = stepped.is_none(), "Completed step");

            if self.save_interval_steps > 0 && summary.steps % self.save_interval_steps == 0 {
                let snapshot = module.snapshot()?;
                self.writer
                    .save(&snapshot, &ctx, &self.archive_path)
                    .await?;
                summary.checkpoints_saved += 1;
            }
        }

        info!(
            steps = summary.steps,
            skipped = summary.skipped_steps,
            checkpoints = summary.checkpoints_saved,
            "Training run finished"
        );
        Ok(summary)
    }
}
