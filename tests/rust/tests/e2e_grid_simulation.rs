//! End-to-end simulation of a model-parallel grid in one process
//!
//! Spawns every worker of a simulated grid as a task and drives the real
//! loss-scale and checkpoint protocols across them: partitioned saves with a
//! single packaging leader, the pipeline-parallel skip contract, and
//! scale consistency inside each model-parallel group.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use checkpoint::{archive, ModelSnapshot, PartitionedWriter, SaveOutcome};
use parallel_core::{
    Collective, FetchConfig, GridContext, GridTopology, PrecisionConfig, SimGrid,
    WorkerCoordinate,
};
use precision::{LossScaler, Optimizer, OverflowReport};
use std::path::Path;
use trainer::{
    BatchSource, GlobalBatch, GlobalBatchFetcher, MixedPrecision, ModelParallelStrategy,
    StepDriver, TrainModule, TrainSummary,
};

struct CountingOptimizer {
    steps: u64,
}

impl Optimizer for CountingOptimizer {
    type Output = u64;

    fn step(&mut self) -> u64 {
        self.steps += 1;
        self.steps
    }
}

fn worker_context(grid: &SimGrid, global_rank: usize) -> Result<GridContext> {
    let worker = grid.worker(global_rank)?;
    let coordinate = worker.coordinate().expect("sim worker has a coordinate");
    Ok(GridContext::attach(coordinate, worker)?)
}

fn shard_snapshot(tp_rank: usize) -> ModelSnapshot {
    ModelSnapshot::new(
        Bytes::from(format!("shard-for-tp-rank-{}", tp_rank)),
        "model:\n  hidden: 128\n",
    )
}

#[tokio::test]
async fn test_2x2_grid_save_packages_exactly_two_partitions() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let dest = dir.path().join("model.tar");
    let grid = SimGrid::new(GridTopology::new(2, 1, 2)?);

    let mut handles = Vec::new();
    for rank in 0..4 {
        let ctx = worker_context(&grid, rank)?;
        let dest = dest.clone();
        handles.push(tokio::spawn(async move {
            let writer = PartitionedWriter::default();
            let tp_rank = ctx.coordinate().tensor_parallel_rank;
            writer.save(&shard_snapshot(tp_rank), &ctx, &dest).await
        }));
    }

    let mut packaged = 0;
    let mut shard_only = 0;
    let mut no_action = 0;
    for handle in handles {
        match handle.await?? {
            SaveOutcome::Packaged { shard_count, .. } => {
                assert_eq!(shard_count, 2);
                packaged += 1;
            }
            SaveOutcome::ShardOnly { .. } => shard_only += 1,
            SaveOutcome::NoAction => no_action += 1,
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
    // Exactly one leader packages, one other data-parallel-rank-0 worker
    // writes a shard, and the two redundant replicas write nothing.
    assert_eq!((packaged, shard_only, no_action), (1, 1, 2));

    // The archive holds exactly the two partition directories plus config,
    // and each shard is byte-identical to its worker's snapshot.
    let out = tempfile::tempdir()?;
    archive::unpack(&dest, out.path()).await?;

    let mut entries: Vec<String> = std::fs::read_dir(out.path())?
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    entries.sort();
    assert_eq!(entries, vec!["model_config.yaml", "mp_rank_00", "mp_rank_01"]);

    for tp_rank in 0..2 {
        let restored = std::fs::read(
            out.path()
                .join(format!("mp_rank_{:02}", tp_rank))
                .join("model_weights.ckpt"),
        )?;
        assert_eq!(restored, shard_snapshot(tp_rank).weights);
    }
    Ok(())
}

#[tokio::test]
async fn test_pipeline_parallel_save_is_observably_skipped() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let dest = dir.path().join("model.tar");
    let grid = SimGrid::new(GridTopology::new(2, 2, 1)?);

    for rank in 0..4 {
        let ctx = worker_context(&grid, rank)?;
        let writer = PartitionedWriter::default();
        let outcome = writer.save(&shard_snapshot(0), &ctx, &dest).await?;
        assert!(matches!(outcome, SaveOutcome::Skipped { .. }));
    }

    assert!(!dest.exists(), "no partial or corrupt archive may exist");
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_overflow_decision_stays_inside_the_model_parallel_group() -> Result<()> {
    // 2 tensor-parallel ranks x 2 data-parallel replicas. Global rank 1
    // (replica 0) overflows; replica 0 must skip and back off in lockstep
    // while replica 1 steps and keeps its scale.
    let grid = SimGrid::new(GridTopology::new(2, 1, 2)?);

    let mut handles = Vec::new();
    for rank in 0..4 {
        let ctx = worker_context(&grid, rank)?;
        handles.push(tokio::spawn(async move {
            let mut scaler = LossScaler::new(&PrecisionConfig {
                init_scale: 1024.0,
                ..Default::default()
            })
            .unwrap();
            let mut optimizer = CountingOptimizer { steps: 0 };

            let stepped = scaler
                .maybe_step(&mut optimizer, OverflowReport::single(rank == 1), &ctx)
                .await
                .unwrap();
            scaler.update(None, &ctx).await.unwrap();
            (rank, stepped.is_some(), scaler.scale())
        }));
    }

    for handle in handles {
        let (rank, stepped, scale) = handle.await?;
        if rank < 2 {
            assert!(!stepped, "replica 0 worker {} must skip", rank);
            assert_eq!(scale, 512.0);
        } else {
            assert!(stepped, "replica 1 worker {} must step", rank);
            assert_eq!(scale, 1024.0);
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_scale_stays_identical_over_many_iterations() -> Result<()> {
    // Random-ish overflow pattern, identical across data-parallel replicas
    // (as real replicated gradients would be). After every iteration all
    // four workers must report the same scale.
    let grid = SimGrid::new(GridTopology::new(2, 1, 2)?);
    let overflow_iterations = [2u64, 5, 6];

    let mut handles = Vec::new();
    for rank in 0..4 {
        let ctx = worker_context(&grid, rank)?;
        handles.push(tokio::spawn(async move {
            let mut scaler = LossScaler::new(&PrecisionConfig {
                init_scale: 1024.0,
                growth_interval: 3,
                ..Default::default()
            })
            .unwrap();
            let mut optimizer = CountingOptimizer { steps: 0 };
            let mut scales = Vec::new();

            for iteration in 1..=8u64 {
                // Only the tp-rank-0 worker of each replica "sees" the inf;
                // the reduction must spread it to its tp peer.
                let local_inf = overflow_iterations.contains(&iteration)
                    && ctx.coordinate().tensor_parallel_rank == 0;
                scaler
                    .maybe_step(&mut optimizer, OverflowReport::single(local_inf), &ctx)
                    .await
                    .unwrap();
                scaler.update(None, &ctx).await.unwrap();
                scales.push(scaler.scale());
            }
            scales
        }));
    }

    let mut all_scales = Vec::new();
    for handle in handles {
        all_scales.push(handle.await?);
    }
    for scales in &all_scales[1..] {
        assert_eq!(scales, &all_scales[0]);
    }
    Ok(())
}

#[tokio::test]
async fn test_attach_rejects_mismatched_coordinate() -> Result<()> {
    let grid = SimGrid::new(GridTopology::new(2, 1, 1)?);
    let worker = grid.worker(1)?;

    let wrong = WorkerCoordinate::new(GridTopology::new(2, 1, 1)?, 0, 0, 0)?;
    let err = GridContext::attach(wrong, worker).unwrap_err();
    assert!(matches!(err, parallel_core::Error::TopologyMismatch { .. }));
    Ok(())
}

struct VecSource {
    items: Vec<u32>,
}

#[async_trait]
impl BatchSource for VecSource {
    type Batch = u32;

    async fn next_batch(&mut self) -> Option<u32> {
        if self.items.is_empty() {
            None
        } else {
            Some(self.items.remove(0))
        }
    }
}

/// Training module for one tensor-parallel worker; rank 0 observes an
/// overflow on a chosen iteration.
struct ShardedModule {
    tp_rank: usize,
    optimizer: CountingOptimizer,
    iterations: u64,
    overflow_on: Option<u64>,
}

#[async_trait]
impl TrainModule for ShardedModule {
    type Batch = u32;
    type Opt = CountingOptimizer;

    async fn forward_backward(
        &mut self,
        _batch: &GlobalBatch<u32>,
        _loss_scale: f64,
    ) -> parallel_core::Result<OverflowReport> {
        self.iterations += 1;
        Ok(OverflowReport::single(
            self.tp_rank == 0 && self.overflow_on == Some(self.iterations),
        ))
    }

    fn optimizer(&mut self) -> &mut CountingOptimizer {
        &mut self.optimizer
    }

    fn snapshot(&self) -> parallel_core::Result<ModelSnapshot> {
        Ok(ModelSnapshot::new(
            Bytes::from(format!("rank{}-iter{}", self.tp_rank, self.iterations)),
            "model:\n  hidden: 128\n",
        ))
    }
}

#[tokio::test]
async fn test_step_driver_end_to_end_over_two_workers() -> Result<()> {
    // Two tensor-parallel workers drive identical step sequences against the
    // same archive destination. The overflow seen only by rank 0 must skip
    // the step on both, and both must participate in every periodic save.
    let dir = tempfile::tempdir()?;
    let dest = dir.path().join("model.tar");
    let grid = SimGrid::new(GridTopology::new(2, 1, 1)?);

    let mut handles = Vec::new();
    for rank in 0..2 {
        let ctx = worker_context(&grid, rank)?;
        let dest = dest.clone();
        handles.push(tokio::spawn(async move {
            let mut driver = StepDriver::new(
                ModelParallelStrategy::new(ctx),
                MixedPrecision::new(&PrecisionConfig {
                    init_scale: 1024.0,
                    ..Default::default()
                })
                .unwrap(),
                GlobalBatchFetcher::new(&FetchConfig { micro_batches: 2 }).unwrap(),
                PartitionedWriter::default(),
                2,
                dest,
            );
            let mut module = ShardedModule {
                tp_rank: rank,
                optimizer: CountingOptimizer { steps: 0 },
                iterations: 0,
                overflow_on: Some(3),
            };
            let mut source = VecSource {
                items: (0..8).collect(),
            };
            let summary = driver.fit(&mut module, &mut source).await.unwrap();
            (summary, module.optimizer.steps)
        }));
    }

    for handle in handles {
        let (summary, optimizer_steps) = handle.await?;
        assert_eq!(
            summary,
            TrainSummary {
                steps: 4,
                skipped_steps: 1,
                checkpoints_saved: 2,
            }
        );
        assert_eq!(optimizer_steps, 3);
    }

    // The final archive holds each rank's shard from the last iteration.
    let out = tempfile::tempdir()?;
    archive::unpack(&dest, out.path()).await?;
    for rank in 0..2 {
        let shard = std::fs::read(
            out.path()
                .join(format!("mp_rank_{:02}", rank))
                .join("model_weights.ckpt"),
        )?;
        assert_eq!(shard, format!("rank{}-iter4", rank).into_bytes());
    }
    Ok(())
}

#[tokio::test]
async fn test_single_file_fallback_round_trip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let dest = dir.path().join("model.ckpt");
    let ctx = GridContext::single_process();
    let writer = PartitionedWriter::default();

    let snapshot = shard_snapshot(0);
    let outcome = writer.save(&snapshot, &ctx, &dest).await?;
    assert!(matches!(outcome, SaveOutcome::SingleFile { .. }));

    let loaded = writer.load(&dest, &ctx, Path::new("/nonexistent")).await?;
    assert_eq!(loaded.weights, snapshot.weights);
    assert_eq!(loaded.config_text, snapshot.config_text);
    Ok(())
}
