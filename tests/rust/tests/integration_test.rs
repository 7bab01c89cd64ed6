use anyhow::Result;
use bytes::Bytes;
use checkpoint::{Artifact, ModelSnapshot, PartitionedWriter, SaveOutcome};
use parallel_core::{
    Collective, GridConfig, GridContext, ProcessGroup, SimGrid, TopologyConfig,
};
use trainer::{DistributedStrategy, ModelParallelStrategy, SamplerConfig};

// Helper to build an attached context for one worker of a simulated grid
fn attached_context(grid: &SimGrid, global_rank: usize) -> Result<GridContext> {
    let worker = grid.worker(global_rank)?;
    let coordinate = worker.coordinate().expect("sim worker has a coordinate");
    Ok(GridContext::attach(coordinate, worker)?)
}

#[tokio::test]
async fn test_config_drives_topology_and_strategy() -> Result<()> {
    // 1. Parse a job config
    let json = r#"{
        "topology": { "tensor_parallel": 2, "pipeline_parallel": 1, "data_parallel": 2 },
        "precision": {
            "enabled": true,
            "init_scale": 4096.0,
            "growth_factor": 2.0,
            "backoff_factor": 0.5,
            "growth_interval": 1000
        },
        "checkpoint": {
            "weights_filename": "model_weights.ckpt",
            "config_filename": "model_config.yaml",
            "save_interval_steps": 500
        },
        "fetch": { "micro_batches": 4 }
    }"#;
    let config: GridConfig = serde_json::from_str(json)?;
    let topology = config.topology.build()?;
    assert_eq!(topology.world_size(), 4);

    // 2. Stand up the grid and set up a strategy on the last worker
    let grid = SimGrid::new(topology);
    let ctx = attached_context(&grid, 3)?;
    let mut strategy = ModelParallelStrategy::new(ctx);
    strategy.setup().await?;

    // 3. The data slice spans the data-parallel axis, not global ranks
    assert_eq!(
        strategy.sampler_config(),
        SamplerConfig {
            num_replicas: 2,
            rank: 1
        }
    );
    assert!(!strategy.sync_grads_each_step());
    assert_eq!(strategy.grad_sync_group(), ProcessGroup::DataParallel);
    Ok(())
}

#[tokio::test]
async fn test_topology_config_rejects_zero_axis() {
    let config = TopologyConfig {
        tensor_parallel: 2,
        pipeline_parallel: 0,
        data_parallel: 1,
    };
    assert!(config.build().is_err());
}

#[tokio::test]
async fn test_saved_archive_restores_on_every_rank() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let dest = dir.path().join("model.tar");
    let grid = SimGrid::new(
        TopologyConfig {
            tensor_parallel: 2,
            pipeline_parallel: 1,
            data_parallel: 1,
        }
        .build()?,
    );

    let mut handles = Vec::new();
    for rank in 0..2 {
        let ctx = attached_context(&grid, rank)?;
        let dest = dest.clone();
        handles.push(tokio::spawn(async move {
            let writer = PartitionedWriter::default();
            let mut snapshot = ModelSnapshot::new(
                Bytes::from(format!("rank-{}-weights", rank)),
                "tokenizer:\n  model: /data/spm.model\n",
            );
            snapshot.artifacts.push(Artifact::referenced(
                "spm.model",
                Bytes::from_static(b"vocab"),
                "/data/spm.model",
            ));
            writer.save(&snapshot, &ctx, &dest).await.unwrap()
        }));
    }
    for handle in handles {
        assert!(!matches!(handle.await?, SaveOutcome::Skipped { .. }));
    }

    // Every rank restores its own shard and the repackaged config
    for rank in 0..2 {
        let ctx = attached_context(&grid, rank)?;
        let writer = PartitionedWriter::default();
        let scratch = dir.path().join(format!("restore-{}", rank));
        let loaded = writer.load(&dest, &ctx, &scratch).await?;
        assert_eq!(loaded.weights, Bytes::from(format!("rank-{}-weights", rank)));
        assert_eq!(loaded.config_text, "tokenizer:\n  model: spm.model\n");
    }
    Ok(())
}
