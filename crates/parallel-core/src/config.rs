//! Configuration types for the model-parallel training utilities

use crate::topology::GridTopology;
use serde::{Deserialize, Serialize};

/// Top-level configuration for a model-parallel training job
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GridConfig {
    /// Parallelism grid shape
    pub topology: TopologyConfig,

    /// Loss-scale controller settings
    pub precision: PrecisionConfig,

    /// Checkpoint writer settings
    pub checkpoint: CheckpointConfig,

    /// Batch fetch settings
    pub fetch: FetchConfig,
}

/// Parallelism axis sizes as configured by the launcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Tensor-model-parallel size
    pub tensor_parallel: usize,

    /// Pipeline-model-parallel size
    pub pipeline_parallel: usize,

    /// Data-parallel size
    pub data_parallel: usize,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            tensor_parallel: 1,
            pipeline_parallel: 1,
            data_parallel: 1,
        }
    }
}

impl TopologyConfig {
    /// Build a validated topology from the configured sizes.
    pub fn build(&self) -> crate::Result<GridTopology> {
        GridTopology::new(self.tensor_parallel, self.pipeline_parallel, self.data_parallel)
    }
}

/// Loss-scale controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecisionConfig {
    /// Whether dynamic loss scaling is enabled
    pub enabled: bool,

    /// Initial loss scale
    pub init_scale: f64,

    /// Multiplier applied after `growth_interval` clean iterations
    pub growth_factor: f64,

    /// Multiplier applied after an overflow iteration
    pub backoff_factor: f64,

    /// Number of consecutive clean iterations before the scale grows
    pub growth_interval: u32,
}

impl Default for PrecisionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            init_scale: 65536.0, // 2^16
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
        }
    }
}

/// Checkpoint writer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Base filename for per-rank weight shards
    pub weights_filename: String,

    /// Filename for the packaged model configuration
    pub config_filename: String,

    /// Save a packaged checkpoint every N steps (0 disables periodic saves)
    pub save_interval_steps: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            weights_filename: "model_weights.ckpt".to_string(),
            config_filename: "model_config.yaml".to_string(),
            save_interval_steps: 1000,
        }
    }
}

/// Batch fetch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Number of micro-batches fetched per global batch
    pub micro_batches: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self { micro_batches: 1 }
    }
}
