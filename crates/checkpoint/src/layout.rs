//! Checkpoint file naming and path conventions
//!
//! Shard files written before the merge are named
//! `mp_rank_<NN>_<weights_filename>`; inside the packaged archive each shard
//! lives at `mp_rank_<NN>/<weights_filename>` next to the model config.

use parallel_core::{CheckpointConfig, WorkerCoordinate};
use std::path::{Path, PathBuf};

/// Filename conventions for a packaged checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointLayout {
    /// Base filename for model weights
    pub weights_filename: String,

    /// Filename for the model configuration at the archive root
    pub config_filename: String,
}

impl Default for CheckpointLayout {
    fn default() -> Self {
        Self {
            weights_filename: "model_weights.ckpt".to_string(),
            config_filename: "model_config.yaml".to_string(),
        }
    }
}

impl CheckpointLayout {
    /// Layout from checkpoint configuration.
    pub fn from_config(config: &CheckpointConfig) -> Self {
        Self {
            weights_filename: config.weights_filename.clone(),
            config_filename: config.config_filename.clone(),
        }
    }

    /// Pre-merge shard filename for a tensor-parallel rank, written into the
    /// shared destination directory.
    pub fn shard_filename(&self, tensor_parallel_rank: usize) -> String {
        format!("mp_rank_{:02}_{}", tensor_parallel_rank, self.weights_filename)
    }

    /// Per-rank subdirectory name inside the packaged archive.
    pub fn partition_dirname(tensor_parallel_rank: usize) -> String {
        format!("mp_rank_{:02}", tensor_parallel_rank)
    }

    /// Archive-relative path of a rank's weights file.
    pub fn shard_archive_path(&self, tensor_parallel_rank: usize) -> PathBuf {
        PathBuf::from(Self::partition_dirname(tensor_parallel_rank)).join(&self.weights_filename)
    }
}

/// Rewrite a per-rank trainer checkpoint path to include the worker's
/// model-parallel position.
///
/// For a trivial grid the path is returned unchanged. With a single pipeline
/// stage the rank directory is `mp_rank_<NN>`; with multiple stages it is
/// `tp_rank_<NN>_pp_rank_<NNN>`.
pub fn inject_model_parallel_rank(path: &Path, coordinate: &WorkerCoordinate) -> PathBuf {
    if !coordinate.topology.is_model_parallel() {
        return path.to_path_buf();
    }

    let dir = path.parent().unwrap_or_else(|| Path::new(""));
    let name = path.file_name().map(PathBuf::from).unwrap_or_default();

    let rank_dir = if coordinate.topology.pipeline_parallel == 1 {
        CheckpointLayout::partition_dirname(coordinate.tensor_parallel_rank)
    } else {
        format!(
            "tp_rank_{:02}_pp_rank_{:03}",
            coordinate.tensor_parallel_rank, coordinate.pipeline_parallel_rank
        )
    };

    dir.join(rank_dir).join(name)
}
