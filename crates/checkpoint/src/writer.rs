//! Rank-partitioned checkpoint writer
//!
//! Save protocol for a model-parallel grid with a single pipeline stage:
//! every data-parallel-rank-0 worker writes its shard under a rank-tagged
//! name, all workers synchronize at a barrier, then the global leader moves
//! the shards into per-rank subdirectories, adds the config and artifacts,
//! and packages everything into one archive. Write conflicts are avoided by
//! construction (disjoint filenames per tensor-parallel rank), not locking.

use crate::archive;
use crate::layout::CheckpointLayout;
use crate::snapshot::{LoadedCheckpoint, ModelSnapshot};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parallel_core::{Error, GridContext, ProcessGroup, Result, WorkerCoordinate};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Observable result of a save request on one worker.
#[derive(Debug, Clone)]
pub enum SaveOutcome {
    /// No model-parallel grid; the snapshot went down the plain single-file
    /// path.
    SingleFile { path: PathBuf, size_bytes: u64 },

    /// This worker was the global leader and produced the packaged archive.
    Packaged {
        path: PathBuf,
        size_bytes: u64,
        shard_count: usize,
        created_at: DateTime<Utc>,
    },

    /// This worker wrote its partition's shard; another worker packaged.
    ShardOnly { path: PathBuf },

    /// This worker is a redundant data-parallel replica and wrote nothing.
    NoAction,

    /// The requested configuration is explicitly unsupported; nothing was
    /// written and no partial output exists at the destination.
    Skipped { reason: String },
}

/// Writer that persists model weights exactly once per checkpoint partition.
#[derive(Debug, Clone, Default)]
pub struct PartitionedWriter {
    layout: CheckpointLayout,
}

impl PartitionedWriter {
    /// Writer using the given filename layout.
    pub fn new(layout: CheckpointLayout) -> Self {
        Self { layout }
    }

    /// Filename layout in use.
    pub fn layout(&self) -> &CheckpointLayout {
        &self.layout
    }

    /// Persist `snapshot` for this worker and, on the global leader, package
    /// the merged checkpoint at `destination`.
    ///
    /// With no model-parallel grid the snapshot is written as a plain single
    /// file. Pipeline-parallel packaging is explicitly unsupported: the save
    /// is logged and skipped rather than risking partial output. A shard
    /// missing at merge time is a fatal error surfaced to the caller;
    /// partial-write recovery is an external retry policy's concern.
    pub async fn save(
        &self,
        snapshot: &ModelSnapshot,
        ctx: &GridContext,
        destination: &Path,
    ) -> Result<SaveOutcome> {
        let coordinate = *ctx.coordinate();

        if !coordinate.topology.is_model_parallel() {
            return self.save_single_file(snapshot, destination).await;
        }

        if coordinate.topology.pipeline_parallel > 1 {
            let reason = format!(
                "packaged saves with pipeline_parallel={} are not implemented; \
                 use an external conversion path",
                coordinate.topology.pipeline_parallel
            );
            warn!(coordinate = %coordinate, "{}", reason);
            return Ok(SaveOutcome::Skipped { reason });
        }

        let dir = destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        fs::create_dir_all(&dir).await?;

        // Only data-parallel rank 0 writes; other replicas hold numerically
        // identical weights.
        let mut shard_path = None;
        if coordinate.is_partition_writer() {
            let path = dir.join(self.layout.shard_filename(coordinate.tensor_parallel_rank));
            write_atomic(&path, &snapshot.weights).await?;
            info!(
                path = %path.display(),
                tp_rank = coordinate.tensor_parallel_rank,
                "Wrote checkpoint shard"
            );
            shard_path = Some(path);
        }

        // No worker may proceed to the merge until every partition writer has
        // finished. Without an initialized runtime (single-process test mode)
        // the caller is responsible for all shard files being present.
        if let Some(collective) = ctx.initialized_collective() {
            collective.barrier(ProcessGroup::World).await?;
        }

        if coordinate.is_global_leader() {
            self.merge_and_package(snapshot, &coordinate, &dir, destination)
                .await
        } else if let Some(path) = shard_path {
            Ok(SaveOutcome::ShardOnly { path })
        } else {
            Ok(SaveOutcome::NoAction)
        }
    }

    /// Plain single-file save used when no model-parallel grid is configured.
    async fn save_single_file(
        &self,
        snapshot: &ModelSnapshot,
        destination: &Path,
    ) -> Result<SaveOutcome> {
        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let data = bincode::serialize(snapshot).map_err(|e| Error::Serialization(e.to_string()))?;
        write_atomic(destination, &data).await?;
        info!(path = %destination.display(), size_bytes = data.len(), "Saved single-file checkpoint");
        Ok(SaveOutcome::SingleFile {
            path: destination.to_path_buf(),
            size_bytes: data.len() as u64,
        })
    }

    /// Leader-side merge: move shards into per-rank subdirectories of a
    /// fresh scratch directory, add config and artifacts, package, clean up.
    async fn merge_and_package(
        &self,
        snapshot: &ModelSnapshot,
        coordinate: &WorkerCoordinate,
        dir: &Path,
        destination: &Path,
    ) -> Result<SaveOutcome> {
        let scratch = dir.join(format!(".merge-{}", Uuid::new_v4()));
        fs::create_dir_all(&scratch).await?;

        let result = self
            .stage_and_pack(snapshot, coordinate, dir, destination, &scratch)
            .await;

        // Best-effort scratch removal on both paths; the archive (or the
        // error) is already final.
        if let Err(e) = fs::remove_dir_all(&scratch).await {
            warn!(scratch = %scratch.display(), error = %e, "Failed to remove merge scratch directory");
        }

        result
    }

    async fn stage_and_pack(
        &self,
        snapshot: &ModelSnapshot,
        coordinate: &WorkerCoordinate,
        dir: &Path,
        destination: &Path,
        scratch: &Path,
    ) -> Result<SaveOutcome> {
        let shard_count = coordinate.topology.tensor_parallel;

        for tp_rank in 0..shard_count {
            let partition_dir = scratch.join(CheckpointLayout::partition_dirname(tp_rank));
            fs::create_dir_all(&partition_dir).await?;

            let source = dir.join(self.layout.shard_filename(tp_rank));
            let target = partition_dir.join(&self.layout.weights_filename);
            match fs::rename(&source, &target).await {
                Ok(()) => {
                    debug!(from = %source.display(), to = %target.display(), "Staged shard");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(Error::ShardMissing {
                        path: source.display().to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        let config_path = scratch.join(&self.layout.config_filename);
        fs::write(&config_path, snapshot.packaged_config_text()).await?;

        for artifact in &snapshot.artifacts {
            fs::write(scratch.join(&artifact.name), &artifact.data).await?;
        }

        let size_bytes = archive::pack_dir(scratch, destination).await?;
        let created_at = Utc::now();
        info!(
            path = %destination.display(),
            size_bytes,
            shard_count,
            "Packaged merged checkpoint"
        );

        Ok(SaveOutcome::Packaged {
            path: destination.to_path_buf(),
            size_bytes,
            shard_count,
            created_at,
        })
    }

    /// Restore this worker's view of a checkpoint.
    ///
    /// For a trivial grid the plain single-file snapshot is decoded. For a
    /// model-parallel grid the archive is extracted into `scratch` and this
    /// worker's `mp_rank_<NN>` shard is read alongside the config.
    pub async fn load(
        &self,
        source: &Path,
        ctx: &GridContext,
        scratch: &Path,
    ) -> Result<LoadedCheckpoint> {
        let coordinate = ctx.coordinate();

        if !coordinate.topology.is_model_parallel() {
            let data = match fs::read(source).await {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(Error::CheckpointNotFound {
                        path: source.display().to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            };
            let snapshot: ModelSnapshot =
                bincode::deserialize(&data).map_err(|e| Error::Serialization(e.to_string()))?;
            return Ok(LoadedCheckpoint {
                config_text: snapshot.config_text,
                weights: snapshot.weights,
            });
        }

        if coordinate.topology.pipeline_parallel > 1 {
            return Err(Error::UnsupportedConfiguration {
                feature: "pipeline-parallel checkpoint restore".to_string(),
                detail: format!(
                    "pipeline_parallel={} archives are not produced by this writer",
                    coordinate.topology.pipeline_parallel
                ),
            });
        }

        archive::unpack(source, scratch).await?;

        let config_text = fs::read_to_string(scratch.join(&self.layout.config_filename)).await?;
        let shard_path = scratch.join(
            self.layout
                .shard_archive_path(coordinate.tensor_parallel_rank),
        );
        let weights = match fs::read(&shard_path).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ShardMissing {
                    path: shard_path.display().to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        Ok(LoadedCheckpoint {
            config_text,
            weights,
        })
    }
}

/// Atomic write: temp sibling file, fsync, rename.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let temp_path = path.with_file_name(format!(
        ".{}.{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy(),
        Uuid::new_v4()
    ));

    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&temp_path, path).await?;
    Ok(())
}
