//! Tar packaging for merged checkpoint directories
//!
//! Archives are written to a temporary sibling file and renamed into place so
//! a crash mid-package never leaves a partial archive at the destination.

use parallel_core::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Package the contents of `dir` into a single tar archive at `destination`.
///
/// Returns the archive size in bytes.
pub async fn pack_dir(dir: &Path, destination: &Path) -> Result<u64> {
    let dir = dir.to_path_buf();
    let destination = destination.to_path_buf();

    tokio::task::spawn_blocking(move || pack_dir_blocking(&dir, &destination))
        .await
        .map_err(|e| Error::Internal {
            message: format!("archive packaging task failed: {}", e),
        })?
}

fn pack_dir_blocking(dir: &Path, destination: &Path) -> Result<u64> {
    let temp_path = temp_sibling(destination);

    let file = std::fs::File::create(&temp_path)?;
    let mut builder = tar::Builder::new(file);
    builder.append_dir_all(".", dir)?;
    let file = builder.into_inner()?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&temp_path, destination)?;
    let size = std::fs::metadata(destination)?.len();
    debug!(destination = %destination.display(), size_bytes = size, "Packaged checkpoint archive");
    Ok(size)
}

/// Extract a tar archive into `dir`, creating it if needed.
pub async fn unpack(archive: &Path, dir: &Path) -> Result<()> {
    let archive = archive.to_path_buf();
    let dir = dir.to_path_buf();

    tokio::task::spawn_blocking(move || unpack_blocking(&archive, &dir))
        .await
        .map_err(|e| Error::Internal {
            message: format!("archive extraction task failed: {}", e),
        })?
}

fn unpack_blocking(archive: &Path, dir: &Path) -> Result<()> {
    if !archive.exists() {
        return Err(Error::CheckpointNotFound {
            path: archive.display().to_string(),
        });
    }
    std::fs::create_dir_all(dir)?;
    let file = std::fs::File::open(archive)?;
    let mut reader = tar::Archive::new(file);
    reader.unpack(dir)?;
    debug!(archive = %archive.display(), dir = %dir.display(), "Extracted checkpoint archive");
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = format!(
        ".{}.{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy(),
        Uuid::new_v4()
    );
    path.with_file_name(name)
}
