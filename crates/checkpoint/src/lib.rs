//! Checkpoint - Rank-partitioned checkpoint persistence
//!
//! Persists model weights exactly once per checkpoint partition (the workers
//! sharing a tensor/pipeline-parallel position), then merges the per-rank
//! shards into one packaged archive on a single leader.

pub mod archive;
pub mod layout;
pub mod snapshot;
pub mod writer;

pub use layout::CheckpointLayout;
pub use snapshot::{Artifact, LoadedCheckpoint, ModelSnapshot};
pub use writer::{PartitionedWriter, SaveOutcome};
