//! Parallel Core - Foundation for model-parallel training utilities
//!
//! Provides the 3-D parallelism grid types, process-group abstractions,
//! collective-communication contracts, and error handling shared by the
//! precision, checkpoint, and trainer crates.

pub mod collective;
pub mod config;
pub mod error;
pub mod sim;
pub mod topology;

pub use collective::{Collective, GridContext, ProcessGroup, SingleProcess};
pub use config::{CheckpointConfig, FetchConfig, GridConfig, PrecisionConfig, TopologyConfig};
pub use error::{Error, Result};
pub use sim::SimGrid;
pub use topology::{GridTopology, WorkerCoordinate};

/// Initialize tracing with an env-filter (`RUST_LOG`) for binaries and tests.
///
/// Safe to call more than once; subsequent calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
