//! Error types for the model-parallel training utilities

use thiserror::Error;

/// Result type alias using the core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type shared across the workspace
#[derive(Error, Debug)]
pub enum Error {
    // Contract errors
    #[error("Precondition violated: {message}")]
    Precondition { message: String },

    #[error("Unsupported configuration: {feature} - {detail}")]
    UnsupportedConfiguration { feature: String, detail: String },

    // Topology errors
    #[error("Invalid topology: {message}")]
    InvalidTopology { message: String },

    #[error(
        "Topology mismatch: precomputed coordinate {expected} disagrees with runtime coordinate {actual}"
    )]
    TopologyMismatch { expected: String, actual: String },

    #[error("Parallel runtime unavailable: {operation} requires an attached collective runtime")]
    ParallelRuntimeUnavailable { operation: String },

    // Precision errors
    #[error("Invalid loss scale: {value} (must be a finite value greater than zero)")]
    InvalidScale { value: f64 },

    // Checkpoint errors
    #[error("Checkpoint shard missing: {path}")]
    ShardMissing { path: String },

    #[error("Checkpoint write failed: {message}")]
    CheckpointWriteFailed { message: String },

    #[error("Checkpoint not found: {path}")]
    CheckpointNotFound { path: String },

    // Data fetch errors
    #[error("Batch source exhausted: {message}")]
    SourceExhausted { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Returns true if this error indicates a caller contract violation
    /// rather than an environmental failure.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Error::Precondition { .. }
                | Error::InvalidScale { .. }
                | Error::InvalidTopology { .. }
                | Error::TopologyMismatch { .. }
        )
    }

    /// Returns true if this error is fatal to the current iteration
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Precondition { .. }
                | Error::TopologyMismatch { .. }
                | Error::ShardMissing { .. }
                | Error::Internal { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
