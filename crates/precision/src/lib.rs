//! Precision - Distributed-aware dynamic loss scaling
//!
//! Maintains a loss-scale value that stays numerically identical across all
//! tensor/pipeline-parallel peers of a model replica: overflow decisions are
//! max-reduced over the model-parallel process group before the optimizer
//! step is taken or the scale is adjusted.

pub mod scaler;
pub mod state;

pub use scaler::{LossScaler, Optimizer, OverflowReport};
pub use state::ScaleState;
