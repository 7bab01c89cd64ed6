//! Trainer - composition-based training-step driver
//!
//! Instead of subclassing a framework trainer, the step driver accepts small
//! pluggable strategy objects: a distributed strategy (grid setup, sampler
//! and grad-sync decisions, checkpoint path injection), a precision strategy
//! (loss scaling), and a global-batch fetcher. The leaf utilities never call
//! back into the driver.

pub mod driver;
pub mod fetcher;
pub mod precision_strategy;
pub mod strategy;

pub use driver::{StepDriver, TrainModule, TrainSummary};
pub use fetcher::{BatchSource, GlobalBatch, GlobalBatchFetcher};
pub use precision_strategy::{FullPrecision, MixedPrecision, PrecisionStrategy};
pub use strategy::{DistributedStrategy, ModelParallelStrategy, SamplerConfig};
