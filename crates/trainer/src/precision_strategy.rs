//! Precision strategies wrapping the optimizer step
//!
//! `MixedPrecision` delegates to the distributed loss-scale controller;
//! `FullPrecision` steps unconditionally with a unit scale.

use async_trait::async_trait;
use parallel_core::{GridContext, PrecisionConfig, Result};
use precision::{LossScaler, Optimizer, OverflowReport};

/// Capability interface for the precision side of a training step.
#[async_trait]
pub trait PrecisionStrategy: Send {
    /// Loss scale to apply to the next backward pass.
    fn loss_scale(&self) -> f64;

    /// Gate the optimizer step on this iteration's overflow report.
    async fn step<O>(
        &mut self,
        optimizer: &mut O,
        report: OverflowReport,
        ctx: &GridContext,
    ) -> Result<Option<O::Output>>
    where
        O: Optimizer + Send,
        O::Output: Send;

    /// End-of-iteration bookkeeping (scale update, report clearing).
    async fn finish_iteration(&mut self, ctx: &GridContext) -> Result<()>;
}

/// Mixed-precision training with distributed dynamic loss scaling.
#[derive(Debug)]
pub struct MixedPrecision {
    scaler: LossScaler,
}

impl MixedPrecision {
    /// Strategy from precision configuration.
    pub fn new(config: &PrecisionConfig) -> Result<Self> {
        Ok(Self {
            scaler: LossScaler::new(config)?,
        })
    }

    /// The underlying scale controller.
    pub fn scaler(&self) -> &LossScaler {
        &self.scaler
    }
}

#[async_trait]
impl PrecisionStrategy for MixedPrecision {
    fn loss_scale(&self) -> f64 {
        self.scaler.scale()
    }

    async fn step<O>(
        &mut self,
        optimizer: &mut O,
        report: OverflowReport,
        ctx: &GridContext,
    ) -> Result<Option<O::Output>>
    where
        O: Optimizer + Send,
        O::Output: Send,
    {
        self.scaler.maybe_step(optimizer, report, ctx).await
    }

    async fn finish_iteration(&mut self, ctx: &GridContext) -> Result<()> {
        self.scaler.update(None, ctx).await
    }
}

/// Full-precision training: every step is taken, the scale is fixed at 1.
#[derive(Debug, Default)]
pub struct FullPrecision;

#[async_trait]
impl PrecisionStrategy for FullPrecision {
    fn loss_scale(&self) -> f64 {
        1.0
    }

    async fn step<O>(
        &mut self,
        optimizer: &mut O,
        _report: OverflowReport,
        _ctx: &GridContext,
    ) -> Result<Option<O::Output>>
    where
        O: Optimizer + Send,
        O::Output: Send,
    {
        Ok(Some(optimizer.step()))
    }

    async fn finish_iteration(&mut self, _ctx: &GridContext) -> Result<()> {
        Ok(())
    }
}
