//! The distributed loss-scale controller
//!
//! Overflow decisions are reduced across the model-parallel process group
//! (all tensor/pipeline peers of a replica), not just data-parallel peers, so
//! every worker holding a slice of the same model applies an identical
//! step/skip decision and scale adjustment.

use crate::state::ScaleState;
use parallel_core::{Collective, Error, GridContext, PrecisionConfig, ProcessGroup, Result};
use std::sync::Arc;
use tracing::{debug, trace};

/// Per-optimizer, per-device inf/NaN flags collected during one iteration.
///
/// Transient: consumed and cleared by [`LossScaler::update`].
#[derive(Debug, Clone, Default)]
pub struct OverflowReport {
    found_inf_per_device: Vec<bool>,
}

impl OverflowReport {
    /// Report for the given per-device flags.
    pub fn new(found_inf_per_device: Vec<bool>) -> Self {
        Self {
            found_inf_per_device,
        }
    }

    /// Report for a single device.
    pub fn single(found_inf: bool) -> Self {
        Self {
            found_inf_per_device: vec![found_inf],
        }
    }

    /// Number of devices that observed an inf/NaN.
    pub fn inf_count(&self) -> usize {
        self.found_inf_per_device.iter().filter(|&&f| f).count()
    }

    /// True if any device observed an inf/NaN.
    pub fn any(&self) -> bool {
        self.found_inf_per_device.iter().any(|&f| f)
    }
}

/// An optimizer whose step is gated by the overflow decision.
pub trait Optimizer {
    /// Value produced by a successful step.
    type Output;

    /// Apply one optimizer step.
    fn step(&mut self) -> Self::Output;
}

/// Distributed-aware loss-scale controller.
///
/// One instance per training process. Call [`maybe_step`] once per optimizer
/// per iteration after the backward pass, then [`update`] exactly once at the
/// end of the iteration.
///
/// [`maybe_step`]: LossScaler::maybe_step
/// [`update`]: LossScaler::update
#[derive(Debug)]
pub struct LossScaler {
    state: ScaleState,
    iteration_reports: Vec<OverflowReport>,
}

impl LossScaler {
    /// Build a controller from configuration.
    pub fn new(config: &PrecisionConfig) -> Result<Self> {
        Ok(Self {
            state: ScaleState::new(config)?,
            iteration_reports: Vec::new(),
        })
    }

    /// Current loss scale.
    pub fn scale(&self) -> f64 {
        self.state.scale()
    }

    /// Consecutive clean iterations since the last scale change.
    pub fn growth_tracker(&self) -> u32 {
        self.state.growth_tracker()
    }

    /// Whether dynamic scaling is enabled.
    pub fn is_enabled(&self) -> bool {
        self.state.is_enabled()
    }

    /// Step `optimizer` unless any worker in the model-parallel group
    /// observed an overflow this iteration.
    ///
    /// Records the report for the end-of-iteration [`update`], sums the
    /// per-device flags, max-reduces the sum across the model-parallel group,
    /// and invokes the step only when the reduced value is zero. A skipped
    /// step returns `Ok(None)`; it is not a failure.
    ///
    /// [`update`]: LossScaler::update
    pub async fn maybe_step<O: Optimizer>(
        &mut self,
        optimizer: &mut O,
        report: OverflowReport,
        ctx: &GridContext,
    ) -> Result<Option<O::Output>> {
        if !self.state.is_enabled() {
            return Ok(Some(optimizer.step()));
        }

        let local_found_inf = report.inf_count() as f64;
        self.iteration_reports.push(report);

        let reduced = self.reduce_found_inf(local_found_inf, ctx).await?;
        if reduced == 0.0 {
            trace!("No overflow in model-parallel group, stepping optimizer");
            Ok(Some(optimizer.step()))
        } else {
            debug!(
                found_inf = reduced,
                scale = self.state.scale(),
                "Overflow detected in model-parallel group, skipping optimizer step"
            );
            Ok(None)
        }
    }

    /// Update the scale at the end of the iteration.
    ///
    /// With `new_scale`, the value is validated and applied locally without
    /// any reduction. Otherwise all flags recorded by [`maybe_step`] this
    /// iteration are combined, max-reduced across the model-parallel group,
    /// and fed into the growth/backoff rule; calling `update` with no
    /// recorded flags is a precondition violation. Per-optimizer bookkeeping
    /// is cleared before returning.
    ///
    /// [`maybe_step`]: LossScaler::maybe_step
    pub async fn update(&mut self, new_scale: Option<f64>, ctx: &GridContext) -> Result<()> {
        if !self.state.is_enabled() {
            return Ok(());
        }

        if let Some(scale) = new_scale {
            self.state.set_scale(scale)?;
            debug!(scale, "Loss scale set manually");
        } else {
            if self.iteration_reports.is_empty() {
                return Err(Error::Precondition {
                    message: "update called with no inf checks recorded; \
                              maybe_step must run at least once per iteration"
                        .to_string(),
                });
            }

            let local_any = self.iteration_reports.iter().any(|r| r.any());
            let reduced = self
                .reduce_found_inf(if local_any { 1.0 } else { 0.0 }, ctx)
                .await?;
            let found_inf = reduced > 0.0;

            let before = self.state.scale();
            self.state.apply(found_inf);
            if found_inf {
                debug!(
                    from = before,
                    to = self.state.scale(),
                    "Loss scale backed off after overflow"
                );
            } else if self.state.scale() != before {
                debug!(
                    from = before,
                    to = self.state.scale(),
                    "Loss scale grew after clean interval"
                );
            }
        }

        self.iteration_reports.clear();
        Ok(())
    }

    /// Max-reduce a found-inf scalar across the model-parallel group.
    ///
    /// A trivial grid decides locally with no runtime; a non-trivial grid
    /// without an initialized collective is a typed failure rather than a
    /// deferred crash.
    async fn reduce_found_inf(&self, local: f64, ctx: &GridContext) -> Result<f64> {
        if !ctx.requires_collective() {
            return Ok(local);
        }
        let collective: &Arc<dyn Collective> = ctx.collective("found-inf reduction")?;
        if !collective.is_initialized() {
            return Err(Error::ParallelRuntimeUnavailable {
                operation: "found-inf reduction over model-parallel group".to_string(),
            });
        }
        collective
            .all_reduce_max(local, ProcessGroup::ModelParallel)
            .await
    }
}
