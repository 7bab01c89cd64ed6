//! Loss-scale state and the growth/backoff update rule

use parallel_core::{Error, PrecisionConfig, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Smallest scale the controller will back off to. The scale must never
/// reach zero or go negative; backoff below this floor is clamped.
const SCALE_FLOOR: f64 = f64::MIN_POSITIVE;

/// Dynamic loss-scale state for one training process.
///
/// Mutated only by [`LossScaler::update`]; its value is a cross-worker
/// consistency invariant enforced by the model-parallel reduction protocol,
/// not by shared memory.
///
/// [`LossScaler::update`]: crate::LossScaler::update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleState {
    scale: f64,
    growth_tracker: u32,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: u32,
    enabled: bool,
}

impl ScaleState {
    /// Build a validated scale state from configuration.
    pub fn new(config: &PrecisionConfig) -> Result<Self> {
        if !config.init_scale.is_finite() || config.init_scale <= 0.0 {
            return Err(Error::InvalidScale {
                value: config.init_scale,
            });
        }
        if config.growth_factor <= 1.0 {
            return Err(Error::Precondition {
                message: format!("growth_factor must be > 1, got {}", config.growth_factor),
            });
        }
        if config.backoff_factor <= 0.0 || config.backoff_factor >= 1.0 {
            return Err(Error::Precondition {
                message: format!("backoff_factor must be in (0, 1), got {}", config.backoff_factor),
            });
        }
        if config.growth_interval == 0 {
            return Err(Error::Precondition {
                message: "growth_interval must be > 0".to_string(),
            });
        }

        Ok(Self {
            scale: config.init_scale,
            growth_tracker: 0,
            growth_factor: config.growth_factor,
            backoff_factor: config.backoff_factor,
            growth_interval: config.growth_interval,
            enabled: config.enabled,
        })
    }

    /// Current loss scale.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Consecutive clean iterations since the last scale change.
    pub fn growth_tracker(&self) -> u32 {
        self.growth_tracker
    }

    /// Whether dynamic scaling is enabled. Fixed at construction.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Overwrite the scale with a caller-provided value. The value must be a
    /// plain finite scalar greater than zero; anything else is a caller
    /// contract error, not silently coerced.
    pub fn set_scale(&mut self, new_scale: f64) -> Result<()> {
        if !new_scale.is_finite() || new_scale <= 0.0 {
            return Err(Error::InvalidScale { value: new_scale });
        }
        self.scale = new_scale;
        Ok(())
    }

    /// Apply one iteration's globally agreed overflow decision.
    ///
    /// Overflow: scale is multiplied by `backoff_factor` and the tracker
    /// resets. Otherwise the tracker advances, and after `growth_interval`
    /// consecutive clean iterations the scale is multiplied by
    /// `growth_factor` and the tracker resets.
    pub fn apply(&mut self, found_inf: bool) {
        if found_inf {
            self.scale *= self.backoff_factor;
            self.growth_tracker = 0;
            if self.scale < SCALE_FLOOR {
                warn!(scale = self.scale, "Loss scale clamped at floor after backoff");
                self.scale = SCALE_FLOOR;
            }
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker == self.growth_interval {
                self.scale *= self.growth_factor;
                self.growth_tracker = 0;
                if !self.scale.is_finite() {
                    warn!("Loss scale overflowed f64 range after growth, clamping");
                    self.scale = f64::MAX;
                }
            }
        }
    }
}
