//! Evaluator configuration.

use serde::{Deserialize, Serialize};

use crate::error::{EiError, Result};
use crate::launch::LaunchGrid;

/// Parameters of an Expected Improvement evaluator.
///
/// Immutable once the evaluator is built from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EiConfig {
    /// Requested Monte-Carlo draws. Advisory, rounded up to the grid size.
    pub num_mc: usize,
    /// Best (minimum) objective value observed so far.
    pub best_so_far: f64,
    /// Device the evaluator dispatches to.
    #[serde(default)]
    pub device_id: usize,
    /// Execution grid for both EI and grad-EI kernels.
    #[serde(default)]
    pub grid: LaunchGrid,
}

impl Default for EiConfig {
    fn default() -> Self {
        Self {
            num_mc: 10_000,
            best_so_far: 0.0,
            device_id: 0,
            grid: LaunchGrid::default(),
        }
    }
}

impl EiConfig {
    /// Creates a configuration with the default device and grid.
    #[must_use]
    pub fn new(num_mc: usize, best_so_far: f64) -> Self {
        Self {
            num_mc,
            best_so_far,
            ..Default::default()
        }
    }

    /// Starts a builder from the default configuration.
    #[must_use]
    pub fn builder() -> EiConfigBuilder {
        EiConfigBuilder::new()
    }

    /// Check that the configuration can produce at least one draw.
    pub fn validate(&self) -> Result<()> {
        if self.num_mc == 0 {
            return Err(EiError::InvalidConfiguration(
                "num_mc must be positive, no Monte-Carlo draws possible".to_string(),
            ));
        }
        if !self.best_so_far.is_finite() {
            return Err(EiError::InvalidConfiguration(format!(
                "best_so_far must be finite, got {}",
                self.best_so_far
            )));
        }
        self.grid.validate()
    }

    /// Draws actually performed per dispatch.
    #[must_use]
    pub fn effective_draws(&self) -> usize {
        self.grid.effective_draws(self.num_mc)
    }
}

/// Builder for [`EiConfig`].
#[derive(Debug, Default)]
pub struct EiConfigBuilder {
    config: EiConfig,
}

impl EiConfigBuilder {
    /// Creates a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the requested Monte-Carlo draw count.
    #[must_use]
    pub fn with_num_mc(mut self, num_mc: usize) -> Self {
        self.config.num_mc = num_mc;
        self
    }

    /// Sets the incumbent best objective value.
    #[must_use]
    pub fn with_best_so_far(mut self, best_so_far: f64) -> Self {
        self.config.best_so_far = best_so_far;
        self
    }

    /// Sets the target device.
    #[must_use]
    pub fn with_device(mut self, device_id: usize) -> Self {
        self.config.device_id = device_id;
        self
    }

    /// Sets the execution grid.
    #[must_use]
    pub fn with_grid(mut self, threads_per_block: usize, num_blocks: usize) -> Self {
        self.config.grid = LaunchGrid::new(threads_per_block, num_blocks);
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> Result<EiConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
