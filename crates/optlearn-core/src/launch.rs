//! Device execution grid and Monte-Carlo draw sizing.
//!
//! The device kernel gives every thread an equal share of Monte-Carlo draws,
//! so the requested draw count is rounded up to a whole multiple of the grid
//! size. No partial-block remainder handling exists on the device.

use serde::{Deserialize, Serialize};

use crate::error::{EiError, Result};

/// Default threads per block for the EI kernels.
pub const DEFAULT_THREADS_PER_BLOCK: usize = 256;

/// Default number of blocks for the EI kernels.
pub const DEFAULT_NUM_BLOCKS: usize = 32;

/// Device execution grid (threads x blocks) used for one kernel dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchGrid {
    /// Threads per block.
    pub threads_per_block: usize,
    /// Number of blocks.
    pub num_blocks: usize,
}

impl Default for LaunchGrid {
    fn default() -> Self {
        Self {
            threads_per_block: DEFAULT_THREADS_PER_BLOCK,
            num_blocks: DEFAULT_NUM_BLOCKS,
        }
    }
}

impl LaunchGrid {
    /// Creates a grid with the given dimensions.
    #[must_use]
    pub fn new(threads_per_block: usize, num_blocks: usize) -> Self {
        Self {
            threads_per_block,
            num_blocks,
        }
    }

    /// Total number of device threads.
    #[must_use]
    pub fn total_threads(&self) -> usize {
        self.threads_per_block * self.num_blocks
    }

    /// Reject grids with an empty dimension.
    pub fn validate(&self) -> Result<()> {
        if self.threads_per_block == 0 || self.num_blocks == 0 {
            return Err(EiError::InvalidConfiguration(format!(
                "launch grid must be non-empty, got {} threads x {} blocks",
                self.threads_per_block, self.num_blocks
            )));
        }
        Ok(())
    }

    /// Monte-Carlo draws each thread performs for a requested `num_mc`.
    #[must_use]
    pub fn draws_per_thread(&self, num_mc: usize) -> usize {
        num_mc.div_ceil(self.total_threads())
    }

    /// Draws actually performed for a requested `num_mc`.
    #[must_use]
    pub fn effective_draws(&self, num_mc: usize) -> usize {
        effective_draws(num_mc, self.threads_per_block, self.num_blocks)
    }
}

/// Smallest multiple of `num_threads * num_blocks` that is `>= num_mc`.
#[must_use]
pub fn effective_draws(num_mc: usize, num_threads: usize, num_blocks: usize) -> usize {
    let grid = num_threads * num_blocks;
    grid * num_mc.div_ceil(grid)
}

/// Number of standard normal draws consumed by one EI or grad-EI dispatch.
///
/// One normal per point per effective Monte-Carlo draw, i.e.
/// `num_points * effective_draws(num_mc, num_threads, num_blocks)`.
#[must_use]
pub fn get_vector_size(
    num_mc: usize,
    num_threads: usize,
    num_blocks: usize,
    num_points: usize,
) -> usize {
    num_points * effective_draws(num_mc, num_threads, num_blocks)
}
