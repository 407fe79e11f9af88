//! # optlearn-core
//!
//! Core traits and types for Monte-Carlo Expected Improvement evaluation on
//! GPU-style backends.
//!
//! ## Core Abstractions
//!
//! - [`ComputeBackend`] - the device primitives (activate, allocate, copy, launch)
//! - [`DeviceBuffer`] - exclusively owned device allocation
//! - [`MemoryTracker`] - allocation accounting and leak detection
//! - [`GaussianProcess`] - posterior model collaborator
//! - [`EiConfig`] / [`LaunchGrid`] - evaluator parameters and device grid
//! - [`EiError`] - error taxonomy shared by every crate

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod config;
pub mod error;
pub mod gp;
pub mod launch;
pub mod memory;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::{ComputeBackend, EiKernelArgs, GradEiKernelArgs, KernelParams};
    pub use crate::config::{EiConfig, EiConfigBuilder};
    pub use crate::error::{EiError, Result};
    pub use crate::gp::GaussianProcess;
    pub use crate::launch::{effective_draws, get_vector_size, LaunchGrid};
    pub use crate::memory::{DeviceBuffer, MemoryTracker, MemoryTrackerStats};
}

// Re-exports for convenience
pub use backend::{ComputeBackend, EiKernelArgs, GradEiKernelArgs, KernelParams};
pub use config::{EiConfig, EiConfigBuilder};
pub use error::{EiError, Result};
pub use gp::GaussianProcess;
pub use launch::{effective_draws, get_vector_size, LaunchGrid};
pub use memory::{DeviceBuffer, MemoryTracker, MemoryTrackerStats, TrackedAllocation};
