//! CLI command implementations.

pub mod devices;
pub mod evaluate;

use clap::ValueEnum;

/// Compute backend selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Host emulation of the device grid.
    Cpu,
    /// NVIDIA GPU via CUDA.
    Cuda,
}
