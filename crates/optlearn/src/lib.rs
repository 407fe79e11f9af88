//! # optlearn
//!
//! Monte-Carlo estimation of the (q,p)-Expected Improvement acquisition
//! function and its gradient, dispatched to a GPU-style compute backend.
//!
//! An outer Bayesian-optimization loop builds one
//! [`ExpectedImprovementEvaluator`] per configuration (GP, draw count,
//! incumbent best value, device) and one [`ExpectedImprovementState`] per
//! batch of candidate points. The state owns the union of points, the GP
//! derived host temporaries, its device buffers and its random generator.
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use optlearn::prelude::*;
//!
//! # fn main() -> optlearn::Result<()> {
//! let covariance = SquareExponential::new(1.0, vec![0.3])?;
//! let gp = GaussianProcessModel::new(covariance, 1, &[0.0, 1.0], &[0.4, -0.2], &[1e-4, 1e-4])?;
//!
//! let backend = Arc::new(CpuBackend::new());
//! let config = EiConfig::builder()
//!     .with_num_mc(4096)
//!     .with_best_so_far(-0.2)
//!     .with_grid(64, 8)
//!     .build()?;
//! let evaluator = ExpectedImprovementEvaluator::new(&gp, backend, &config)?;
//!
//! let mut state = ExpectedImprovementState::new(
//!     &evaluator,
//!     &[0.6],
//!     &[],
//!     1,
//!     0,
//!     true,
//!     PhiloxRng::new(7, 0),
//! )?;
//! let ei = evaluator.compute_expected_improvement(&mut state)?;
//! let mut grad = [0.0];
//! evaluator.compute_grad_expected_improvement(&mut state, &mut grad)?;
//! assert!(ei >= 0.0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Backends
//!
//! - **CPU** - host emulation of the device grid (always available)
//! - **CUDA** - NVIDIA GPUs (requires `cuda` feature)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ei;

// Re-export core types
pub use optlearn_core::*;

pub use ei::{ExpectedImprovementEvaluator, ExpectedImprovementState, RandomDraws};

// Re-export backends; the CPU backend is always available
pub use optlearn_cpu::CpuBackend;
pub use optlearn_cuda::{cuda_device_count, is_cuda_available, CudaBackend};

pub use optlearn_gp::{GaussianProcessModel, SquareExponential};
pub use optlearn_montecarlo::{NormalSource, PhiloxRng};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::ei::{ExpectedImprovementEvaluator, ExpectedImprovementState, RandomDraws};
    pub use optlearn_core::prelude::*;
    pub use optlearn_cpu::CpuBackend;
    pub use optlearn_cuda::CudaBackend;
    pub use optlearn_gp::{GaussianProcessModel, SquareExponential};
    pub use optlearn_montecarlo::{NormalSource, PhiloxRng};
}
