//! Gaussian process posterior for optlearn.
//!
//! Provides [`GaussianProcessModel`], a zero prior-mean Gaussian process with a
//! [`SquareExponential`] covariance, implementing the
//! [`GaussianProcess`](optlearn_core::GaussianProcess) contract consumed by the
//! Expected Improvement evaluator.
//!
//! # Example
//!
//! ```
//! use optlearn_core::GaussianProcess;
//! use optlearn_gp::{GaussianProcessModel, SquareExponential};
//!
//! let covariance = SquareExponential::new(1.0, vec![0.5]).unwrap();
//! let gp = GaussianProcessModel::new(covariance, 1, &[0.0, 1.0], &[0.2, -0.1], &[1e-6, 1e-6])
//!     .unwrap();
//!
//! let state = gp.points_state(&[0.5], 1, 1).unwrap();
//! let mut mean = [0.0];
//! gp.mean(&state, &mut mean).unwrap();
//! ```

#![warn(missing_docs)]

mod covariance;
mod model;

pub use covariance::SquareExponential;
pub use model::{GaussianProcessModel, GpPointsState};
