//! Gaussian process collaborator contract.
//!
//! The evaluator never fits or queries a model directly; it asks a
//! [`GaussianProcess`] for the posterior quantities at the union of points
//! and uploads them to the device.
//!
//! # Layouts
//!
//! All buffers are row-major f64:
//!
//! | Quantity | Shape |
//! |----------|-------|
//! | points | `[num_points][dim]` |
//! | mean | `[num_points]` |
//! | grad mean | `[num_derivatives][dim]`, entry `(p, d)` is `d mu_p / d x_{p,d}` |
//! | Cholesky | `[num_points][num_points]`, lower triangle, zeros above |
//! | grad Cholesky | `[num_derivatives][dim][num_points][num_points]` |
//!
//! Derivatives are taken w.r.t. the first `num_derivatives` points.

use crate::error::Result;

/// Posterior model providing mean, covariance Cholesky factor and their gradients.
pub trait GaussianProcess: Send + Sync {
    /// Evaluation sub-state derived from a set of query points.
    type PointsState: Send;

    /// Spatial dimension of the model.
    fn dim(&self) -> usize;

    /// Precompute everything needed to answer queries at `points`.
    fn points_state(
        &self,
        points: &[f64],
        num_points: usize,
        num_derivatives: usize,
    ) -> Result<Self::PointsState>;

    /// Posterior mean, `[num_points]`.
    fn mean(&self, state: &Self::PointsState, mean: &mut [f64]) -> Result<()>;

    /// Gradient of the mean, `[num_derivatives][dim]`.
    fn grad_mean(&self, state: &Self::PointsState, grad_mean: &mut [f64]) -> Result<()>;

    /// Lower Cholesky factor of the posterior covariance, `[num_points][num_points]`.
    fn covariance_cholesky(&self, state: &Self::PointsState, chol: &mut [f64]) -> Result<()>;

    /// Gradient of the Cholesky factor, `[num_derivatives][dim][num_points][num_points]`.
    ///
    /// `chol` is the factor returned by [`covariance_cholesky`](Self::covariance_cholesky).
    fn grad_covariance_cholesky(
        &self,
        state: &Self::PointsState,
        chol: &[f64],
        grad_chol: &mut [f64],
    ) -> Result<()>;
}
