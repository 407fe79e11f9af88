//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use optlearn::prelude::*;

/// GP with zero mean and independent points of fixed variance.
pub struct IndependentGp {
    pub dim: usize,
    pub variance: f64,
}

pub struct IndependentPoints {
    num_points: usize,
    num_derivatives: usize,
}

impl GaussianProcess for IndependentGp {
    type PointsState = IndependentPoints;

    fn dim(&self) -> usize {
        self.dim
    }

    fn points_state(
        &self,
        points: &[f64],
        num_points: usize,
        num_derivatives: usize,
    ) -> Result<IndependentPoints> {
        assert_eq!(points.len(), num_points * self.dim);
        Ok(IndependentPoints {
            num_points,
            num_derivatives,
        })
    }

    fn mean(&self, state: &IndependentPoints, mean: &mut [f64]) -> Result<()> {
        assert_eq!(mean.len(), state.num_points);
        mean.fill(0.0);
        Ok(())
    }

    fn grad_mean(&self, state: &IndependentPoints, grad_mean: &mut [f64]) -> Result<()> {
        assert_eq!(grad_mean.len(), state.num_derivatives * self.dim);
        grad_mean.fill(0.0);
        Ok(())
    }

    fn covariance_cholesky(&self, state: &IndependentPoints, chol: &mut [f64]) -> Result<()> {
        let n = state.num_points;
        chol.fill(0.0);
        for i in 0..n {
            chol[i * n + i] = self.variance.sqrt();
        }
        Ok(())
    }

    fn grad_covariance_cholesky(
        &self,
        _state: &IndependentPoints,
        _chol: &[f64],
        grad_chol: &mut [f64],
    ) -> Result<()> {
        grad_chol.fill(0.0);
        Ok(())
    }
}

/// Fitted two-dimensional GP over a handful of observations.
pub fn fitted_gp() -> GaussianProcessModel {
    let covariance = SquareExponential::new(1.0, vec![0.6, 0.8]).unwrap();
    GaussianProcessModel::new(
        covariance,
        2,
        &[0.0, 0.0, 1.0, 0.2, -0.4, 0.9, 0.5, -0.8],
        &[0.1, -0.3, 0.4, 0.0],
        &[1e-3, 1e-3, 1e-3, 1e-3],
    )
    .unwrap()
}

/// Two candidates in two dimensions.
pub const CANDIDATES: [f64; 4] = [0.3, 0.4, -0.2, -0.5];

/// One point of a running experiment.
pub const BEING_SAMPLED: [f64; 2] = [0.8, -0.3];

pub fn cpu_backend() -> Arc<CpuBackend> {
    Arc::new(CpuBackend::new())
}

pub fn small_config(num_mc: usize, best_so_far: f64) -> EiConfig {
    EiConfig::builder()
        .with_num_mc(num_mc)
        .with_best_so_far(best_so_far)
        .with_grid(16, 4)
        .build()
        .unwrap()
}

/// Host evaluation of the EI estimator over fixed draws, one draw per chunk.
pub fn reference_ei(mean: &[f64], chol: &[f64], draws: &[f64], best_so_far: f64) -> f64 {
    let n = mean.len();
    let draws_count = draws.len() / n;
    let total: f64 = draws
        .chunks_exact(n)
        .map(|z| {
            let min = (0..n)
                .map(|i| mean[i] + (0..=i).map(|j| chol[i * n + j] * z[j]).sum::<f64>())
                .fold(f64::INFINITY, f64::min);
            (best_so_far - min).max(0.0)
        })
        .sum();
    total / draws_count as f64
}
