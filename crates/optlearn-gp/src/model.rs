//! Gaussian process posterior model.

use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector, Dyn};
use tracing::debug;

use optlearn_core::error::{EiError, Result};
use optlearn_core::gp::GaussianProcess;

use crate::covariance::SquareExponential;

/// Fitted training data: factor of `K + diag(noise)` and `(K + diag(noise))^-1 y`.
#[derive(Debug, Clone)]
struct Fit {
    chol: Cholesky<f64, Dyn>,
    alpha: DVector<f64>,
}

/// Zero prior-mean Gaussian process over sampled points with noisy values.
#[derive(Debug, Clone)]
pub struct GaussianProcessModel {
    covariance: SquareExponential,
    dim: usize,
    points: Vec<f64>,
    values: Vec<f64>,
    noise: Vec<f64>,
    fit: Option<Fit>,
}

/// Posterior quantities shared by every query at a fixed set of points.
#[derive(Debug, Clone)]
pub struct GpPointsState {
    points: Vec<f64>,
    num_points: usize,
    num_derivatives: usize,
    /// `K(X, Z)`, `[num_sampled][num_points]`.
    k_sampled: DMatrix<f64>,
    /// `(K + diag(noise))^-1 K(X, Z)`.
    kinv_k_sampled: DMatrix<f64>,
}

impl GpPointsState {
    /// Number of query points.
    pub fn num_points(&self) -> usize {
        self.num_points
    }

    /// Number of leading points gradients are taken against.
    pub fn num_derivatives(&self) -> usize {
        self.num_derivatives
    }

    fn point(&self, dim: usize, i: usize) -> &[f64] {
        &self.points[i * dim..(i + 1) * dim]
    }
}

impl GaussianProcessModel {
    /// Fit a model to `points` (`[num_sampled][dim]`), `values` and per-sample `noise` variance.
    pub fn new(
        covariance: SquareExponential,
        dim: usize,
        points: &[f64],
        values: &[f64],
        noise: &[f64],
    ) -> Result<Self> {
        if covariance.dim() != dim {
            return Err(EiError::Model(format!(
                "covariance has {} length scales for a {dim}-dimensional model",
                covariance.dim()
            )));
        }
        let mut model = Self {
            covariance,
            dim,
            points: Vec::new(),
            values: Vec::new(),
            noise: Vec::new(),
            fit: None,
        };
        model.add_sampled_points(points, values, noise)?;
        Ok(model)
    }

    /// Append new observations and refit.
    pub fn add_sampled_points(&mut self, points: &[f64], values: &[f64], noise: &[f64]) -> Result<()> {
        let count = values.len();
        if points.len() != count * self.dim || noise.len() != count {
            return Err(EiError::Model(format!(
                "{count} values need {} point coordinates and {count} noise terms, got {} and {}",
                count * self.dim,
                points.len(),
                noise.len()
            )));
        }
        if noise.iter().any(|n| *n < 0.0) {
            return Err(EiError::Model("noise variance must be non-negative".into()));
        }

        self.points.extend_from_slice(points);
        self.values.extend_from_slice(values);
        self.noise.extend_from_slice(noise);
        self.refit()
    }

    fn refit(&mut self) -> Result<()> {
        let n = self.num_sampled();
        if n == 0 {
            self.fit = None;
            return Ok(());
        }

        let k = DMatrix::from_fn(n, n, |i, j| {
            let kij = self.covariance.covariance(self.sampled(i), self.sampled(j));
            if i == j {
                kij + self.noise[i]
            } else {
                kij
            }
        });
        let chol = k.cholesky().ok_or_else(|| {
            EiError::Model("training covariance is not positive definite".into())
        })?;
        let alpha = chol.solve(&DVector::from_column_slice(&self.values));
        self.fit = Some(Fit { chol, alpha });

        debug!("Fitted Gaussian process on {} samples (dim={})", n, self.dim);
        Ok(())
    }

    /// Number of observations.
    pub fn num_sampled(&self) -> usize {
        self.values.len()
    }

    /// Covariance function.
    pub fn covariance(&self) -> &SquareExponential {
        &self.covariance
    }

    /// Observed values.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    fn sampled(&self, i: usize) -> &[f64] {
        &self.points[i * self.dim..(i + 1) * self.dim]
    }

    fn check_output(what: &str, out: &[f64], expected: usize) -> Result<()> {
        if out.len() != expected {
            return Err(EiError::Model(format!(
                "{what}: expected {expected} values, got {}",
                out.len()
            )));
        }
        Ok(())
    }

    /// Posterior covariance `K(Z, Z) - K(Z, X) (K + noise)^-1 K(X, Z)`.
    fn posterior_covariance(&self, state: &GpPointsState) -> DMatrix<f64> {
        let n = state.num_points;
        let prior = DMatrix::from_fn(n, n, |i, j| {
            self.covariance
                .covariance(state.point(self.dim, i), state.point(self.dim, j))
        });
        if self.fit.is_some() {
            prior - state.k_sampled.tr_mul(&state.kinv_k_sampled)
        } else {
            prior
        }
    }

    /// Gradient of `K(X, z_p)` w.r.t. coordinate `d` of `z_p`.
    fn grad_k_sampled(&self, state: &GpPointsState, p: usize, d: usize) -> DVector<f64> {
        let mut grad = vec![0.0; self.dim];
        DVector::from_fn(self.num_sampled(), |m, _| {
            self.covariance
                .grad_covariance(state.point(self.dim, p), self.sampled(m), &mut grad);
            grad[d]
        })
    }
}

impl GaussianProcess for GaussianProcessModel {
    type PointsState = GpPointsState;

    fn dim(&self) -> usize {
        self.dim
    }

    fn points_state(
        &self,
        points: &[f64],
        num_points: usize,
        num_derivatives: usize,
    ) -> Result<GpPointsState> {
        if points.len() != num_points * self.dim {
            return Err(EiError::Model(format!(
                "{num_points} points of dim {} need {} coordinates, got {}",
                self.dim,
                num_points * self.dim,
                points.len()
            )));
        }
        if num_derivatives > num_points {
            return Err(EiError::Model(format!(
                "cannot differentiate w.r.t. {num_derivatives} of {num_points} points"
            )));
        }

        let ns = self.num_sampled();
        let dim = self.dim;
        let k_sampled = DMatrix::from_fn(ns, num_points, |m, i| {
            self.covariance
                .covariance(self.sampled(m), &points[i * dim..(i + 1) * dim])
        });
        let kinv_k_sampled = match &self.fit {
            Some(fit) => fit.chol.solve(&k_sampled),
            None => k_sampled.clone(),
        };

        Ok(GpPointsState {
            points: points.to_vec(),
            num_points,
            num_derivatives,
            k_sampled,
            kinv_k_sampled,
        })
    }

    fn mean(&self, state: &GpPointsState, mean: &mut [f64]) -> Result<()> {
        Self::check_output("mean", mean, state.num_points)?;
        match &self.fit {
            Some(fit) => {
                for (i, out) in mean.iter_mut().enumerate() {
                    *out = state.k_sampled.column(i).dot(&fit.alpha);
                }
            }
            None => mean.fill(0.0),
        }
        Ok(())
    }

    fn grad_mean(&self, state: &GpPointsState, grad_mean: &mut [f64]) -> Result<()> {
        Self::check_output("grad_mean", grad_mean, state.num_derivatives * self.dim)?;
        let Some(fit) = &self.fit else {
            grad_mean.fill(0.0);
            return Ok(());
        };
        for p in 0..state.num_derivatives {
            for d in 0..self.dim {
                grad_mean[p * self.dim + d] = self.grad_k_sampled(state, p, d).dot(&fit.alpha);
            }
        }
        Ok(())
    }

    fn covariance_cholesky(&self, state: &GpPointsState, chol: &mut [f64]) -> Result<()> {
        let n = state.num_points;
        Self::check_output("chol", chol, n * n)?;
        if n == 0 {
            return Ok(());
        }

        let factor = self
            .posterior_covariance(state)
            .cholesky()
            .ok_or_else(|| EiError::Model("posterior covariance is not positive definite".into()))?;
        let l = factor.l();
        for i in 0..n {
            for j in 0..n {
                chol[i * n + j] = l[(i, j)];
            }
        }
        Ok(())
    }

    fn grad_covariance_cholesky(
        &self,
        state: &GpPointsState,
        chol: &[f64],
        grad_chol: &mut [f64],
    ) -> Result<()> {
        let n = state.num_points;
        let dim = self.dim;
        Self::check_output("chol", chol, n * n)?;
        Self::check_output("grad_chol", grad_chol, state.num_derivatives * dim * n * n)?;

        let l = DMatrix::from_row_slice(n, n, chol);
        let mut grad_point = vec![0.0; dim];

        for p in 0..state.num_derivatives {
            for d in 0..dim {
                // Only row and column p of the posterior covariance depend on z_p.
                let mut row = DVector::from_fn(n, |j, _| {
                    if j == p {
                        0.0
                    } else {
                        self.covariance.grad_covariance(
                            state.point(dim, p),
                            state.point(dim, j),
                            &mut grad_point,
                        );
                        grad_point[d]
                    }
                });
                if self.fit.is_some() {
                    let g = self.grad_k_sampled(state, p, d);
                    for j in 0..n {
                        let correction = g.dot(&state.kinv_k_sampled.column(j));
                        row[j] -= if j == p { 2.0 * correction } else { correction };
                    }
                }

                let mut d_sigma = DMatrix::zeros(n, n);
                for j in 0..n {
                    d_sigma[(p, j)] = row[j];
                    d_sigma[(j, p)] = row[j];
                }

                // dL = L Phi(L^-1 dSigma L^-T), Phi keeps the lower triangle with a halved diagonal.
                let half = l
                    .solve_lower_triangular(&d_sigma)
                    .ok_or_else(|| EiError::Model("singular Cholesky factor".into()))?;
                let mut phi = l
                    .solve_lower_triangular(&half.transpose())
                    .ok_or_else(|| EiError::Model("singular Cholesky factor".into()))?;
                for i in 0..n {
                    phi[(i, i)] *= 0.5;
                    for j in i + 1..n {
                        phi[(i, j)] = 0.0;
                    }
                }
                let dl = &l * phi;

                let base = (p * dim + d) * n * n;
                for i in 0..n {
                    for j in 0..n {
                        grad_chol[base + i * n + j] = if j <= i { dl[(i, j)] } else { 0.0 };
                    }
                }
            }
        }
        Ok(())
    }
}
