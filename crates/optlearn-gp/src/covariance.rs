//! Square-exponential covariance.

use serde::{Deserialize, Serialize};

use optlearn_core::error::{EiError, Result};

/// `k(a, b) = sigma^2 exp(-0.5 sum_d ((a_d - b_d) / l_d)^2)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SquareExponential {
    signal_variance: f64,
    length_scales: Vec<f64>,
}

impl SquareExponential {
    /// Create a covariance with one length scale per dimension.
    pub fn new(signal_variance: f64, length_scales: Vec<f64>) -> Result<Self> {
        if !(signal_variance > 0.0 && signal_variance.is_finite()) {
            return Err(EiError::Model(format!(
                "signal variance must be positive, got {signal_variance}"
            )));
        }
        if length_scales.is_empty() {
            return Err(EiError::Model("at least one length scale required".into()));
        }
        if let Some(bad) = length_scales.iter().find(|l| !(**l > 0.0 && l.is_finite())) {
            return Err(EiError::Model(format!(
                "length scales must be positive, got {bad}"
            )));
        }
        Ok(Self {
            signal_variance,
            length_scales,
        })
    }

    /// Spatial dimension.
    pub fn dim(&self) -> usize {
        self.length_scales.len()
    }

    /// Signal variance `sigma^2`, also `k(a, a)`.
    pub fn signal_variance(&self) -> f64 {
        self.signal_variance
    }

    /// Length scales.
    pub fn length_scales(&self) -> &[f64] {
        &self.length_scales
    }

    /// Covariance between `a` and `b`.
    pub fn covariance(&self, a: &[f64], b: &[f64]) -> f64 {
        let norm: f64 = a
            .iter()
            .zip(b)
            .zip(&self.length_scales)
            .map(|((a, b), l)| {
                let s = (a - b) / l;
                s * s
            })
            .sum();
        self.signal_variance * (-0.5 * norm).exp()
    }

    /// Gradient of `k(a, b)` w.r.t. `a`, written into `out[..dim]`.
    pub fn grad_covariance(&self, a: &[f64], b: &[f64], out: &mut [f64]) {
        let k = self.covariance(a, b);
        for (d, l) in self.length_scales.iter().enumerate() {
            out[d] = -k * (a[d] - b[d]) / (l * l);
        }
    }
}
