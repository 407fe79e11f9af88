//! Externally supplied normal draws for reproducible kernel output.

use optlearn_core::backend::ComputeBackend;
use optlearn_core::error::{EiError, Result};
use optlearn_core::gp::GaussianProcess;
use optlearn_core::launch::get_vector_size;
use optlearn_montecarlo::{NormalSource, PhiloxRng};

use super::evaluator::ExpectedImprovementEvaluator;

/// Fixed standard-normal draws replacing on-device generation.
///
/// Each vector holds `num_union * effective_draws` values; the normal for
/// thread `t`, draw `k`, point `i` sits at
/// `((t * draws_per_thread) + k) * num_union + i`.
#[derive(Debug, Clone, PartialEq)]
pub struct RandomDraws {
    /// Draws read by the EI kernel.
    pub ei: Vec<f64>,
    /// Draws read by the grad-EI kernel.
    pub grad_ei: Vec<f64>,
}

impl RandomDraws {
    /// Generate both draw vectors for `num_union` points from `rng`.
    ///
    /// The EI draws are generated first, then the grad-EI draws.
    pub fn generate<G, B>(
        evaluator: &ExpectedImprovementEvaluator<'_, G, B>,
        num_union: usize,
        rng: &mut PhiloxRng,
    ) -> Self
    where
        G: GaussianProcess,
        B: ComputeBackend,
    {
        let grid = evaluator.grid();
        let len = get_vector_size(
            evaluator.num_mc(),
            grid.threads_per_block,
            grid.num_blocks,
            num_union,
        );
        let mut ei = vec![0.0; len];
        let mut grad_ei = vec![0.0; len];
        rng.fill_normal(&mut ei);
        rng.fill_normal(&mut grad_ei);
        Self { ei, grad_ei }
    }

    /// Use the same draws for the value and the gradient kernels.
    ///
    /// Makes the gradient exactly the derivative of the value estimate.
    pub fn shared(draws: Vec<f64>) -> Self {
        Self {
            grad_ei: draws.clone(),
            ei: draws,
        }
    }

    pub(crate) fn check(&self, expected: usize, with_gradients: bool) -> Result<()> {
        if self.ei.len() != expected {
            return Err(EiError::InvalidConfiguration(format!(
                "ei draws: expected {expected} values, got {}",
                self.ei.len()
            )));
        }
        if with_gradients && self.grad_ei.len() != expected {
            return Err(EiError::InvalidConfiguration(format!(
                "grad ei draws: expected {expected} values, got {}",
                self.grad_ei.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_draws_match() {
        let draws = RandomDraws::shared(vec![0.5, -1.0, 2.0]);
        assert_eq!(draws.ei, draws.grad_ei);
    }

    #[test]
    fn test_check_lengths() {
        let draws = RandomDraws {
            ei: vec![0.0; 4],
            grad_ei: vec![0.0; 2],
        };
        assert!(draws.check(4, false).is_ok());
        assert!(matches!(
            draws.check(4, true),
            Err(EiError::InvalidConfiguration(_))
        ));
        assert!(draws.check(3, false).is_err());
    }
}
