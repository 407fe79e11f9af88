//! Expected Improvement evaluator.

use std::sync::Arc;

use tracing::{debug, info};

use optlearn_core::backend::{ComputeBackend, EiKernelArgs, GradEiKernelArgs, KernelParams};
use optlearn_core::config::EiConfig;
use optlearn_core::error::{EiError, Result};
use optlearn_core::gp::GaussianProcess;
use optlearn_core::launch::LaunchGrid;

use super::state::ExpectedImprovementState;

/// Immutable evaluation parameters plus device dispatch of EI and grad-EI.
///
/// Borrows the GP for its whole lifetime and may be shared read-only across
/// threads; each thread drives its own [`ExpectedImprovementState`].
pub struct ExpectedImprovementEvaluator<'a, G: GaussianProcess, B: ComputeBackend> {
    gaussian_process: &'a G,
    backend: Arc<B>,
    dim: usize,
    num_mc: usize,
    best_so_far: f64,
    device_id: usize,
    grid: LaunchGrid,
}

impl<'a, G: GaussianProcess, B: ComputeBackend> ExpectedImprovementEvaluator<'a, G, B> {
    /// Validate `config` and activate its device on `backend`.
    pub fn new(gaussian_process: &'a G, backend: Arc<B>, config: &EiConfig) -> Result<Self> {
        config.validate()?;
        let evaluator = Self {
            gaussian_process,
            backend,
            dim: gaussian_process.dim(),
            num_mc: config.num_mc,
            best_so_far: config.best_so_far,
            device_id: config.device_id,
            grid: config.grid,
        };
        evaluator.setup_gpu(config.device_id)?;

        info!(
            "EI evaluator on {} device {}: num_mc={} (effective {}), grid={}x{}, best_so_far={}",
            evaluator.backend.name(),
            evaluator.device_id,
            evaluator.num_mc,
            evaluator.effective_draws(),
            evaluator.grid.num_blocks,
            evaluator.grid.threads_per_block,
            evaluator.best_so_far
        );
        Ok(evaluator)
    }

    /// Activate `device_id` for subsequent dispatch.
    pub fn setup_gpu(&self, device_id: usize) -> Result<()> {
        self.backend.activate(device_id)
    }

    /// Monte-Carlo estimate of EI at the state's union of points.
    ///
    /// Advances the state's generator by one kernel seed.
    pub fn compute_expected_improvement(
        &self,
        state: &mut ExpectedImprovementState<G, B>,
    ) -> Result<f64> {
        if state.num_union() == 0 {
            return Ok(0.0);
        }
        let params = self.kernel_params(state)?;
        let effective_draws = params.effective_draws();
        debug!(
            "Dispatching EI: {} union points, {} draws ({} per thread)",
            params.num_union, effective_draws, params.draws_per_thread
        );

        let backend = self.backend.as_ref();
        let buffers = state.dispatch_buffers(&self.backend, self.device_id)?;
        backend.launch_ei(EiKernelArgs {
            mu: buffers.mu.raw(),
            chol_var: buffers.chol_var.raw(),
            ei_storage: buffers.ei_storage.raw_mut(),
            random_numbers: buffers.random_number_ei.as_ref().map(|b| b.raw()),
            params,
        })?;

        let mut partials = vec![0.0; buffers.ei_storage.len()];
        buffers.ei_storage.download(backend, &mut partials)?;
        Ok(partials.iter().sum::<f64>() / effective_draws as f64)
    }

    /// Monte-Carlo estimate of the EI gradient w.r.t. the candidates.
    ///
    /// `grad_ei` receives `[num_to_sample][dim]` values. Fails with
    /// [`EiError::InvalidState`] unless the state was built with gradients.
    pub fn compute_grad_expected_improvement(
        &self,
        state: &mut ExpectedImprovementState<G, B>,
        grad_ei: &mut [f64],
    ) -> Result<()> {
        if !state.gradients_enabled() {
            return Err(EiError::InvalidState(
                "gradient requested on a state built without gradient support".to_string(),
            ));
        }
        if grad_ei.len() != state.get_problem_size() {
            return Err(EiError::InvalidConfiguration(format!(
                "grad_ei: expected {} values, got {}",
                state.get_problem_size(),
                grad_ei.len()
            )));
        }
        if state.num_to_sample() == 0 {
            return Ok(());
        }

        let params = self.kernel_params(state)?;
        let effective_draws = params.effective_draws();
        debug!(
            "Dispatching grad EI: {} union points, {} gradient slots, {} draws",
            params.num_union,
            grad_ei.len(),
            effective_draws
        );

        let backend = self.backend.as_ref();
        let buffers = state.dispatch_buffers(&self.backend, self.device_id)?;
        backend.launch_grad_ei(GradEiKernelArgs {
            mu: buffers.mu.raw(),
            chol_var: buffers.chol_var.raw(),
            grad_mu: buffers.grad_mu.raw(),
            grad_chol_var: buffers.grad_chol_var.raw(),
            grad_ei_storage: buffers.grad_ei_storage.raw_mut(),
            random_numbers: buffers.random_number_grad_ei.as_ref().map(|b| b.raw()),
            params,
        })?;

        let mut partials = vec![0.0; buffers.grad_ei_storage.len()];
        buffers.grad_ei_storage.download(backend, &mut partials)?;

        grad_ei.fill(0.0);
        for block in partials.chunks_exact(grad_ei.len()) {
            for (g, p) in grad_ei.iter_mut().zip(block) {
                *g += p;
            }
        }
        let scale = 1.0 / effective_draws as f64;
        grad_ei.iter_mut().for_each(|g| *g *= scale);
        Ok(())
    }

    /// Objective value used by optimizers; same as
    /// [`compute_expected_improvement`](Self::compute_expected_improvement).
    pub fn compute_objective_function(
        &self,
        state: &mut ExpectedImprovementState<G, B>,
    ) -> Result<f64> {
        self.compute_expected_improvement(state)
    }

    /// Objective gradient used by optimizers; same as
    /// [`compute_grad_expected_improvement`](Self::compute_grad_expected_improvement).
    pub fn compute_grad_objective_function(
        &self,
        state: &mut ExpectedImprovementState<G, B>,
        grad_ei: &mut [f64],
    ) -> Result<()> {
        self.compute_grad_expected_improvement(state, grad_ei)
    }

    /// Validate `state` for a dispatch, then draw the kernel seed.
    ///
    /// A rejected dispatch leaves the state's generator untouched.
    fn kernel_params(&self, state: &mut ExpectedImprovementState<G, B>) -> Result<KernelParams> {
        if state.dim() != self.dim {
            return Err(EiError::InvalidState(format!(
                "state built for dim {}, evaluator has dim {}",
                state.dim(),
                self.dim
            )));
        }
        let mut params = KernelParams {
            num_union: state.num_union(),
            num_to_sample: state.num_to_sample(),
            dim: self.dim,
            best_so_far: self.best_so_far,
            draws_per_thread: self.grid.draws_per_thread(self.num_mc),
            grid: self.grid,
            seed: 0,
        };

        let buffers = state.dispatch_buffers(&self.backend, self.device_id)?;
        if buffers.ei_storage.len() != self.grid.num_blocks {
            return Err(EiError::InvalidState(
                "state was set up for a different launch grid; call setup_state".to_string(),
            ));
        }
        if let Some(draws) = &buffers.random_number_ei {
            if draws.len() != params.random_numbers_len() {
                return Err(EiError::InvalidState(format!(
                    "fixed draws hold {} values, dispatch needs {}",
                    draws.len(),
                    params.random_numbers_len()
                )));
            }
        }

        params.seed = state.next_seed();
        Ok(params)
    }

    /// The borrowed Gaussian process.
    pub fn gaussian_process(&self) -> &'a G {
        self.gaussian_process
    }

    /// Backend the evaluator dispatches to.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Spatial dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Requested Monte-Carlo draws.
    pub fn num_mc(&self) -> usize {
        self.num_mc
    }

    /// Draws actually performed per dispatch.
    pub fn effective_draws(&self) -> usize {
        self.grid.effective_draws(self.num_mc)
    }

    /// Best objective value observed so far.
    pub fn best_so_far(&self) -> f64 {
        self.best_so_far
    }

    /// Target device.
    pub fn device_id(&self) -> usize {
        self.device_id
    }

    /// Execution grid.
    pub fn grid(&self) -> LaunchGrid {
        self.grid
    }
}
