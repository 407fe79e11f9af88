//! Per-batch evaluation state.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use optlearn_core::backend::ComputeBackend;
use optlearn_core::error::{EiError, Result};
use optlearn_core::gp::GaussianProcess;
use optlearn_core::launch;
use optlearn_core::memory::DeviceBuffer;
use optlearn_montecarlo::PhiloxRng;

use super::draws::RandomDraws;
use super::evaluator::ExpectedImprovementEvaluator;

/// Lengths of every device buffer for one problem size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BufferSizes {
    mu: usize,
    chol_var: usize,
    grad_mu: usize,
    grad_chol_var: usize,
    ei_storage: usize,
    grad_ei_storage: usize,
    random_numbers: usize,
}

/// Device buffers owned by one state, bound to the backend and device that allocated them.
pub(super) struct DeviceBuffers<B: ComputeBackend> {
    sizes: BufferSizes,
    backend: Arc<B>,
    device_id: usize,
    pub(super) mu: DeviceBuffer<B>,
    pub(super) chol_var: DeviceBuffer<B>,
    pub(super) grad_mu: DeviceBuffer<B>,
    pub(super) grad_chol_var: DeviceBuffer<B>,
    pub(super) ei_storage: DeviceBuffer<B>,
    pub(super) grad_ei_storage: DeviceBuffer<B>,
    pub(super) random_number_ei: Option<DeviceBuffer<B>>,
    pub(super) random_number_grad_ei: Option<DeviceBuffer<B>>,
}

impl<B: ComputeBackend> DeviceBuffers<B> {
    /// Allocate every buffer and upload the fixed draws, if any.
    fn allocate(
        backend: &Arc<B>,
        sizes: BufferSizes,
        device_id: usize,
        random_draws: Option<&RandomDraws>,
        with_gradients: bool,
    ) -> Result<Self> {
        let dev = backend.as_ref();
        let random = |label, draws: Option<&Vec<f64>>| -> Result<Option<DeviceBuffer<B>>> {
            let Some(draws) = draws else {
                return Ok(None);
            };
            let mut buf = DeviceBuffer::new(dev, sizes.random_numbers, label)?;
            buf.upload(dev, draws)?;
            Ok(Some(buf))
        };

        Ok(Self {
            sizes,
            backend: Arc::clone(backend),
            device_id,
            mu: DeviceBuffer::new(dev, sizes.mu, "mu")?,
            chol_var: DeviceBuffer::new(dev, sizes.chol_var, "chol_var")?,
            grad_mu: DeviceBuffer::new(dev, sizes.grad_mu, "grad_mu")?,
            grad_chol_var: DeviceBuffer::new(dev, sizes.grad_chol_var, "grad_chol_var")?,
            ei_storage: DeviceBuffer::new(dev, sizes.ei_storage, "ei_storage")?,
            grad_ei_storage: DeviceBuffer::new(dev, sizes.grad_ei_storage, "grad_ei_storage")?,
            random_number_ei: random("random_number_ei", random_draws.map(|d| &d.ei))?,
            random_number_grad_ei: random(
                "random_number_grad_ei",
                random_draws.filter(|_| with_gradients).map(|d| &d.grad_ei),
            )?,
        })
    }

    /// Whether these buffers were allocated by `backend` on `device_id`.
    pub(super) fn bound_to(&self, backend: &Arc<B>, device_id: usize) -> bool {
        Arc::ptr_eq(&self.backend, backend) && self.device_id == device_id
    }

    fn fits(&self, sizes: BufferSizes, backend: &Arc<B>, device_id: usize) -> bool {
        self.sizes == sizes && self.bound_to(backend, device_id)
    }
}

/// GP derived host temporaries at the union of points.
struct HostTemporaries {
    mean: Vec<f64>,
    grad_mu: Vec<f64>,
    chol_var: Vec<f64>,
    grad_chol_var: Vec<f64>,
}

impl HostTemporaries {
    fn derive<G: GaussianProcess>(
        gp: &G,
        points_state: &G::PointsState,
        sizes: BufferSizes,
        num_derivatives: usize,
    ) -> Result<Self> {
        let mut temporaries = Self {
            mean: vec![0.0; sizes.mu],
            grad_mu: vec![0.0; sizes.grad_mu],
            chol_var: vec![0.0; sizes.chol_var],
            grad_chol_var: vec![0.0; sizes.grad_chol_var],
        };
        gp.mean(points_state, &mut temporaries.mean)?;
        gp.covariance_cholesky(points_state, &mut temporaries.chol_var)?;
        if num_derivatives > 0 {
            gp.grad_mean(points_state, &mut temporaries.grad_mu)?;
            gp.grad_covariance_cholesky(
                points_state,
                &temporaries.chol_var,
                &mut temporaries.grad_chol_var,
            )?;
        }
        Ok(temporaries)
    }

    fn upload<B: ComputeBackend>(&self, buffers: &mut DeviceBuffers<B>) -> Result<()> {
        let backend = buffers.backend.as_ref();
        buffers.mu.upload(backend, &self.mean)?;
        buffers.chol_var.upload(backend, &self.chol_var)?;
        buffers.grad_mu.upload(backend, &self.grad_mu)?;
        buffers.grad_chol_var.upload(backend, &self.grad_chol_var)?;
        Ok(())
    }
}

/// Mutable working set of one candidate batch.
///
/// Holds the union of points (`num_to_sample` candidates followed by
/// `num_being_sampled` points of running experiments), the GP derived host
/// temporaries, one device buffer per temporary and an exclusively owned
/// random generator.
///
/// All quantities are derived from the evaluator passed to the last
/// [`setup_state`](Self::setup_state) or
/// [`update_current_point`](Self::update_current_point). Nothing detects a
/// change of GP; resynchronize explicitly.
pub struct ExpectedImprovementState<G: GaussianProcess, B: ComputeBackend> {
    dim: usize,
    num_to_sample: usize,
    num_being_sampled: usize,
    num_derivatives: usize,
    gradients_enabled: bool,

    union_of_points: Vec<f64>,
    points_state: G::PointsState,
    rng: PhiloxRng,

    sizes: BufferSizes,
    temporaries: HostTemporaries,
    random_draws: Option<RandomDraws>,
    /// `None` only after a failed resize could not restore the previous buffers.
    buffers: Option<DeviceBuffers<B>>,
}

impl<G: GaussianProcess, B: ComputeBackend> ExpectedImprovementState<G, B> {
    /// Build a configured state for a candidate batch.
    ///
    /// `points_to_sample` holds `num_to_sample` points and
    /// `points_being_sampled` holds `num_being_sampled` points, each of the
    /// evaluator's dimension. Gradients are taken w.r.t. the candidates only,
    /// and only when `configure_for_gradients` is set.
    pub fn new(
        evaluator: &ExpectedImprovementEvaluator<'_, G, B>,
        points_to_sample: &[f64],
        points_being_sampled: &[f64],
        num_to_sample: usize,
        num_being_sampled: usize,
        configure_for_gradients: bool,
        rng: PhiloxRng,
    ) -> Result<Self> {
        Self::build(
            evaluator,
            points_to_sample,
            points_being_sampled,
            num_to_sample,
            num_being_sampled,
            configure_for_gradients,
            rng,
            None,
        )
    }

    /// Build a state whose kernels read `draws` instead of generating normals.
    ///
    /// Kernel output is then a deterministic function of the draws, for
    /// verification against a host computation.
    #[allow(clippy::too_many_arguments)]
    pub fn with_random_draws(
        evaluator: &ExpectedImprovementEvaluator<'_, G, B>,
        points_to_sample: &[f64],
        points_being_sampled: &[f64],
        num_to_sample: usize,
        num_being_sampled: usize,
        configure_for_gradients: bool,
        rng: PhiloxRng,
        draws: RandomDraws,
    ) -> Result<Self> {
        Self::build(
            evaluator,
            points_to_sample,
            points_being_sampled,
            num_to_sample,
            num_being_sampled,
            configure_for_gradients,
            rng,
            Some(draws),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        evaluator: &ExpectedImprovementEvaluator<'_, G, B>,
        points_to_sample: &[f64],
        points_being_sampled: &[f64],
        num_to_sample: usize,
        num_being_sampled: usize,
        configure_for_gradients: bool,
        rng: PhiloxRng,
        random_draws: Option<RandomDraws>,
    ) -> Result<Self> {
        let dim = evaluator.dim();
        let union_of_points = Self::build_union_of_points(
            points_to_sample,
            points_being_sampled,
            num_to_sample,
            num_being_sampled,
            dim,
        )?;
        let num_union = num_to_sample + num_being_sampled;
        let num_derivatives = if configure_for_gradients { num_to_sample } else { 0 };

        let sizes = Self::buffer_sizes(evaluator, num_union, num_to_sample, num_derivatives);
        if let Some(draws) = &random_draws {
            draws.check(sizes.random_numbers, configure_for_gradients)?;
        }

        let points_state = evaluator
            .gaussian_process()
            .points_state(&union_of_points, num_union, num_derivatives)?;
        let temporaries = HostTemporaries::derive(
            evaluator.gaussian_process(),
            &points_state,
            sizes,
            num_derivatives,
        )?;
        let mut buffers = DeviceBuffers::allocate(
            evaluator.backend(),
            sizes,
            evaluator.device_id(),
            random_draws.as_ref(),
            configure_for_gradients,
        )?;
        temporaries.upload(&mut buffers)?;

        let state = Self {
            dim,
            num_to_sample,
            num_being_sampled,
            num_derivatives,
            gradients_enabled: configure_for_gradients,
            union_of_points,
            points_state,
            rng,
            sizes,
            temporaries,
            random_draws,
            buffers: Some(buffers),
        };

        info!(
            "Built EI state: {} candidates, {} being sampled, dim={}, gradients={}, fixed draws={}",
            num_to_sample,
            num_being_sampled,
            dim,
            configure_for_gradients,
            state.random_draws.is_some()
        );
        Ok(state)
    }

    /// Concatenate `num_to_sample` candidates and `num_being_sampled` running points.
    ///
    /// Returns a newly allocated sequence of `(num_to_sample + num_being_sampled) * dim`
    /// values; the candidates come first.
    pub fn build_union_of_points(
        points_to_sample: &[f64],
        points_being_sampled: &[f64],
        num_to_sample: usize,
        num_being_sampled: usize,
        dim: usize,
    ) -> Result<Vec<f64>> {
        check_points("points_to_sample", points_to_sample, num_to_sample, dim)?;
        check_points("points_being_sampled", points_being_sampled, num_being_sampled, dim)?;

        let mut union = Vec::with_capacity((num_to_sample + num_being_sampled) * dim);
        union.extend_from_slice(points_to_sample);
        union.extend_from_slice(points_being_sampled);
        Ok(union)
    }

    /// Normal draws consumed by one dispatch over `num_points` points.
    ///
    /// `num_points` times the effective draw count for the grid.
    pub fn get_vector_size(
        num_mc: usize,
        num_threads: usize,
        num_blocks: usize,
        num_points: usize,
    ) -> usize {
        launch::get_vector_size(num_mc, num_threads, num_blocks, num_points)
    }

    /// Copy the current candidates into `points_to_sample`.
    pub fn get_current_point(&self, points_to_sample: &mut [f64]) -> Result<()> {
        let current = self.current_point();
        check_points("points_to_sample", points_to_sample, self.num_to_sample, self.dim)?;
        points_to_sample.copy_from_slice(current);
        Ok(())
    }

    /// Current candidates, `[num_to_sample][dim]`.
    pub fn current_point(&self) -> &[f64] {
        &self.union_of_points[..self.num_to_sample * self.dim]
    }

    /// Move the candidates to `points_to_sample` and re-derive every GP quantity.
    ///
    /// The number of candidates is unchanged.
    pub fn update_current_point(
        &mut self,
        evaluator: &ExpectedImprovementEvaluator<'_, G, B>,
        points_to_sample: &[f64],
    ) -> Result<()> {
        check_points("points_to_sample", points_to_sample, self.num_to_sample, self.dim)?;
        self.setup_state(evaluator, points_to_sample)
    }

    /// Full resynchronization against `evaluator` at new candidates.
    ///
    /// The number of candidates follows `points_to_sample.len() / dim`; the
    /// points being sampled are kept. Device buffers are reallocated only when
    /// the problem size, the evaluator's backend or its device changed.
    ///
    /// On error the state keeps its previous candidates and temporaries.
    pub fn setup_state(
        &mut self,
        evaluator: &ExpectedImprovementEvaluator<'_, G, B>,
        points_to_sample: &[f64],
    ) -> Result<()> {
        if evaluator.dim() != self.dim {
            return Err(EiError::InvalidConfiguration(format!(
                "evaluator has dim {}, state was built for dim {}",
                evaluator.dim(),
                self.dim
            )));
        }
        if points_to_sample.len() % self.dim != 0 {
            return Err(EiError::InvalidConfiguration(format!(
                "points_to_sample: {} values is not a whole number of {}-dimensional points",
                points_to_sample.len(),
                self.dim
            )));
        }

        let num_to_sample = points_to_sample.len() / self.dim;
        let num_derivatives = if self.gradients_enabled { num_to_sample } else { 0 };
        let num_union = num_to_sample + self.num_being_sampled;
        let sizes = Self::buffer_sizes(evaluator, num_union, num_to_sample, num_derivatives);
        if let Some(draws) = &self.random_draws {
            draws.check(sizes.random_numbers, self.gradients_enabled)?;
        }

        let union_of_points = Self::build_union_of_points(
            points_to_sample,
            &self.union_of_points[self.num_to_sample * self.dim..],
            num_to_sample,
            self.num_being_sampled,
            self.dim,
        )?;
        let points_state =
            evaluator
                .gaussian_process()
                .points_state(&union_of_points, num_union, num_derivatives)?;
        let temporaries = HostTemporaries::derive(
            evaluator.gaussian_process(),
            &points_state,
            sizes,
            num_derivatives,
        )?;

        let backend = evaluator.backend();
        let device_id = evaluator.device_id();
        let mut buffers = match self.buffers.take() {
            Some(buffers) if buffers.fits(sizes, backend, device_id) => buffers,
            stale => {
                // Free the old set before allocating the new one.
                drop(stale);
                debug!(
                    "Reallocating EI state buffers ({} union points, device {})",
                    num_union, device_id
                );
                match DeviceBuffers::allocate(
                    backend,
                    sizes,
                    device_id,
                    self.random_draws.as_ref(),
                    self.gradients_enabled,
                ) {
                    Ok(buffers) => buffers,
                    Err(e) => {
                        self.restore_buffers(evaluator);
                        return Err(e);
                    }
                }
            }
        };
        if let Err(e) = temporaries.upload(&mut buffers) {
            drop(buffers);
            self.restore_buffers(evaluator);
            return Err(e);
        }

        self.union_of_points = union_of_points;
        self.points_state = points_state;
        self.num_to_sample = num_to_sample;
        self.num_derivatives = num_derivatives;
        self.sizes = sizes;
        self.temporaries = temporaries;
        self.buffers = Some(buffers);

        trace!(
            "Uploaded GP temporaries for {} union points ({} derivative points)",
            num_union,
            num_derivatives
        );
        Ok(())
    }

    /// Reallocate buffers for the committed sizes and upload the committed
    /// temporaries after a failed resize. Leaves no buffers if that fails too.
    fn restore_buffers(&mut self, evaluator: &ExpectedImprovementEvaluator<'_, G, B>) {
        let restored = DeviceBuffers::allocate(
            evaluator.backend(),
            self.sizes,
            evaluator.device_id(),
            self.random_draws.as_ref(),
            self.gradients_enabled,
        )
        .and_then(|mut buffers| {
            self.temporaries.upload(&mut buffers)?;
            Ok(buffers)
        });
        match restored {
            Ok(buffers) => self.buffers = Some(buffers),
            Err(e) => {
                warn!("Could not restore EI state buffers: {}", e);
                self.buffers = None;
            }
        }
    }

    /// Buffers for a dispatch through `backend` on `device_id`.
    pub(super) fn dispatch_buffers(
        &mut self,
        backend: &Arc<B>,
        device_id: usize,
    ) -> Result<&mut DeviceBuffers<B>> {
        match self.buffers.as_mut() {
            Some(buffers) if buffers.bound_to(backend, device_id) => Ok(buffers),
            Some(buffers) => Err(EiError::InvalidState(format!(
                "state buffers live on {} device {}, evaluator targets {} device {}; call setup_state",
                buffers.backend.name(),
                buffers.device_id,
                backend.name(),
                device_id
            ))),
            None => Err(EiError::InvalidState(
                "state has no device buffers after a failed resize; call setup_state".to_string(),
            )),
        }
    }

    fn buffer_sizes(
        evaluator: &ExpectedImprovementEvaluator<'_, G, B>,
        num_union: usize,
        num_to_sample: usize,
        num_derivatives: usize,
    ) -> BufferSizes {
        let grid = evaluator.grid();
        let dim = evaluator.dim();
        let grad_slots = num_derivatives * dim;
        BufferSizes {
            mu: num_union,
            chol_var: num_union * num_union,
            grad_mu: grad_slots,
            grad_chol_var: grad_slots * num_union * num_union,
            ei_storage: grid.num_blocks,
            grad_ei_storage: grid.num_blocks * if num_derivatives > 0 { num_to_sample * dim } else { 0 },
            random_numbers: Self::get_vector_size(
                evaluator.num_mc(),
                grid.threads_per_block,
                grid.num_blocks,
                num_union,
            ),
        }
    }

    /// Next kernel seed; every dispatch advances the generator.
    pub(super) fn next_seed(&mut self) -> u64 {
        self.rng.next_u64()
    }

    /// Size of the gradient, `dim * num_to_sample`.
    pub fn get_problem_size(&self) -> usize {
        self.dim * self.num_to_sample
    }

    /// Spatial dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of candidate points.
    pub fn num_to_sample(&self) -> usize {
        self.num_to_sample
    }

    /// Number of points of running experiments.
    pub fn num_being_sampled(&self) -> usize {
        self.num_being_sampled
    }

    /// Total points in the union.
    pub fn num_union(&self) -> usize {
        self.num_to_sample + self.num_being_sampled
    }

    /// Points gradients are taken against.
    pub fn num_derivatives(&self) -> usize {
        self.num_derivatives
    }

    /// Whether the state supports gradient computation.
    pub fn gradients_enabled(&self) -> bool {
        self.gradients_enabled
    }

    /// Whether the kernels read fixed draws.
    pub fn uses_fixed_draws(&self) -> bool {
        self.random_draws.is_some()
    }

    /// Candidates followed by the points being sampled.
    pub fn union_of_points(&self) -> &[f64] {
        &self.union_of_points
    }

    /// Posterior mean at the union of points.
    pub fn mean(&self) -> &[f64] {
        &self.temporaries.mean
    }

    /// Lower Cholesky factor of the posterior covariance at the union of points.
    pub fn cholesky(&self) -> &[f64] {
        &self.temporaries.chol_var
    }

    /// Release the random generator, dropping the device buffers.
    pub fn into_rng(self) -> PhiloxRng {
        self.rng
    }
}

fn check_points(what: &str, points: &[f64], num_points: usize, dim: usize) -> Result<()> {
    if points.len() != num_points * dim {
        return Err(EiError::InvalidConfiguration(format!(
            "{what}: expected {num_points} points of dim {dim} ({} values), got {}",
            num_points * dim,
            points.len()
        )));
    }
    Ok(())
}
