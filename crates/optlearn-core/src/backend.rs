//! Compute backend contract.
//!
//! A backend provides the four device primitives the evaluator needs:
//! activation, allocation, host/device copies and the Monte-Carlo EI kernel
//! launches. Every primitive returns a [`Result`]; backend status codes are
//! converted to [`EiError`](crate::error::EiError) carrying the backend's
//! own diagnostic message.
//!
//! # Kernel output layout
//!
//! Each block writes one partial sum. `launch_ei` fills
//! `ei_storage[num_blocks]`; `launch_grad_ei` fills
//! `grad_ei_storage[num_blocks][num_to_sample][dim]`. The host sums the
//! partials and divides by the effective draw count.
//!
//! # Draw assignment
//!
//! Global thread `t = block * threads_per_block + thread` performs draws
//! `k = 0..draws_per_thread`. With on-device generation thread `t` reads
//! Philox stream `(seed, t)`; with fixed draws the normal for thread `t`,
//! draw `k`, point `i` sits at `((t * draws_per_thread) + k) * num_union + i`.

use std::sync::Arc;

use crate::error::Result;
use crate::launch::LaunchGrid;
use crate::memory::MemoryTracker;

/// Scalar parameters shared by both EI kernels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelParams {
    /// Points in the union (`num_to_sample + num_being_sampled`).
    pub num_union: usize,
    /// Candidate points (gradients are taken w.r.t. these).
    pub num_to_sample: usize,
    /// Spatial dimension.
    pub dim: usize,
    /// Incumbent best objective value.
    pub best_so_far: f64,
    /// Monte-Carlo draws performed by every thread.
    pub draws_per_thread: usize,
    /// Execution grid.
    pub grid: LaunchGrid,
    /// Kernel seed for on-device normal generation.
    pub seed: u64,
}

impl KernelParams {
    /// Total draws performed by the dispatch.
    pub fn effective_draws(&self) -> usize {
        self.draws_per_thread * self.grid.total_threads()
    }

    /// Length of the fixed draw buffer this dispatch reads.
    pub fn random_numbers_len(&self) -> usize {
        self.effective_draws() * self.num_union
    }

    /// Length of the EI partial-sum buffer.
    pub fn ei_storage_len(&self) -> usize {
        self.grid.num_blocks
    }

    /// Length of the grad-EI partial-sum buffer.
    pub fn grad_ei_storage_len(&self) -> usize {
        self.grid.num_blocks * self.num_to_sample * self.dim
    }
}

/// Buffers read and written by the EI kernel.
pub struct EiKernelArgs<'a, Buf> {
    /// GP mean at the union of points, `[num_union]`.
    pub mu: &'a Buf,
    /// Lower Cholesky factor of the GP covariance, `[num_union][num_union]`.
    pub chol_var: &'a Buf,
    /// Per-block partial sums, `[num_blocks]`.
    pub ei_storage: &'a mut Buf,
    /// Fixed normal draws replacing on-device generation.
    pub random_numbers: Option<&'a Buf>,
    /// Scalar parameters.
    pub params: KernelParams,
}

/// Buffers read and written by the grad-EI kernel.
pub struct GradEiKernelArgs<'a, Buf> {
    /// GP mean at the union of points, `[num_union]`.
    pub mu: &'a Buf,
    /// Lower Cholesky factor of the GP covariance, `[num_union][num_union]`.
    pub chol_var: &'a Buf,
    /// Gradient of the mean, `[num_to_sample][dim]`.
    pub grad_mu: &'a Buf,
    /// Gradient of the Cholesky factor, `[num_to_sample][dim][num_union][num_union]`.
    pub grad_chol_var: &'a Buf,
    /// Per-block partial sums, `[num_blocks][num_to_sample][dim]`.
    pub grad_ei_storage: &'a mut Buf,
    /// Fixed normal draws replacing on-device generation.
    pub random_numbers: Option<&'a Buf>,
    /// Scalar parameters.
    pub params: KernelParams,
}

/// Device primitives used by the Expected Improvement evaluator.
///
/// One backend instance is bound to one device. Independent states may use
/// the same backend from different threads; serialization of launches on the
/// device is the backend's responsibility.
pub trait ComputeBackend: Send + Sync {
    /// Handle to one device allocation of f64 values. Dropping it frees the memory.
    type Buffer: Send;

    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Tracker recording every [`DeviceBuffer`](crate::memory::DeviceBuffer) allocation.
    fn memory_tracker(&self) -> &Arc<MemoryTracker>;

    /// Bind the backend to `device_id` for subsequent allocation and dispatch.
    fn activate(&self, device_id: usize) -> Result<()>;

    /// Device the backend is bound to, if activated.
    fn active_device(&self) -> Option<usize>;

    /// Allocate `len` zero-initialized values.
    fn allocate(&self, len: usize) -> Result<Self::Buffer>;

    /// Copy `src` into the start of `dst`.
    fn copy_to_device(&self, src: &[f64], dst: &mut Self::Buffer) -> Result<()>;

    /// Copy the start of `src` into `dst`.
    fn copy_to_host(&self, src: &Self::Buffer, dst: &mut [f64]) -> Result<()>;

    /// Run the EI kernel and block until the partial sums are written.
    fn launch_ei(&self, args: EiKernelArgs<'_, Self::Buffer>) -> Result<()>;

    /// Run the grad-EI kernel and block until the partial sums are written.
    fn launch_grad_ei(&self, args: GradEiKernelArgs<'_, Self::Buffer>) -> Result<()>;
}
