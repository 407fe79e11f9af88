//! CPU implementation of [`ComputeBackend`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rayon::prelude::*;
use tracing::{debug, info, trace};

use optlearn_core::backend::{ComputeBackend, EiKernelArgs, GradEiKernelArgs, KernelParams};
use optlearn_core::error::{EiError, Result};
use optlearn_core::memory::MemoryTracker;

use crate::kernel;

/// Host-side emulation of a GPU device.
///
/// Buffers are plain `Vec<f64>` and every block of the launch grid runs as a
/// rayon task. Block partial sums are computed sequentially within a block, so
/// results are bit-for-bit reproducible for a given seed and grid.
pub struct CpuBackend {
    /// Number of emulated devices.
    device_count: usize,
    /// Optional cap on live device memory, in f64 elements.
    memory_limit: Option<usize>,
    /// Device this backend is bound to.
    active: RwLock<Option<usize>>,
    /// Allocation bookkeeping shared with every buffer.
    tracker: Arc<MemoryTracker>,
    /// Total kernels launched.
    total_launched: AtomicU64,
}

impl CpuBackend {
    /// Create a backend emulating a single device.
    pub fn new() -> Self {
        Self::with_device_count(1)
    }

    /// Create a backend emulating `device_count` devices.
    pub fn with_device_count(device_count: usize) -> Self {
        info!("Initializing CPU backend ({} emulated devices)", device_count);
        Self {
            device_count,
            memory_limit: None,
            active: RwLock::new(None),
            tracker: Arc::new(MemoryTracker::new()),
            total_launched: AtomicU64::new(0),
        }
    }

    /// Fail allocations once live memory would exceed `limit` f64 values.
    #[must_use]
    pub fn with_memory_limit(mut self, limit: usize) -> Self {
        self.memory_limit = Some(limit);
        self
    }

    /// Number of emulated devices.
    pub fn device_count(&self) -> usize {
        self.device_count
    }

    /// Total kernels launched so far.
    pub fn total_launched(&self) -> u64 {
        self.total_launched.load(Ordering::Relaxed)
    }

    fn require_active(&self, what: &str) -> Result<usize> {
        self.active
            .read()
            .ok_or_else(|| EiError::execution(format!("{what}: no active device")))
    }

    fn check_input(what: &str, buf: &[f64], required: usize) -> Result<()> {
        if buf.len() < required {
            return Err(EiError::execution(format!(
                "{what}: buffer holds {} values, kernel reads {required}",
                buf.len()
            )));
        }
        Ok(())
    }

    fn check_common(
        params: &KernelParams,
        mu: &[f64],
        chol: &[f64],
        random: Option<&[f64]>,
    ) -> Result<()> {
        params.grid.validate().map_err(EiError::execution)?;
        let n = params.num_union;
        Self::check_input("mu", mu, n)?;
        Self::check_input("chol_var", chol, n * n)?;
        if let Some(random) = random {
            Self::check_input("random_numbers", random, params.random_numbers_len())?;
        }
        Ok(())
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeBackend for CpuBackend {
    type Buffer = Vec<f64>;

    fn name(&self) -> &str {
        "cpu"
    }

    fn memory_tracker(&self) -> &Arc<MemoryTracker> {
        &self.tracker
    }

    fn activate(&self, device_id: usize) -> Result<()> {
        if device_id >= self.device_count {
            return Err(EiError::activation(
                device_id,
                format!("invalid device ordinal ({} devices present)", self.device_count),
            ));
        }

        let mut active = self.active.write();
        match *active {
            Some(current) if current != device_id => Err(EiError::activation(
                device_id,
                format!("backend already bound to device {current}"),
            )),
            Some(_) => Ok(()),
            None => {
                debug!("CPU backend bound to device {}", device_id);
                *active = Some(device_id);
                Ok(())
            }
        }
    }

    fn active_device(&self) -> Option<usize> {
        *self.active.read()
    }

    fn allocate(&self, len: usize) -> Result<Self::Buffer> {
        if self.active.read().is_none() {
            return Err(EiError::resource("allocation without an active device"));
        }
        if let Some(limit) = self.memory_limit {
            let live = (self.tracker.current_usage() as usize) / std::mem::size_of::<f64>();
            if live + len > limit {
                return Err(EiError::resource(format!(
                    "out of memory: {len} values requested, {} of {limit} in use",
                    live
                )));
            }
        }
        Ok(vec![0.0; len])
    }

    fn copy_to_device(&self, src: &[f64], dst: &mut Self::Buffer) -> Result<()> {
        if src.len() > dst.len() {
            return Err(EiError::execution(format!(
                "host to device copy of {} values into buffer of {}",
                src.len(),
                dst.len()
            )));
        }
        dst[..src.len()].copy_from_slice(src);
        Ok(())
    }

    fn copy_to_host(&self, src: &Self::Buffer, dst: &mut [f64]) -> Result<()> {
        if dst.len() > src.len() {
            return Err(EiError::execution(format!(
                "device to host copy of {} values from buffer of {}",
                dst.len(),
                src.len()
            )));
        }
        dst.copy_from_slice(&src[..dst.len()]);
        Ok(())
    }

    fn launch_ei(&self, args: EiKernelArgs<'_, Self::Buffer>) -> Result<()> {
        self.require_active("ei kernel")?;
        let params = args.params;
        let random = args.random_numbers.map(Vec::as_slice);
        Self::check_common(&params, args.mu, args.chol_var, random)?;
        if args.ei_storage.len() < params.ei_storage_len() {
            return Err(EiError::execution("ei_storage smaller than the block count"));
        }

        let partials: Vec<f64> = (0..params.grid.num_blocks)
            .into_par_iter()
            .map(|block| kernel::ei_block_partial(&params, args.mu, args.chol_var, random, block))
            .collect();
        args.ei_storage[..partials.len()].copy_from_slice(&partials);

        self.total_launched.fetch_add(1, Ordering::Relaxed);
        trace!(
            "ei kernel: {} blocks x {} threads, {} draws/thread",
            params.grid.num_blocks,
            params.grid.threads_per_block,
            params.draws_per_thread
        );
        Ok(())
    }

    fn launch_grad_ei(&self, args: GradEiKernelArgs<'_, Self::Buffer>) -> Result<()> {
        self.require_active("grad ei kernel")?;
        let params = args.params;
        let random = args.random_numbers.map(Vec::as_slice);
        Self::check_common(&params, args.mu, args.chol_var, random)?;
        let slots = params.num_to_sample * params.dim;
        let n = params.num_union;
        Self::check_input("grad_mu", args.grad_mu, slots)?;
        Self::check_input("grad_chol_var", args.grad_chol_var, slots * n * n)?;
        if args.grad_ei_storage.len() < params.grad_ei_storage_len() {
            return Err(EiError::execution(
                "grad_ei_storage smaller than blocks x gradient size",
            ));
        }

        let partials: Vec<Vec<f64>> = (0..params.grid.num_blocks)
            .into_par_iter()
            .map(|block| {
                kernel::grad_ei_block_partial(
                    &params,
                    args.mu,
                    args.chol_var,
                    args.grad_mu,
                    args.grad_chol_var,
                    random,
                    block,
                )
            })
            .collect();
        for (block, partial) in partials.iter().enumerate() {
            args.grad_ei_storage[block * slots..(block + 1) * slots].copy_from_slice(partial);
        }

        self.total_launched.fetch_add(1, Ordering::Relaxed);
        trace!(
            "grad ei kernel: {} blocks x {} threads, {} gradient slots",
            params.grid.num_blocks,
            params.grid.threads_per_block,
            slots
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use optlearn_core::memory::DeviceBuffer;
    use optlearn_core::LaunchGrid;

    fn params() -> KernelParams {
        KernelParams {
            num_union: 1,
            num_to_sample: 1,
            dim: 1,
            best_so_far: 0.0,
            draws_per_thread: 4,
            grid: LaunchGrid::new(8, 4),
            seed: 99,
        }
    }

    #[test]
    fn test_activate_binds_once() {
        let backend = CpuBackend::with_device_count(2);
        assert_eq!(backend.active_device(), None);
        backend.activate(1).unwrap();
        backend.activate(1).unwrap();
        assert_eq!(backend.active_device(), Some(1));

        let err = backend.activate(0).unwrap_err();
        assert!(matches!(err, EiError::GpuActivation { device_id: 0, .. }));
    }

    #[test]
    fn test_activate_invalid_ordinal() {
        let backend = CpuBackend::new();
        let err = backend.activate(3).unwrap_err();
        assert!(matches!(err, EiError::GpuActivation { device_id: 3, .. }));
        assert_eq!(backend.active_device(), None);
    }

    #[test]
    fn test_allocate_requires_device() {
        let backend = CpuBackend::new();
        assert!(matches!(
            backend.allocate(4),
            Err(EiError::GpuResource { .. })
        ));
    }

    #[test]
    fn test_memory_limit() {
        let backend = CpuBackend::new().with_memory_limit(10);
        backend.activate(0).unwrap();
        let first = DeviceBuffer::new(&backend, 8, "mu").unwrap();
        let err = DeviceBuffer::new(&backend, 4, "chol").unwrap_err();
        assert!(matches!(err, EiError::GpuResource { .. }));
        drop(first);
        assert!(DeviceBuffer::new(&backend, 4, "chol").is_ok());
    }

    #[test]
    fn test_buffers_tracked_and_released() {
        let backend = CpuBackend::new();
        backend.activate(0).unwrap();
        {
            let mut buf = DeviceBuffer::new(&backend, 3, "mu").unwrap();
            buf.upload(&backend, &[1.0, 2.0, 3.0]).unwrap();
            let mut out = [0.0; 3];
            buf.download(&backend, &mut out).unwrap();
            assert_eq!(out, [1.0, 2.0, 3.0]);
            assert_eq!(backend.memory_tracker().allocation_count(), 1);
            assert_eq!(buf.device_id(), Some(0));
        }
        assert_eq!(backend.memory_tracker().allocation_count(), 0);
        assert_eq!(backend.memory_tracker().current_usage(), 0);
    }

    #[test]
    fn test_launch_ei_writes_block_partials() {
        let backend = CpuBackend::new();
        backend.activate(0).unwrap();
        let p = params();
        let mu = vec![0.0];
        let chol = vec![1.0];
        let mut storage = backend.allocate(p.ei_storage_len()).unwrap();

        backend
            .launch_ei(EiKernelArgs {
                mu: &mu,
                chol_var: &chol,
                ei_storage: &mut storage,
                random_numbers: None,
                params: p,
            })
            .unwrap();

        assert_eq!(storage.len(), 4);
        assert!(storage.iter().all(|s| *s >= 0.0));
        assert!(storage.iter().sum::<f64>() > 0.0);
        assert_eq!(backend.total_launched(), 1);
    }

    #[test]
    fn test_launch_rejects_short_buffers() {
        let backend = CpuBackend::new();
        backend.activate(0).unwrap();
        let p = KernelParams { num_union: 2, ..params() };
        let mu = vec![0.0];
        let chol = vec![1.0; 4];
        let mut storage = vec![0.0; 4];
        let err = backend
            .launch_ei(EiKernelArgs {
                mu: &mu,
                chol_var: &chol,
                ei_storage: &mut storage,
                random_numbers: None,
                params: p,
            })
            .unwrap_err();
        assert!(matches!(err, EiError::GpuExecution { .. }));
    }

    #[test]
    fn test_launch_without_device() {
        let backend = CpuBackend::new();
        let mu = vec![0.0];
        let chol = vec![1.0];
        let mut storage = vec![0.0; 4];
        let err = backend
            .launch_ei(EiKernelArgs {
                mu: &mu,
                chol_var: &chol,
                ei_storage: &mut storage,
                random_numbers: None,
                params: params(),
            })
            .unwrap_err();
        assert!(matches!(err, EiError::GpuExecution { .. }));
    }
}
