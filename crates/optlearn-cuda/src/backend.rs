//! CUDA implementation of [`ComputeBackend`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cudarc::driver::{CudaContext, CudaFunction, CudaSlice, CudaStream, LaunchConfig, PushKernelArg};
use cudarc::nvrtc::compile_ptx;
use parking_lot::RwLock;
use tracing::{debug, info, trace};

use optlearn_core::backend::{ComputeBackend, EiKernelArgs, GradEiKernelArgs, KernelParams};
use optlearn_core::error::{EiError, Result};
use optlearn_core::memory::MemoryTracker;

use crate::kernels::{EI_KERNEL, EI_KERNEL_SOURCE, GRAD_EI_KERNEL};

/// Context, stream and loaded kernels of the bound device.
struct BoundDevice {
    ordinal: usize,
    name: String,
    /// Keeps the primary context alive for the stream and functions.
    _context: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    ei_fn: CudaFunction,
    grad_ei_fn: CudaFunction,
}

impl BoundDevice {
    fn open(ordinal: usize) -> Result<Self> {
        let context = CudaContext::new(ordinal).map_err(|e| EiError::activation(ordinal, e))?;
        let name = context
            .name()
            .map_err(|e| EiError::activation(ordinal, format!("failed to get device name: {e}")))?;
        let stream = context.default_stream();

        let ptx = compile_ptx(EI_KERNEL_SOURCE).map_err(|e| {
            EiError::activation(ordinal, format!("NVRTC compilation failed: {e}"))
        })?;
        let module = context
            .load_module(ptx)
            .map_err(|e| EiError::activation(ordinal, format!("failed to load module: {e}")))?;
        let ei_fn = module
            .load_function(EI_KERNEL)
            .map_err(|e| EiError::activation(ordinal, e))?;
        let grad_ei_fn = module
            .load_function(GRAD_EI_KERNEL)
            .map_err(|e| EiError::activation(ordinal, e))?;

        Ok(Self {
            ordinal,
            name,
            _context: context,
            stream,
            ei_fn,
            grad_ei_fn,
        })
    }

    fn scratch(&self, len: usize) -> Result<CudaSlice<f64>> {
        self.stream
            .alloc_zeros::<f64>(len.max(1))
            .map_err(EiError::resource)
    }

    fn launch_config(params: &KernelParams) -> Result<LaunchConfig> {
        let shared = params
            .grid
            .threads_per_block
            .checked_mul(std::mem::size_of::<f64>())
            .ok_or_else(|| EiError::InvalidConfiguration("shared memory size overflows".to_string()))?;
        Ok(LaunchConfig {
            grid_dim: (kernel_u32(params.grid.num_blocks, "num_blocks")?, 1, 1),
            block_dim: (kernel_u32(params.grid.threads_per_block, "threads_per_block")?, 1, 1),
            shared_mem_bytes: kernel_u32(shared, "shared memory bytes")?,
        })
    }
}

/// Narrow a launch parameter to the kernel's 32-bit argument type.
fn kernel_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        EiError::InvalidConfiguration(format!("{what} = {value} exceeds the 32-bit kernel limit"))
    })
}

/// NVIDIA GPU backend.
///
/// The backend is bound to one device by its first successful
/// [`activate`](ComputeBackend::activate); activating another ordinal
/// afterwards fails. Use one backend per device.
pub struct CudaBackend {
    device: RwLock<Option<BoundDevice>>,
    device_count: usize,
    tracker: Arc<MemoryTracker>,
    total_launched: AtomicU64,
}

impl CudaBackend {
    /// Create an unbound backend.
    pub fn new() -> Result<Self> {
        let device_count = crate::cuda_device_count();
        if device_count == 0 {
            return Err(EiError::BackendUnavailable(
                "no CUDA device present".to_string(),
            ));
        }
        info!("Initializing CUDA backend ({} devices visible)", device_count);

        Ok(Self {
            device: RwLock::new(None),
            device_count,
            tracker: Arc::new(MemoryTracker::new()),
            total_launched: AtomicU64::new(0),
        })
    }

    /// Number of visible devices.
    pub fn device_count(&self) -> usize {
        self.device_count
    }

    /// Name of the bound device.
    pub fn device_name(&self) -> Option<String> {
        self.device.read().as_ref().map(|d| d.name.clone())
    }

    /// Total kernels launched so far.
    pub fn total_launched(&self) -> u64 {
        self.total_launched.load(Ordering::Relaxed)
    }

    fn with_device<T>(&self, f: impl FnOnce(&BoundDevice) -> Result<T>) -> Result<T> {
        let guard = self.device.read();
        let device = guard
            .as_ref()
            .ok_or_else(|| EiError::execution("no active CUDA device"))?;
        f(device)
    }
}

impl ComputeBackend for CudaBackend {
    type Buffer = CudaSlice<f64>;

    fn name(&self) -> &str {
        "cuda"
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

        let mut device = self.device.write();
        match device.as_ref() {
            Some(bound) if bound.ordinal != device_id => Err(EiError::activation(
                device_id,
                format!("backend already bound to device {}", bound.ordinal),
            )),
            Some(_) => Ok(()),
            None => {
                let bound = BoundDevice::open(device_id)?;
                info!("CUDA backend bound to device {} ({})", device_id, bound.name);
                *device = Some(bound);
                Ok(())
            }
        }
    }

    fn active_device(&self) -> Option<usize> {
        self.device.read().as_ref().map(|d| d.ordinal)
    }

    fn allocate(&self, len: usize) -> Result<Self::Buffer> {
        let guard = self.device.read();
        let device = guard
            .as_ref()
            .ok_or_else(|| EiError::resource("allocation without an active device"))?;
        // Zero-length allocations are rejected by the driver.
        device
            .stream
            .alloc_zeros::<f64>(len.max(1))
            .map_err(EiError::resource)
    }

    fn copy_to_device(&self, src: &[f64], dst: &mut Self::Buffer) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        if src.len() > dst.len() {
            return Err(EiError::execution(format!(
                "host to device copy of {} values into buffer of {}",
                src.len(),
                dst.len()
            )));
        }
        self.with_device(|device| {
            let mut view = dst.slice_mut(0..src.len());
            device
                .stream
                .memcpy_htod(src, &mut view)
                .map_err(|e| EiError::execution(format!("HtoD copy failed: {e}")))
        })
    }

    fn copy_to_host(&self, src: &Self::Buffer, dst: &mut [f64]) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        if dst.len() > src.len() {
            return Err(EiError::execution(format!(
                "device to host copy of {} values from buffer of {}",
                dst.len(),
                src.len()
            )));
        }
        self.with_device(|device| {
            let view = src.slice(0..dst.len());
            device
                .stream
                .memcpy_dtoh(&view, dst)
                .map_err(|e| EiError::execution(format!("DtoH copy failed: {e}")))
        })
    }

    fn launch_ei(&self, args: EiKernelArgs<'_, Self::Buffer>) -> Result<()> {
        let params = args.params;
        self.with_device(|device| {
            let config = BoundDevice::launch_config(&params)?;
            let num_union = kernel_u32(params.num_union, "num_union")?;
            let draws_per_thread = kernel_u32(params.draws_per_thread, "draws_per_thread")?;
            let mut scratch = device.scratch(params.grid.total_threads() * params.num_union)?;
            let use_fixed = i32::from(args.random_numbers.is_some());
            let random = args.random_numbers.unwrap_or(args.mu);

            // SAFETY: Kernel arguments match the compiled signature of `ei_kernel`.
            // Every buffer holds at least the number of values the kernel reads for
            // these parameters; the random buffer is only read when use_fixed is set.
            unsafe {
                device
                    .stream
                    .launch_builder(&device.ei_fn)
                    .arg(args.mu)
                    .arg(args.chol_var)
                    .arg(args.ei_storage)
                    .arg(random)
                    .arg(&mut scratch)
                    .arg(&use_fixed)
                    .arg(&num_union)
                    .arg(&draws_per_thread)
                    .arg(&params.best_so_far)
                    .arg(&params.seed)
                    .launch(config)
                    .map_err(|e| EiError::execution(format!("ei kernel launch failed: {e}")))?;
            }
            device
                .stream
                .synchronize()
                .map_err(|e| EiError::execution(format!("ei kernel failed: {e}")))?;

            trace!(
                "ei kernel: {} blocks x {} threads on device {}",
                params.grid.num_blocks,
                params.grid.threads_per_block,
                device.ordinal
            );
            Ok(())
        })?;
        self.total_launched.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn launch_grad_ei(&self, args: GradEiKernelArgs<'_, Self::Buffer>) -> Result<()> {
        let params = args.params;
        self.with_device(|device| {
            let slots = params.num_to_sample * params.dim;
            let config = BoundDevice::launch_config(&params)?;
            let num_union = kernel_u32(params.num_union, "num_union")?;
            let num_to_sample = kernel_u32(params.num_to_sample, "num_to_sample")?;
            let dim = kernel_u32(params.dim, "dim")?;
            let draws_per_thread = kernel_u32(params.draws_per_thread, "draws_per_thread")?;
            let mut scratch =
                device.scratch(params.grid.total_threads() * (params.num_union + slots))?;
            let use_fixed = i32::from(args.random_numbers.is_some());
            let random = args.random_numbers.unwrap_or(args.mu);

            // SAFETY: Kernel arguments match the compiled signature of
            // `grad_ei_kernel`. Buffer sizes follow the layouts of KernelParams.
            unsafe {
                device
                    .stream
                    .launch_builder(&device.grad_ei_fn)
                    .arg(args.mu)
                    .arg(args.chol_var)
                    .arg(args.grad_mu)
                    .arg(args.grad_chol_var)
                    .arg(args.grad_ei_storage)
                    .arg(random)
                    .arg(&mut scratch)
                    .arg(&use_fixed)
                    .arg(&num_union)
                    .arg(&num_to_sample)
                    .arg(&dim)
                    .arg(&draws_per_thread)
                    .arg(&params.best_so_far)
                    .arg(&params.seed)
                    .launch(config)
                    .map_err(|e| EiError::execution(format!("grad ei kernel launch failed: {e}")))?;
            }
            device
                .stream
                .synchronize()
                .map_err(|e| EiError::execution(format!("grad ei kernel failed: {e}")))?;

            debug!(
                "grad ei kernel: {} blocks x {} threads, {} slots on device {}",
                params.grid.num_blocks, params.grid.threads_per_block, slots, device.ordinal
            );
            Ok(())
        })?;
        self.total_launched.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use optlearn_core::launch::LaunchGrid;

    fn params(threads_per_block: usize, num_blocks: usize) -> KernelParams {
        KernelParams {
            num_union: 3,
            num_to_sample: 2,
            dim: 2,
            best_so_far: 0.0,
            draws_per_thread: 1,
            grid: LaunchGrid {
                threads_per_block,
                num_blocks,
            },
            seed: 0,
        }
    }

    #[test]
    fn test_launch_config_dimensions() {
        let config = BoundDevice::launch_config(&params(256, 32)).unwrap();
        assert_eq!(config.grid_dim, (32, 1, 1));
        assert_eq!(config.block_dim, (256, 1, 1));
        assert_eq!(config.shared_mem_bytes, 256 * 8);
    }

    #[test]
    fn test_oversized_launch_rejected() {
        let too_many = u32::MAX as usize + 1;
        assert!(matches!(
            BoundDevice::launch_config(&params(32, too_many)),
            Err(EiError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            BoundDevice::launch_config(&params(u32::MAX as usize, 1)),
            Err(EiError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            kernel_u32(too_many, "num_union"),
            Err(EiError::InvalidConfiguration(_))
        ));
        assert_eq!(kernel_u32(7, "dim").unwrap(), 7);
    }
}
