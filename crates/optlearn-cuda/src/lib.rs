//! CUDA Backend for optlearn
//!
//! NVIDIA GPU support for the Monte-Carlo Expected Improvement kernels using
//! cudarc. Kernels are compiled from CUDA C at device activation via NVRTC.
//!
//! # Requirements
//!
//! - NVIDIA GPU with double precision support
//! - CUDA Toolkit 11.0+ (driver and NVRTC libraries)
//! - The `cuda` feature of this crate
//!
//! # Example
//!
//! ```ignore
//! use optlearn_core::ComputeBackend;
//! use optlearn_cuda::CudaBackend;
//!
//! let backend = CudaBackend::new()?;
//! backend.activate(0)?;
//! ```

#![warn(missing_docs)]

pub mod kernels;

#[cfg(feature = "cuda")]
mod backend;

#[cfg(feature = "cuda")]
pub use backend::CudaBackend;

// Placeholder implementation when CUDA is not available
#[cfg(not(feature = "cuda"))]
mod stub {
    use std::sync::Arc;

    use optlearn_core::backend::{ComputeBackend, EiKernelArgs, GradEiKernelArgs};
    use optlearn_core::error::{EiError, Result};
    use optlearn_core::memory::MemoryTracker;

    /// Stub CUDA backend when the CUDA feature is disabled.
    pub struct CudaBackend {
        tracker: Arc<MemoryTracker>,
    }

    impl CudaBackend {
        /// Create fails when CUDA is not available.
        pub fn new() -> Result<Self> {
            Err(EiError::BackendUnavailable(
                "CUDA feature not enabled".to_string(),
            ))
        }
    }

    fn unavailable<T>() -> Result<T> {
        Err(EiError::BackendUnavailable("CUDA".to_string()))
    }

    impl ComputeBackend for CudaBackend {
        type Buffer = ();

        fn name(&self) -> &str {
            "cuda"
        }

        fn memory_tracker(&self) -> &Arc<MemoryTracker> {
            &self.tracker
        }

        fn activate(&self, _device_id: usize) -> Result<()> {
            unavailable()
        }

        fn active_device(&self) -> Option<usize> {
            None
        }

        fn allocate(&self, _len: usize) -> Result<()> {
            unavailable()
        }

        fn copy_to_device(&self, _src: &[f64], _dst: &mut ()) -> Result<()> {
            unavailable()
        }

        fn copy_to_host(&self, _src: &(), _dst: &mut [f64]) -> Result<()> {
            unavailable()
        }

        fn launch_ei(&self, _args: EiKernelArgs<'_, ()>) -> Result<()> {
            unavailable()
        }

        fn launch_grad_ei(&self, _args: GradEiKernelArgs<'_, ()>) -> Result<()> {
            unavailable()
        }
    }
}

#[cfg(not(feature = "cuda"))]
pub use stub::CudaBackend;

/// Check if CUDA is available at runtime.
///
/// This function returns false if:
/// - CUDA feature is not enabled
/// - CUDA libraries are not installed on the system
/// - No CUDA devices are present
///
/// It safely catches panics from cudarc when CUDA is not installed.
pub fn is_cuda_available() -> bool {
    cuda_device_count() > 0
}

/// Number of visible CUDA devices, zero when CUDA cannot be loaded.
pub fn cuda_device_count() -> usize {
    #[cfg(feature = "cuda")]
    {
        // cudarc panics if CUDA libraries are not found, so we catch that
        std::panic::catch_unwind(|| {
            cudarc::driver::CudaContext::device_count()
                .map(|c| c.max(0) as usize)
                .unwrap_or(0)
        })
        .unwrap_or(0)
    }
    #[cfg(not(feature = "cuda"))]
    {
        0
    }
}
