//! CPU Backend for optlearn
//!
//! Executes the Monte-Carlo Expected Improvement kernels on the host,
//! emulating the device grid block by block. It is the reference
//! implementation of the kernel semantics and the backend used by tests and
//! by hosts without a GPU.

#![warn(missing_docs)]

mod backend;
pub mod kernel;

pub use backend::CpuBackend;
