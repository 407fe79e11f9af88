//! Counter-based random numbers for Monte-Carlo Expected Improvement.
//!
//! The same Philox4x32-10 generator runs on the host (one move-only handle per
//! evaluation state) and inside the device kernels (one stream per device
//! thread), so CPU emulation and CUDA dispatch consume identical sequences.
//!
//! # Example
//!
//! ```
//! use optlearn_montecarlo::prelude::*;
//!
//! let mut rng = PhiloxRng::new(42, 0);
//! let kernel_seed = rng.next_u64();
//! let mut thread_stream = PhiloxRng::new(kernel_seed, 7);
//! let z = thread_stream.next_normal();
//! assert!(z.is_finite());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod rng;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::rng::{NormalSource, PhiloxRng, PhiloxState};
}

pub use rng::{NormalSource, PhiloxRng, PhiloxState};
