//! Random number generators for GPU Monte-Carlo.
//!
//! Counter-based generators suit device execution:
//! - Stateless (state is the counter value)
//! - Parallel-friendly (each thread keys its own stream)
//! - Reproducible (same seed, stream and counter give the same output)

mod philox;
mod traits;

pub use philox::{philox4x32_10, PhiloxRng, PhiloxState};
pub use traits::NormalSource;
