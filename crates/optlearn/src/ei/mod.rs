//! Expected Improvement evaluator and its per-batch evaluation state.
//!
//! # Lifecycle
//!
//! 1. Build an [`ExpectedImprovementEvaluator`] from a fitted GP, a backend
//!    and an [`EiConfig`](optlearn_core::EiConfig). Construction activates the
//!    target device.
//! 2. Build one [`ExpectedImprovementState`] per candidate batch. The state
//!    owns its random generator, so concurrently used states never share a
//!    sequence.
//! 3. Call [`update_current_point`](ExpectedImprovementState::update_current_point)
//!    as the optimizer moves the candidates, then compute EI or its gradient.
//!
//! The evaluator borrows the GP, so the GP cannot be refit while an evaluator
//! exists. After a refit, build a new evaluator and call
//! [`setup_state`](ExpectedImprovementState::setup_state) on every state
//! that should keep being used.

mod draws;
mod evaluator;
mod state;

pub use draws::RandomDraws;
pub use evaluator::ExpectedImprovementEvaluator;
pub use state::ExpectedImprovementState;
