//! Grounded answer synthesis: prompt assembly under a token budget, the model call,
//! and citation validation.

pub mod citations;
mod engine;
pub mod prompt;

pub use engine::{SynthesisEngine, SynthesisError};
