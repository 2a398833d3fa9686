//! Language model provider abstraction, backends, and the retry/backoff policy
//! shared by every remote call.

pub mod any;
pub mod error;
pub mod http;
#[cfg(feature = "mock")]
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod provider;
pub mod retry;

pub use error::LlmError;
pub use provider::{GenerateOptions, LlmProvider, Message, Role};
pub use retry::{Exhausted, RetryPolicy, Retrier};
