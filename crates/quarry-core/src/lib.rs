//! Configuration, retrieval, grounded synthesis and the pipeline coordinator.

pub mod config;
pub mod coordinator;
pub mod job;
pub mod retriever;
pub mod synthesis;

pub use config::Config;
pub use coordinator::{
    Coordinator, CoordinatorError, DocumentOutcome, IngestReport, RebuildReport, StatusReport,
};
pub use job::{ContextItem, FailureReason, JobStatus, SynthesisJob};
pub use retriever::{Provenance, RetrievalError, RetrievalResult, RetrievedChunk, Retriever};
pub use synthesis::{SynthesisEngine, SynthesisError};
