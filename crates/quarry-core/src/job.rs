//! The record of one query: what was retrieved, what the model said, and how it ended.

use std::collections::BTreeMap;
use std::fmt;

use quarry_memory::{ChunkId, DocumentId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a query did not produce an answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// Nothing has been indexed yet.
    NoContext,
    PromptTooLarge { required: usize, budget: usize },
    /// Transient model failures outlasted the retry policy.
    ModelUnavailable { attempts: u32, message: String },
    /// The model refused the request in a way retrying cannot fix.
    ModelRejected { message: String },
    RetrievalFailed { message: String },
    Cancelled,
}

impl FailureReason {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoContext => "no_context",
            Self::PromptTooLarge { .. } => "prompt_too_large",
            Self::ModelUnavailable { .. } => "model_unavailable",
            Self::ModelRejected { .. } => "model_rejected",
            Self::RetrievalFailed { .. } => "retrieval_failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoContext => f.write_str("no indexed content to answer from"),
            Self::PromptTooLarge { required, budget } => write!(
                f,
                "query needs {required} prompt tokens but the budget is {budget}"
            ),
            Self::ModelUnavailable { attempts, message } => {
                write!(f, "model unavailable after {attempts} attempt(s): {message}")
            }
            Self::ModelRejected { message } => write!(f, "model rejected the request: {message}"),
            Self::RetrievalFailed { message } => write!(f, "retrieval failed: {message}"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// A chunk as it appeared in the prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub marker: usize,
    pub chunk_id: ChunkId,
    pub document_id: DocumentId,
    pub source_uri: String,
    pub title: Option<String>,
    pub score: f32,
    pub text: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid job transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// State machine `pending -> running -> succeeded | failed`. A pending job may also
/// fail directly. Terminal jobs never change again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisJob {
    id: Uuid,
    query: String,
    status: JobStatus,
    retrieved_context: Vec<ContextItem>,
    answer: Option<String>,
    citations: BTreeMap<usize, ChunkId>,
    citation_warning: Option<String>,
    failure: Option<FailureReason>,
}

impl SynthesisJob {
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            query: query.into(),
            status: JobStatus::Pending,
            retrieved_context: Vec::new(),
            answer: None,
            citations: BTreeMap::new(),
            citation_warning: None,
            failure: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn query(&self) -> &str {
        &self.query
    }

    #[must_use]
    pub fn status(&self) -> JobStatus {
        self.status
    }

    #[must_use]
    pub fn retrieved_context(&self) -> &[ContextItem] {
        &self.retrieved_context
    }

    #[must_use]
    pub fn answer(&self) -> Option<&str> {
        self.answer.as_deref()
    }

    #[must_use]
    pub fn citations(&self) -> &BTreeMap<usize, ChunkId> {
        &self.citations
    }

    #[must_use]
    pub fn citation_warning(&self) -> Option<&str> {
        self.citation_warning.as_deref()
    }

    #[must_use]
    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    /// # Errors
    ///
    /// Returns [`InvalidTransition`] unless the job is pending.
    pub fn start(&mut self) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Running)
    }

    /// Record the context placed in the prompt. Only meaningful while running.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] unless the job is running.
    pub fn set_context(&mut self, context: Vec<ContextItem>) -> Result<(), InvalidTransition> {
        if self.status != JobStatus::Running {
            return Err(InvalidTransition {
                from: self.status,
                to: JobStatus::Running,
            });
        }
        self.retrieved_context = context;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`InvalidTransition`] unless the job is running.
    pub fn succeed(
        &mut self,
        answer: String,
        citations: BTreeMap<usize, ChunkId>,
        citation_warning: Option<String>,
    ) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Succeeded)?;
        self.answer = Some(answer);
        self.citations = citations;
        self.citation_warning = citation_warning;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`InvalidTransition`] if the job already finished.
    pub fn fail(&mut self, reason: FailureReason) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Failed)?;
        self.failure = Some(reason);
        Ok(())
    }

    fn transition(&mut self, to: JobStatus) -> Result<(), InvalidTransition> {
        let allowed = matches!(
            (self.status, to),
            (JobStatus::Pending, JobStatus::Running | JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Succeeded | JobStatus::Failed)
        );
        if !allowed {
            return Err(InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut job = SynthesisJob::new("why?");
        assert_eq!(job.status(), JobStatus::Pending);
        job.start().unwrap();
        job.succeed("because [1]".into(), BTreeMap::new(), None)
            .unwrap();
        assert_eq!(job.status(), JobStatus::Succeeded);
        assert_eq!(job.answer(), Some("because [1]"));
        assert!(job.failure().is_none());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut job = SynthesisJob::new("q");
        job.start().unwrap();
        job.fail(FailureReason::Cancelled).unwrap();
        assert_eq!(
            job.succeed(String::new(), BTreeMap::new(), None),
            Err(InvalidTransition {
                from: JobStatus::Failed,
                to: JobStatus::Succeeded
            })
        );
        assert!(job.fail(FailureReason::NoContext).is_err());
        assert!(job.start().is_err());
        assert_eq!(job.failure(), Some(&FailureReason::Cancelled));
    }

    #[test]
    fn cannot_succeed_without_running() {
        let mut job = SynthesisJob::new("q");
        assert!(job.succeed("a".into(), BTreeMap::new(), None).is_err());
        assert!(job.set_context(Vec::new()).is_err());
        job.fail(FailureReason::NoContext).unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
    }

    #[test]
    fn serializes_failure_reason_with_code() {
        let mut job = SynthesisJob::new("q");
        job.fail(FailureReason::PromptTooLarge {
            required: 10,
            budget: 5,
        })
        .unwrap();
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["failure"]["reason"], "prompt_too_large");
        assert_eq!(value["failure"]["budget"], 5);

        let back: SynthesisJob = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn reason_codes() {
        assert_eq!(FailureReason::NoContext.code(), "no_context");
        assert_eq!(
            FailureReason::ModelRejected {
                message: "bad".into()
            }
            .code(),
            "model_rejected"
        );
    }
}
