use std::sync::Arc;

use quarry_llm::{GenerateOptions, LlmError, LlmProvider, Retrier};
use tokio_util::sync::CancellationToken;

use super::citations;
use super::prompt::{self, PromptTooLarge};
use crate::config::SynthesisConfig;
use crate::job::{ContextItem, FailureReason, InvalidTransition, SynthesisJob};
use crate::retriever::RetrievalResult;

#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error("prompt needs {required} tokens before any context, budget is {budget}")]
    PromptTooLarge { required: usize, budget: usize },

    #[error("model unavailable after {attempts} attempt(s): {source}")]
    ModelUnavailable { attempts: u32, source: LlmError },

    #[error("model rejected the request: {0}")]
    ModelRejected(LlmError),

    #[error("synthesis cancelled")]
    Cancelled,

    #[error(transparent)]
    Job(#[from] InvalidTransition),
}

impl From<PromptTooLarge> for SynthesisError {
    fn from(e: PromptTooLarge) -> Self {
        Self::PromptTooLarge {
            required: e.required,
            budget: e.budget,
        }
    }
}

impl SynthesisError {
    /// Structured reason recorded on a failed job.
    #[must_use]
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::PromptTooLarge { required, budget } => FailureReason::PromptTooLarge {
                required: *required,
                budget: *budget,
            },
            Self::ModelUnavailable { attempts, source } => FailureReason::ModelUnavailable {
                attempts: *attempts,
                message: source.to_string(),
            },
            Self::ModelRejected(source) => FailureReason::ModelRejected {
                message: source.to_string(),
            },
            Self::Cancelled => FailureReason::Cancelled,
            Self::Job(e) => FailureReason::ModelRejected {
                message: e.to_string(),
            },
        }
    }
}

/// Stateless prompt builder and model caller. Cheap to clone.
pub struct SynthesisEngine<P> {
    provider: Arc<P>,
    retrier: Retrier,
    config: SynthesisConfig,
}

impl<P> Clone for SynthesisEngine<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            retrier: self.retrier.clone(),
            config: self.config,
        }
    }
}

impl<P> std::fmt::Debug for SynthesisEngine<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthesisEngine")
            .field("config", &self.config)
            .field("retrier", &self.retrier)
            .finish_non_exhaustive()
    }
}

impl<P: LlmProvider> SynthesisEngine<P> {
    #[must_use]
    pub fn new(provider: Arc<P>, retrier: Retrier, config: SynthesisConfig) -> Self {
        Self {
            provider,
            retrier,
            config,
        }
    }

    /// Answer `query` from `context`, returning a finished job.
    pub async fn synthesize(
        &self,
        query: &str,
        context: RetrievalResult,
        cancel: &CancellationToken,
    ) -> SynthesisJob {
        let mut job = SynthesisJob::new(query);
        if let Err(e) = job.start() {
            tracing::error!(error = %e, "fresh job refused to start");
            return job;
        }
        self.complete(&mut job, context, cancel).await;
        job
    }

    /// Drive a running job to a terminal state. Errors become the job's failure reason.
    pub async fn complete(
        &self,
        job: &mut SynthesisJob,
        context: RetrievalResult,
        cancel: &CancellationToken,
    ) {
        if let Err(e) = self.run(job, context, cancel).await {
            let reason = e.reason();
            tracing::warn!(job = %job.id(), reason = reason.code(), error = %e, "synthesis failed");
            if let Err(t) = job.fail(reason) {
                tracing::error!(job = %job.id(), error = %t, "could not record synthesis failure");
            }
        }
    }

    async fn run(
        &self,
        job: &mut SynthesisJob,
        context: RetrievalResult,
        cancel: &CancellationToken,
    ) -> Result<(), SynthesisError> {
        let assembled = prompt::assemble(
            job.query(),
            context.into_items(),
            self.config.prompt_budget_tokens,
        )?;
        job.set_context(
            assembled
                .placed
                .iter()
                .map(|p| ContextItem {
                    marker: p.marker,
                    chunk_id: p.item.chunk.id,
                    document_id: p.item.chunk.document_id.clone(),
                    source_uri: p.item.provenance.source_uri.clone(),
                    title: p.item.provenance.title.clone(),
                    score: p.item.score,
                    text: p.item.chunk.text.clone(),
                })
                .collect(),
        )?;

        let options = GenerateOptions {
            max_tokens: self.config.max_answer_tokens,
            temperature: self.config.temperature,
        };
        let messages = assembled.messages;
        let answer = self
            .retrier
            .run("generate", cancel, || {
                self.provider.generate(&messages, &options)
            })
            .await
            .map_err(|e| {
                if e.is_cancelled() {
                    SynthesisError::Cancelled
                } else if e.source.is_transient() {
                    SynthesisError::ModelUnavailable {
                        attempts: e.attempts,
                        source: e.source,
                    }
                } else {
                    SynthesisError::ModelRejected(e.source)
                }
            })?;

        let answer = answer.trim().to_owned();
        let check = citations::check(&answer, &assembled.placed);
        let warning = check.warning();
        if let Some(w) = &warning {
            tracing::warn!(job = %job.id(), "{w}");
        }
        tracing::info!(
            job = %job.id(),
            context = assembled.placed.len(),
            dropped = assembled.dropped,
            prompt_tokens = assembled.tokens,
            citations = check.citations.len(),
            "answer synthesized"
        );
        job.succeed(answer, check.citations, warning)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use quarry_llm::mock::{MockFailure, MockProvider};
    use quarry_llm::RetryPolicy;
    use quarry_memory::{Chunk, ChunkId, DocumentId, DocumentMetadata, count_tokens};

    use super::*;
    use crate::job::JobStatus;
    use crate::retriever::{Provenance, RetrievedChunk};

    fn item(doc: &str, text: &str, score: f32) -> RetrievedChunk {
        let document_id = DocumentId::new(doc);
        RetrievedChunk {
            chunk: Chunk {
                id: ChunkId::derive(&document_id, 0, text),
                document_id: document_id.clone(),
                text: text.into(),
                position: 0,
                token_count: count_tokens(text),
                start_token: 0,
                overlap_tokens: 0,
                start_byte: 0,
                end_byte: text.len(),
            },
            score,
            provenance: Provenance {
                document_id,
                source_uri: format!("test://{doc}"),
                title: None,
                metadata: DocumentMetadata::default(),
            },
        }
    }

    fn context() -> RetrievalResult {
        vec![
            item("a", "Rust guarantees memory safety.", 0.9),
            item("b", "Cargo builds Rust projects.", 0.7),
        ]
        .into()
    }

    fn engine(mock: &MockProvider, config: SynthesisConfig) -> SynthesisEngine<MockProvider> {
        SynthesisEngine::new(
            Arc::new(mock.clone()),
            Retrier::new(RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                jitter: false,
                call_timeout: None,
            }),
            config,
        )
    }

    #[tokio::test]
    async fn grounded_answer_with_citations() {
        let mock = MockProvider::with_responses(vec!["Rust is memory safe [1]. ".into()]);
        let job = engine(&mock, SynthesisConfig::default())
            .synthesize("is rust safe?", context(), &CancellationToken::new())
            .await;

        assert_eq!(job.status(), JobStatus::Succeeded);
        assert_eq!(job.answer(), Some("Rust is memory safe [1]."));
        assert_eq!(job.retrieved_context().len(), 2);
        assert_eq!(job.citations()[&1], job.retrieved_context()[0].chunk_id);
        assert!(job.citation_warning().is_none());

        let prompts = mock.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0][1].content.contains("[2] test://b\nCargo builds Rust projects."));
        assert!(prompts[0][1].content.ends_with("Question: is rust safe?"));
    }

    #[tokio::test]
    async fn unresolved_marker_warns_but_succeeds() {
        let mock = MockProvider::with_responses(vec!["See [2] and [7, 1].".into()]);
        let job = engine(&mock, SynthesisConfig::default())
            .synthesize("q", context(), &CancellationToken::new())
            .await;
        assert_eq!(job.status(), JobStatus::Succeeded);
        assert_eq!(job.citations().len(), 2);
        assert!(job.citation_warning().unwrap().contains("[7]"));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let mock = MockProvider::with_responses(vec!["ok [1]".into()]);
        mock.fail_generate_times(2);
        let job = engine(&mock, SynthesisConfig::default())
            .synthesize("q", context(), &CancellationToken::new())
            .await;
        assert_eq!(job.status(), JobStatus::Succeeded);
        assert_eq!(mock.generate_calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_mark_model_unavailable() {
        let mock = MockProvider::default();
        mock.fail_generate_times(5);
        let job = engine(&mock, SynthesisConfig::default())
            .synthesize("q", context(), &CancellationToken::new())
            .await;
        assert_eq!(job.status(), JobStatus::Failed);
        assert!(matches!(
            job.failure(),
            Some(FailureReason::ModelUnavailable { attempts: 3, .. })
        ));
        assert_eq!(mock.generate_calls(), 3);
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let mock = MockProvider::default().with_failure(MockFailure::Rejected);
        mock.fail_generate_times(1);
        let job = engine(&mock, SynthesisConfig::default())
            .synthesize("q", context(), &CancellationToken::new())
            .await;
        assert_eq!(job.failure().map(FailureReason::code), Some("model_rejected"));
        assert_eq!(mock.generate_calls(), 1);
    }

    #[tokio::test]
    async fn prompt_too_large_makes_no_call() {
        let mock = MockProvider::default();
        let config = SynthesisConfig {
            prompt_budget_tokens: 5,
            ..SynthesisConfig::default()
        };
        let job = engine(&mock, config)
            .synthesize("q", context(), &CancellationToken::new())
            .await;
        assert_eq!(job.failure().map(FailureReason::code), Some("prompt_too_large"));
        assert_eq!(mock.generate_calls(), 0);
    }

    #[tokio::test]
    async fn cancelled_before_call() {
        let mock = MockProvider::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let job = engine(&mock, SynthesisConfig::default())
            .synthesize("q", context(), &cancel)
            .await;
        assert_eq!(job.failure(), Some(&FailureReason::Cancelled));
        assert_eq!(mock.generate_calls(), 0);
    }

    #[tokio::test]
    async fn empty_context_still_calls_model() {
        let mock = MockProvider::with_responses(vec!["I do not know.".into()]);
        let job = engine(&mock, SynthesisConfig::default())
            .synthesize("q", RetrievalResult::default(), &CancellationToken::new())
            .await;
        assert_eq!(job.status(), JobStatus::Succeeded);
        assert!(job.citations().is_empty());
    }
}
