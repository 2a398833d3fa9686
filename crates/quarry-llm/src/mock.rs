//! Test-only mock provider with scripted failures and deterministic embeddings.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::LlmError;
use crate::provider::{GenerateOptions, LlmProvider, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// Surface as `LlmError::Unavailable`.
    Transient,
    /// Surface as `LlmError::InvalidRequest`.
    Rejected,
}

#[derive(Debug, Default)]
struct Counters {
    generate_calls: AtomicUsize,
    embed_calls: AtomicUsize,
    embedded_texts: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fail_generate: AtomicU32,
    fail_embed: AtomicU32,
}

/// Clones share counters, scripted responses and failure budgets.
#[derive(Debug, Clone)]
pub struct MockProvider {
    responses: Arc<Mutex<Vec<String>>>,
    prompts: Arc<Mutex<Vec<Vec<Message>>>>,
    fixed: Arc<Mutex<HashMap<String, Vec<f32>>>>,
    counters: Arc<Counters>,
    pub default_response: String,
    pub dimension: usize,
    pub model_id: String,
    pub failure: MockFailure,
    /// Milliseconds to sleep inside every call.
    pub delay_ms: u64,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            responses: Arc::new(Mutex::new(Vec::new())),
            prompts: Arc::new(Mutex::new(Vec::new())),
            fixed: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(Counters::default()),
            default_response: "mock response".into(),
            dimension: 16,
            model_id: "mock-embed".into(),
            failure: MockFailure::Transient,
            delay_ms: 0,
        }
    }
}

impl MockProvider {
    #[must_use]
    pub fn with_responses(responses: Vec<String>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    #[must_use]
    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    #[must_use]
    pub fn with_delay(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    #[must_use]
    pub fn with_failure(mut self, failure: MockFailure) -> Self {
        self.failure = failure;
        self
    }

    /// Pin the embedding returned for an exact text.
    #[must_use]
    pub fn with_fixed_embedding(self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        self.fixed.lock().unwrap().insert(text.into(), vector);
        self
    }

    /// Make the next `n` generate calls fail.
    pub fn fail_generate_times(&self, n: u32) {
        self.counters.fail_generate.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` embed calls fail.
    pub fn fail_embed_times(&self, n: u32) {
        self.counters.fail_embed.store(n, Ordering::SeqCst);
    }

    #[must_use]
    pub fn generate_calls(&self) -> usize {
        self.counters.generate_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn embed_calls(&self) -> usize {
        self.counters.embed_calls.load(Ordering::SeqCst)
    }

    /// Number of texts sent to `embed_batch` across all calls.
    #[must_use]
    pub fn embedded_texts(&self) -> usize {
        self.counters.embedded_texts.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed running at the same time.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.counters.max_in_flight.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn prompts(&self) -> Vec<Vec<Message>> {
        self.prompts.lock().unwrap().clone()
    }

    /// Bag-of-words hashing projection, L2-normalised. Texts sharing words land close.
    #[must_use]
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        if let Some(v) = self.fixed.lock().unwrap().get(text) {
            return v.clone();
        }
        let mut v = vec![0.0_f32; self.dimension.max(1)];
        for word in text.split_whitespace() {
            let word = word
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            if word.is_empty() {
                continue;
            }
            let len = u64::try_from(v.len()).unwrap_or(u64::MAX);
            let bucket = usize::try_from(fnv1a(word.as_bytes()) % len).unwrap_or(0);
            v[bucket] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }

    async fn enter(&self) {
        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
    }

    fn leave(&self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn take_failure(budget: &AtomicU32) -> bool {
        budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn failure_error(&self) -> LlmError {
        match self.failure {
            MockFailure::Transient => LlmError::Unavailable("mock outage".into()),
            MockFailure::Rejected => LlmError::InvalidRequest("mock rejection".into()),
        }
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |h, b| {
        (h ^ u64::from(*b)).wrapping_mul(0x0100_0000_01b3)
    })
}

impl LlmProvider for MockProvider {
    async fn generate(
        &self,
        messages: &[Message],
        _options: &GenerateOptions,
    ) -> Result<String, LlmError> {
        self.counters.generate_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await;
        self.leave();
        self.prompts.lock().unwrap().push(messages.to_vec());
        if Self::take_failure(&self.counters.fail_generate) {
            return Err(self.failure_error());
        }
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(self.default_response.clone())
        } else {
            Ok(responses.remove(0))
        }
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        self.counters.embed_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await;
        self.leave();
        if Self::take_failure(&self.counters.fail_embed) {
            return Err(self.failure_error());
        }
        self.counters
            .embedded_texts
            .fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn embedding_model(&self) -> &str {
        &self.model_id
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_failures_then_success() {
        let mock = MockProvider::default();
        mock.fail_embed_times(2);
        assert!(mock.embed_batch(&["a".into()]).await.is_err());
        assert!(mock.embed_batch(&["a".into()]).await.is_err());
        assert!(mock.embed_batch(&["a".into()]).await.is_ok());
        assert_eq!(mock.embed_calls(), 3);
        assert_eq!(mock.embedded_texts(), 1);
    }

    #[tokio::test]
    async fn responses_are_consumed_in_order() {
        let mock = MockProvider::with_responses(vec!["one".into(), "two".into()]);
        let opts = GenerateOptions::default();
        assert_eq!(mock.generate(&[], &opts).await.unwrap(), "one");
        assert_eq!(mock.generate(&[], &opts).await.unwrap(), "two");
        assert_eq!(mock.generate(&[], &opts).await.unwrap(), "mock response");
    }

    #[test]
    fn embeddings_are_deterministic_and_normalised() {
        let mock = MockProvider::default().with_dimension(8);
        let a = mock.embed_text("rust vector search");
        let b = mock.embed_text("rust vector search");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn fixed_embedding_wins() {
        let mock = MockProvider::default().with_fixed_embedding("q", vec![1.0, 0.0]);
        assert_eq!(mock.embed_text("q"), vec![1.0, 0.0]);
    }
}
