//! Cached, batched, bounded-concurrency text embedding.

mod cache;
mod in_flight;

pub use cache::EmbeddingCache;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use quarry_llm::{LlmError, LlmProvider, Retrier};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use self::in_flight::InFlight;
use crate::error::MemoryError;
use crate::types::content_hash;

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding unavailable after {attempts} attempt(s): {source}")]
    Unavailable { attempts: u32, source: LlmError },

    #[error("embedding cancelled")]
    Cancelled,

    #[error("malformed embedding response: {0}")]
    Malformed(String),

    #[error("embedding cache error: {0}")]
    Cache(#[from] MemoryError),

    #[error("invalid embedding config: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub max_batch_size: usize,
    /// Batches in flight at once across every clone of the service.
    pub max_concurrency: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            max_concurrency: 4,
        }
    }
}

impl EmbeddingConfig {
    /// # Errors
    ///
    /// Returns `EmbeddingError::InvalidConfig` if either limit is zero.
    pub fn validate(&self) -> Result<(), EmbeddingError> {
        if self.max_batch_size == 0 {
            return Err(EmbeddingError::InvalidConfig(
                "max_batch_size must be greater than zero".into(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(EmbeddingError::InvalidConfig(
                "max_concurrency must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Turns text into vectors through a provider, deduplicating against the cache.
///
/// Clones share the provider, the cache, the concurrency limiter and the set of
/// texts currently being embedded.
pub struct EmbeddingService<P> {
    provider: Arc<P>,
    cache: Arc<EmbeddingCache>,
    limiter: Arc<Semaphore>,
    in_flight: Arc<InFlight>,
    retrier: Retrier,
    config: EmbeddingConfig,
}

impl<P> Clone for EmbeddingService<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            cache: Arc::clone(&self.cache),
            limiter: Arc::clone(&self.limiter),
            in_flight: Arc::clone(&self.in_flight),
            retrier: self.retrier.clone(),
            config: self.config,
        }
    }
}

impl<P> std::fmt::Debug for EmbeddingService<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingService")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl<P: LlmProvider> EmbeddingService<P> {
    /// # Errors
    ///
    /// Returns `EmbeddingError::InvalidConfig` when the config fails validation.
    pub fn new(
        provider: Arc<P>,
        cache: Arc<EmbeddingCache>,
        retrier: Retrier,
        config: EmbeddingConfig,
    ) -> Result<Self, EmbeddingError> {
        config.validate()?;
        Ok(Self {
            provider,
            cache,
            limiter: Arc::new(Semaphore::new(config.max_concurrency)),
            in_flight: Arc::new(InFlight::default()),
            retrier,
            config,
        })
    }

    #[must_use]
    pub fn model_id(&self) -> &str {
        self.provider.embedding_model()
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    /// Embed `texts`, returning one vector per input in input order.
    ///
    /// Cached texts are served without a remote call; misses are deduplicated and sent
    /// in batches. A text another caller is already embedding is awaited rather than
    /// sent again. New vectors reach the cache only once every batch has succeeded.
    ///
    /// # Errors
    ///
    /// Returns `EmbeddingError::Unavailable` if any batch fails after retries,
    /// `Cancelled` if `cancel` fires before all batches are dispatched, or
    /// `Malformed` if the provider returns inconsistent vectors.
    pub async fn embed(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.model_id().to_owned();
        let hashes: Vec<String> = texts.iter().map(|t| content_hash(t)).collect();
        let by_hash: HashMap<&str, &String> = hashes.iter().map(String::as_str).zip(texts).collect();

        let mut seen = HashSet::with_capacity(hashes.len());
        let unique: Vec<String> = hashes
            .iter()
            .filter(|h| seen.insert(h.as_str()))
            .cloned()
            .collect();
        let mut resolved = self.cache.get_many(&model, &unique).await?;
        let mut pending: Vec<String> = unique
            .into_iter()
            .filter(|h| !resolved.contains_key(h))
            .collect();

        while !pending.is_empty() {
            let (claim, waiting) = self.in_flight.claim(&model, &pending);
            if !claim.hashes.is_empty() {
                let fresh = self
                    .embed_owned(&model, &claim.hashes, &by_hash, &resolved, cancel)
                    .await?;
                resolved.extend(fresh);
            }
            drop(claim);
            if waiting.is_empty() {
                break;
            }

            tracing::debug!(model = %model, waiting = waiting.len(), "awaiting in-flight embeddings");
            for mut rx in waiting {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(EmbeddingError::Cancelled),
                    _ = rx.changed() => {}
                }
            }
            // Whatever the owners failed to embed is claimed on the next pass.
            pending.retain(|h| !resolved.contains_key(h));
            resolved.extend(self.cache.get_many(&model, &pending).await?);
            pending.retain(|h| !resolved.contains_key(h));
        }
        check_dimensions(resolved.values())?;

        hashes
            .iter()
            .map(|h| {
                resolved
                    .get(h)
                    .cloned()
                    .ok_or_else(|| EmbeddingError::Malformed(format!("no vector for hash {h}")))
            })
            .collect()
    }

    /// Embed the hashes this call owns. A concurrent owner may have cached some of
    /// them between the first lookup and the claim, so the cache is checked again.
    async fn embed_owned(
        &self,
        model: &str,
        owned: &[String],
        by_hash: &HashMap<&str, &String>,
        resolved: &HashMap<String, Vec<f32>>,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, Vec<f32>>, EmbeddingError> {
        let mut found = self.cache.get_many(model, owned).await?;
        let misses: Vec<(&str, &String)> = owned
            .iter()
            .filter(|h| !found.contains_key(*h))
            .filter_map(|h| by_hash.get(h.as_str()).map(|t| (h.as_str(), *t)))
            .collect();
        if misses.is_empty() {
            return Ok(found);
        }

        let batches: Vec<&[(&str, &String)]> = misses.chunks(self.config.max_batch_size).collect();
        tracing::debug!(
            model = %model,
            cached = resolved.len() + found.len(),
            misses = misses.len(),
            batches = batches.len(),
            "dispatching embedding batches"
        );

        let results = futures::future::try_join_all(batches.iter().map(|batch| {
            let batch_texts: Vec<String> = batch.iter().map(|(_, t)| (*t).clone()).collect();
            self.embed_batch(batch_texts, cancel)
        }))
        .await?;

        let fresh: Vec<(String, Vec<f32>)> = misses
            .iter()
            .map(|(h, _)| (*h).to_owned())
            .zip(results.into_iter().flatten())
            .collect();
        check_dimensions(
            resolved
                .values()
                .chain(found.values())
                .chain(fresh.iter().map(|(_, v)| v)),
        )?;

        self.cache.insert_many(model, fresh.clone()).await?;
        found.extend(fresh);
        Ok(found)
    }

    /// Embed a single text, typically a query.
    ///
    /// # Errors
    ///
    /// Same as [`Self::embed`].
    pub async fn embed_one(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>, EmbeddingError> {
        let mut out = self.embed(&[text.to_owned()], cancel).await?;
        out.pop()
            .ok_or_else(|| EmbeddingError::Malformed("empty result for single text".into()))
    }

    async fn embed_batch(
        &self,
        texts: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let _permit = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(EmbeddingError::Cancelled),
            permit = self.limiter.acquire() => permit.map_err(|_| EmbeddingError::Cancelled)?,
        };

        let vectors = self
            .retrier
            .run("embed", cancel, || self.provider.embed_batch(&texts))
            .await
            .map_err(|e| {
                if e.is_cancelled() {
                    EmbeddingError::Cancelled
                } else {
                    EmbeddingError::Unavailable {
                        attempts: e.attempts,
                        source: e.source,
                    }
                }
            })?;

        if vectors.len() != texts.len() {
            return Err(EmbeddingError::Malformed(format!(
                "{} vectors for {} texts",
                vectors.len(),
                texts.len()
            )));
        }
        Ok(vectors)
    }
}

fn check_dimensions<'a>(vectors: impl Iterator<Item = &'a Vec<f32>>) -> Result<(), EmbeddingError> {
    let mut dims: HashMap<usize, usize> = HashMap::new();
    for v in vectors {
        *dims.entry(v.len()).or_default() += 1;
    }
    match dims.len() {
        0 => Ok(()),
        1 if !dims.contains_key(&0) => Ok(()),
        _ => Err(EmbeddingError::Malformed(format!(
            "inconsistent vector dimensions: {:?}",
            dims.keys().collect::<Vec<_>>()
        ))),
    }
}
