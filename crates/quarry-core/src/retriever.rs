//! Query embedding, over-fetching similarity search and per-document capping.
//!
//! Candidates are resolved against the text store before the cap and `k` apply, so
//! index entries whose chunk rows have gone missing never take a slot.

use std::collections::HashMap;
use std::sync::Arc;

use quarry_llm::LlmProvider;
use quarry_memory::{
    Chunk, DocumentId, DocumentMetadata, EmbeddingError, EmbeddingService, Granularity,
    MemoryError, ScoredEntry, SqliteStore, VectorFilter, VectorStore, VectorStoreError,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::RetrievalConfig;

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("the index is empty")]
    EmptyIndex,

    #[error("query embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("vector search failed: {0}")]
    Index(#[from] VectorStoreError),

    #[error("text store lookup failed: {0}")]
    TextStore(#[from] MemoryError),
}

/// Where a retrieved chunk came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Provenance {
    pub document_id: DocumentId,
    pub source_uri: String,
    pub title: Option<String>,
    pub metadata: DocumentMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    pub score: f32,
    pub provenance: Provenance,
}

/// Ranked context for one query, best first. Consumed by value.
#[derive(Debug, Default)]
pub struct RetrievalResult {
    items: Vec<RetrievedChunk>,
}

impl RetrievalResult {
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn into_items(self) -> Vec<RetrievedChunk> {
        self.items
    }
}

impl From<Vec<RetrievedChunk>> for RetrievalResult {
    fn from(items: Vec<RetrievedChunk>) -> Self {
        Self { items }
    }
}

impl IntoIterator for RetrievalResult {
    type Item = RetrievedChunk;
    type IntoIter = std::vec::IntoIter<RetrievedChunk>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

pub struct Retriever<P> {
    embedder: EmbeddingService<P>,
    index: Arc<dyn VectorStore>,
    text: SqliteStore,
    config: RetrievalConfig,
}

impl<P> Clone for Retriever<P> {
    fn clone(&self) -> Self {
        Self {
            embedder: self.embedder.clone(),
            index: Arc::clone(&self.index),
            text: self.text.clone(),
            config: self.config,
        }
    }
}

impl<P> std::fmt::Debug for Retriever<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retriever")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<P: LlmProvider> Retriever<P> {
    #[must_use]
    pub fn new(
        embedder: EmbeddingService<P>,
        index: Arc<dyn VectorStore>,
        text: SqliteStore,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            text,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Top `k` chunks for `query`, at most `max_per_document` from any one document.
    ///
    /// # Errors
    ///
    /// Returns `RetrievalError::EmptyIndex` when nothing has been indexed, or the
    /// underlying embedding, search or text store error.
    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        filter: Option<VectorFilter>,
        cancel: &CancellationToken,
    ) -> Result<RetrievalResult, RetrievalError> {
        let total = self.populated_len().await?;
        if k == 0 {
            return Ok(RetrievalResult::default());
        }

        let query_vector = self.embedder.embed_one(query, cancel).await?;
        let items = self.search_ranked(&query_vector, k, filter, total).await?;
        tracing::info!(k, returned = items.len(), "retrieval complete");
        Ok(RetrievalResult { items })
    }

    /// Transcript context mixed across granularities. Segments and topic groupings
    /// are always searched; the whole transcript only with `include_full`.
    ///
    /// Quotas come from `RetrievalConfig::contextual`. Each granularity is searched
    /// separately with `filter` narrowed to it, so a strong full-transcript match
    /// cannot crowd out the segments. The merged result is ranked best first.
    ///
    /// # Errors
    ///
    /// Same as [`Retriever::retrieve`].
    pub async fn retrieve_contextual(
        &self,
        query: &str,
        include_full: bool,
        filter: Option<VectorFilter>,
        cancel: &CancellationToken,
    ) -> Result<RetrievalResult, RetrievalError> {
        let total = self.populated_len().await?;
        let mix = self.config.contextual;
        let plan = [
            (Granularity::Segment, mix.segments),
            (Granularity::Topic, mix.topics),
            (Granularity::Full, if include_full { mix.full } else { 0 }),
        ];
        if plan.iter().all(|(_, k)| *k == 0) {
            return Ok(RetrievalResult::default());
        }

        let query_vector = self.embedder.embed_one(query, cancel).await?;
        let mut items = Vec::new();
        for (granularity, k) in plan {
            if k == 0 {
                continue;
            }
            let scoped = filter
                .clone()
                .unwrap_or_default()
                .must("granularity", granularity.as_str());
            let found = self
                .search_ranked(&query_vector, k, Some(scoped), total)
                .await?;
            tracing::debug!(
                granularity = granularity.as_str(),
                k,
                found = found.len(),
                "contextual search"
            );
            items.extend(found);
        }
        items.sort_by(|a, b| b.score.total_cmp(&a.score));
        tracing::info!(include_full, returned = items.len(), "contextual retrieval complete");
        Ok(RetrievalResult { items })
    }

    async fn populated_len(&self) -> Result<usize, RetrievalError> {
        let total = self.index.len().await?;
        if total == 0 {
            return Err(RetrievalError::EmptyIndex);
        }
        Ok(total)
    }

    /// Over-fetch, resolve against the text store, then cap and truncate. Widens
    /// until `k` resolved chunks survive or the index has nothing more to give.
    async fn search_ranked(
        &self,
        query_vector: &[f32],
        k: usize,
        filter: Option<VectorFilter>,
        total: usize,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        let mut fetch = k.saturating_mul(self.config.candidate_multiplier).max(k);
        loop {
            let mut hits = self
                .index
                .search(query_vector.to_vec(), fetch, filter.clone())
                .await?;
            let exhausted = hits.len() < fetch || fetch >= total;
            hits.retain(|h| h.score >= self.config.score_threshold);
            let resolved = self.resolve(hits).await?;
            let selected = select_hits(
                resolved,
                self.config.score_threshold,
                self.config.max_per_document,
                k,
            );
            if selected.len() >= k || exhausted {
                return Ok(selected);
            }
            tracing::debug!(fetch, kept = selected.len(), k, "widening candidate pool");
            fetch = fetch.saturating_mul(2);
        }
    }

    async fn resolve(&self, hits: Vec<ScoredEntry>) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        let ids: Vec<_> = hits.iter().map(|h| h.chunk_id).collect();
        let mut chunks = self.text.chunks_by_ids(&ids).await?;
        let mut documents: HashMap<DocumentId, Option<(String, Option<String>)>> = HashMap::new();

        let mut items = Vec::with_capacity(hits.len());
        for hit in hits {
            let Some(chunk) = chunks.remove(&hit.chunk_id) else {
                tracing::warn!(
                    chunk_id = %hit.chunk_id,
                    document_id = %hit.document_id,
                    "index entry has no chunk in the text store, skipping"
                );
                continue;
            };

            if !documents.contains_key(&hit.document_id) {
                let loaded = self
                    .text
                    .load_document(&hit.document_id)
                    .await?
                    .map(|d| (d.source_uri, d.metadata.title));
                documents.insert(hit.document_id.clone(), loaded);
            }
            let Some(Some((source_uri, title))) = documents.get(&hit.document_id) else {
                tracing::warn!(
                    document_id = %hit.document_id,
                    "index entry references a missing document, skipping"
                );
                continue;
            };

            items.push(RetrievedChunk {
                chunk,
                score: hit.score,
                provenance: Provenance {
                    document_id: hit.document_id,
                    source_uri: source_uri.clone(),
                    title: title.clone(),
                    metadata: hit.metadata,
                },
            });
        }
        Ok(items)
    }
}

/// Anything ranked by score and attributed to a source document.
trait Ranked {
    fn score(&self) -> f32;
    fn document_id(&self) -> &DocumentId;
}

impl Ranked for ScoredEntry {
    fn score(&self) -> f32 {
        self.score
    }

    fn document_id(&self) -> &DocumentId {
        &self.document_id
    }
}

impl Ranked for RetrievedChunk {
    fn score(&self) -> f32 {
        self.score
    }

    fn document_id(&self) -> &DocumentId {
        &self.provenance.document_id
    }
}

/// Drop items under `threshold`, keep at most `per_document` per source document,
/// and stop at `k`. Input order (best first) is preserved.
fn select_hits<T: Ranked>(items: Vec<T>, threshold: f32, per_document: usize, k: usize) -> Vec<T> {
    let mut taken: HashMap<DocumentId, usize> = HashMap::new();
    let mut out = Vec::with_capacity(k);
    for item in items {
        if out.len() == k {
            break;
        }
        if item.score() < threshold {
            continue;
        }
        let count = taken.entry(item.document_id().clone()).or_default();
        if *count >= per_document {
            continue;
        }
        *count += 1;
        out.push(item);
    }
    out
}
