//! Ingestion and query orchestration over the chunker, embedder, index and text store.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use quarry_llm::{LlmProvider, Retrier};
use quarry_memory::{
    ChunkId, Chunker, ChunkerError, Document, DocumentId, DocumentStatus, EmbeddingCache,
    EmbeddingError, EmbeddingService, InMemoryVectorStore, IndexEntry, MemoryError, SqliteStore,
    VectorFilter, VectorStore, VectorStoreError,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::job::{FailureReason, SynthesisJob};
use crate::retriever::{RetrievalError, RetrievalResult, Retriever};
use crate::synthesis::SynthesisEngine;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Chunker(#[from] ChunkerError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Index(#[from] VectorStoreError),

    #[error(transparent)]
    TextStore(#[from] MemoryError),

    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentOutcome {
    pub document_id: DocumentId,
    pub status: DocumentStatus,
    pub version: u32,
    pub chunks: usize,
    /// Chunks from a previous version that were removed.
    pub removed: usize,
    /// True when the stored text and index already matched and nothing was written.
    pub unchanged: bool,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub total: usize,
    pub indexed: usize,
    pub failed: usize,
    pub outcomes: Vec<DocumentOutcome>,
    #[serde(serialize_with = "serialize_millis", rename = "duration_ms")]
    pub duration: Duration,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    pub model_id: String,
    pub invalidated_entries: usize,
    pub invalidated_cache_entries: usize,
    pub ingest: IngestReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub index_entries: usize,
    pub model_id: Option<String>,
    pub dimension: Option<usize>,
    pub chunks: usize,
    pub documents: BTreeMap<String, usize>,
}

/// Owns every pipeline component and runs ingestion and queries against them.
pub struct Coordinator<P> {
    chunker: Chunker,
    embedder: EmbeddingService<P>,
    index: Arc<dyn VectorStore>,
    text: SqliteStore,
    retriever: Retriever<P>,
    engine: SynthesisEngine<P>,
    workers: usize,
    top_k: usize,
}

impl<P> std::fmt::Debug for Coordinator<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("chunker", &self.chunker)
            .field("embedder", &self.embedder)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl<P: LlmProvider> Coordinator<P> {
    /// Wire the pipeline around an existing text store and index.
    ///
    /// # Errors
    ///
    /// Returns an error if the chunker or embedding configuration is invalid.
    pub fn new(
        provider: Arc<P>,
        text: SqliteStore,
        index: Arc<dyn VectorStore>,
        config: &Config,
    ) -> Result<Self, CoordinatorError> {
        let chunker = Chunker::new(config.chunker)?;
        let cache = Arc::new(EmbeddingCache::with_store(text.clone()));
        let embedder = EmbeddingService::new(
            Arc::clone(&provider),
            cache,
            Retrier::new(config.retry.policy(config.timeouts.embedding_seconds)),
            config.embedding,
        )?;
        let retriever = Retriever::new(
            embedder.clone(),
            Arc::clone(&index),
            text.clone(),
            config.retrieval,
        );
        let engine = SynthesisEngine::new(
            provider,
            Retrier::new(config.retry.policy(config.timeouts.llm_seconds)),
            config.synthesis,
        );

        if let Some(indexed) = index.model_id()
            && indexed != embedder.model_id()
        {
            tracing::warn!(
                indexed = %indexed,
                configured = %embedder.model_id(),
                "index was built with a different embedding model, run a rebuild"
            );
        }

        Ok(Self {
            chunker,
            embedder,
            index,
            text,
            retriever,
            engine,
            workers: config.ingest.workers.max(1),
            top_k: config.retrieval.top_k,
        })
    }

    /// Open the stores named in `config` and wire the pipeline around them.
    ///
    /// # Errors
    ///
    /// Returns an error if either store cannot be opened or the configuration is invalid.
    pub async fn open(provider: Arc<P>, config: &Config) -> Result<Self, CoordinatorError> {
        let text = SqliteStore::new(&config.store.sqlite_path).await?;
        let index: Arc<dyn VectorStore> = match &config.store.index_path {
            Some(path) => Arc::new(InMemoryVectorStore::open(Path::new(path), config.store.metric).await?),
            None => Arc::new(InMemoryVectorStore::new(config.store.metric)),
        };
        Self::new(provider, text, index, config)
    }

    #[must_use]
    pub fn text_store(&self) -> &SqliteStore {
        &self.text
    }

    #[must_use]
    pub fn index(&self) -> &Arc<dyn VectorStore> {
        &self.index
    }

    /// Ingest `documents` with at most `ingest.workers` in flight. A failing document
    /// is recorded and never stops its siblings. Later duplicates of an id win.
    ///
    /// # Errors
    ///
    /// Returns an error only if the index snapshot cannot be written afterwards.
    pub async fn ingest(
        &self,
        documents: Vec<Document>,
        cancel: &CancellationToken,
    ) -> Result<IngestReport, CoordinatorError> {
        let started = Instant::now();
        let documents = dedupe_by_id(documents);
        let total = documents.len();

        let mut outcomes: Vec<(usize, DocumentOutcome)> =
            futures::stream::iter(documents.into_iter().enumerate())
                .map(|(i, doc)| async move { (i, self.ingest_one(doc, cancel).await) })
                .buffer_unordered(self.workers)
                .collect()
                .await;
        outcomes.sort_by_key(|(i, _)| *i);
        let outcomes: Vec<DocumentOutcome> = outcomes.into_iter().map(|(_, o)| o).collect();

        self.index.persist().await?;

        let indexed = outcomes
            .iter()
            .filter(|o| o.status == DocumentStatus::Indexed)
            .count();
        let report = IngestReport {
            total,
            indexed,
            failed: total - indexed,
            outcomes,
            duration: started.elapsed(),
        };
        tracing::info!(
            total,
            indexed,
            failed = report.failed,
            elapsed_ms = u64::try_from(report.duration.as_millis()).unwrap_or(u64::MAX),
            "ingestion finished"
        );
        Ok(report)
    }

    async fn ingest_one(&self, doc: Document, cancel: &CancellationToken) -> DocumentOutcome {
        let id = doc.id.clone();
        match self.process(doc, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let reason = match &e {
                    CoordinatorError::Cancelled
                    | CoordinatorError::Embedding(EmbeddingError::Cancelled) => "cancelled".to_owned(),
                    other => other.to_string(),
                };
                tracing::warn!(document_id = %id, error = %reason, "document ingestion failed");
                if let Err(store_err) = self
                    .text
                    .set_document_status(&id, DocumentStatus::Failed, Some(&reason))
                    .await
                {
                    tracing::warn!(document_id = %id, error = %store_err, "could not record failure");
                }
                DocumentOutcome {
                    document_id: id,
                    status: DocumentStatus::Failed,
                    version: 0,
                    chunks: 0,
                    removed: 0,
                    unchanged: false,
                    failure: Some(reason),
                }
            }
        }
    }

    async fn process(
        &self,
        doc: Document,
        cancel: &CancellationToken,
    ) -> Result<DocumentOutcome, CoordinatorError> {
        if cancel.is_cancelled() {
            return Err(CoordinatorError::Cancelled);
        }
        // A stored document keeps its text and version until the replacement is
        // embedded, so a failed re-ingest leaves the text store matching the index.
        let (saved, deferred) = match self.text.preview_save(&doc).await? {
            Some(preview) => (preview, true),
            None => (self.text.save_document(&doc).await?, false),
        };

        let chunks = self.chunker.chunk(&doc);
        self.mark(&doc.id, DocumentStatus::Chunked).await?;

        let fresh: HashSet<ChunkId> = chunks.iter().map(|c| c.id).collect();
        let indexed: HashSet<ChunkId> = self
            .index
            .chunk_ids_for_document(&doc.id)
            .await?
            .into_iter()
            .collect();

        if !saved.changed && indexed == fresh {
            if deferred {
                self.text.save_document(&doc).await?;
            }
            self.mark(&doc.id, DocumentStatus::Indexed).await?;
            tracing::debug!(document_id = %doc.id, "document unchanged, skipping");
            return Ok(DocumentOutcome {
                document_id: doc.id,
                status: DocumentStatus::Indexed,
                version: saved.version,
                chunks: chunks.len(),
                removed: 0,
                unchanged: true,
                failure: None,
            });
        }

        let mut previous = indexed;
        previous.extend(self.text.chunk_ids_for_document(&doc.id).await?);
        let stale: Vec<ChunkId> = previous.difference(&fresh).copied().collect();

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed(&texts, cancel).await?;
        self.mark(&doc.id, DocumentStatus::Embedded).await?;

        let model_id = self.embedder.model_id().to_owned();
        let entries: Vec<IndexEntry> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexEntry {
                chunk_id: chunk.id,
                document_id: chunk.document_id.clone(),
                vector,
                model_id: model_id.clone(),
                position: chunk.position,
                metadata: doc.metadata.clone(),
            })
            .collect();

        if deferred {
            self.text.save_document(&doc).await?;
        }
        // New rows first so every index entry always has its chunk text.
        self.text.upsert_chunks(&chunks).await?;
        self.index.upsert(entries).await?;
        if !stale.is_empty() {
            self.index.delete(stale.clone()).await?;
            self.text.delete_chunks(&stale).await?;
        }
        self.mark(&doc.id, DocumentStatus::Indexed).await?;

        tracing::info!(
            document_id = %doc.id,
            version = saved.version,
            chunks = chunks.len(),
            removed = stale.len(),
            "document indexed"
        );
        Ok(DocumentOutcome {
            document_id: doc.id,
            status: DocumentStatus::Indexed,
            version: saved.version,
            chunks: chunks.len(),
            removed: stale.len(),
            unchanged: false,
            failure: None,
        })
    }

    async fn mark(&self, id: &DocumentId, status: DocumentStatus) -> Result<(), MemoryError> {
        tracing::debug!(document_id = %id, status = %status, "document state");
        self.text.set_document_status(id, status, None).await
    }

    /// Answer `query` from the index. Never fails: every problem ends up as the
    /// job's failure reason.
    pub async fn query(
        &self,
        query: &str,
        k: Option<usize>,
        filter: Option<VectorFilter>,
        cancel: &CancellationToken,
    ) -> SynthesisJob {
        let k = k.unwrap_or(self.top_k);
        let retrieved = self.retriever.retrieve(query, k, filter, cancel);
        self.answer(query, retrieved, cancel).await
    }

    /// Like [`Coordinator::query`], but the context mixes transcript segments,
    /// topic groupings and optionally the full transcript.
    pub async fn query_contextual(
        &self,
        query: &str,
        include_full: bool,
        filter: Option<VectorFilter>,
        cancel: &CancellationToken,
    ) -> SynthesisJob {
        let retrieved = self
            .retriever
            .retrieve_contextual(query, include_full, filter, cancel);
        self.answer(query, retrieved, cancel).await
    }

    async fn answer(
        &self,
        query: &str,
        retrieved: impl Future<Output = Result<RetrievalResult, RetrievalError>>,
        cancel: &CancellationToken,
    ) -> SynthesisJob {
        let mut job = SynthesisJob::new(query);
        if let Err(e) = job.start() {
            tracing::error!(error = %e, "fresh job refused to start");
            return job;
        }

        let reason = match retrieved.await {
            Ok(context) => {
                self.engine.complete(&mut job, context, cancel).await;
                return job;
            }
            Err(RetrievalError::EmptyIndex) => FailureReason::NoContext,
            Err(RetrievalError::Embedding(EmbeddingError::Cancelled)) => FailureReason::Cancelled,
            Err(e) => FailureReason::RetrievalFailed {
                message: e.to_string(),
            },
        };
        tracing::warn!(job = %job.id(), reason = reason.code(), "query failed before synthesis");
        if let Err(e) = job.fail(reason) {
            tracing::error!(job = %job.id(), error = %e, "could not record query failure");
        }
        job
    }

    /// Remove a document from the index and then from the text store.
    /// Returns whether anything was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if either store fails; the index is cleaned first so no entry
    /// is ever left pointing at deleted text.
    pub async fn delete_document(&self, id: &DocumentId) -> Result<bool, CoordinatorError> {
        let mut ids: HashSet<ChunkId> = self
            .index
            .chunk_ids_for_document(id)
            .await?
            .into_iter()
            .collect();
        ids.extend(self.text.chunk_ids_for_document(id).await?);

        let removed_entries = self.index.delete(ids.into_iter().collect()).await?;
        let removed_document = self.text.delete_document(id).await?;
        self.index.persist().await?;

        tracing::info!(document_id = %id, removed_entries, removed_document, "document deleted");
        Ok(removed_document || removed_entries > 0)
    }

    /// Bind the index and cache to the provider's current embedding model and
    /// re-ingest every stored document.
    ///
    /// # Errors
    ///
    /// Returns an error if a store fails outside per-document processing.
    pub async fn rebuild(&self, cancel: &CancellationToken) -> Result<RebuildReport, CoordinatorError> {
        let model_id = self.embedder.model_id().to_owned();
        let invalidated_entries = self.index.rebuild(&model_id).await?;
        let invalidated_cache_entries = self.embedder.cache().invalidate_except(&model_id).await?;
        tracing::info!(
            model = %model_id,
            invalidated_entries,
            invalidated_cache_entries,
            "index bound to embedding model"
        );

        let documents = self.text.all_documents().await?;
        let ingest = self.ingest(documents, cancel).await?;
        Ok(RebuildReport {
            model_id,
            invalidated_entries,
            invalidated_cache_entries,
            ingest,
        })
    }

    /// # Errors
    ///
    /// Returns an error if either store cannot be queried.
    pub async fn status(&self) -> Result<StatusReport, CoordinatorError> {
        let documents = self
            .text
            .status_counts()
            .await?
            .into_iter()
            .map(|(status, count)| (status.as_str().to_owned(), count))
            .collect();
        Ok(StatusReport {
            index_entries: self.index.len().await?,
            model_id: self.index.model_id(),
            dimension: self.index.dimension(),
            chunks: self.text.chunk_count().await?,
            documents,
        })
    }
}

fn dedupe_by_id(documents: Vec<Document>) -> Vec<Document> {
    let mut last: HashMap<DocumentId, usize> = HashMap::with_capacity(documents.len());
    for (i, doc) in documents.iter().enumerate() {
        if let Some(prev) = last.insert(doc.id.clone(), i) {
            tracing::warn!(document_id = %doc.id, superseded = prev, "duplicate document id in batch");
        }
    }
    documents
        .into_iter()
        .enumerate()
        .filter(|(i, doc)| last.get(&doc.id) == Some(i))
        .map(|(_, doc)| doc)
        .collect()
}
