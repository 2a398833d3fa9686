use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::types::{ChunkId, DocumentId, IndexEntry};
use crate::vector_store::{
    BoxFuture, ScoredEntry, SimilarityMetric, VectorFilter, VectorStore, VectorStoreError,
};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    /// Insertion rank; kept when an entry is replaced so ties stay stable.
    seq: u64,
    entry: IndexEntry,
}

#[derive(Debug, Clone, Default)]
struct IndexState {
    model_id: Option<String>,
    dimension: Option<usize>,
    next_seq: u64,
    entries: HashMap<ChunkId, StoredEntry>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    metric: SimilarityMetric,
    model_id: Option<String>,
    dimension: Option<usize>,
    next_seq: u64,
    entries: Vec<StoredEntry>,
}

/// Brute-force index with copy-on-write state.
///
/// Readers clone an `Arc` of the current state and scan it without holding the lock.
/// Writers hold the write lock only while applying a batch, cloning the state first if
/// a reader still holds the previous snapshot.
pub struct InMemoryVectorStore {
    state: RwLock<Arc<IndexState>>,
    metric: SimilarityMetric,
    snapshot_path: Option<PathBuf>,
    /// Serializes snapshot writes so the newest state is always written last.
    persist_lock: tokio::sync::Mutex<()>,
}

impl InMemoryVectorStore {
    #[must_use]
    pub fn new(metric: SimilarityMetric) -> Self {
        Self {
            state: RwLock::new(Arc::new(IndexState::default())),
            metric,
            snapshot_path: None,
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Load the snapshot at `path` if it exists, otherwise start empty. Either way,
    /// [`VectorStore::persist`] writes back to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn open(path: &Path, metric: SimilarityMetric) -> Result<Self, VectorStoreError> {
        let state = match tokio::fs::read(path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
                if snapshot.metric != metric {
                    tracing::warn!(
                        stored = ?snapshot.metric,
                        configured = ?metric,
                        "index snapshot metric differs from configuration, using configured metric"
                    );
                }
                tracing::info!(
                    path = %path.display(),
                    entries = snapshot.entries.len(),
                    model = snapshot.model_id.as_deref().unwrap_or("-"),
                    "loaded index snapshot"
                );
                IndexState {
                    model_id: snapshot.model_id,
                    dimension: snapshot.dimension,
                    next_seq: snapshot.next_seq,
                    entries: snapshot
                        .entries
                        .into_iter()
                        .map(|e| (e.entry.chunk_id, e))
                        .collect(),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => IndexState::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            state: RwLock::new(Arc::new(state)),
            metric,
            snapshot_path: Some(path.to_path_buf()),
            persist_lock: tokio::sync::Mutex::new(()),
        })
    }

    #[must_use]
    pub fn metric(&self) -> SimilarityMetric {
        self.metric
    }

    fn snapshot(&self) -> Arc<IndexState> {
        Arc::clone(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn validate(state: &IndexState, entries: &[IndexEntry]) -> Result<(), VectorStoreError> {
        let mut dimension = state.dimension;
        let mut model = state.model_id.clone();
        for e in entries {
            if e.vector.is_empty() {
                return Err(VectorStoreError::InvalidVector(format!(
                    "empty vector for chunk {}",
                    e.chunk_id
                )));
            }
            if e.vector.iter().any(|x| !x.is_finite()) {
                return Err(VectorStoreError::InvalidVector(format!(
                    "non-finite component in chunk {}",
                    e.chunk_id
                )));
            }
            match dimension {
                Some(expected) if expected != e.vector.len() => {
                    return Err(VectorStoreError::DimensionMismatch {
                        expected,
                        actual: e.vector.len(),
                    });
                }
                Some(_) => {}
                None => dimension = Some(e.vector.len()),
            }
            match &model {
                Some(expected) if *expected != e.model_id => {
                    return Err(VectorStoreError::ModelMismatch {
                        expected: expected.clone(),
                        actual: e.model_id.clone(),
                    });
                }
                Some(_) => {}
                None => model = Some(e.model_id.clone()),
            }
        }
        Ok(())
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new(SimilarityMetric::default())
    }
}

impl std::fmt::Debug for InMemoryVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryVectorStore")
            .field("metric", &self.metric)
            .field("snapshot_path", &self.snapshot_path)
            .finish_non_exhaustive()
    }
}

impl VectorStore for InMemoryVectorStore {
    fn upsert(&self, entries: Vec<IndexEntry>) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        Box::pin(async move {
            if entries.is_empty() {
                return Ok(());
            }
            let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
            Self::validate(&guard, &entries)?;

            let state = Arc::make_mut(&mut guard);
            for entry in entries {
                if state.dimension.is_none() {
                    state.dimension = Some(entry.vector.len());
                }
                if state.model_id.is_none() {
                    state.model_id = Some(entry.model_id.clone());
                }
                let seq = match state.entries.get(&entry.chunk_id) {
                    Some(existing) => existing.seq,
                    None => {
                        let seq = state.next_seq;
                        state.next_seq += 1;
                        seq
                    }
                };
                state.entries.insert(entry.chunk_id, StoredEntry { seq, entry });
            }
            Ok(())
        })
    }

    fn delete(&self, chunk_ids: Vec<ChunkId>) -> BoxFuture<'_, Result<usize, VectorStoreError>> {
        Box::pin(async move {
            let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if !chunk_ids.iter().any(|id| guard.entries.contains_key(id)) {
                return Ok(0);
            }
            let state = Arc::make_mut(&mut guard);
            Ok(chunk_ids
                .iter()
                .filter(|id| state.entries.remove(id).is_some())
                .count())
        })
    }

    fn search(
        &self,
        query: Vec<f32>,
        k: usize,
        filter: Option<VectorFilter>,
    ) -> BoxFuture<'_, Result<Vec<ScoredEntry>, VectorStoreError>> {
        Box::pin(async move {
            let snapshot = self.snapshot();
            let Some(dimension) = snapshot.dimension else {
                return Ok(Vec::new());
            };
            if query.len() != dimension {
                return Err(VectorStoreError::DimensionMismatch {
                    expected: dimension,
                    actual: query.len(),
                });
            }
            if k == 0 {
                return Ok(Vec::new());
            }

            let mut scored: Vec<(f32, u64, &StoredEntry)> = snapshot
                .entries
                .values()
                .filter(|s| {
                    filter.as_ref().is_none_or(|f| {
                        f.matches(&s.entry.document_id, s.entry.position, &s.entry.metadata)
                    })
                })
                .map(|s| (self.metric.score(&query, &s.entry.vector), s.seq, s))
                .collect();

            scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
            scored.truncate(k);

            Ok(scored
                .into_iter()
                .map(|(score, _, s)| ScoredEntry {
                    chunk_id: s.entry.chunk_id,
                    document_id: s.entry.document_id.clone(),
                    position: s.entry.position,
                    score,
                    metadata: s.entry.metadata.clone(),
                })
                .collect())
        })
    }

    fn rebuild(&self, model_id: &str) -> BoxFuture<'_, Result<usize, VectorStoreError>> {
        let model_id = model_id.to_owned();
        Box::pin(async move {
            let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let state = Arc::make_mut(&mut guard);
            let before = state.entries.len();
            state.entries.retain(|_, s| s.entry.model_id == model_id);
            let removed = before - state.entries.len();
            if state.entries.is_empty() {
                state.dimension = None;
            }
            state.model_id = Some(model_id);
            Ok(removed)
        })
    }

    fn chunk_ids_for_document(
        &self,
        document_id: &DocumentId,
    ) -> BoxFuture<'_, Result<Vec<ChunkId>, VectorStoreError>> {
        let document_id = document_id.clone();
        Box::pin(async move {
            let snapshot = self.snapshot();
            let mut hits: Vec<(usize, ChunkId)> = snapshot
                .entries
                .values()
                .filter(|s| s.entry.document_id == document_id)
                .map(|s| (s.entry.position, s.entry.chunk_id))
                .collect();
            hits.sort_unstable();
            Ok(hits.into_iter().map(|(_, id)| id).collect())
        })
    }

    fn len(&self) -> BoxFuture<'_, Result<usize, VectorStoreError>> {
        Box::pin(async move { Ok(self.snapshot().entries.len()) })
    }

    fn model_id(&self) -> Option<String> {
        self.snapshot().model_id.clone()
    }

    fn dimension(&self) -> Option<usize> {
        self.snapshot().dimension
    }

    fn persist(&self) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        Box::pin(async move {
            let Some(path) = &self.snapshot_path else {
                return Ok(());
            };
            let _writer = self.persist_lock.lock().await;
            let state = self.snapshot();
            let mut entries: Vec<StoredEntry> = state.entries.values().cloned().collect();
            entries.sort_by_key(|e| e.seq);
            let snapshot = Snapshot {
                version: SNAPSHOT_VERSION,
                metric: self.metric,
                model_id: state.model_id.clone(),
                dimension: state.dimension,
                next_seq: state.next_seq,
                entries,
            };
            let bytes = serde_json::to_vec(&snapshot)?;

            let dir = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            };
            tokio::fs::create_dir_all(&dir).await?;
            let target = path.clone();
            tokio::task::spawn_blocking(move || write_atomically(&dir, &target, &bytes))
                .await
                .map_err(std::io::Error::other)??;
            tracing::debug!(path = %path.display(), entries = snapshot.entries.len(), "index snapshot written");
            Ok(())
        })
    }
}

/// Write through a uniquely named temp file in `dir`, then rename over `target`.
fn write_atomically(dir: &Path, target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}
