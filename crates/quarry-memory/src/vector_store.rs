use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

pub use crate::types::IndexEntry;
use crate::types::{ChunkId, DocumentId, DocumentMetadata, MetadataValue};

#[derive(Debug, thiserror::Error)]
pub enum VectorStoreError {
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding model mismatch: index holds {expected}, got {actual}")]
    ModelMismatch { expected: String, actual: String },

    #[error("invalid vector: {0}")]
    InvalidVector(String),

    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    #[default]
    Cosine,
    InnerProduct,
}

impl SimilarityMetric {
    #[must_use]
    pub fn score(self, a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        match self {
            Self::InnerProduct => dot,
            Self::Cosine => {
                let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
                let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm_a == 0.0 || norm_b == 0.0 {
                    return 0.0;
                }
                dot / (norm_a * norm_b)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorFilter {
    pub must: Vec<FieldCondition>,
    pub must_not: Vec<FieldCondition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldCondition {
    pub field: String,
    pub value: MetadataValue,
}

impl VectorFilter {
    #[must_use]
    pub fn must(mut self, field: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.must.push(FieldCondition {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    #[must_use]
    pub fn must_not(mut self, field: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.must_not.push(FieldCondition {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    /// `document_id` and `position` are matched against the entry itself; every
    /// other field against the document metadata snapshot.
    #[must_use]
    pub fn matches(
        &self,
        document_id: &DocumentId,
        position: usize,
        metadata: &DocumentMetadata,
    ) -> bool {
        let lookup = |field: &str| match field {
            "document_id" => Some(MetadataValue::from(document_id.as_str())),
            "position" => i64::try_from(position).ok().map(MetadataValue::Integer),
            other => metadata.field(other),
        };
        self.must
            .iter()
            .all(|c| lookup(&c.field).is_some_and(|v| v == c.value))
            && !self
                .must_not
                .iter()
                .any(|c| lookup(&c.field).is_some_and(|v| v == c.value))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredEntry {
    pub chunk_id: ChunkId,
    pub document_id: DocumentId,
    pub position: usize,
    pub score: f32,
    pub metadata: DocumentMetadata,
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Similarity index over chunk embeddings produced by a single model.
pub trait VectorStore: Send + Sync {
    /// Insert or replace entries by chunk id. The whole batch is validated before any
    /// entry is applied.
    fn upsert(&self, entries: Vec<IndexEntry>) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    /// Remove entries; unknown ids are ignored. Returns how many were removed.
    fn delete(&self, chunk_ids: Vec<ChunkId>) -> BoxFuture<'_, Result<usize, VectorStoreError>>;

    /// At most `k` entries by descending similarity, ties broken by insertion order.
    fn search(
        &self,
        query: Vec<f32>,
        k: usize,
        filter: Option<VectorFilter>,
    ) -> BoxFuture<'_, Result<Vec<ScoredEntry>, VectorStoreError>>;

    /// Bind the index to `model_id`, dropping every entry embedded by another model.
    /// Returns how many entries were invalidated.
    fn rebuild(&self, model_id: &str) -> BoxFuture<'_, Result<usize, VectorStoreError>>;

    fn chunk_ids_for_document(
        &self,
        document_id: &DocumentId,
    ) -> BoxFuture<'_, Result<Vec<ChunkId>, VectorStoreError>>;

    fn len(&self) -> BoxFuture<'_, Result<usize, VectorStoreError>>;

    fn is_empty(&self) -> BoxFuture<'_, Result<bool, VectorStoreError>> {
        Box::pin(async move { Ok(self.len().await? == 0) })
    }

    fn model_id(&self) -> Option<String>;

    fn dimension(&self) -> Option<usize>;

    /// Flush to durable storage if the backend has any.
    fn persist(&self) -> BoxFuture<'_, Result<(), VectorStoreError>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Granularity, SourceKind};

    #[test]
    fn cosine_handles_zero_vectors() {
        assert_eq!(SimilarityMetric::Cosine.score(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        let s = SimilarityMetric::Cosine.score(&[1.0, 0.0], &[2.0, 0.0]);
        assert!((s - 1.0).abs() < 1e-6);
    }

    #[test]
    fn inner_product_is_unnormalised() {
        assert_eq!(SimilarityMetric::InnerProduct.score(&[1.0, 2.0], &[3.0, 4.0]), 11.0);
    }

    #[test]
    fn filter_matching() {
        let meta = DocumentMetadata {
            source_kind: SourceKind::Transcript,
            granularity: Some(Granularity::Segment),
            ..DocumentMetadata::default()
        };
        let doc = DocumentId::new("d1");

        let f = VectorFilter::default().must("granularity", "segment");
        assert!(f.matches(&doc, 0, &meta));

        let f = VectorFilter::default().must("granularity", "full");
        assert!(!f.matches(&doc, 0, &meta));

        let f = VectorFilter::default().must_not("document_id", "d1");
        assert!(!f.matches(&doc, 0, &meta));

        let f = VectorFilter::default().must("position", 2_i64);
        assert!(f.matches(&doc, 2, &meta));

        let f = VectorFilter::default().must("missing", "x");
        assert!(!f.matches(&doc, 0, &meta));
    }
}
