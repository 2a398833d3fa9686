//! Knowledge base storage: chunking, cached embeddings, the vector index, and the
//! SQLite text store that owns documents and chunk text.

pub mod document;
pub mod embedding;
pub mod error;
pub mod in_memory_store;
pub mod sqlite;
pub mod types;
pub mod vector_store;

pub use document::{Chunker, ChunkerConfig, ChunkerError, count_tokens};
pub use embedding::{EmbeddingCache, EmbeddingConfig, EmbeddingError, EmbeddingService};
pub use error::MemoryError;
pub use in_memory_store::InMemoryVectorStore;
pub use sqlite::SqliteStore;
pub use types::{
    Chunk, ChunkId, Document, DocumentId, DocumentMetadata, DocumentStatus, Granularity,
    IndexEntry, MetadataValue, SourceKind,
};
pub use vector_store::{
    FieldCondition, ScoredEntry, SimilarityMetric, VectorFilter, VectorStore, VectorStoreError,
};
