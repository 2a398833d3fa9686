use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Caller-assigned document identity. Re-ingesting the same id supersedes the old text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Deterministic chunk identity: the same document, position and text always map to
/// the same id, so re-ingesting unchanged text is an idempotent upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(Uuid);

impl ChunkId {
    #[must_use]
    pub fn derive(document_id: &DocumentId, position: usize, text: &str) -> Self {
        let key = format!("{document_id}\u{1f}{position}\u{1f}{}", content_hash(text));
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()))
    }

    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ChunkId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Hex blake3 digest used for change detection and the embedding cache key.
#[must_use]
pub fn content_hash(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// Scalar metadata value. Nested structures are deliberately unsupported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Transcript,
    WebPage,
    Upload,
    #[default]
    Other,
}

impl SourceKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transcript => "transcript",
            Self::WebPage => "web_page",
            Self::Upload => "upload",
            Self::Other => "other",
        }
    }
}

/// How much of a transcript a document covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Segment,
    Topic,
    Full,
}

impl Granularity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Segment => "segment",
            Self::Topic => "topic",
            Self::Full => "full",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub source_kind: SourceKind,
    pub published_at: Option<String>,
    pub language: Option<String>,
    pub granularity: Option<Granularity>,
    pub start_seconds: Option<f64>,
    pub end_seconds: Option<f64>,
    pub extra: BTreeMap<String, MetadataValue>,
}

impl DocumentMetadata {
    /// Look up a field by name for filtering. Well-known fields shadow `extra`.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<MetadataValue> {
        match name {
            "title" => self.title.clone().map(MetadataValue::Text),
            "source_kind" => Some(MetadataValue::from(self.source_kind.as_str())),
            "published_at" => self.published_at.clone().map(MetadataValue::Text),
            "language" => self.language.clone().map(MetadataValue::Text),
            "granularity" => self.granularity.map(|g| MetadataValue::from(g.as_str())),
            "start_seconds" => self.start_seconds.map(MetadataValue::Float),
            "end_seconds" => self.end_seconds.map(MetadataValue::Float),
            other => self.extra.get(other).cloned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub source_uri: String,
    pub raw_text: String,
    #[serde(default)]
    pub metadata: DocumentMetadata,
    /// Assigned by the text store; callers leave it at zero.
    #[serde(default)]
    pub version: u32,
}

impl Document {
    #[must_use]
    pub fn new(
        id: impl Into<DocumentId>,
        source_uri: impl Into<String>,
        raw_text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_uri: source_uri.into(),
            raw_text: raw_text.into(),
            metadata: DocumentMetadata::default(),
            version: 0,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: DocumentMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn content_hash(&self) -> String {
        content_hash(&self.raw_text)
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub document_id: DocumentId,
    pub text: String,
    pub position: usize,
    pub token_count: usize,
    /// Index of the first token within the document's token sequence.
    pub start_token: usize,
    /// Leading tokens repeated from the previous chunk.
    pub overlap_tokens: usize,
    pub start_byte: usize,
    pub end_byte: usize,
}

/// Vector plus provenance, owned by the vector store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub chunk_id: ChunkId,
    pub document_id: DocumentId,
    pub vector: Vec<f32>,
    pub model_id: String,
    pub position: usize,
    pub metadata: DocumentMetadata,
}

/// Ingestion progress of a single document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Chunked,
    Embedded,
    Indexed,
    Failed,
}

impl DocumentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Chunked => "chunked",
            Self::Embedded => "embedded",
            Self::Indexed => "indexed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Indexed | Self::Failed)
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "chunked" => Ok(Self::Chunked),
            "embedded" => Ok(Self::Embedded),
            "indexed" => Ok(Self::Indexed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown document status: {other}")),
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_is_deterministic() {
        let doc = DocumentId::new("doc-1");
        assert_eq!(
            ChunkId::derive(&doc, 0, "hello"),
            ChunkId::derive(&doc, 0, "hello")
        );
        assert_ne!(
            ChunkId::derive(&doc, 0, "hello"),
            ChunkId::derive(&doc, 1, "hello")
        );
        assert_ne!(
            ChunkId::derive(&doc, 0, "hello"),
            ChunkId::derive(&doc, 0, "hello!")
        );
    }

    #[test]
    fn chunk_id_roundtrips_through_string() {
        let id = ChunkId::derive(&DocumentId::new("d"), 3, "t");
        assert_eq!(id.to_string().parse::<ChunkId>().unwrap(), id);
    }

    #[test]
    fn metadata_field_lookup() {
        let mut meta = DocumentMetadata {
            source_kind: SourceKind::Transcript,
            granularity: Some(Granularity::Segment),
            start_seconds: Some(12.5),
            ..DocumentMetadata::default()
        };
        meta.extra.insert("topic".into(), "navigation".into());

        assert_eq!(meta.field("source_kind"), Some("transcript".into()));
        assert_eq!(meta.field("granularity"), Some("segment".into()));
        assert_eq!(meta.field("start_seconds"), Some(MetadataValue::Float(12.5)));
        assert_eq!(meta.field("topic"), Some("navigation".into()));
        assert_eq!(meta.field("title"), None);
    }

    #[test]
    fn metadata_deserializes_scalars() {
        let meta: DocumentMetadata = serde_json::from_str(
            r#"{"source_kind":"web_page","extra":{"views":10,"ratio":0.5,"ok":true,"tag":"x"}}"#,
        )
        .unwrap();
        assert_eq!(meta.source_kind, SourceKind::WebPage);
        assert_eq!(meta.extra["views"], MetadataValue::Integer(10));
        assert_eq!(meta.extra["ratio"], MetadataValue::Float(0.5));
        assert_eq!(meta.extra["ok"], MetadataValue::Bool(true));
        assert_eq!(meta.extra["tag"], MetadataValue::Text("x".into()));
    }

    #[test]
    fn status_parse_roundtrip() {
        for s in [
            DocumentStatus::Pending,
            DocumentStatus::Chunked,
            DocumentStatus::Embedded,
            DocumentStatus::Indexed,
            DocumentStatus::Failed,
        ] {
            assert_eq!(s.as_str().parse::<DocumentStatus>().unwrap(), s);
        }
        assert!("bogus".parse::<DocumentStatus>().is_err());
    }
}
