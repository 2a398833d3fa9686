use std::collections::BTreeMap;
use std::path::Path;
use std::pin::Pin;

use serde::Deserialize;

use super::super::{DEFAULT_MAX_FILE_SIZE, DocumentError, DocumentLoader};
use super::{file_stem, read_bounded};
use crate::types::{Document, DocumentMetadata, Granularity, MetadataValue, SourceKind};

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptSegment {
    pub id: i64,
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Timestamped transcript as produced by the transcription step.
///
/// `topics` maps a topic name to keywords; segments mentioning any keyword are
/// grouped into one topic-level document.
#[derive(Debug, Clone, Deserialize)]
pub struct Transcript {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub source_uri: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub segments: Vec<TranscriptSegment>,
    #[serde(default)]
    pub topics: BTreeMap<String, Vec<String>>,
}

impl Transcript {
    /// Expand into segment-level, topic-level and full-transcript documents.
    #[must_use]
    pub fn into_documents(self, fallback_id: &str, fallback_uri: &str) -> Vec<Document> {
        let base = self.id.clone().unwrap_or_else(|| fallback_id.to_owned());
        let uri = self
            .source_uri
            .clone()
            .unwrap_or_else(|| fallback_uri.to_owned());
        let base_meta = DocumentMetadata {
            title: self.title.clone(),
            source_kind: SourceKind::Transcript,
            ..DocumentMetadata::default()
        };

        let mut docs = Vec::with_capacity(self.segments.len() + self.topics.len() + 1);
        for seg in &self.segments {
            if seg.text.trim().is_empty() {
                continue;
            }
            let mut meta = DocumentMetadata {
                granularity: Some(Granularity::Segment),
                start_seconds: Some(seg.start),
                end_seconds: Some(seg.end),
                ..base_meta.clone()
            };
            meta.extra
                .insert("segment_id".into(), MetadataValue::Integer(seg.id));
            docs.push(
                Document::new(format!("{base}#seg-{}", seg.id), uri.clone(), seg.text.trim())
                    .with_metadata(meta),
            );
        }

        for (topic, keywords) in &self.topics {
            let keywords: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
            let matching: Vec<&TranscriptSegment> = self
                .segments
                .iter()
                .filter(|s| {
                    let lower = s.text.to_lowercase();
                    keywords.iter().any(|k| lower.contains(k.as_str()))
                })
                .collect();
            let (Some(first), Some(last)) = (matching.first(), matching.last()) else {
                continue;
            };
            let text = matching
                .iter()
                .map(|s| s.text.trim())
                .collect::<Vec<_>>()
                .join(" ");
            let mut meta = DocumentMetadata {
                granularity: Some(Granularity::Topic),
                start_seconds: Some(first.start),
                end_seconds: Some(last.end),
                ..base_meta.clone()
            };
            meta.extra
                .insert("topic".into(), MetadataValue::from(topic.as_str()));
            docs.push(
                Document::new(format!("{base}#topic-{topic}"), uri.clone(), text)
                    .with_metadata(meta),
            );
        }

        let full_text = self.text.clone().unwrap_or_else(|| {
            self.segments
                .iter()
                .map(|s| s.text.trim())
                .collect::<Vec<_>>()
                .join(" ")
        });
        if !full_text.trim().is_empty() {
            let meta = DocumentMetadata {
                granularity: Some(Granularity::Full),
                start_seconds: self.segments.first().map(|s| s.start),
                end_seconds: self.segments.last().map(|s| s.end),
                ..base_meta
            };
            docs.push(Document::new(format!("{base}#full"), uri, full_text).with_metadata(meta));
        }
        docs
    }
}

pub struct TranscriptLoader {
    pub max_file_size: u64,
}

impl Default for TranscriptLoader {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl DocumentLoader for TranscriptLoader {
    fn load(
        &self,
        path: &Path,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Vec<Document>, DocumentError>> + Send + '_>>
    {
        let path = path.to_path_buf();
        let max_size = self.max_file_size;
        Box::pin(async move {
            let (path, content) = read_bounded(&path, max_size).await?;
            let transcript: Transcript = serde_json::from_str(&content)?;
            let uri = format!("file://{}", path.display());
            Ok(transcript.into_documents(&file_stem(&path), &uri))
        })
    }

    fn supported_extensions(&self) -> &[&str] {
        &["json"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Transcript {
        serde_json::from_str(
            r#"{
                "id": "vid42",
                "title": "Product tour",
                "segments": [
                    {"id": 0, "start": 0.0, "end": 4.5, "text": "Welcome, let's sign up first."},
                    {"id": 1, "start": 4.5, "end": 9.0, "text": "Now open the dashboard."},
                    {"id": 2, "start": 9.0, "end": 12.0, "text": "   "},
                    {"id": 3, "start": 12.0, "end": 15.0, "text": "The dashboard shows metrics."}
                ],
                "topics": {"dashboard": ["Dashboard"], "billing": ["invoice"]}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn expands_segments_topics_and_full() {
        let docs = sample().into_documents("fallback", "file:///t.json");
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "vid42#seg-0",
                "vid42#seg-1",
                "vid42#seg-3",
                "vid42#topic-dashboard",
                "vid42#full"
            ]
        );

        let topic = &docs[3];
        assert_eq!(topic.metadata.granularity, Some(Granularity::Topic));
        assert_eq!(topic.metadata.start_seconds, Some(4.5));
        assert_eq!(topic.metadata.end_seconds, Some(15.0));
        assert_eq!(
            topic.raw_text,
            "Now open the dashboard. The dashboard shows metrics."
        );

        let seg = &docs[1];
        assert_eq!(seg.metadata.field("segment_id"), Some(MetadataValue::Integer(1)));
        assert_eq!(seg.metadata.source_kind, SourceKind::Transcript);
        assert_eq!(seg.metadata.title.as_deref(), Some("Product tour"));

        assert_eq!(docs[4].metadata.granularity, Some(Granularity::Full));
        assert_eq!(docs[4].source_uri, "file:///t.json");
    }

    #[tokio::test]
    async fn loads_from_file_with_fallback_id() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("episode.json");
        std::fs::write(
            &file,
            r#"{"segments":[{"id":7,"start":1.0,"end":2.0,"text":"hello"}]}"#,
        )
        .unwrap();

        let docs = TranscriptLoader::default().load(&file).await.unwrap();
        assert_eq!(docs[0].id.as_str(), "episode#seg-7");
        assert_eq!(docs[1].id.as_str(), "episode#full");
        assert_eq!(docs[1].raw_text, "hello");
    }
}
