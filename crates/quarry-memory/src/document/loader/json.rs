use std::path::Path;
use std::pin::Pin;

use super::super::{DEFAULT_MAX_FILE_SIZE, DocumentError, DocumentLoader};
use super::transcript::Transcript;
use super::{file_stem, read_bounded};
use crate::types::Document;

/// JSON files holding a single document, an array of documents, or a transcript
/// (recognised by a `segments` array).
pub struct JsonDocumentLoader {
    pub max_file_size: u64,
}

impl Default for JsonDocumentLoader {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

fn parse(content: &str, path: &Path) -> Result<Vec<Document>, DocumentError> {
    let value: serde_json::Value = serde_json::from_str(content)?;
    if value.get("segments").is_some() {
        let transcript: Transcript = serde_json::from_value(value)?;
        let uri = format!("file://{}", path.display());
        return Ok(transcript.into_documents(&file_stem(path), &uri));
    }
    match value {
        serde_json::Value::Array(_) => Ok(serde_json::from_value(value)?),
        serde_json::Value::Object(_) => Ok(vec![serde_json::from_value(value)?]),
        _ => Err(DocumentError::UnsupportedFormat(format!(
            "{}: expected a JSON object or array",
            path.display()
        ))),
    }
}

impl DocumentLoader for JsonDocumentLoader {
    fn load(
        &self,
        path: &Path,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Vec<Document>, DocumentError>> + Send + '_>>
    {
        let path = path.to_path_buf();
        let max_size = self.max_file_size;
        Box::pin(async move {
            let (path, content) = read_bounded(&path, max_size).await?;
            parse(&content, &path)
        })
    }

    fn supported_extensions(&self) -> &[&str] {
        &["json"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceKind;

    #[test]
    fn single_document_object() {
        let docs = parse(
            r#"{"id":"page-1","source_uri":"https://example.com","raw_text":"hi",
                "metadata":{"source_kind":"web_page","title":"Example"}}"#,
            Path::new("/x/page.json"),
        )
        .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id.as_str(), "page-1");
        assert_eq!(docs[0].metadata.source_kind, SourceKind::WebPage);
        assert_eq!(docs[0].version, 0);
    }

    #[test]
    fn document_array() {
        let docs = parse(
            r#"[{"id":"a","source_uri":"u","raw_text":"1"},{"id":"b","source_uri":"u","raw_text":"2"}]"#,
            Path::new("/x/batch.json"),
        )
        .unwrap();
        assert_eq!(docs.len(), 2);
    }

    #[test]
    fn transcript_detected() {
        let docs = parse(
            r#"{"segments":[{"id":1,"start":0.0,"end":1.0,"text":"hey"}]}"#,
            Path::new("/x/talk.json"),
        )
        .unwrap();
        assert_eq!(docs[0].id.as_str(), "talk#seg-1");
    }

    #[test]
    fn scalar_rejected() {
        assert!(matches!(
            parse("42", Path::new("/x/n.json")),
            Err(DocumentError::UnsupportedFormat(_))
        ));
    }
}
