use std::path::Path;
use std::pin::Pin;

use super::super::{DEFAULT_MAX_FILE_SIZE, DocumentError, DocumentLoader};
use super::{file_stem, read_bounded};
use crate::types::{Document, DocumentMetadata, MetadataValue, SourceKind};

/// Plain text and markdown files, one document per file keyed by canonical path.
pub struct TextLoader {
    pub max_file_size: u64,
}

impl Default for TextLoader {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl DocumentLoader for TextLoader {
    fn load(
        &self,
        path: &Path,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Vec<Document>, DocumentError>> + Send + '_>>
    {
        let path = path.to_path_buf();
        let max_size = self.max_file_size;
        Box::pin(async move {
            let (path, content) = read_bounded(&path, max_size).await?;

            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            let content_type = match ext.to_ascii_lowercase().as_str() {
                "md" | "markdown" => "text/markdown",
                _ => "text/plain",
            };

            let mut metadata = DocumentMetadata {
                title: Some(file_stem(&path)),
                source_kind: SourceKind::Upload,
                ..DocumentMetadata::default()
            };
            metadata
                .extra
                .insert("content_type".into(), MetadataValue::from(content_type));

            let display = path.display().to_string();
            Ok(vec![
                Document::new(display.clone(), format!("file://{display}"), content)
                    .with_metadata(metadata),
            ])
        })
    }

    fn supported_extensions(&self) -> &[&str] {
        &["txt", "md", "markdown"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_text_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("test.txt");
        std::fs::write(&file, "hello world").unwrap();

        let docs = TextLoader::default().load(&file).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].raw_text, "hello world");
        assert_eq!(docs[0].metadata.title.as_deref(), Some("test"));
        assert_eq!(docs[0].metadata.source_kind, SourceKind::Upload);
        assert!(docs[0].source_uri.starts_with("file://"));
    }

    #[tokio::test]
    async fn load_markdown_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("readme.md");
        std::fs::write(&file, "# Title").unwrap();

        let docs = TextLoader::default().load(&file).await.unwrap();
        assert_eq!(
            docs[0].metadata.field("content_type"),
            Some(MetadataValue::from("text/markdown"))
        );
    }

    #[tokio::test]
    async fn load_nonexistent_file() {
        let result = TextLoader::default()
            .load(Path::new("/nonexistent/file.txt"))
            .await;
        assert!(matches!(result, Err(DocumentError::Io(_))));
    }

    #[tokio::test]
    async fn file_over_limit_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("big.txt");
        std::fs::write(&file, "0123456789").unwrap();

        let loader = TextLoader { max_file_size: 4 };
        assert!(matches!(
            loader.load(&file).await,
            Err(DocumentError::FileTooLarge(10))
        ));
    }
}
