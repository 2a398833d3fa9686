mod json;
mod text;
mod transcript;

pub use json::JsonDocumentLoader;
pub use text::TextLoader;
pub use transcript::{Transcript, TranscriptLoader, TranscriptSegment};

use std::path::Path;

use super::{DocumentError, DocumentLoader};
use crate::types::Document;

/// Pick a loader by file extension and load every document the file yields.
///
/// # Errors
///
/// Returns `DocumentError::UnsupportedFormat` for unknown extensions, or the
/// loader's own error.
pub async fn load_path(path: &Path) -> Result<Vec<Document>, DocumentError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let text = TextLoader::default();
    let json = JsonDocumentLoader::default();
    if text.supported_extensions().contains(&ext.as_str()) {
        text.load(path).await
    } else if json.supported_extensions().contains(&ext.as_str()) {
        json.load(path).await
    } else {
        Err(DocumentError::UnsupportedFormat(path.display().to_string()))
    }
}

async fn read_bounded(path: &Path, max_size: u64) -> Result<(std::path::PathBuf, String), DocumentError> {
    let path = tokio::fs::canonicalize(path).await?;
    let meta = tokio::fs::metadata(&path).await?;
    if meta.len() > max_size {
        return Err(DocumentError::FileTooLarge(meta.len()));
    }
    let content = tokio::fs::read_to_string(&path).await?;
    Ok((path, content))
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("document")
        .to_owned()
}
