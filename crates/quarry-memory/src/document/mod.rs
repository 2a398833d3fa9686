pub mod chunker;
pub mod error;
pub mod loader;

pub use chunker::{Chunker, ChunkerConfig, ChunkerError, count_tokens};
pub use error::DocumentError;
pub use loader::{JsonDocumentLoader, TextLoader, TranscriptLoader, load_path};

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use crate::types::Document;

/// Default maximum file size: 50 MiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

pub trait DocumentLoader: Send + Sync {
    fn load(
        &self,
        path: &Path,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Document>, DocumentError>> + Send + '_>>;

    fn supported_extensions(&self) -> &[&str];
}
