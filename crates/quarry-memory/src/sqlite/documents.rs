use super::SqliteStore;
use crate::error::MemoryError;
use crate::types::{Document, DocumentId, DocumentStatus};

/// Result of writing a document: the stored version and whether anything changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveOutcome {
    pub version: u32,
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRecord {
    pub id: DocumentId,
    pub source_uri: String,
    pub version: u32,
    pub status: DocumentStatus,
    pub failure: Option<String>,
    pub chunk_count: usize,
}

fn parse_status(s: &str) -> Result<DocumentStatus, MemoryError> {
    s.parse().map_err(MemoryError::Corrupt)
}

impl SqliteStore {
    /// Insert a new document or supersede an existing one with the same id.
    ///
    /// The version is bumped only when the text or metadata differ. The status is
    /// reset to `pending` either way.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or metadata cannot be serialized.
    pub async fn save_document(&self, doc: &Document) -> Result<SaveOutcome, MemoryError> {
        let hash = doc.content_hash();
        let metadata = serde_json::to_string(&doc.metadata)?;
        let mut tx = self.pool.begin().await?;

        let existing: Option<(i64, String, String)> =
            sqlx::query_as("SELECT version, content_hash, metadata FROM documents WHERE id = ?")
                .bind(doc.id.as_str())
                .fetch_optional(&mut *tx)
                .await?;

        let outcome = if let Some((version, old_hash, old_meta)) = existing {
            let changed = old_hash != hash || old_meta != metadata;
            let version = if changed { version + 1 } else { version };
            sqlx::query(
                "UPDATE documents SET source_uri = ?, raw_text = ?, metadata = ?, content_hash = ?, \
                 version = ?, status = 'pending', failure = NULL, updated_at = datetime('now') \
                 WHERE id = ?",
            )
            .bind(&doc.source_uri)
            .bind(&doc.raw_text)
            .bind(&metadata)
            .bind(&hash)
            .bind(version)
            .bind(doc.id.as_str())
            .execute(&mut *tx)
            .await?;
            SaveOutcome {
                version: u32::try_from(version)?,
                changed,
            }
        } else {
            sqlx::query(
                "INSERT INTO documents (id, source_uri, raw_text, metadata, content_hash, version) \
                 VALUES (?, ?, ?, ?, ?, 1)",
            )
            .bind(doc.id.as_str())
            .bind(&doc.source_uri)
            .bind(&doc.raw_text)
            .bind(&metadata)
            .bind(&hash)
            .execute(&mut *tx)
            .await?;
            SaveOutcome {
                version: 1,
                changed: true,
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    /// What [`SqliteStore::save_document`] would record for `doc`, without writing.
    /// `None` when no document with this id is stored yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or metadata cannot be serialized.
    pub async fn preview_save(&self, doc: &Document) -> Result<Option<SaveOutcome>, MemoryError> {
        let hash = doc.content_hash();
        let metadata = serde_json::to_string(&doc.metadata)?;
        let existing: Option<(i64, String, String)> =
            sqlx::query_as("SELECT version, content_hash, metadata FROM documents WHERE id = ?")
                .bind(doc.id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        existing
            .map(|(version, old_hash, old_meta)| -> Result<SaveOutcome, MemoryError> {
                let changed = old_hash != hash || old_meta != metadata;
                let version = if changed { version + 1 } else { version };
                Ok(SaveOutcome {
                    version: u32::try_from(version)?,
                    changed,
                })
            })
            .transpose()
    }

    /// # Errors
    ///
    /// Returns an error if the query fails or the stored row is malformed.
    pub async fn load_document(&self, id: &DocumentId) -> Result<Option<Document>, MemoryError> {
        let row: Option<(String, String, String, String, i64)> = sqlx::query_as(
            "SELECT id, source_uri, raw_text, metadata, version FROM documents WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_document).transpose()
    }

    /// All stored documents, oldest first. Used to re-ingest after a model change.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a stored row is malformed.
    pub async fn all_documents(&self) -> Result<Vec<Document>, MemoryError> {
        let rows: Vec<(String, String, String, String, i64)> = sqlx::query_as(
            "SELECT id, source_uri, raw_text, metadata, version FROM documents \
             ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_document).collect()
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_documents(&self) -> Result<Vec<DocumentRecord>, MemoryError> {
        let rows: Vec<(String, String, i64, String, Option<String>, i64)> = sqlx::query_as(
            "SELECT d.id, d.source_uri, d.version, d.status, d.failure, \
             (SELECT COUNT(*) FROM chunks c WHERE c.document_id = d.id) \
             FROM documents d ORDER BY d.id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, source_uri, version, status, failure, chunks)| {
                Ok(DocumentRecord {
                    id: DocumentId::new(id),
                    source_uri,
                    version: u32::try_from(version)?,
                    status: parse_status(&status)?,
                    failure,
                    chunk_count: usize::try_from(chunks)?,
                })
            })
            .collect()
    }

    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn set_document_status(
        &self,
        id: &DocumentId,
        status: DocumentStatus,
        failure: Option<&str>,
    ) -> Result<(), MemoryError> {
        sqlx::query(
            "UPDATE documents SET status = ?, failure = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(failure)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete a document and, through the foreign key cascade, its chunks.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete_document(&self, id: &DocumentId) -> Result<bool, MemoryError> {
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn status_counts(&self) -> Result<Vec<(DocumentStatus, usize)>, MemoryError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM documents GROUP BY status ORDER BY status")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(status, count)| Ok((parse_status(&status)?, usize::try_from(count)?)))
            .collect()
    }
}

fn row_to_document(
    (id, source_uri, raw_text, metadata, version): (String, String, String, String, i64),
) -> Result<Document, MemoryError> {
    Ok(Document {
        id: DocumentId::new(id),
        source_uri,
        raw_text,
        metadata: serde_json::from_str(&metadata)?,
        version: u32::try_from(version)?,
    })
}
