use std::collections::HashMap;

use super::{SqliteStore, placeholders};
use crate::error::MemoryError;
use crate::types::{Chunk, ChunkId, DocumentId};

/// Keeps dynamic `IN (...)` lists under SQLite's bound-parameter limit.
const MAX_BINDS: usize = 500;

type ChunkRow = (String, String, i64, String, i64, i64, i64, i64, i64);

const CHUNK_COLUMNS: &str = "id, document_id, position, text, token_count, start_token, \
                             overlap_tokens, start_byte, end_byte";

fn row_to_chunk(
    (id, document_id, position, text, token_count, start_token, overlap, start_byte, end_byte): ChunkRow,
) -> Result<Chunk, MemoryError> {
    Ok(Chunk {
        id: id
            .parse()
            .map_err(|e| MemoryError::Corrupt(format!("chunk id {id}: {e}")))?,
        document_id: DocumentId::new(document_id),
        text,
        position: usize::try_from(position)?,
        token_count: usize::try_from(token_count)?,
        start_token: usize::try_from(start_token)?,
        overlap_tokens: usize::try_from(overlap)?,
        start_byte: usize::try_from(start_byte)?,
        end_byte: usize::try_from(end_byte)?,
    })
}

impl SqliteStore {
    /// Insert chunks in one transaction. Existing ids are overwritten in place.
    ///
    /// # Errors
    ///
    /// Returns an error if any insert fails (nothing is written in that case) or the
    /// owning document does not exist.
    pub async fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<(), MemoryError> {
        let mut tx = self.pool.begin().await?;
        for c in chunks {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, position, text, token_count, start_token, \
                 overlap_tokens, start_byte, end_byte) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET position = excluded.position, text = excluded.text, \
                 token_count = excluded.token_count, start_token = excluded.start_token, \
                 overlap_tokens = excluded.overlap_tokens, start_byte = excluded.start_byte, \
                 end_byte = excluded.end_byte",
            )
            .bind(c.id.to_string())
            .bind(c.document_id.as_str())
            .bind(i64::try_from(c.position)?)
            .bind(&c.text)
            .bind(i64::try_from(c.token_count)?)
            .bind(i64::try_from(c.start_token)?)
            .bind(i64::try_from(c.overlap_tokens)?)
            .bind(i64::try_from(c.start_byte)?)
            .bind(i64::try_from(c.end_byte)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn chunk_ids_for_document(
        &self,
        document_id: &DocumentId,
    ) -> Result<Vec<ChunkId>, MemoryError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM chunks WHERE document_id = ? ORDER BY position")
                .bind(document_id.as_str())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(id,)| {
                id.parse()
                    .map_err(|e| MemoryError::Corrupt(format!("chunk id {id}: {e}")))
            })
            .collect()
    }

    /// # Errors
    ///
    /// Returns an error if the query fails or a row is malformed.
    pub async fn chunks_for_document(
        &self,
        document_id: &DocumentId,
    ) -> Result<Vec<Chunk>, MemoryError> {
        let rows: Vec<ChunkRow> = sqlx::query_as(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE document_id = ? ORDER BY position"
        ))
        .bind(document_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_chunk).collect()
    }

    /// Resolve chunk text for search hits. Ids with no row are simply absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is malformed.
    pub async fn chunks_by_ids(
        &self,
        ids: &[ChunkId],
    ) -> Result<HashMap<ChunkId, Chunk>, MemoryError> {
        let mut out = HashMap::with_capacity(ids.len());
        for batch in ids.chunks(MAX_BINDS) {
            let sql = format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks WHERE id IN ({})",
                placeholders(batch.len())
            );
            let mut query = sqlx::query_as::<_, ChunkRow>(&sql);
            for id in batch {
                query = query.bind(id.to_string());
            }
            for row in query.fetch_all(&self.pool).await? {
                let chunk = row_to_chunk(row)?;
                out.insert(chunk.id, chunk);
            }
        }
        Ok(out)
    }

    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete_chunks(&self, ids: &[ChunkId]) -> Result<u64, MemoryError> {
        let mut deleted = 0;
        for batch in ids.chunks(MAX_BINDS) {
            let sql = format!("DELETE FROM chunks WHERE id IN ({})", placeholders(batch.len()));
            let mut query = sqlx::query(&sql);
            for id in batch {
                query = query.bind(id.to_string());
            }
            deleted += query.execute(&self.pool).await?.rows_affected();
        }
        Ok(deleted)
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn chunk_count(&self) -> Result<usize, MemoryError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count)?)
    }
}
