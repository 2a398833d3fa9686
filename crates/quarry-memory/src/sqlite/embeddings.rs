use super::{SqliteStore, placeholders};
use crate::error::MemoryError;

const MAX_BINDS: usize = 500;

fn encode(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode(bytes: &[u8], dimension: usize) -> Result<Vec<f32>, MemoryError> {
    if bytes.len() != dimension * 4 {
        return Err(MemoryError::Corrupt(format!(
            "embedding blob of {} bytes for dimension {dimension}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

impl SqliteStore {
    /// Fetch cached vectors for the given content hashes under one model.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a blob is malformed.
    pub async fn load_embeddings(
        &self,
        model_id: &str,
        hashes: &[String],
    ) -> Result<Vec<(String, Vec<f32>)>, MemoryError> {
        let mut out = Vec::new();
        for batch in hashes.chunks(MAX_BINDS) {
            let sql = format!(
                "SELECT content_hash, dimension, vector FROM embedding_cache \
                 WHERE model_id = ? AND content_hash IN ({})",
                placeholders(batch.len())
            );
            let mut query = sqlx::query_as::<_, (String, i64, Vec<u8>)>(&sql).bind(model_id);
            for h in batch {
                query = query.bind(h);
            }
            for (hash, dimension, blob) in query.fetch_all(&self.pool).await? {
                out.push((hash, decode(&blob, usize::try_from(dimension)?)?));
            }
        }
        Ok(out)
    }

    /// # Errors
    ///
    /// Returns an error if any insert fails; the batch is written atomically.
    pub async fn store_embeddings(
        &self,
        model_id: &str,
        items: &[(String, Vec<f32>)],
    ) -> Result<(), MemoryError> {
        let mut tx = self.pool.begin().await?;
        for (hash, vector) in items {
            sqlx::query(
                "INSERT OR REPLACE INTO embedding_cache (model_id, content_hash, dimension, vector) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(model_id)
            .bind(hash)
            .bind(i64::try_from(vector.len())?)
            .bind(encode(vector))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Drop cached vectors from every model other than `model_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete_embeddings_except(&self, model_id: &str) -> Result<u64, MemoryError> {
        let result = sqlx::query("DELETE FROM embedding_cache WHERE model_id != ?")
            .bind(model_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_and_load_bit_identical() {
        let store = SqliteStore::new(":memory:").await.unwrap();
        let v = vec![0.1_f32, -2.5, f32::MIN_POSITIVE];
        store
            .store_embeddings("m1", &[("h1".into(), v.clone())])
            .await
            .unwrap();

        let loaded = store
            .load_embeddings("m1", &["h1".into(), "missing".into()])
            .await
            .unwrap();
        assert_eq!(loaded, vec![("h1".to_string(), v)]);
        assert!(store.load_embeddings("m2", &["h1".into()]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_except_keeps_current_model() {
        let store = SqliteStore::new(":memory:").await.unwrap();
        store.store_embeddings("old", &[("h".into(), vec![1.0])]).await.unwrap();
        store.store_embeddings("new", &[("h".into(), vec![2.0])]).await.unwrap();

        assert_eq!(store.delete_embeddings_except("new").await.unwrap(), 1);
        assert!(store.load_embeddings("old", &["h".into()]).await.unwrap().is_empty());
        assert_eq!(store.load_embeddings("new", &["h".into()]).await.unwrap().len(), 1);
    }

    #[test]
    fn decode_rejects_wrong_length() {
        assert!(decode(&[0, 0, 0], 1).is_err());
        assert_eq!(decode(&encode(&[1.5]), 1).unwrap(), vec![1.5]);
    }
}
