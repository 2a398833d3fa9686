use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::error::MemoryError;
use crate::sqlite::SqliteStore;

type Key = (String, String);

/// Embeddings keyed by `(model_id, content hash)`, in memory with optional write-through
/// to the `SQLite` store so identical text is never embedded twice across runs.
#[derive(Default)]
pub struct EmbeddingCache {
    entries: RwLock<HashMap<Key, Vec<f32>>>,
    store: Option<SqliteStore>,
}

impl std::fmt::Debug for EmbeddingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingCache")
            .field("entries", &self.len())
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl EmbeddingCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_store(store: SqliteStore) -> Self {
        Self {
            entries: RwLock::default(),
            store: Some(store),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up vectors by content hash. Misses are simply absent from the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the persistent store cannot be read.
    pub async fn get_many(
        &self,
        model_id: &str,
        hashes: &[String],
    ) -> Result<HashMap<String, Vec<f32>>, MemoryError> {
        let mut found = HashMap::with_capacity(hashes.len());
        let mut missing = Vec::new();
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            for h in hashes {
                match entries.get(&(model_id.to_owned(), h.clone())) {
                    Some(v) => {
                        found.insert(h.clone(), v.clone());
                    }
                    None => missing.push(h.clone()),
                }
            }
        }

        if let Some(store) = &self.store
            && !missing.is_empty()
        {
            let loaded = store.load_embeddings(model_id, &missing).await?;
            if !loaded.is_empty() {
                let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
                for (h, v) in &loaded {
                    entries.insert((model_id.to_owned(), h.clone()), v.clone());
                }
            }
            found.extend(loaded);
        }
        Ok(found)
    }

    /// # Errors
    ///
    /// Returns an error if the persistent store rejects the write; memory is left
    /// untouched in that case.
    pub async fn insert_many(
        &self,
        model_id: &str,
        items: Vec<(String, Vec<f32>)>,
    ) -> Result<(), MemoryError> {
        if items.is_empty() {
            return Ok(());
        }
        if let Some(store) = &self.store {
            store.store_embeddings(model_id, &items).await?;
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        for (h, v) in items {
            entries.insert((model_id.to_owned(), h), v);
        }
        Ok(())
    }

    /// Drop every entry produced by a model other than `model_id`; returns how many
    /// in-memory entries were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the persistent store cannot be cleaned.
    pub async fn invalidate_except(&self, model_id: &str) -> Result<usize, MemoryError> {
        if let Some(store) = &self.store {
            store.delete_embeddings_except(model_id).await?;
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(m, _), _| m == model_id);
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_hit_and_miss() {
        let cache = EmbeddingCache::new();
        cache
            .insert_many("m", vec![("h1".into(), vec![1.0, 2.0])])
            .await
            .unwrap();
        let got = cache
            .get_many("m", &["h1".into(), "h2".into()])
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got["h1"], vec![1.0, 2.0]);
        assert!(cache.get_many("other", &["h1".into()]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn persistent_entries_survive_new_cache() {
        let store = SqliteStore::new(":memory:").await.unwrap();
        let first = EmbeddingCache::with_store(store.clone());
        first
            .insert_many("m", vec![("h".into(), vec![0.5])])
            .await
            .unwrap();

        let second = EmbeddingCache::with_store(store);
        assert!(second.is_empty());
        let got = second.get_many("m", &["h".into()]).await.unwrap();
        assert_eq!(got["h"], vec![0.5]);
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn invalidate_except_removes_foreign_models() {
        let cache = EmbeddingCache::new();
        cache.insert_many("old", vec![("a".into(), vec![1.0])]).await.unwrap();
        cache.insert_many("new", vec![("a".into(), vec![2.0])]).await.unwrap();
        assert_eq!(cache.invalidate_except("new").await.unwrap(), 1);
        assert_eq!(cache.len(), 1);
    }
}
