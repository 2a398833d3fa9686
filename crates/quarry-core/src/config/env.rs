use super::{Config, Secret};

impl Config {
    pub(crate) fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_llm();
        self.apply_env_overrides_pipeline();
    }

    fn apply_env_overrides_llm(&mut self) {
        if let Ok(v) = std::env::var("QUARRY_LLM_PROVIDER") {
            if let Ok(kind) = serde_json::from_value(serde_json::Value::String(v.clone())) {
                self.llm.provider = kind;
            } else {
                tracing::warn!("ignoring invalid QUARRY_LLM_PROVIDER value: {v}");
            }
        }
        if let Ok(v) = std::env::var("QUARRY_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Ok(v) = std::env::var("QUARRY_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Ok(v) = std::env::var("QUARRY_LLM_EMBEDDING_MODEL") {
            self.llm.embedding_model = v;
        }
        if let Ok(v) = std::env::var("QUARRY_OPENAI_API_KEY")
            && !v.is_empty()
        {
            self.secrets.openai_api_key = Some(Secret::new(v));
        }
        if let Ok(v) = std::env::var("QUARRY_TIMEOUT_LLM")
            && let Ok(secs) = v.parse::<u64>()
        {
            self.timeouts.llm_seconds = secs;
        }
        if let Ok(v) = std::env::var("QUARRY_TIMEOUT_EMBEDDING")
            && let Ok(secs) = v.parse::<u64>()
        {
            self.timeouts.embedding_seconds = secs;
        }
        if let Ok(v) = std::env::var("QUARRY_RETRY_MAX_ATTEMPTS")
            && let Ok(n) = v.parse::<u32>()
        {
            self.retry.max_attempts = n;
        }
    }

    fn apply_env_overrides_pipeline(&mut self) {
        if let Ok(v) = std::env::var("QUARRY_SQLITE_PATH") {
            self.store.sqlite_path = v;
        }
        if let Ok(v) = std::env::var("QUARRY_INDEX_PATH") {
            self.store.index_path = if v.is_empty() { None } else { Some(v) };
        }
        if let Ok(v) = std::env::var("QUARRY_CHUNK_MAX_TOKENS")
            && let Ok(n) = v.parse::<usize>()
        {
            self.chunker.max_tokens = n;
        }
        if let Ok(v) = std::env::var("QUARRY_CHUNK_OVERLAP_TOKENS")
            && let Ok(n) = v.parse::<usize>()
        {
            self.chunker.overlap_tokens = n;
        }
        if let Ok(v) = std::env::var("QUARRY_EMBEDDING_CONCURRENCY")
            && let Ok(n) = v.parse::<usize>()
        {
            self.embedding.max_concurrency = n;
        }
        if let Ok(v) = std::env::var("QUARRY_RETRIEVAL_TOP_K")
            && let Ok(n) = v.parse::<usize>()
        {
            self.retrieval.top_k = n;
        }
        if let Ok(v) = std::env::var("QUARRY_INGEST_WORKERS")
            && let Ok(n) = v.parse::<usize>()
        {
            self.ingest.workers = n;
        }
        if let Ok(v) = std::env::var("QUARRY_LOG") {
            self.observability.log_filter = v;
        }
    }
}
