use std::io::Write;
use std::path::Path;

use serial_test::serial;

use super::*;

const ENV_KEYS: [&str; 18] = [
    "QUARRY_CONFIG",
    "QUARRY_LLM_PROVIDER",
    "QUARRY_LLM_BASE_URL",
    "QUARRY_LLM_MODEL",
    "QUARRY_LLM_EMBEDDING_MODEL",
    "QUARRY_OPENAI_API_KEY",
    "QUARRY_TIMEOUT_LLM",
    "QUARRY_TIMEOUT_EMBEDDING",
    "QUARRY_RETRY_MAX_ATTEMPTS",
    "QUARRY_SQLITE_PATH",
    "QUARRY_INDEX_PATH",
    "QUARRY_CHUNK_MAX_TOKENS",
    "QUARRY_CHUNK_OVERLAP_TOKENS",
    "QUARRY_EMBEDDING_CONCURRENCY",
    "QUARRY_RETRIEVAL_TOP_K",
    "QUARRY_INGEST_WORKERS",
    "QUARRY_LOG",
    "RUST_LOG",
];

fn clear_env() {
    for key in ENV_KEYS {
        unsafe { std::env::remove_var(key) };
    }
}

fn write_config(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("quarry.toml");
    let mut f = std::fs::File::create(&path).unwrap();
    write!(f, "{body}").unwrap();
    path
}

#[test]
fn defaults_when_file_missing() {
    let config = Config::default();
    assert_eq!(config.llm.provider, ProviderKind::Ollama);
    assert_eq!(config.llm.base_url, "http://localhost:11434");
    assert_eq!(config.chunker.max_tokens, 400);
    assert_eq!(config.chunker.overlap_tokens, 50);
    assert_eq!(config.embedding.max_batch_size, 32);
    assert_eq!(config.embedding.max_concurrency, 4);
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.retry.base_delay_ms, 500);
    assert_eq!(config.retry.max_delay_ms, 8000);
    assert!(config.retry.jitter);
    assert_eq!(config.timeouts.llm_seconds, 120);
    assert_eq!(config.timeouts.embedding_seconds, 30);
    assert_eq!(config.retrieval.top_k, 5);
    assert_eq!(config.retrieval.max_per_document, 3);
    assert_eq!(config.retrieval.candidate_multiplier, 4);
    assert_eq!(config.synthesis.prompt_budget_tokens, 3000);
    assert_eq!(config.ingest.workers, 4);
    assert_eq!(config.observability.log_filter, "info");
    assert!(config.secrets.openai_api_key.is_none());
    config.validate().unwrap();
}

#[test]
#[serial]
fn missing_file_loads_defaults() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.retrieval.top_k, 5);
}

#[test]
#[serial]
fn parse_valid_toml() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
[llm]
provider = "openai"
base_url = "https://api.example.com/v1"
model = "gpt-4o-mini"
embedding_model = "text-embedding-3-small"

[chunker]
max_tokens = 200
overlap_tokens = 20

[store]
sqlite_path = "./test.db"
metric = "inner_product"

[retrieval]
top_k = 8
score_threshold = 0.25
"#,
    );

    clear_env();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.llm.provider, ProviderKind::OpenAi);
    assert_eq!(config.llm.model, "gpt-4o-mini");
    assert_eq!(config.chunker.max_tokens, 200);
    assert_eq!(config.chunker.overlap_tokens, 20);
    assert_eq!(config.store.sqlite_path, "./test.db");
    assert_eq!(config.store.metric, quarry_memory::SimilarityMetric::InnerProduct);
    assert_eq!(config.store.index_path.as_deref(), Some("./data/index.json"));
    assert_eq!(config.retrieval.top_k, 8);
    assert!((config.retrieval.score_threshold - 0.25).abs() < f32::EPSILON);
    assert_eq!(config.retrieval.max_per_document, 3);
    assert_eq!(config.embedding.max_batch_size, 32);
}

#[test]
#[serial]
fn malformed_toml_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), "[llm\nmodel = ");
    clear_env();
    assert!(Config::load(&path).is_err());
}

#[test]
#[serial]
fn invalid_chunker_rejected_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), "[chunker]\nmax_tokens = 10\noverlap_tokens = 10\n");
    clear_env();
    let err = Config::load(&path).unwrap_err();
    assert!(format!("{err:#}").contains("overlap"));
}

#[test]
#[serial]
fn env_overrides() {
    clear_env();
    let mut config = Config::default();

    unsafe { std::env::set_var("QUARRY_LLM_MODEL", "phi3:mini") };
    unsafe { std::env::set_var("QUARRY_INGEST_WORKERS", "8") };
    unsafe { std::env::set_var("QUARRY_INDEX_PATH", "") };
    unsafe { std::env::set_var("QUARRY_OPENAI_API_KEY", "sk-test") };
    config.apply_env_overrides();
    clear_env();

    assert_eq!(config.llm.model, "phi3:mini");
    assert_eq!(config.ingest.workers, 8);
    assert!(config.store.index_path.is_none());
    let key = config.secrets.openai_api_key.as_ref().unwrap();
    assert_eq!(key.expose(), "sk-test");
    assert_eq!(format!("{key:?}"), "[REDACTED]");
}

#[test]
#[serial]
fn env_override_unparseable_number_ignored() {
    clear_env();
    let mut config = Config::default();
    unsafe { std::env::set_var("QUARRY_RETRIEVAL_TOP_K", "many") };
    config.apply_env_overrides();
    clear_env();
    assert_eq!(config.retrieval.top_k, 5);
}

#[test]
#[serial]
fn env_override_invalid_provider_ignored() {
    clear_env();
    let mut config = Config::default();
    unsafe { std::env::set_var("QUARRY_LLM_PROVIDER", "carrier-pigeon") };
    config.apply_env_overrides();
    clear_env();
    assert_eq!(config.llm.provider, ProviderKind::Ollama);
}

#[test]
#[serial]
fn resolve_path_precedence() {
    clear_env();
    assert_eq!(Config::resolve_path(None), Path::new(DEFAULT_CONFIG_PATH));

    unsafe { std::env::set_var("QUARRY_CONFIG", "/etc/quarry.toml") };
    assert_eq!(Config::resolve_path(None), Path::new("/etc/quarry.toml"));
    assert_eq!(
        Config::resolve_path(Some(Path::new("cli.toml"))),
        Path::new("cli.toml")
    );
    clear_env();
}

#[test]
fn validate_rejects_zero_values() {
    let mut config = Config::default();
    config.ingest.workers = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.retry.max_attempts = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.retrieval.max_per_document = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.embedding.max_concurrency = 0;
    assert!(config.validate().is_err());
}

#[test]
fn retry_policy_carries_timeout() {
    let config = Config::default();
    let policy = config.retry.policy(config.timeouts.embedding_seconds);
    assert_eq!(policy.max_attempts, 3);
    assert_eq!(policy.call_timeout, Some(std::time::Duration::from_secs(30)));
    assert_eq!(policy.max_delay, std::time::Duration::from_secs(8));
}
