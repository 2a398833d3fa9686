mod env;
mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};

/// Config file used when neither `--config` nor `QUARRY_CONFIG` is given.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

impl Config {
    /// Pick the config file: an explicit path wins, then `QUARRY_CONFIG`, then
    /// [`DEFAULT_CONFIG_PATH`].
    #[must_use]
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        if let Ok(v) = std::env::var("QUARRY_CONFIG")
            && !v.is_empty()
        {
            return PathBuf::from(v);
        }
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a TOML file with env var overrides, then validate it.
    ///
    /// Falls back to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or if the
    /// resulting configuration is invalid.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str::<Self>(&content).context("failed to parse config file")?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns an error naming the first setting that is out of range.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.chunker.validate()?;
        self.embedding.validate()?;

        if self.llm.model.trim().is_empty() {
            bail!("llm.model must not be empty");
        }
        if self.llm.embedding_model.trim().is_empty() {
            bail!("llm.embedding_model must not be empty");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            bail!("retry.base_delay_ms must not exceed retry.max_delay_ms");
        }
        if self.timeouts.llm_seconds == 0 || self.timeouts.embedding_seconds == 0 {
            bail!("timeouts must be greater than zero");
        }
        if self.store.sqlite_path.trim().is_empty() {
            bail!("store.sqlite_path must not be empty");
        }
        if self.retrieval.top_k == 0 {
            bail!("retrieval.top_k must be greater than zero");
        }
        if self.retrieval.max_per_document == 0 {
            bail!("retrieval.max_per_document must be greater than zero");
        }
        if self.retrieval.candidate_multiplier == 0 {
            bail!("retrieval.candidate_multiplier must be greater than zero");
        }
        if !self.retrieval.score_threshold.is_finite() {
            bail!("retrieval.score_threshold must be finite");
        }
        if self.synthesis.prompt_budget_tokens == 0 {
            bail!("synthesis.prompt_budget_tokens must be greater than zero");
        }
        if self.synthesis.max_answer_tokens == 0 {
            bail!("synthesis.max_answer_tokens must be greater than zero");
        }
        if !(0.0..=2.0).contains(&self.synthesis.temperature) {
            bail!("synthesis.temperature must be within 0.0..=2.0");
        }
        if self.ingest.workers == 0 {
            bail!("ingest.workers must be greater than zero");
        }
        Ok(())
    }
}
