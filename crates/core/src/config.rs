//! # Venture Configuration
//!
//! Runtime settings for the orchestrator, persisted as JSON at
//! `.venture/config.json`. A missing file means defaults; a partial document
//! overrides only the fields it names.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::{LlmProvider, ModelConfig};
use crate::stages::{RetryPolicy, StageOverride};

/// Default config file location, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = ".venture/config.json";

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VentureConfig {
    /// LLM provider for every stage
    pub provider: LlmProvider,
    /// Model name; the provider's default when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Base URL override for OpenAI-compatible endpoints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Per-stage model overrides keyed by stage name
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub per_stage_models: HashMap<String, String>,
    /// Process-wide cap on in-flight inference calls
    pub max_concurrent_inference: usize,
    /// Budget for a whole job
    pub job_timeout_secs: u64,
    /// Budget for a single inference attempt
    pub stage_timeout_secs: u64,
    /// Provider retries after the first attempt
    pub retry_budget: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Run independent stages of a wave concurrently
    pub parallel_stages: bool,
    /// How long terminal jobs stay in the durable store
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
    /// Per-job live event channel capacity
    pub event_buffer: usize,
    /// Longest accepted idea text, in characters
    pub max_idea_chars: usize,
    pub database_path: PathBuf,
    /// Per-stage timeout and retry overrides keyed by stage name
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub stage_overrides: HashMap<String, StageOverride>,
}

impl Default for VentureConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            model: None,
            base_url: None,
            per_stage_models: HashMap::new(),
            max_concurrent_inference: 4,
            job_timeout_secs: 300,
            stage_timeout_secs: 45,
            retry_budget: 2,
            backoff_base_ms: 500,
            backoff_max_ms: 8000,
            parallel_stages: false,
            retention_secs: 86_400,
            sweep_interval_secs: 300,
            event_buffer: 64,
            max_idea_chars: 4000,
            database_path: PathBuf::from(".venture/venture.db"),
            stage_overrides: HashMap::new(),
        }
    }
}

impl VentureConfig {
    /// Load from the default location
    pub async fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH).await
    }

    /// Load from `path`, falling back to defaults when the file is absent
    pub async fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: VentureConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        tracing::info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Write the config as pretty JSON, creating parent directories
    pub async fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    /// Resolved provider settings for the HTTP backend
    pub fn model_config(&self) -> ModelConfig {
        let model = self
            .model
            .clone()
            .unwrap_or_else(|| self.provider.default_model().to_string());
        let config = ModelConfig::with_provider(self.provider, model);
        match &self.base_url {
            Some(url) => config.with_base_url(url.clone()),
            None => config,
        }
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms.max(self.backoff_base_ms)),
        }
    }
}
