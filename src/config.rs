use serde::Deserialize;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::pipeline::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_generation_url")]
    pub base_url: String,
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
}

// Manual Debug impl to avoid leaking the API key
impl std::fmt::Debug for GenerationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationConfig")
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("max_turns", &self.max_turns)
            .field("base_url", &self.base_url)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            max_turns: default_max_turns(),
            base_url: default_generation_url(),
            timeout_secs: default_generation_timeout(),
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct SearchConfig {
    /// Search credential. When absent, tool-augmented stages run without tools.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_num_results")]
    pub num_results: usize,
    #[serde(default = "default_max_page_chars")]
    pub max_page_chars: usize,
    /// Bytes read from a fetched page before the rest is discarded.
    #[serde(default = "default_max_page_bytes")]
    pub max_page_bytes: usize,
}

// Manual Debug impl to avoid leaking the API key
impl std::fmt::Debug for SearchConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("endpoint", &self.endpoint)
            .field("timeout_secs", &self.timeout_secs)
            .field("num_results", &self.num_results)
            .field("max_page_chars", &self.max_page_chars)
            .field("max_page_bytes", &self.max_page_bytes)
            .finish()
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: default_search_endpoint(),
            timeout_secs: default_tool_timeout(),
            num_results: default_num_results(),
            max_page_chars: default_max_page_chars(),
            max_page_bytes: default_max_page_bytes(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Retries after the first attempt of a stage.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: u32,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    #[serde(default = "default_tool_concurrency")]
    pub tool_concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_factor: default_backoff_factor(),
            max_backoff_secs: default_max_backoff_secs(),
            run_timeout_secs: default_run_timeout_secs(),
            tool_concurrency: default_tool_concurrency(),
        }
    }
}

impl PipelineConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            factor: self.backoff_factor,
            max_delay: Duration::from_secs(self.max_backoff_secs),
        }
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_max_turns() -> u32 {
    8
}

fn default_generation_url() -> String {
    "https://api.anthropic.com/v1/messages".to_string()
}

fn default_generation_timeout() -> u64 {
    120
}

fn default_search_endpoint() -> String {
    "https://google.serper.dev/search".to_string()
}

fn default_tool_timeout() -> u64 {
    10
}

fn default_num_results() -> usize {
    5
}

fn default_max_page_chars() -> usize {
    5000
}

fn default_max_page_bytes() -> usize {
    2_000_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_factor() -> u32 {
    2
}

fn default_max_backoff_secs() -> u64 {
    30
}

fn default_run_timeout_secs() -> u64 {
    600
}

fn default_tool_concurrency() -> usize {
    4
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // Load from file if specified
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        } else {
            builder = builder.add_source(config::File::with_name("marketflow").required(false));
        }

        // Environment variable overrides with MARKETFLOW__ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("MARKETFLOW")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?;

        let mut config: AppConfig = config
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))?;

        config.apply_credential_fallbacks(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Fill credentials from the conventional provider variables when the
    /// configuration sources left them empty.
    fn apply_credential_fallbacks<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.generation.api_key.trim().is_empty() {
            if let Some(key) = lookup("ANTHROPIC_API_KEY") {
                self.generation.api_key = key;
            }
        }

        let search_key_missing = self
            .search
            .api_key
            .as_deref()
            .map_or(true, |k| k.trim().is_empty());
        if search_key_missing {
            self.search.api_key = lookup("SERPER_API_KEY").filter(|k| !k.trim().is_empty());
        }
    }

    fn validate(&self) -> Result<()> {
        if self.generation.api_key.trim().is_empty() {
            return Err(AppError::Config(
                "No generation API key found. Set generation.api_key, \
                 MARKETFLOW__GENERATION__API_KEY or ANTHROPIC_API_KEY"
                    .to_string(),
            ));
        }
        if self.pipeline.tool_concurrency == 0 {
            return Err(AppError::Config(
                "pipeline.tool_concurrency must be at least 1".to_string(),
            ));
        }
        if self.pipeline.backoff_factor == 0 {
            return Err(AppError::Config(
                "pipeline.backoff_factor must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn generation_api_key(&self) -> &str {
        &self.generation.api_key
    }

    pub fn search_api_key(&self) -> Option<&str> {
        self.search.api_key.as_deref()
    }
}
