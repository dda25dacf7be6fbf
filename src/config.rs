//! Explicit run configuration.
//!
//! Built once at startup and passed by reference into the completion client and
//! the pipeline. Nothing here reads process-global state except the `from_env`
//! helpers, which only fill in values the caller left unset.

use crate::error::{Result, StrategyError};
use crate::personas::PersonaCatalogue;
use std::time::Duration;

/// Default OpenAI-compatible endpoint
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Default chat model
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Output budget per completion, large enough for multi-paragraph answers
pub const DEFAULT_MAX_TOKENS: u32 = 2000;

/// Request timeout in seconds
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Wait before the single retry of a failed completion
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1000;

/// Number of rephrasing candidates requested per run
pub const DEFAULT_CANDIDATE_COUNT: usize = 10;

/// Upper bound on rephrasing candidates per run
pub const MAX_CANDIDATE_COUNT: usize = 50;

/// Sampling temperature for the rephrasing stage
pub const DEFAULT_REPHRASE_TEMPERATURE: f32 = 0.3;

/// Maximum concurrent completion requests within a stage
pub const MAX_CONCURRENT_REQUESTS: usize = 8;

/// LLM endpoint configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
    pub retry_backoff_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
        }
    }
}

impl LlmConfig {
    /// Build from explicit values, falling back to environment variables.
    ///
    /// Lookup order for each field: argument, `SYNTHSCOPE_LLM_*`, `OPENAI_*`,
    /// then the built-in default.
    pub fn from_env(
        base_url: Option<String>,
        api_key: Option<String>,
        model: Option<String>,
    ) -> Self {
        let base_url = base_url
            .or_else(|| std::env::var("SYNTHSCOPE_LLM_BASE_URL").ok())
            .or_else(|| std::env::var("OPENAI_BASE_URL").ok())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let api_key = api_key
            .or_else(|| std::env::var("SYNTHSCOPE_LLM_API_KEY").ok())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();

        let model = model
            .or_else(|| std::env::var("SYNTHSCOPE_LLM_MODEL").ok())
            .or_else(|| std::env::var("OPENAI_MODEL").ok())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        Self {
            base_url,
            api_key,
            model,
            ..Default::default()
        }
    }

    /// Request timeout as a `Duration`
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Backoff before the retry as a `Duration`
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Check the configuration before any request is issued
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.base_url).map_err(|e| {
            StrategyError::Configuration(format!("invalid LLM base URL {:?}: {}", self.base_url, e))
        })?;
        if self.model.trim().is_empty() {
            return Err(StrategyError::Configuration("LLM model name is empty".to_string()));
        }
        if self.max_tokens == 0 {
            return Err(StrategyError::Configuration("max_tokens must be positive".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(StrategyError::Configuration(
                "request timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Pipeline behaviour configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Rephrasing candidates to generate (K)
    pub candidate_count: usize,
    /// Temperature for candidate generation
    pub rephrase_temperature: f32,
    /// Temperature for every other stage
    pub stage_temperature: f32,
    /// In-flight completions for the candidate and per-database stages
    pub max_concurrency: usize,
    /// Continue with no per-database strategies when the database list cannot be parsed
    pub allow_empty_database_list: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            candidate_count: DEFAULT_CANDIDATE_COUNT,
            rephrase_temperature: DEFAULT_REPHRASE_TEMPERATURE,
            stage_temperature: 0.0,
            max_concurrency: 4,
            allow_empty_database_list: false,
        }
    }
}

impl PipelineConfig {
    /// Concurrency clamped to `1..=MAX_CONCURRENT_REQUESTS`
    pub fn concurrency(&self) -> usize {
        self.max_concurrency.clamp(1, MAX_CONCURRENT_REQUESTS)
    }

    /// Check the configuration before the run starts
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_CANDIDATE_COUNT).contains(&self.candidate_count) {
            return Err(StrategyError::Configuration(format!(
                "candidate_count must be within 1..={}, got {}",
                MAX_CANDIDATE_COUNT, self.candidate_count
            )));
        }
        for (name, t) in [
            ("rephrase_temperature", self.rephrase_temperature),
            ("stage_temperature", self.stage_temperature),
        ] {
            if !(0.0..=2.0).contains(&t) {
                return Err(StrategyError::Configuration(format!(
                    "{} must be within [0, 2], got {}",
                    name, t
                )));
            }
        }
        Ok(())
    }
}

/// Everything a run needs, constructed once at startup
#[derive(Debug, Clone, Default)]
pub struct StrategyConfig {
    pub llm: LlmConfig,
    pub pipeline: PipelineConfig,
    pub personas: PersonaCatalogue,
}

impl StrategyConfig {
    /// Validate every part before any completion is issued
    pub fn validate(&self) -> Result<()> {
        self.llm.validate()?;
        self.pipeline.validate()
    }
}
