//! LLM completion client.
//!
//! [`CompletionClient`] is the seam to the text-completion service. The
//! OpenAI-compatible HTTP implementation lives here, and [`Completer`] wraps any
//! client with the per-run policy: persona/context prompt building, a timeout
//! per call, one retry after a backoff, cancellation and token accounting.

use crate::config::LlmConfig;
use crate::error::{Result, StrategyError};
use crate::pipeline::Stage;
use crate::prompts::build_question_prompt;
use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One completion call: prompt, sampling temperature and output budget.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Raw completion text plus the usage reported by the service
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

impl Completion {
    /// Completion without usage information
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: TokenUsage::default(),
        }
    }
}

/// Failure of the completion service itself
#[derive(Debug, Error)]
pub enum TransportError {
    /// Network/HTTP request error
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Service answered with a non-success status
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Rate limited by the service
    #[error("Rate limited")]
    RateLimited,

    /// Response body was not a completion
    #[error("Malformed response: {0}")]
    Malformed(String),
}

/// Text-completion service.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Issue a single completion request
    async fn complete(&self, request: &CompletionRequest) -> std::result::Result<Completion, TransportError>;
}

/// Token usage tracking
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Accumulated token usage with atomic counters
#[derive(Default)]
struct AtomicTokenUsage {
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    total_tokens: AtomicU64,
}

impl AtomicTokenUsage {
    fn add(&self, usage: &TokenUsage) {
        self.prompt_tokens.fetch_add(usage.prompt_tokens, Ordering::Relaxed);
        self.completion_tokens.fetch_add(usage.completion_tokens, Ordering::Relaxed);
        self.total_tokens.fetch_add(usage.total_tokens, Ordering::Relaxed);
    }

    fn get(&self) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
        }
    }
}

/// OpenAI-compatible API response structures
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

/// Completion client for any OpenAI-compatible chat completions endpoint.
pub struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    /// Create a client from the endpoint configuration
    pub fn new(config: &LlmConfig) -> Result<Self> {
        config.validate()?;

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| StrategyError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> std::result::Result<Completion, TransportError> {
        let request_body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "user", "content": request.prompt}
            ],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens
        });

        let api_url = format!("{}/chat/completions", self.base_url);

        let mut req = self
            .client
            .post(&api_url)
            .header("Content-Type", "application/json");
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req.json(&request_body).send().await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(TransportError::RateLimited);
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(TransportError::Api {
                status: status.as_u16(),
                message: error_text,
            });
        }

        let api_response: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Malformed(e.to_string()))?;

        let usage = api_response
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        let text = api_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| TransportError::Malformed("response has no choices".to_string()))?;

        Ok(Completion { text, usage })
    }
}

/// Per-run completion policy around a [`CompletionClient`].
///
/// A failed or timed-out call is retried once after the configured backoff;
/// the second failure is returned to the caller. Every wait races the run's
/// cancellation token.
pub struct Completer {
    client: Arc<dyn CompletionClient>,
    max_tokens: u32,
    timeout: Duration,
    retry_backoff: Duration,
    cancel: CancellationToken,
    usage: AtomicTokenUsage,
}

impl Completer {
    pub fn new(client: Arc<dyn CompletionClient>, config: &LlmConfig, cancel: CancellationToken) -> Self {
        Self {
            client,
            max_tokens: config.max_tokens,
            timeout: config.request_timeout(),
            retry_backoff: config.retry_backoff(),
            cancel,
            usage: AtomicTokenUsage::default(),
        }
    }

    /// Complete `persona + context` through the question template.
    pub async fn complete(
        &self,
        stage: Stage,
        context: &str,
        persona: &str,
        temperature: f32,
    ) -> Result<String> {
        let request = CompletionRequest {
            prompt: build_question_prompt(persona, context),
            temperature,
            max_tokens: self.max_tokens,
        };

        match self.attempt(stage, &request).await {
            Err(e) if e.is_retryable() => {
                let jitter_ms = {
                    let max = (self.retry_backoff.as_millis() as u64) / 4;
                    rand::thread_rng().gen_range(0..=max)
                };
                let wait = self.retry_backoff + Duration::from_millis(jitter_ms);
                warn!(stage = %stage, error = %e, wait_ms = wait.as_millis() as u64, "Completion failed, retrying once");

                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        return Err(StrategyError::Cancelled { stage: stage.to_string() });
                    }
                    _ = tokio::time::sleep(wait) => {}
                }

                self.attempt(stage, &request).await
            }
            other => other,
        }
    }

    async fn attempt(&self, stage: Stage, request: &CompletionRequest) -> Result<String> {
        if self.cancel.is_cancelled() {
            return Err(StrategyError::Cancelled { stage: stage.to_string() });
        }

        debug!(stage = %stage, temperature = request.temperature, "Sending completion request");

        let call = tokio::time::timeout(self.timeout, self.client.complete(request));
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => {
                return Err(StrategyError::Cancelled { stage: stage.to_string() });
            }
            outcome = call => outcome,
        };

        match outcome {
            Ok(Ok(completion)) => {
                self.usage.add(&completion.usage);
                Ok(completion.text)
            }
            Ok(Err(e)) => Err(StrategyError::CompletionTransport {
                stage: stage.to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(StrategyError::Timeout {
                stage: stage.to_string(),
                secs: self.timeout.as_secs(),
            }),
        }
    }

    /// Token usage accumulated by this run so far
    pub fn usage(&self) -> TokenUsage {
        self.usage.get()
    }
}
