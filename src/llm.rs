//! LLM provider abstraction
//!
//! One chat-completion interface shared by every delegate that reaches out
//! to a model: automated participants, the model-backed speaker strategy,
//! the intent classifier's second pass, and the dispatch-rule rewriter.

mod anthropic;
mod error;
mod types;

pub use anthropic::{AnthropicModel, AnthropicService};
pub use error::{LlmError, LlmErrorKind};
pub use types::{ChatRequest, ChatRole, ChatTurn, ChatResponse, TokenUsage};

use async_trait::async_trait;
use std::sync::Arc;

/// Common interface for chat-completion providers.
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Make a completion request.
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError>;

    /// Get the model ID.
    fn model_id(&self) -> &str;
}

/// Provider configuration from the environment.
#[derive(Debug, Clone, Default)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub gateway: Option<String>,
    pub model: Option<String>,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            gateway: std::env::var("LLM_GATEWAY").ok(),
            model: std::env::var("COLLOQUY_MODEL").ok(),
        }
    }

    /// Build the configured service, wrapped in request logging. `None`
    /// when no API key is configured; callers fall back to their local
    /// non-model behavior.
    pub fn build(&self) -> Option<Arc<dyn LlmService>> {
        let api_key = self.api_key.clone()?;
        let model = self
            .model
            .as_deref()
            .and_then(AnthropicModel::from_id)
            .unwrap_or(AnthropicModel::Claude35Haiku);
        let service = AnthropicService::new(api_key, model, self.gateway.as_deref());
        Some(Arc::new(LoggingService::new(Arc::new(service))))
    }
}

/// Logging wrapper for LLM services.
pub struct LoggingService {
    inner: Arc<dyn LlmService>,
    model_id: String,
}

impl LoggingService {
    pub fn new(inner: Arc<dyn LlmService>) -> Self {
        let model_id = inner.model_id().to_string();
        Self { inner, model_id }
    }
}

#[async_trait]
impl LlmService for LoggingService {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let start = std::time::Instant::now();
        let result = self.inner.complete(request).await;
        let duration = start.elapsed();

        match &result {
            Ok(response) => {
                tracing::info!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    input_tokens = response.usage.input_tokens,
                    output_tokens = response.usage.output_tokens,
                    "LLM request completed"
                );
            }
            Err(e) => {
                tracing::error!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    error = %e.message,
                    retryable = e.kind.is_retryable(),
                    "LLM request failed"
                );
            }
        }

        result
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
