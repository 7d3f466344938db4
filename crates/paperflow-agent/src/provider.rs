use async_trait::async_trait;
use paperflow_core::{AgentError, ProviderId, TokenUsage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Speaker of a prompt message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    User,
    Assistant,
}

impl PromptRole {
    /// Role name on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptRole::User => "user",
            PromptRole::Assistant => "assistant",
        }
    }
}

/// One turn of a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    /// Who is speaking.
    pub role: PromptRole,
    /// Message text.
    pub content: String,
}

impl PromptMessage {
    /// A user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::User,
            content: content.into(),
        }
    }

    /// An assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::Assistant,
            content: content.into(),
        }
    }
}

/// A completion request to an AI provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// Model name as the provider knows it.
    pub model: String,
    /// System prompt, if any.
    pub system: Option<String>,
    /// Conversation turns, oldest first.
    pub messages: Vec<PromptMessage>,
    /// Upper bound on completion tokens.
    pub max_output_tokens: u32,
}

impl ProviderRequest {
    /// A request capped at 1024 output tokens and no system prompt.
    pub fn new(model: impl Into<String>, messages: Vec<PromptMessage>) -> Self {
        Self {
            model: model.into(),
            system: None,
            messages,
            max_output_tokens: 1024,
        }
    }

    /// Set the system prompt.
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Set the completion token cap.
    pub fn with_max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = max;
        self
    }
}

/// A completion and the tokens it cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Completion text.
    pub output: String,
    /// Tokens the provider reported.
    pub usage: TokenUsage,
    /// Model that actually answered.
    pub model: String,
}

/// Failure of a provider call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("provider rate limited the request: {0}")]
    RateLimited(String),
    #[error("provider unavailable ({status}): {body}")]
    Unavailable { status: u16, body: String },
    #[error("provider call timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("provider rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Classify an unsuccessful HTTP status.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            429 => ProviderError::RateLimited(body),
            408 | 500..=599 => ProviderError::Unavailable { status, body },
            _ => ProviderError::Rejected { status, body },
        }
    }

    /// Rate limits, timeouts, 5xx and connection failures are transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited(_)
                | ProviderError::Unavailable { .. }
                | ProviderError::Timeout
                | ProviderError::Network(_)
        )
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if err.is_decode() {
            ProviderError::Malformed(err.to_string())
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

impl From<ProviderError> for AgentError {
    fn from(err: ProviderError) -> Self {
        if err.is_transient() {
            AgentError::transient(err.to_string())
        } else {
            AgentError::permanent(err.to_string())
        }
    }
}

/// Boundary to an external AI completion service.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Provider id used for rate limiting and pricing.
    fn provider(&self) -> &ProviderId;

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError>;
}
