//! LLM backend abstraction and trait definitions
//!
//! Every interchangeable backend the provider registry fails over between
//! implements [`LlmProvider`]. Backends are single-shot: retrying and
//! falling back across backends is the registry's job.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

/// Message roles in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Completion request sent to one backend
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub model: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    /// Concatenated text of every message, used for token estimation
    pub fn prompt_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Completion returned by a backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: Option<String>,
    pub model: String,
    /// `None` when the backend did not report usage
    pub usage: Option<TokenUsage>,
    pub finish_reason: FinishReason,
}

/// Token usage statistics as reported by a backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Reason why completion finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Error,
}

/// Approximate token count for `text`: one token per four bytes, rounded up.
///
/// This is an estimate used only when a backend does not report usage; it is
/// deterministic but not exact for any real tokenizer.
pub fn estimate_tokens(text: &str) -> u32 {
    text.len().div_ceil(4) as u32
}

/// Backend trait for dependency injection and testing
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Backend kind (e.g., "openai", "anthropic")
    fn name(&self) -> &str;

    /// Generate a completion from the given request
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Minimal low-cost call used by the periodic health probe
    async fn health_check(&self) -> Result<(), LlmError>;
}

/// Backend errors
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("Provider not configured: {0}")]
    NotConfigured(String),
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),
    #[error("Request failed: {0}")]
    RequestFailed(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("API error: {0}")]
    ApiError(String),
    #[error("Timed out after {0}ms")]
    Timeout(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }

    #[test]
    fn test_prompt_text_joins_messages() {
        let request = CompletionRequest {
            messages: vec![Message::system("sys"), Message::user("hello")],
            model: "m".to_string(),
            max_tokens: None,
            temperature: None,
        };

        assert_eq!(request.prompt_text(), "sys\nhello");
    }

    #[test]
    fn test_llm_error_display() {
        let errors = vec![
            LlmError::NotConfigured("test".to_string()),
            LlmError::AuthenticationFailed("test".to_string()),
            LlmError::RateLimitExceeded("test".to_string()),
            LlmError::RequestFailed("test".to_string()),
            LlmError::InvalidResponse("test".to_string()),
            LlmError::NetworkError("test".to_string()),
            LlmError::ApiError("test".to_string()),
            LlmError::Timeout(100),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_message_role_serialization() {
        assert_eq!(
            serde_json::to_string(&MessageRole::System).unwrap(),
            "\"system\""
        );
        assert_eq!(
            serde_json::to_string(&MessageRole::Assistant).unwrap(),
            "\"assistant\""
        );
    }
}
