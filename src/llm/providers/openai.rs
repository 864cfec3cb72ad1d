//! OpenAI-compatible chat completions backend

use crate::llm::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmError, LlmProvider, Message,
    MessageRole, TokenUsage,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// OpenAI backend configuration
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// OpenAI backend
pub struct OpenAiProvider {
    config: OpenAiConfig,
    client: Client,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> Result<Self, LlmError> {
        if config.api_key.is_empty() {
            return Err(LlmError::NotConfigured(
                "OpenAI API key is required".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::NetworkError(e.to_string()))?;

        Ok(Self { config, client })
    }

    fn convert_message(message: &Message) -> OpenAiMessage {
        OpenAiMessage {
            role: match message.role {
                MessageRole::System => "system",
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
            }
            .to_string(),
            content: Some(message.content.clone()),
        }
    }

    fn convert_finish_reason(reason: Option<&str>) -> FinishReason {
        match reason {
            Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            _ => FinishReason::Error,
        }
    }

    fn parse_completion_response(
        response: OpenAiCompletionResponse,
    ) -> Result<CompletionResponse, LlmError> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("No choices returned".to_string()))?;

        Ok(CompletionResponse {
            content: choice.message.content,
            model: response.model,
            usage: response.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
            finish_reason: Self::convert_finish_reason(choice.finish_reason.as_deref()),
        })
    }

    fn map_status_error(status: StatusCode, body: String) -> LlmError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                LlmError::AuthenticationFailed(format!("OpenAI API error: {status} - {body}"))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                LlmError::RateLimitExceeded(format!("OpenAI API error: {status} - {body}"))
            }
            _ => LlmError::ApiError(format!("OpenAI API error: {status} - {body}")),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = OpenAiCompletionRequest {
            model: request.model.clone(),
            messages: request.messages.iter().map(Self::convert_message).collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        debug!(
            model = %body.model,
            messages = body.messages.len(),
            "Sending OpenAI completion request"
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, timeout = e.is_timeout(), "OpenAI request failed");
                LlmError::NetworkError(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Self::map_status_error(status, text));
        }

        let parsed: OpenAiCompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        Self::parse_completion_response(parsed)
    }

    async fn health_check(&self) -> Result<(), LlmError> {
        let response = self
            .client
            .get(format!("{}/models", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| LlmError::NetworkError(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            Err(Self::map_status_error(status, text))
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiCompletionRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiCompletionResponse {
    model: String,
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_requires_api_key() {
        let result = OpenAiProvider::new(OpenAiConfig::default());
        assert!(matches!(result, Err(LlmError::NotConfigured(_))));
    }

    #[test]
    fn test_finish_reason_conversion() {
        assert_eq!(
            OpenAiProvider::convert_finish_reason(Some("stop")),
            FinishReason::Stop
        );
        assert_eq!(
            OpenAiProvider::convert_finish_reason(Some("length")),
            FinishReason::Length
        );
        assert_eq!(
            OpenAiProvider::convert_finish_reason(None),
            FinishReason::Error
        );
    }

    #[test]
    fn test_parse_response_without_usage() {
        let raw = serde_json::json!({
            "model": "gpt-4o-mini",
            "choices": [{"message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}]
        });
        let parsed: OpenAiCompletionResponse = serde_json::from_value(raw).unwrap();
        let response = OpenAiProvider::parse_completion_response(parsed).unwrap();

        assert_eq!(response.content.as_deref(), Some("hi"));
        assert!(response.usage.is_none());
    }

    #[test]
    fn test_parse_response_without_choices_is_error() {
        let raw = serde_json::json!({"model": "gpt-4o-mini", "choices": []});
        let parsed: OpenAiCompletionResponse = serde_json::from_value(raw).unwrap();

        assert!(matches!(
            OpenAiProvider::parse_completion_response(parsed),
            Err(LlmError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            OpenAiProvider::map_status_error(StatusCode::UNAUTHORIZED, String::new()),
            LlmError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            OpenAiProvider::map_status_error(StatusCode::TOO_MANY_REQUESTS, String::new()),
            LlmError::RateLimitExceeded(_)
        ));
        assert!(matches!(
            OpenAiProvider::map_status_error(StatusCode::BAD_GATEWAY, String::new()),
            LlmError::ApiError(_)
        ));
    }
}
