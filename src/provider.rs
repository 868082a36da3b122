//! Generative Service Client
//!
//! HTTP client for the configured generative-text endpoint (OpenAI-compatible
//! chat completions). Exposes one raw-call surface consumed by the retrying
//! wrapper in `generate`; classification of failures into retryable classes
//! happens there, this module only reports what the wire said.

use crate::error::GenerateError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Chat message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
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

/// Token usage information
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One raw completion: text content plus usage accounting.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub usage: TokenUsage,
}

/// Completion request parameters
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    /// Ask the service for a JSON object response.
    pub structured: bool,
}

/// Generative service client contract
#[async_trait]
pub trait GenerativeClient: Send + Sync {
    /// Perform one request against the service. No retries at this layer.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, GenerateError>;
}

// Wire format of the chat-completions endpoint.
#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    /// Some gateways report failures inside a 200 envelope.
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// HTTP client for an OpenAI-compatible chat endpoint
pub struct HttpGenerativeClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
}

impl HttpGenerativeClient {
    pub fn new(
        endpoint: String,
        api_key: Option<String>,
        model: String,
        temperature: f32,
    ) -> Result<Self, GenerateError> {
        let client = Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .timeout(HTTP_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| GenerateError::Transport(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint,
            api_key,
            model,
            temperature,
        })
    }
}

#[async_trait]
impl GenerativeClient for HttpGenerativeClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, GenerateError> {
        let response_format = request
            .structured
            .then(|| serde_json::json!({"type": "json_object"}));
        let wire = WireRequest {
            model: &self.model,
            temperature: self.temperature,
            messages: &request.messages,
            response_format,
        };

        let url = format!("{}/chat/completions", self.endpoint.trim_end_matches('/'));
        let mut builder = self.client.post(&url).json(&wire);
        if let Some(api_key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| GenerateError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GenerateError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(GenerateError::Status {
                status: status.as_u16(),
                body,
            });
        }

        parse_completion(&body)
    }
}

/// Parse a 2xx envelope body into a completion.
///
/// An embedded `error` object or a missing content field count as failures
/// even inside a success status.
pub fn parse_completion(body: &str) -> Result<Completion, GenerateError> {
    let envelope: WireResponse =
        serde_json::from_str(body).map_err(|_| GenerateError::Envelope(body.to_string()))?;

    if let Some(error) = envelope.error {
        return Err(GenerateError::Envelope(error.to_string()));
    }

    let content = envelope
        .choices
        .first()
        .and_then(|c| c.message.content.clone())
        .ok_or(GenerateError::MissingContent)?;

    let usage = envelope
        .usage
        .map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        })
        .unwrap_or_default();

    Ok(Completion { content, usage })
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_completion_extracts_content_and_usage() {
        let body = r#"{
            "choices": [{"message": {"role": "assistant", "content": "hello"}}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 7, "total_tokens": 12}
        }"#;
        let completion = parse_completion(body).unwrap();
        assert_eq!(completion.content, "hello");
        assert_eq!(completion.usage.total_tokens, 12);
    }

    #[test]
    fn embedded_error_in_success_envelope_is_a_failure() {
        let body = r#"{"error": {"message": "overloaded", "type": "server_error"}}"#;
        match parse_completion(body) {
            Err(GenerateError::Envelope(raw)) => assert!(raw.contains("overloaded")),
            other => panic!("expected envelope error, got {:?}", other.map(|c| c.content)),
        }
    }

    #[test]
    fn missing_content_field_is_a_failure() {
        let body = r#"{"choices": [{"message": {"role": "assistant"}}]}"#;
        assert!(matches!(
            parse_completion(body),
            Err(GenerateError::MissingContent)
        ));
    }

    #[test]
    fn unparseable_envelope_preserves_raw_body() {
        let body = "<html>bad gateway</html>";
        match parse_completion(body) {
            Err(GenerateError::Envelope(raw)) => assert_eq!(raw, body),
            other => panic!("expected envelope error, got {:?}", other.map(|c| c.content)),
        }
    }
}
