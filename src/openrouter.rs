//! OpenRouter API client for LLM interactions.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::LlmSettings;
use crate::schema::GroundingSource;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Failed to send request to OpenRouter: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("OpenRouter rate limit or quota exhausted ({status}): {body}")]
    QuotaExhausted { status: u16, body: String },
    #[error("OpenRouter API error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("OpenRouter returned no content")]
    EmptyResponse,
}

impl LlmError {
    /// Whether this error means the account hit a rate or usage limit.
    pub fn is_quota_exhausted(&self) -> bool {
        matches!(self, LlmError::QuotaExhausted { .. })
    }

    fn from_status(status: StatusCode, body: String) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS || body.to_lowercase().contains("quota") {
            LlmError::QuotaExhausted {
                status: status.as_u16(),
                body,
            }
        } else {
            LlmError::Api {
                status: status.as_u16(),
                body,
            }
        }
    }
}

/// Assistant reply with any URL citations the provider attached.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: String,
    pub sources: Vec<GroundingSource>,
}

/// The two model calls the service makes.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Free-form conversational completion.
    async fn complete(&self, messages: Vec<Message>) -> Result<Completion, LlmError>;

    /// Completion constrained to a JSON schema. Returns the raw text, which may
    /// still be wrapped in a fenced block.
    async fn complete_structured(
        &self,
        messages: Vec<Message>,
        schema_name: &str,
        schema: serde_json::Value,
    ) -> Result<String, LlmError>;
}

/// OpenRouter client for chat completions.
#[derive(Clone)]
pub struct OpenRouterClient {
    client: Client,
    api_url: String,
    api_key: String,
    chat_model: String,
    extraction_model: String,
}

impl OpenRouterClient {
    pub fn new(settings: &LlmSettings) -> Self {
        Self {
            client: Client::new(),
            api_url: settings.api_url.clone(),
            api_key: settings.api_key.clone(),
            chat_model: settings.chat_model.clone(),
            extraction_model: settings.extraction_model.clone(),
        }
    }

    async fn send_request(&self, request: ChatCompletionRequest) -> Result<Completion, LlmError> {
        debug!("Sending request to OpenRouter: model={}", request.model);

        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status, error_text));
        }

        let response: ChatCompletionResponse = response.json().await?;

        if let Some(usage) = &response.usage {
            info!(
                "OpenRouter response: {} tokens (prompt: {}, completion: {})",
                usage.total_tokens, usage.prompt_tokens, usage.completion_tokens
            );
        }

        let message = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or(LlmError::EmptyResponse)?;

        let sources = message
            .annotations
            .into_iter()
            .filter_map(|a| match a {
                Annotation::UrlCitation { url_citation } => Some(GroundingSource {
                    title: url_citation.title.unwrap_or_else(|| url_citation.url.clone()),
                    uri: url_citation.url,
                }),
                Annotation::Other => None,
            })
            .collect();

        Ok(Completion {
            content: message.content.unwrap_or_default(),
            sources,
        })
    }
}

#[async_trait]
impl LlmClient for OpenRouterClient {
    async fn complete(&self, messages: Vec<Message>) -> Result<Completion, LlmError> {
        let request = ChatCompletionRequest {
            model: self.chat_model.clone(),
            messages,
            max_tokens: Some(2048),
            response_format: None,
        };

        let completion = self.send_request(request).await?;
        if completion.content.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(completion)
    }

    async fn complete_structured(
        &self,
        messages: Vec<Message>,
        schema_name: &str,
        schema: serde_json::Value,
    ) -> Result<String, LlmError> {
        let request = ChatCompletionRequest {
            model: self.extraction_model.clone(),
            messages,
            max_tokens: Some(1024),
            response_format: Some(ResponseFormat::JsonSchema {
                json_schema: JsonSchemaFormat {
                    name: schema_name.to_string(),
                    schema,
                },
            }),
        };

        Ok(self.send_request(request).await?.content)
    }
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseFormat {
    JsonSchema { json_schema: JsonSchemaFormat },
}

#[derive(Debug, Serialize)]
struct JsonSchemaFormat {
    name: String,
    schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    annotations: Vec<Annotation>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Annotation {
    UrlCitation { url_citation: UrlCitation },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct UrlCitation {
    url: String,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

// ============================================================================
// Message types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let err = LlmError::from_status(StatusCode::TOO_MANY_REQUESTS, "slow down".to_string());
        assert!(err.is_quota_exhausted());

        let err = LlmError::from_status(
            StatusCode::PAYMENT_REQUIRED,
            "Monthly QUOTA exceeded".to_string(),
        );
        assert!(err.is_quota_exhausted());

        let err = LlmError::from_status(StatusCode::BAD_GATEWAY, "upstream down".to_string());
        assert!(!err.is_quota_exhausted());
    }

    #[test]
    fn test_structured_request_shape() {
        let request = ChatCompletionRequest {
            model: "m".to_string(),
            messages: vec![Message::user("oi")],
            max_tokens: None,
            response_format: Some(ResponseFormat::JsonSchema {
                json_schema: JsonSchemaFormat {
                    name: "lead".to_string(),
                    schema: serde_json::json!({"type": "object"}),
                },
            }),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["response_format"]["type"], "json_schema");
        assert_eq!(json["response_format"]["json_schema"]["name"], "lead");
        assert_eq!(json["messages"][0]["role"], "user");
        assert!(json.get("max_tokens").is_none());
    }

    #[test]
    fn test_response_with_citations() {
        let raw = r#"{
            "choices": [{"message": {"content": "Veja o site.", "annotations": [
                {"type": "url_citation", "url_citation": {"url": "https://onzy.com", "title": "Onzy"}},
                {"type": "file", "file": {}}
            ]}}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 2, "total_tokens": 3}
        }"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(raw).unwrap();
        let message = &parsed.choices[0].message;
        assert_eq!(message.content.as_deref(), Some("Veja o site."));
        assert_eq!(message.annotations.len(), 2);
        assert!(matches!(message.annotations[1], Annotation::Other));
    }
}
