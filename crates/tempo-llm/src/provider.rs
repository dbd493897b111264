//! The `LanguageModel` capability and its implementations.
//!
//! The rest of the crate only sees the trait; the OpenRouter provider talks
//! to the real endpoint and the mock provider drives every test.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from a language-model invocation or its output handling.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Connection-level failure (DNS, TLS, refused).
    #[error("http error: {0}")]
    Http(String),

    /// The endpoint returned a non-success status.
    #[error("api error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// The response body (or its embedded JSON) could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// Parsed output violated the call's contract (e.g. priority outside
    /// [0, 10]); the whole call is treated as failed and retried.
    #[error("invalid output: {0}")]
    Invalid(String),

    /// HTTP 429 from the endpoint.
    #[error("rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    /// The request hit the ambient deadline.
    #[error("request timed out")]
    Timeout,

    /// A store read the call depends on (settings, audit) failed.
    #[error("store error: {0}")]
    Store(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Http(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Role of a prompt message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

impl fmt::Display for PromptRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptRole::System => write!(f, "system"),
            PromptRole::User => write!(f, "user"),
            PromptRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// One message of a structured prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::User,
            content: content.into(),
        }
    }
}

/// A fully assembled completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub max_tokens: i64,
    pub messages: Vec<PromptMessage>,
}

/// The model's reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
}

// ---------------------------------------------------------------------------
// LanguageModel trait
// ---------------------------------------------------------------------------

/// Opaque completion capability consumed by the LLM client.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

// ---------------------------------------------------------------------------
// OpenRouterProvider
// ---------------------------------------------------------------------------

/// Provider for OpenRouter's OpenAI-compatible chat-completions endpoint.
pub struct OpenRouterProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenRouterProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            api_key: api_key.into(),
            base_url: "https://openrouter.ai/api/v1".to_string(),
        }
    }

    /// Override the base URL (tests, self-hosted gateways).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Build the JSON request body. Model ids configured with a legacy
    /// `openrouter/` routing prefix are sent without it.
    pub fn build_request_body(request: &CompletionRequest) -> serde_json::Value {
        let model = request
            .model
            .strip_prefix("openrouter/")
            .unwrap_or(&request.model);
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": m.role.to_string(),
                    "content": m.content,
                })
            })
            .collect();
        serde_json::json!({
            "model": model,
            "max_tokens": request.max_tokens,
            "messages": messages,
        })
    }
}

#[derive(Deserialize)]
struct ChatCompletionsResponse {
    choices: Vec<ChatChoice>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[async_trait]
impl LanguageModel for OpenRouterProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = Self::build_request_body(request);
        let url = format!("{}/chat/completions", self.base_url);

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(LlmError::RateLimited {
                retry_after_secs: retry_after,
            });
        }
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, message });
        }

        let parsed: ChatCompletionsResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;
        let choice = parsed
            .choices
            .first()
            .ok_or_else(|| LlmError::Parse("no choices in response".into()))?;

        Ok(CompletionResponse {
            content: choice.message.content.clone().unwrap_or_default(),
            model: parsed.model.unwrap_or_else(|| request.model.clone()),
        })
    }
}

// ---------------------------------------------------------------------------
// MockLanguageModel
// ---------------------------------------------------------------------------

/// Deterministic mock for tests: pops pre-queued results and captures every
/// request for assertions. An empty queue yields an empty JSON object.
#[derive(Clone, Default)]
pub struct MockLanguageModel {
    responses: Arc<Mutex<VecDeque<Result<CompletionResponse, LlmError>>>>,
    captured: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl MockLanguageModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful completion with the given content.
    pub fn with_content(self, content: impl Into<String>) -> Self {
        self.push_content(content);
        self
    }

    /// Queue an error result.
    pub fn with_error(self, error: LlmError) -> Self {
        self.responses.lock().unwrap().push_back(Err(error));
        self
    }

    /// Queue a successful completion (non-consuming form).
    pub fn push_content(&self, content: impl Into<String>) {
        self.responses.lock().unwrap().push_back(Ok(CompletionResponse {
            content: content.into(),
            model: "mock/mock-model".into(),
        }));
    }

    /// Queue an error result (non-consuming form).
    pub fn push_error(&self, error: LlmError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    /// Requests seen so far.
    pub fn captured_requests(&self) -> Vec<CompletionRequest> {
        self.captured.lock().unwrap().clone()
    }

    /// Number of completions served.
    pub fn call_count(&self) -> usize {
        self.captured.lock().unwrap().len()
    }
}

#[async_trait]
impl LanguageModel for MockLanguageModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.captured.lock().unwrap().push(request.clone());
        let mut queue = self.responses.lock().unwrap();
        match queue.pop_front() {
            Some(result) => result,
            None => Ok(CompletionResponse {
                content: "{}".into(),
                model: request.model.clone(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "deepseek/deepseek-v3.2-exp".into(),
            max_tokens: 2000,
            messages: vec![
                PromptMessage::system("You schedule tasks."),
                PromptMessage::user("Schedule this."),
            ],
        }
    }

    #[test]
    fn request_body_shape() {
        let body = OpenRouterProvider::build_request_body(&request());
        assert_eq!(body["model"], "deepseek/deepseek-v3.2-exp");
        assert_eq!(body["max_tokens"], 2000);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
    }

    #[test]
    fn request_body_strips_openrouter_prefix() {
        let mut req = request();
        req.model = "openrouter/deepseek/deepseek-v3.2-exp".into();
        let body = OpenRouterProvider::build_request_body(&req);
        assert_eq!(body["model"], "deepseek/deepseek-v3.2-exp");
    }

    #[tokio::test]
    async fn mock_pops_queued_results_in_order() {
        let mock = MockLanguageModel::new()
            .with_content("first")
            .with_error(LlmError::Timeout);
        let req = request();

        let ok = mock.complete(&req).await.unwrap();
        assert_eq!(ok.content, "first");
        assert!(matches!(
            mock.complete(&req).await.unwrap_err(),
            LlmError::Timeout
        ));
        // Queue drained: default reply.
        assert_eq!(mock.complete(&req).await.unwrap().content, "{}");
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn mock_captures_requests() {
        let mock = MockLanguageModel::new();
        mock.complete(&request()).await.unwrap();
        let captured = mock.captured_requests();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].messages[0].role, PromptRole::System);
    }

    #[tokio::test]
    async fn connection_refused_maps_to_http_error() {
        let provider =
            OpenRouterProvider::new("test-key").with_base_url("http://127.0.0.1:19999/api/v1");
        let err = provider.complete(&request()).await.unwrap_err();
        assert!(matches!(err, LlmError::Http(_) | LlmError::Timeout));
    }

    #[test]
    fn chat_completions_response_deserializes() {
        let json = r#"{
            "choices": [{"message": {"content": "{\"start_time\": \"2025-10-01T09:00:00\"}"}}],
            "model": "deepseek/deepseek-v3.2-exp"
        }"#;
        let parsed: ChatCompletionsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.choices.len(), 1);
        assert!(parsed.choices[0]
            .message
            .content
            .as_deref()
            .unwrap()
            .contains("start_time"));
    }
}
