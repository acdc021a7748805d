//! LLM provider abstraction and the OpenRouter-backed implementation.
//!
//! The pipeline depends only on [`LlmClient`]; one client is constructed at
//! startup and shared by every generator. Structured modes request the
//! provider's JSON response format, but that contract is not schema
//! enforcing, so parsing stays tolerant downstream.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::pin::Pin;
use tracing::{debug, info};

const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const DEFAULT_MODEL: &str = "google/gemini-3-flash-preview";

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("api request failed: {0}")]
    ApiRequestFailed(String),
    #[error("rate limited")]
    RateLimited,
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

pub type TokenStream = Pin<Box<dyn futures::Stream<Item = Result<String, LlmError>> + Send>>;

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One-shot completion. `structured` requests the provider's JSON mode.
    async fn complete(&self, messages: Vec<Message>, structured: bool)
        -> Result<String, LlmError>;

    /// Streaming completion; yields content deltas in arrival order.
    async fn complete_stream(&self, messages: Vec<Message>) -> Result<TokenStream, LlmError>;
}

// ============================================================================
// Message types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
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

// ============================================================================
// OpenRouter client
// ============================================================================

#[derive(Clone)]
pub struct OpenRouterClient {
    client: Client,
    api_key: String,
    model: String,
}

impl OpenRouterClient {
    /// Create a new client, reading API key from OPENROUTER_API_KEY and the
    /// model override from STUDYKIT_MODEL.
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("OPENROUTER_API_KEY")
            .context("OPENROUTER_API_KEY environment variable not set")?;
        let model = env::var("STUDYKIT_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        Ok(Self {
            client: Client::new(),
            api_key,
            model,
        })
    }

    fn request(&self, messages: Vec<Message>, structured: bool, stream: bool) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages,
            max_tokens: Some(16384),
            response_format: structured.then_some(ResponseFormat::JsonObject),
            stream: stream.then_some(true),
        }
    }

    async fn send(&self, request: &ChatRequest) -> Result<reqwest::Response, LlmError> {
        debug!(
            "Sending request to OpenRouter: model={} stream={:?}",
            request.model, request.stream
        );

        let response = self
            .client
            .post(OPENROUTER_API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| LlmError::ApiRequestFailed(e.to_string()))?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::RateLimited);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::ApiRequestFailed(format!("HTTP {status}: {body}")));
        }

        Ok(response)
    }
}

#[async_trait]
impl LlmClient for OpenRouterClient {
    async fn complete(
        &self,
        messages: Vec<Message>,
        structured: bool,
    ) -> Result<String, LlmError> {
        let request = self.request(messages, structured, false);
        let response = self.send(&request).await?;

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        if let Some(usage) = &body.usage {
            info!(
                "OpenRouter response: {} tokens (prompt: {}, completion: {})",
                usage.total_tokens, usage.prompt_tokens, usage.completion_tokens
            );
        }

        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::InvalidResponse("empty choices".to_string()))
    }

    async fn complete_stream(&self, messages: Vec<Message>) -> Result<TokenStream, LlmError> {
        let request = self.request(messages, false, true);
        let response = self.send(&request).await?;

        let mut bytes = response.bytes_stream();
        // SSE lines can straddle network chunks; carry the remainder over.
        let token_stream = async_stream::stream! {
            let mut carry = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        yield Err(LlmError::ApiRequestFailed(e.to_string()));
                        return;
                    }
                };
                carry.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = carry.find('\n') {
                    let line = carry[..pos].trim_end_matches('\r').to_string();
                    carry.drain(..=pos);
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        return;
                    }
                    if let Ok(delta) = serde_json::from_str::<StreamChunk>(data) {
                        if let Some(content) = delta
                            .choices
                            .first()
                            .and_then(|c| c.delta.content.clone())
                        {
                            if !content.is_empty() {
                                yield Ok(content);
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(token_stream))
    }
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseFormat {
    JsonObject,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

// ============================================================================
// Test double
// ============================================================================

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Scripted client for generator tests: returns canned responses in
    /// order and records every request for assertions.
    #[derive(Default)]
    pub struct MockLlm {
        responses: Mutex<Vec<Result<String, String>>>,
        pub calls: Mutex<Vec<Vec<Message>>>,
        stream_error_after: Mutex<Option<usize>>,
    }

    impl MockLlm {
        pub fn with_responses(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(
                    responses.into_iter().map(|r| Ok(r.to_string())).collect(),
                ),
                ..Default::default()
            }
        }

        /// Make the streaming variant fail after yielding `n` fragments.
        pub fn fail_stream_after(self, n: usize) -> Self {
            *self.stream_error_after.lock().unwrap() = Some(n);
            self
        }

        pub fn last_call(&self) -> Vec<Message> {
            self.calls.lock().unwrap().last().cloned().unwrap_or_default()
        }

        fn next_response(&self) -> Result<String, LlmError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(LlmError::ApiRequestFailed("no scripted response".into()));
            }
            responses.remove(0).map_err(LlmError::ApiRequestFailed)
        }
    }

    #[async_trait]
    impl LlmClient for MockLlm {
        async fn complete(
            &self,
            messages: Vec<Message>,
            _structured: bool,
        ) -> Result<String, LlmError> {
            self.calls.lock().unwrap().push(messages);
            self.next_response()
        }

        async fn complete_stream(&self, messages: Vec<Message>) -> Result<TokenStream, LlmError> {
            self.calls.lock().unwrap().push(messages);
            let text = self.next_response()?;
            let fail_after = *self.stream_error_after.lock().unwrap();

            // Split the scripted response into word-sized fragments.
            let mut items: Vec<Result<String, LlmError>> = text
                .split_inclusive(' ')
                .map(|w| Ok(w.to_string()))
                .collect();
            if let Some(n) = fail_after {
                items.truncate(n);
                items.push(Err(LlmError::ApiRequestFailed("connection reset".into())));
            }
            Ok(Box::pin(futures::stream::iter(items)))
        }
    }
}
