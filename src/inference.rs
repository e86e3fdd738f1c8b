//! Inference service seam
//!
//! The retry controller only sees [`InferenceClient`]: a request goes in,
//! free-form text comes out. [`ChatCompletionsClient`] is the HTTP adapter
//! for OpenAI-compatible endpoints (DeepSeek, Ollama's `/v1` API, vLLM).

use crate::config::InferenceConfig;
use crate::error::{CollabError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Role of one prompt message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

/// One inference request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub model: String,
    pub messages: Vec<PromptMessage>,
    pub temperature: f32,
}

/// Opaque inference call
///
/// Implementations must honor `timeout`; the retry controller also enforces
/// it from the outside.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn invoke(&self, request: &InferenceRequest, timeout: Duration) -> Result<String>;
}

/// OpenAI-compatible chat completions client
pub struct ChatCompletionsClient {
    config: InferenceConfig,
    client: Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [PromptMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ChatCompletionsClient {
    pub fn new(config: InferenceConfig) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            return Err(CollabError::Config("inference.endpoint not set".to_string()));
        }

        Ok(Self {
            config,
            client: Client::new(),
        })
    }
}

#[async_trait]
impl InferenceClient for ChatCompletionsClient {
    async fn invoke(&self, request: &InferenceRequest, timeout: Duration) -> Result<String> {
        debug!(
            "Calling inference endpoint: model {}, temperature {:.2}",
            request.model, request.temperature
        );

        let body = ChatRequest {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: self.config.max_tokens,
            stream: false,
        };

        let mut builder = self
            .client
            .post(&self.config.endpoint)
            .timeout(timeout)
            .header("content-type", "application/json")
            .json(&body);

        if let Some(key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| CollabError::TransportFailure(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(CollabError::TransportFailure(format!(
                "API request failed with status {}: {}",
                status, error_text
            )));
        }

        let api_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| CollabError::TransportFailure(format!("Invalid API response format: {}", e)))?;

        api_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| CollabError::TransportFailure("Empty response from API".to_string()))
    }
}
