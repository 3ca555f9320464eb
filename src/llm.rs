//! Generative model clients.
//!
//! [`ChatModel`] is the seam the generator talks to. Two backends:
//!
//! - **[`OpenAiChatModel`]**: any OpenAI-compatible `/chat/completions`
//!   endpoint (OpenRouter by default), authenticated with a bearer key read
//!   from the environment variable named in `[generation].api_key_env`.
//! - **[`OllamaChatModel`]**: a local Ollama instance via `/api/generate`.
//!
//! Each call is a single attempt. Transport failures, non-success statuses
//! and replies without content all surface as
//! [`QaError::GenerationService`]; retrying is the caller's decision.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::GenerationConfig;
use crate::error::{QaError, QaResult};

/// A model that turns one user prompt into a free-text reply.
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;
    async fn complete(&self, prompt: &str, temperature: f32) -> QaResult<String>;
}

/// Build the backend selected by `[generation].provider`.
pub fn create_chat_model(config: &GenerationConfig) -> QaResult<Arc<dyn ChatModel>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiChatModel::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaChatModel::new(config)?)),
        other => Err(QaError::GenerationService(format!(
            "unknown generation provider: {}",
            other
        ))),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

pub struct OpenAiChatModel {
    model: String,
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiChatModel {
    pub fn new(config: &GenerationConfig) -> QaResult<Self> {
        let api_key = config.api_key();
        if api_key.is_none() {
            tracing::warn!(
                env = %config.api_key_env,
                "no API key set for the generation endpoint; requests will be unauthenticated"
            );
        }
        Ok(Self {
            model: config.model.clone(),
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, temperature: f32) -> QaResult<String> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: Some(prompt.to_string()),
            }],
            temperature,
        };

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| QaError::GenerationService(format!("failed to contact {}: {}", self.endpoint, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QaError::GenerationService(format!(
                "chat completion returned {}: {}",
                status,
                body.chars().take(500).collect::<String>()
            )));
        }

        let payload: ChatCompletionResponse = response.json().await.map_err(|e| {
            QaError::GenerationService(format!("failed to parse chat completion response: {}", e))
        })?;
        let content = payload
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| QaError::GenerationService("chat completion had no content".to_string()))?;

        tracing::debug!(model = %self.model, chars = content.len(), "chat completion received");
        Ok(content)
    }
}

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

pub struct OllamaChatModel {
    model: String,
    url: String,
    client: reqwest::Client,
}

impl OllamaChatModel {
    pub fn new(config: &GenerationConfig) -> QaResult<Self> {
        Ok(Self {
            model: config.model.clone(),
            url: config.base_url.trim_end_matches('/').to_string(),
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl ChatModel for OllamaChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, temperature: f32) -> QaResult<String> {
        let request = OllamaGenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: OllamaOptions { temperature },
        };
        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&request)
            .send()
            .await
            .map_err(|e| QaError::GenerationService(format!("failed to contact Ollama: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(QaError::GenerationService(format!(
                "Ollama API error: {} - {}",
                status, body
            )));
        }

        let payload: OllamaGenerateResponse = response
            .json()
            .await
            .map_err(|e| QaError::GenerationService(format!("failed to parse Ollama response: {}", e)))?;
        Ok(payload.response)
    }
}

fn http_client(timeout_secs: u64) -> QaResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| QaError::GenerationService(e.to_string()))
}
