use super::{ChatMessage, CompletionOptions};
use crate::error::ModelError;
use crate::traits::ChatModel;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai";
pub const DEFAULT_CHAT_MODEL: &str = "llama-3.1-8b-instant";

#[derive(Debug, Clone)]
pub struct ChatModelConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Default for ChatModelConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_CHAT_MODEL.to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Client for any `POST /v1/chat/completions` endpoint (Groq, OpenAI,
/// vLLM, llama.cpp server).
pub struct OpenAiCompatibleChat {
    client: Client,
    endpoint: Url,
    model: String,
    api_key: String,
    timeout: Duration,
}

impl OpenAiCompatibleChat {
    pub fn new(config: &ChatModelConfig) -> Result<Self, ModelError> {
        let api_key = config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| ModelError::NotConfigured("chat model api key is not set".to_string()))?
            .to_string();

        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            endpoint: completions_endpoint(&config.base_url)?,
            model: config.model.clone(),
            api_key,
            timeout: config.timeout,
        })
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatibleChat {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String, ModelError> {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": options.temperature,
        });
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        debug!(endpoint = %self.endpoint, model = %self.model, messages = messages.len(), "chat completion request");

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|error| self.transport_error(error))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|error| self.transport_error(error))?;
        parse_completion(&payload)
    }
}

impl OpenAiCompatibleChat {
    fn transport_error(&self, error: reqwest::Error) -> ModelError {
        if error.is_timeout() {
            ModelError::Timeout(self.timeout)
        } else {
            ModelError::Http(error)
        }
    }
}

fn completions_endpoint(base_url: &str) -> Result<Url, ModelError> {
    let base = if base_url.ends_with('/') {
        base_url.to_string()
    } else {
        format!("{base_url}/")
    };
    Ok(Url::parse(&base)?.join("v1/chat/completions")?)
}

fn classify_status(status: u16, body: String) -> ModelError {
    match status {
        429 => ModelError::RateLimited(body),
        401 | 403 => ModelError::Unauthorized(body),
        _ => ModelError::Api { status, body },
    }
}

fn parse_completion(payload: &Value) -> Result<String, ModelError> {
    let content = payload
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| ModelError::Parse("missing choices[0].message.content".to_string()))?;

    if content.trim().is_empty() {
        return Err(ModelError::EmptyResponse);
    }
    Ok(content.to_string())
}
