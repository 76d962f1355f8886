//! OpenAI-compatible chat-completions client (OpenRouter by default).

use super::ModelClient;
use crate::config::ModelConfig;
use crate::conversation::PromptMessage;
use crate::error::{ModelError, Result};

use anyhow::Context as _;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [PromptMessage],
    max_tokens: u32,
    temperature: f32,
}

/// Chat-completions client for a single configured model.
pub struct OpenRouterClient {
    config: ModelConfig,
    http_client: reqwest::Client,
}

impl OpenRouterClient {
    pub fn new(config: ModelConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .with_context(|| "failed to build HTTP client")?;

        Ok(Self {
            config,
            http_client,
        })
    }
}

#[async_trait]
impl ModelClient for OpenRouterClient {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    fn is_configured(&self) -> bool {
        self.config.api_key.is_some()
    }

    async fn invoke(&self, messages: &[PromptMessage]) -> std::result::Result<String, ModelError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(ModelError::NotConfigured)?;

        let body = ChatCompletionRequest {
            model: &self.config.model,
            messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let mut request = self
            .http_client
            .post(&self.config.endpoint)
            .header("authorization", format!("Bearer {api_key}"))
            .header("content-type", "application/json")
            .header("x-title", &self.config.title)
            .json(&body);
        if let Some(referer) = &self.config.referer {
            request = request.header("http-referer", referer);
        }

        let response = request.send().await.map_err(transport_error)?;

        let status = response.status();
        let response_text = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(status_error(status, &response_text));
        }

        let response_body: serde_json::Value =
            serde_json::from_str(&response_text).map_err(|error| ModelError::Provider {
                status: status.as_u16(),
                body: format!(
                    "response is not valid JSON: {error}: {}",
                    truncate_body(&response_text)
                ),
            })?;

        let reply = parse_reply(&response_body)?;
        tracing::debug!(model = %self.config.model, reply_chars = reply.len(), "model replied");
        Ok(reply)
    }
}

fn transport_error(error: reqwest::Error) -> ModelError {
    if error.is_timeout() {
        ModelError::Timeout
    } else {
        ModelError::Connection(error.to_string())
    }
}

fn status_error(status: StatusCode, body: &str) -> ModelError {
    match status {
        StatusCode::UNAUTHORIZED => ModelError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => ModelError::RateLimited,
        _ => {
            let message = serde_json::from_str::<serde_json::Value>(body)
                .ok()
                .and_then(|value| value["error"]["message"].as_str().map(String::from))
                .unwrap_or_else(|| truncate_body(body).to_string());
            ModelError::Provider {
                status: status.as_u16(),
                body: message,
            }
        }
    }
}

fn parse_reply(body: &serde_json::Value) -> std::result::Result<String, ModelError> {
    body["choices"][0]["message"]["content"]
        .as_str()
        .map(str::trim)
        .filter(|content| !content.is_empty())
        .map(String::from)
        .ok_or(ModelError::EmptyResponse)
}

fn truncate_body(body: &str) -> &str {
    const LIMIT: usize = 500;
    match body.char_indices().nth(LIMIT) {
        Some((byte_index, _)) => &body[..byte_index],
        None => body,
    }
}
