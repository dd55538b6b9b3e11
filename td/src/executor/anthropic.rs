//! The one concrete provider client: Anthropic's Messages API over
//! `reqwest`, carried over from the source project's `AnthropicClient`
//! and adapted to the Executor contract.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::ExecutorError;

use super::{Executor, ExecutorRequest, ExecutorResult, StatusHint, TokenUsage};

pub struct AnthropicExecutor {
    model: String,
    api_key: String,
    base_url: String,
    http: Client,
    max_tokens: u32,
}

impl AnthropicExecutor {
    /// Gate 1 of the Double Execution Gate: construction fails if the
    /// configured API key environment variable is unset. This is
    /// non-skippable — there is no lazy/deferred variant.
    pub fn from_config(config: &LlmConfig) -> Result<Self, ExecutorError> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| ExecutorError::MissingApiKey(config.api_key_env.clone()))?;

        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ExecutorError::Network(e.to_string()))?;

        Ok(Self {
            model: config.model.clone(),
            api_key,
            base_url: config.base_url.clone(),
            http,
            max_tokens: config.max_tokens,
        })
    }

    fn build_request_body(&self, prompt: &str) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [{ "role": "user", "content": prompt }],
        })
    }
}

#[async_trait]
impl Executor for AnthropicExecutor {
    async fn execute(&self, request: ExecutorRequest) -> Result<ExecutorResult, ExecutorError> {
        debug!(task_id = %request.task_id, run_id = %request.run_id, "AnthropicExecutor::execute: called");
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_request_body(&request.prompt);

        let send = self
            .http
            .post(&url)
            .header("x-api-key", self.api_key.clone())
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send();

        let response = tokio::select! {
            biased;
            _ = request.cancel.cancelled() => return Err(ExecutorError::Cancelled),
            result = tokio::time::timeout(Duration::from_millis(request.max_duration_ms), send) => {
                result.map_err(|_| ExecutorError::Timeout(request.max_duration_ms))?
                    .map_err(|e| ExecutorError::Network(e.to_string()))?
            }
        };

        if response.status().as_u16() == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(ExecutorError::RateLimited { retry_after_secs });
        }

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            warn!(status, %message, "AnthropicExecutor::execute: non-success response");
            return Err(ExecutorError::ApiError { status, message });
        }

        let api_response: AnthropicResponse = response.json().await.map_err(|e| ExecutorError::InvalidResponse(e.to_string()))?;

        let output = api_response
            .content
            .into_iter()
            .filter_map(|block| match block {
                AnthropicContentBlock::Text { text } => Some(text),
            })
            .collect::<Vec<_>>()
            .join("");

        let status_hint = if output.is_empty() { StatusHint::AwaitingResponse } else { StatusHint::Complete };

        Ok(ExecutorResult {
            output,
            status_hint,
            files_modified: Vec::new(),
            structured_error: None,
            gates: Vec::new(),
            duration_ms: 0,
            token_usage: Some(TokenUsage {
                input_tokens: api_response.usage.input_tokens,
                output_tokens: api_response.usage.output_tokens,
            }),
        })
    }

    fn name(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}
