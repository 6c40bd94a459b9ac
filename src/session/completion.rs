// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Completion service seam and an OpenAI-compatible client.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::config::CompletionConfig;
use crate::error::ServiceError;
use crate::types::Message;

/// Maximum retry attempts for transient errors.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (milliseconds).
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Maximum delay for exponential backoff (milliseconds).
const RETRY_MAX_DELAY_MS: u64 = 10000;

/// Produces the assistant's reply to `prompt` given the prior turns.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, history: &[Message], prompt: &str) -> Result<String, ServiceError>;
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
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

/// Client for any `/chat/completions` endpoint speaking the OpenAI format.
#[derive(Debug, Clone)]
pub struct ChatCompletionsClient {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
    timeout: Duration,
}

impl ChatCompletionsClient {
    /// Build a client from config. The API key is read from the environment
    /// variable named by `api_key_env`; a missing key is allowed for local
    /// endpoints.
    pub fn from_config(config: &CompletionConfig) -> Result<Self, ServiceError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::new(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty()),
            client,
            timeout,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn request_body(&self, history: &[Message], prompt: &str) -> serde_json::Value {
        let mut messages: Vec<WireMessage<'_>> = history
            .iter()
            .map(|m| WireMessage {
                role: m.role.as_str(),
                content: &m.content,
            })
            .collect();
        messages.push(WireMessage {
            role: "user",
            content: prompt,
        });

        serde_json::json!({
            "model": self.model,
            "messages": messages,
        })
    }
}

#[async_trait]
impl CompletionService for ChatCompletionsClient {
    async fn complete(&self, history: &[Message], prompt: &str) -> Result<String, ServiceError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(history, prompt);
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                // Exponential backoff: 1000ms, 2000ms, ... capped at 10s
                let delay = std::cmp::min(RETRY_BASE_DELAY_MS * (1 << attempt), RETRY_MAX_DELAY_MS);
                tracing::debug!("Retry attempt {} after {}ms delay", attempt + 1, delay);
                sleep(Duration::from_millis(delay)).await;
            }

            let mut request = self
                .client
                .post(&url)
                .header("Content-Type", "application/json")
                .timeout(self.timeout);
            if let Some(ref api_key) = self.api_key {
                request = request.header("Authorization", format!("Bearer {}", api_key));
            }

            let response = match request.json(&body).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    let message = if e.is_timeout() {
                        "Request timed out.".to_string()
                    } else if e.is_connect() {
                        format!("Failed to connect to {}: {}", self.base_url, e)
                    } else {
                        format!("Network error: {}", e)
                    };
                    last_error = Some(ServiceError::new(message));
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let error_text = response.text().await.unwrap_or_default();
                let code = status.as_u16();

                if code == 429 || (500..600).contains(&code) {
                    last_error = Some(ServiceError::new(format!(
                        "HTTP {} - {}",
                        status, error_text
                    )));
                    continue;
                }
                if code == 401 || code == 403 {
                    return Err(ServiceError::new(
                        "Completion endpoint rejected the API key.",
                    ));
                }
                return Err(ServiceError::new(format!("HTTP {} - {}", status, error_text)));
            }

            let parsed: ChatCompletionResponse = response
                .json()
                .await
                .map_err(|e| ServiceError::new(format!("Failed to parse chat response: {}", e)))?;

            return parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| ServiceError::new("Completion response had no content."));
        }

        Err(last_error.unwrap_or_else(|| ServiceError::new("Completion failed after retries.")))
    }
}
