// ABOUTME: OpenAI provider driver with streaming support
// ABOUTME: Carries the GPT model catalog with context windows and published per-1M rates
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Switchboard Contributors

//! # `OpenAI` Provider
//!
//! Implementation of the [`ModelProvider`] trait for the `OpenAI` chat
//! completions API.
//!
//! ## Configuration
//!
//! Set the `OPENAI_API_KEY` environment variable with your API key from
//! <https://platform.openai.com/api-keys>. `OPENAI_BASE_URL` overrides the
//! endpoint for proxies and gateways.
//!
//! ## Supported Models
//!
//! - `gpt-4o` (default): Flagship multimodal model
//! - `gpt-4o-mini`: Fast and inexpensive for simple tasks
//! - `gpt-4.1` / `gpt-4.1-mini`: Long-context successors
//! - `o3-mini`: Reasoning model for harder tasks

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use super::{
    catalog_effective_date, ChatMessage, ChatRequest, ChatResponse, ChatStream, ModelInfo,
    ModelProvider, ProviderCapabilities, StreamChunk, TokenUsage,
};
use crate::errors::{AppError, AppResult};
use crate::models::{BillingModel, PricingDescriptor, PricingSource, PricingUnit};

/// Environment variable for the OpenAI API key
const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Default model to use
const DEFAULT_MODEL: &str = "gpt-4o";

/// Base URL for the OpenAI API
const API_BASE_URL: &str = "https://api.openai.com/v1";

/// Model catalog: (id, context window, max output tokens, vision)
const MODEL_CATALOG: &[(&str, u32, u32, bool)] = &[
    ("gpt-4o", 128_000, 16_384, true),
    ("gpt-4o-mini", 128_000, 16_384, true),
    ("gpt-4.1", 1_047_576, 32_768, true),
    ("gpt-4.1-mini", 1_047_576, 32_768, true),
    ("o3-mini", 200_000, 100_000, false),
];

/// Published rates in USD per 1M tokens: (id, input, output)
const MODEL_PRICING: &[(&str, f64, f64)] = &[
    ("gpt-4o", 2.50, 10.00),
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4.1", 2.00, 8.00),
    ("gpt-4.1-mini", 0.40, 1.60),
    ("o3-mini", 1.10, 4.40),
];

// ============================================================================
// API Request/Response Types
// ============================================================================

/// OpenAI API request structure
#[derive(Debug, Serialize)]
struct OpenAiApiRequest {
    model: String,
    messages: Vec<OpenAiApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

/// Message structure for the OpenAI API
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAiApiMessage {
    role: String,
    content: String,
}

impl From<&ChatMessage> for OpenAiApiMessage {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            role: msg.role.as_str().to_owned(),
            content: msg.content.clone(),
        }
    }
}

/// OpenAI API response structure
#[derive(Debug, Deserialize)]
struct OpenAiApiResponse {
    choices: Vec<OpenAiApiChoice>,
    #[serde(default)]
    usage: Option<OpenAiApiUsage>,
    model: String,
}

/// Choice in response
#[derive(Debug, Deserialize)]
struct OpenAiApiChoice {
    message: OpenAiApiResponseMessage,
    finish_reason: Option<String>,
}

/// Message in response
#[derive(Debug, Deserialize)]
struct OpenAiApiResponseMessage {
    content: Option<String>,
}

/// Usage statistics in response
#[derive(Debug, Deserialize)]
struct OpenAiApiUsage {
    #[serde(rename = "prompt_tokens")]
    prompt: u32,
    #[serde(rename = "completion_tokens")]
    completion: u32,
}

/// Streaming chunk structure
#[derive(Debug, Deserialize)]
struct OpenAiApiStreamChunk {
    choices: Vec<OpenAiApiStreamChoice>,
}

/// Choice in streaming chunk
#[derive(Debug, Deserialize)]
struct OpenAiApiStreamChoice {
    delta: OpenAiApiDelta,
    finish_reason: Option<String>,
}

/// Delta content in streaming chunk
#[derive(Debug, Deserialize)]
struct OpenAiApiDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Error response structure
#[derive(Debug, Deserialize)]
struct OpenAiApiErrorResponse {
    error: OpenAiApiErrorDetail,
}

/// Error detail structure
#[derive(Debug, Deserialize)]
struct OpenAiApiErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
}

// ============================================================================
// Provider Implementation
// ============================================================================

/// `OpenAI` provider driver
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
    /// Create a new OpenAI driver with the given API key and optional
    /// endpoint override
    #[must_use]
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| API_BASE_URL.to_owned()),
        }
    }

    /// Create a driver from environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if `OPENAI_API_KEY` is not set.
    pub fn from_env() -> AppResult<Self> {
        let api_key = std::env::var(OPENAI_API_KEY_ENV).map_err(|_| {
            AppError::config(format!(
                "Missing {OPENAI_API_KEY_ENV} environment variable. Get your API key from https://platform.openai.com/api-keys"
            ))
        })?;

        Ok(Self::new(api_key, std::env::var("OPENAI_BASE_URL").ok()))
    }

    /// Build the API URL for a given endpoint
    fn api_url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), endpoint)
    }

    /// Convert internal messages to OpenAI format
    fn convert_messages(messages: &[ChatMessage]) -> Vec<OpenAiApiMessage> {
        messages.iter().map(OpenAiApiMessage::from).collect()
    }

    /// Parse error response from the OpenAI API
    fn parse_error_response(status: reqwest::StatusCode, body: &str) -> AppError {
        if let Ok(error_response) = serde_json::from_str::<OpenAiApiErrorResponse>(body) {
            let error_type = error_response
                .error
                .error_type
                .unwrap_or_else(|| "unknown".to_owned());

            match status.as_u16() {
                401 | 403 => AppError::provider_auth_failed("openai")
                    .with_details(serde_json::json!({ "message": error_response.error.message })),
                429 => AppError::provider_rate_limited("openai")
                    .with_details(serde_json::json!({ "message": error_response.error.message })),
                400 => AppError::invalid_input(format!(
                    "OpenAI API validation error: {}",
                    error_response.error.message
                )),
                404 => AppError::not_found(format!(
                    "OpenAI model or endpoint ({})",
                    error_response.error.message
                )),
                _ => AppError::provider_unavailable(
                    "openai",
                    format!("{} - {}", error_type, error_response.error.message),
                ),
            }
        } else {
            AppError::provider_unavailable(
                "openai",
                format!(
                    "API error ({}): {}",
                    status,
                    body.chars().take(200).collect::<String>()
                ),
            )
        }
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn display_name(&self) -> &'static str {
        "OpenAI (GPT)"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::full_featured()
    }

    fn default_model(&self) -> &str {
        DEFAULT_MODEL
    }

    fn models(&self) -> Vec<ModelInfo> {
        MODEL_CATALOG
            .iter()
            .map(|&(id, context_window, max_output, vision)| {
                let capabilities = if vision {
                    ProviderCapabilities::full_featured()
                } else {
                    ProviderCapabilities::STREAMING
                        | ProviderCapabilities::FUNCTION_CALLING
                        | ProviderCapabilities::JSON_MODE
                        | ProviderCapabilities::SYSTEM_MESSAGES
                };
                ModelInfo::new(id, context_window, max_output, capabilities)
            })
            .collect()
    }

    fn default_pricing(&self, model: &str) -> Option<PricingDescriptor> {
        MODEL_PRICING
            .iter()
            .find(|(id, _, _)| *id == model)
            .map(|&(id, input_rate, output_rate)| PricingDescriptor {
                provider: self.name().to_owned(),
                model: id.to_owned(),
                input_rate,
                output_rate,
                flat_rate: None,
                unit: PricingUnit::Per1mTokens,
                currency: "USD".to_owned(),
                billing_model: BillingModel::PayPerUse,
                effective_at: catalog_effective_date(),
                source: PricingSource::DriverDefault,
            })
    }

    #[instrument(skip(self, request), fields(model = %request.model.as_deref().unwrap_or(DEFAULT_MODEL)))]
    async fn send_message(&self, request: &ChatRequest) -> AppResult<ChatResponse> {
        let model = request.model.as_deref().unwrap_or(DEFAULT_MODEL);

        debug!("Sending chat completion request to OpenAI");

        let api_request = OpenAiApiRequest {
            model: model.to_owned(),
            messages: Self::convert_messages(&request.messages),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: Some(false),
        };

        let response = self
            .client
            .post(self.api_url("chat/completions"))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| {
                error!("Failed to send request to OpenAI API: {}", e);
                AppError::provider_unavailable("openai", format!("Failed to connect: {e}"))
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            error!("Failed to read OpenAI API response: {}", e);
            AppError::provider_unavailable("openai", format!("Failed to read response: {e}"))
        })?;

        if !status.is_success() {
            return Err(Self::parse_error_response(status, &body));
        }

        let api_response: OpenAiApiResponse = serde_json::from_str(&body).map_err(|e| {
            error!("Failed to parse OpenAI API response: {}", e);
            AppError::provider_unavailable("openai", format!("Failed to parse response: {e}"))
        })?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AppError::provider_unavailable("openai", "API returned no choices"))?;

        let content = choice.message.content.unwrap_or_default();

        debug!(
            "Received response from OpenAI: {} chars, finish_reason: {:?}",
            content.len(),
            choice.finish_reason
        );

        Ok(ChatResponse {
            content,
            model: api_response.model,
            usage: api_response
                .usage
                .map(|u| TokenUsage::new(u.prompt, u.completion)),
            finish_reason: choice.finish_reason,
        })
    }

    #[instrument(skip(self, request), fields(model = %request.model.as_deref().unwrap_or(DEFAULT_MODEL)))]
    async fn send_message_stream(&self, request: &ChatRequest) -> AppResult<ChatStream> {
        let model = request.model.as_deref().unwrap_or(DEFAULT_MODEL);

        debug!("Sending streaming chat completion request to OpenAI");

        let api_request = OpenAiApiRequest {
            model: model.to_owned(),
            messages: Self::convert_messages(&request.messages),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: Some(true),
        };

        let response = self
            .client
            .post(self.api_url("chat/completions"))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| {
                error!("Failed to send streaming request to OpenAI API: {}", e);
                AppError::provider_unavailable("openai", format!("Failed to connect: {e}"))
            })?;

        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::parse_error_response(status, &body));
        }

        let byte_stream = response.bytes_stream();

        let stream = byte_stream
            .map(move |chunk_result| {
                match chunk_result {
                    Ok(bytes) => {
                        let text = String::from_utf8_lossy(&bytes);

                        // Parse SSE format: "data: {...}\n\n"
                        let mut result_chunks = Vec::new();

                        for line in text.lines() {
                            let line = line.trim();

                            if line.is_empty() {
                                continue;
                            }

                            if line == "data: [DONE]" {
                                result_chunks.push(Ok(StreamChunk {
                                    delta: String::new(),
                                    is_final: true,
                                    finish_reason: Some("stop".to_owned()),
                                }));
                                continue;
                            }

                            if let Some(json_str) = line.strip_prefix("data: ") {
                                match serde_json::from_str::<OpenAiApiStreamChunk>(json_str) {
                                    Ok(chunk) => {
                                        if let Some(choice) = chunk.choices.into_iter().next() {
                                            let delta = choice.delta.content.unwrap_or_default();
                                            let is_final = choice.finish_reason.is_some();

                                            result_chunks.push(Ok(StreamChunk {
                                                delta,
                                                is_final,
                                                finish_reason: choice.finish_reason,
                                            }));
                                        }
                                    }
                                    Err(e) => {
                                        warn!("Failed to parse OpenAI stream chunk: {}", e);
                                    }
                                }
                            }
                        }

                        // Return the first chunk or an empty one
                        result_chunks.into_iter().next().unwrap_or_else(|| {
                            Ok(StreamChunk {
                                delta: String::new(),
                                is_final: false,
                                finish_reason: None,
                            })
                        })
                    }
                    Err(e) => {
                        error!("Error reading OpenAI stream: {}", e);
                        Err(AppError::provider_unavailable(
                            "openai",
                            format!("Stream read error: {e}"),
                        ))
                    }
                }
            })
            .filter(|result| {
                // Filter out empty deltas unless it's the final chunk
                futures_util::future::ready(
                    result
                        .as_ref()
                        .map_or(true, |chunk| !chunk.delta.is_empty() || chunk.is_final),
                )
            });

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self))]
    async fn validate_credentials(&self) -> AppResult<bool> {
        debug!("Validating OpenAI API credentials");

        let response = self
            .client
            .get(self.api_url("models"))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| {
                error!("OpenAI credential probe failed: {}", e);
                AppError::provider_unavailable("openai", format!("Credential probe failed: {e}"))
            })?;

        let status = response.status();
        match status.as_u16() {
            200..=299 => Ok(true),
            401 | 403 => {
                warn!("OpenAI rejected the configured API key");
                Ok(false)
            }
            _ => Err(AppError::provider_unavailable(
                "openai",
                format!("Credential probe returned status {status}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_covers_every_priced_model() {
        for (id, _, _) in MODEL_PRICING {
            assert!(
                MODEL_CATALOG.iter().any(|(m, _, _, _)| m == id),
                "priced model {id} missing from catalog"
            );
        }
    }

    #[test]
    fn default_pricing_uses_per_million_unit() {
        let provider = OpenAiProvider::new("test-key".to_owned(), None);
        let pricing = provider.default_pricing("gpt-4o").unwrap();
        assert_eq!(pricing.unit, PricingUnit::Per1mTokens);
        assert_eq!(pricing.source, PricingSource::DriverDefault);
        assert!((pricing.input_rate - 2.50).abs() < f64::EPSILON);
        assert!(provider.default_pricing("gpt-99").is_none());
    }

    #[test]
    fn base_url_override_is_honored() {
        let provider =
            OpenAiProvider::new("k".to_owned(), Some("https://proxy.example/v1/".to_owned()));
        assert_eq!(
            provider.api_url("chat/completions"),
            "https://proxy.example/v1/chat/completions"
        );
    }
}
