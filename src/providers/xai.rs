// ABOUTME: xAI provider driver with streaming support
// ABOUTME: Uses the OpenAI-compatible wire format against the Grok API
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Switchboard Contributors

//! # xAI Provider
//!
//! Implementation of the [`ModelProvider`] trait for xAI's Grok API, which
//! speaks the `OpenAI` chat completions wire format.
//!
//! ## Configuration
//!
//! Set the `XAI_API_KEY` environment variable with your API key from
//! <https://console.x.ai>. `XAI_BASE_URL` overrides the endpoint.
//!
//! ## Supported Models
//!
//! - `grok-3` (default): Flagship general purpose model
//! - `grok-3-fast`: Same quality, lower latency, higher rates
//! - `grok-3-mini`: Lightweight reasoning model

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

/// Environment variable for the xAI API key
const XAI_API_KEY_ENV: &str = "XAI_API_KEY";

/// Default model to use
const DEFAULT_MODEL: &str = "grok-3";

/// Base URL for the xAI API
const API_BASE_URL: &str = "https://api.x.ai/v1";

/// Model catalog: (id, context window, max output tokens)
const MODEL_CATALOG: &[(&str, u32, u32)] = &[
    ("grok-3", 131_072, 16_384),
    ("grok-3-fast", 131_072, 16_384),
    ("grok-3-mini", 131_072, 16_384),
];

/// Published rates in USD per 1M tokens: (id, input, output)
const MODEL_PRICING: &[(&str, f64, f64)] = &[
    ("grok-3", 3.00, 15.00),
    ("grok-3-fast", 5.00, 25.00),
    ("grok-3-mini", 0.30, 0.50),
];

// ============================================================================
// API Request/Response Types (OpenAI-compatible format)
// ============================================================================

/// xAI API request structure
#[derive(Debug, Serialize)]
struct XaiRequest {
    model: String,
    messages: Vec<XaiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

/// Message structure for the xAI API
#[derive(Debug, Clone, Serialize, Deserialize)]
struct XaiMessage {
    role: String,
    content: String,
}

impl From<&ChatMessage> for XaiMessage {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            role: msg.role.as_str().to_owned(),
            content: msg.content.clone(),
        }
    }
}

/// xAI API response structure
#[derive(Debug, Deserialize)]
struct XaiResponse {
    choices: Vec<XaiChoice>,
    #[serde(default)]
    usage: Option<XaiUsage>,
    model: String,
}

/// Choice in xAI response
#[derive(Debug, Deserialize)]
struct XaiChoice {
    message: XaiResponseMessage,
    finish_reason: Option<String>,
}

/// Message in xAI response
#[derive(Debug, Deserialize)]
struct XaiResponseMessage {
    content: Option<String>,
}

/// Usage statistics in xAI response
#[derive(Debug, Deserialize)]
struct XaiUsage {
    #[serde(rename = "prompt_tokens")]
    prompt: u32,
    #[serde(rename = "completion_tokens")]
    completion: u32,
}

/// Streaming chunk structure
#[derive(Debug, Deserialize)]
struct XaiStreamChunk {
    choices: Vec<XaiStreamChoice>,
}

/// Choice in streaming chunk
#[derive(Debug, Deserialize)]
struct XaiStreamChoice {
    delta: XaiDelta,
    finish_reason: Option<String>,
}

/// Delta content in streaming chunk
#[derive(Debug, Deserialize)]
struct XaiDelta {
    #[serde(default)]
    content: Option<String>,
}

/// xAI API error response
#[derive(Debug, Deserialize)]
struct XaiErrorResponse {
    error: XaiErrorDetail,
}

/// Error detail structure
#[derive(Debug, Deserialize)]
struct XaiErrorDetail {
    message: String,
}

// ============================================================================
// Provider Implementation
// ============================================================================

/// xAI Grok provider driver
pub struct XaiProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl XaiProvider {
    /// Create a new xAI driver with the given API key and optional endpoint
    /// override
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
    /// Returns an error if `XAI_API_KEY` is not set.
    pub fn from_env() -> AppResult<Self> {
        let api_key = std::env::var(XAI_API_KEY_ENV).map_err(|_| {
            AppError::config(format!(
                "Missing {XAI_API_KEY_ENV} environment variable. Get your API key from https://console.x.ai"
            ))
        })?;

        Ok(Self::new(api_key, std::env::var("XAI_BASE_URL").ok()))
    }

    /// Build the API URL for a given endpoint
    fn api_url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), endpoint)
    }

    /// Convert internal messages to xAI format
    fn convert_messages(messages: &[ChatMessage]) -> Vec<XaiMessage> {
        messages.iter().map(XaiMessage::from).collect()
    }

    /// Parse error response from the xAI API
    fn parse_error_response(status: reqwest::StatusCode, body: &str) -> AppError {
        let message = serde_json::from_str::<XaiErrorResponse>(body)
            .map_or_else(|_| body.chars().take(200).collect::<String>(), |e| e.error.message);

        match status.as_u16() {
            401 | 403 => AppError::provider_auth_failed("xai")
                .with_details(serde_json::json!({ "message": message })),
            429 => AppError::provider_rate_limited("xai")
                .with_details(serde_json::json!({ "message": message })),
            400 => AppError::invalid_input(format!("xAI API validation error: {message}")),
            404 => AppError::not_found(format!("xAI model or endpoint ({message})")),
            _ => AppError::provider_unavailable("xai", format!("API error ({status}): {message}")),
        }
    }
}

#[async_trait]
impl ModelProvider for XaiProvider {
    fn name(&self) -> &'static str {
        "xai"
    }

    fn display_name(&self) -> &'static str {
        "xAI (Grok)"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::STREAMING
            | ProviderCapabilities::FUNCTION_CALLING
            | ProviderCapabilities::JSON_MODE
            | ProviderCapabilities::SYSTEM_MESSAGES
    }

    fn default_model(&self) -> &str {
        DEFAULT_MODEL
    }

    fn models(&self) -> Vec<ModelInfo> {
        MODEL_CATALOG
            .iter()
            .map(|&(id, context_window, max_output)| {
                ModelInfo::new(id, context_window, max_output, self.capabilities())
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

        debug!("Sending chat completion request to xAI");

        let xai_request = XaiRequest {
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
            .json(&xai_request)
            .send()
            .await
            .map_err(|e| {
                error!("Failed to send request to xAI API: {}", e);
                AppError::provider_unavailable("xai", format!("Failed to connect: {e}"))
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            error!("Failed to read xAI API response: {}", e);
            AppError::provider_unavailable("xai", format!("Failed to read response: {e}"))
        })?;

        if !status.is_success() {
            return Err(Self::parse_error_response(status, &body));
        }

        let xai_response: XaiResponse = serde_json::from_str(&body).map_err(|e| {
            error!("Failed to parse xAI API response: {}", e);
            AppError::provider_unavailable("xai", format!("Failed to parse response: {e}"))
        })?;

        let choice = xai_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AppError::provider_unavailable("xai", "API returned no choices"))?;

        let content = choice.message.content.unwrap_or_default();

        debug!(
            "Received response from xAI: {} chars, finish_reason: {:?}",
            content.len(),
            choice.finish_reason
        );

        Ok(ChatResponse {
            content,
            model: xai_response.model,
            usage: xai_response
                .usage
                .map(|u| TokenUsage::new(u.prompt, u.completion)),
            finish_reason: choice.finish_reason,
        })
    }

    #[instrument(skip(self, request), fields(model = %request.model.as_deref().unwrap_or(DEFAULT_MODEL)))]
    async fn send_message_stream(&self, request: &ChatRequest) -> AppResult<ChatStream> {
        let model = request.model.as_deref().unwrap_or(DEFAULT_MODEL);

        debug!("Sending streaming chat completion request to xAI");

        let xai_request = XaiRequest {
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
            .json(&xai_request)
            .send()
            .await
            .map_err(|e| {
                error!("Failed to send streaming request to xAI API: {}", e);
                AppError::provider_unavailable("xai", format!("Failed to connect: {e}"))
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
                                match serde_json::from_str::<XaiStreamChunk>(json_str) {
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
                                        warn!("Failed to parse xAI stream chunk: {}", e);
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
                        error!("Error reading xAI stream: {}", e);
                        Err(AppError::provider_unavailable(
                            "xai",
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
        debug!("Validating xAI API credentials");

        let response = self
            .client
            .get(self.api_url("models"))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| {
                error!("xAI credential probe failed: {}", e);
                AppError::provider_unavailable("xai", format!("Credential probe failed: {e}"))
            })?;

        let status = response.status();
        match status.as_u16() {
            200..=299 => Ok(true),
            401 | 403 => {
                warn!("xAI rejected the configured API key");
                Ok(false)
            }
            _ => Err(AppError::provider_unavailable(
                "xai",
                format!("Credential probe returned status {status}"),
            )),
        }
    }
}
