// ABOUTME: Google Gemini provider driver using the native generateContent wire format
// ABOUTME: Handles system instructions, SSE streaming, and usage metadata extraction
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Switchboard Contributors

//! # Gemini Provider
//!
//! Implementation of the [`ModelProvider`] trait for the Google Gemini API.
//! Unlike the `OpenAI`-wire drivers, Gemini uses its own request shape:
//! messages become `contents` with `user`/`model` roles and the system prompt
//! moves to a dedicated `system_instruction` field.
//!
//! ## Configuration
//!
//! Set the `GEMINI_API_KEY` environment variable with your API key from
//! Google AI Studio. `GEMINI_BASE_URL` overrides the endpoint.

use std::env;
use std::fmt::{Debug, Formatter, Result as FmtResult};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use super::{
    catalog_effective_date, ChatMessage, ChatRequest, ChatResponse, ChatStream, MessageRole,
    ModelInfo, ModelProvider, ProviderCapabilities, StreamChunk, TokenUsage,
};
use crate::errors::{AppError, AppResult};
use crate::models::{BillingModel, PricingDescriptor, PricingSource, PricingUnit};

/// Environment variable for the Gemini API key
const GEMINI_API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Default model to use
const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Base URL for the Gemini API
const API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Model catalog: (id, context window, max output tokens)
const MODEL_CATALOG: &[(&str, u32, u32)] = &[
    ("gemini-2.5-flash", 1_048_576, 65_536),
    ("gemini-2.5-pro", 1_048_576, 65_536),
    ("gemini-2.0-flash", 1_048_576, 8_192),
    ("gemini-1.5-flash", 1_048_576, 8_192),
];

/// Published rates in USD per 1M tokens: (id, input, output)
const MODEL_PRICING: &[(&str, f64, f64)] = &[
    ("gemini-2.5-flash", 0.30, 2.50),
    ("gemini-2.5-pro", 1.25, 10.00),
    ("gemini-2.0-flash", 0.10, 0.40),
    ("gemini-1.5-flash", 0.075, 0.30),
];

// ============================================================================
// API Request/Response Types
// ============================================================================

/// Gemini API request structure
#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

/// Content structure for the Gemini API
#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<ContentPart>,
}

/// Text part of a content entry
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContentPart {
    text: String,
}

/// Generation configuration
#[derive(Debug, Serialize)]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    candidate_count: Option<u32>,
}

/// Gemini API response structure
#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<Candidate>>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
    error: Option<GeminiError>,
}

/// Response candidate
#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

/// Usage metadata from the Gemini API response
#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount")]
    prompt: Option<u32>,
    #[serde(rename = "candidatesTokenCount")]
    candidates: Option<u32>,
}

/// API error response from Gemini
#[derive(Debug, Deserialize)]
struct GeminiError {
    message: String,
}

/// Streaming response chunk
#[derive(Debug, Deserialize)]
struct StreamingResponse {
    candidates: Option<Vec<Candidate>>,
}

// ============================================================================
// Provider Implementation
// ============================================================================

/// Google Gemini provider driver
pub struct GeminiProvider {
    api_key: String,
    client: Client,
    base_url: String,
}

impl GeminiProvider {
    /// Create a new Gemini driver with the given API key and optional
    /// endpoint override
    #[must_use]
    pub fn new(api_key: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            api_key: api_key.into(),
            client: Client::new(),
            base_url: base_url.unwrap_or_else(|| API_BASE_URL.to_owned()),
        }
    }

    /// Create a driver from the `GEMINI_API_KEY` environment variable
    ///
    /// # Errors
    ///
    /// Returns an error if the environment variable is not set.
    pub fn from_env() -> AppResult<Self> {
        let api_key = env::var(GEMINI_API_KEY_ENV).map_err(|_| {
            AppError::config(format!("{GEMINI_API_KEY_ENV} environment variable not set"))
        })?;
        Ok(Self::new(api_key, env::var("GEMINI_BASE_URL").ok()))
    }

    /// Convert our message role to Gemini's role format
    ///
    /// System messages are handled separately via `system_instruction`, but
    /// if one appears here, map it to "user" for compatibility.
    const fn convert_role(role: MessageRole) -> &'static str {
        match role {
            MessageRole::System | MessageRole::User => "user",
            MessageRole::Assistant => "model",
        }
    }

    /// Build the API URL for a model and method
    fn build_url(&self, model: &str, method: &str) -> String {
        format!(
            "{}/models/{model}:{method}?key={}",
            self.base_url.trim_end_matches('/'),
            self.api_key
        )
    }

    /// Convert chat messages to Gemini format
    fn convert_messages(messages: &[ChatMessage]) -> (Vec<GeminiContent>, Option<GeminiContent>) {
        let mut contents = Vec::new();
        let mut system_instruction = None;

        for message in messages {
            if message.role == MessageRole::System {
                // Gemini uses a separate system_instruction field
                system_instruction = Some(GeminiContent {
                    role: None,
                    parts: vec![ContentPart {
                        text: message.content.clone(),
                    }],
                });
            } else {
                contents.push(GeminiContent {
                    role: Some(Self::convert_role(message.role).to_owned()),
                    parts: vec![ContentPart {
                        text: message.content.clone(),
                    }],
                });
            }
        }

        (contents, system_instruction)
    }

    /// Build a Gemini API request from a `ChatRequest`
    fn build_gemini_request(request: &ChatRequest) -> GeminiRequest {
        let (contents, system_instruction) = Self::convert_messages(&request.messages);

        let generation_config = if request.temperature.is_some() || request.max_tokens.is_some() {
            Some(GenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
                candidate_count: Some(1),
            })
        } else {
            None
        };

        GeminiRequest {
            contents,
            system_instruction,
            generation_config,
        }
    }

    /// Extract text content from a Gemini response
    fn extract_content(response: &GeminiResponse) -> AppResult<String> {
        response
            .candidates
            .as_ref()
            .and_then(|c| c.first())
            .and_then(|c| c.content.as_ref())
            .and_then(|c| c.parts.first())
            .map(|p| p.text.clone())
            .ok_or_else(|| AppError::provider_unavailable("gemini", "No content in response"))
    }

    /// Convert usage metadata to our token usage format
    fn convert_usage(metadata: &UsageMetadata) -> TokenUsage {
        TokenUsage::new(
            metadata.prompt.unwrap_or(0),
            metadata.candidates.unwrap_or(0),
        )
    }

    /// Map API error status to the gateway error taxonomy
    fn map_api_error(status: u16, response_text: &str) -> AppError {
        let message = serde_json::from_str::<GeminiResponse>(response_text)
            .ok()
            .and_then(|r| r.error)
            .map_or_else(
                || response_text.chars().take(200).collect::<String>(),
                |e| e.message,
            );

        match status {
            401 | 403 => AppError::provider_auth_failed("gemini")
                .with_details(serde_json::json!({ "message": message })),
            429 => AppError::provider_rate_limited("gemini")
                .with_details(serde_json::json!({ "message": message })),
            400 => AppError::invalid_input(format!("Gemini API validation error: {message}")),
            404 => AppError::not_found(format!("Gemini model or endpoint ({message})")),
            _ => {
                AppError::provider_unavailable("gemini", format!("API error ({status}): {message}"))
            }
        }
    }
}

#[async_trait]
impl ModelProvider for GeminiProvider {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn display_name(&self) -> &'static str {
        "Google Gemini"
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
        let url = self.build_url(model, "generateContent");

        let gemini_request = Self::build_gemini_request(request);

        debug!("Sending request to Gemini API");

        let response = self
            .client
            .post(&url)
            .json(&gemini_request)
            .send()
            .await
            .map_err(|e| {
                AppError::provider_unavailable("gemini", format!("HTTP request failed: {e}"))
            })?;

        let status = response.status();
        let response_text = response.text().await.map_err(|e| {
            AppError::provider_unavailable("gemini", format!("Failed to read response: {e}"))
        })?;

        if !status.is_success() {
            error!(status = %status, "Gemini API error");
            return Err(Self::map_api_error(status.as_u16(), &response_text));
        }

        let gemini_response: GeminiResponse =
            serde_json::from_str(&response_text).map_err(|e| {
                error!(error = %e, "Failed to parse Gemini response");
                AppError::provider_unavailable("gemini", format!("Failed to parse response: {e}"))
            })?;

        if let Some(err) = gemini_response.error {
            return Err(AppError::provider_unavailable(
                "gemini",
                format!("API error: {}", err.message),
            ));
        }

        let content = Self::extract_content(&gemini_response)?;
        let usage = gemini_response
            .usage_metadata
            .as_ref()
            .map(Self::convert_usage);
        let finish_reason = gemini_response
            .candidates
            .as_ref()
            .and_then(|c| c.first())
            .and_then(|c| c.finish_reason.clone());

        debug!("Successfully received Gemini response");

        Ok(ChatResponse {
            content,
            model: model.to_owned(),
            usage,
            finish_reason,
        })
    }

    #[instrument(skip(self, request), fields(model = %request.model.as_deref().unwrap_or(DEFAULT_MODEL)))]
    async fn send_message_stream(&self, request: &ChatRequest) -> AppResult<ChatStream> {
        let model = request.model.as_deref().unwrap_or(DEFAULT_MODEL);
        let url = self.build_url(model, "streamGenerateContent");

        let gemini_request = Self::build_gemini_request(request);

        debug!("Starting streaming request to Gemini API");

        let response = self
            .client
            .post(&url)
            .query(&[("alt", "sse")])
            .json(&gemini_request)
            .send()
            .await
            .map_err(|e| {
                AppError::provider_unavailable("gemini", format!("HTTP request failed: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_owned());
            return Err(Self::map_api_error(status.as_u16(), &error_text));
        }

        let byte_stream = response.bytes_stream();

        let stream = byte_stream.filter_map(|result| async move {
            match result {
                Ok(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);

                    // Parse SSE format: lines starting with "data: "
                    for line in text.lines() {
                        if let Some(data) = line.strip_prefix("data: ") {
                            if data.trim().is_empty() {
                                continue;
                            }

                            match serde_json::from_str::<StreamingResponse>(data) {
                                Ok(response) => {
                                    let Some(candidate) =
                                        response.candidates.as_ref().and_then(|c| c.first())
                                    else {
                                        continue;
                                    };
                                    let Some(part) = candidate
                                        .content
                                        .as_ref()
                                        .and_then(|c| c.parts.first())
                                    else {
                                        continue;
                                    };

                                    let is_final = candidate
                                        .finish_reason
                                        .as_ref()
                                        .is_some_and(|r| r == "STOP");

                                    return Some(Ok(StreamChunk {
                                        delta: part.text.clone(),
                                        is_final,
                                        finish_reason: candidate.finish_reason.clone(),
                                    }));
                                }
                                Err(e) => {
                                    warn!(error = %e, "Failed to parse streaming chunk");
                                }
                            }
                        }
                    }

                    None
                }
                Err(e) => Some(Err(AppError::provider_unavailable(
                    "gemini",
                    format!("Stream error: {e}"),
                ))),
            }
        });

        Ok(Box::pin(stream) as ChatStream)
    }

    #[instrument(skip(self))]
    async fn validate_credentials(&self) -> AppResult<bool> {
        // List models to verify reachability and key validity
        let url = format!(
            "{}/models?key={}",
            self.base_url.trim_end_matches('/'),
            self.api_key
        );

        let response = self.client.get(&url).send().await.map_err(|e| {
            AppError::provider_unavailable("gemini", format!("Credential probe failed: {e}"))
        })?;

        let status = response.status();
        match status.as_u16() {
            200..=299 => Ok(true),
            401 | 403 => Ok(false),
            _ => Err(AppError::provider_unavailable(
                "gemini",
                format!("Credential probe returned status {status}"),
            )),
        }
    }
}

impl Debug for GeminiProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("GeminiProvider")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            // Omit `client` field as HTTP clients are not useful to debug
            .finish_non_exhaustive()
    }
}
