// ABOUTME: Generic OpenAI-compatible driver for local and self-hosted endpoints
// ABOUTME: Supports Ollama, vLLM, LocalAI, and any OpenAI-compatible API
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Switchboard Contributors

//! # `OpenAI`-Compatible Provider
//!
//! Generic implementation for any `OpenAI`-compatible endpoint. This enables
//! switching conversations onto local model servers like Ollama, vLLM, and
//! `LocalAI`, which carry no metered cost.
//!
//! ## Configuration
//!
//! Set environment variables to configure the local provider:
//! - `LOCAL_LLM_BASE_URL`: Base URL (default: <http://localhost:11434/v1> for Ollama)
//! - `LOCAL_LLM_MODEL`: Model to use (default: `qwen2.5:14b-instruct`)
//! - `LOCAL_LLM_API_KEY`: API key (optional, empty for local servers)
//!
//! ## Supported Backends
//!
//! - **Ollama**: <http://localhost:11434/v1>
//! - **vLLM**: <http://localhost:8000/v1>
//! - **`LocalAI`**: <http://localhost:8080/v1>
//! - **Any `OpenAI`-compatible endpoint**

use async_trait::async_trait;
use futures_util::{future, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use super::{
    ChatMessage, ChatRequest, ChatResponse, ChatStream, ModelInfo, ModelProvider,
    ProviderCapabilities, StreamChunk, TokenUsage,
};
use crate::errors::{AppError, AppResult};
use crate::models::{BillingModel, PricingDescriptor, PricingSource, PricingUnit};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Environment variable for local LLM base URL
const LOCAL_LLM_BASE_URL_ENV: &str = "LOCAL_LLM_BASE_URL";

/// Environment variable for local LLM model
const LOCAL_LLM_MODEL_ENV: &str = "LOCAL_LLM_MODEL";

/// Environment variable for local LLM API key (optional)
const LOCAL_LLM_API_KEY_ENV: &str = "LOCAL_LLM_API_KEY";

/// Default base URL (Ollama)
const DEFAULT_BASE_URL: &str = "http://localhost:11434/v1";

/// Default model for local inference
const DEFAULT_MODEL: &str = "qwen2.5:14b-instruct";

/// Context window assumed for the default local model
const DEFAULT_CONTEXT_WINDOW: u32 = 32_768;

/// Max completion tokens assumed for local models
const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 8_192;

/// Connection timeout for local servers (more lenient than cloud)
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Request timeout (local inference can be slower)
const REQUEST_TIMEOUT_SECS: u64 = 300;

// ============================================================================
// API Request/Response Types (OpenAI-compatible format)
// ============================================================================

/// OpenAI-compatible API request structure
#[derive(Debug, Serialize)]
struct CompatRequest {
    model: String,
    messages: Vec<CompatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

/// Message structure for OpenAI-compatible APIs
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CompatMessage {
    role: String,
    content: String,
}

impl From<&ChatMessage> for CompatMessage {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            role: msg.role.as_str().to_owned(),
            content: msg.content.clone(),
        }
    }
}

/// OpenAI-compatible API response structure
#[derive(Debug, Deserialize)]
struct CompatResponse {
    choices: Vec<CompatChoice>,
    #[serde(default)]
    usage: Option<CompatUsage>,
    model: String,
}

/// Choice in response
#[derive(Debug, Deserialize)]
struct CompatChoice {
    message: CompatResponseMessage,
    finish_reason: Option<String>,
}

/// Message in response
#[derive(Debug, Deserialize)]
struct CompatResponseMessage {
    content: Option<String>,
}

/// Usage statistics in response
#[derive(Debug, Deserialize)]
struct CompatUsage {
    #[serde(rename = "prompt_tokens")]
    prompt: u32,
    #[serde(rename = "completion_tokens")]
    completion: u32,
}

/// Streaming chunk structure
#[derive(Debug, Deserialize)]
struct CompatStreamChunk {
    choices: Vec<CompatStreamChoice>,
}

/// Choice in streaming chunk
#[derive(Debug, Deserialize)]
struct CompatStreamChoice {
    delta: CompatDelta,
    finish_reason: Option<String>,
}

/// Delta content in streaming chunk
#[derive(Debug, Deserialize)]
struct CompatDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Error response structure
#[derive(Debug, Deserialize)]
struct CompatErrorResponse {
    error: CompatErrorDetail,
}

/// Error detail structure
#[derive(Debug, Deserialize)]
struct CompatErrorDetail {
    message: String,
}

// ============================================================================
// Provider Configuration
// ============================================================================

/// Configuration for the `OpenAI`-compatible provider
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleConfig {
    /// Base URL for the API (e.g. <http://localhost:11434/v1>)
    pub base_url: String,
    /// API key (optional for local servers)
    pub api_key: Option<String>,
    /// Model served by the endpoint
    pub model: String,
    /// Provider name for registry lookup and logging
    pub provider_name: String,
    /// Provider display name
    pub display_name: String,
    /// Context window of the served model
    pub context_window: u32,
    /// Max completion tokens per request
    pub max_output_tokens: u32,
    /// Capabilities of this endpoint
    pub capabilities: ProviderCapabilities,
}

impl OpenAiCompatibleConfig {
    /// Configuration for a local Ollama instance
    #[must_use]
    pub fn ollama() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_owned(),
            api_key: None,
            model: DEFAULT_MODEL.to_owned(),
            provider_name: "ollama".to_owned(),
            display_name: "Ollama (Local)".to_owned(),
            context_window: DEFAULT_CONTEXT_WINDOW,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            capabilities: ProviderCapabilities::STREAMING | ProviderCapabilities::SYSTEM_MESSAGES,
        }
    }

    /// Configuration for a local vLLM instance
    #[must_use]
    pub fn vllm() -> Self {
        Self {
            base_url: "http://localhost:8000/v1".to_owned(),
            api_key: None,
            model: "meta-llama/Llama-3.1-8B-Instruct".to_owned(),
            provider_name: "vllm".to_owned(),
            display_name: "vLLM (Local)".to_owned(),
            context_window: 131_072,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            capabilities: ProviderCapabilities::STREAMING
                | ProviderCapabilities::SYSTEM_MESSAGES
                | ProviderCapabilities::JSON_MODE,
        }
    }

    /// Configuration for `LocalAI`
    #[must_use]
    pub fn local_ai() -> Self {
        Self {
            base_url: "http://localhost:8080/v1".to_owned(),
            api_key: None,
            model: "gpt-4".to_owned(),
            provider_name: "localai".to_owned(),
            display_name: "LocalAI".to_owned(),
            context_window: 8_192,
            max_output_tokens: 4_096,
            capabilities: ProviderCapabilities::STREAMING | ProviderCapabilities::SYSTEM_MESSAGES,
        }
    }
}

impl Default for OpenAiCompatibleConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_owned(),
            api_key: None,
            model: DEFAULT_MODEL.to_owned(),
            provider_name: "local".to_owned(),
            display_name: "Local LLM".to_owned(),
            context_window: DEFAULT_CONTEXT_WINDOW,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            capabilities: ProviderCapabilities::STREAMING | ProviderCapabilities::SYSTEM_MESSAGES,
        }
    }
}

// ============================================================================
// Provider Implementation
// ============================================================================

/// Generic `OpenAI`-compatible provider driver
///
/// Works with any endpoint that implements the `OpenAI` chat completions API,
/// including Ollama, vLLM, and `LocalAI`. Local inference is modeled as
/// subscription-included with zero metered rates, which keeps cost records
/// comparable across switches without inventing charges.
pub struct OpenAiCompatibleProvider {
    client: Client,
    config: OpenAiCompatibleConfig,
}

impl OpenAiCompatibleProvider {
    /// Create a new driver with the given configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: OpenAiCompatibleConfig) -> AppResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| AppError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    /// Create a driver from environment variables
    ///
    /// Reads:
    /// - `LOCAL_LLM_BASE_URL`: Base URL (default: Ollama at localhost:11434)
    /// - `LOCAL_LLM_MODEL`: Model name (default: qwen2.5:14b-instruct)
    /// - `LOCAL_LLM_API_KEY`: API key (optional)
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn from_env() -> AppResult<Self> {
        let base_url =
            env::var(LOCAL_LLM_BASE_URL_ENV).unwrap_or_else(|_| DEFAULT_BASE_URL.to_owned());
        let model = env::var(LOCAL_LLM_MODEL_ENV).unwrap_or_else(|_| DEFAULT_MODEL.to_owned());
        let api_key = env::var(LOCAL_LLM_API_KEY_ENV)
            .ok()
            .filter(|k| !k.is_empty());

        // Detect the backend from the URL for better display names
        let (provider_name, display_name) = if base_url.contains(":11434") {
            ("ollama", "Ollama (Local)")
        } else if base_url.contains(":8000") {
            ("vllm", "vLLM (Local)")
        } else if base_url.contains(":8080") {
            ("localai", "LocalAI")
        } else {
            ("local", "Local LLM")
        };

        let config = OpenAiCompatibleConfig {
            base_url,
            api_key,
            model,
            provider_name: provider_name.to_owned(),
            display_name: display_name.to_owned(),
            ..OpenAiCompatibleConfig::default()
        };

        info!(
            "Initializing {} provider: base_url={}, model={}",
            config.display_name, config.base_url, config.model
        );

        Self::new(config)
    }

    /// Build the API URL for a given endpoint
    fn api_url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            endpoint
        )
    }

    /// Convert internal messages to OpenAI-compatible format
    fn convert_messages(messages: &[ChatMessage]) -> Vec<CompatMessage> {
        messages.iter().map(CompatMessage::from).collect()
    }

    /// Add authorization header if an API key is configured
    fn add_auth_header(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(ref api_key) = self.config.api_key {
            request.header("Authorization", format!("Bearer {api_key}"))
        } else {
            request
        }
    }

    /// Parse error response from the API
    fn parse_error_response(&self, status: reqwest::StatusCode, body: &str) -> AppError {
        let provider = self.name();
        if let Ok(error_response) = serde_json::from_str::<CompatErrorResponse>(body) {
            match status.as_u16() {
                401 | 403 => AppError::provider_auth_failed(provider)
                    .with_details(serde_json::json!({ "message": error_response.error.message })),
                429 => AppError::provider_rate_limited(provider)
                    .with_details(serde_json::json!({ "message": error_response.error.message })),
                400 => AppError::invalid_input(format!(
                    "API validation error: {}",
                    error_response.error.message
                )),
                404 => AppError::not_found(format!(
                    "Model or endpoint ({})",
                    error_response.error.message
                )),
                _ => AppError::provider_unavailable(provider, error_response.error.message),
            }
        } else {
            // Non-JSON error bodies are common with local servers
            match status.as_u16() {
                502..=504 => AppError::provider_unavailable(
                    provider,
                    format!(
                        "{} is not responding. Is the server running at {}?",
                        self.config.display_name, self.config.base_url
                    ),
                ),
                _ => AppError::provider_unavailable(
                    provider,
                    format!(
                        "API error ({}): {}",
                        status,
                        body.chars().take(200).collect::<String>()
                    ),
                ),
            }
        }
    }

    /// Map transport errors, distinguishing connection refusal
    fn connect_error(&self, e: &reqwest::Error) -> AppError {
        if e.is_connect() {
            AppError::provider_unavailable(
                self.name(),
                format!(
                    "Cannot connect to {}. Is the server running at {}?",
                    self.config.display_name, self.config.base_url
                ),
            )
        } else {
            AppError::provider_unavailable(self.name(), format!("Failed to connect: {e}"))
        }
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &'static str {
        // The trait requires &'static str, so map known backends
        match self.config.provider_name.as_str() {
            "ollama" => "ollama",
            "vllm" => "vllm",
            "localai" => "localai",
            _ => "local",
        }
    }

    fn display_name(&self) -> &'static str {
        match self.config.provider_name.as_str() {
            "ollama" => "Ollama (Local)",
            "vllm" => "vLLM (Local)",
            "localai" => "LocalAI",
            _ => "Local LLM",
        }
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.config.capabilities
    }

    fn default_model(&self) -> &str {
        &self.config.model
    }

    fn models(&self) -> Vec<ModelInfo> {
        // A local endpoint serves one configured model
        vec![ModelInfo::new(
            self.config.model.clone(),
            self.config.context_window,
            self.config.max_output_tokens,
            self.config.capabilities,
        )]
    }

    fn default_pricing(&self, model: &str) -> Option<PricingDescriptor> {
        if model != self.config.model {
            return None;
        }
        Some(PricingDescriptor {
            provider: self.name().to_owned(),
            model: model.to_owned(),
            input_rate: 0.0,
            output_rate: 0.0,
            flat_rate: None,
            unit: PricingUnit::Per1kTokens,
            currency: "USD".to_owned(),
            billing_model: BillingModel::SubscriptionIncluded,
            effective_at: super::catalog_effective_date(),
            source: PricingSource::DriverDefault,
        })
    }

    #[instrument(skip(self, request), fields(model = %request.model.as_deref().unwrap_or(&self.config.model)))]
    async fn send_message(&self, request: &ChatRequest) -> AppResult<ChatResponse> {
        let model = request.model.as_deref().unwrap_or(&self.config.model);

        debug!(
            "Sending chat completion request to {} with {} messages",
            self.config.provider_name,
            request.messages.len()
        );

        let api_request = CompatRequest {
            model: model.to_owned(),
            messages: Self::convert_messages(&request.messages),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: Some(false),
        };

        let http_request = self
            .client
            .post(self.api_url("chat/completions"))
            .header("Content-Type", "application/json")
            .json(&api_request);

        let response = self
            .add_auth_header(http_request)
            .send()
            .await
            .map_err(|e| {
                error!(
                    "Failed to send request to {}: {}",
                    self.config.provider_name, e
                );
                self.connect_error(&e)
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            error!("Failed to read API response: {}", e);
            AppError::provider_unavailable(self.name(), format!("Failed to read response: {e}"))
        })?;

        if !status.is_success() {
            return Err(self.parse_error_response(status, &body));
        }

        let api_response: CompatResponse = serde_json::from_str(&body).map_err(|e| {
            error!("Failed to parse API response: {}", e);
            AppError::provider_unavailable(self.name(), format!("Failed to parse response: {e}"))
        })?;

        let choice = api_response.choices.into_iter().next().ok_or_else(|| {
            AppError::provider_unavailable(self.name(), "API returned no choices")
        })?;

        let content = choice.message.content.unwrap_or_default();

        debug!(
            "Received response from {}: {} chars, finish_reason: {:?}",
            self.config.provider_name,
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

    #[instrument(skip(self, request), fields(model = %request.model.as_deref().unwrap_or(&self.config.model)))]
    async fn send_message_stream(&self, request: &ChatRequest) -> AppResult<ChatStream> {
        let model = request.model.as_deref().unwrap_or(&self.config.model);

        debug!(
            "Sending streaming chat completion request to {}",
            self.config.provider_name
        );

        let api_request = CompatRequest {
            model: model.to_owned(),
            messages: Self::convert_messages(&request.messages),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: Some(true),
        };

        let http_request = self
            .client
            .post(self.api_url("chat/completions"))
            .header("Content-Type", "application/json")
            .json(&api_request);

        let response = self
            .add_auth_header(http_request)
            .send()
            .await
            .map_err(|e| {
                error!(
                    "Failed to send streaming request to {}: {}",
                    self.config.provider_name, e
                );
                self.connect_error(&e)
            })?;

        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.parse_error_response(status, &body));
        }

        let provider = self.name();
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
                                match serde_json::from_str::<CompatStreamChunk>(json_str) {
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
                                        warn!("Failed to parse stream chunk: {}", e);
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
                        error!("Error reading stream: {}", e);
                        Err(AppError::provider_unavailable(
                            provider,
                            format!("Stream read error: {e}"),
                        ))
                    }
                }
            })
            .filter(|result| {
                // Filter out empty deltas unless it's the final chunk
                future::ready(
                    result
                        .as_ref()
                        .map_or(true, |chunk| !chunk.delta.is_empty() || chunk.is_final),
                )
            });

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self))]
    async fn validate_credentials(&self) -> AppResult<bool> {
        debug!(
            "Probing {} at {}",
            self.config.provider_name, self.config.base_url
        );

        // The models endpoint is the lightest probe local servers support
        let http_request = self.client.get(self.api_url("models"));

        let response = self
            .add_auth_header(http_request)
            .send()
            .await
            .map_err(|e| {
                error!("{} probe failed: {}", self.config.provider_name, e);
                self.connect_error(&e)
            })?;

        let status = response.status();
        match status.as_u16() {
            200..=299 => {
                debug!("{} probe passed", self.config.provider_name);
                Ok(true)
            }
            401 | 403 => {
                warn!("{} rejected the configured API key", self.config.provider_name);
                Ok(false)
            }
            _ => Err(AppError::provider_unavailable(
                self.name(),
                format!("Probe returned status {status}"),
            )),
        }
    }
}
