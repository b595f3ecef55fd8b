// ABOUTME: Provider abstraction layer for pluggable AI model backends
// ABOUTME: Defines the driver contract, model catalogs, and the provider registry
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Switchboard Contributors

//! # Model Provider Service Provider Interface
//!
//! This module defines the contract a provider driver must implement to be
//! switchable through the gateway. Each driver owns its wire format, model
//! catalog, and static pricing defaults; everything above the registry sees
//! only this trait.
//!
//! ## Key Concepts
//!
//! - **`ProviderCapabilities`**: Bitflags describing driver features
//! - **`ModelProvider`**: Async trait for message dispatch with streaming support
//! - **`ModelInfo`**: Catalog entry carrying the context window the planner needs
//! - **`ProviderRegistry`**: Name-indexed driver lookup and switch-target validation
//!
//! ## Example: Using a Driver
//!
//! ```rust,no_run
//! use switchboard::providers::{ChatMessage, ChatRequest, ModelProvider};
//!
//! async fn example(provider: &dyn ModelProvider) {
//!     let messages = vec![
//!         ChatMessage::system("You are a concise assistant."),
//!         ChatMessage::user("Summarize the build output."),
//!     ];
//!
//!     let request = ChatRequest::new(messages);
//!     let response = provider.send_message(&request).await;
//! }
//! ```

mod gemini;
mod openai;
mod openai_compatible;
mod xai;

pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;
pub use openai_compatible::{OpenAiCompatibleConfig, OpenAiCompatibleProvider};
pub use xai::XaiProvider;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;
use tracing::{info, warn};

use crate::config::ProviderConfig;
use crate::errors::{AppError, AppResult};
use crate::models::PricingDescriptor;

/// Revision date stamped on driver-default pricing descriptors
const PRICING_CATALOG_REVISION: &str = "2025-06-01T00:00:00Z";

/// Effective timestamp for driver-default pricing
pub(crate) fn catalog_effective_date() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(PRICING_CATALOG_REVISION)
        .map_or_else(|_| Utc::now(), |d| d.with_timezone(&Utc))
}

// ============================================================================
// Capability Flags
// ============================================================================

bitflags::bitflags! {
    /// Provider capability flags using bitflags for efficient storage
    ///
    /// Indicates which features a driver supports. The switch orchestrator
    /// consults these when validating a switch target.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ProviderCapabilities: u8 {
        /// Driver supports streaming responses
        const STREAMING = 0b0000_0001;
        /// Driver supports function/tool calling
        const FUNCTION_CALLING = 0b0000_0010;
        /// Driver supports vision/image input
        const VISION = 0b0000_0100;
        /// Driver supports JSON mode output
        const JSON_MODE = 0b0000_1000;
        /// Driver supports system messages
        const SYSTEM_MESSAGES = 0b0001_0000;
    }
}

impl ProviderCapabilities {
    /// Capabilities of a basic text-only driver
    #[must_use]
    pub const fn text_only() -> Self {
        Self::STREAMING.union(Self::SYSTEM_MESSAGES)
    }

    /// Capabilities of a full-featured frontier model driver
    #[must_use]
    pub const fn full_featured() -> Self {
        Self::STREAMING
            .union(Self::FUNCTION_CALLING)
            .union(Self::VISION)
            .union(Self::JSON_MODE)
            .union(Self::SYSTEM_MESSAGES)
    }

    /// Check if streaming is supported
    #[must_use]
    pub const fn supports_streaming(&self) -> bool {
        self.contains(Self::STREAMING)
    }

    /// Check if system messages are supported
    #[must_use]
    pub const fn supports_system_messages(&self) -> bool {
        self.contains(Self::SYSTEM_MESSAGES)
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// Role of a message in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System instruction message
    System,
    /// User input message
    User,
    /// Assistant response message
    Assistant,
}

impl MessageRole {
    /// Convert to string representation for API calls and storage
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Parse the stored string form
    #[must_use]
    pub fn parse_str(value: &str) -> Option<Self> {
        match value {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// A single message in a chat conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the message sender
    pub role: MessageRole,
    /// Content of the message
    pub content: String,
}

impl ChatMessage {
    /// Create a new message with the given role
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Configuration for a message dispatch request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Conversation messages, replay context included
    pub messages: Vec<ChatMessage>,
    /// Model identifier (provider-specific)
    pub model: Option<String>,
    /// Temperature for response randomness (0.0 - 2.0)
    pub temperature: Option<f32>,
    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,
    /// Whether to stream the response
    pub stream: bool,
}

impl ChatRequest {
    /// Create a new request with messages
    #[must_use]
    pub const fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            model: None,
            temperature: None,
            max_tokens: None,
            stream: false,
        }
    }

    /// Set the model to use
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the temperature
    #[must_use]
    pub const fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the maximum tokens
    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Enable streaming
    #[must_use]
    pub const fn with_streaming(mut self) -> Self {
        self.stream = true;
        self
    }
}

/// Response from a message dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Generated message content
    pub content: String,
    /// Model used for generation
    pub model: String,
    /// Token usage statistics
    pub usage: Option<TokenUsage>,
    /// Finish reason (stop, length, etc.)
    pub finish_reason: Option<String>,
}

/// Token usage statistics for one exchange
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt, replayed context included
    pub input_tokens: u32,
    /// Tokens in the completion
    pub output_tokens: u32,
    /// Total tokens used
    pub total_tokens: u32,
}

impl TokenUsage {
    /// Build usage from directional counts
    #[must_use]
    pub const fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

/// A chunk of a streaming response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Content delta for this chunk
    pub delta: String,
    /// Whether this is the final chunk
    pub is_final: bool,
    /// Finish reason if final
    pub finish_reason: Option<String>,
}

/// Stream type for streaming message responses
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, AppError>> + Send>>;

// ============================================================================
// Model Catalog
// ============================================================================

/// Catalog entry for one model a driver can serve
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Provider-scoped model identifier
    pub id: String,
    /// Context window in tokens
    pub context_window: u32,
    /// Maximum completion tokens per request
    pub max_output_tokens: u32,
    /// Features this model supports
    pub capabilities: ProviderCapabilities,
}

impl ModelInfo {
    /// Build a catalog entry
    pub fn new(
        id: impl Into<String>,
        context_window: u32,
        max_output_tokens: u32,
        capabilities: ProviderCapabilities,
    ) -> Self {
        Self {
            id: id.into(),
            context_window,
            max_output_tokens,
            capabilities,
        }
    }
}

// ============================================================================
// Provider Trait
// ============================================================================

/// Driver trait for a switchable model provider
///
/// Implement this trait to make a new provider family reachable through the
/// gateway. The design follows the async trait pattern for compatibility
/// with the tokio runtime.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Unique provider identifier (e.g. "openai", "gemini", "xai", "local")
    fn name(&self) -> &'static str;

    /// Human-readable display name for the provider
    fn display_name(&self) -> &'static str;

    /// Provider capabilities (streaming, vision, etc.)
    fn capabilities(&self) -> ProviderCapabilities;

    /// Default model to use if not specified in a request
    fn default_model(&self) -> &str;

    /// Model catalog with context windows for switch validation and planning
    fn models(&self) -> Vec<ModelInfo>;

    /// Static default pricing for a model, if the driver ships one
    ///
    /// Returns `None` for models the driver has no published rates for; the
    /// pricing resolver then falls through to universal fallback rates.
    fn default_pricing(&self, model: &str) -> Option<PricingDescriptor>;

    /// Send a message batch and wait for the complete response
    async fn send_message(&self, request: &ChatRequest) -> AppResult<ChatResponse>;

    /// Send a message batch and stream the response incrementally
    async fn send_message_stream(&self, request: &ChatRequest) -> AppResult<ChatStream>;

    /// Probe reachability and credential validity without sending a message
    ///
    /// `Ok(false)` means the endpoint answered but rejected the credentials;
    /// transport and server-side failures surface as availability errors.
    async fn validate_credentials(&self) -> AppResult<bool>;
}

// ============================================================================
// Provider Registry
// ============================================================================

/// Registry of active provider drivers
///
/// Manages the drivers built from configuration and validates switch targets
/// against their catalogs.
pub struct ProviderRegistry {
    providers: Vec<Box<dyn ModelProvider>>,
}

impl ProviderRegistry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    /// Build a registry containing every driver the configuration has
    /// credentials for
    #[must_use]
    pub fn from_config(config: &ProviderConfig) -> Self {
        let mut registry = Self::new();

        if let Some(api_key) = &config.openai_api_key {
            registry.register(Box::new(OpenAiProvider::new(
                api_key.clone(),
                config.openai_base_url.clone(),
            )));
        }
        if let Some(api_key) = &config.gemini_api_key {
            registry.register(Box::new(GeminiProvider::new(
                api_key.clone(),
                config.gemini_base_url.clone(),
            )));
        }
        if let Some(api_key) = &config.xai_api_key {
            registry.register(Box::new(XaiProvider::new(
                api_key.clone(),
                config.xai_base_url.clone(),
            )));
        }
        if let Some(base_url) = &config.local_base_url {
            let mut local = OpenAiCompatibleConfig::ollama();
            local.base_url.clone_from(base_url);
            if let Some(model) = &config.local_model {
                local.model.clone_from(model);
            }
            local.api_key.clone_from(&config.local_api_key);
            match OpenAiCompatibleProvider::new(local) {
                Ok(provider) => registry.register(Box::new(provider)),
                Err(e) => warn!("Skipping local provider: {e}"),
            }
        }

        registry
    }

    /// Register a driver
    pub fn register(&mut self, provider: Box<dyn ModelProvider>) {
        info!(
            provider = provider.name(),
            default_model = provider.default_model(),
            "Registered model provider"
        );
        self.providers.push(provider);
    }

    /// Get a driver by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&dyn ModelProvider> {
        self.providers
            .iter()
            .find(|p| p.name() == name)
            .map(AsRef::as_ref)
    }

    /// List all registered drivers
    #[must_use]
    pub fn list(&self) -> Vec<&dyn ModelProvider> {
        self.providers.iter().map(AsRef::as_ref).collect()
    }

    /// Names of all registered drivers
    #[must_use]
    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Get the default driver (first registered)
    #[must_use]
    pub fn default_provider(&self) -> Option<&dyn ModelProvider> {
        self.providers.first().map(AsRef::as_ref)
    }

    /// Validate a switch target and return its catalog entry
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the registered providers when the
    /// provider is unknown, or listing the provider's catalog when the model
    /// is not served by it.
    pub fn find_model(&self, provider: &str, model: &str) -> AppResult<ModelInfo> {
        let driver = self.get(provider).ok_or_else(|| {
            AppError::invalid_input(format!(
                "Unknown provider '{provider}' (registered: {})",
                self.provider_names().join(", ")
            ))
        })?;

        driver
            .models()
            .into_iter()
            .find(|m| m.id == model)
            .ok_or_else(|| {
                AppError::invalid_input(format!(
                    "Model '{model}' is not served by provider '{provider}' (available: {})",
                    driver
                        .models()
                        .iter()
                        .map(|m| m.id.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_usage_totals_directional_counts() {
        let usage = TokenUsage::new(120, 45);
        assert_eq!(usage.total_tokens, 165);
    }

    #[test]
    fn chat_request_builder_sets_fields() {
        let request = ChatRequest::new(vec![ChatMessage::user("hi")])
            .with_model("gpt-4o")
            .with_temperature(0.2)
            .with_max_tokens(256)
            .with_streaming();
        assert_eq!(request.model.as_deref(), Some("gpt-4o"));
        assert_eq!(request.temperature, Some(0.2));
        assert_eq!(request.max_tokens, Some(256));
        assert!(request.stream);
    }

    #[test]
    fn message_role_round_trips() {
        for role in [MessageRole::System, MessageRole::User, MessageRole::Assistant] {
            assert_eq!(MessageRole::parse_str(role.as_str()), Some(role));
        }
        assert_eq!(MessageRole::parse_str("tool"), None);
    }

    #[test]
    fn empty_registry_rejects_every_target() {
        let registry = ProviderRegistry::new();
        let err = registry.find_model("openai", "gpt-4o").unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::InvalidInput);
    }
}
