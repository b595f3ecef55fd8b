// ABOUTME: Shared test utilities and scripted providers for integration tests
// ABOUTME: Provides gateway assembly helpers backed by throwaway databases
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Switchboard Contributors
#![allow(
    dead_code,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::module_name_repetitions,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
//! Shared test utilities for `switchboard`
//!
//! This module provides common setup functions to reduce duplication
//! across integration tests.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex, Once};
use switchboard::context::ContextPlanner;
use switchboard::database::Database;
use switchboard::errors::{AppError, AppResult};
use switchboard::gateway::Gateway;
use switchboard::models::{BillingModel, PricingDescriptor, PricingSource, PricingUnit};
use switchboard::providers::{
    ChatRequest, ChatResponse, ChatStream, ModelInfo, ModelProvider, ProviderCapabilities,
    ProviderRegistry, TokenUsage,
};

static INIT_LOGGER: Once = Once::new();

/// Initialize quiet logging for tests (call once per test process)
pub fn init_test_logging() {
    INIT_LOGGER.call_once(|| {
        // Check for TEST_LOG environment variable to control test logging level
        let log_level = match std::env::var("TEST_LOG").as_deref() {
            Ok("TRACE") => tracing::Level::TRACE,
            Ok("DEBUG") => tracing::Level::DEBUG,
            Ok("INFO") => tracing::Level::INFO,
            Ok("WARN" | "ERROR") | _ => tracing::Level::WARN, // Default to WARN for quiet tests
        };

        tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_test_writer()
            .init();
    });
}

/// Captured requests served by a scripted provider, oldest first
pub type RequestLog = Arc<Mutex<Vec<ChatRequest>>>;

/// An in-process provider driver for gateway tests
///
/// Behaves like a real driver without any network access: replies with a
/// fixed body and usage, and can be scripted as unreachable or unauthorized
/// to exercise switching and fallback paths.
pub struct ScriptedProvider {
    name: &'static str,
    model: &'static str,
    context_window: u32,
    reply: String,
    usage: Option<TokenUsage>,
    pricing: Option<(f64, f64)>,
    reachable: bool,
    authorized: bool,
    requests: RequestLog,
}

impl ScriptedProvider {
    /// A healthy provider serving one model
    pub fn up(name: &'static str, model: &'static str) -> Self {
        Self {
            name,
            model,
            context_window: 8_192,
            reply: format!("scripted reply from {name}"),
            usage: Some(TokenUsage::new(100, 25)),
            pricing: None,
            reachable: true,
            authorized: true,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A provider whose endpoint refuses connections
    pub fn down(name: &'static str, model: &'static str) -> Self {
        let mut provider = Self::up(name, model);
        provider.reachable = false;
        provider
    }

    /// A reachable provider with rejected credentials
    pub fn unauthorized(name: &'static str, model: &'static str) -> Self {
        let mut provider = Self::up(name, model);
        provider.authorized = false;
        provider
    }

    /// Shrink the model's context window to force truncation plans
    pub fn with_context_window(mut self, context_window: u32) -> Self {
        self.context_window = context_window;
        self
    }

    /// Report fixed token usage on every reply
    pub fn with_usage(mut self, input_tokens: u32, output_tokens: u32) -> Self {
        self.usage = Some(TokenUsage::new(input_tokens, output_tokens));
        self
    }

    /// Stop reporting usage so the gateway falls back to estimates
    pub fn without_usage(mut self) -> Self {
        self.usage = None;
        self
    }

    /// Advertise per-1K driver default pricing in USD
    pub fn with_pricing(mut self, input_rate: f64, output_rate: f64) -> Self {
        self.pricing = Some((input_rate, output_rate));
        self
    }

    /// Handle to the requests this provider has served
    pub fn request_log(&self) -> RequestLog {
        self.requests.clone()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn display_name(&self) -> &'static str {
        self.name
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::text_only()
    }

    fn default_model(&self) -> &str {
        self.model
    }

    fn models(&self) -> Vec<ModelInfo> {
        vec![ModelInfo::new(
            self.model,
            self.context_window,
            2_048,
            ProviderCapabilities::text_only(),
        )]
    }

    fn default_pricing(&self, model: &str) -> Option<PricingDescriptor> {
        let (input_rate, output_rate) = self.pricing?;
        if model != self.model {
            return None;
        }
        Some(PricingDescriptor {
            provider: self.name.to_owned(),
            model: model.to_owned(),
            input_rate,
            output_rate,
            flat_rate: None,
            unit: PricingUnit::Per1kTokens,
            currency: "USD".to_owned(),
            billing_model: BillingModel::PayPerUse,
            effective_at: Utc::now(),
            source: PricingSource::DriverDefault,
        })
    }

    async fn send_message(&self, request: &ChatRequest) -> AppResult<ChatResponse> {
        if !self.reachable {
            return Err(AppError::provider_unavailable(
                self.name,
                "connection refused",
            ));
        }
        self.requests.lock().unwrap().push(request.clone());
        Ok(ChatResponse {
            content: self.reply.clone(),
            model: self.model.to_owned(),
            usage: self.usage,
            finish_reason: Some("stop".to_owned()),
        })
    }

    async fn send_message_stream(&self, _request: &ChatRequest) -> AppResult<ChatStream> {
        Err(AppError::internal("streaming not supported in tests"))
    }

    async fn validate_credentials(&self) -> AppResult<bool> {
        if !self.reachable {
            return Err(AppError::provider_unavailable(
                self.name,
                "connection refused",
            ));
        }
        Ok(self.authorized)
    }
}

/// Assemble a gateway over an in-memory database from scripted providers
pub async fn create_test_gateway(providers: Vec<ScriptedProvider>) -> Gateway {
    init_test_logging();
    let database = Database::new("sqlite::memory:")
        .await
        .expect("in-memory database");
    let mut registry = ProviderRegistry::new();
    for provider in providers {
        registry.register(Box::new(provider));
    }
    Gateway::new(database, Arc::new(registry), ContextPlanner::default())
}

/// Assemble a gateway over a file-backed database for concurrent tests
///
/// The in-memory URL hands every test the same pooled connection, which
/// serializes access; concurrency tests need a real file. The returned
/// directory guard must outlive the gateway.
pub async fn create_file_backed_gateway(
    providers: Vec<ScriptedProvider>,
) -> (Gateway, tempfile::TempDir) {
    init_test_logging();
    let dir = tempfile::tempdir().expect("temp dir");
    let url = format!("sqlite:{}", dir.path().join("switchboard-test.db").display());
    let database = Database::new(&url).await.expect("file-backed database");
    let mut registry = ProviderRegistry::new();
    for provider in providers {
        registry.register(Box::new(provider));
    }
    (
        Gateway::new(database, Arc::new(registry), ContextPlanner::default()),
        dir,
    )
}
