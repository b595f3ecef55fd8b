// ABOUTME: Environment-based runtime configuration for the provider gateway
// ABOUTME: Covers database location, context planning tunables, and provider credentials
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Configuration
//!
//! Runtime configuration loaded from environment variables. Every value has a
//! working default so the gateway starts with zero configuration against a
//! local SQLite file; provider credentials are the only values that gate
//! functionality (a driver without credentials is simply not registered).
//!
//! ## Environment Variables
//!
//! - `DATABASE_URL` - SQLite connection string (default `sqlite:./data/switchboard.db`)
//! - `CONTEXT_SAFETY_MARGIN` - fraction of the context window usable by carried history
//! - `OPENAI_API_KEY` / `OPENAI_BASE_URL` - OpenAI driver credentials
//! - `GEMINI_API_KEY` / `GEMINI_BASE_URL` - Gemini driver credentials
//! - `XAI_API_KEY` / `XAI_BASE_URL` - xAI driver credentials
//! - `LOCAL_LLM_BASE_URL` / `LOCAL_LLM_MODEL` / `LOCAL_LLM_API_KEY` - local OpenAI-compatible server

use crate::constants::context;
use crate::errors::{AppError, AppResult};
use std::env;
use tracing::warn;

/// Default on-disk database location
const DEFAULT_DATABASE_URL: &str = "sqlite:./data/switchboard.db";

/// Top-level gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// SQLite connection string
    pub database_url: String,
    /// Context preservation tunables
    pub context: ContextConfig,
    /// Provider credential set
    pub providers: ProviderConfig,
}

/// Context preservation planner tunables
#[derive(Debug, Clone, Copy)]
pub struct ContextConfig {
    /// Fraction of the target context window available to carried history
    pub safety_margin: f64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            safety_margin: context::DEFAULT_SAFETY_MARGIN,
        }
    }
}

/// Credentials and endpoints for each supported provider family
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    /// OpenAI API key
    pub openai_api_key: Option<String>,
    /// Override for the OpenAI API base URL
    pub openai_base_url: Option<String>,
    /// Gemini API key
    pub gemini_api_key: Option<String>,
    /// Override for the Gemini API base URL
    pub gemini_base_url: Option<String>,
    /// xAI API key
    pub xai_api_key: Option<String>,
    /// Override for the xAI API base URL
    pub xai_base_url: Option<String>,
    /// Base URL of a local OpenAI-compatible server (Ollama, vLLM, LocalAI)
    pub local_base_url: Option<String>,
    /// Model served by the local server
    pub local_model: Option<String>,
    /// API key for the local server, if it requires one
    pub local_api_key: Option<String>,
}

impl GatewayConfig {
    /// Load configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a tunable parses but falls outside
    /// its valid range (e.g. a safety margin of zero).
    pub fn from_env() -> AppResult<Self> {
        let config = Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_owned()),
            context: ContextConfig {
                safety_margin: env_f64_or("CONTEXT_SAFETY_MARGIN", context::DEFAULT_SAFETY_MARGIN),
            },
            providers: ProviderConfig {
                openai_api_key: env::var("OPENAI_API_KEY").ok(),
                openai_base_url: env::var("OPENAI_BASE_URL").ok(),
                gemini_api_key: env::var("GEMINI_API_KEY").ok(),
                gemini_base_url: env::var("GEMINI_BASE_URL").ok(),
                xai_api_key: env::var("XAI_API_KEY").ok(),
                xai_base_url: env::var("XAI_BASE_URL").ok(),
                local_base_url: env::var("LOCAL_LLM_BASE_URL").ok(),
                local_model: env::var("LOCAL_LLM_MODEL").ok(),
                local_api_key: env::var("LOCAL_LLM_API_KEY").ok(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// In-memory configuration for tests and embedded use
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            database_url: "sqlite::memory:".to_owned(),
            context: ContextConfig::default(),
            providers: ProviderConfig::default(),
        }
    }

    /// Validate cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the safety margin is outside (0, 1].
    pub fn validate(&self) -> AppResult<()> {
        let margin = self.context.safety_margin;
        if !margin.is_finite() || margin <= 0.0 || margin > 1.0 {
            return Err(AppError::config(format!(
                "CONTEXT_SAFETY_MARGIN must be within (0, 1], got {margin}"
            )));
        }
        Ok(())
    }
}

/// Parse an f64 environment variable, falling back to the default on absence
/// or parse failure
fn env_f64_or(key: &str, default: f64) -> f64 {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Invalid {} value '{}', using default {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn testing_config_uses_in_memory_database() {
        let config = GatewayConfig::for_testing();
        assert_eq!(config.database_url, "sqlite::memory:");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn safety_margin_must_be_a_usable_fraction() {
        let mut config = GatewayConfig::for_testing();
        config.context.safety_margin = 0.0;
        assert!(config.validate().is_err());

        config.context.safety_margin = 1.5;
        assert!(config.validate().is_err());

        config.context.safety_margin = 1.0;
        assert!(config.validate().is_ok());
    }
}
