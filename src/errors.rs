// ABOUTME: Unified error taxonomy for the provider gateway with stable error codes
// ABOUTME: and structured context preserved across component boundaries
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright (c) 2025 Switchboard Contributors

//! # Error Handling
//!
//! Every fallible operation in this crate returns [`AppResult`], carrying an
//! [`AppError`] with a stable [`ErrorCode`]. Codes are grouped by class:
//! validation, resource lookup, provider availability, conversation
//! consistency, configuration, and internal faults. Callers branch on the
//! class, never on message text.
//!
//! Availability errors (`PROVIDER_UNAVAILABLE`, `PROVIDER_AUTH_FAILED`,
//! `PROVIDER_RATE_LIMITED`) mark candidates the fallback orchestrator may
//! record and skip; database and internal errors always propagate.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ================================================================================================
// Error Codes
// ================================================================================================

/// Stable error codes grouped by concern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Validation errors (1000-1999)
    #[serde(rename = "INVALID_INPUT")]
    InvalidInput,
    #[serde(rename = "MISSING_REQUIRED_FIELD")]
    MissingRequiredField,
    #[serde(rename = "VALUE_OUT_OF_RANGE")]
    ValueOutOfRange,

    // Resource errors (2000-2999)
    #[serde(rename = "RESOURCE_NOT_FOUND")]
    ResourceNotFound,

    // Provider availability errors (3000-3999)
    #[serde(rename = "PROVIDER_UNAVAILABLE")]
    ProviderUnavailable,
    #[serde(rename = "PROVIDER_AUTH_FAILED")]
    ProviderAuthFailed,
    #[serde(rename = "PROVIDER_RATE_LIMITED")]
    ProviderRateLimited,
    #[serde(rename = "FALLBACK_EXHAUSTED")]
    FallbackExhausted,

    // Conversation consistency errors (4000-4999)
    #[serde(rename = "NO_OPEN_SESSION")]
    NoOpenSession,
    #[serde(rename = "STATE_CONFLICT")]
    StateConflict,

    // Configuration errors (5000-5999)
    #[serde(rename = "CONFIG_ERROR")]
    ConfigError,
    #[serde(rename = "CONFIG_MISSING")]
    ConfigMissing,

    // Internal errors (9000-9999)
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "SERIALIZATION_ERROR")]
    SerializationError,
}

impl ErrorCode {
    /// Human-readable description of the error code
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::InvalidInput => "Invalid input provided",
            Self::MissingRequiredField => "Required field is missing",
            Self::ValueOutOfRange => "Value is outside the permitted range",
            Self::ResourceNotFound => "Requested resource not found",
            Self::ProviderUnavailable => "Provider is unreachable or returned a server error",
            Self::ProviderAuthFailed => "Provider rejected the configured credentials",
            Self::ProviderRateLimited => "Provider rate limit exceeded",
            Self::FallbackExhausted => "Every candidate in the fallback priority list failed",
            Self::NoOpenSession => "Conversation has no open provider session",
            Self::StateConflict => "Operation conflicts with current conversation state",
            Self::ConfigError => "Configuration error",
            Self::ConfigMissing => "Required configuration is missing",
            Self::InternalError => "Internal server error",
            Self::DatabaseError => "Database operation failed",
            Self::SerializationError => "Data serialization error",
        }
    }

    /// Whether this code denotes a provider availability failure
    #[must_use]
    pub const fn is_availability(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable | Self::ProviderAuthFailed | Self::ProviderRateLimited
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Self::InvalidInput => "INVALID_INPUT",
            Self::MissingRequiredField => "MISSING_REQUIRED_FIELD",
            Self::ValueOutOfRange => "VALUE_OUT_OF_RANGE",
            Self::ResourceNotFound => "RESOURCE_NOT_FOUND",
            Self::ProviderUnavailable => "PROVIDER_UNAVAILABLE",
            Self::ProviderAuthFailed => "PROVIDER_AUTH_FAILED",
            Self::ProviderRateLimited => "PROVIDER_RATE_LIMITED",
            Self::FallbackExhausted => "FALLBACK_EXHAUSTED",
            Self::NoOpenSession => "NO_OPEN_SESSION",
            Self::StateConflict => "STATE_CONFLICT",
            Self::ConfigError => "CONFIG_ERROR",
            Self::ConfigMissing => "CONFIG_MISSING",
            Self::InternalError => "INTERNAL_ERROR",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::SerializationError => "SERIALIZATION_ERROR",
        };
        write!(f, "{code}")
    }
}

// ================================================================================================
// Application Error
// ================================================================================================

/// Application error with code, message, and optional structured details
#[derive(Debug, Error)]
pub struct AppError {
    /// Stable error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Optional structured payload (e.g. per-candidate fallback attempts)
    pub details: Option<serde_json::Value>,
    /// Optional underlying source error
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl AppError {
    /// Create a new error with the given code and message
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    /// Attach a structured details payload
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Attach an underlying source error
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Whether the error belongs to the availability class
    #[must_use]
    pub const fn is_availability(&self) -> bool {
        self.code.is_availability()
    }

    // ============================================================================================
    // Convenience Constructors
    // ============================================================================================

    /// Invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    /// Validation error aggregating one or more field violations
    pub fn validation(violations: Vec<String>) -> Self {
        Self::new(
            ErrorCode::InvalidInput,
            format!("validation failed: {}", violations.join("; ")),
        )
        .with_details(serde_json::json!({ "violations": violations }))
    }

    /// Missing required field error
    pub fn missing_field(field: impl Into<String>) -> Self {
        let field = field.into();
        Self::new(
            ErrorCode::MissingRequiredField,
            format!("Missing required field: {field}"),
        )
    }

    /// Resource not found error
    pub fn not_found(resource: impl Into<String>) -> Self {
        let resource = resource.into();
        Self::new(ErrorCode::ResourceNotFound, format!("{resource} not found"))
    }

    /// Provider unreachable or failing with a server-side error
    pub fn provider_unavailable(provider: impl Into<String>, message: impl Into<String>) -> Self {
        let provider = provider.into();
        let message = message.into();
        Self::new(
            ErrorCode::ProviderUnavailable,
            format!("Provider '{provider}' unavailable: {message}"),
        )
    }

    /// Provider rejected the configured credentials
    pub fn provider_auth_failed(provider: impl Into<String>) -> Self {
        let provider = provider.into();
        Self::new(
            ErrorCode::ProviderAuthFailed,
            format!("Provider '{provider}' rejected the configured credentials"),
        )
    }

    /// Provider rate limit hit
    pub fn provider_rate_limited(provider: impl Into<String>) -> Self {
        let provider = provider.into();
        Self::new(
            ErrorCode::ProviderRateLimited,
            format!("Provider '{provider}' rate limit exceeded"),
        )
    }

    /// Every fallback candidate failed; `attempts` carries the per-candidate trail
    pub fn fallback_exhausted(message: impl Into<String>, attempts: serde_json::Value) -> Self {
        Self::new(ErrorCode::FallbackExhausted, message)
            .with_details(serde_json::json!({ "attempts": attempts }))
    }

    /// Conversation has no open provider session
    pub fn no_open_session(conversation_id: impl Into<String>) -> Self {
        let conversation_id = conversation_id.into();
        Self::new(
            ErrorCode::NoOpenSession,
            format!("Conversation '{conversation_id}' has no open provider session"),
        )
    }

    /// Conversation state conflicts with the requested operation
    pub fn state_conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::StateConflict, message)
    }

    /// Configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigError, message)
    }

    /// Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Database error
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DatabaseError, message)
    }

    /// Serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SerializationError, message)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}

/// Result type alias used throughout the crate
pub type AppResult<T> = Result<T, AppError>;
