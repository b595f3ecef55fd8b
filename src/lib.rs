// ABOUTME: Main library entry point for the Switchboard AI gateway
// ABOUTME: Provides provider switching, context continuity, and cost tracking over chat providers
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Switchboard Contributors

// Crate-level attributes:
// - recursion_limit: Increased from default 128 to 256 for complex derive macros
//   (serde, thiserror) on deeply nested types like provider wire payloads
// - deny(unsafe_code): Zero-tolerance unsafe policy
#![recursion_limit = "256"]
#![deny(unsafe_code)]

//! # Switchboard
//!
//! A provider switching gateway for AI chat conversations. Switchboard lets a
//! single conversation move between heterogeneous chat providers mid-stream
//! while preserving context, tracking per-provider spend, and keeping a full
//! audit trail of every switch.
//!
//! ## Features
//!
//! - **Multi-provider support**: OpenAI, Gemini, xAI, and any OpenAI-compatible endpoint
//! - **Mid-conversation switching**: Manual switches and automatic fallback chains
//! - **Context continuity**: Token-budgeted context plans replayed to the new provider
//! - **Cost tracking**: Per-exchange cost records with per-provider rollups
//! - **Pricing resolution**: Stored overrides, driver defaults, and a universal fallback
//! - **Switch history**: Provider sessions with statistics and fallback analysis
//!
//! ## Architecture
//!
//! The gateway follows a modular architecture:
//! - **Providers**: Abstract chat provider drivers behind one trait
//! - **Switching**: Orchestrated provider switches with fallback chains
//! - **Context**: Token budgeting and context carryover planning
//! - **Pricing / Cost**: Rate resolution and spend accounting
//! - **History**: Provider session tracking and reporting
//! - **Database**: `SQLite`-backed persistence for all of the above
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use switchboard::config::GatewayConfig;
//! use switchboard::errors::AppResult;
//! use switchboard::gateway::Gateway;
//!
//! #[tokio::main]
//! async fn main() -> AppResult<()> {
//!     // Load configuration from environment variables
//!     let config = GatewayConfig::from_env()?;
//!
//!     // Connect the gateway and report which providers are registered
//!     let gateway = Gateway::connect(&config).await?;
//!     println!(
//!         "Switchboard gateway ready with providers: {:?}",
//!         gateway.registry().provider_names()
//!     );
//!
//!     Ok(())
//! }
//! ```

// ── Public API ──────────────────────────────────────────────────────────
// These modules are used by integration tests and downstream consumers.
// They must remain `pub` so external consumers can access them.

/// Configuration management loaded from environment variables
pub mod config;

/// Application constants and tuning values
pub mod constants;

/// Token budgeting and context carryover planning
pub mod context;

/// Cost tracking and cross-provider cost analysis
pub mod cost;

/// `SQLite`-backed persistence for conversations, sessions, pricing, and costs
pub mod database;

/// Unified error handling system with standard error codes
pub mod errors;

/// Top-level gateway facade bundling every subsystem
pub mod gateway;

/// Provider session history and switch statistics
pub mod history;

/// Structured logging initialization
pub mod logging;

/// Common data structures shared across subsystems
pub mod models;

/// Broadcast event bus for switch and cost notifications
pub mod notifications;

/// Pricing resolution, validation, and comparison
pub mod pricing;

/// Chat provider drivers and the provider registry
pub mod providers;

/// Conversation-level orchestration services
pub mod services;

/// Provider switch orchestration with fallback chains
pub mod switching;
