// ABOUTME: Domain service layer for multi-step conversation operations
// ABOUTME: Protocol-agnostic logic shared by the gateway facade and embedders
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Switchboard Contributors

//! Domain service layer
//!
//! Free functions composing the database, registry, and trackers into the
//! conversational operations the gateway exposes. Services own the ordering
//! rules (persist before dispatch, price after append) so every entry point
//! behaves identically.

/// Conversation lifecycle and message dispatch with context replay
pub mod chat;
