// ABOUTME: Provider history tracking over session timelines
// ABOUTME: Records session boundaries and aggregates switch statistics
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Switchboard Contributors

//! # History Tracker
//!
//! Answers "which provider served this conversation, when, and at what
//! cost" from the session timeline. Sessions tile the conversation: closing
//! one and opening the next happen in the same transaction, so the timeline
//! never overlaps and at most one session is open.

use crate::database::{Conversation, Database, ProviderSession};
use crate::errors::{AppError, AppResult};
use crate::models::SwitchType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Per-provider rollup within provider statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderAggregate {
    /// Provider name
    pub provider: String,
    /// Sessions served by this provider
    pub sessions: i64,
    /// Priced exchanges served by this provider
    pub exchanges: i64,
    /// Total spend attributed to this provider
    pub total_cost: f64,
}

/// Aggregated switching statistics, optionally scoped to one conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatistics {
    /// Conversation scope, None for fleet-wide statistics
    pub conversation_id: Option<String>,
    /// Total sessions in scope
    pub total_sessions: i64,
    /// Sessions opened as an initial binding
    pub initial_sessions: i64,
    /// Sessions opened by an explicit switch
    pub manual_switches: i64,
    /// Sessions opened by the fallback path
    pub fallback_switches: i64,
    /// Per-provider rollups, alphabetical by provider
    pub providers: Vec<ProviderAggregate>,
}

/// Fleet-wide fallback pressure summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackAnalysis {
    /// Total sessions across all conversations
    pub total_sessions: i64,
    /// Sessions opened by the fallback path
    pub fallback_sessions: i64,
    /// `fallback_sessions / total_sessions`, 0 when no sessions exist
    pub fallback_rate: f64,
}

/// Filters for querying sessions across conversations
///
/// Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Restrict to one conversation
    pub conversation_id: Option<String>,
    /// Restrict to one provider
    pub provider: Option<String>,
    /// Restrict to one switch type
    pub switch_type: Option<SwitchType>,
    /// Cap the number of sessions returned, newest first
    pub limit: Option<i64>,
}

/// Tracks provider session boundaries and derives switch statistics
#[derive(Clone)]
pub struct HistoryTracker {
    database: Database,
}

impl HistoryTracker {
    /// Create a tracker over the given database
    #[must_use]
    pub const fn new(database: Database) -> Self {
        Self { database }
    }

    /// Open a new session for a conversation, closing any open one
    ///
    /// This is the session-boundary mutator: every other component goes
    /// through here or through the switch transaction, which shares the
    /// same close-then-open step.
    ///
    /// # Errors
    ///
    /// Returns an error if the conversation does not exist or the database
    /// operation fails.
    pub async fn start_session(
        &self,
        conversation_id: &str,
        provider: &str,
        model: &str,
        switch_type: SwitchType,
        reason: Option<&str>,
    ) -> AppResult<ProviderSession> {
        let conversation = self.require_conversation(conversation_id).await?;
        let session = self
            .database
            .start_session(&conversation, provider, model, switch_type, reason)
            .await?;
        debug!(
            "Opened {switch_type} session {} for conversation {conversation_id} on {provider}/{model}",
            session.id
        );
        Ok(session)
    }

    /// Full session timeline of a conversation in chronological order
    ///
    /// # Errors
    ///
    /// Returns an error if the conversation does not exist or the database
    /// operation fails.
    pub async fn get_history(&self, conversation_id: &str) -> AppResult<Vec<ProviderSession>> {
        self.require_conversation(conversation_id).await?;
        self.database.list_sessions(conversation_id).await
    }

    /// Query sessions across conversations with optional filters
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn query(&self, filter: &HistoryFilter) -> AppResult<Vec<ProviderSession>> {
        self.database
            .query_sessions(
                filter.conversation_id.as_deref(),
                filter.provider.as_deref(),
                filter.switch_type.map(|t| t.as_str()),
                filter.limit,
            )
            .await
    }

    /// Aggregate session counts by switch type and provider
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn get_statistics(
        &self,
        conversation_id: Option<&str>,
    ) -> AppResult<ProviderStatistics> {
        let type_counts = self.database.session_type_counts(conversation_id).await?;
        let provider_counts = self
            .database
            .session_provider_counts(conversation_id)
            .await?;
        let rollups = self.database.provider_cost_rollup(conversation_id).await?;

        let mut initial_sessions = 0;
        let mut manual_switches = 0;
        let mut fallback_switches = 0;
        for (switch_type, count) in type_counts {
            match switch_type.as_str() {
                "initial" => initial_sessions = count,
                "manual" => manual_switches = count,
                "fallback" => fallback_switches = count,
                other => debug!("Ignoring unknown switch type '{other}' in statistics"),
            }
        }

        let mut providers: BTreeMap<String, ProviderAggregate> = BTreeMap::new();
        for (provider, sessions) in provider_counts {
            providers.insert(
                provider.clone(),
                ProviderAggregate {
                    provider,
                    sessions,
                    exchanges: 0,
                    total_cost: 0.0,
                },
            );
        }
        for rollup in rollups {
            let entry = providers
                .entry(rollup.provider.clone())
                .or_insert_with(|| ProviderAggregate {
                    provider: rollup.provider.clone(),
                    sessions: 0,
                    exchanges: 0,
                    total_cost: 0.0,
                });
            entry.exchanges += rollup.record_count;
            entry.total_cost += rollup.total_cost;
        }

        Ok(ProviderStatistics {
            conversation_id: conversation_id.map(ToOwned::to_owned),
            total_sessions: initial_sessions + manual_switches + fallback_switches,
            initial_sessions,
            manual_switches,
            fallback_switches,
            providers: providers.into_values().collect(),
        })
    }

    /// Fleet-wide fallback rate across every conversation
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn get_fallback_analysis(&self) -> AppResult<FallbackAnalysis> {
        let type_counts = self.database.session_type_counts(None).await?;

        let mut total_sessions = 0;
        let mut fallback_sessions = 0;
        for (switch_type, count) in type_counts {
            total_sessions += count;
            if switch_type == "fallback" {
                fallback_sessions = count;
            }
        }

        let fallback_rate = if total_sessions == 0 {
            0.0
        } else {
            fallback_sessions as f64 / total_sessions as f64
        };

        Ok(FallbackAnalysis {
            total_sessions,
            fallback_sessions,
            fallback_rate,
        })
    }

    async fn require_conversation(&self, conversation_id: &str) -> AppResult<Conversation> {
        self.database
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Conversation {conversation_id}")))
    }
}
