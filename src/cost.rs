// ABOUTME: Cross-provider cost tracking and attribution for conversations
// ABOUTME: Prices exchanges against the open session and analyzes spend per provider
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Switchboard Contributors

//! # Cost Tracker
//!
//! Attributes the cost of every exchange to the provider session that
//! served it and keeps the conversation's running totals in lockstep with
//! the recorded costs. The tracker measures consequences only; it never
//! chooses a provider.
//!
//! Tracking requires an open session. A conversation without one is a
//! contract violation on the caller's side and fails immediately rather
//! than silently attributing cost to nobody.

use crate::database::{CostRecord, Database, NewCostRecord};
use crate::errors::{AppError, AppResult};
use crate::notifications::{EventBus, GatewayEvent};
use crate::pricing::PricingResolver;
use crate::providers::TokenUsage;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Spend attributed to one provider within a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCost {
    /// Provider name
    pub provider: String,
    /// Currency of the amounts
    pub currency: String,
    /// Priced exchanges served by this provider
    pub exchanges: i64,
    /// Prompt tokens consumed
    pub input_tokens: i64,
    /// Completion tokens generated
    pub output_tokens: i64,
    /// Total spend
    pub total_cost: f64,
    /// Blended cost per 1K tokens, 0 when no tokens were exchanged
    pub cost_per_1k_tokens: f64,
}

/// How much switching moved the conversation's cost profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchingImpact {
    /// Sessions opened by a manual or fallback switch
    pub switch_count: i64,
    /// Spread between the most and least expensive provider used,
    /// as cost per 1K tokens; 0 with fewer than two providers
    pub cost_rate_delta: f64,
}

/// Cost analysis of one conversation across every provider that served it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostAnalysis {
    /// Conversation analyzed
    pub conversation_id: String,
    /// Running total from the conversation row
    pub total_cost: f64,
    /// Per-provider breakdown, most efficient first
    pub by_provider: Vec<ProviderCost>,
    /// Switching consequences
    pub switching_impact: SwitchingImpact,
    /// Provider with the lowest cost per 1K tokens, if any spend exists
    pub most_efficient: Option<String>,
    /// Provider with the highest cost per 1K tokens, if any spend exists
    pub least_efficient: Option<String>,
}

/// Tracks and analyzes costs across provider switches
#[derive(Clone)]
pub struct CostTracker {
    database: Database,
    resolver: PricingResolver,
    events: EventBus,
}

impl CostTracker {
    /// Create a tracker over the given database, resolver, and event bus
    #[must_use]
    pub const fn new(database: Database, resolver: PricingResolver, events: EventBus) -> Self {
        Self {
            database,
            resolver,
            events,
        }
    }

    /// Price an exchange and record it against the open session
    ///
    /// Resolves pricing for the provider/model that actually served the
    /// exchange, persists the record, and rolls the amounts into the
    /// conversation totals in one transaction. Emits `CostCalculated`
    /// after the commit.
    ///
    /// # Errors
    ///
    /// Returns [`crate::errors::ErrorCode::NoOpenSession`] if the
    /// conversation has no open session, a not-found error for unknown
    /// conversations, or a database error.
    pub async fn track_message_cost(
        &self,
        conversation_id: &str,
        message_id: Option<&str>,
        provider: &str,
        model: &str,
        usage: &TokenUsage,
    ) -> AppResult<CostRecord> {
        self.database
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Conversation {conversation_id}")))?;

        let session = self
            .database
            .get_open_session(conversation_id)
            .await?
            .ok_or_else(|| AppError::no_open_session(conversation_id))?;

        let breakdown = self.resolver.calculate_cost(provider, model, usage).await?;
        let record = self
            .database
            .apply_cost_record(&NewCostRecord {
                conversation_id: conversation_id.to_owned(),
                session_id: session.id,
                message_id: message_id.map(ToOwned::to_owned),
                breakdown: breakdown.clone(),
            })
            .await?;

        debug!(
            "Tracked {} {} for conversation {conversation_id} on {provider}/{model}",
            breakdown.total_cost, breakdown.currency
        );
        self.events.publish(GatewayEvent::CostCalculated {
            conversation_id: conversation_id.to_owned(),
            provider: provider.to_owned(),
            model: model.to_owned(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_cost: breakdown.total_cost,
            currency: breakdown.currency,
        });

        Ok(record)
    }

    /// Analyze a conversation's spend across every provider that served it
    ///
    /// The per-provider totals always sum to the conversation's running
    /// total because both are written in the same transaction per exchange.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for unknown conversations or a database
    /// error.
    pub async fn get_cost_analysis(&self, conversation_id: &str) -> AppResult<CostAnalysis> {
        let conversation = self
            .database
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Conversation {conversation_id}")))?;

        let rollups = self
            .database
            .provider_cost_rollup(Some(conversation_id))
            .await?;
        let sessions = self.database.list_sessions(conversation_id).await?;

        let mut by_provider: Vec<ProviderCost> = rollups
            .into_iter()
            .map(|r| {
                let tokens = r.total_input_tokens + r.total_output_tokens;
                let cost_per_1k_tokens = if tokens == 0 {
                    0.0
                } else {
                    r.total_cost / (tokens as f64 / 1_000.0)
                };
                ProviderCost {
                    provider: r.provider,
                    currency: r.currency,
                    exchanges: r.record_count,
                    input_tokens: r.total_input_tokens,
                    output_tokens: r.total_output_tokens,
                    total_cost: r.total_cost,
                    cost_per_1k_tokens,
                }
            })
            .collect();

        // Efficiency ranking: cheapest per-1K first, provider name breaks ties
        by_provider.sort_by(|a, b| {
            a.cost_per_1k_tokens
                .total_cmp(&b.cost_per_1k_tokens)
                .then_with(|| a.provider.cmp(&b.provider))
        });

        let most_efficient = by_provider.first().map(|p| p.provider.clone());
        let least_efficient = by_provider.last().map(|p| p.provider.clone());

        #[allow(clippy::cast_possible_wrap)]
        let switch_count = sessions
            .iter()
            .filter(|s| s.switch_type != "initial")
            .count() as i64;
        let cost_rate_delta = match (by_provider.first(), by_provider.last()) {
            (Some(first), Some(last)) if by_provider.len() > 1 => {
                last.cost_per_1k_tokens - first.cost_per_1k_tokens
            }
            _ => 0.0,
        };

        Ok(CostAnalysis {
            conversation_id: conversation_id.to_owned(),
            total_cost: conversation.total_cost,
            by_provider,
            switching_impact: SwitchingImpact {
                switch_count,
                cost_rate_delta,
            },
            most_efficient,
            least_efficient,
        })
    }
}
