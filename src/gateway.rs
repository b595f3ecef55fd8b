// ABOUTME: Gateway facade bundling every component behind one entry point
// ABOUTME: Wires the database, registry, trackers, and orchestrator with shared handles
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Switchboard Contributors

//! # Gateway
//!
//! The assembled subsystem. Embedders build one `Gateway` from configuration
//! and drive conversations, switches, pricing, and analysis through it; every
//! component shares the same database pool, registry, and event bus.

use crate::config::GatewayConfig;
use crate::context::ContextPlanner;
use crate::cost::{CostAnalysis, CostTracker};
use crate::database::{
    CostRecord, Database, MessageRecord, NewPricingOverride, PricingOverrideRecord,
    ProviderSession,
};
use crate::errors::AppResult;
use crate::history::{FallbackAnalysis, HistoryFilter, HistoryTracker, ProviderStatistics};
use crate::models::{CostBreakdown, PricingDescriptor};
use crate::notifications::{EventBus, GatewayEvent};
use crate::pricing::{PricingComparison, PricingResolver};
use crate::providers::{ProviderRegistry, TokenUsage};
use crate::services::chat::{self, CreateConversationResult, SendMessageResult};
use crate::switching::{FallbackCandidate, SwitchOptions, SwitchOrchestrator};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// The assembled provider switching gateway
#[derive(Clone)]
pub struct Gateway {
    database: Database,
    registry: Arc<ProviderRegistry>,
    resolver: PricingResolver,
    history: HistoryTracker,
    costs: CostTracker,
    orchestrator: SwitchOrchestrator,
    events: EventBus,
}

impl Gateway {
    /// Build a gateway from validated configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the database
    /// cannot be opened and migrated.
    pub async fn connect(config: &GatewayConfig) -> AppResult<Self> {
        config.validate()?;

        let database = Database::new(&config.database_url).await?;
        let registry = Arc::new(ProviderRegistry::from_config(&config.providers));
        let planner = ContextPlanner::new(config.context.safety_margin);

        Ok(Self::new(database, registry, planner))
    }

    /// Assemble a gateway from prebuilt components
    ///
    /// [`Gateway::connect`] is the configuration-driven path; this
    /// constructor is the wiring point for callers that assemble their own
    /// registry, such as integration tests with scripted providers.
    #[must_use]
    pub fn new(database: Database, registry: Arc<ProviderRegistry>, planner: ContextPlanner) -> Self {
        let events = EventBus::default();
        let resolver = PricingResolver::new(database.clone(), registry.clone());
        let history = HistoryTracker::new(database.clone());
        let costs = CostTracker::new(database.clone(), resolver.clone(), events.clone());
        let orchestrator = SwitchOrchestrator::new(
            database.clone(),
            registry.clone(),
            planner,
            events.clone(),
        );

        info!(
            "Gateway ready with providers: {}",
            registry.provider_names().join(", ")
        );
        Self {
            database,
            registry,
            resolver,
            history,
            costs,
            orchestrator,
            events,
        }
    }

    /// Build a gateway from environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if required environment configuration is missing or
    /// invalid, or if the database cannot be opened.
    pub async fn from_env() -> AppResult<Self> {
        let config = GatewayConfig::from_env()?;
        Self::connect(&config).await
    }

    /// Shared database handle
    #[must_use]
    pub const fn database(&self) -> &Database {
        &self.database
    }

    /// Registered provider drivers
    #[must_use]
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Subscribe to gateway events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    // ========================================================================
    // Conversations
    // ========================================================================

    /// Create a conversation bound to a provider/model pair
    ///
    /// # Errors
    ///
    /// Returns a validation error for an unknown binding or invalid title,
    /// or a database error.
    pub async fn create_conversation(
        &self,
        title: &str,
        provider: &str,
        model: &str,
        system_prompt: Option<&str>,
    ) -> AppResult<CreateConversationResult> {
        chat::create_conversation(
            &self.database,
            &self.registry,
            &self.history,
            title,
            provider,
            model,
            system_prompt,
        )
        .await
    }

    /// Send a message through the conversation's bound provider
    ///
    /// # Errors
    ///
    /// Returns provider availability errors, a consistency error when no
    /// session is open, or a database error.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> AppResult<SendMessageResult> {
        chat::send_message(
            &self.database,
            &self.registry,
            &self.costs,
            conversation_id,
            content,
        )
        .await
    }

    /// Full message history of a conversation
    ///
    /// # Errors
    ///
    /// Returns a not-found error for unknown conversations or a database
    /// error.
    pub async fn conversation_history(
        &self,
        conversation_id: &str,
    ) -> AppResult<Vec<MessageRecord>> {
        chat::conversation_history(&self.database, conversation_id).await
    }

    // ========================================================================
    // Switching
    // ========================================================================

    /// Switch a conversation to a target provider/model
    ///
    /// # Errors
    ///
    /// See [`SwitchOrchestrator::switch_provider`].
    pub async fn switch_provider(
        &self,
        conversation_id: &str,
        provider: &str,
        model: &str,
        options: SwitchOptions,
    ) -> AppResult<crate::database::Conversation> {
        self.orchestrator
            .switch_provider(conversation_id, provider, model, options)
            .await
    }

    /// Try fallback candidates until one switch succeeds
    ///
    /// # Errors
    ///
    /// See [`SwitchOrchestrator::switch_with_fallback`].
    pub async fn switch_with_fallback(
        &self,
        conversation_id: &str,
        candidates: &[FallbackCandidate],
        options: SwitchOptions,
    ) -> AppResult<crate::database::Conversation> {
        self.orchestrator
            .switch_with_fallback(conversation_id, candidates, options)
            .await
    }

    // ========================================================================
    // History
    // ========================================================================

    /// Session timeline of a conversation
    ///
    /// # Errors
    ///
    /// Returns a not-found error for unknown conversations or a database
    /// error.
    pub async fn get_history(&self, conversation_id: &str) -> AppResult<Vec<ProviderSession>> {
        self.history.get_history(conversation_id).await
    }

    /// Query sessions across conversations with filters
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails.
    pub async fn query_history(&self, filter: &HistoryFilter) -> AppResult<Vec<ProviderSession>> {
        self.history.query(filter).await
    }

    /// Aggregate switch statistics, optionally scoped to one conversation
    ///
    /// # Errors
    ///
    /// Returns a database error if the aggregation fails.
    pub async fn get_provider_statistics(
        &self,
        conversation_id: Option<&str>,
    ) -> AppResult<ProviderStatistics> {
        self.history.get_statistics(conversation_id).await
    }

    /// Fleet-wide fallback rate
    ///
    /// # Errors
    ///
    /// Returns a database error if the aggregation fails.
    pub async fn get_fallback_analysis(&self) -> AppResult<FallbackAnalysis> {
        self.history.get_fallback_analysis().await
    }

    // ========================================================================
    // Cost and Pricing
    // ========================================================================

    /// Price an exchange and record it against the open session
    ///
    /// # Errors
    ///
    /// See [`CostTracker::track_message_cost`].
    pub async fn track_message_cost(
        &self,
        conversation_id: &str,
        message_id: Option<&str>,
        provider: &str,
        model: &str,
        usage: &TokenUsage,
    ) -> AppResult<CostRecord> {
        self.costs
            .track_message_cost(conversation_id, message_id, provider, model, usage)
            .await
    }

    /// Cross-provider cost analysis of a conversation
    ///
    /// # Errors
    ///
    /// Returns a not-found error for unknown conversations or a database
    /// error.
    pub async fn get_cost_analysis(&self, conversation_id: &str) -> AppResult<CostAnalysis> {
        self.costs.get_cost_analysis(conversation_id).await
    }

    /// Resolve pricing for a provider/model pair
    ///
    /// # Errors
    ///
    /// Returns a database error if the override lookup fails.
    pub async fn resolve_pricing(
        &self,
        provider: &str,
        model: &str,
    ) -> AppResult<PricingDescriptor> {
        self.resolver.resolve(provider, model).await
    }

    /// Calculate the cost of an exchange without recording it
    ///
    /// # Errors
    ///
    /// Returns a database error if pricing resolution fails.
    pub async fn calculate_cost(
        &self,
        provider: &str,
        model: &str,
        usage: &TokenUsage,
    ) -> AppResult<CostBreakdown> {
        self.resolver.calculate_cost(provider, model, usage).await
    }

    /// Compare what the given usage would cost across pairs, cheapest first
    ///
    /// # Errors
    ///
    /// Returns a database error if resolution fails for any pair.
    pub async fn compare_pricing(
        &self,
        pairs: &[(String, String)],
        usage: &TokenUsage,
    ) -> AppResult<Vec<PricingComparison>> {
        self.resolver.compare_pricing(pairs, usage).await
    }

    /// Store a pricing override, superseding any live one for the pair
    ///
    /// # Errors
    ///
    /// Returns a validation error listing every violation, or a database
    /// error.
    pub async fn store_pricing_override(
        &self,
        new: NewPricingOverride,
    ) -> AppResult<PricingOverrideRecord> {
        self.resolver.store_override(new).await
    }

    /// Override history for a pair, newest first
    ///
    /// # Errors
    ///
    /// Returns a database error if the lookup fails.
    pub async fn pricing_history(
        &self,
        provider: &str,
        model: &str,
    ) -> AppResult<Vec<PricingOverrideRecord>> {
        self.resolver.pricing_history(provider, model).await
    }
}
