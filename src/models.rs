// ABOUTME: Shared domain types for provider switching, pricing, and context planning
// ABOUTME: Defines switch records, context plans, pricing descriptors, and cost breakdowns
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright (c) 2025 Switchboard Contributors

//! # Domain Models
//!
//! Types shared across components. Persistence records (conversations,
//! messages, sessions) live next to their queries in [`crate::database`];
//! everything here is either embedded in conversation metadata as JSON or
//! passed between components by value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Provider Switching
// ============================================================================

/// How a provider session came to be opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchType {
    /// First binding of the conversation
    Initial,
    /// Explicit switch requested by the caller
    Manual,
    /// Automatic switch performed by the fallback orchestrator
    Fallback,
}

impl SwitchType {
    /// String form stored in the sessions table
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Manual => "manual",
            Self::Fallback => "fallback",
        }
    }

    /// Parse the stored string form
    #[must_use]
    pub fn parse_str(value: &str) -> Option<Self> {
        match value {
            "initial" => Some(Self::Initial),
            "manual" => Some(Self::Manual),
            "fallback" => Some(Self::Fallback),
            _ => None,
        }
    }
}

impl fmt::Display for SwitchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one switch attempt recorded in the conversation switch log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchStatus {
    /// The binding moved to the target
    Completed,
    /// The attempt failed; the binding did not change
    Failed,
}

/// One entry in a conversation's append-only switch log
///
/// Completed entries describe a binding transition; failed entries preserve
/// the per-candidate trail left behind by fallback switching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchRecord {
    /// Provider the conversation was bound to before the attempt, if any
    pub from_provider: Option<String>,
    /// Model the conversation was bound to before the attempt, if any
    pub from_model: Option<String>,
    /// Target provider of the attempt
    pub to_provider: String,
    /// Target model of the attempt
    pub to_model: String,
    /// How the switch was initiated
    pub switch_type: SwitchType,
    /// Whether the attempt committed
    pub status: SwitchStatus,
    /// Optional caller-supplied reason annotation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Error message for failed attempts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the attempt was recorded
    pub occurred_at: DateTime<Utc>,
}

impl SwitchRecord {
    /// Record for a committed switch
    #[must_use]
    pub fn completed(
        from: Option<(&str, &str)>,
        to_provider: &str,
        to_model: &str,
        switch_type: SwitchType,
        reason: Option<&str>,
    ) -> Self {
        Self {
            from_provider: from.map(|(p, _)| p.to_owned()),
            from_model: from.map(|(_, m)| m.to_owned()),
            to_provider: to_provider.to_owned(),
            to_model: to_model.to_owned(),
            switch_type,
            status: SwitchStatus::Completed,
            reason: reason.map(ToOwned::to_owned),
            error: None,
            occurred_at: Utc::now(),
        }
    }

    /// Record for an attempt that failed without changing the binding
    #[must_use]
    pub fn failed(
        from: Option<(&str, &str)>,
        to_provider: &str,
        to_model: &str,
        switch_type: SwitchType,
        error: &str,
    ) -> Self {
        Self {
            from_provider: from.map(|(p, _)| p.to_owned()),
            from_model: from.map(|(_, m)| m.to_owned()),
            to_provider: to_provider.to_owned(),
            to_model: to_model.to_owned(),
            switch_type,
            status: SwitchStatus::Failed,
            reason: None,
            error: Some(error.to_owned()),
            occurred_at: Utc::now(),
        }
    }
}

// ============================================================================
// Context Preservation
// ============================================================================

/// Carry-over strategy chosen by the context planner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStrategy {
    /// The entire history fits within the token budget
    FullCarry,
    /// Oldest non-system messages are dropped until the remainder fits
    TruncateOldest,
}

impl ContextStrategy {
    /// String form used in logs and metadata
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::FullCarry => "full_carry",
            Self::TruncateOldest => "truncate_oldest",
        }
    }
}

impl fmt::Display for ContextStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic plan describing which messages survive a provider switch
///
/// The plan stores counts rather than message ids: replay takes every system
/// message plus the history tail remaining after `dropped_messages` oldest
/// entries are skipped, so messages appended after the switch are always
/// included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPlan {
    /// Provider the plan was computed for
    pub target_provider: String,
    /// Model the plan was computed for
    pub target_model: String,
    /// Context window of the target model in tokens
    pub context_window: u32,
    /// Usable token budget after the safety margin
    pub token_budget: u64,
    /// Chosen carry-over strategy
    pub strategy: ContextStrategy,
    /// Stored messages selected for carry-over, system messages included
    pub preserved_messages: usize,
    /// Oldest non-system messages dropped to fit the budget
    pub dropped_messages: usize,
    /// Token total carried, the active system prompt included
    pub preserved_tokens: u64,
    /// Set when the system prompt alone exceeds the budget
    pub system_prompt_overflow: bool,
    /// When the plan was computed
    pub planned_at: DateTime<Utc>,
}

// ============================================================================
// Pricing
// ============================================================================

/// Billing granularity of a pricing descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingUnit {
    /// Rates are per 1,000 tokens
    Per1kTokens,
    /// Rates are per 1,000,000 tokens
    Per1mTokens,
    /// A flat rate per request, independent of token counts
    PerRequest,
}

impl PricingUnit {
    /// String form stored in the pricing table
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Per1kTokens => "per_1k_tokens",
            Self::Per1mTokens => "per_1m_tokens",
            Self::PerRequest => "per_request",
        }
    }

    /// Parse the stored string form
    #[must_use]
    pub fn parse_str(value: &str) -> Option<Self> {
        match value {
            "per_1k_tokens" => Some(Self::Per1kTokens),
            "per_1m_tokens" => Some(Self::Per1mTokens),
            "per_request" => Some(Self::PerRequest),
            _ => None,
        }
    }

    /// Tokens covered by one billing unit; `None` for flat per-request rates
    #[must_use]
    pub const fn tokens_per_unit(&self) -> Option<f64> {
        match self {
            Self::Per1kTokens => Some(crate::constants::pricing::TOKENS_PER_1K_UNIT),
            Self::Per1mTokens => Some(crate::constants::pricing::TOKENS_PER_1M_UNIT),
            Self::PerRequest => None,
        }
    }
}

impl fmt::Display for PricingUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How usage of a provider is billed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingModel {
    /// Metered billing per token or per request
    PayPerUse,
    /// Usage covered by a subscription or local hardware
    SubscriptionIncluded,
}

impl BillingModel {
    /// String form stored in the pricing table
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PayPerUse => "pay_per_use",
            Self::SubscriptionIncluded => "subscription_included",
        }
    }

    /// Parse the stored string form
    #[must_use]
    pub fn parse_str(value: &str) -> Option<Self> {
        match value {
            "pay_per_use" => Some(Self::PayPerUse),
            "subscription_included" => Some(Self::SubscriptionIncluded),
            _ => None,
        }
    }
}

/// Which tier of the pricing resolution chain produced a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingSource {
    /// Operator-stored override, the highest-precedence tier
    StoredOverride,
    /// Static default shipped with the provider driver
    DriverDefault,
    /// Conservative universal fallback rates
    UniversalFallback,
}

impl PricingSource {
    /// String form stored alongside cost records
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::StoredOverride => "stored_override",
            Self::DriverDefault => "driver_default",
            Self::UniversalFallback => "universal_fallback",
        }
    }

    /// Parse the stored string form
    #[must_use]
    pub fn parse_str(value: &str) -> Option<Self> {
        match value {
            "stored_override" => Some(Self::StoredOverride),
            "driver_default" => Some(Self::DriverDefault),
            "universal_fallback" => Some(Self::UniversalFallback),
            _ => None,
        }
    }
}

impl fmt::Display for PricingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved pricing for one provider/model pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingDescriptor {
    /// Provider name
    pub provider: String,
    /// Model identifier
    pub model: String,
    /// Input (prompt) rate per billing unit
    pub input_rate: f64,
    /// Output (completion) rate per billing unit
    pub output_rate: f64,
    /// Flat rate charged per request when `unit` is per-request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flat_rate: Option<f64>,
    /// Billing granularity of the rates
    pub unit: PricingUnit,
    /// ISO 4217 currency code
    pub currency: String,
    /// How usage is billed
    pub billing_model: BillingModel,
    /// When this pricing took effect
    pub effective_at: DateTime<Utc>,
    /// Resolution tier that produced this descriptor
    pub source: PricingSource,
}

// ============================================================================
// Cost Attribution
// ============================================================================

/// Cost of one exchange, itemized by direction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostBreakdown {
    /// Provider that served the exchange
    pub provider: String,
    /// Model that served the exchange
    pub model: String,
    /// Prompt tokens consumed
    pub input_tokens: u32,
    /// Completion tokens generated
    pub output_tokens: u32,
    /// Cost attributed to prompt tokens
    pub input_cost: f64,
    /// Cost attributed to completion tokens
    pub output_cost: f64,
    /// Sum of input and output cost, or the flat rate for per-request billing
    pub total_cost: f64,
    /// Currency of all amounts
    pub currency: String,
    /// Resolution tier backing the rates used
    pub pricing_source: PricingSource,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_type_round_trips_through_strings() {
        for ty in [SwitchType::Initial, SwitchType::Manual, SwitchType::Fallback] {
            assert_eq!(SwitchType::parse_str(ty.as_str()), Some(ty));
        }
        assert_eq!(SwitchType::parse_str("bogus"), None);
    }

    #[test]
    fn pricing_unit_token_coverage() {
        assert_eq!(PricingUnit::Per1kTokens.tokens_per_unit(), Some(1_000.0));
        assert_eq!(PricingUnit::Per1mTokens.tokens_per_unit(), Some(1_000_000.0));
        assert_eq!(PricingUnit::PerRequest.tokens_per_unit(), None);
    }

    #[test]
    fn failed_switch_record_keeps_previous_binding() {
        let record = SwitchRecord::failed(
            Some(("openai", "gpt-4o")),
            "xai",
            "grok-3",
            SwitchType::Fallback,
            "connection refused",
        );
        assert_eq!(record.status, SwitchStatus::Failed);
        assert_eq!(record.from_provider.as_deref(), Some("openai"));
        assert_eq!(record.to_provider, "xai");
        assert!(record.error.is_some());
    }

    #[test]
    fn switch_record_serializes_without_empty_fields() {
        let record = SwitchRecord::completed(None, "gemini", "gemini-2.5-flash", SwitchType::Initial, None);
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("reason").is_none());
        assert!(json.get("error").is_none());
        assert_eq!(json["switch_type"], "initial");
        assert_eq!(json["status"], "completed");
    }
}
