// ABOUTME: Pricing resolution with override, driver default, and universal fallback tiers
// ABOUTME: Calculates exchange costs and normalizes rates for cross-provider comparison
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Switchboard Contributors

//! # Pricing Resolver
//!
//! Resolves the billing rates for any provider/model pair through a fixed
//! precedence chain: an operator-stored override wins, then the static
//! default shipped with the provider driver, then a conservative universal
//! fallback so cost tracking never fails on an unknown model.
//!
//! Resolutions are cached per pair; storing an override invalidates the
//! cached entry before the call returns.

use crate::constants::pricing::{
    CURRENCY_DECIMAL_PLACES, SUPPORTED_CURRENCIES, UNIVERSAL_FALLBACK_CURRENCY,
    UNIVERSAL_FALLBACK_INPUT_RATE, UNIVERSAL_FALLBACK_OUTPUT_RATE,
};
use crate::database::{Database, NewPricingOverride, PricingOverrideRecord};
use crate::errors::{AppError, AppResult};
use crate::models::{
    BillingModel, CostBreakdown, PricingDescriptor, PricingSource, PricingUnit,
};
use crate::providers::{ProviderRegistry, TokenUsage};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Round a currency amount to the fixed decimal precision
#[must_use]
pub(crate) fn round_currency(value: f64) -> f64 {
    let factor = 10_f64.powi(CURRENCY_DECIMAL_PLACES);
    (value * factor).round() / factor
}

/// One provider/model entry in a cross-provider pricing comparison
///
/// Rates are normalized to a per-1K-token basis regardless of the unit the
/// descriptor was expressed in, so entries read on a common scale. The sort
/// key is the projected cost of the usage the comparison was computed for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingComparison {
    /// Provider name
    pub provider: String,
    /// Model identifier
    pub model: String,
    /// Input rate normalized to per 1K tokens
    pub input_rate_per_1k: f64,
    /// Output rate normalized to per 1K tokens
    pub output_rate_per_1k: f64,
    /// Flat per-request charge, if any
    pub flat_rate: Option<f64>,
    /// Total cost of the compared usage at these rates; the sort key
    pub projected_cost: f64,
    /// Currency of all amounts
    pub currency: String,
    /// How usage is billed
    pub billing_model: BillingModel,
    /// Resolution tier that produced the rates
    pub source: PricingSource,
}

/// Resolves pricing through the override, driver default, and fallback tiers
#[derive(Clone)]
pub struct PricingResolver {
    database: Database,
    registry: Arc<ProviderRegistry>,
    cache: Arc<DashMap<(String, String), PricingDescriptor>>,
}

impl PricingResolver {
    /// Create a resolver over the given database and provider registry
    #[must_use]
    pub fn new(database: Database, registry: Arc<ProviderRegistry>) -> Self {
        Self {
            database,
            registry,
            cache: Arc::new(DashMap::new()),
        }
    }

    /// Resolve pricing for a provider/model pair
    ///
    /// Never fails to produce a descriptor for pricing reasons: an unknown
    /// pair resolves to the universal fallback rates so callers can always
    /// attribute a cost.
    ///
    /// # Errors
    ///
    /// Returns an error if the override lookup fails or a stored override
    /// cannot be parsed.
    pub async fn resolve(&self, provider: &str, model: &str) -> AppResult<PricingDescriptor> {
        let key = (provider.to_owned(), model.to_owned());
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.clone());
        }

        let descriptor = self.resolve_uncached(provider, model).await?;
        debug!(
            "Resolved pricing for {provider}/{model} from {}",
            descriptor.source
        );
        self.cache.insert(key, descriptor.clone());
        Ok(descriptor)
    }

    async fn resolve_uncached(&self, provider: &str, model: &str) -> AppResult<PricingDescriptor> {
        if let Some(record) = self.database.get_pricing_override(provider, model).await? {
            return record.to_descriptor();
        }

        if let Some(descriptor) = self
            .registry
            .get(provider)
            .and_then(|p| p.default_pricing(model))
        {
            return Ok(descriptor);
        }

        Ok(Self::universal_fallback(provider, model))
    }

    /// Conservative rates applied when no override or driver default exists
    fn universal_fallback(provider: &str, model: &str) -> PricingDescriptor {
        PricingDescriptor {
            provider: provider.to_owned(),
            model: model.to_owned(),
            input_rate: UNIVERSAL_FALLBACK_INPUT_RATE,
            output_rate: UNIVERSAL_FALLBACK_OUTPUT_RATE,
            flat_rate: None,
            unit: PricingUnit::Per1kTokens,
            currency: UNIVERSAL_FALLBACK_CURRENCY.to_owned(),
            billing_model: BillingModel::PayPerUse,
            effective_at: chrono::Utc::now(),
            source: PricingSource::UniversalFallback,
        }
    }

    /// Store a pricing override, retiring any live one for the pair
    ///
    /// The cached resolution for the pair is invalidated before this
    /// returns, so the next resolve sees the new rates.
    ///
    /// # Errors
    ///
    /// Returns a validation error listing every violation if the override is
    /// malformed, or a database error if the store fails.
    pub async fn store_override(
        &self,
        new: NewPricingOverride,
    ) -> AppResult<PricingOverrideRecord> {
        let violations = validate_override(&new);
        if !violations.is_empty() {
            return Err(AppError::validation(violations));
        }

        let record = self.database.store_pricing_override(&new).await?;
        self.cache.remove(&(new.provider.clone(), new.model.clone()));
        debug!(
            "Stored pricing override for {}/{} ({} {})",
            new.provider,
            new.model,
            new.currency,
            new.unit.as_str()
        );
        Ok(record)
    }

    /// List every override ever stored for a pair, newest first
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn pricing_history(
        &self,
        provider: &str,
        model: &str,
    ) -> AppResult<Vec<PricingOverrideRecord>> {
        self.database.list_pricing_history(provider, model).await
    }

    /// Calculate the itemized cost of one exchange
    ///
    /// Token-unit pricing scales each direction by its rate; per-request
    /// pricing charges the flat rate once regardless of token counts. All
    /// amounts are rounded to the fixed currency precision.
    ///
    /// # Errors
    ///
    /// Returns an error if pricing resolution fails.
    pub async fn calculate_cost(
        &self,
        provider: &str,
        model: &str,
        usage: &TokenUsage,
    ) -> AppResult<CostBreakdown> {
        let pricing = self.resolve(provider, model).await?;
        let (input_cost, output_cost, total_cost) = cost_components(&pricing, usage);

        Ok(CostBreakdown {
            provider: provider.to_owned(),
            model: model.to_owned(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            input_cost,
            output_cost,
            total_cost,
            currency: pricing.currency,
            pricing_source: pricing.source,
        })
    }

    /// Compare what the given usage would cost across provider/model pairs
    ///
    /// Entries are sorted cheapest-first by projected cost; ties fall back
    /// to provider name then model so the ranking is deterministic.
    ///
    /// # Errors
    ///
    /// Returns an error if resolution fails for any pair.
    pub async fn compare_pricing(
        &self,
        pairs: &[(String, String)],
        usage: &TokenUsage,
    ) -> AppResult<Vec<PricingComparison>> {
        let mut comparisons = Vec::with_capacity(pairs.len());
        for (provider, model) in pairs {
            let descriptor = self.resolve(provider, model).await?;
            comparisons.push(comparison_entry(&descriptor, usage));
        }
        comparisons.sort_by(|a, b| {
            a.projected_cost
                .total_cmp(&b.projected_cost)
                .then_with(|| a.provider.cmp(&b.provider))
                .then_with(|| a.model.cmp(&b.model))
        });
        Ok(comparisons)
    }
}

/// Itemize the cost of one exchange at the given rates
///
/// Token-unit pricing scales each direction by its rate; per-request
/// pricing charges the flat rate once regardless of token counts. Each
/// component is rounded to the fixed currency precision.
fn cost_components(pricing: &PricingDescriptor, usage: &TokenUsage) -> (f64, f64, f64) {
    match pricing.unit.tokens_per_unit() {
        Some(tokens_per_unit) => {
            let input = round_currency(
                f64::from(usage.input_tokens) / tokens_per_unit * pricing.input_rate,
            );
            let output = round_currency(
                f64::from(usage.output_tokens) / tokens_per_unit * pricing.output_rate,
            );
            (input, output, round_currency(input + output))
        }
        None => {
            let flat = round_currency(pricing.flat_rate.unwrap_or(0.0));
            (0.0, 0.0, flat)
        }
    }
}

/// Build a comparison entry from a resolved descriptor and the compared usage
fn comparison_entry(descriptor: &PricingDescriptor, usage: &TokenUsage) -> PricingComparison {
    let per_1k = normalize_pricing(descriptor, PricingUnit::Per1kTokens);
    let (_, _, projected_cost) = cost_components(descriptor, usage);

    PricingComparison {
        provider: descriptor.provider.clone(),
        model: descriptor.model.clone(),
        input_rate_per_1k: per_1k.input_rate,
        output_rate_per_1k: per_1k.output_rate,
        flat_rate: descriptor.flat_rate,
        projected_cost,
        currency: descriptor.currency.clone(),
        billing_model: descriptor.billing_model,
        source: descriptor.source,
    }
}

/// Convert a descriptor's rates to a different billing unit
///
/// Pure conversion: the input descriptor is never mutated and per-request
/// descriptors are returned unchanged, since a flat rate has no per-token
/// equivalent.
#[must_use]
pub fn normalize_pricing(
    descriptor: &PricingDescriptor,
    target_unit: PricingUnit,
) -> PricingDescriptor {
    let mut normalized = descriptor.clone();
    if descriptor.unit == target_unit {
        return normalized;
    }
    if let (Some(source_tokens), Some(target_tokens)) = (
        descriptor.unit.tokens_per_unit(),
        target_unit.tokens_per_unit(),
    ) {
        let scale = target_tokens / source_tokens;
        normalized.input_rate = descriptor.input_rate * scale;
        normalized.output_rate = descriptor.output_rate * scale;
        normalized.unit = target_unit;
    }
    normalized
}

/// Collect every violation in an override so callers see them all at once
fn validate_override(new: &NewPricingOverride) -> Vec<String> {
    let mut violations = Vec::new();

    if new.provider.trim().is_empty() {
        violations.push("provider must not be empty".to_owned());
    }
    if new.model.trim().is_empty() {
        violations.push("model must not be empty".to_owned());
    }
    if !new.input_rate.is_finite() || new.input_rate < 0.0 {
        violations.push(format!(
            "input_rate must be a non-negative finite number, got {}",
            new.input_rate
        ));
    }
    if !new.output_rate.is_finite() || new.output_rate < 0.0 {
        violations.push(format!(
            "output_rate must be a non-negative finite number, got {}",
            new.output_rate
        ));
    }
    if !SUPPORTED_CURRENCIES.contains(&new.currency.as_str()) {
        violations.push(format!(
            "currency '{}' is not supported (supported: {})",
            new.currency,
            SUPPORTED_CURRENCIES.join(", ")
        ));
    }
    match (new.unit, new.flat_rate) {
        (PricingUnit::PerRequest, None) => {
            violations.push("flat_rate is required for per-request pricing".to_owned());
        }
        (PricingUnit::PerRequest, Some(rate)) if !rate.is_finite() || rate < 0.0 => {
            violations.push(format!(
                "flat_rate must be a non-negative finite number, got {rate}"
            ));
        }
        (PricingUnit::Per1kTokens | PricingUnit::Per1mTokens, Some(_)) => {
            violations.push("flat_rate is only valid for per-request pricing".to_owned());
        }
        _ => {}
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::OpenAiProvider;

    async fn resolver_with_openai() -> PricingResolver {
        let database = Database::new("sqlite::memory:").await.unwrap();
        let mut registry = ProviderRegistry::new();
        registry.register(Box::new(OpenAiProvider::new("sk-test".to_owned(), None)));
        PricingResolver::new(database, Arc::new(registry))
    }

    fn override_for(provider: &str, model: &str) -> NewPricingOverride {
        NewPricingOverride {
            provider: provider.to_owned(),
            model: model.to_owned(),
            input_rate: 0.004,
            output_rate: 0.012,
            flat_rate: None,
            unit: PricingUnit::Per1kTokens,
            currency: "USD".to_owned(),
            billing_model: BillingModel::PayPerUse,
            effective_at: None,
        }
    }

    #[tokio::test]
    async fn resolves_driver_default_when_no_override_exists() {
        let resolver = resolver_with_openai().await;

        let pricing = resolver.resolve("openai", "gpt-4o").await.unwrap();
        assert_eq!(pricing.source, PricingSource::DriverDefault);
        assert_eq!(pricing.unit, PricingUnit::Per1mTokens);
        assert!((pricing.input_rate - 2.50).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn unknown_model_falls_back_to_universal_rates() {
        let resolver = resolver_with_openai().await;

        let pricing = resolver.resolve("openai", "gpt-99-turbo").await.unwrap();
        assert_eq!(pricing.source, PricingSource::UniversalFallback);
        assert!((pricing.input_rate - UNIVERSAL_FALLBACK_INPUT_RATE).abs() < f64::EPSILON);
        assert!((pricing.output_rate - UNIVERSAL_FALLBACK_OUTPUT_RATE).abs() < f64::EPSILON);
        assert_eq!(pricing.currency, UNIVERSAL_FALLBACK_CURRENCY);
    }

    #[tokio::test]
    async fn stored_override_wins_and_invalidates_the_cache() {
        let resolver = resolver_with_openai().await;

        // Warm the cache with the driver default first
        let before = resolver.resolve("openai", "gpt-4o").await.unwrap();
        assert_eq!(before.source, PricingSource::DriverDefault);

        resolver
            .store_override(override_for("openai", "gpt-4o"))
            .await
            .unwrap();

        let after = resolver.resolve("openai", "gpt-4o").await.unwrap();
        assert_eq!(after.source, PricingSource::StoredOverride);
        assert!((after.input_rate - 0.004).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn invalid_override_reports_every_violation() {
        let resolver = resolver_with_openai().await;

        let bad = NewPricingOverride {
            provider: String::new(),
            model: "gpt-4o".to_owned(),
            input_rate: -1.0,
            output_rate: f64::NAN,
            flat_rate: None,
            unit: PricingUnit::PerRequest,
            currency: "JPY".to_owned(),
            billing_model: BillingModel::PayPerUse,
            effective_at: None,
        };

        let err = resolver.store_override(bad).await.unwrap_err();
        let details = err.details.expect("validation details");
        let violations = details["violations"].as_array().unwrap();
        assert_eq!(violations.len(), 5);
    }

    #[tokio::test]
    async fn calculates_per_million_costs_with_rounding() {
        let resolver = resolver_with_openai().await;

        let usage = TokenUsage::new(1_000, 500);
        let breakdown = resolver
            .calculate_cost("openai", "gpt-4o", &usage)
            .await
            .unwrap();

        // gpt-4o: 2.50 / 10.00 per 1M tokens
        assert!((breakdown.input_cost - 0.0025).abs() < 1e-9);
        assert!((breakdown.output_cost - 0.005).abs() < 1e-9);
        assert!((breakdown.total_cost - 0.0075).abs() < 1e-9);
        assert_eq!(breakdown.pricing_source, PricingSource::DriverDefault);
    }

    #[tokio::test]
    async fn per_request_pricing_charges_the_flat_rate() {
        let resolver = resolver_with_openai().await;

        let mut flat = override_for("acme", "fixed-price");
        flat.unit = PricingUnit::PerRequest;
        flat.flat_rate = Some(0.01);
        flat.input_rate = 0.0;
        flat.output_rate = 0.0;
        resolver.store_override(flat).await.unwrap();

        let breakdown = resolver
            .calculate_cost("acme", "fixed-price", &TokenUsage::new(50_000, 9_000))
            .await
            .unwrap();
        assert!((breakdown.total_cost - 0.01).abs() < f64::EPSILON);
        assert!(breakdown.input_cost.abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn comparison_ranks_by_projected_cost() {
        let resolver = resolver_with_openai().await;

        let pairs = vec![
            ("openai".to_owned(), "gpt-4o".to_owned()),
            ("openai".to_owned(), "gpt-4o-mini".to_owned()),
        ];
        let usage = TokenUsage::new(1_000, 1_000);
        let ranked = resolver.compare_pricing(&pairs, &usage).await.unwrap();

        assert_eq!(ranked[0].model, "gpt-4o-mini");
        // 2.50 per 1M input normalizes to 0.0025 per 1K
        assert!((ranked[1].input_rate_per_1k - 0.0025).abs() < 1e-9);
        // gpt-4o at 2.50 / 10.00 per 1M costs 0.0125 for 1K in, 1K out
        assert!((ranked[1].projected_cost - 0.0125).abs() < 1e-9);
        assert!(ranked[0].projected_cost <= ranked[1].projected_cost);
    }

    #[tokio::test]
    async fn comparison_breaks_cost_ties_by_provider_name() {
        let resolver = resolver_with_openai().await;

        // Both unknown pairs land on identical universal fallback rates
        let pairs = vec![
            ("zeta".to_owned(), "z-1".to_owned()),
            ("acme".to_owned(), "a-1".to_owned()),
        ];
        let usage = TokenUsage::new(500, 500);
        let ranked = resolver.compare_pricing(&pairs, &usage).await.unwrap();

        assert_eq!(ranked[0].provider, "acme");
        assert_eq!(ranked[1].provider, "zeta");
        assert!((ranked[0].projected_cost - ranked[1].projected_cost).abs() < f64::EPSILON);
    }

    #[test]
    fn unit_conversion_scales_rates_without_mutation() {
        let descriptor = PricingDescriptor {
            provider: "openai".to_owned(),
            model: "gpt-4o".to_owned(),
            input_rate: 0.005,
            output_rate: 0.015,
            flat_rate: None,
            unit: PricingUnit::Per1kTokens,
            currency: "USD".to_owned(),
            billing_model: BillingModel::PayPerUse,
            effective_at: chrono::Utc::now(),
            source: PricingSource::DriverDefault,
        };

        let per_1m = normalize_pricing(&descriptor, PricingUnit::Per1mTokens);
        assert_eq!(per_1m.unit, PricingUnit::Per1mTokens);
        assert!((per_1m.input_rate - 5.0).abs() < 1e-9);
        assert!((per_1m.output_rate - 15.0).abs() < 1e-9);
        // The source descriptor keeps its original unit and rates
        assert_eq!(descriptor.unit, PricingUnit::Per1kTokens);
        assert!((descriptor.input_rate - 0.005).abs() < f64::EPSILON);
    }

    #[test]
    fn per_request_descriptors_are_not_converted() {
        let descriptor = PricingDescriptor {
            provider: "acme".to_owned(),
            model: "fixed".to_owned(),
            input_rate: 0.0,
            output_rate: 0.0,
            flat_rate: Some(0.02),
            unit: PricingUnit::PerRequest,
            currency: "USD".to_owned(),
            billing_model: BillingModel::PayPerUse,
            effective_at: chrono::Utc::now(),
            source: PricingSource::StoredOverride,
        };

        let converted = normalize_pricing(&descriptor, PricingUnit::Per1kTokens);
        assert_eq!(converted.unit, PricingUnit::PerRequest);
        assert!((converted.flat_rate.unwrap() - 0.02).abs() < f64::EPSILON);
    }

    #[test]
    fn rounding_clamps_to_six_decimal_places() {
        assert!((round_currency(0.123_456_789) - 0.123_457).abs() < f64::EPSILON);
        assert!((round_currency(0.000_000_4) - 0.0).abs() < f64::EPSILON);
    }
}
