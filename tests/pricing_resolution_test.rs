// ABOUTME: Integration tests for pricing resolution, overrides, and comparison
// ABOUTME: Validates the override, driver default, and universal fallback tiers through the gateway
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Switchboard Contributors

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]
#![allow(clippy::float_cmp)]

use switchboard::database::NewPricingOverride;
use switchboard::errors::ErrorCode;
use switchboard::models::{BillingModel, PricingSource, PricingUnit};
use switchboard::providers::TokenUsage;

mod common;
use common::{create_test_gateway, ScriptedProvider};

fn override_for(provider: &str, model: &str, input_rate: f64, output_rate: f64) -> NewPricingOverride {
    NewPricingOverride {
        provider: provider.to_owned(),
        model: model.to_owned(),
        input_rate,
        output_rate,
        flat_rate: None,
        unit: PricingUnit::Per1kTokens,
        currency: "USD".to_owned(),
        billing_model: BillingModel::PayPerUse,
        effective_at: None,
    }
}

#[tokio::test]
async fn resolution_prefers_override_then_driver_then_universal() {
    let gateway = create_test_gateway(vec![
        ScriptedProvider::up("alpha", "alpha-1").with_pricing(0.5, 1.0),
        ScriptedProvider::up("beta", "beta-9"),
    ])
    .await;

    // No driver default and no override resolves to the universal tier
    let universal = gateway.resolve_pricing("beta", "beta-9").await.unwrap();
    assert_eq!(universal.source, PricingSource::UniversalFallback);
    assert_eq!(universal.input_rate, 0.001);
    assert_eq!(universal.output_rate, 0.002);
    assert_eq!(universal.currency, "USD");
    assert_eq!(universal.unit, PricingUnit::Per1kTokens);

    // The driver catalog beats the universal tier
    let driver = gateway.resolve_pricing("alpha", "alpha-1").await.unwrap();
    assert_eq!(driver.source, PricingSource::DriverDefault);
    assert_eq!(driver.input_rate, 0.5);

    // A stored override beats both, taking effect immediately
    gateway
        .store_pricing_override(override_for("alpha", "alpha-1", 0.25, 0.5))
        .await
        .unwrap();
    let overridden = gateway.resolve_pricing("alpha", "alpha-1").await.unwrap();
    assert_eq!(overridden.source, PricingSource::StoredOverride);
    assert_eq!(overridden.input_rate, 0.25);
    assert_eq!(overridden.output_rate, 0.5);
}

#[tokio::test]
async fn unregistered_providers_fall_back_to_universal_rates() {
    let gateway = create_test_gateway(vec![ScriptedProvider::up("alpha", "alpha-1")]).await;

    let resolved = gateway.resolve_pricing("ghost", "ghost-1").await.unwrap();
    assert_eq!(resolved.source, PricingSource::UniversalFallback);
    assert_eq!(resolved.provider, "ghost");
    assert_eq!(resolved.model, "ghost-1");
}

#[tokio::test]
async fn invalid_overrides_report_each_violation() {
    let gateway = create_test_gateway(vec![ScriptedProvider::up("alpha", "alpha-1")]).await;

    let mut bad = override_for("", "alpha-1", -1.0, 0.5);
    bad.currency = "DOGE".to_owned();
    let err = gateway.store_pricing_override(bad).await.unwrap_err();

    assert_eq!(err.code, ErrorCode::InvalidInput);
    let violations = err.details.unwrap()["violations"].clone();
    assert_eq!(violations.as_array().unwrap().len(), 3);

    // Nothing was stored
    assert!(gateway
        .database()
        .get_pricing_override("", "alpha-1")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn calculate_cost_uses_live_overrides() {
    let gateway = create_test_gateway(vec![ScriptedProvider::up("alpha", "alpha-1")]).await;
    gateway
        .store_pricing_override(override_for("alpha", "alpha-1", 0.5, 1.0))
        .await
        .unwrap();

    let breakdown = gateway
        .calculate_cost("alpha", "alpha-1", &TokenUsage::new(2_000, 1_000))
        .await
        .unwrap();

    assert!((breakdown.input_cost - 1.0).abs() < 1e-9);
    assert!((breakdown.output_cost - 1.0).abs() < 1e-9);
    assert!((breakdown.total_cost - 2.0).abs() < 1e-9);
    assert_eq!(breakdown.currency, "USD");
    assert_eq!(breakdown.pricing_source, PricingSource::StoredOverride);
}

#[tokio::test]
async fn comparison_ranks_pairs_cheapest_first() {
    let gateway = create_test_gateway(vec![
        ScriptedProvider::up("alpha", "alpha-1").with_pricing(0.5, 1.0),
        ScriptedProvider::up("beta", "beta-9").with_pricing(0.1, 0.2),
    ])
    .await;

    let ranked = gateway
        .compare_pricing(
            &[
                ("alpha".to_owned(), "alpha-1".to_owned()),
                ("beta".to_owned(), "beta-9".to_owned()),
                ("ghost".to_owned(), "ghost-1".to_owned()),
            ],
            &TokenUsage::new(1_000, 1_000),
        )
        .await
        .unwrap();

    let order: Vec<&str> = ranked.iter().map(|c| c.provider.as_str()).collect();
    assert_eq!(order, vec!["ghost", "beta", "alpha"]);
    assert!((ranked[0].projected_cost - 0.003).abs() < 1e-9);
    assert!((ranked[1].projected_cost - 0.3).abs() < 1e-9);
    assert!((ranked[2].projected_cost - 1.5).abs() < 1e-9);
}

#[tokio::test]
async fn override_history_tracks_supersession() {
    let gateway = create_test_gateway(vec![ScriptedProvider::up("alpha", "alpha-1")]).await;

    gateway
        .store_pricing_override(override_for("alpha", "alpha-1", 0.5, 1.0))
        .await
        .unwrap();
    gateway
        .store_pricing_override(override_for("alpha", "alpha-1", 0.4, 0.8))
        .await
        .unwrap();

    let history = gateway.pricing_history("alpha", "alpha-1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].input_rate, 0.4);
    assert!(history[0].retired_at.is_none());
    assert_eq!(history[1].input_rate, 0.5);
    assert!(history[1].retired_at.is_some());
}
