// ABOUTME: Integration tests for database persistence across all tables
// ABOUTME: Validates conversations, messages, sessions, cost records, and pricing overrides
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Switchboard Contributors

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]
#![allow(clippy::float_cmp)]

use chrono::Utc;
use switchboard::database::{
    Conversation, Database, NewConversation, NewCostRecord, NewPricingOverride,
};
use switchboard::errors::ErrorCode;
use switchboard::models::{
    BillingModel, ContextPlan, ContextStrategy, CostBreakdown, PricingSource, PricingUnit,
    SwitchRecord, SwitchStatus, SwitchType,
};
use switchboard::providers::MessageRole;

/// Create a test database instance
///
/// Each in-memory connection gets its own isolated instance.
async fn create_test_db() -> Database {
    Database::new("sqlite::memory:").await.unwrap()
}

async fn seed_conversation(database: &Database) -> Conversation {
    database
        .create_conversation(&NewConversation {
            title: "Persistence test".to_owned(),
            provider: "alpha".to_owned(),
            model: "alpha-1".to_owned(),
            system_prompt: Some("be brief".to_owned()),
        })
        .await
        .unwrap()
}

fn sample_breakdown(provider: &str, model: &str, total: f64) -> CostBreakdown {
    CostBreakdown {
        provider: provider.to_owned(),
        model: model.to_owned(),
        input_tokens: 1_000,
        output_tokens: 500,
        input_cost: total / 2.0,
        output_cost: total / 2.0,
        total_cost: total,
        currency: "USD".to_owned(),
        pricing_source: PricingSource::UniversalFallback,
    }
}

#[tokio::test]
async fn conversation_round_trip_preserves_fields() {
    let database = create_test_db().await;
    let created = seed_conversation(&database).await;

    let fetched = database
        .get_conversation(&created.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.title, "Persistence test");
    assert_eq!(fetched.provider, "alpha");
    assert_eq!(fetched.model, "alpha-1");
    assert_eq!(fetched.system_prompt.as_deref(), Some("be brief"));
    assert_eq!(fetched.total_cost, 0.0);
    assert_eq!(fetched.message_count, 0);
    assert!(fetched.switch_log.is_empty());
    assert!(fetched.context_plan.is_none());

    assert!(database
        .get_conversation("missing-id")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn listing_orders_by_recent_activity() {
    let database = create_test_db().await;
    let first = seed_conversation(&database).await;
    let second = seed_conversation(&database).await;

    // Appending bumps updated_at, so the older conversation moves back up.
    database
        .append_message(&first.id, MessageRole::User, "hello", None)
        .await
        .unwrap();

    let listed = database.list_conversations(10).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, first.id);
    assert_eq!(listed[1].id, second.id);

    let limited = database.list_conversations(1).await.unwrap();
    assert_eq!(limited.len(), 1);
}

#[tokio::test]
async fn deleting_a_conversation_cascades_to_messages() {
    let database = create_test_db().await;
    let conversation = seed_conversation(&database).await;
    database
        .append_message(&conversation.id, MessageRole::User, "one", None)
        .await
        .unwrap();
    database
        .append_message(&conversation.id, MessageRole::Assistant, "two", None)
        .await
        .unwrap();

    assert!(database.delete_conversation(&conversation.id).await.unwrap());
    assert!(database
        .get_conversation(&conversation.id)
        .await
        .unwrap()
        .is_none());
    assert!(database
        .get_messages(&conversation.id)
        .await
        .unwrap()
        .is_empty());

    // Second delete finds nothing to remove
    assert!(!database.delete_conversation(&conversation.id).await.unwrap());
}

#[tokio::test]
async fn message_sequences_are_dense_and_counted() {
    let database = create_test_db().await;
    let conversation = seed_conversation(&database).await;

    for content in ["first", "second", "third"] {
        database
            .append_message(&conversation.id, MessageRole::User, content, Some(12))
            .await
            .unwrap();
    }

    let messages = database.get_messages(&conversation.id).await.unwrap();
    let sequences: Vec<i64> = messages.iter().map(|m| m.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert!(messages.iter().all(|m| m.token_count == Some(12)));

    let refreshed = database
        .get_conversation(&conversation.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.message_count, 3);
}

#[tokio::test]
async fn appending_to_an_unknown_conversation_is_not_found() {
    let database = create_test_db().await;

    let err = database
        .append_message("missing-id", MessageRole::User, "hello", None)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ResourceNotFound);
}

#[tokio::test]
async fn starting_a_session_closes_the_predecessor_with_snapshots() {
    let database = create_test_db().await;
    let conversation = seed_conversation(&database).await;

    let initial = database
        .start_session(&conversation, "alpha", "alpha-1", SwitchType::Initial, None)
        .await
        .unwrap();
    assert!(initial.is_open());
    assert_eq!(initial.message_count_at_start, 0);

    database
        .append_message(&conversation.id, MessageRole::User, "hello", None)
        .await
        .unwrap();
    let refreshed = database
        .get_conversation(&conversation.id)
        .await
        .unwrap()
        .unwrap();

    let manual = database
        .start_session(
            &refreshed,
            "beta",
            "beta-9",
            SwitchType::Manual,
            Some("trying beta"),
        )
        .await
        .unwrap();
    assert!(manual.is_open());
    assert_eq!(manual.message_count_at_start, 1);

    let sessions = database.list_sessions(&conversation.id).await.unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].id, initial.id);
    assert!(!sessions[0].is_open());
    assert_eq!(sessions[0].message_count_at_end, Some(1));
    assert_eq!(sessions[0].cost_at_end, Some(0.0));

    let open = database
        .get_open_session(&conversation.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(open.id, manual.id);
    assert_eq!(open.switch_type, "manual");
    assert_eq!(open.reason.as_deref(), Some("trying beta"));
}

#[tokio::test]
async fn recording_a_switch_commits_binding_log_and_plan_together() {
    let database = create_test_db().await;
    let conversation = seed_conversation(&database).await;

    let plan = ContextPlan {
        target_provider: "beta".to_owned(),
        target_model: "beta-9".to_owned(),
        context_window: 8_192,
        token_budget: 7_372,
        strategy: ContextStrategy::FullCarry,
        preserved_messages: 2,
        dropped_messages: 0,
        preserved_tokens: 80,
        system_prompt_overflow: false,
        planned_at: Utc::now(),
    };
    let record = SwitchRecord::completed(
        Some(("alpha", "alpha-1")),
        "beta",
        "beta-9",
        SwitchType::Manual,
        Some("latency"),
    );

    let updated = database
        .record_provider_switch(&conversation, &record, Some(&plan))
        .await
        .unwrap();

    assert_eq!(updated.provider, "beta");
    assert_eq!(updated.model, "beta-9");
    assert_eq!(updated.switch_log.len(), 1);
    assert_eq!(updated.switch_log[0].status, SwitchStatus::Completed);
    assert_eq!(updated.switch_log[0].reason.as_deref(), Some("latency"));
    let stored_plan = updated.context_plan.unwrap();
    assert_eq!(stored_plan.strategy, ContextStrategy::FullCarry);
    assert_eq!(stored_plan.preserved_messages, 2);

    let sessions = database.list_sessions(&conversation.id).await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].is_open());
    assert_eq!(sessions[0].provider, "beta");
    assert_eq!(sessions[0].switch_type, "manual");
}

#[tokio::test]
async fn appending_a_failed_attempt_leaves_the_binding_alone() {
    let database = create_test_db().await;
    let conversation = seed_conversation(&database).await;

    let record = SwitchRecord::failed(
        Some(("alpha", "alpha-1")),
        "gamma",
        "gamma-2",
        SwitchType::Fallback,
        "connection refused",
    );
    database
        .append_switch_attempt(&conversation.id, &record)
        .await
        .unwrap();

    let refreshed = database
        .get_conversation(&conversation.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.provider, "alpha");
    assert_eq!(refreshed.switch_log.len(), 1);
    assert_eq!(refreshed.switch_log[0].status, SwitchStatus::Failed);
    assert_eq!(
        refreshed.switch_log[0].error.as_deref(),
        Some("connection refused")
    );
    assert!(database
        .list_sessions(&conversation.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn cost_records_reconcile_with_conversation_totals() {
    let database = create_test_db().await;
    let conversation = seed_conversation(&database).await;
    let session = database
        .start_session(&conversation, "alpha", "alpha-1", SwitchType::Initial, None)
        .await
        .unwrap();
    let message = database
        .append_message(&conversation.id, MessageRole::Assistant, "reply", None)
        .await
        .unwrap();

    database
        .apply_cost_record(&NewCostRecord {
            conversation_id: conversation.id.clone(),
            session_id: session.id.clone(),
            message_id: Some(message.id.clone()),
            breakdown: sample_breakdown("alpha", "alpha-1", 0.002),
        })
        .await
        .unwrap();
    database
        .apply_cost_record(&NewCostRecord {
            conversation_id: conversation.id.clone(),
            session_id: session.id.clone(),
            message_id: None,
            breakdown: sample_breakdown("alpha", "alpha-1", 0.003),
        })
        .await
        .unwrap();

    let refreshed = database
        .get_conversation(&conversation.id)
        .await
        .unwrap()
        .unwrap();
    let records = database.get_cost_records(&conversation.id).await.unwrap();
    assert_eq!(records.len(), 2);
    let sum: f64 = records.iter().map(|r| r.total_cost).sum();
    assert!((refreshed.total_cost - sum).abs() < 1e-9);
    assert_eq!(refreshed.total_input_tokens, 2_000);
    assert_eq!(refreshed.total_output_tokens, 1_000);

    // The annotated message carries the exchange cost and its completion tokens
    let messages = database.get_messages(&conversation.id).await.unwrap();
    assert_eq!(messages[0].cost, Some(0.002));
    assert_eq!(messages[0].token_count, Some(500));
}

#[tokio::test]
async fn rollups_group_by_provider_and_currency() {
    let database = create_test_db().await;
    let conversation = seed_conversation(&database).await;
    let alpha_session = database
        .start_session(&conversation, "alpha", "alpha-1", SwitchType::Initial, None)
        .await
        .unwrap();
    let refreshed = database
        .get_conversation(&conversation.id)
        .await
        .unwrap()
        .unwrap();
    let beta_session = database
        .start_session(&refreshed, "beta", "beta-9", SwitchType::Manual, None)
        .await
        .unwrap();

    for (session_id, provider, model, total) in [
        (&alpha_session.id, "alpha", "alpha-1", 0.004),
        (&alpha_session.id, "alpha", "alpha-1", 0.002),
        (&beta_session.id, "beta", "beta-9", 0.001),
    ] {
        database
            .apply_cost_record(&NewCostRecord {
                conversation_id: conversation.id.clone(),
                session_id: (*session_id).clone(),
                message_id: None,
                breakdown: sample_breakdown(provider, model, total),
            })
            .await
            .unwrap();
    }

    let rollups = database
        .provider_cost_rollup(Some(&conversation.id))
        .await
        .unwrap();
    assert_eq!(rollups.len(), 2);
    // Ordered by total cost, biggest spender first
    assert_eq!(rollups[0].provider, "alpha");
    assert_eq!(rollups[0].record_count, 2);
    assert!((rollups[0].total_cost - 0.006).abs() < 1e-9);
    assert_eq!(rollups[1].provider, "beta");
    assert_eq!(rollups[1].record_count, 1);

    // The unfiltered rollup covers every conversation
    let global = database.provider_cost_rollup(None).await.unwrap();
    assert_eq!(global.len(), 2);
}

#[tokio::test]
async fn pricing_override_lifecycle_retires_predecessors() {
    let database = create_test_db().await;

    let first = NewPricingOverride {
        provider: "alpha".to_owned(),
        model: "alpha-1".to_owned(),
        input_rate: 0.5,
        output_rate: 1.0,
        flat_rate: None,
        unit: PricingUnit::Per1kTokens,
        currency: "USD".to_owned(),
        billing_model: BillingModel::PayPerUse,
        effective_at: None,
    };
    database.store_pricing_override(&first).await.unwrap();

    let second = NewPricingOverride {
        input_rate: 0.4,
        output_rate: 0.8,
        ..first.clone()
    };
    database.store_pricing_override(&second).await.unwrap();

    let live = database
        .get_pricing_override("alpha", "alpha-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(live.input_rate, 0.4);
    assert!(live.retired_at.is_none());

    let history = database
        .list_pricing_history("alpha", "alpha-1")
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].retired_at.is_none());
    assert_eq!(history[1].input_rate, 0.5);
    assert!(history[1].retired_at.is_some());

    // Other pairs are untouched
    assert!(database
        .get_pricing_override("alpha", "alpha-2")
        .await
        .unwrap()
        .is_none());
}
