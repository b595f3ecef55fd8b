// ABOUTME: Provider switching orchestration with validation, planning, and fallback
// ABOUTME: Serializes switches per conversation and commits each one atomically
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Switchboard Contributors

//! # Switch Orchestrator
//!
//! Moves a conversation's binding between providers. Each switch validates
//! the target against the registry, optionally probes credentials, plans
//! context carry-over, then commits the session flip, the binding, the
//! switch log entry, and the plan in one database transaction. A failure
//! anywhere before the commit leaves the conversation exactly as it was.
//!
//! Switches on the same conversation are serialized through a keyed async
//! mutex. The fallback path re-acquires the lock per candidate so a slow
//! probe on one candidate does not starve unrelated work between attempts.

use crate::context::ContextPlanner;
use crate::database::{Conversation, Database};
use crate::errors::{AppError, AppResult, ErrorCode};
use crate::models::{SwitchRecord, SwitchType};
use crate::notifications::{EventBus, GatewayEvent};
use crate::providers::ProviderRegistry;
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

/// Options controlling a single switch
#[derive(Debug, Clone)]
pub struct SwitchOptions {
    /// Plan context carry-over and store the plan with the switch
    pub preserve_context: bool,
    /// Free-text reason recorded with the switch
    pub reason: Option<String>,
    /// Probe the target's credentials before committing
    pub validate_credentials: bool,
}

impl Default for SwitchOptions {
    fn default() -> Self {
        Self {
            preserve_context: true,
            reason: None,
            validate_credentials: true,
        }
    }
}

/// One entry in a fallback priority list
#[derive(Debug, Clone)]
pub struct FallbackCandidate {
    /// Candidate provider
    pub provider: String,
    /// Candidate model; the provider's default model when None
    pub model: Option<String>,
}

impl FallbackCandidate {
    /// Candidate for a provider's default model
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: None,
        }
    }

    /// Pin the candidate to a specific model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Keyed async mutexes serializing switches per conversation
#[derive(Clone, Default)]
struct ConversationLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl ConversationLocks {
    fn for_conversation(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(conversation_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Orchestrates provider switches and fallback chains
#[derive(Clone)]
pub struct SwitchOrchestrator {
    database: Database,
    registry: Arc<ProviderRegistry>,
    planner: ContextPlanner,
    events: EventBus,
    locks: ConversationLocks,
}

impl SwitchOrchestrator {
    /// Create an orchestrator over the given dependencies
    #[must_use]
    pub fn new(
        database: Database,
        registry: Arc<ProviderRegistry>,
        planner: ContextPlanner,
        events: EventBus,
    ) -> Self {
        Self {
            database,
            registry,
            planner,
            events,
            locks: ConversationLocks::default(),
        }
    }

    /// Switch a conversation to a target provider/model
    ///
    /// Switching to the already-bound pair is not a no-op: it still records
    /// a fresh session, which is how callers force a session boundary.
    /// Message content is never altered by a switch.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown targets or an oversized
    /// reason, an availability error when the credential probe fails, a
    /// not-found error for unknown conversations, or a database error. On
    /// any error the binding is unchanged.
    #[instrument(skip(self, options), fields(provider = %target_provider, model = %target_model))]
    pub async fn switch_provider(
        &self,
        conversation_id: &str,
        target_provider: &str,
        target_model: &str,
        options: SwitchOptions,
    ) -> AppResult<Conversation> {
        validate_reason(options.reason.as_deref())?;
        let lock = self.locks.for_conversation(conversation_id);
        let _guard = lock.lock().await;

        self.execute_switch(conversation_id, target_provider, target_model, &options, None)
            .await
    }

    /// Try candidates in order until one switch succeeds
    ///
    /// Per-candidate validation and availability failures are recorded in
    /// the conversation's switch log and skipped; the first success commits
    /// with switch type `fallback`. When every candidate fails the
    /// conversation is unchanged and the error details name each candidate
    /// with its failure.
    ///
    /// Credentials are always probed per candidate regardless of
    /// `options.validate_credentials`; routing around dead providers is the
    /// point of this path.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty or oversized candidate list,
    /// a not-found error for unknown conversations,
    /// [`ErrorCode::FallbackExhausted`] when every candidate fails, or any
    /// non-skippable error from an attempt.
    #[instrument(skip(self, candidates, options), fields(candidates = candidates.len()))]
    pub async fn switch_with_fallback(
        &self,
        conversation_id: &str,
        candidates: &[FallbackCandidate],
        options: SwitchOptions,
    ) -> AppResult<Conversation> {
        if candidates.is_empty() {
            return Err(AppError::invalid_input(
                "Fallback requires at least one candidate",
            ));
        }
        if candidates.len() > crate::constants::limits::MAX_FALLBACK_CANDIDATES {
            return Err(AppError::invalid_input(format!(
                "Fallback accepts at most {} candidates, got {}",
                crate::constants::limits::MAX_FALLBACK_CANDIDATES,
                candidates.len()
            )));
        }
        validate_reason(options.reason.as_deref())?;

        let conversation = self.require_conversation(conversation_id).await?;

        let mut candidate_options = options;
        candidate_options.validate_credentials = true;

        let mut attempts = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let target_model = match self.candidate_model(candidate) {
                Ok(model) => model,
                Err(e) => {
                    self.record_failed_attempt(&conversation, candidate, "", &e, &mut attempts)
                        .await?;
                    continue;
                }
            };

            let lock = self.locks.for_conversation(conversation_id);
            let guard = lock.lock().await;
            let result = self
                .execute_switch(
                    conversation_id,
                    &candidate.provider,
                    &target_model,
                    &candidate_options,
                    Some(SwitchType::Fallback),
                )
                .await;
            drop(guard);

            match result {
                Ok(updated) => {
                    info!(
                        "Fallback bound conversation {conversation_id} to {}/{target_model} after {} failed candidates",
                        candidate.provider,
                        attempts.len()
                    );
                    return Ok(updated);
                }
                Err(e) if candidate_skippable(e.code) => {
                    self.record_failed_attempt(
                        &conversation,
                        candidate,
                        &target_model,
                        &e,
                        &mut attempts,
                    )
                    .await?;
                }
                Err(e) => return Err(e),
            }
        }

        Err(AppError::fallback_exhausted(
            format!("All {} fallback candidates failed", candidates.len()),
            json!(attempts),
        ))
    }

    /// Resolve a candidate's model, defaulting to the provider's default
    fn candidate_model(&self, candidate: &FallbackCandidate) -> AppResult<String> {
        if let Some(model) = &candidate.model {
            return Ok(model.clone());
        }
        self.registry
            .get(&candidate.provider)
            .map(|p| p.default_model().to_owned())
            .ok_or_else(|| {
                AppError::invalid_input(format!("Unknown provider '{}'", candidate.provider))
            })
    }

    /// Append a failed fallback attempt to the switch log and the trail
    async fn record_failed_attempt(
        &self,
        conversation: &Conversation,
        candidate: &FallbackCandidate,
        target_model: &str,
        error: &AppError,
        attempts: &mut Vec<serde_json::Value>,
    ) -> AppResult<()> {
        warn!(
            "Fallback candidate {}/{} failed: {error}",
            candidate.provider,
            if target_model.is_empty() { "?" } else { target_model }
        );

        let record = SwitchRecord::failed(
            Some((conversation.provider.as_str(), conversation.model.as_str())),
            &candidate.provider,
            target_model,
            SwitchType::Fallback,
            &error.to_string(),
        );
        self.database
            .append_switch_attempt(&conversation.id, &record)
            .await?;

        attempts.push(json!({
            "provider": candidate.provider,
            "model": candidate.model,
            "code": error.code,
            "error": error.to_string(),
        }));
        Ok(())
    }

    /// Validate, plan, and commit one switch. Caller holds the lock.
    async fn execute_switch(
        &self,
        conversation_id: &str,
        target_provider: &str,
        target_model: &str,
        options: &SwitchOptions,
        forced_type: Option<SwitchType>,
    ) -> AppResult<Conversation> {
        let conversation = self.require_conversation(conversation_id).await?;
        let model_info = self.registry.find_model(target_provider, target_model)?;

        if options.validate_credentials {
            if let Some(driver) = self.registry.get(target_provider) {
                let authorized = driver.validate_credentials().await?;
                if !authorized {
                    return Err(AppError::provider_auth_failed(target_provider));
                }
            }
        }

        let plan = if options.preserve_context {
            let messages = self.database.get_messages(conversation_id).await?;
            Some(self.planner.plan(
                conversation.system_prompt.as_deref(),
                &messages,
                target_provider,
                &model_info,
            ))
        } else {
            None
        };

        let has_sessions = !self.database.list_sessions(conversation_id).await?.is_empty();
        let switch_type = forced_type.unwrap_or(if has_sessions {
            SwitchType::Manual
        } else {
            SwitchType::Initial
        });
        let from = if has_sessions {
            Some((conversation.provider.as_str(), conversation.model.as_str()))
        } else {
            None
        };

        let record = SwitchRecord::completed(
            from,
            target_provider,
            target_model,
            switch_type,
            options.reason.as_deref(),
        );
        let updated = self
            .database
            .record_provider_switch(&conversation, &record, plan.as_ref())
            .await?;

        info!(
            "Switched conversation {conversation_id} to {target_provider}/{target_model} ({switch_type})"
        );
        self.events.publish(GatewayEvent::ProviderSwitched {
            conversation_id: conversation_id.to_owned(),
            from_provider: record.from_provider,
            from_model: record.from_model,
            to_provider: record.to_provider,
            to_model: record.to_model,
            switch_type,
            reason: record.reason,
            timestamp: record.occurred_at,
        });

        Ok(updated)
    }

    async fn require_conversation(&self, conversation_id: &str) -> AppResult<Conversation> {
        self.database
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Conversation {conversation_id}")))
    }
}

/// Whether a per-candidate failure should be recorded and skipped
///
/// Availability failures are the reason fallback exists; a bad candidate
/// entry (unknown provider or model) should not abort the rest of the
/// list. Anything else, database errors above all, propagates.
const fn candidate_skippable(code: ErrorCode) -> bool {
    code.is_availability() || matches!(code, ErrorCode::InvalidInput)
}

/// Reject switch reasons longer than the audit log accepts
fn validate_reason(reason: Option<&str>) -> AppResult<()> {
    if let Some(reason) = reason {
        if reason.len() > crate::constants::limits::MAX_SWITCH_REASON_LENGTH {
            return Err(AppError::invalid_input(format!(
                "Switch reason exceeds {} characters",
                crate::constants::limits::MAX_SWITCH_REASON_LENGTH
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::NewConversation;
    use crate::models::{ContextStrategy, SwitchStatus};
    use crate::providers::{
        ChatRequest, ChatResponse, ChatStream, ModelInfo, ModelProvider, ProviderCapabilities,
        TokenUsage,
    };
    use async_trait::async_trait;

    struct FakeProvider {
        name: &'static str,
        model: &'static str,
        reachable: bool,
        authorized: bool,
    }

    impl FakeProvider {
        const fn up(name: &'static str, model: &'static str) -> Self {
            Self {
                name,
                model,
                reachable: true,
                authorized: true,
            }
        }

        const fn down(name: &'static str, model: &'static str) -> Self {
            Self {
                name,
                model,
                reachable: false,
                authorized: true,
            }
        }

        const fn unauthorized(name: &'static str, model: &'static str) -> Self {
            Self {
                name,
                model,
                reachable: true,
                authorized: false,
            }
        }
    }

    #[async_trait]
    impl ModelProvider for FakeProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        fn display_name(&self) -> &'static str {
            self.name
        }

        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities::text_only()
        }

        fn default_model(&self) -> &str {
            self.model
        }

        fn models(&self) -> Vec<ModelInfo> {
            vec![ModelInfo::new(
                self.model,
                8_192,
                2_048,
                ProviderCapabilities::text_only(),
            )]
        }

        fn default_pricing(&self, _model: &str) -> Option<crate::models::PricingDescriptor> {
            None
        }

        async fn send_message(&self, request: &ChatRequest) -> AppResult<ChatResponse> {
            if !self.reachable {
                return Err(AppError::provider_unavailable(self.name, "connection refused"));
            }
            Ok(ChatResponse {
                content: format!("echo of {} messages", request.messages.len()),
                model: self.model.to_owned(),
                usage: Some(TokenUsage::new(10, 5)),
                finish_reason: Some("stop".to_owned()),
            })
        }

        async fn send_message_stream(&self, _request: &ChatRequest) -> AppResult<ChatStream> {
            Err(AppError::internal("streaming not supported in tests"))
        }

        async fn validate_credentials(&self) -> AppResult<bool> {
            if !self.reachable {
                return Err(AppError::provider_unavailable(self.name, "connection refused"));
            }
            Ok(self.authorized)
        }
    }

    async fn fixture(providers: Vec<FakeProvider>) -> (SwitchOrchestrator, Database, String) {
        let database = Database::new("sqlite::memory:").await.unwrap();
        let mut registry = ProviderRegistry::new();
        for provider in providers {
            registry.register(Box::new(provider));
        }
        let orchestrator = SwitchOrchestrator::new(
            database.clone(),
            Arc::new(registry),
            ContextPlanner::default(),
            EventBus::default(),
        );

        let conversation = database
            .create_conversation(&NewConversation {
                title: "Switch test".to_owned(),
                provider: "alpha".to_owned(),
                model: "alpha-1".to_owned(),
                system_prompt: None,
            })
            .await
            .unwrap();

        (orchestrator, database, conversation.id)
    }

    #[tokio::test]
    async fn first_switch_without_sessions_is_initial() {
        let (orchestrator, database, conversation_id) =
            fixture(vec![FakeProvider::up("alpha", "alpha-1")]).await;

        let updated = orchestrator
            .switch_provider(&conversation_id, "alpha", "alpha-1", SwitchOptions::default())
            .await
            .unwrap();

        assert_eq!(updated.switch_log.len(), 1);
        assert_eq!(updated.switch_log[0].switch_type, SwitchType::Initial);
        assert!(updated.switch_log[0].from_provider.is_none());

        let sessions = database.list_sessions(&conversation_id).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].switch_type, "initial");
    }

    #[tokio::test]
    async fn switching_to_the_same_target_records_a_new_session() {
        let (orchestrator, database, conversation_id) =
            fixture(vec![FakeProvider::up("alpha", "alpha-1")]).await;

        orchestrator
            .switch_provider(&conversation_id, "alpha", "alpha-1", SwitchOptions::default())
            .await
            .unwrap();
        let updated = orchestrator
            .switch_provider(&conversation_id, "alpha", "alpha-1", SwitchOptions::default())
            .await
            .unwrap();

        assert_eq!(updated.provider, "alpha");
        let sessions = database.list_sessions(&conversation_id).await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[1].switch_type, "manual");
        let open: Vec<_> = sessions.iter().filter(|s| s.is_open()).collect();
        assert_eq!(open.len(), 1);
    }

    #[tokio::test]
    async fn unknown_target_fails_without_touching_the_binding() {
        let (orchestrator, database, conversation_id) =
            fixture(vec![FakeProvider::up("alpha", "alpha-1")]).await;

        let err = orchestrator
            .switch_provider(&conversation_id, "alpha", "no-such-model", SwitchOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);

        let conversation = database
            .get_conversation(&conversation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conversation.model, "alpha-1");
        assert!(conversation.switch_log.is_empty());
        assert!(database
            .list_sessions(&conversation_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn failed_credential_probe_blocks_the_switch() {
        let (orchestrator, database, conversation_id) = fixture(vec![
            FakeProvider::up("alpha", "alpha-1"),
            FakeProvider::unauthorized("beta", "beta-1"),
        ])
        .await;

        let err = orchestrator
            .switch_provider(&conversation_id, "beta", "beta-1", SwitchOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ProviderAuthFailed);

        let conversation = database
            .get_conversation(&conversation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conversation.provider, "alpha");
    }

    #[tokio::test]
    async fn preserving_context_stores_a_plan_for_the_target() {
        let (orchestrator, database, conversation_id) = fixture(vec![
            FakeProvider::up("alpha", "alpha-1"),
            FakeProvider::up("beta", "beta-1"),
        ])
        .await;

        database
            .append_message(&conversation_id, crate::providers::MessageRole::User, "hello", Some(12))
            .await
            .unwrap();

        let updated = orchestrator
            .switch_provider(&conversation_id, "beta", "beta-1", SwitchOptions::default())
            .await
            .unwrap();

        let plan = updated.context_plan.expect("plan stored");
        assert_eq!(plan.target_provider, "beta");
        assert_eq!(plan.target_model, "beta-1");
        assert_eq!(plan.strategy, ContextStrategy::FullCarry);
        assert_eq!(plan.preserved_messages, 1);
    }

    #[tokio::test]
    async fn disabling_preserve_context_clears_the_stored_plan() {
        let (orchestrator, _database, conversation_id) = fixture(vec![
            FakeProvider::up("alpha", "alpha-1"),
            FakeProvider::up("beta", "beta-1"),
        ])
        .await;

        orchestrator
            .switch_provider(&conversation_id, "beta", "beta-1", SwitchOptions::default())
            .await
            .unwrap();
        let updated = orchestrator
            .switch_provider(
                &conversation_id,
                "alpha",
                "alpha-1",
                SwitchOptions {
                    preserve_context: false,
                    ..SwitchOptions::default()
                },
            )
            .await
            .unwrap();

        assert!(updated.context_plan.is_none());
    }

    #[tokio::test]
    async fn fallback_skips_dead_candidates_and_logs_the_trail() {
        let (orchestrator, database, conversation_id) = fixture(vec![
            FakeProvider::down("alpha", "alpha-1"),
            FakeProvider::unauthorized("beta", "beta-1"),
            FakeProvider::up("gamma", "gamma-1"),
        ])
        .await;

        let candidates = vec![
            FallbackCandidate::new("alpha"),
            FallbackCandidate::new("beta"),
            FallbackCandidate::new("gamma").with_model("gamma-1"),
        ];
        let updated = orchestrator
            .switch_with_fallback(&conversation_id, &candidates, SwitchOptions::default())
            .await
            .unwrap();

        assert_eq!(updated.provider, "gamma");
        assert_eq!(updated.model, "gamma-1");

        let failed: Vec<_> = updated
            .switch_log
            .iter()
            .filter(|r| r.status == SwitchStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 2);
        assert_eq!(failed[0].to_provider, "alpha");
        assert_eq!(failed[1].to_provider, "beta");
        let completed: Vec<_> = updated
            .switch_log
            .iter()
            .filter(|r| r.status == SwitchStatus::Completed)
            .collect();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].switch_type, SwitchType::Fallback);

        let sessions = database.list_sessions(&conversation_id).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].switch_type, "fallback");
        assert_eq!(sessions[0].provider, "gamma");
    }

    #[tokio::test]
    async fn exhausted_fallback_leaves_the_conversation_unchanged() {
        let (orchestrator, database, conversation_id) = fixture(vec![
            FakeProvider::down("alpha", "alpha-1"),
            FakeProvider::down("beta", "beta-1"),
        ])
        .await;

        let candidates = vec![
            FallbackCandidate::new("alpha"),
            FallbackCandidate::new("beta"),
        ];
        let err = orchestrator
            .switch_with_fallback(&conversation_id, &candidates, SwitchOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::FallbackExhausted);
        let attempts = err.details.expect("attempt details")["attempts"]
            .as_array()
            .map(Vec::len);
        assert_eq!(attempts, Some(2));

        let conversation = database
            .get_conversation(&conversation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conversation.provider, "alpha");
        assert!(database
            .list_sessions(&conversation_id)
            .await
            .unwrap()
            .is_empty());
        // The trail is still recorded even though nothing switched
        assert_eq!(conversation.switch_log.len(), 2);
    }

    #[tokio::test]
    async fn empty_candidate_list_is_rejected() {
        let (orchestrator, _database, conversation_id) =
            fixture(vec![FakeProvider::up("alpha", "alpha-1")]).await;

        let err = orchestrator
            .switch_with_fallback(&conversation_id, &[], SwitchOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
    }

    #[tokio::test]
    async fn oversized_reason_is_rejected_before_any_attempt() {
        let (orchestrator, database, conversation_id) =
            fixture(vec![FakeProvider::up("alpha", "alpha-1")]).await;

        let options = SwitchOptions {
            reason: Some("x".repeat(crate::constants::limits::MAX_SWITCH_REASON_LENGTH + 1)),
            ..SwitchOptions::default()
        };
        let err = orchestrator
            .switch_provider(&conversation_id, "alpha", "alpha-1", options)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);

        let sessions = database.list_sessions(&conversation_id).await.unwrap();
        assert!(sessions.is_empty());
    }
}
