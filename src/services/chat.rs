// ABOUTME: Chat service for conversation creation and message dispatch
// ABOUTME: Replays plan-preserved context and prices every exchange after dispatch
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Switchboard Contributors

use crate::constants::context::FALLBACK_CHARS_PER_TOKEN;
use crate::constants::limits::MAX_TITLE_LENGTH;
use crate::cost::CostTracker;
use crate::database::{
    Conversation, CostRecord, Database, MessageRecord, NewConversation, ProviderSession,
};
use crate::errors::{AppError, AppResult};
use crate::history::HistoryTracker;
use crate::models::SwitchType;
use crate::providers::{
    ChatMessage, ChatRequest, ChatResponse, MessageRole, ProviderRegistry, TokenUsage,
};
use tracing::{debug, warn};

/// Result of creating a conversation with its initial binding
#[derive(Debug)]
pub struct CreateConversationResult {
    /// The created conversation
    pub conversation: Conversation,
    /// The initial provider session opened for it
    pub session: ProviderSession,
}

/// Result of a complete message exchange
#[derive(Debug)]
pub struct SendMessageResult {
    /// The persisted user message
    pub user_message: MessageRecord,
    /// The persisted assistant message
    pub assistant_message: MessageRecord,
    /// The raw provider response
    pub response: ChatResponse,
    /// The cost attributed to the exchange
    pub cost: CostRecord,
}

/// Estimate tokens for content with no reported count
fn estimate_content_tokens(content: &str) -> u32 {
    let chars = content.chars().count();
    ((chars as f64) / FALLBACK_CHARS_PER_TOKEN).ceil() as u32
}

/// Validate the binding and create a conversation with its initial session.
///
/// Business rules:
/// - The provider/model pair must exist in the registry
/// - The initial session opens immediately so cost tracking works from the
///   first exchange
///
/// # Errors
///
/// Returns a validation error for an unknown binding or an invalid title,
/// or database errors on creation failure.
pub async fn create_conversation(
    database: &Database,
    registry: &ProviderRegistry,
    history: &HistoryTracker,
    title: &str,
    provider: &str,
    model: &str,
    system_prompt: Option<&str>,
) -> AppResult<CreateConversationResult> {
    if title.trim().is_empty() {
        return Err(AppError::missing_field("title"));
    }
    if title.len() > MAX_TITLE_LENGTH {
        return Err(AppError::invalid_input(format!(
            "Title exceeds {MAX_TITLE_LENGTH} characters"
        )));
    }
    registry.find_model(provider, model)?;

    let conversation = database
        .create_conversation(&NewConversation {
            title: title.to_owned(),
            provider: provider.to_owned(),
            model: model.to_owned(),
            system_prompt: system_prompt.map(ToOwned::to_owned),
        })
        .await?;
    let session = history
        .start_session(&conversation.id, provider, model, SwitchType::Initial, None)
        .await?;

    debug!(
        "Created conversation {} bound to {provider}/{model}",
        conversation.id
    );
    Ok(CreateConversationResult {
        conversation,
        session,
    })
}

/// Messages to replay for a dispatch, honoring the stored context plan
///
/// Every system message is carried. When a plan exists, the oldest
/// `dropped_messages` non-system messages are skipped; anything appended
/// after the plan was computed falls past the drop point and is always
/// included.
fn replay_messages(conversation: &Conversation, messages: &[MessageRecord]) -> Vec<ChatMessage> {
    let dropped = conversation
        .context_plan
        .as_ref()
        .map_or(0, |plan| plan.dropped_messages);

    let mut replay = Vec::with_capacity(messages.len() + 1);
    if let Some(prompt) = &conversation.system_prompt {
        replay.push(ChatMessage::system(prompt.clone()));
    }

    let mut history_index = 0_usize;
    for message in messages {
        let Some(role) = MessageRole::parse_str(&message.role) else {
            warn!(
                "Skipping message {} with unknown role '{}'",
                message.id, message.role
            );
            continue;
        };
        if role == MessageRole::System {
            replay.push(ChatMessage::new(role, message.content.clone()));
            continue;
        }
        if history_index >= dropped {
            replay.push(ChatMessage::new(role, message.content.clone()));
        }
        history_index += 1;
    }

    replay
}

/// Append the user message, dispatch to the bound provider, and price it.
///
/// Business rules:
/// - The user message persists before dispatch (crash-safe)
/// - Replay context follows the stored plan; dropped messages stay in
///   persistent history
/// - Usage falls back to a character estimate when the provider reports none
/// - Cost is tracked against the open session after the assistant message
///   lands
///
/// # Errors
///
/// Returns a not-found error for unknown conversations, availability errors
/// from the provider, a consistency error if no session is open, or
/// database errors.
pub async fn send_message(
    database: &Database,
    registry: &ProviderRegistry,
    costs: &CostTracker,
    conversation_id: &str,
    content: &str,
) -> AppResult<SendMessageResult> {
    let conversation = database
        .get_conversation(conversation_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("Conversation {conversation_id}")))?;
    let driver = registry.get(&conversation.provider).ok_or_else(|| {
        AppError::provider_unavailable(
            conversation.provider.clone(),
            "Bound provider is not registered",
        )
    })?;

    let user_message = database
        .append_message(
            conversation_id,
            MessageRole::User,
            content,
            Some(estimate_content_tokens(content)),
        )
        .await?;

    let messages = database.get_messages(conversation_id).await?;
    let replay = replay_messages(&conversation, &messages);
    let request = ChatRequest::new(replay).with_model(conversation.model.clone());

    let response = driver.send_message(&request).await?;

    let usage = response.usage.unwrap_or_else(|| {
        let input: u32 = request
            .messages
            .iter()
            .map(|m| estimate_content_tokens(&m.content))
            .sum();
        TokenUsage::new(input, estimate_content_tokens(&response.content))
    });

    let assistant_message = database
        .append_message(
            conversation_id,
            MessageRole::Assistant,
            &response.content,
            Some(usage.output_tokens),
        )
        .await?;
    let cost = costs
        .track_message_cost(
            conversation_id,
            Some(&assistant_message.id),
            &conversation.provider,
            &conversation.model,
            &usage,
        )
        .await?;

    Ok(SendMessageResult {
        user_message,
        assistant_message,
        response,
        cost,
    })
}

/// Full message history of a conversation in sequence order.
///
/// # Errors
///
/// Returns a not-found error for unknown conversations or database errors.
pub async fn conversation_history(
    database: &Database,
    conversation_id: &str,
) -> AppResult<Vec<MessageRecord>> {
    database
        .get_conversation(conversation_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("Conversation {conversation_id}")))?;
    database.get_messages(conversation_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;
    use crate::models::{ContextPlan, ContextStrategy, SwitchRecord};
    use crate::notifications::EventBus;
    use crate::pricing::PricingResolver;
    use crate::providers::{ChatStream, ModelInfo, ModelProvider, ProviderCapabilities};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    struct EchoProvider {
        sent: Arc<Mutex<Vec<ChatRequest>>>,
    }

    impl EchoProvider {
        fn new() -> (Self, Arc<Mutex<Vec<ChatRequest>>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            (Self { sent: sent.clone() }, sent)
        }
    }

    #[async_trait]
    impl ModelProvider for EchoProvider {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn display_name(&self) -> &'static str {
            "Echo"
        }

        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities::text_only()
        }

        fn default_model(&self) -> &str {
            "echo-1"
        }

        fn models(&self) -> Vec<ModelInfo> {
            vec![ModelInfo::new(
                "echo-1",
                8_192,
                2_048,
                ProviderCapabilities::text_only(),
            )]
        }

        fn default_pricing(&self, _model: &str) -> Option<crate::models::PricingDescriptor> {
            None
        }

        async fn send_message(&self, request: &ChatRequest) -> AppResult<ChatResponse> {
            self.sent.lock().unwrap().push(request.clone());
            Ok(ChatResponse {
                content: "echoed".to_owned(),
                model: "echo-1".to_owned(),
                usage: Some(TokenUsage::new(120, 30)),
                finish_reason: Some("stop".to_owned()),
            })
        }

        async fn send_message_stream(&self, _request: &ChatRequest) -> AppResult<ChatStream> {
            Err(AppError::internal("streaming not supported in tests"))
        }

        async fn validate_credentials(&self) -> AppResult<bool> {
            Ok(true)
        }
    }

    struct Fixture {
        database: Database,
        registry: Arc<ProviderRegistry>,
        history: HistoryTracker,
        costs: CostTracker,
        sent: Arc<Mutex<Vec<ChatRequest>>>,
    }

    async fn fixture() -> Fixture {
        let database = Database::new("sqlite::memory:").await.unwrap();
        let (provider, sent) = EchoProvider::new();
        let mut registry = ProviderRegistry::new();
        registry.register(Box::new(provider));
        let registry = Arc::new(registry);
        let resolver = PricingResolver::new(database.clone(), registry.clone());
        Fixture {
            database: database.clone(),
            registry: registry.clone(),
            history: HistoryTracker::new(database.clone()),
            costs: CostTracker::new(database, resolver, EventBus::default()),
            sent,
        }
    }

    #[tokio::test]
    async fn creating_a_conversation_opens_the_initial_session() {
        let fx = fixture().await;

        let result = create_conversation(
            &fx.database,
            &fx.registry,
            &fx.history,
            "First chat",
            "echo",
            "echo-1",
            Some("be brief"),
        )
        .await
        .unwrap();

        assert_eq!(result.conversation.provider, "echo");
        assert_eq!(result.session.switch_type, "initial");
        assert!(result.session.is_open());
    }

    #[tokio::test]
    async fn unknown_binding_is_rejected_before_creation() {
        let fx = fixture().await;

        let err = create_conversation(
            &fx.database,
            &fx.registry,
            &fx.history,
            "Bad",
            "echo",
            "no-such-model",
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);

        assert!(fx.database.list_conversations(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_message_appends_both_sides_and_prices_the_exchange() {
        let fx = fixture().await;
        let created = create_conversation(
            &fx.database,
            &fx.registry,
            &fx.history,
            "Chat",
            "echo",
            "echo-1",
            None,
        )
        .await
        .unwrap();

        let result = send_message(
            &fx.database,
            &fx.registry,
            &fx.costs,
            &created.conversation.id,
            "hello there",
        )
        .await
        .unwrap();

        assert_eq!(result.user_message.role, "user");
        assert_eq!(result.assistant_message.role, "assistant");
        assert_eq!(result.assistant_message.sequence, 2);
        assert_eq!(result.cost.input_tokens, 120);

        let conversation = fx
            .database
            .get_conversation(&created.conversation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conversation.message_count, 2);
        // No driver pricing: universal fallback rates 0.001/0.002 per 1K
        assert!((conversation.total_cost - (0.12 * 0.001 + 0.03 * 0.002)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn replay_honors_the_stored_plan_and_system_prompt() {
        let fx = fixture().await;
        let created = create_conversation(
            &fx.database,
            &fx.registry,
            &fx.history,
            "Planned",
            "echo",
            "echo-1",
            Some("be concise"),
        )
        .await
        .unwrap();
        let conversation_id = created.conversation.id.clone();

        for i in 0..4 {
            fx.database
                .append_message(
                    &conversation_id,
                    if i % 2 == 0 {
                        MessageRole::User
                    } else {
                        MessageRole::Assistant
                    },
                    &format!("turn {i}"),
                    Some(10),
                )
                .await
                .unwrap();
        }

        // Store a plan that drops the two oldest history messages
        let conversation = fx
            .database
            .get_conversation(&conversation_id)
            .await
            .unwrap()
            .unwrap();
        let plan = ContextPlan {
            target_provider: "echo".to_owned(),
            target_model: "echo-1".to_owned(),
            context_window: 8_192,
            token_budget: 7_372,
            strategy: ContextStrategy::TruncateOldest,
            preserved_messages: 2,
            dropped_messages: 2,
            preserved_tokens: 20,
            system_prompt_overflow: false,
            planned_at: chrono::Utc::now(),
        };
        let record = SwitchRecord::completed(
            Some(("echo", "echo-1")),
            "echo",
            "echo-1",
            SwitchType::Manual,
            None,
        );
        fx.database
            .record_provider_switch(&conversation, &record, Some(&plan))
            .await
            .unwrap();

        send_message(&fx.database, &fx.registry, &fx.costs, &conversation_id, "latest")
            .await
            .unwrap();

        let requests = fx.sent.lock().unwrap();
        let request = requests.last().unwrap();
        // system prompt + history[2..4] + the new user message
        assert_eq!(request.messages.len(), 1 + 2 + 1);
        assert_eq!(request.messages[0].role, MessageRole::System);
        assert_eq!(request.messages[1].content, "turn 2");
        assert_eq!(request.messages.last().unwrap().content, "latest");
    }

    #[tokio::test]
    async fn history_for_unknown_conversation_is_not_found() {
        let fx = fixture().await;
        let err = conversation_history(&fx.database, "missing")
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ResourceNotFound);
    }
}
