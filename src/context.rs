// ABOUTME: Context preservation planning for cross-provider conversation continuity
// ABOUTME: Fits conversation history into a target model's context window deterministically
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Switchboard Contributors

//! # Context Planner
//!
//! Decides which messages survive a provider switch. The plan is a pure
//! function of the message list, the target window, and the safety margin:
//! no randomness, no clock reads beyond the plan timestamp, so replaying the
//! same inputs yields the same plan.
//!
//! The active system prompt and any system messages are always carried and
//! budgeted first. Non-system messages are kept newest first until the
//! token budget is exhausted, which preserves the most recent exchange at
//! the expense of the oldest history.

use crate::constants::context::{DEFAULT_SAFETY_MARGIN, FALLBACK_CHARS_PER_TOKEN};
use crate::database::MessageRecord;
use crate::models::{ContextPlan, ContextStrategy};
use crate::providers::ModelInfo;
use tracing::debug;

/// Plans context carry-over for provider switches
#[derive(Debug, Clone)]
pub struct ContextPlanner {
    safety_margin: f64,
}

impl Default for ContextPlanner {
    fn default() -> Self {
        Self::new(DEFAULT_SAFETY_MARGIN)
    }
}

impl ContextPlanner {
    /// Create a planner reserving `1 - safety_margin` of the window for the
    /// next response
    #[must_use]
    pub const fn new(safety_margin: f64) -> Self {
        Self { safety_margin }
    }

    /// Usable token budget for a context window under this margin
    #[must_use]
    pub fn token_budget(&self, context_window: u32) -> u64 {
        (f64::from(context_window) * self.safety_margin).floor() as u64
    }

    /// Estimate the token weight of a message
    ///
    /// Uses the recorded token count when present, otherwise a character
    /// heuristic. The heuristic rounds up so short messages never estimate
    /// to zero.
    #[must_use]
    pub fn estimate_tokens(message: &MessageRecord) -> u64 {
        message.token_count.map_or_else(
            || Self::estimate_content(&message.content),
            |count| u64::try_from(count).unwrap_or(0),
        )
    }

    fn estimate_content(content: &str) -> u64 {
        let chars = content.chars().count();
        (chars as f64 / FALLBACK_CHARS_PER_TOKEN).ceil() as u64
    }

    /// Plan which messages carry over to the target model
    ///
    /// The active system prompt is budgeted before any history is counted.
    /// The returned plan stores counts rather than ids: replay takes every
    /// system message plus every non-system message after the
    /// `dropped_messages` oldest, so messages appended after planning are
    /// always included.
    #[must_use]
    pub fn plan(
        &self,
        system_prompt: Option<&str>,
        messages: &[MessageRecord],
        target_provider: &str,
        target: &ModelInfo,
    ) -> ContextPlan {
        let budget = self.token_budget(target.context_window);

        let system_tokens: u64 = system_prompt.map_or(0, Self::estimate_content)
            + messages
                .iter()
                .filter(|m| m.role == "system")
                .map(Self::estimate_tokens)
                .sum::<u64>();
        let system_count = messages.iter().filter(|m| m.role == "system").count();
        let history: Vec<u64> = messages
            .iter()
            .filter(|m| m.role != "system")
            .map(Self::estimate_tokens)
            .collect();

        // The system prompt alone blowing the budget is flagged, not fixed:
        // it is still carried so the conversation keeps its instructions.
        if system_tokens > budget {
            debug!(
                "System context ({system_tokens} tokens) exceeds budget ({budget}) for {}/{}",
                target_provider, target.id
            );
            return ContextPlan {
                target_provider: target_provider.to_owned(),
                target_model: target.id.clone(),
                context_window: target.context_window,
                token_budget: budget,
                strategy: ContextStrategy::TruncateOldest,
                preserved_messages: system_count,
                dropped_messages: history.len(),
                preserved_tokens: system_tokens,
                system_prompt_overflow: true,
                planned_at: chrono::Utc::now(),
            };
        }

        let remaining = budget - system_tokens;
        let mut preserved_tokens = 0_u64;
        let mut preserved_history = 0_usize;
        for tokens in history.iter().rev() {
            if preserved_tokens + tokens > remaining {
                break;
            }
            preserved_tokens += tokens;
            preserved_history += 1;
        }

        let dropped = history.len() - preserved_history;
        let strategy = if dropped == 0 {
            ContextStrategy::FullCarry
        } else {
            ContextStrategy::TruncateOldest
        };

        ContextPlan {
            target_provider: target_provider.to_owned(),
            target_model: target.id.clone(),
            context_window: target.context_window,
            token_budget: budget,
            strategy,
            preserved_messages: system_count + preserved_history,
            dropped_messages: dropped,
            preserved_tokens: system_tokens + preserved_tokens,
            system_prompt_overflow: false,
            planned_at: chrono::Utc::now(),
        }
    }
}
