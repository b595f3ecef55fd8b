// ABOUTME: In-process event bus for switch and cost notifications
// ABOUTME: Fans gateway events out to subscribers over a tokio broadcast channel
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Switchboard Contributors

//! Gateway event notifications
//!
//! Components publish events after their database effects commit, so a
//! subscriber never observes an event for state that did not land. Delivery
//! is best-effort: events published while nobody subscribes are dropped.

use crate::models::SwitchType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Events emitted by the gateway as conversations change hands
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayEvent {
    /// A conversation's provider binding moved
    #[serde(rename = "provider_switched")]
    ProviderSwitched {
        /// Conversation that switched
        conversation_id: String,
        /// Previous provider, None for the initial binding
        from_provider: Option<String>,
        /// Previous model, None for the initial binding
        from_model: Option<String>,
        /// New provider
        to_provider: String,
        /// New model
        to_model: String,
        /// How the switch was initiated
        switch_type: SwitchType,
        /// Caller-supplied reason, if any
        reason: Option<String>,
        /// When the switch committed
        timestamp: DateTime<Utc>,
    },
    /// A message exchange was priced and recorded
    #[serde(rename = "cost_calculated")]
    CostCalculated {
        /// Conversation the cost belongs to
        conversation_id: String,
        /// Provider that served the exchange
        provider: String,
        /// Model that served the exchange
        model: String,
        /// Prompt tokens consumed
        input_tokens: u32,
        /// Completion tokens generated
        output_tokens: u32,
        /// Total cost of the exchange
        total_cost: f64,
        /// Currency of the amount
        currency: String,
    },
}

/// Broadcast fan-out for gateway events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    /// Create a bus that buffers up to `capacity` undelivered events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to all events published after this call
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers
    pub fn publish(&self, event: GatewayEvent) {
        if let Err(e) = self.sender.send(event) {
            trace!("No subscribers for gateway event: {e}");
        }
    }

    /// Number of live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::constants::channels::EVENT_BUS_CAPACITY)
    }
}
