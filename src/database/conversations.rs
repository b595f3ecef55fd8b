// ABOUTME: Conversation and message persistence operations
// ABOUTME: Handles gapless message sequencing and the atomic provider switch commit
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright (c) 2025 Switchboard Contributors

use super::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{ContextPlan, SwitchRecord};
use crate::providers::MessageRole;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

/// A conversation bound to exactly one provider/model pair at a time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique conversation ID
    pub id: String,
    /// Conversation title
    pub title: String,
    /// Provider currently serving the conversation
    pub provider: String,
    /// Model currently serving the conversation
    pub model: String,
    /// Optional system prompt replayed on every exchange
    pub system_prompt: Option<String>,
    /// Accumulated cost across all providers
    pub total_cost: f64,
    /// Accumulated prompt tokens across all providers
    pub total_input_tokens: i64,
    /// Accumulated completion tokens across all providers
    pub total_output_tokens: i64,
    /// Number of messages in the conversation
    pub message_count: i64,
    /// Append-only log of switch attempts, failed fallback candidates included
    pub switch_log: Vec<SwitchRecord>,
    /// Context plan from the most recent switch, if one was computed
    pub context_plan: Option<ContextPlan>,
    /// Creation timestamp (RFC 3339)
    pub created_at: String,
    /// Last update timestamp (RFC 3339)
    pub updated_at: String,
}

/// A single message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Unique message ID
    pub id: String,
    /// Conversation this message belongs to
    pub conversation_id: String,
    /// Message role (system, user, assistant)
    pub role: String,
    /// Message content
    pub content: String,
    /// Gapless per-conversation sequence number, starting at 1
    pub sequence: i64,
    /// Token count of the content, estimated for user messages
    pub token_count: Option<i64>,
    /// Cost attributed to this message once tracked
    pub cost: Option<f64>,
    /// Creation timestamp (RFC 3339)
    pub created_at: String,
}

/// Parameters for creating a conversation
#[derive(Debug, Clone)]
pub struct NewConversation {
    /// Conversation title
    pub title: String,
    /// Initial provider binding
    pub provider: String,
    /// Initial model binding
    pub model: String,
    /// Optional system prompt
    pub system_prompt: Option<String>,
}

impl Database {
    /// Create conversations and messages tables
    pub(super) async fn migrate_conversations(&self) -> AppResult<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                system_prompt TEXT,
                total_cost REAL NOT NULL DEFAULT 0.0,
                total_input_tokens INTEGER NOT NULL DEFAULT 0,
                total_output_tokens INTEGER NOT NULL DEFAULT 0,
                message_count INTEGER NOT NULL DEFAULT 0,
                switch_log TEXT NOT NULL DEFAULT '[]',
                context_plan TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create conversations table: {e}")))?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                role TEXT NOT NULL CHECK (role IN ('system', 'user', 'assistant')),
                content TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                token_count INTEGER,
                cost REAL,
                created_at TEXT NOT NULL,
                UNIQUE (conversation_id, sequence)
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create messages table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, sequence)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create messages index: {e}")))?;

        Ok(())
    }

    /// Create a new conversation with its initial provider binding
    ///
    /// The caller is responsible for opening the initial provider session;
    /// see the history tracker.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn create_conversation(&self, new: &NewConversation) -> AppResult<Conversation> {
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();

        sqlx::query(
            r"
            INSERT INTO conversations (id, title, provider, model, system_prompt, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(&id)
        .bind(&new.title)
        .bind(&new.provider)
        .bind(&new.model)
        .bind(&new.system_prompt)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create conversation: {e}")))?;

        Ok(Conversation {
            id,
            title: new.title.clone(),
            provider: new.provider.clone(),
            model: new.model.clone(),
            system_prompt: new.system_prompt.clone(),
            total_cost: 0.0,
            total_input_tokens: 0,
            total_output_tokens: 0,
            message_count: 0,
            switch_log: Vec::new(),
            context_plan: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Get a conversation by ID
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails or stored metadata
    /// cannot be parsed.
    pub async fn get_conversation(&self, conversation_id: &str) -> AppResult<Option<Conversation>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = $1")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Failed to get conversation: {e}")))?;

        row.as_ref().map(row_to_conversation).transpose()
    }

    /// List conversations, most recently updated first
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn list_conversations(&self, limit: i64) -> AppResult<Vec<Conversation>> {
        let rows = sqlx::query("SELECT * FROM conversations ORDER BY updated_at DESC LIMIT $1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Failed to list conversations: {e}")))?;

        rows.iter().map(row_to_conversation).collect()
    }

    /// Delete a conversation and all dependent rows
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn delete_conversation(&self, conversation_id: &str) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM conversations WHERE id = $1")
            .bind(conversation_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Failed to delete conversation: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    /// Append a message with the next gapless sequence number
    ///
    /// Sequence assignment and the conversation counter bump run in one
    /// transaction so concurrent appends cannot collide or leave gaps.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for unknown conversations, or an error if
    /// the database operation fails.
    pub async fn append_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
        token_count: Option<u32>,
    ) -> AppResult<MessageRecord> {
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::database(format!("Failed to begin transaction: {e}")))?;

        // Bump the counter first; zero rows means the conversation does not
        // exist and the transaction rolls back untouched.
        let updated = sqlx::query(
            r"
            UPDATE conversations
            SET message_count = message_count + 1, updated_at = $1
            WHERE id = $2
            ",
        )
        .bind(&now)
        .bind(conversation_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::database(format!("Failed to bump message count: {e}")))?;

        if updated.rows_affected() == 0 {
            return Err(AppError::not_found(format!(
                "Conversation {conversation_id}"
            )));
        }

        let sequence: i64 = sqlx::query(
            "SELECT COALESCE(MAX(sequence), 0) + 1 AS next_seq FROM messages WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::database(format!("Failed to assign message sequence: {e}")))?
        .get("next_seq");

        sqlx::query(
            r"
            INSERT INTO messages (id, conversation_id, role, content, sequence, token_count, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(role.as_str())
        .bind(content)
        .bind(sequence)
        .bind(token_count.map(i64::from))
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::database(format!("Failed to insert message: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| AppError::database(format!("Failed to commit message append: {e}")))?;

        Ok(MessageRecord {
            id,
            conversation_id: conversation_id.to_owned(),
            role: role.as_str().to_owned(),
            content: content.to_owned(),
            sequence,
            token_count: token_count.map(i64::from),
            cost: None,
            created_at: now,
        })
    }

    /// Get all messages for a conversation in sequence order
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn get_messages(&self, conversation_id: &str) -> AppResult<Vec<MessageRecord>> {
        let rows = sqlx::query(
            r"
            SELECT id, conversation_id, role, content, sequence, token_count, cost, created_at
            FROM messages
            WHERE conversation_id = $1
            ORDER BY sequence ASC
            ",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to get messages: {e}")))?;

        let messages = rows
            .into_iter()
            .map(|r| MessageRecord {
                id: r.get("id"),
                conversation_id: r.get("conversation_id"),
                role: r.get("role"),
                content: r.get("content"),
                sequence: r.get("sequence"),
                token_count: r.get("token_count"),
                cost: r.get("cost"),
                created_at: r.get("created_at"),
            })
            .collect();

        Ok(messages)
    }

    /// Commit a completed provider switch in one transaction
    ///
    /// Closes the open session, opens the new one, flips the binding,
    /// appends the switch record, and replaces the stored context plan.
    /// Either every effect lands or none does; a failed switch leaves the
    /// conversation bound exactly as it was.
    ///
    /// # Errors
    ///
    /// Returns an error if any database operation in the transaction fails.
    pub async fn record_provider_switch(
        &self,
        conversation: &Conversation,
        record: &SwitchRecord,
        plan: Option<&ContextPlan>,
    ) -> AppResult<Conversation> {
        let now = chrono::Utc::now().to_rfc3339();

        let mut log = conversation.switch_log.clone();
        log.push(record.clone());
        let log_json = serde_json::to_string(&log)
            .map_err(|e| AppError::serialization(format!("Failed to encode switch log: {e}")))?;
        let plan_json = plan
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| AppError::serialization(format!("Failed to encode context plan: {e}")))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::database(format!("Failed to begin transaction: {e}")))?;

        super::sessions::flip_session(
            &mut tx,
            conversation,
            &record.to_provider,
            &record.to_model,
            record.switch_type,
            record.reason.as_deref(),
        )
        .await?;

        sqlx::query(
            r"
            UPDATE conversations
            SET provider = $1, model = $2, switch_log = $3, context_plan = $4, updated_at = $5
            WHERE id = $6
            ",
        )
        .bind(&record.to_provider)
        .bind(&record.to_model)
        .bind(&log_json)
        .bind(&plan_json)
        .bind(&now)
        .bind(&conversation.id)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::database(format!("Failed to update provider binding: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| AppError::database(format!("Failed to commit provider switch: {e}")))?;

        self.get_conversation(&conversation.id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Conversation {}", conversation.id)))
    }

    /// Append a switch record without touching the binding or sessions
    ///
    /// Used for the failed-attempt trail left behind by fallback switching.
    ///
    /// # Errors
    ///
    /// Returns an error if the conversation does not exist or the database
    /// operation fails.
    pub async fn append_switch_attempt(
        &self,
        conversation_id: &str,
        record: &SwitchRecord,
    ) -> AppResult<()> {
        let conversation = self
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Conversation {conversation_id}")))?;

        let mut log = conversation.switch_log;
        log.push(record.clone());
        let log_json = serde_json::to_string(&log)
            .map_err(|e| AppError::serialization(format!("Failed to encode switch log: {e}")))?;
        let now = chrono::Utc::now().to_rfc3339();

        sqlx::query("UPDATE conversations SET switch_log = $1, updated_at = $2 WHERE id = $3")
            .bind(&log_json)
            .bind(&now)
            .bind(conversation_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Failed to record switch attempt: {e}")))?;

        Ok(())
    }
}

/// Hydrate a conversation row, parsing JSON metadata columns
fn row_to_conversation(row: &sqlx::sqlite::SqliteRow) -> AppResult<Conversation> {
    let switch_log_json: String = row.get("switch_log");
    let switch_log: Vec<SwitchRecord> = serde_json::from_str(&switch_log_json)
        .map_err(|e| AppError::serialization(format!("Failed to parse switch log: {e}")))?;

    let context_plan_json: Option<String> = row.get("context_plan");
    let context_plan: Option<ContextPlan> = context_plan_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| AppError::serialization(format!("Failed to parse context plan: {e}")))?;

    Ok(Conversation {
        id: row.get("id"),
        title: row.get("title"),
        provider: row.get("provider"),
        model: row.get("model"),
        system_prompt: row.get("system_prompt"),
        total_cost: row.get("total_cost"),
        total_input_tokens: row.get("total_input_tokens"),
        total_output_tokens: row.get("total_output_tokens"),
        message_count: row.get("message_count"),
        switch_log,
        context_plan,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
