// ABOUTME: Provider session persistence with close-then-open lifecycle
// ABOUTME: Enforces the single-open-session invariant per conversation
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright (c) 2025 Switchboard Contributors

use super::conversations::Conversation;
use super::Database;
use crate::errors::{AppError, AppResult};
use crate::models::SwitchType;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

/// One contiguous span of a conversation served by a single provider/model
///
/// Sessions tile the conversation timeline: at most one session per
/// conversation is open, and a switch closes the old one in the same
/// transaction that opens the new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSession {
    /// Unique session ID
    pub id: String,
    /// Conversation this session belongs to
    pub conversation_id: String,
    /// Provider serving this span
    pub provider: String,
    /// Model serving this span
    pub model: String,
    /// How the session began (initial, manual, fallback)
    pub switch_type: String,
    /// Caller-supplied reason for the switch, if any
    pub reason: Option<String>,
    /// Conversation message count when the session opened
    pub message_count_at_start: i64,
    /// Conversation cost when the session opened
    pub cost_at_start: f64,
    /// Conversation message count when the session closed
    pub message_count_at_end: Option<i64>,
    /// Conversation cost when the session closed
    pub cost_at_end: Option<f64>,
    /// Session start timestamp (RFC 3339)
    pub started_at: String,
    /// Session end timestamp, None while open
    pub ended_at: Option<String>,
}

impl ProviderSession {
    /// Whether this session is still serving the conversation
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Messages exchanged during this session, if it has closed
    #[must_use]
    pub fn messages_in_session(&self) -> Option<i64> {
        self.message_count_at_end
            .map(|end| end - self.message_count_at_start)
    }

    /// Cost accrued during this session, if it has closed
    #[must_use]
    pub fn cost_in_session(&self) -> Option<f64> {
        self.cost_at_end.map(|end| end - self.cost_at_start)
    }
}

/// Close any open session and open a new one inside the caller's transaction
///
/// This is the only place sessions are mutated. Snapshots of the
/// conversation counters are taken from the caller's view of the
/// conversation so close and open agree on the boundary.
pub(super) async fn flip_session(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    conversation: &Conversation,
    provider: &str,
    model: &str,
    switch_type: SwitchType,
    reason: Option<&str>,
) -> AppResult<ProviderSession> {
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();

    sqlx::query(
        r"
        UPDATE provider_sessions
        SET ended_at = $1, message_count_at_end = $2, cost_at_end = $3
        WHERE conversation_id = $4 AND ended_at IS NULL
        ",
    )
    .bind(&now)
    .bind(conversation.message_count)
    .bind(conversation.total_cost)
    .bind(&conversation.id)
    .execute(&mut **tx)
    .await
    .map_err(|e| AppError::database(format!("Failed to close open session: {e}")))?;

    sqlx::query(
        r"
        INSERT INTO provider_sessions
            (id, conversation_id, provider, model, switch_type, reason,
             message_count_at_start, cost_at_start, started_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ",
    )
    .bind(&id)
    .bind(&conversation.id)
    .bind(provider)
    .bind(model)
    .bind(switch_type.as_str())
    .bind(reason)
    .bind(conversation.message_count)
    .bind(conversation.total_cost)
    .bind(&now)
    .execute(&mut **tx)
    .await
    .map_err(|e| AppError::database(format!("Failed to open session: {e}")))?;

    Ok(ProviderSession {
        id,
        conversation_id: conversation.id.clone(),
        provider: provider.to_owned(),
        model: model.to_owned(),
        switch_type: switch_type.as_str().to_owned(),
        reason: reason.map(str::to_owned),
        message_count_at_start: conversation.message_count,
        cost_at_start: conversation.total_cost,
        message_count_at_end: None,
        cost_at_end: None,
        started_at: now,
        ended_at: None,
    })
}

impl Database {
    /// Create the provider sessions table
    pub(super) async fn migrate_sessions(&self) -> AppResult<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS provider_sessions (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                switch_type TEXT NOT NULL CHECK (switch_type IN ('initial', 'manual', 'fallback')),
                reason TEXT,
                message_count_at_start INTEGER NOT NULL,
                cost_at_start REAL NOT NULL,
                message_count_at_end INTEGER,
                cost_at_end REAL,
                started_at TEXT NOT NULL,
                ended_at TEXT
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create provider_sessions table: {e}")))?;

        // At most one open session per conversation, enforced by the schema
        sqlx::query(
            r"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_provider_sessions_open
            ON provider_sessions(conversation_id) WHERE ended_at IS NULL
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create open session index: {e}")))?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_provider_sessions_conversation
            ON provider_sessions(conversation_id, started_at)
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create session index: {e}")))?;

        Ok(())
    }

    /// Open a session for the conversation, closing any open one first
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn start_session(
        &self,
        conversation: &Conversation,
        provider: &str,
        model: &str,
        switch_type: SwitchType,
        reason: Option<&str>,
    ) -> AppResult<ProviderSession> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::database(format!("Failed to begin transaction: {e}")))?;

        let session = flip_session(&mut tx, conversation, provider, model, switch_type, reason).await?;

        tx.commit()
            .await
            .map_err(|e| AppError::database(format!("Failed to commit session start: {e}")))?;

        Ok(session)
    }

    /// Get the open session for a conversation, if one exists
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn get_open_session(
        &self,
        conversation_id: &str,
    ) -> AppResult<Option<ProviderSession>> {
        let row = sqlx::query(
            "SELECT * FROM provider_sessions WHERE conversation_id = $1 AND ended_at IS NULL",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to get open session: {e}")))?;

        Ok(row.as_ref().map(row_to_session))
    }

    /// List all sessions for a conversation in chronological order
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn list_sessions(&self, conversation_id: &str) -> AppResult<Vec<ProviderSession>> {
        let rows = sqlx::query(
            r"
            SELECT * FROM provider_sessions
            WHERE conversation_id = $1
            ORDER BY started_at ASC, rowid ASC
            ",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to list sessions: {e}")))?;

        Ok(rows.iter().map(row_to_session).collect())
    }

    /// Query sessions across conversations with optional filters
    ///
    /// Unset filters match everything; `limit` of None returns all rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn query_sessions(
        &self,
        conversation_id: Option<&str>,
        provider: Option<&str>,
        switch_type: Option<&str>,
        limit: Option<i64>,
    ) -> AppResult<Vec<ProviderSession>> {
        let rows = sqlx::query(
            r"
            SELECT * FROM provider_sessions
            WHERE ($1 IS NULL OR conversation_id = $1)
              AND ($2 IS NULL OR provider = $2)
              AND ($3 IS NULL OR switch_type = $3)
            ORDER BY started_at DESC, rowid DESC
            LIMIT COALESCE($4, -1)
            ",
        )
        .bind(conversation_id)
        .bind(provider)
        .bind(switch_type)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to query sessions: {e}")))?;

        Ok(rows.iter().map(row_to_session).collect())
    }

    /// Count sessions grouped by switch type, optionally per conversation
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn session_type_counts(
        &self,
        conversation_id: Option<&str>,
    ) -> AppResult<Vec<(String, i64)>> {
        let rows = sqlx::query(
            r"
            SELECT switch_type, COUNT(*) AS session_count
            FROM provider_sessions
            WHERE ($1 IS NULL OR conversation_id = $1)
            GROUP BY switch_type
            ",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to count sessions by type: {e}")))?;

        Ok(rows
            .iter()
            .map(|r| (r.get("switch_type"), r.get("session_count")))
            .collect())
    }

    /// Count sessions grouped by provider, optionally per conversation
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn session_provider_counts(
        &self,
        conversation_id: Option<&str>,
    ) -> AppResult<Vec<(String, i64)>> {
        let rows = sqlx::query(
            r"
            SELECT provider, COUNT(*) AS session_count
            FROM provider_sessions
            WHERE ($1 IS NULL OR conversation_id = $1)
            GROUP BY provider
            ORDER BY session_count DESC
            ",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to count sessions by provider: {e}")))?;

        Ok(rows
            .iter()
            .map(|r| (r.get("provider"), r.get("session_count")))
            .collect())
    }
}

fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> ProviderSession {
    ProviderSession {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        provider: row.get("provider"),
        model: row.get("model"),
        switch_type: row.get("switch_type"),
        reason: row.get("reason"),
        message_count_at_start: row.get("message_count_at_start"),
        cost_at_start: row.get("cost_at_start"),
        message_count_at_end: row.get("message_count_at_end"),
        cost_at_end: row.get("cost_at_end"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
    }
}
