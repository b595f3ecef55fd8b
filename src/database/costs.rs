// ABOUTME: Cost record persistence and per-provider rollup queries
// ABOUTME: Applies cost attribution and conversation totals in one transaction
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright (c) 2025 Switchboard Contributors

use super::Database;
use crate::errors::{AppError, AppResult};
use crate::models::CostBreakdown;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

/// One persisted cost attribution for a single exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    /// Unique record ID
    pub id: String,
    /// Conversation the cost belongs to
    pub conversation_id: String,
    /// Provider session that served the exchange
    pub session_id: String,
    /// Assistant message the cost is attributed to, if known
    pub message_id: Option<String>,
    /// Provider that served the exchange
    pub provider: String,
    /// Model that served the exchange
    pub model: String,
    /// Prompt tokens consumed
    pub input_tokens: i64,
    /// Completion tokens generated
    pub output_tokens: i64,
    /// Cost attributed to prompt tokens
    pub input_cost: f64,
    /// Cost attributed to completion tokens
    pub output_cost: f64,
    /// Total cost of the exchange
    pub total_cost: f64,
    /// Currency of all amounts
    pub currency: String,
    /// Pricing resolution tier backing the rates
    pub pricing_source: String,
    /// Creation timestamp (RFC 3339)
    pub created_at: String,
}

/// Parameters for recording an exchange cost
#[derive(Debug, Clone)]
pub struct NewCostRecord {
    /// Conversation the cost belongs to
    pub conversation_id: String,
    /// Open provider session serving the conversation
    pub session_id: String,
    /// Assistant message to annotate with the cost, if known
    pub message_id: Option<String>,
    /// Itemized cost of the exchange
    pub breakdown: CostBreakdown,
}

/// Aggregated spend for one provider within a currency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCostRollup {
    /// Provider name
    pub provider: String,
    /// Currency of the aggregated amounts
    pub currency: String,
    /// Number of cost records aggregated
    pub record_count: i64,
    /// Total prompt tokens
    pub total_input_tokens: i64,
    /// Total completion tokens
    pub total_output_tokens: i64,
    /// Total spend
    pub total_cost: f64,
}

impl Database {
    /// Create the cost records table
    pub(super) async fn migrate_costs(&self) -> AppResult<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS cost_records (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                session_id TEXT NOT NULL REFERENCES provider_sessions(id) ON DELETE CASCADE,
                message_id TEXT REFERENCES messages(id) ON DELETE SET NULL,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                input_cost REAL NOT NULL,
                output_cost REAL NOT NULL,
                total_cost REAL NOT NULL,
                currency TEXT NOT NULL,
                pricing_source TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create cost_records table: {e}")))?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_cost_records_conversation
            ON cost_records(conversation_id, created_at)
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create cost records index: {e}")))?;

        Ok(())
    }

    /// Record an exchange cost and roll it into the conversation totals
    ///
    /// The insert, the conversation counter update, and the optional message
    /// annotation run in one transaction, so the conversation total always
    /// equals the sum of its cost records.
    ///
    /// # Errors
    ///
    /// Returns an error if any database operation in the transaction fails.
    pub async fn apply_cost_record(&self, new: &NewCostRecord) -> AppResult<CostRecord> {
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let breakdown = &new.breakdown;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::database(format!("Failed to begin transaction: {e}")))?;

        sqlx::query(
            r"
            INSERT INTO cost_records
                (id, conversation_id, session_id, message_id, provider, model,
                 input_tokens, output_tokens, input_cost, output_cost, total_cost,
                 currency, pricing_source, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ",
        )
        .bind(&id)
        .bind(&new.conversation_id)
        .bind(&new.session_id)
        .bind(&new.message_id)
        .bind(&breakdown.provider)
        .bind(&breakdown.model)
        .bind(i64::from(breakdown.input_tokens))
        .bind(i64::from(breakdown.output_tokens))
        .bind(breakdown.input_cost)
        .bind(breakdown.output_cost)
        .bind(breakdown.total_cost)
        .bind(&breakdown.currency)
        .bind(breakdown.pricing_source.as_str())
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::database(format!("Failed to insert cost record: {e}")))?;

        let updated = sqlx::query(
            r"
            UPDATE conversations
            SET total_cost = total_cost + $1,
                total_input_tokens = total_input_tokens + $2,
                total_output_tokens = total_output_tokens + $3,
                updated_at = $4
            WHERE id = $5
            ",
        )
        .bind(breakdown.total_cost)
        .bind(i64::from(breakdown.input_tokens))
        .bind(i64::from(breakdown.output_tokens))
        .bind(&now)
        .bind(&new.conversation_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::database(format!("Failed to update conversation totals: {e}")))?;

        if updated.rows_affected() == 0 {
            return Err(AppError::not_found(format!(
                "Conversation {}",
                new.conversation_id
            )));
        }

        if let Some(message_id) = &new.message_id {
            sqlx::query("UPDATE messages SET cost = $1, token_count = $2 WHERE id = $3")
                .bind(breakdown.total_cost)
                .bind(i64::from(breakdown.output_tokens))
                .bind(message_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| AppError::database(format!("Failed to annotate message cost: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| AppError::database(format!("Failed to commit cost record: {e}")))?;

        Ok(CostRecord {
            id,
            conversation_id: new.conversation_id.clone(),
            session_id: new.session_id.clone(),
            message_id: new.message_id.clone(),
            provider: breakdown.provider.clone(),
            model: breakdown.model.clone(),
            input_tokens: i64::from(breakdown.input_tokens),
            output_tokens: i64::from(breakdown.output_tokens),
            input_cost: breakdown.input_cost,
            output_cost: breakdown.output_cost,
            total_cost: breakdown.total_cost,
            currency: breakdown.currency.clone(),
            pricing_source: breakdown.pricing_source.as_str().to_owned(),
            created_at: now,
        })
    }

    /// Get all cost records for a conversation in insertion order
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn get_cost_records(&self, conversation_id: &str) -> AppResult<Vec<CostRecord>> {
        let rows = sqlx::query(
            r"
            SELECT * FROM cost_records
            WHERE conversation_id = $1
            ORDER BY created_at ASC, rowid ASC
            ",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to get cost records: {e}")))?;

        Ok(rows.iter().map(row_to_cost_record).collect())
    }

    /// Aggregate spend per provider and currency, optionally per conversation
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn provider_cost_rollup(
        &self,
        conversation_id: Option<&str>,
    ) -> AppResult<Vec<ProviderCostRollup>> {
        let rows = sqlx::query(
            r"
            SELECT provider, currency,
                   COUNT(*) AS record_count,
                   SUM(input_tokens) AS total_input_tokens,
                   SUM(output_tokens) AS total_output_tokens,
                   SUM(total_cost) AS total_cost
            FROM cost_records
            WHERE ($1 IS NULL OR conversation_id = $1)
            GROUP BY provider, currency
            ORDER BY total_cost DESC
            ",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to roll up provider costs: {e}")))?;

        Ok(rows
            .iter()
            .map(|r| ProviderCostRollup {
                provider: r.get("provider"),
                currency: r.get("currency"),
                record_count: r.get("record_count"),
                total_input_tokens: r.get("total_input_tokens"),
                total_output_tokens: r.get("total_output_tokens"),
                total_cost: r.get("total_cost"),
            })
            .collect())
    }
}

fn row_to_cost_record(row: &sqlx::sqlite::SqliteRow) -> CostRecord {
    CostRecord {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        session_id: row.get("session_id"),
        message_id: row.get("message_id"),
        provider: row.get("provider"),
        model: row.get("model"),
        input_tokens: row.get("input_tokens"),
        output_tokens: row.get("output_tokens"),
        input_cost: row.get("input_cost"),
        output_cost: row.get("output_cost"),
        total_cost: row.get("total_cost"),
        currency: row.get("currency"),
        pricing_source: row.get("pricing_source"),
        created_at: row.get("created_at"),
    }
}
