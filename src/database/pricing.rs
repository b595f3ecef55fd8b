// ABOUTME: Stored pricing override persistence with retire-then-insert history
// ABOUTME: At most one live override exists per provider/model pair
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright (c) 2025 Switchboard Contributors

use super::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{BillingModel, PricingDescriptor, PricingSource, PricingUnit};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

/// A stored pricing override row
///
/// Overrides are never updated in place: storing a new one retires the
/// previous row, so the table doubles as a pricing change history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingOverrideRecord {
    /// Unique override ID
    pub id: String,
    /// Provider the override applies to
    pub provider: String,
    /// Model the override applies to
    pub model: String,
    /// Input rate per billing unit
    pub input_rate: f64,
    /// Output rate per billing unit
    pub output_rate: f64,
    /// Flat per-request rate, if the unit is per-request
    pub flat_rate: Option<f64>,
    /// Billing unit string form
    pub unit: String,
    /// ISO 4217 currency code
    pub currency: String,
    /// Billing model string form
    pub billing_model: String,
    /// When the override takes effect (RFC 3339)
    pub effective_at: String,
    /// When the override was superseded, None while live
    pub retired_at: Option<String>,
    /// Creation timestamp (RFC 3339)
    pub created_at: String,
}

impl PricingOverrideRecord {
    /// Convert the stored row into a resolved pricing descriptor
    ///
    /// # Errors
    ///
    /// Returns an error if stored enum or timestamp columns fail to parse.
    pub fn to_descriptor(&self) -> AppResult<PricingDescriptor> {
        let unit = PricingUnit::parse_str(&self.unit).ok_or_else(|| {
            AppError::serialization(format!("Unknown pricing unit '{}'", self.unit))
        })?;
        let billing_model = BillingModel::parse_str(&self.billing_model).ok_or_else(|| {
            AppError::serialization(format!("Unknown billing model '{}'", self.billing_model))
        })?;
        let effective_at = DateTime::parse_from_rfc3339(&self.effective_at)
            .map_err(|e| {
                AppError::serialization(format!("Invalid effective_at timestamp: {e}"))
            })?
            .with_timezone(&Utc);

        Ok(PricingDescriptor {
            provider: self.provider.clone(),
            model: self.model.clone(),
            input_rate: self.input_rate,
            output_rate: self.output_rate,
            flat_rate: self.flat_rate,
            unit,
            currency: self.currency.clone(),
            billing_model,
            effective_at,
            source: PricingSource::StoredOverride,
        })
    }
}

/// Parameters for storing a pricing override
#[derive(Debug, Clone)]
pub struct NewPricingOverride {
    /// Provider the override applies to
    pub provider: String,
    /// Model the override applies to
    pub model: String,
    /// Input rate per billing unit
    pub input_rate: f64,
    /// Output rate per billing unit
    pub output_rate: f64,
    /// Flat per-request rate, required when `unit` is per-request
    pub flat_rate: Option<f64>,
    /// Billing unit of the rates
    pub unit: PricingUnit,
    /// ISO 4217 currency code
    pub currency: String,
    /// How usage is billed
    pub billing_model: BillingModel,
    /// When the override takes effect; defaults to now
    pub effective_at: Option<DateTime<Utc>>,
}

impl Database {
    /// Create the pricing overrides table
    pub(super) async fn migrate_pricing(&self) -> AppResult<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS pricing_overrides (
                id TEXT PRIMARY KEY,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                input_rate REAL NOT NULL,
                output_rate REAL NOT NULL,
                flat_rate REAL,
                unit TEXT NOT NULL CHECK (unit IN ('per_1k_tokens', 'per_1m_tokens', 'per_request')),
                currency TEXT NOT NULL,
                billing_model TEXT NOT NULL CHECK (billing_model IN ('pay_per_use', 'subscription_included')),
                effective_at TEXT NOT NULL,
                retired_at TEXT,
                created_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create pricing_overrides table: {e}")))?;

        // One live override per provider/model pair
        sqlx::query(
            r"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_pricing_overrides_live
            ON pricing_overrides(provider, model) WHERE retired_at IS NULL
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create live override index: {e}")))?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_pricing_overrides_lookup
            ON pricing_overrides(provider, model, created_at)
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to create override lookup index: {e}")))?;

        Ok(())
    }

    /// Store a pricing override, retiring any live one for the same pair
    ///
    /// Retire and insert run in one transaction so the pair never has two
    /// live overrides or none mid-change.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn store_pricing_override(
        &self,
        new: &NewPricingOverride,
    ) -> AppResult<PricingOverrideRecord> {
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let effective_at = new
            .effective_at
            .map_or_else(|| now.clone(), |t| t.to_rfc3339());

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::database(format!("Failed to begin transaction: {e}")))?;

        sqlx::query(
            r"
            UPDATE pricing_overrides
            SET retired_at = $1
            WHERE provider = $2 AND model = $3 AND retired_at IS NULL
            ",
        )
        .bind(&now)
        .bind(&new.provider)
        .bind(&new.model)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::database(format!("Failed to retire pricing override: {e}")))?;

        sqlx::query(
            r"
            INSERT INTO pricing_overrides
                (id, provider, model, input_rate, output_rate, flat_rate,
                 unit, currency, billing_model, effective_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ",
        )
        .bind(&id)
        .bind(&new.provider)
        .bind(&new.model)
        .bind(new.input_rate)
        .bind(new.output_rate)
        .bind(new.flat_rate)
        .bind(new.unit.as_str())
        .bind(&new.currency)
        .bind(new.billing_model.as_str())
        .bind(&effective_at)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::database(format!("Failed to insert pricing override: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| AppError::database(format!("Failed to commit pricing override: {e}")))?;

        Ok(PricingOverrideRecord {
            id,
            provider: new.provider.clone(),
            model: new.model.clone(),
            input_rate: new.input_rate,
            output_rate: new.output_rate,
            flat_rate: new.flat_rate,
            unit: new.unit.as_str().to_owned(),
            currency: new.currency.clone(),
            billing_model: new.billing_model.as_str().to_owned(),
            effective_at,
            retired_at: None,
            created_at: now,
        })
    }

    /// Get the live pricing override for a provider/model pair, if any
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn get_pricing_override(
        &self,
        provider: &str,
        model: &str,
    ) -> AppResult<Option<PricingOverrideRecord>> {
        let row = sqlx::query(
            r"
            SELECT * FROM pricing_overrides
            WHERE provider = $1 AND model = $2 AND retired_at IS NULL
            ",
        )
        .bind(provider)
        .bind(model)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to get pricing override: {e}")))?;

        Ok(row.as_ref().map(row_to_override))
    }

    /// List all overrides ever stored for a pair, newest first
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn list_pricing_history(
        &self,
        provider: &str,
        model: &str,
    ) -> AppResult<Vec<PricingOverrideRecord>> {
        let rows = sqlx::query(
            r"
            SELECT * FROM pricing_overrides
            WHERE provider = $1 AND model = $2
            ORDER BY created_at DESC, rowid DESC
            ",
        )
        .bind(provider)
        .bind(model)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to list pricing history: {e}")))?;

        Ok(rows.iter().map(row_to_override).collect())
    }
}

fn row_to_override(row: &sqlx::sqlite::SqliteRow) -> PricingOverrideRecord {
    PricingOverrideRecord {
        id: row.get("id"),
        provider: row.get("provider"),
        model: row.get("model"),
        input_rate: row.get("input_rate"),
        output_rate: row.get("output_rate"),
        flat_rate: row.get("flat_rate"),
        unit: row.get("unit"),
        currency: row.get("currency"),
        billing_model: row.get("billing_model"),
        effective_at: row.get("effective_at"),
        retired_at: row.get("retired_at"),
        created_at: row.get("created_at"),
    }
}
