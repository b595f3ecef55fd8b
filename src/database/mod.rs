// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Database Management
//!
//! SQLite persistence for conversations, messages, provider sessions,
//! pricing overrides, and cost records. Schema migrations run on connect and
//! are idempotent; every table is created with `IF NOT EXISTS`.
//!
//! Mutations that must be atomic (session flips, switch commits, cost
//! application) run inside a single transaction so no partially-switched
//! state is ever visible to readers.

mod conversations;
mod costs;
mod pricing;
mod sessions;

pub use conversations::{Conversation, MessageRecord, NewConversation};
pub use costs::{CostRecord, NewCostRecord, ProviderCostRollup};
pub use pricing::{NewPricingOverride, PricingOverrideRecord};
pub use sessions::ProviderSession;

use crate::errors::{AppError, AppResult};
use sqlx::{Pool, Sqlite, SqlitePool};
use tracing::debug;

/// Database manager for gateway persistence
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Create a new database connection and run migrations
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or a
    /// migration fails.
    pub async fn new(database_url: &str) -> AppResult<Self> {
        // Ensure SQLite creates the database file if it doesn't exist
        let connection_options = if database_url.starts_with("sqlite:") && !database_url.contains("memory") {
            format!("{database_url}?mode=rwc")
        } else {
            database_url.to_owned()
        };

        let pool = SqlitePool::connect(&connection_options)
            .await
            .map_err(|e| AppError::database(format!("Failed to connect to database: {e}")))?;

        let db = Self { pool };

        db.migrate().await?;
        debug!("Database connected and migrated: {database_url}");

        Ok(db)
    }

    /// Get a reference to the database pool for advanced operations
    #[must_use]
    pub const fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Run database migrations
    ///
    /// # Errors
    ///
    /// Returns an error if table or index creation fails.
    pub async fn migrate(&self) -> AppResult<()> {
        self.migrate_conversations().await?;
        self.migrate_sessions().await?;
        self.migrate_pricing().await?;
        self.migrate_costs().await?;
        Ok(())
    }
}
