//! Durable history storage over a relational database (sqlx).
//!
//! One row per user in `conversation_history`:
//! `user_id TEXT PRIMARY KEY, messages TEXT, updated_at TEXT`. `messages` holds
//! the JSON array of stored messages, `updated_at` an RFC 3339 timestamp. The
//! table is managed outside this crate. Calls are bounded by the owning
//! [`Storage`](super::Storage); the pool itself only bounds connection
//! acquisition.

use super::HistoryStore;
use crate::conversation::{ConversationLog, Message};
use crate::error::StorageError;

use anyhow::Context as _;
use async_trait::async_trait;
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row as _};

use std::time::Duration;

/// Conversation history stored in PostgreSQL (or SQLite) through `sqlx::Any`.
#[derive(Debug, Clone)]
pub struct SqlHistoryStore {
    pool: AnyPool,
}

impl SqlHistoryStore {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    /// Create a pool that connects on first use, so an unreachable database
    /// surfaces through `probe` instead of failing construction.
    pub fn connect_lazy(
        database_url: &str,
        acquire_timeout: Duration,
    ) -> Result<Self, StorageError> {
        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(database_url)
            .context("invalid database URL")?;

        Ok(Self::new(pool))
    }
}

#[async_trait]
impl HistoryStore for SqlHistoryStore {
    fn name(&self) -> &'static str {
        "sql"
    }

    async fn load(&self, user_id: &str) -> Result<ConversationLog, StorageError> {
        let row = sqlx::query("SELECT messages FROM conversation_history WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(ConversationLog::new());
        };

        let raw: String = row.try_get("messages").map_err(|error| StorageError::Decode {
            user_id: user_id.to_string(),
            reason: error.to_string(),
        })?;

        let messages: Vec<Message> =
            serde_json::from_str(&raw).map_err(|error| StorageError::Decode {
                user_id: user_id.to_string(),
                reason: error.to_string(),
            })?;

        Ok(ConversationLog::from_messages(messages))
    }

    async fn save(&self, user_id: &str, log: &ConversationLog) -> Result<(), StorageError> {
        let messages = serde_json::to_string(log).context("failed to serialize history")?;
        let updated_at = chrono::Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO conversation_history (user_id, messages, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE SET
                messages = excluded.messages,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(messages)
        .bind(updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn clear(&self, user_id: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM conversation_history WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn probe(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
