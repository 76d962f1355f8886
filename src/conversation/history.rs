//! Per-user history management: retention, per-user locking, persistence.

use super::{ConversationLog, Message};
use crate::storage::{Storage, StorageRequest};
use crate::error::Result;

use tokio::sync::{Mutex, OwnedMutexGuard};

use std::collections::HashMap;
use std::sync::Arc;

/// Default number of messages retained per user.
pub const DEFAULT_RETENTION: usize = 50;

/// Owns every read and write of conversation logs.
///
/// Appends are read-modify-write cycles and run under a lock keyed by user
/// id, so concurrent requests for one user never lose each other's
/// messages. Reads take no lock.
pub struct HistoryManager {
    storage: Arc<Storage>,
    retention: usize,
    locks: UserLocks,
}

impl HistoryManager {
    pub fn new(storage: Arc<Storage>, retention: usize) -> Self {
        Self {
            storage,
            retention: retention.max(1),
            locks: UserLocks::default(),
        }
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Start a session whose storage fallback state spans several calls.
    pub async fn session(&self) -> HistorySession<'_> {
        HistorySession {
            manager: self,
            storage: self.storage.request().await,
        }
    }

    /// The `max_messages` most recent messages, oldest first.
    pub async fn get_history(&self, user_id: &str, max_messages: usize) -> Vec<Message> {
        self.session().await.get_history(user_id, max_messages).await
    }

    pub async fn append(&self, user_id: &str, message: Message) -> Result<()> {
        self.session().await.append(user_id, message).await
    }

    pub async fn append_turn(&self, user_id: &str, messages: Vec<Message>) -> Result<()> {
        self.session().await.append_turn(user_id, messages).await
    }

    pub async fn clear(&self, user_id: &str) -> Result<()> {
        self.session().await.clear(user_id).await
    }
}

/// History access for one request.
pub struct HistorySession<'a> {
    manager: &'a HistoryManager,
    storage: StorageRequest<'a>,
}

impl HistorySession<'_> {
    /// Whether this session had to fall back to the local history file.
    pub fn is_degraded(&self) -> bool {
        self.storage.is_degraded()
    }

    pub async fn get_history(&mut self, user_id: &str, max_messages: usize) -> Vec<Message> {
        let mut log = self.storage.load(user_id).await;
        log.truncate_to(self.manager.retention);
        log.recent(max_messages).to_vec()
    }

    pub async fn append(&mut self, user_id: &str, message: Message) -> Result<()> {
        self.append_turn(user_id, vec![message]).await
    }

    /// Append several messages in one locked load/append/save cycle.
    pub async fn append_turn(&mut self, user_id: &str, messages: Vec<Message>) -> Result<()> {
        let _user_guard = self.manager.locks.lock(user_id).await;

        let mut log = self.storage.load(user_id).await;
        let appended = messages.len();
        for message in messages {
            log.push(message);
        }
        log.truncate_to(self.manager.retention);

        self.storage.save(user_id, &log).await?;
        tracing::debug!(%user_id, appended, stored = log.len(), "history persisted");
        Ok(())
    }

    pub async fn clear(&mut self, user_id: &str) -> Result<()> {
        let _user_guard = self.manager.locks.lock(user_id).await;
        self.storage.clear(user_id).await?;
        tracing::info!(%user_id, "history cleared");
        Ok(())
    }
}

/// Async locks keyed by user id. Entries no one holds are pruned.
#[derive(Default)]
struct UserLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl UserLocks {
    async fn lock(&self, user_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(user_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    async fn tracked(&self) -> usize {
        self.locks.lock().await.len()
    }
}
