//! History storage backends and the durable/local failover between them.
//!
//! Two [`HistoryStore`] implementations exist: [`SqlHistoryStore`] keeps one
//! row per user in a relational database, and [`FileHistoryStore`] keeps a
//! single JSON document on local disk. [`Storage`] is chosen once at startup
//! from a health probe and hands out per-request [`StorageRequest`] handles
//! that fall back to the local file whenever the durable backend cannot be
//! reached.

pub mod file;
pub mod sql;

pub use file::FileHistoryStore;
pub use sql::SqlHistoryStore;

use crate::config::StorageConfig;
use crate::conversation::ConversationLog;
use crate::error::{Result, StorageError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound on a durable call when none is configured.
pub const DEFAULT_DURABLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Persistence contract shared by every history backend.
///
/// `load` of an unknown user is an empty log, never an error. `save`
/// replaces the whole log for a user atomically.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Short backend name used in logs and status output.
    fn name(&self) -> &'static str;

    async fn load(&self, user_id: &str) -> std::result::Result<ConversationLog, StorageError>;

    async fn save(
        &self,
        user_id: &str,
        log: &ConversationLog,
    ) -> std::result::Result<(), StorageError>;

    async fn clear(&self, user_id: &str) -> std::result::Result<(), StorageError>;

    /// Health check. Backends that cannot become unreachable keep the default.
    async fn probe(&self) -> std::result::Result<(), StorageError> {
        Ok(())
    }
}

/// What to do after the durable backend fails.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Use the local file for the rest of the failing request only.
    #[default]
    #[serde(alias = "per-request")]
    PerRequest,
    /// Stay on the local file until a re-probe succeeds (or for the process
    /// lifetime when no re-probe interval is configured).
    #[serde(alias = "permanent")]
    Sticky,
}

impl FallbackPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "per_request" | "per-request" => Some(FallbackPolicy::PerRequest),
            "sticky" | "permanent" => Some(FallbackPolicy::Sticky),
            _ => None,
        }
    }
}

/// Which backend currently serves requests.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Durable backend in use, local file as fallback.
    Durable,
    /// Durable backend configured but downgraded to the local file.
    Degraded,
    /// No durable backend configured.
    LocalOnly,
}

impl std::fmt::Display for StorageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageMode::Durable => write!(f, "durable"),
            StorageMode::Degraded => write!(f, "degraded"),
            StorageMode::LocalOnly => write!(f, "local_only"),
        }
    }
}

/// The active storage choice, shared by every request.
pub struct Storage {
    durable: Option<Arc<dyn HistoryStore>>,
    local: Arc<dyn HistoryStore>,
    policy: FallbackPolicy,
    reprobe_interval: Option<Duration>,
    /// Upper bound on every durable backend call.
    durable_timeout: Duration,
    /// Set while a sticky downgrade is in effect; holds the time of the last
    /// failed probe or request.
    degraded_since: Mutex<Option<Instant>>,
}

impl Storage {
    /// Storage with no durable backend at all.
    pub fn local_only(local: Arc<dyn HistoryStore>) -> Self {
        Self {
            durable: None,
            local,
            policy: FallbackPolicy::PerRequest,
            reprobe_interval: None,
            durable_timeout: DEFAULT_DURABLE_TIMEOUT,
            degraded_since: Mutex::new(None),
        }
    }

    /// Durable storage with a local fallback.
    pub fn with_fallback(
        durable: Arc<dyn HistoryStore>,
        local: Arc<dyn HistoryStore>,
        policy: FallbackPolicy,
        reprobe_interval: Option<Duration>,
    ) -> Self {
        Self {
            durable: Some(durable),
            local,
            policy,
            reprobe_interval,
            durable_timeout: DEFAULT_DURABLE_TIMEOUT,
            degraded_since: Mutex::new(None),
        }
    }

    /// Bound every durable call by `timeout`. A timeout counts as the
    /// backend being unavailable.
    pub fn with_durable_timeout(mut self, timeout: Duration) -> Self {
        self.durable_timeout = timeout;
        self
    }

    /// Build storage from configuration, probing the durable backend once.
    ///
    /// An unreachable durable backend never fails startup: under the sticky
    /// policy the process starts downgraded, otherwise each request retries it.
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let local: Arc<dyn HistoryStore> =
            Arc::new(FileHistoryStore::new(config.history_file.clone()));

        let Some(database_url) = config.database_url.as_deref() else {
            tracing::info!(
                path = %config.history_file.display(),
                "no durable backend configured, using local history file"
            );
            return Ok(Self::local_only(local));
        };

        let durable: Arc<dyn HistoryStore> = Arc::new(SqlHistoryStore::connect_lazy(
            database_url,
            config.durable_timeout,
        )?);

        let storage = Self::with_fallback(
            durable,
            local,
            config.fallback_policy,
            config.reprobe_interval,
        )
        .with_durable_timeout(config.durable_timeout);
        storage.probe_at_startup().await;
        Ok(storage)
    }

    async fn probe_at_startup(&self) {
        let Some(durable) = &self.durable else {
            return;
        };

        match bounded(self.durable_timeout, "probe", durable.probe()).await {
            Ok(()) => {
                tracing::info!(backend = durable.name(), "durable history backend reachable");
            }
            Err(error) => {
                tracing::warn!(
                    %error,
                    backend = durable.name(),
                    policy = ?self.policy,
                    "durable history backend unreachable at startup, running in degraded mode"
                );
                if self.policy == FallbackPolicy::Sticky {
                    *self.degraded_since.lock().await = Some(Instant::now());
                }
            }
        }
    }

    pub async fn mode(&self) -> StorageMode {
        if self.durable.is_none() {
            StorageMode::LocalOnly
        } else if self.degraded_since.lock().await.is_some() {
            StorageMode::Degraded
        } else {
            StorageMode::Durable
        }
    }

    /// Start a request-scoped handle.
    ///
    /// Under the sticky policy this is also where an elapsed re-probe
    /// interval triggers a new health check of the durable backend.
    pub async fn request(&self) -> StorageRequest<'_> {
        let degraded = match &self.durable {
            None => true,
            Some(durable) => self.sticky_degraded(durable.as_ref()).await,
        };

        StorageRequest {
            storage: self,
            degraded,
        }
    }

    async fn sticky_degraded(&self, durable: &dyn HistoryStore) -> bool {
        {
            let degraded_since = self.degraded_since.lock().await;
            let Some(since) = *degraded_since else {
                return false;
            };
            let Some(interval) = self.reprobe_interval else {
                return true;
            };
            if since.elapsed() < interval {
                return true;
            }
        }

        // Probe without the lock so status and other requests are not held up.
        let probe = bounded(self.durable_timeout, "probe", durable.probe()).await;

        let mut degraded_since = self.degraded_since.lock().await;
        match probe {
            Ok(()) => {
                if degraded_since.take().is_some() {
                    tracing::info!(backend = durable.name(), "durable history backend recovered");
                }
                false
            }
            Err(error) => {
                tracing::debug!(%error, "durable history backend still unreachable");
                *degraded_since = Some(Instant::now());
                true
            }
        }
    }

    async fn mark_degraded(&self) {
        if self.policy == FallbackPolicy::Sticky {
            let mut degraded_since = self.degraded_since.lock().await;
            if degraded_since.is_none() {
                *degraded_since = Some(Instant::now());
            }
        }
    }
}

/// Storage access for one request.
///
/// Once the durable backend fails, every later call through the same handle
/// goes to the local file.
pub struct StorageRequest<'a> {
    storage: &'a Storage,
    degraded: bool,
}

impl StorageRequest<'_> {
    /// Whether this request has fallen back to the local file.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    fn durable(&self) -> Option<&Arc<dyn HistoryStore>> {
        if self.degraded {
            None
        } else {
            self.storage.durable.as_ref()
        }
    }

    async fn degrade(&mut self, operation: &'static str, error: &StorageError) {
        tracing::warn!(
            %error,
            operation,
            "durable history backend failed, falling back to local history file"
        );
        self.degraded = true;
        self.storage.mark_degraded().await;
    }

    /// Load a user's log. Never fails: unreadable state degrades to an empty log.
    pub async fn load(&mut self, user_id: &str) -> ConversationLog {
        if let Some(durable) = self.durable().cloned() {
            match bounded(self.storage.durable_timeout, "load", durable.load(user_id)).await {
                Ok(log) => return log,
                Err(error) if error.is_unavailable() => self.degrade("load", &error).await,
                Err(error) => {
                    tracing::warn!(%error, %user_id, "stored history unreadable, starting empty");
                    return ConversationLog::new();
                }
            }
        }

        match self.storage.local.load(user_id).await {
            Ok(log) => log,
            Err(error) => {
                tracing::warn!(%error, %user_id, "local history unreadable, starting empty");
                ConversationLog::new()
            }
        }
    }

    pub async fn save(
        &mut self,
        user_id: &str,
        log: &ConversationLog,
    ) -> std::result::Result<(), StorageError> {
        if let Some(durable) = self.durable().cloned() {
            match bounded(self.storage.durable_timeout, "save", durable.save(user_id, log)).await {
                Ok(()) => return Ok(()),
                Err(error) => self.degrade("save", &error).await,
            }
        }

        self.storage.local.save(user_id, log).await
    }

    /// Clear a user's log.
    ///
    /// The local copy is always cleared so a later fallback never resurrects
    /// an old conversation. A configured durable backend that cannot be
    /// cleared still fails the call: its copy would reappear once it is
    /// reachable again.
    pub async fn clear(&mut self, user_id: &str) -> std::result::Result<(), StorageError> {
        let durable_result = match self.storage.durable.clone() {
            Some(durable) => {
                let result =
                    bounded(self.storage.durable_timeout, "clear", durable.clear(user_id)).await;
                if let Err(error) = &result {
                    self.degrade("clear", error).await;
                }
                result
            }
            None => Ok(()),
        };

        self.storage.local.clear(user_id).await?;
        durable_result
    }
}

/// Run a backend call under `timeout`.
pub(crate) async fn bounded<T>(
    timeout: Duration,
    operation: &'static str,
    call: impl Future<Output = std::result::Result<T, StorageError>>,
) -> std::result::Result<T, StorageError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_elapsed) => Err(StorageError::Timeout {
            operation,
            timeout_ms: timeout.as_millis(),
        }),
    }
}
