//! Local fallback history storage: one JSON document per deployment.
//!
//! The file maps user id to that user's message array. Every save rewrites
//! the whole document through a temp file in the same directory followed by
//! a rename, so readers only ever see a complete document.

use super::HistoryStore;
use crate::conversation::{ConversationLog, Message};
use crate::error::StorageError;

use anyhow::Context as _;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};

type HistoryDocument = BTreeMap<String, Value>;

/// History file store.
#[derive(Debug)]
pub struct FileHistoryStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles on the document within the process.
    write_gate: Mutex<()>,
}

impl FileHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_gate: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(&self) -> Result<HistoryDocument, StorageError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HistoryDocument::new());
            }
            Err(error) => {
                return Err(StorageError::CorruptState {
                    path: self.path.display().to_string(),
                    reason: error.to_string(),
                });
            }
        };

        if contents.trim().is_empty() {
            return Ok(HistoryDocument::new());
        }

        serde_json::from_str(&contents).map_err(|error| StorageError::CorruptState {
            path: self.path.display().to_string(),
            reason: error.to_string(),
        })
    }

    /// Read the document for a rewrite. A corrupt document is moved aside
    /// and replaced by an empty one.
    async fn read_document_for_update(&self) -> Result<HistoryDocument, StorageError> {
        match self.read_document().await {
            Ok(document) => Ok(document),
            Err(error @ StorageError::CorruptState { .. }) => {
                let backup = corrupt_backup_path(&self.path);
                tracing::warn!(
                    %error,
                    backup = %backup.display(),
                    "history file corrupt, moving it aside and starting a new one"
                );
                if let Err(rename_error) = tokio::fs::rename(&self.path, &backup).await {
                    tracing::warn!(%rename_error, "failed to move corrupt history file aside");
                }
                Ok(HistoryDocument::new())
            }
            Err(error) => Err(error),
        }
    }

    async fn write_document(&self, document: &HistoryDocument) -> Result<(), StorageError> {
        let contents =
            serde_json::to_vec_pretty(document).context("failed to serialize history file")?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || {
            let staged = stage(&path, &contents)?;
            staged
                .persist(&path)
                .with_context(|| format!("failed to replace history file {}", path.display()))?;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .context("history file writer panicked")??;

        Ok(())
    }
}

/// Write `contents` to a synced temp file next to `path`.
///
/// Dropping the returned file without persisting it removes it and leaves
/// `path` untouched.
fn stage(path: &Path, contents: &[u8]) -> anyhow::Result<tempfile::NamedTempFile> {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&directory)
        .with_context(|| format!("failed to create directory {}", directory.display()))?;

    let mut staged = tempfile::Builder::new()
        .prefix(".history-")
        .suffix(".tmp")
        .tempfile_in(&directory)
        .context("failed to create temporary history file")?;
    staged
        .write_all(contents)
        .context("failed to write temporary history file")?;
    staged
        .as_file()
        .sync_all()
        .context("failed to sync temporary history file")?;

    Ok(staged)
}

fn corrupt_backup_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".corrupt");
    path.with_file_name(name)
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn load(&self, user_id: &str) -> Result<ConversationLog, StorageError> {
        let mut document = self.read_document().await?;
        let Some(entry) = document.remove(user_id) else {
            return Ok(ConversationLog::new());
        };

        let messages: Vec<Message> =
            serde_json::from_value(entry).map_err(|error| StorageError::CorruptState {
                path: self.path.display().to_string(),
                reason: format!("entry for {user_id}: {error}"),
            })?;

        Ok(ConversationLog::from_messages(messages))
    }

    async fn save(&self, user_id: &str, log: &ConversationLog) -> Result<(), StorageError> {
        let _write_guard = self.write_gate.lock().await;

        let mut document = self.read_document_for_update().await?;
        let entry = serde_json::to_value(log).context("failed to serialize history")?;
        document.insert(user_id.to_string(), entry);

        self.write_document(&document).await
    }

    async fn clear(&self, user_id: &str) -> Result<(), StorageError> {
        let _write_guard = self.write_gate.lock().await;

        let mut document = self.read_document_for_update().await?;
        if document.remove(user_id).is_some() {
            self.write_document(&document).await?;
        }

        Ok(())
    }
}
