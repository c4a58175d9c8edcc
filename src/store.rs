//! Durable single-slot storage for the current session.
//!
//! The store holds at most one record. Saving replaces it wholesale; there is
//! no merging of unrelated files. Backends report their failures, and the
//! orchestrator decides they are not worth bothering the user with.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};

use crate::codec::SerializedFile;
use crate::service::ImageMetadata;

/// The persisted session: the encoded file plus the last inspect result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSession {
    pub file_data: SerializedFile,
    pub metadata: Option<ImageMetadata>,
}

/// A single-key asynchronous store.
///
/// Every operation is safe on a store that has never been written.
/// `load` returns `Ok(None)` for an empty slot and for a record it cannot
/// read; `Err` is reserved for the backend itself being unavailable.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Replace the slot. A concurrent `load` sees either the old or the new
    /// record, never a mix.
    async fn save(&self, session: &StoredSession) -> Result<()>;
    async fn load(&self) -> Result<Option<StoredSession>>;
    /// Empty the slot.
    async fn clear(&self) -> Result<()>;
}

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slot: RwLock<Option<StoredSession>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SessionStore for MemoryStore {
    async fn save(&self, session: &StoredSession) -> Result<()> {
        *self.slot.write().await = Some(session.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<StoredSession>> {
        Ok(self.slot.read().await.clone())
    }

    async fn clear(&self) -> Result<()> {
        *self.slot.write().await = None;
        Ok(())
    }
}

/// JSON file store.
///
/// Saves go to a sibling temp file that is then renamed over the target, so
/// the file on disk is always either the previous record or the new one.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "session".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait::async_trait]
impl SessionStore for FileStore {
    async fn save(&self, session: &StoredSession) -> Result<()> {
        let _guard = self.lock.lock().await;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let contents = serde_json::to_vec(session).context("Failed to serialize session")?;
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, contents)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        log::debug!("Session saved to {}", self.path.display());
        Ok(())
    }

    async fn load(&self) -> Result<Option<StoredSession>> {
        let _guard = self.lock.lock().await;

        let contents = match tokio::fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()));
            }
        };

        match serde_json::from_slice(&contents) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                log::warn!("Ignoring unreadable session file {}: {e}", self.path.display());
                Ok(None)
            }
        }
    }

    async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;

        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", self.path.display())),
        }
    }
}
