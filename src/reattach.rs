//! Persistence of [`ReattachInformation`] across supervisor restarts

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Result, WatchdogError};
use crate::types::reattach::ReattachInformation;

/// Durable storage for the reattach record
#[async_trait]
pub trait ReattachStore: Send + Sync {
    /// Persist the record, replacing any previous one
    async fn save(&self, info: &ReattachInformation) -> Result<()>;

    /// Read the record, if one exists
    async fn load(&self) -> Result<Option<ReattachInformation>>;

    /// Delete the record
    async fn clear(&self) -> Result<()>;
}

/// Keeps the record in a JSON file, written through a temp file and rename
#[derive(Debug, Clone)]
pub struct JsonFileReattachStore {
    path: PathBuf,
}

impl JsonFileReattachStore {
    /// Create a store backed by `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the record
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl ReattachStore for JsonFileReattachStore {
    async fn save(&self, info: &ReattachInformation) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(info)?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, json).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        log::debug!(
            "Saved reattach information for pid {} to {}",
            info.process_id,
            self.path.display()
        );
        Ok(())
    }

    async fn load(&self) -> Result<Option<ReattachInformation>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(WatchdogError::Io(e)),
        };

        match serde_json::from_slice(&raw) {
            Ok(info) => Ok(Some(info)),
            Err(e) => {
                // A torn or foreign record must not block startup
                log::warn!(
                    "Ignoring unreadable reattach record {}: {}",
                    self.path.display(),
                    e
                );
                Ok(None)
            }
        }
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WatchdogError::Io(e)),
        }
    }
}

/// In-process store, for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryReattachStore {
    record: Mutex<Option<ReattachInformation>>,
}

impl MemoryReattachStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-seeded with a record
    #[must_use]
    pub fn with_record(info: ReattachInformation) -> Self {
        Self {
            record: Mutex::new(Some(info)),
        }
    }

    /// Current record without going through the async API
    #[must_use]
    pub fn snapshot(&self) -> Option<ReattachInformation> {
        self.record.lock().clone()
    }
}

#[async_trait]
impl ReattachStore for MemoryReattachStore {
    async fn save(&self, info: &ReattachInformation) -> Result<()> {
        *self.record.lock() = Some(info.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<ReattachInformation>> {
        Ok(self.record.lock().clone())
    }

    async fn clear(&self) -> Result<()> {
        self.record.lock().take();
        Ok(())
    }
}
