//! Persistent attach-session state.
//!
//! Maintains a local JSON index of the containers this client has started
//! or attached to. Writes are atomic (temporary file, then rename) and
//! happen under a shutdown inhibit, so a `SIGTERM` arriving mid-write
//! cannot leave a truncated index behind.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tether_common::error::{Result, TetherError};
use tether_common::types::{ContainerId, ContainerState};
use tokio::sync::Mutex;

use crate::shutdown::ShutdownCoordinator;

/// Persistent record of one container session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    /// Container identifier.
    pub id: ContainerId,
    /// Last observed lifecycle state.
    pub state: ContainerState,
    /// PID of the init process, if known.
    pub pid: Option<u32>,
    /// When the entry was first recorded.
    pub created_at: DateTime<Utc>,
    /// When the entry last changed.
    pub updated_at: DateTime<Utc>,
}

impl StateEntry {
    /// Creates an entry stamped with the current time.
    #[must_use]
    pub fn new(id: ContainerId, state: ContainerState, pid: Option<u32>) -> Self {
        let now = Utc::now();
        Self {
            id,
            state,
            pid,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The on-disk state index.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    shutdown: Arc<ShutdownCoordinator>,
    write: Mutex<()>,
}

impl StateStore {
    /// Opens the index at `path`. Nothing is read until first use.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, shutdown: Arc<ShutdownCoordinator>) -> Self {
        Self {
            path: path.into(),
            shutdown,
            write: Mutex::new(()),
        }
    }

    /// Returns the index location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads every entry. A missing index is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub async fn load(&self) -> Result<Vec<StateEntry>> {
        tracing::debug!(path = %self.path.display(), "loading state index");
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    /// Inserts `entry`, or updates the entry with the same ID keeping its
    /// creation time.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read or written.
    pub async fn record(&self, mut entry: StateEntry) -> Result<()> {
        let _write = self.write.lock().await;
        let mut entries = self.load().await?;
        match entries.iter_mut().find(|existing| existing.id == entry.id) {
            Some(existing) => {
                entry.created_at = existing.created_at;
                entry.updated_at = Utc::now();
                *existing = entry;
            }
            None => entries.push(entry),
        }
        self.save(&entries).await
    }

    async fn save(&self, entries: &[StateEntry]) -> Result<()> {
        let json = serde_json::to_vec_pretty(entries)?;
        let guard = self.shutdown.inhibit().await;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;

        self.shutdown.uninhibit(guard);
        tracing::debug!(path = %self.path.display(), entries = entries.len(), "saved state index");
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> TetherError {
        TetherError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
