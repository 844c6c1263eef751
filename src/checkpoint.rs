//! Crash-safe progress checkpoint.
//!
//! One JSON file per session holds the set of processed message ids and the
//! iteration cursor. Every mutation is persisted synchronously (temp file +
//! rename), so a crash loses at most the in-flight item, never committed
//! history.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CheckpointError;

/// Persisted progress record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Checkpoint {
    /// Ids whose outcome (ok, skipped or failed-permanent) is final.
    pub processed_ids: HashSet<i64>,
    /// Oldest message id reached during reverse-chronological iteration.
    pub cursor: Option<i64>,
    /// When the checkpoint was last written.
    pub last_updated: Option<DateTime<Utc>>,
}

/// Durable checkpoint store, keyed by session.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    checkpoint: Checkpoint,
}

impl CheckpointStore {
    /// Load the checkpoint for a session, or start empty if none exists.
    ///
    /// A file that exists but cannot be read or parsed is a fatal startup
    /// error: silently starting over would duplicate output.
    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let checkpoint = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|e| CheckpointError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
            serde_json::from_str(&raw).map_err(|e| CheckpointError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        } else {
            Checkpoint::default()
        };

        Ok(Self {
            path: path.to_path_buf(),
            checkpoint,
        })
    }

    /// Start a fresh in-memory checkpoint that still persists to `path`.
    ///
    /// Used when incremental resume is disabled: prior progress is ignored
    /// but this run's progress is still recorded.
    pub fn fresh(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            checkpoint: Checkpoint::default(),
        }
    }

    /// O(1) membership check.
    pub fn is_processed(&self, id: i64) -> bool {
        self.checkpoint.processed_ids.contains(&id)
    }

    /// Mark a message id as terminally handled and persist immediately.
    /// Idempotent: re-marking an id is a no-op (no extra write).
    pub fn mark_processed(&mut self, id: i64) -> Result<(), CheckpointError> {
        if !self.checkpoint.processed_ids.insert(id) {
            return Ok(());
        }
        self.persist()
    }

    /// Record the oldest message id reached during iteration and persist.
    /// The cursor only moves toward older ids.
    pub fn advance_cursor(&mut self, id: i64) -> Result<(), CheckpointError> {
        match self.checkpoint.cursor {
            Some(current) if current <= id => Ok(()),
            _ => {
                self.checkpoint.cursor = Some(id);
                self.persist()
            }
        }
    }

    /// Seed processed ids recovered from the sink (rows written before a
    /// crash cut off the matching checkpoint write). One persist for the
    /// whole batch.
    pub fn absorb(&mut self, ids: impl IntoIterator<Item = i64>) -> Result<(), CheckpointError> {
        let mut changed = false;
        for id in ids {
            changed |= self.checkpoint.processed_ids.insert(id);
        }
        if changed {
            self.persist()
        } else {
            Ok(())
        }
    }

    /// Iteration resume point.
    pub fn cursor(&self) -> Option<i64> {
        self.checkpoint.cursor
    }

    /// Number of terminally handled ids.
    pub fn processed_count(&self) -> usize {
        self.checkpoint.processed_ids.len()
    }

    /// Write the checkpoint to disk: temp file in the same directory, then
    /// rename over the target so a crash never leaves a half-written file.
    fn persist(&mut self) -> Result<(), CheckpointError> {
        self.checkpoint.last_updated = Some(Utc::now());

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let data = serde_json::to_string_pretty(&self.checkpoint).map_err(|e| {
            CheckpointError::PersistFailed {
                path: self.path.clone(),
                reason: e.to_string(),
            }
        })?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, format!("{data}\n"))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| CheckpointError::PersistFailed {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        Ok(())
    }
}
