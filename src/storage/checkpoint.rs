//! Persisted detector state: threshold-history archives and the model
//! snapshot used to warm a restarted session.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::write_atomic;
use crate::detect::threshold::ScoreArchive;
use crate::detect::DataPoint;

/// Write a trimmed slice of score history as a JSON array of
/// `[timestamp, score]` pairs. Returns the archive path.
pub fn write_archive(dir: &Path, archive: &ScoreArchive) -> Result<PathBuf> {
    let path = dir.join(archive.file_name());
    let body = serde_json::to_vec(&archive.records).context("failed to encode score archive")?;
    write_atomic(&path, &body)?;
    info!(
        path = %path.display(),
        records = archive.records.len(),
        "archived score history"
    );
    Ok(path)
}

/// One live forest point with the slot and logical position it occupies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPoint {
    pub slot: usize,
    pub position: u64,
    pub values: Vec<f64>,
}

/// Everything needed to rebuild a session's forest and sliding window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub num_trees: usize,
    pub capacity: usize,
    pub sequences: usize,
    /// Values per data point.
    pub dimensions: usize,
    pub last_position: Option<u64>,
    /// Live forest points, oldest first.
    pub points: Vec<SnapshotPoint>,
    /// Sliding window contents, oldest first.
    pub window: Vec<DataPoint>,
    pub saved_at: chrono::DateTime<chrono::Utc>,
}

impl ModelSnapshot {
    pub fn save(&self, path: &Path) -> Result<()> {
        let body = serde_json::to_vec(self).context("failed to encode model snapshot")?;
        write_atomic(path, &body)
    }

    /// Load a snapshot; `None` when no snapshot has been written yet.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };
        let snapshot = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse model snapshot {}", path.display()))?;
        Ok(Some(snapshot))
    }

    /// Whether this snapshot was taken with the given hyperparameters.
    pub fn matches(&self, num_trees: usize, capacity: usize, sequences: usize) -> bool {
        self.num_trees == num_trees && self.capacity == capacity && self.sequences == sequences
    }
}
