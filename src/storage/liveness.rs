//! Liveness markers under `<management>/running/`.
//!
//! Every long-running process holds one marker for as long as it runs. The
//! aggregator discovers detection sessions from them and `pgwatch stop`
//! signals the PIDs they record.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{list_with_suffix, remove_if_exists, write_atomic};
use crate::detect::EntityKey;

const RUN_SUFFIX: &str = ".run";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Detector,
    Aggregator,
    Ingest,
}

/// Contents of a liveness marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessInfo {
    pub role: Role,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityKey>,
    pub started_at: DateTime<Utc>,
}

impl LivenessInfo {
    pub fn file_name(&self) -> String {
        match (&self.role, &self.entity) {
            (Role::Detector, Some(key)) => format!("{}.detector{}", key, RUN_SUFFIX),
            (Role::Detector, None) => format!("detector{}", RUN_SUFFIX),
            (Role::Aggregator, _) => format!("aggregator{}", RUN_SUFFIX),
            (Role::Ingest, _) => format!("ingest{}", RUN_SUFFIX),
        }
    }
}

/// Held for the lifetime of a process; the marker file is removed on drop.
#[derive(Debug)]
pub struct LivenessMarker {
    path: PathBuf,
    info: LivenessInfo,
}

impl LivenessMarker {
    pub fn acquire(running_dir: &Path, role: Role, entity: Option<EntityKey>) -> Result<Self> {
        let info = LivenessInfo {
            role,
            pid: std::process::id(),
            entity,
            started_at: Utc::now(),
        };
        let path = running_dir.join(info.file_name());

        if path.exists() {
            warn!(path = %path.display(), "replacing leftover liveness marker");
        }
        let body = serde_json::to_vec_pretty(&info).context("failed to encode liveness marker")?;
        write_atomic(&path, &body)?;
        debug!(path = %path.display(), pid = info.pid, "liveness marker acquired");

        Ok(Self { path, info })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> &LivenessInfo {
        &self.info
    }
}

impl Drop for LivenessMarker {
    fn drop(&mut self) {
        match remove_if_exists(&self.path) {
            Ok(_) => debug!(path = %self.path.display(), "liveness marker released"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove liveness marker"),
        }
    }
}

/// Every readable marker in `running_dir`. Unreadable ones are logged and
/// skipped.
pub fn list(running_dir: &Path) -> Result<Vec<LivenessInfo>> {
    let mut out = Vec::new();
    for path in list_with_suffix(running_dir, RUN_SUFFIX)? {
        let parsed = fs::read(&path)
            .with_context(|| format!("failed to read {}", path.display()))
            .and_then(|bytes| {
                serde_json::from_slice::<LivenessInfo>(&bytes)
                    .with_context(|| format!("failed to parse {}", path.display()))
            });
        match parsed {
            Ok(info) => out.push(info),
            Err(e) => warn!(error = %e, "skipping unreadable liveness marker"),
        }
    }
    Ok(out)
}

/// Entities with a live detection session, sorted.
pub fn live_sessions(running_dir: &Path) -> Result<Vec<EntityKey>> {
    let mut keys: Vec<EntityKey> = list(running_dir)?
        .into_iter()
        .filter(|info| info.role == Role::Detector)
        .filter_map(|info| info.entity)
        .collect();
    keys.sort();
    keys.dedup();
    Ok(keys)
}
