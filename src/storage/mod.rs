//! Filesystem plumbing: directory layout, atomic writes, completion markers,
//! liveness markers and the row format shared by detector and aggregator.

pub mod checkpoint;
pub mod liveness;
pub mod marker;
pub mod queue;
pub mod record;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::PathsConfig;
use crate::detect::EntityKey;

/// Suffix of the hidden temp file a payload is staged in before rename.
const STAGING_SUFFIX: &str = ".part";

/// Directory tree shared by every pgwatch process.
#[derive(Debug, Clone)]
pub struct Layout {
    management: PathBuf,
    raw_input: PathBuf,
    final_output: PathBuf,
}

impl Layout {
    pub fn new(paths: &PathsConfig) -> Self {
        Self {
            management: paths.management_dir.clone(),
            raw_input: paths.raw_input_dir.clone(),
            final_output: paths.final_output_dir.clone(),
        }
    }

    pub fn management_dir(&self) -> &Path {
        &self.management
    }

    pub fn raw_input_dir(&self) -> &Path {
        &self.raw_input
    }

    pub fn final_output_dir(&self) -> &Path {
        &self.final_output
    }

    /// Liveness markers for every running process.
    pub fn running_dir(&self) -> PathBuf {
        self.management.join("running")
    }

    /// Logs of the processes that are not tied to one entity.
    pub fn shared_log_dir(&self) -> PathBuf {
        self.management.join("log")
    }

    pub fn entity(&self, key: &EntityKey) -> EntityPaths {
        EntityPaths {
            root: self.management.join(&key.gateway).join(&key.service),
        }
    }

    /// Create the shared directories if they are missing.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.running_dir(),
            self.shared_log_dir(),
            self.raw_input.clone(),
            self.final_output.clone(),
        ] {
            ensure_dir(&dir)?;
        }
        Ok(())
    }
}

/// Working directories of one (gateway, service) session.
#[derive(Debug, Clone)]
pub struct EntityPaths {
    root: PathBuf,
}

impl EntityPaths {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn input_dir(&self) -> PathBuf {
        self.root.join("input")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    pub fn scores_dir(&self) -> PathBuf {
        self.root.join("anomaly_scores")
    }

    pub fn model_dir(&self) -> PathBuf {
        self.root.join("model")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.model_dir().join("forest.json")
    }

    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.input_dir(),
            self.output_dir(),
            self.scores_dir(),
            self.model_dir(),
            self.log_dir(),
        ] {
            ensure_dir(&dir)?;
        }
        Ok(())
    }
}

pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))
}

/// Write `contents` to `path` so that readers never see a partial file.
///
/// The payload goes to a sibling staging file which is synced and renamed
/// over `path`. Missing parent directories are created.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    ensure_dir(parent)?;

    let file_name = path
        .file_name()
        .with_context(|| format!("{} has no file name", path.display()))?;
    let mut staging_name = std::ffi::OsString::from(".");
    staging_name.push(file_name);
    staging_name.push(STAGING_SUFFIX);
    let staging = parent.join(staging_name);

    {
        let mut file = fs::File::create(&staging)
            .with_context(|| format!("failed to create {}", staging.display()))?;
        file.write_all(contents)
            .with_context(|| format!("failed to write {}", staging.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync {}", staging.display()))?;
    }

    fs::rename(&staging, path).with_context(|| {
        format!(
            "failed to rename {} to {}",
            staging.display(),
            path.display()
        )
    })
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}

/// Regular files in `dir` whose names end with `suffix`, sorted by name.
///
/// A missing directory yields an empty list.
pub fn list_with_suffix(dir: &Path, suffix: &str) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to list {}", dir.display()));
        }
    };

    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        let path = entry.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(suffix) && !n.starts_with('.'));
        if matches && entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_entity_paths_follow_gateway_then_service() {
        let paths = PathsConfig {
            management_dir: PathBuf::from("/m"),
            raw_input_dir: PathBuf::from("/in"),
            final_output_dir: PathBuf::from("/out"),
        };
        let layout = Layout::new(&paths);
        let entity = layout.entity(&EntityKey::new("10.0.0.1", "web"));
        assert_eq!(entity.root(), Path::new("/m/10.0.0.1/web"));
        assert_eq!(entity.output_dir(), PathBuf::from("/m/10.0.0.1/web/output"));
        assert_eq!(
            entity.snapshot_path(),
            PathBuf::from("/m/10.0.0.1/web/model/forest.json")
        );
        assert_eq!(layout.running_dir(), PathBuf::from("/m/running"));
    }

    #[test]
    fn test_write_atomic_creates_parents_and_leaves_no_staging_file() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("a/b/data.DAT");
        write_atomic(&target, b"hello").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"hello");

        let names: Vec<_> = fs::read_dir(target.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("data.DAT")]);
    }

    #[test]
    fn test_list_with_suffix_skips_hidden_and_missing() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.DAT"), "").unwrap();
        fs::write(dir.path().join("a.DAT"), "").unwrap();
        fs::write(dir.path().join(".c.DAT.part"), "").unwrap();
        fs::write(dir.path().join("d.txt"), "").unwrap();

        let found = list_with_suffix(dir.path(), ".DAT").unwrap();
        assert_eq!(
            found,
            vec![dir.path().join("a.DAT"), dir.path().join("b.DAT")]
        );
        assert!(list_with_suffix(&dir.path().join("nope"), ".DAT")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_remove_if_exists_tolerates_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x");
        fs::write(&path, "").unwrap();
        assert!(remove_if_exists(&path).unwrap());
        assert!(!remove_if_exists(&path).unwrap());
    }
}
