//! Completion markers.
//!
//! A data file is published by writing it completely and then creating a
//! zero-byte sibling named `<data path>.INFO`. Consumers only look at
//! markers, read the data behind them, then delete the data followed by the
//! marker. The marker's existence is the only synchronisation between
//! producer and consumer.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::{list_with_suffix, remove_if_exists, write_atomic};

pub const MARKER_SUFFIX: &str = ".INFO";

/// Marker path guarding `data`.
pub fn marker_path(data: &Path) -> PathBuf {
    let mut name = data.as_os_str().to_os_string();
    name.push(MARKER_SUFFIX);
    PathBuf::from(name)
}

/// Data path guarded by `marker`, or `None` if it is not a marker path.
pub fn data_path(marker: &Path) -> Option<PathBuf> {
    let s = marker.to_str()?;
    s.strip_suffix(MARKER_SUFFIX).map(PathBuf::from)
}

/// Publish `contents` at `data`: atomic data write, then the marker.
pub fn commit(data: &Path, contents: &[u8]) -> Result<()> {
    write_atomic(data, contents)?;
    let marker = marker_path(data);
    fs::File::create(&marker)
        .with_context(|| format!("failed to create marker {}", marker.display()))?;
    debug!(path = %data.display(), "published");
    Ok(())
}

/// Markers currently present in `dir`, sorted by name.
pub fn pending(dir: &Path) -> Result<Vec<PathBuf>> {
    list_with_suffix(dir, MARKER_SUFFIX)
}

/// Read the data guarded by `marker`, then delete data and marker in that
/// order.
///
/// A marker whose data file has vanished is stale: it is removed with a
/// warning and `None` is returned.
pub fn consume(marker: &Path) -> Result<Option<String>> {
    let data = data_path(marker)
        .with_context(|| format!("{} is not a completion marker", marker.display()))?;

    let contents = match fs::read_to_string(&data) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(marker = %marker.display(), "marker without data file, removing");
            remove_if_exists(marker)?;
            return Ok(None);
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", data.display()));
        }
    };

    remove_if_exists(&data)?;
    remove_if_exists(marker)?;
    Ok(Some(contents))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_marker_path_round_trips() {
        let data = Path::new("/out/10.0.0.1_web_202401010000.DAT");
        let marker = marker_path(data);
        assert_eq!(
            marker,
            PathBuf::from("/out/10.0.0.1_web_202401010000.DAT.INFO")
        );
        assert_eq!(data_path(&marker).as_deref(), Some(data));
        assert_eq!(data_path(data), None);
    }

    #[test]
    fn test_commit_then_consume_clears_both_files() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("r.DAT");
        commit(&data, b"row\n").unwrap();

        let markers = pending(dir.path()).unwrap();
        assert_eq!(markers, vec![marker_path(&data)]);
        assert!(fs::metadata(&markers[0]).unwrap().len() == 0);

        assert_eq!(consume(&markers[0]).unwrap().as_deref(), Some("row\n"));
        assert!(!data.exists());
        assert!(!markers[0].exists());
    }

    #[test]
    fn test_data_without_marker_is_not_pending() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("r.DAT"), "row").unwrap();
        assert!(pending(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_stale_marker_is_removed() {
        let dir = TempDir::new().unwrap();
        let marker = marker_path(&dir.path().join("gone.DAT"));
        fs::File::create(&marker).unwrap();
        assert_eq!(consume(&marker).unwrap(), None);
        assert!(!marker.exists());
    }
}
