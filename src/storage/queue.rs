//! Per-entity input queue: one `<timestamp>.DAT` file per pending data point.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

use super::record::InputRow;
use super::{list_with_suffix, remove_if_exists, write_atomic};
use crate::detect::EntityKey;

pub const INPUT_SUFFIX: &str = ".DAT";
const REJECTED_SUFFIX: &str = ".BAD";

/// Enqueue a row for its entity. An existing file for the same timestamp is
/// replaced.
pub fn enqueue(input_dir: &Path, row: &InputRow) -> Result<PathBuf> {
    let path = input_dir.join(format!("{}{}", row.point.timestamp, INPUT_SUFFIX));
    if path.exists() {
        warn!(path = %path.display(), "replacing queued input with the same timestamp");
    }
    write_atomic(&path, format!("{}\n", row).as_bytes())?;
    Ok(path)
}

/// Take the oldest queued row for `entity`.
///
/// The consumed file is deleted. Files that do not hold a valid row for this
/// entity (wrong entity, wrong value count, unparseable) are renamed to
/// `*.BAD` and skipped.
pub fn dequeue(
    input_dir: &Path,
    entity: &EntityKey,
    dimensions: Option<usize>,
) -> Result<Option<InputRow>> {
    for path in list_with_suffix(input_dir, INPUT_SUFFIX)? {
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };

        match check_row(&contents, entity, dimensions) {
            Ok(row) => {
                remove_if_exists(&path)?;
                return Ok(Some(row));
            }
            Err(reason) => {
                warn!(path = %path.display(), %reason, "rejecting input file");
                reject(&path)?;
            }
        }
    }
    Ok(None)
}

fn check_row(
    contents: &str,
    entity: &EntityKey,
    dimensions: Option<usize>,
) -> std::result::Result<InputRow, String> {
    let line = contents
        .lines()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| "empty file".to_string())?;
    let row = InputRow::parse(line).map_err(|e| e.to_string())?;
    if &row.entity != entity {
        return Err(format!("row belongs to {}", row.entity));
    }
    if let Some(expected) = dimensions {
        if row.point.values.len() != expected {
            return Err(format!(
                "expected {} values, got {}",
                expected,
                row.point.values.len()
            ));
        }
    }
    Ok(row)
}

fn reject(path: &Path) -> Result<()> {
    let mut bad = path.as_os_str().to_os_string();
    bad.push(REJECTED_SUFFIX);
    fs::rename(path, &bad).with_context(|| format!("failed to set aside {}", path.display()))
}
