//! Splits raw multi-service input files into per-entity input queues.
//!
//! A raw file holds rows for many (gateway, service) pairs. Each row is
//! written to `<management>/<gw>/<svc>/input/<timestamp>.DAT` and the raw
//! file is deleted once every row has been queued.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::IngestConfig;
use crate::detect::EntityKey;
use crate::signal;
use crate::storage::liveness::{LivenessMarker, Role};
use crate::storage::record::InputRow;
use crate::storage::{list_with_suffix, queue, remove_if_exists, Layout};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub files: usize,
    pub queued: usize,
    pub skipped: usize,
}

/// Queue every row of one raw file, then delete it.
///
/// Malformed rows are skipped. A second row for an entity already seen in
/// the same file is dropped with a warning; the first one wins.
pub fn ingest_file(layout: &Layout, path: &Path) -> Result<IngestReport> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let mut report = IngestReport {
        files: 1,
        ..IngestReport::default()
    };
    let mut rows: BTreeMap<EntityKey, InputRow> = BTreeMap::new();
    for (line_no, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let row = match InputRow::parse(line) {
            Ok(row) => row,
            Err(e) => {
                warn!(file = %path.display(), line = line_no + 1, error = %e, "skipping malformed input row");
                report.skipped += 1;
                continue;
            }
        };
        if rows.contains_key(&row.entity) {
            warn!(
                file = %path.display(),
                entity = %row.entity,
                "duplicate row for entity, keeping the first"
            );
            report.skipped += 1;
            continue;
        }
        rows.insert(row.entity.clone(), row);
    }

    for (entity, row) in &rows {
        let input = layout.entity(entity).input_dir();
        queue::enqueue(&input, row)
            .with_context(|| format!("failed to queue input for {}", entity))?;
        report.queued += 1;
    }

    remove_if_exists(path)?;
    debug!(file = %path.display(), queued = report.queued, "raw input dispatched");
    Ok(report)
}

/// Dispatch every raw `*.DAT` file currently in the raw input directory.
pub fn run_once(layout: &Layout) -> Result<IngestReport> {
    let mut total = IngestReport::default();
    for path in list_with_suffix(layout.raw_input_dir(), queue::INPUT_SUFFIX)? {
        match ingest_file(layout, &path) {
            Ok(report) => {
                total.files += report.files;
                total.queued += report.queued;
                total.skipped += report.skipped;
            }
            Err(e) => error!(file = %path.display(), error = ?e, "failed to ingest raw input"),
        }
    }
    Ok(total)
}

/// Poll the raw input directory until `shutdown` flips.
pub async fn run(layout: Layout, config: IngestConfig, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    layout.ensure()?;
    let _liveness = LivenessMarker::acquire(&layout.running_dir(), Role::Ingest, None)?;
    info!(dir = %layout.raw_input_dir().display(), "ingest started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        let pass = layout.clone();
        match tokio::task::spawn_blocking(move || run_once(&pass)).await {
            Ok(Ok(report)) if report.files > 0 => info!(
                files = report.files,
                queued = report.queued,
                skipped = report.skipped,
                "raw input ingested"
            ),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!(error = ?e, "ingest pass failed"),
            Err(e) => error!(error = %e, "ingest pass panicked"),
        }
        if signal::idle(config.poll_interval(), &mut shutdown).await {
            break;
        }
    }

    info!("ingest stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathsConfig;
    use tempfile::TempDir;

    fn layout(dir: &TempDir) -> Layout {
        Layout::new(&PathsConfig {
            management_dir: dir.path().join("management"),
            raw_input_dir: dir.path().join("INPUT"),
            final_output_dir: dir.path().join("OUTPUT"),
        })
    }

    #[test]
    fn test_raw_file_is_split_per_service() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);
        layout.ensure().unwrap();
        let raw = layout.raw_input_dir().join("batch.DAT");
        fs::write(
            &raw,
            "10.0.0.1|202401010000|web|1|2\n\
             10.0.0.1|202401010000|dns|3|4\n\
             10.0.0.1|202401010000|web|9|9\n\
             broken\n",
        )
        .unwrap();

        let report = run_once(&layout).unwrap();
        assert_eq!(
            report,
            IngestReport {
                files: 1,
                queued: 2,
                skipped: 2
            }
        );
        assert!(!raw.exists());

        let web = EntityKey::new("10.0.0.1", "web");
        let row = queue::dequeue(&layout.entity(&web).input_dir(), &web, None)
            .unwrap()
            .unwrap();
        assert_eq!(row.point.values, vec![1.0, 2.0]);

        let dns = EntityKey::new("10.0.0.1", "dns");
        assert_eq!(
            list_with_suffix(&layout.entity(&dns).input_dir(), queue::INPUT_SUFFIX)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_empty_raw_directory_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);
        assert_eq!(run_once(&layout).unwrap(), IngestReport::default());
    }
}
