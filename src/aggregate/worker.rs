//! Per-gateway aggregation worker.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::GatewayReport;
use crate::detect::EntityKey;
use crate::storage::record::ResultRecord;
use crate::storage::{marker, Layout};

const RESULT_SUFFIX: &str = "DAT.RESULT";

/// A published result file waiting to be consumed.
#[derive(Debug, Clone)]
struct Pending {
    service: String,
    marker: PathBuf,
    arrived: SystemTime,
}

impl Pending {
    /// Arrival order: marker mtime, then service, then file name.
    fn arrival_cmp(&self, other: &Self) -> Ordering {
        self.arrived
            .cmp(&other.arrived)
            .then_with(|| self.service.cmp(&other.service))
            .then_with(|| self.marker.cmp(&other.marker))
    }
}

/// A parsed row together with the arrival rank of the file it came from.
#[derive(Debug)]
struct Collected {
    rank: usize,
    line: usize,
    record: ResultRecord,
}

/// Consume every published result for `gateway` and republish the rows as
/// one consolidated file per timestamp.
///
/// Returns immediately, touching nothing, when no markers are found.
pub fn aggregate_gateway(
    layout: &Layout,
    gateway: &str,
    services: &[String],
    read_workers: usize,
) -> Result<GatewayReport> {
    let mut report = GatewayReport {
        gateway: gateway.to_string(),
        ..GatewayReport::default()
    };

    let pending = list_pending(layout, gateway, services)?;
    if pending.is_empty() {
        return Ok(report);
    }
    debug!(%gateway, markers = pending.len(), "collecting results");

    let collected = read_all(&pending, read_workers.max(1));
    report.consumed = collected.consumed;

    let mut rows = collected.rows;
    rows.sort_by(|a, b| {
        a.record
            .timestamp
            .cmp(&b.record.timestamp)
            .then(a.rank.cmp(&b.rank))
            .then(a.line.cmp(&b.line))
    });
    report.rows = rows.len();

    let mut by_timestamp: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for row in rows {
        by_timestamp
            .entry(row.record.timestamp.clone())
            .or_default()
            .push(row.record.to_row());
    }

    for (timestamp, lines) in by_timestamp {
        let path = consolidated_path(layout.final_output_dir(), gateway, &timestamp);
        let mut body = lines.join("\n");
        body.push('\n');
        marker::commit(&path, body.as_bytes())
            .with_context(|| format!("failed to publish {}", path.display()))?;
        report.written.push(path);
    }

    Ok(report)
}

fn list_pending(layout: &Layout, gateway: &str, services: &[String]) -> Result<Vec<Pending>> {
    let mut pending = Vec::new();
    for service in services {
        let output = layout
            .entity(&EntityKey::new(gateway, service.as_str()))
            .output_dir();
        for marker in marker::pending(&output)? {
            let arrived = fs::metadata(&marker)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            pending.push(Pending {
                service: service.clone(),
                marker,
                arrived,
            });
        }
    }
    pending.sort_by(Pending::arrival_cmp);
    Ok(pending)
}

struct ReadOutcome {
    consumed: usize,
    rows: Vec<Collected>,
}

/// Split the marker list across `workers` threads. Each thread consumes its
/// share and appends parsed rows to a shared collector.
fn read_all(pending: &[Pending], workers: usize) -> ReadOutcome {
    let collector: Mutex<Vec<Collected>> = Mutex::new(Vec::new());
    let consumed: Mutex<usize> = Mutex::new(0);
    let chunk = pending.len().div_ceil(workers).max(1);

    std::thread::scope(|scope| {
        for (part, items) in pending.chunks(chunk).enumerate() {
            let collector = &collector;
            let consumed = &consumed;
            scope.spawn(move || {
                for (offset, item) in items.iter().enumerate() {
                    let rank = part * chunk + offset;
                    let contents = match marker::consume(&item.marker) {
                        Ok(Some(contents)) => contents,
                        Ok(None) => continue,
                        Err(e) => {
                            warn!(marker = %item.marker.display(), error = %e, "failed to consume result, leaving it for the next cycle");
                            continue;
                        }
                    };
                    *consumed.lock() += 1;

                    let mut parsed = Vec::new();
                    for (line, text) in contents.lines().enumerate() {
                        if text.trim().is_empty() {
                            continue;
                        }
                        match ResultRecord::parse_row(text) {
                            Ok(record) => parsed.push(Collected { rank, line, record }),
                            Err(e) => warn!(
                                marker = %item.marker.display(),
                                line,
                                error = %e,
                                "dropping malformed result row"
                            ),
                        }
                    }
                    collector.lock().extend(parsed);
                }
            });
        }
    });

    ReadOutcome {
        consumed: consumed.into_inner(),
        rows: collector.into_inner(),
    }
}

/// `<dir>/<gw>.<ts>.DAT.RESULT`, or `<gw>.<ts>.<n>.DAT.RESULT` with the
/// first free `n` while an earlier file for the same pair is still waiting
/// downstream.
pub fn consolidated_path(dir: &Path, gateway: &str, timestamp: &str) -> PathBuf {
    let base = dir.join(format!("{}.{}.{}", gateway, timestamp, RESULT_SUFFIX));
    if !taken(&base) {
        return base;
    }
    let mut n = 1usize;
    loop {
        let candidate = dir.join(format!("{}.{}.{}.{}", gateway, timestamp, n, RESULT_SUFFIX));
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn taken(path: &Path) -> bool {
    path.exists() || marker::marker_path(path).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathsConfig;
    use crate::detect::Verdict;
    use tempfile::TempDir;

    fn layout(dir: &TempDir) -> Layout {
        Layout::new(&PathsConfig {
            management_dir: dir.path().join("management"),
            raw_input_dir: dir.path().join("INPUT"),
            final_output_dir: dir.path().join("OUTPUT"),
        })
    }

    fn publish(layout: &Layout, service: &str, ts: &str, score: f64) {
        let key = EntityKey::new("10.0.0.1", service);
        let record = ResultRecord {
            entity: key.clone(),
            timestamp: ts.to_string(),
            values: vec![1.0],
            score,
            verdict: Verdict::Normal,
        };
        let path = layout
            .entity(&key)
            .output_dir()
            .join(format!("{}_{}.DAT", key, ts));
        marker::commit(&path, format!("{}\n", record.to_row()).as_bytes()).unwrap();
    }

    fn services(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_no_markers_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);
        let report = aggregate_gateway(&layout, "10.0.0.1", &services(&["web"]), 4).unwrap();
        assert_eq!(report.consumed, 0);
        assert!(report.written.is_empty());
        assert!(!layout.final_output_dir().exists());
    }

    #[test]
    fn test_rows_are_split_per_timestamp_in_time_order() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);
        publish(&layout, "web", "202401010002", 2.0);
        publish(&layout, "web", "202401010001", 1.0);
        publish(&layout, "dns", "202401010001", 3.0);

        let report =
            aggregate_gateway(&layout, "10.0.0.1", &services(&["web", "dns"]), 2).unwrap();
        assert_eq!(report.consumed, 3);
        assert_eq!(report.rows, 3);
        assert_eq!(
            report.written,
            vec![
                layout
                    .final_output_dir()
                    .join("10.0.0.1.202401010001.DAT.RESULT"),
                layout
                    .final_output_dir()
                    .join("10.0.0.1.202401010002.DAT.RESULT"),
            ]
        );
        for path in &report.written {
            assert!(marker::marker_path(path).exists());
        }
        let first = fs::read_to_string(&report.written[0]).unwrap();
        assert_eq!(first.lines().count(), 2);

        for svc in ["web", "dns"] {
            let out = layout
                .entity(&EntityKey::new("10.0.0.1", svc))
                .output_dir();
            assert_eq!(fs::read_dir(out).unwrap().count(), 0);
        }
    }

    #[test]
    fn test_waiting_consolidated_file_is_not_overwritten() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);
        publish(&layout, "web", "202401010001", 1.0);
        aggregate_gateway(&layout, "10.0.0.1", &services(&["web"]), 1).unwrap();
        publish(&layout, "web", "202401010001", 5.0);
        let report = aggregate_gateway(&layout, "10.0.0.1", &services(&["web"]), 1).unwrap();
        assert_eq!(
            report.written,
            vec![layout
                .final_output_dir()
                .join("10.0.0.1.202401010001.1.DAT.RESULT")]
        );
    }

    #[test]
    fn test_malformed_rows_are_dropped() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);
        let out = layout
            .entity(&EntityKey::new("10.0.0.1", "web"))
            .output_dir();
        marker::commit(&out.join("bad.DAT"), b"not a row\n").unwrap();
        let report = aggregate_gateway(&layout, "10.0.0.1", &services(&["web"]), 4).unwrap();
        assert_eq!(report.consumed, 1);
        assert_eq!(report.rows, 0);
        assert!(report.written.is_empty());
    }
}
