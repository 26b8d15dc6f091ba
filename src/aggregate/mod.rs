//! Aggregator: consolidates per-service result rows into one file per
//! (gateway, timestamp) in the shared output directory.
//!
//! Each cycle discovers live detection sessions, groups them by gateway and
//! runs one worker per gateway. The binary runs every worker as its own
//! child process, so a crash in one gateway cannot take down the
//! aggregator or its siblings. A failing gateway is logged and retried on
//! the next cycle.

pub mod engine;
pub mod worker;

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::storage::{liveness, Layout};

/// Live services grouped by gateway address.
pub fn discover(layout: &Layout) -> Result<BTreeMap<String, Vec<String>>> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for key in liveness::live_sessions(&layout.running_dir())? {
        groups.entry(key.gateway).or_default().push(key.service);
    }
    Ok(groups)
}

/// Outcome of one gateway worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayReport {
    pub gateway: String,
    /// Result files consumed from service output directories.
    pub consumed: usize,
    /// Rows merged into consolidated files.
    pub rows: usize,
    /// Consolidated files written, in timestamp order.
    pub written: Vec<PathBuf>,
}

/// Outcome of one aggregation cycle across all gateways.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub gateways: Vec<GatewayReport>,
    /// Gateways whose worker failed this cycle.
    pub failed: Vec<String>,
}

impl CycleReport {
    pub fn files_written(&self) -> usize {
        self.gateways.iter().map(|g| g.written.len()).sum()
    }

    pub fn rows(&self) -> usize {
        self.gateways.iter().map(|g| g.rows).sum()
    }
}

/// Where gateway workers run.
#[derive(Debug, Clone, Default)]
pub enum WorkerMode {
    /// A blocking task per gateway inside the calling process.
    #[default]
    InProcess,
    /// A child process per gateway running the hidden `aggregate-gateway`
    /// subcommand of `exe`. `global_args` go ahead of the subcommand so the
    /// child resolves the same configuration as its parent.
    Subprocess {
        exe: PathBuf,
        global_args: Vec<OsString>,
    },
}

/// Run one aggregation cycle.
pub async fn run_cycle(
    layout: &Layout,
    read_workers: usize,
    mode: &WorkerMode,
) -> Result<CycleReport> {
    let groups = discover(layout)?;
    let mut report = CycleReport::default();
    if groups.is_empty() {
        debug!("no live detection sessions");
        return Ok(report);
    }

    let mut workers: JoinSet<(String, Result<GatewayReport>)> = JoinSet::new();
    for (gateway, services) in groups {
        match mode {
            WorkerMode::InProcess => {
                let layout = layout.clone();
                workers.spawn_blocking(move || {
                    let result =
                        worker::aggregate_gateway(&layout, &gateway, &services, read_workers);
                    (gateway, result)
                });
            }
            WorkerMode::Subprocess { exe, global_args } => {
                let command = gateway_command(exe, global_args, &gateway, &services, read_workers);
                workers.spawn(async move {
                    let result = run_child(command).await;
                    (gateway, result)
                });
            }
        }
    }

    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((_, Ok(gateway_report))) => {
                if gateway_report.consumed > 0 {
                    info!(
                        gateway = %gateway_report.gateway,
                        consumed = gateway_report.consumed,
                        rows = gateway_report.rows,
                        files = gateway_report.written.len(),
                        "gateway aggregated"
                    );
                }
                report.gateways.push(gateway_report);
            }
            Ok((gateway, Err(e))) => {
                error!(%gateway, error = ?e, "gateway aggregation failed, will retry next cycle");
                report.failed.push(gateway);
            }
            Err(e) => {
                error!(error = %e, "gateway worker panicked");
                report.failed.push("<unknown>".to_string());
            }
        }
    }

    report.gateways.sort_by(|a, b| a.gateway.cmp(&b.gateway));
    report.failed.sort();
    Ok(report)
}

fn gateway_command(
    exe: &Path,
    global_args: &[OsString],
    gateway: &str,
    services: &[String],
    read_workers: usize,
) -> Command {
    let mut command = Command::new(exe);
    command
        .args(global_args)
        .arg("aggregate-gateway")
        .arg("--ip")
        .arg(gateway)
        .arg("--read-workers")
        .arg(read_workers.to_string());
    for service in services {
        command.arg("--svc").arg(service);
    }
    command.stdin(Stdio::null()).kill_on_drop(true);
    command
}

/// Wait for a worker process and decode the report it prints on stdout.
async fn run_child(mut command: Command) -> Result<GatewayReport> {
    let output = command
        .output()
        .await
        .context("failed to spawn gateway worker")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let last = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
        bail!("gateway worker exited with {}: {}", output.status, last.trim());
    }
    serde_json::from_slice(&output.stdout).context("gateway worker printed an invalid report")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathsConfig;
    use crate::detect::{EntityKey, Verdict};
    use crate::storage::liveness::{LivenessMarker, Role};
    use crate::storage::marker;
    use crate::storage::record::ResultRecord;
    use tempfile::TempDir;

    #[test]
    fn test_discover_groups_services_by_gateway() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(&PathsConfig {
            management_dir: dir.path().to_path_buf(),
            ..PathsConfig::default()
        });
        let running = layout.running_dir();
        let _a = LivenessMarker::acquire(&running, Role::Detector, Some(EntityKey::new("10.0.0.1", "web"))).unwrap();
        let _b = LivenessMarker::acquire(&running, Role::Detector, Some(EntityKey::new("10.0.0.1", "dns"))).unwrap();
        let _c = LivenessMarker::acquire(&running, Role::Detector, Some(EntityKey::new("10.0.0.2", "web"))).unwrap();
        let _agg = LivenessMarker::acquire(&running, Role::Aggregator, None).unwrap();

        let groups = discover(&layout).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["10.0.0.1"], vec!["dns".to_string(), "web".to_string()]);
        assert_eq!(groups["10.0.0.2"], vec!["web".to_string()]);
    }

    #[tokio::test]
    async fn test_cycle_without_sessions_is_empty() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(&PathsConfig {
            management_dir: dir.path().to_path_buf(),
            ..PathsConfig::default()
        });
        let report = run_cycle(&layout, 4, &WorkerMode::InProcess).await.unwrap();
        assert!(report.gateways.is_empty());
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn test_failing_gateway_does_not_block_siblings() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(&PathsConfig {
            management_dir: dir.path().join("management"),
            raw_input_dir: dir.path().join("INPUT"),
            final_output_dir: dir.path().join("OUTPUT"),
        });
        layout.ensure().unwrap();
        let running = layout.running_dir();

        let healthy = EntityKey::new("10.0.0.1", "web");
        let broken = EntityKey::new("10.0.0.2", "web");
        let _a = LivenessMarker::acquire(&running, Role::Detector, Some(healthy.clone())).unwrap();
        let _b = LivenessMarker::acquire(&running, Role::Detector, Some(broken.clone())).unwrap();

        let paths = layout.entity(&healthy);
        paths.ensure().unwrap();
        let record = ResultRecord {
            entity: healthy.clone(),
            timestamp: "202401010000".to_string(),
            values: vec![1.0],
            score: 0.5,
            verdict: Verdict::Normal,
        };
        marker::commit(
            &paths.output_dir().join("10.0.0.1_web_202401010000.DAT"),
            format!("{}\n", record.to_row()).as_bytes(),
        )
        .unwrap();

        // A plain file where the output directory should be makes listing fail.
        let broken_out = layout.entity(&broken).output_dir();
        std::fs::create_dir_all(broken_out.parent().unwrap()).unwrap();
        std::fs::write(&broken_out, "not a directory").unwrap();

        let report = run_cycle(&layout, 2, &WorkerMode::InProcess).await.unwrap();
        assert_eq!(report.failed, vec!["10.0.0.2".to_string()]);
        assert_eq!(report.gateways.len(), 1);
        assert_eq!(report.gateways[0].gateway, "10.0.0.1");
        assert_eq!(report.files_written(), 1);
        assert!(layout
            .final_output_dir()
            .join("10.0.0.1.202401010000.DAT.RESULT")
            .exists());
    }

}
