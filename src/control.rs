//! `pgwatch status` and `pgwatch stop`.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use anyhow::Result;
#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::sys::signal::{kill, Signal};
#[cfg(unix)]
use nix::unistd::Pid;
use serde::Serialize;
use tracing::{info, warn};

use crate::storage::liveness::{self, LivenessInfo, Role};
use crate::storage::Layout;

/// Running processes, with detection sessions grouped by gateway.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusReport {
    pub gateways: BTreeMap<String, Vec<SessionStatus>>,
    /// Aggregator and ingest processes.
    pub processes: Vec<LivenessInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub service: String,
    pub pid: u32,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

pub fn status(layout: &Layout) -> Result<StatusReport> {
    let mut report = StatusReport::default();
    for info in liveness::list(&layout.running_dir())? {
        match (&info.role, &info.entity) {
            (Role::Detector, Some(key)) => {
                report
                    .gateways
                    .entry(key.gateway.clone())
                    .or_default()
                    .push(SessionStatus {
                        service: key.service.clone(),
                        pid: info.pid,
                        started_at: info.started_at,
                    });
            }
            _ => report.processes.push(info),
        }
    }
    for sessions in report.gateways.values_mut() {
        sessions.sort_by(|a, b| a.service.cmp(&b.service));
    }
    Ok(report)
}

impl StatusReport {
    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.gateways.is_empty() && self.processes.is_empty() {
            out.push_str("No pgwatch processes running.\n");
            return out;
        }
        for (gateway, sessions) in &self.gateways {
            let _ = writeln!(out, "{}", gateway);
            for s in sessions {
                let _ = writeln!(
                    out,
                    "  {:<20} pid {:<8} since {}",
                    s.service,
                    s.pid,
                    s.started_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        for info in &self.processes {
            let _ = writeln!(out, "{:?} pid {}", info.role, info.pid);
        }
        out
    }
}

/// What happened to one process asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Signalled,
    /// No such process; its marker is stale.
    AlreadyGone,
}

#[cfg(unix)]
fn terminate(pid: u32) -> Result<StopOutcome> {
    let raw = match i32::try_from(pid) {
        Ok(raw) if raw > 0 => raw,
        _ => return Ok(StopOutcome::AlreadyGone),
    };
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => Ok(StopOutcome::Signalled),
        Err(Errno::ESRCH) => Ok(StopOutcome::AlreadyGone),
        Err(e) => Err(anyhow::anyhow!("send SIGTERM to {}: {}", pid, e)),
    }
}

#[cfg(not(unix))]
fn terminate(pid: u32) -> Result<StopOutcome> {
    anyhow::bail!("stopping pid {} is only supported on unix", pid)
}

/// Send SIGTERM to every process holding a liveness marker.
///
/// The signalled processes remove their own markers. Returns how many
/// processes were signalled.
pub fn stop(layout: &Layout) -> Result<usize> {
    let own = std::process::id();
    let mut signalled = 0;
    for info in liveness::list(&layout.running_dir())? {
        if info.pid == own {
            continue;
        }
        match terminate(info.pid) {
            Ok(StopOutcome::Signalled) => {
                info!(pid = info.pid, role = ?info.role, "sent SIGTERM");
                signalled += 1;
            }
            Ok(StopOutcome::AlreadyGone) => {
                warn!(pid = info.pid, role = ?info.role, "process already gone, marker is stale");
            }
            Err(e) => warn!(pid = info.pid, role = ?info.role, error = %e, "failed to signal process"),
        }
    }
    Ok(signalled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathsConfig;
    use crate::detect::EntityKey;
    use crate::storage::liveness::LivenessMarker;
    use tempfile::TempDir;

    #[test]
    fn test_status_groups_sessions_by_gateway() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(&PathsConfig {
            management_dir: dir.path().to_path_buf(),
            ..PathsConfig::default()
        });
        let running = layout.running_dir();
        let _a = LivenessMarker::acquire(&running, Role::Detector, Some(EntityKey::new("10.0.0.1", "web"))).unwrap();
        let _b = LivenessMarker::acquire(&running, Role::Detector, Some(EntityKey::new("10.0.0.1", "dns"))).unwrap();
        let _c = LivenessMarker::acquire(&running, Role::Aggregator, None).unwrap();

        let report = status(&layout).unwrap();
        let services: Vec<&str> = report.gateways["10.0.0.1"]
            .iter()
            .map(|s| s.service.as_str())
            .collect();
        assert_eq!(services, vec!["dns", "web"]);
        assert_eq!(report.processes.len(), 1);

        let text = report.render();
        assert!(text.contains("10.0.0.1"));
        assert!(text.contains("dns"));
    }

    #[test]
    fn test_empty_status() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(&PathsConfig {
            management_dir: dir.path().to_path_buf(),
            ..PathsConfig::default()
        });
        assert!(status(&layout).unwrap().render().contains("No pgwatch processes"));
    }

    #[test]
    fn test_stop_skips_own_pid() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(&PathsConfig {
            management_dir: dir.path().to_path_buf(),
            ..PathsConfig::default()
        });
        let _own = LivenessMarker::acquire(&layout.running_dir(), Role::Aggregator, None).unwrap();
        assert_eq!(stop(&layout).unwrap(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_marker_is_reported_gone() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(&PathsConfig {
            management_dir: dir.path().to_path_buf(),
            ..PathsConfig::default()
        });
        let running = layout.running_dir();
        std::fs::create_dir_all(&running).unwrap();
        let stale = LivenessInfo {
            role: Role::Ingest,
            pid: 2_147_483_000,
            entity: None,
            started_at: chrono::Utc::now(),
        };
        std::fs::write(
            running.join(stale.file_name()),
            serde_json::to_vec(&stale).unwrap(),
        )
        .unwrap();

        assert_eq!(terminate(stale.pid).unwrap(), StopOutcome::AlreadyGone);
        assert_eq!(terminate(0).unwrap(), StopOutcome::AlreadyGone);
        assert_eq!(stop(&layout).unwrap(), 0);
    }
}
