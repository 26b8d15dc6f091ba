use crate::aggregate::{run_cycle, CycleReport, WorkerMode};
use crate::config::AggregatorConfig;
use crate::signal;
use crate::storage::liveness::{LivenessMarker, Role};
use crate::storage::Layout;
use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};

/// Poll loop around [`run_cycle`].
pub struct AggregatorEngine {
    layout: Layout,
    config: AggregatorConfig,
    mode: WorkerMode,
}

impl AggregatorEngine {
    /// Engine running gateway workers in-process; see [`Self::with_mode`].
    pub fn new(layout: Layout, config: AggregatorConfig) -> Self {
        Self {
            layout,
            config,
            mode: WorkerMode::InProcess,
        }
    }

    pub fn with_mode(mut self, mode: WorkerMode) -> Self {
        self.mode = mode;
        self
    }

    /// Run a single cycle, holding the aggregator liveness marker meanwhile.
    pub async fn run_once(&self) -> Result<CycleReport> {
        self.layout.ensure()?;
        let _liveness = LivenessMarker::acquire(&self.layout.running_dir(), Role::Aggregator, None)?;
        run_cycle(&self.layout, self.config.read_workers, &self.mode).await
    }

    /// Cycle every `poll_interval` until `shutdown` flips.
    ///
    /// Discovery failures are logged and retried; they do not end the loop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.layout.ensure()?;
        let _liveness = LivenessMarker::acquire(&self.layout.running_dir(), Role::Aggregator, None)?;
        info!(
            read_workers = self.config.read_workers,
            poll_ms = self.config.poll_interval_ms,
            "aggregator started"
        );

        let mut cycles: u64 = 0;
        let mut files: usize = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }

            match run_cycle(&self.layout, self.config.read_workers, &self.mode).await {
                Ok(report) => {
                    cycles += 1;
                    files += report.files_written();
                }
                Err(e) => error!(error = ?e, "aggregation cycle failed"),
            }

            if signal::idle(self.config.poll_interval(), &mut shutdown).await {
                break;
            }
        }

        info!(cycles, files, "aggregator stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathsConfig;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_run_releases_marker_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(&PathsConfig {
            management_dir: dir.path().join("management"),
            raw_input_dir: dir.path().join("INPUT"),
            final_output_dir: dir.path().join("OUTPUT"),
        });
        let engine = AggregatorEngine::new(
            layout.clone(),
            AggregatorConfig {
                poll_interval_ms: 10,
                read_workers: 2,
            },
        );

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(engine.run(rx));

        let marker = layout.running_dir().join("aggregator.run");
        for _ in 0..200 {
            if marker.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(marker.exists());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!marker.exists());
    }
}
