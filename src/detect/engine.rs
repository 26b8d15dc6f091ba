use crate::config::DetectorConfig;
use crate::detect::forest::RandomCutForest;
use crate::detect::session::{self, DetectionSession, Step};
use crate::detect::EntityKey;
use crate::signal;
use crate::storage::liveness::{LivenessMarker, Role};
use crate::storage::Layout;
use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};

/// Long-running driver for one detection session.
pub struct DetectorEngine {
    entity: EntityKey,
    layout: Layout,
    config: DetectorConfig,
}

impl DetectorEngine {
    pub fn new(entity: EntityKey, layout: Layout, config: DetectorConfig) -> Self {
        Self {
            entity,
            layout,
            config,
        }
    }

    fn open_session(&self) -> Result<DetectionSession<RandomCutForest>> {
        let cfg = &self.config;
        session::open(
            self.entity.clone(),
            self.layout.entity(&self.entity),
            cfg,
            || RandomCutForest::new(cfg.trees, cfg.leaves, cfg.seed),
        )
    }

    /// Run cycles until `shutdown` flips.
    ///
    /// Input is processed back to back while the queue has data; an empty
    /// queue waits `idle_delay`. The liveness marker is held for the whole
    /// run and dropped on every exit path.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut session = self.open_session()?;
        self.layout.ensure()?;
        let _liveness = LivenessMarker::acquire(
            &self.layout.running_dir(),
            Role::Detector,
            Some(self.entity.clone()),
        )?;

        info!(
            entity = %self.entity,
            trees = self.config.trees,
            leaves = self.config.leaves,
            sequences = self.config.sequences,
            quantile = self.config.quantile,
            "detection session started"
        );

        let interval = self.config.snapshot_interval;
        let outcome = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            // Cycles do blocking file I/O; run them off the async workers.
            let (returned, step) = tokio::task::spawn_blocking(move || {
                let step = session.step();
                (session, step)
            })
            .await
            .context("detection cycle panicked")?;
            session = returned;

            match step {
                Ok(Step::Scored(_)) => {
                    if interval > 0 && session.scored() % interval == 0 {
                        if let Err(e) = session.save_snapshot() {
                            error!(entity = %self.entity, error = %e, "failed to save model snapshot");
                        }
                    }
                }
                Ok(Step::WarmingUp) => {}
                Ok(Step::Idle) => {
                    if signal::idle(self.config.idle_delay(), &mut shutdown).await {
                        break Ok(());
                    }
                }
                Err(e) => {
                    error!(entity = %self.entity, error = ?e, "detection cycle failed, stopping session");
                    break Err(e);
                }
            }
        };

        if outcome.is_ok() {
            session
                .save_snapshot()
                .context("failed to save model snapshot at shutdown")?;
        }
        info!(
            entity = %self.entity,
            scored = session.scored(),
            "detection session stopped"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathsConfig;
    use crate::detect::DataPoint;
    use crate::storage::queue;
    use crate::storage::record::InputRow;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_engine_drains_queue_and_cleans_up_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(&PathsConfig {
            management_dir: dir.path().join("management"),
            raw_input_dir: dir.path().join("INPUT"),
            final_output_dir: dir.path().join("OUTPUT"),
        });
        let entity = EntityKey::new("10.0.0.1", "web");
        let config = DetectorConfig {
            trees: 4,
            leaves: 16,
            sequences: 2,
            idle_delay_ms: 10,
            seed: Some(3),
            ..DetectorConfig::default()
        };

        let input = layout.entity(&entity).input_dir();
        for i in 0..5 {
            let row = InputRow {
                entity: entity.clone(),
                point: DataPoint::new(format!("2024010100{:02}", i), vec![i as f64]),
            };
            queue::enqueue(&input, &row).unwrap();
        }

        let (tx, rx) = watch::channel(false);
        let engine = DetectorEngine::new(entity.clone(), layout.clone(), config);
        let handle = tokio::spawn(engine.run(rx));

        let output = layout.entity(&entity).output_dir();
        let mut published = 0;
        for _ in 0..200 {
            published = crate::storage::marker::pending(&output).unwrap().len();
            if published == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(published, 4);
        assert!(layout
            .running_dir()
            .join("10.0.0.1_web.detector.run")
            .exists());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(!layout
            .running_dir()
            .join("10.0.0.1_web.detector.run")
            .exists());
        assert!(layout.entity(&entity).snapshot_path().exists());
    }
}
