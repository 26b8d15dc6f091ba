//! One detection session per (gateway, service).
//!
//! A cycle pulls one data point into the sliding window and, once the window
//! is full, scores the flattened window against the forest, updates the
//! threshold, runs the confirmation machine and publishes a result row with
//! its completion marker.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use super::confirm::ConfirmationMachine;
use super::forest::ForestOracle;
use super::slots::SlotRecycler;
use super::threshold::ThresholdTracker;
use super::window::SlidingWindow;
use super::{DataPoint, DetectError, EntityKey, Verdict};
use crate::config::DetectorConfig;
use crate::storage::checkpoint::{self, ModelSnapshot, SnapshotPoint};
use crate::storage::record::ResultRecord;
use crate::storage::{marker, queue, EntityPaths};

/// Hyperparameters a session is built from.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionParams {
    pub leaves: usize,
    pub sequences: usize,
    pub quantile: f64,
    pub max_threshold_duration: usize,
}

impl SessionParams {
    pub fn from_config(cfg: &DetectorConfig) -> Self {
        Self {
            leaves: cfg.leaves,
            sequences: cfg.sequences,
            quantile: cfg.quantile,
            max_threshold_duration: cfg.max_threshold_duration(),
        }
    }
}

/// What one call to [`DetectionSession::step`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// The input queue was empty.
    Idle,
    /// A point was taken but the sliding window is still filling.
    WarmingUp,
    Scored(ResultRecord),
}

pub struct DetectionSession<F: ForestOracle> {
    entity: EntityKey,
    paths: EntityPaths,
    params: SessionParams,
    window: SlidingWindow,
    recycler: SlotRecycler,
    forest: F,
    tracker: ThresholdTracker,
    machine: ConfirmationMachine,
    scored: u64,
}

impl<F: ForestOracle> DetectionSession<F> {
    /// Build a cold session. Every hyperparameter is validated here so a bad
    /// configuration never reaches the run loop.
    pub fn new(
        entity: EntityKey,
        paths: EntityPaths,
        params: SessionParams,
        forest: F,
    ) -> Result<Self, DetectError> {
        if forest.num_trees() == 0 {
            return Err(DetectError::InvalidConfig(
                "forest has no trees".to_string(),
            ));
        }
        Ok(Self {
            window: SlidingWindow::new(params.sequences)?,
            recycler: SlotRecycler::new(params.leaves)?,
            tracker: ThresholdTracker::new(params.quantile, params.max_threshold_duration)?,
            machine: ConfirmationMachine::new(params.sequences)?,
            entity,
            paths,
            params,
            forest,
            scored: 0,
        })
    }

    pub fn entity(&self) -> &EntityKey {
        &self.entity
    }

    pub fn paths(&self) -> &EntityPaths {
        &self.paths
    }

    pub fn forest(&self) -> &F {
        &self.forest
    }

    pub fn tracker(&self) -> &ThresholdTracker {
        &self.tracker
    }

    pub fn recycler(&self) -> &SlotRecycler {
        &self.recycler
    }

    /// Scored cycles since this session was opened.
    pub fn scored(&self) -> u64 {
        self.scored
    }

    /// Pull the oldest queued point, if any, and run one cycle on it.
    pub fn step(&mut self) -> Result<Step> {
        let Some(row) = queue::dequeue(
            &self.paths.input_dir(),
            &self.entity,
            self.window.dimensions(),
        )?
        else {
            return Ok(Step::Idle);
        };

        Ok(match self.ingest(row.point)? {
            Some(record) => Step::Scored(record),
            None => Step::WarmingUp,
        })
    }

    /// Run one detection cycle on `point`.
    ///
    /// Returns `None` while the sliding window is still filling. Any error is
    /// fatal for the session.
    pub fn ingest(&mut self, point: DataPoint) -> Result<Option<ResultRecord>> {
        self.window.push(point.clone())?;
        if !self.window.is_full() {
            debug!(
                entity = %self.entity,
                filled = self.window.len(),
                size = self.window.size(),
                "warming up sliding window"
            );
            return Ok(None);
        }

        let shingle = self.window.flatten();
        let slot = self.recycler.next_slot()?;
        let trees = self.forest.num_trees();

        let mut total = 0.0;
        for tree in 0..trees {
            if slot.reused {
                self.forest.evict(tree, slot.id)?;
            }
            self.forest.insert(tree, slot.id, &shingle)?;
            total += self.forest.score(tree, slot.id)?;
        }
        let score = total / trees as f64;

        self.tracker.record(point.timestamp.as_str(), score);
        if let Some(archive) = self.tracker.maybe_checkpoint() {
            checkpoint::write_archive(&self.paths.scores_dir(), &archive)?;
        }
        let threshold = self.tracker.threshold()?;
        let verdict = self.machine.observe(&point.timestamp, score, threshold)?;

        if let Verdict::Anomaly {
            window_start,
            window_end,
            percentage,
        } = &verdict
        {
            info!(
                entity = %self.entity,
                %window_start,
                %window_end,
                percentage,
                "confirmation window closed"
            );
        }

        let record = ResultRecord {
            entity: self.entity.clone(),
            timestamp: point.timestamp,
            values: point.values,
            score,
            verdict,
        };
        self.publish(&record)?;
        self.recycler.recycle(slot.id)?;
        self.scored += 1;

        debug!(
            entity = %self.entity,
            timestamp = %record.timestamp,
            slot = slot.id,
            score,
            threshold,
            label = record.verdict.label(),
            "cycle complete"
        );
        Ok(Some(record))
    }

    fn result_path(&self, timestamp: &str) -> PathBuf {
        self.paths
            .output_dir()
            .join(format!("{}_{}.DAT", self.entity, timestamp))
    }

    fn publish(&self, record: &ResultRecord) -> Result<()> {
        let path = self.result_path(&record.timestamp);
        marker::commit(&path, format!("{}\n", record.to_row()).as_bytes())
            .with_context(|| format!("failed to publish result for {}", self.entity))
    }

    /// Capture the live forest points and sliding window.
    ///
    /// `None` when nothing has been seen yet or the oracle cannot report its
    /// stored points.
    pub fn snapshot(&self) -> Option<ModelSnapshot> {
        let dimensions = self.window.dimensions()?;
        let last = self.recycler.last_position();
        let pooled = self.recycler.pooled() as u64;

        let mut points = Vec::with_capacity(self.recycler.pooled());
        for (i, slot) in self.recycler.pooled_slots().enumerate() {
            let values = self.forest.point(slot)?;
            let position = last? + 1 - pooled + i as u64;
            points.push(SnapshotPoint {
                slot,
                position,
                values,
            });
        }

        Some(ModelSnapshot {
            num_trees: self.forest.num_trees(),
            capacity: self.params.leaves,
            sequences: self.params.sequences,
            dimensions,
            last_position: last,
            points,
            window: self.window.points().cloned().collect(),
            saved_at: chrono::Utc::now(),
        })
    }

    /// Persist [`Self::snapshot`] to the entity's model directory.
    pub fn save_snapshot(&self) -> Result<bool> {
        match self.snapshot() {
            Some(snapshot) => {
                let path = self.paths.snapshot_path();
                snapshot.save(&path)?;
                debug!(entity = %self.entity, path = %path.display(), "model snapshot saved");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replay a snapshot into this freshly built session.
    pub fn restore(&mut self, snapshot: &ModelSnapshot) -> Result<(), DetectError> {
        if self.scored > 0 || !self.window.is_empty() || self.forest.live_count(0) > 0 {
            return Err(DetectError::InvalidConfig(
                "snapshots can only be restored into a fresh session".to_string(),
            ));
        }
        if !snapshot.matches(self.forest.num_trees(), self.params.leaves, self.params.sequences)
        {
            return Err(DetectError::InvalidConfig(format!(
                "snapshot taken with trees={} leaves={} sequences={}",
                snapshot.num_trees, snapshot.capacity, snapshot.sequences
            )));
        }

        let recycler = SlotRecycler::seeded(
            self.params.leaves,
            snapshot.last_position,
            snapshot.points.len(),
        )?;
        let expected: Vec<usize> = recycler.pooled_slots().collect();
        let found: Vec<usize> = snapshot.points.iter().map(|p| p.slot).collect();
        if expected != found {
            return Err(DetectError::InvalidConfig(
                "snapshot slots disagree with its last position".to_string(),
            ));
        }

        let mut window = SlidingWindow::new(self.params.sequences)?.with_dimensions(snapshot.dimensions);
        for point in &snapshot.window {
            window.push(point.clone())?;
        }

        for point in &snapshot.points {
            for tree in 0..self.forest.num_trees() {
                self.forest.insert(tree, point.slot, &point.values)?;
            }
        }

        self.recycler = recycler;
        self.window = window;
        info!(
            entity = %self.entity,
            points = snapshot.points.len(),
            last_position = ?snapshot.last_position,
            "restored model snapshot"
        );
        Ok(())
    }
}

/// Open the session for `entity` with a fresh forest from `build_forest`,
/// warming it from the saved snapshot when one matches.
///
/// The hyperparameters are validated before the entity directories are
/// created. An unreadable or mismatched snapshot is logged and ignored.
pub fn open<F, B>(
    entity: EntityKey,
    paths: EntityPaths,
    cfg: &DetectorConfig,
    build_forest: B,
) -> Result<DetectionSession<F>>
where
    F: ForestOracle,
    B: Fn() -> Result<F, DetectError>,
{
    let params = SessionParams::from_config(cfg);
    let cold = || -> Result<DetectionSession<F>> {
        let forest = build_forest().context("failed to build forest")?;
        DetectionSession::new(entity.clone(), paths.clone(), params.clone(), forest)
            .context("invalid detector configuration")
    };

    let mut session = cold()?;
    paths.ensure()?;
    let snapshot = match ModelSnapshot::load(&paths.snapshot_path()) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(entity = %entity, error = %e, "ignoring unreadable model snapshot");
            None
        }
    };

    if let Some(snapshot) = snapshot {
        if let Err(e) = session.restore(&snapshot) {
            warn!(entity = %entity, error = %e, "ignoring model snapshot, starting cold");
            session = cold()?;
        }
    }
    Ok(session)
}
