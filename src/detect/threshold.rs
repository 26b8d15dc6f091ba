//! Adaptive quantile threshold over the live score history.

use serde::{Deserialize, Serialize};

use super::DetectError;

/// A (timestamp, score) pair. Serializes as a two-element JSON array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord(pub String, pub f64);

impl ScoreRecord {
    pub fn timestamp(&self) -> &str {
        &self.0
    }

    pub fn score(&self) -> f64 {
        self.1
    }
}

/// Oldest records trimmed from the live history, ready to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreArchive {
    pub records: Vec<ScoreRecord>,
}

impl ScoreArchive {
    /// `anomaly_score_<first>_<last>.json`, named by the archived span.
    pub fn file_name(&self) -> String {
        let start = self.records.first().map(ScoreRecord::timestamp).unwrap_or("");
        let end = self.records.last().map(ScoreRecord::timestamp).unwrap_or("");
        format!("anomaly_score_{}_{}.json", start, end)
    }
}

/// Linear-interpolation quantile of `values` (numpy's default method).
///
/// Returns `None` for an empty slice.
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = q * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

#[derive(Debug, Clone)]
pub struct ThresholdTracker {
    quantile: f64,
    max_duration: usize,
    history: Vec<ScoreRecord>,
    threshold: Option<f64>,
}

impl ThresholdTracker {
    pub fn new(quantile: f64, max_duration: usize) -> Result<Self, DetectError> {
        if !(quantile > 0.0 && quantile < 1.0) {
            return Err(DetectError::InvalidQuantile(quantile));
        }
        if max_duration == 0 {
            return Err(DetectError::InvalidConfig(
                "max threshold duration must be positive".to_string(),
            ));
        }
        Ok(Self {
            quantile,
            max_duration,
            history: Vec::new(),
            threshold: None,
        })
    }

    pub fn max_duration(&self) -> usize {
        self.max_duration
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn history(&self) -> &[ScoreRecord] {
        &self.history
    }

    /// Append a score and recompute the threshold over the live history.
    ///
    /// The threshold is refreshed on every record, including the stretch
    /// between warm-up (`max_duration` records) and the first trim.
    pub fn record(&mut self, timestamp: impl Into<String>, score: f64) {
        self.history.push(ScoreRecord(timestamp.into(), score));
        self.recompute();
    }

    /// Current threshold. Errors before any score has been recorded.
    pub fn threshold(&self) -> Result<f64, DetectError> {
        self.threshold.ok_or(DetectError::Empty("score history"))
    }

    /// Trim the oldest `max_duration` records once the history reaches a
    /// multiple of `2 * max_duration`, returning them for archival.
    pub fn maybe_checkpoint(&mut self) -> Option<ScoreArchive> {
        let len = self.history.len();
        if len == 0 || len % (2 * self.max_duration) != 0 {
            return None;
        }
        let records: Vec<ScoreRecord> = self.history.drain(..self.max_duration).collect();
        self.recompute();
        Some(ScoreArchive { records })
    }

    fn recompute(&mut self) {
        let scores: Vec<f64> = self.history.iter().map(ScoreRecord::score).collect();
        self.threshold = quantile(&scores, self.quantile);
    }
}
