//! Per-entity anomaly detection: slot recycling, adaptive threshold,
//! confirmation windows and the session that drives them.

pub mod confirm;
pub mod engine;
pub mod forest;
pub mod session;
pub mod slots;
pub mod threshold;
pub mod window;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Invariant and configuration failures raised by the detection core.
///
/// Every variant is fatal for the owning session: configuration errors are
/// raised before the run loop starts, the rest mean a bounded-memory
/// invariant has been broken mid-stream.
#[derive(Debug, Error, PartialEq)]
pub enum DetectError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("quantile must lie strictly between 0 and 1, got {0}")]
    InvalidQuantile(f64),

    #[error("slot pool overflow: capacity is {capacity}")]
    SlotOverflow { capacity: usize },

    #[error("confirmation window overflow: capacity is {capacity}")]
    WindowOverflow { capacity: usize },

    #[error("{0} is empty")]
    Empty(&'static str),

    #[error("slot {slot} is not live in tree {tree}")]
    UnknownSlot { tree: usize, slot: usize },

    #[error("slot {slot} is already live in tree {tree}")]
    SlotInUse { tree: usize, slot: usize },

    #[error("tree index {tree} out of range for a forest of {trees}")]
    TreeOutOfRange { tree: usize, trees: usize },

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("data point at {0} holds a non-finite value")]
    NonFinite(String),
}

/// A (gateway address, service type) pair under independent monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub gateway: String,
    pub service: String,
}

impl EntityKey {
    pub fn new(gateway: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            gateway: gateway.into(),
            service: service.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.gateway, self.service)
    }
}

/// One timestamped measurement vector (e.g. uplink / downlink volume).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub timestamp: String,
    pub values: Vec<f64>,
}

impl DataPoint {
    pub fn new(timestamp: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            timestamp: timestamp.into(),
            values,
        }
    }
}

/// Graded outcome of one detection cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Verdict {
    /// Score below threshold with no confirmation window open.
    Normal,
    /// A confirmation window is open and has not filled yet.
    Observing,
    /// A confirmation window just closed.
    Anomaly {
        window_start: String,
        window_end: String,
        percentage: f64,
    },
}

impl Verdict {
    /// Label written into result rows.
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Normal => "Normal",
            Verdict::Observing => "observing",
            Verdict::Anomaly { .. } => "Anomaly",
        }
    }
}
