//! TOML configuration for pgwatch.
//!
//! Every section falls back to compiled-in defaults, so a partial file (or
//! no file at all) is valid. The config file is looked up from an explicit
//! path, then `PGWATCH_CONFIG`, then `/etc/pgwatch/pgwatch.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming an alternate config file.
pub const CONFIG_ENV: &str = "PGWATCH_CONFIG";

const SYSTEM_CONFIG_PATH: &str = "/etc/pgwatch/pgwatch.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PgwatchConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PgwatchConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        debug!(path = %path.display(), "loaded pgwatch configuration");
        Ok(config)
    }

    /// Resolve the configuration.
    ///
    /// An explicitly requested file must load; the environment and system
    /// locations fall through to defaults with a warning when broken.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "PGWATCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => {
                    info!(path = %system_path.display(), "using system configuration");
                    return Ok(cfg);
                }
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of the per-entity working tree (queues, outputs, logs, markers).
    pub management_dir: PathBuf,
    /// Where raw multi-service input files arrive.
    pub raw_input_dir: PathBuf,
    /// Shared location for consolidated result files.
    pub final_output_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            management_dir: PathBuf::from("./management"),
            raw_input_dir: PathBuf::from("./INPUT"),
            final_output_dir: PathBuf::from("./OUTPUT"),
        }
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Number of trees in the forest.
    pub trees: usize,
    /// Points each tree remembers (slot capacity).
    pub leaves: usize,
    /// Sliding window length, also the confirmation window size.
    pub sequences: usize,
    /// Threshold quantile, strictly between 0 and 1.
    pub quantile: f64,
    /// Pause between polls when the input queue is empty.
    pub idle_delay_ms: u64,
    /// Detection cycles per day (one per minute by default).
    pub cycles_per_day: usize,
    /// Days of score history kept live before the oldest half is archived.
    pub threshold_days: usize,
    /// Scored cycles between model snapshots; 0 disables periodic snapshots.
    pub snapshot_interval: u64,
    /// Fixed RNG seed for the forest.
    pub seed: Option<u64>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            trees: 80,
            leaves: 4320,
            sequences: 10,
            quantile: 0.99,
            idle_delay_ms: 1000,
            cycles_per_day: 24 * 60,
            threshold_days: 30,
            snapshot_interval: 60,
            seed: None,
        }
    }
}

impl DetectorConfig {
    /// Live score records kept before a checkpoint trims history.
    pub fn max_threshold_duration(&self) -> usize {
        self.sequences * self.cycles_per_day * self.threshold_days
    }

    pub fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.idle_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Pause between aggregation cycles.
    pub poll_interval_ms: u64,
    /// Reader threads per gateway worker.
    pub read_workers: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            read_workers: 4,
        }
    }
}

impl AggregatorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Pause between scans of the raw input directory.
    pub poll_interval_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
        }
    }
}

impl IngestConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
    /// Also write daily log files next to the working tree.
    pub files: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            files: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
