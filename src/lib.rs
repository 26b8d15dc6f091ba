//! pgwatch -- streaming per-gateway traffic anomaly detection.
//!
//! One detection session per (gateway, service) scores incoming traffic
//! vectors with a robust random cut forest, keeps an adaptive quantile
//! threshold and confirms anomalies over a window of cycles. An aggregator
//! merges the per-service results into one file per gateway and timestamp.
//! All coordination between processes happens through the filesystem.

pub mod aggregate;
pub mod config;
pub mod control;
pub mod detect;
pub mod ingest;
pub mod logging;
pub mod signal;
pub mod storage;

use anyhow::Result;

use crate::aggregate::engine::AggregatorEngine;
use crate::aggregate::{GatewayReport, WorkerMode};
use crate::config::PgwatchConfig;
use crate::detect::engine::DetectorEngine;
use crate::detect::EntityKey;
use crate::storage::Layout;

/// Run one detection session until SIGINT/SIGTERM.
pub async fn run_detector(config: &PgwatchConfig, entity: EntityKey) -> Result<()> {
    let layout = Layout::new(&config.paths);
    let shutdown = signal::shutdown_channel();
    DetectorEngine::new(entity, layout, config.detector.clone())
        .run(shutdown)
        .await
}

/// Run the aggregator loop, or a single cycle with `once`.
pub async fn run_aggregator(config: &PgwatchConfig, once: bool, mode: WorkerMode) -> Result<()> {
    let layout = Layout::new(&config.paths);
    let engine = AggregatorEngine::new(layout, config.aggregator.clone()).with_mode(mode);
    if once {
        let report = engine.run_once().await?;
        tracing::info!(
            gateways = report.gateways.len(),
            failed = report.failed.len(),
            files = report.files_written(),
            rows = report.rows(),
            "aggregation cycle complete"
        );
        return Ok(());
    }
    engine.run(signal::shutdown_channel()).await
}

/// Aggregate a single gateway in this process. This is the body of the
/// per-gateway worker process the aggregator spawns.
pub async fn run_gateway_worker(
    config: &PgwatchConfig,
    gateway: String,
    services: Vec<String>,
    read_workers: usize,
) -> Result<GatewayReport> {
    let layout = Layout::new(&config.paths);
    tokio::task::spawn_blocking(move || {
        aggregate::worker::aggregate_gateway(&layout, &gateway, &services, read_workers)
    })
    .await?
}

/// Run the raw input splitter loop, or a single pass with `once`.
pub async fn run_ingest(config: &PgwatchConfig, once: bool) -> Result<()> {
    let layout = Layout::new(&config.paths);
    if once {
        layout.ensure()?;
        let report = tokio::task::spawn_blocking(move || ingest::run_once(&layout)).await??;
        tracing::info!(
            files = report.files,
            queued = report.queued,
            skipped = report.skipped,
            "ingest pass complete"
        );
        return Ok(());
    }
    ingest::run(layout, config.ingest.clone(), signal::shutdown_channel()).await
}
