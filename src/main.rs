use std::path::PathBuf;

use std::ffi::OsString;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use pgwatch::aggregate::WorkerMode;
use pgwatch::config::PgwatchConfig;
use pgwatch::detect::EntityKey;
use pgwatch::storage::Layout;

#[derive(Parser)]
#[command(
    name = "pgwatch",
    about = "Streaming per-gateway traffic anomaly detection",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a pgwatch.toml (defaults: $PGWATCH_CONFIG, /etc/pgwatch/pgwatch.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, global = true, env = "PGWATCH_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one detection session for a (gateway, service) pair
    Detect {
        /// Gateway address
        #[arg(long)]
        ip: String,

        /// Service type
        #[arg(long)]
        svc: String,

        /// Number of trees in the forest
        #[arg(long)]
        trees: Option<usize>,

        /// Points remembered per tree
        #[arg(long)]
        leaves: Option<usize>,

        /// Sliding / confirmation window length
        #[arg(long = "seq")]
        sequences: Option<usize>,

        /// Threshold quantile (0 < q < 1)
        #[arg(long = "q")]
        quantile: Option<f64>,

        /// Fixed RNG seed for reproducible runs
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Merge per-service results into consolidated per-gateway files
    Aggregate {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },

    /// Aggregate one gateway and print its report as JSON
    #[command(name = "aggregate-gateway", hide = true)]
    AggregateGateway {
        /// Gateway address
        #[arg(long)]
        ip: String,

        /// Live service under the gateway (repeatable)
        #[arg(long = "svc", required = true)]
        services: Vec<String>,

        /// File reader threads
        #[arg(long)]
        read_workers: Option<usize>,
    },

    /// Split raw input files into per-entity input queues
    Ingest {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },

    /// List running sessions grouped by gateway
    Status {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Send SIGTERM to every running pgwatch process
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Forwarded to per-gateway worker processes.
    let mut global_args: Vec<OsString> = Vec::new();
    if let Some(path) = &cli.config {
        global_args.push("--config".into());
        global_args.push(path.clone().into_os_string());
    }
    if let Some(level) = &cli.log_level {
        global_args.push("--log-level".into());
        global_args.push(level.into());
    }

    let mut config = PgwatchConfig::resolve(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    let layout = Layout::new(&config.paths);

    match cli.command {
        Commands::Detect {
            ip,
            svc,
            trees,
            leaves,
            sequences,
            quantile,
            seed,
        } => {
            let detector = &mut config.detector;
            if let Some(v) = trees {
                detector.trees = v;
            }
            if let Some(v) = leaves {
                detector.leaves = v;
            }
            if let Some(v) = sequences {
                detector.sequences = v;
            }
            if let Some(v) = quantile {
                detector.quantile = v;
            }
            if seed.is_some() {
                detector.seed = seed;
            }

            let entity = EntityKey::new(ip, svc);
            let log_dir = layout.entity(&entity).log_dir();
            pgwatch::logging::init(&config.logging, Some((&log_dir, "detector")))?;
            tracing::info!(%entity, "starting detection session");
            pgwatch::run_detector(&config, entity).await?;
        }
        Commands::Aggregate { once } => {
            let log_dir = layout.shared_log_dir();
            pgwatch::logging::init(&config.logging, Some((&log_dir, "aggregator")))?;
            let mode = WorkerMode::Subprocess {
                exe: std::env::current_exe().context("failed to locate the pgwatch binary")?,
                global_args,
            };
            pgwatch::run_aggregator(&config, once, mode).await?;
        }
        Commands::AggregateGateway {
            ip,
            services,
            read_workers,
        } => {
            let log_dir = layout.shared_log_dir();
            pgwatch::logging::init(&config.logging, Some((&log_dir, "aggregator")))?;
            let read_workers = read_workers.unwrap_or(config.aggregator.read_workers);
            let report = pgwatch::run_gateway_worker(&config, ip, services, read_workers).await?;
            println!("{}", serde_json::to_string(&report)?);
        }
        Commands::Ingest { once } => {
            let log_dir = layout.shared_log_dir();
            pgwatch::logging::init(&config.logging, Some((&log_dir, "ingest")))?;
            pgwatch::run_ingest(&config, once).await?;
        }
        Commands::Status { json } => {
            pgwatch::logging::init(&config.logging, None)?;
            let report = pgwatch::control::status(&layout)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render());
            }
        }
        Commands::Stop => {
            pgwatch::logging::init(&config.logging, None)?;
            let signalled = pgwatch::control::stop(&layout)?;
            println!("Signalled {} process(es).", signalled);
        }
    }

    Ok(())
}
