//! Capture service for public traffic cameras.
//!
//! Captures every camera of one chunk file on a fixed period and stores each
//! outcome in per-camera day partitions.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml, --config)
//! 2. Environment variables (prefixed with INGEST__)
//! 3. Command line overrides
//!
//! See `config.rs` for detailed configuration options.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use trafficcam_ingest::config::{IngestConfig, LoggingConfig};
use trafficcam_ingest::{load_chunk, CaptureScheduler, HttpCaptureClient, SchedulerStats};
use trafficcam_storage::PayloadEncoding;

/// Capture one chunk of traffic cameras on a fixed period.
#[derive(Debug, Parser)]
#[command(name = "trafficcam-ingest", version, about)]
struct Cli {
    /// Chunk file: JSON array of cameras
    chunk: PathBuf,

    /// Cycle period in seconds
    #[arg(long)]
    interval: Option<f64>,

    /// Delay before the first cycle in seconds
    #[arg(long)]
    offset: Option<f64>,

    /// Page and image request timeout in seconds
    #[arg(long)]
    page_timeout: Option<u64>,

    /// Request a visible browser window where the client supports one
    #[arg(long)]
    headful: bool,

    /// Storage root for day partitions
    #[arg(long)]
    save_dir: Option<PathBuf>,

    /// Payload column flavor (bytes or base64)
    #[arg(long)]
    payload: Option<PayloadEncoding>,

    /// Stop after this many cycles
    #[arg(long)]
    max_cycles: Option<u64>,

    /// Extra configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn apply(&self, config: &mut IngestConfig) -> anyhow::Result<()> {
        if let Some(secs) = self.interval {
            config.scheduler.period_ms = seconds_to_ms(secs, "--interval")?;
        }
        if let Some(secs) = self.offset {
            config.scheduler.start_offset_ms = seconds_to_ms(secs, "--offset")?;
        }
        if let Some(timeout) = self.page_timeout {
            config.client.page_timeout_secs = timeout;
        }
        if self.headful {
            config.client.headless = false;
        }
        if let Some(dir) = &self.save_dir {
            config.storage.root = dir.clone();
        }
        if let Some(encoding) = self.payload {
            config.storage.payload_encoding = encoding;
        }
        if self.max_cycles.is_some() {
            config.scheduler.max_cycles = self.max_cycles;
        }
        if self.debug {
            config.logging.level = "debug".to_string();
        }
        Ok(())
    }
}

fn seconds_to_ms(secs: f64, flag: &str) -> anyhow::Result<u64> {
    if !secs.is_finite() || secs < 0.0 {
        anyhow::bail!("{flag} must be a non-negative number of seconds");
    }
    Ok((secs * 1000.0).round() as u64)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config =
        IngestConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply(&mut config)?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "trafficcam-ingest",
        version = env!("CARGO_PKG_VERSION"),
        chunk = %cli.chunk.display(),
        "Starting capture service"
    );

    // Validate configuration
    config.validate()?;

    if let Some(port) = config.metrics.port {
        init_metrics(port)?;
    }

    let chunk = load_chunk(&cli.chunk).context("Failed to load chunk file")?;
    info!(
        chunk = %chunk.file_name,
        cameras = chunk.cameras.len(),
        period_ms = config.scheduler.period_ms,
        storage_root = %config.storage.root.display(),
        payload = %config.storage.payload_encoding,
        "Chunk loaded"
    );

    let client = HttpCaptureClient::new(&config.client).context("Failed to build capture client")?;
    client.warm_up().await;

    let mut scheduler = CaptureScheduler::new(Arc::new(client), chunk, &config)?;

    let cancel = Arc::new(AtomicBool::new(false));
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown requested, finishing current cycle");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let stats = scheduler.run(cancel).await;
    log_final_stats(&stats);
    println!("[DONE] {stats}");

    Ok(())
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)?
            .add_directive("hyper=warn".parse()?)
            .add_directive("reqwest=warn".parse()?)
            .add_directive("sqlx=warn".parse()?),
    };

    let subscriber = tracing_subscriber::registry().with(filter);

    match config.format.as_str() {
        "json" => subscriber.with(fmt::layer().json()).init(),
        "pretty" => subscriber.with(fmt::layer().pretty()).init(),
        _ => subscriber.with(fmt::layer().compact()).init(),
    }

    Ok(())
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

/// Log final statistics on shutdown.
fn log_final_stats(stats: &SchedulerStats) {
    info!("=== Final Statistics ===");
    info!(
        cycles = stats.cycles,
        attempts = stats.attempts,
        successes = stats.successes,
        failed = stats.failed(),
        "Capture final stats"
    );
    for (kind, count) in &stats.failures {
        info!(error = %kind, count = *count, "Failures by kind");
    }
}
