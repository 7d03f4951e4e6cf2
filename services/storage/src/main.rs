use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use trafficcam_storage::{ExportConfig, Exporter, LoggingConfig};

/// Export every successful capture of one day partition to image files.
#[derive(Debug, Parser)]
#[command(name = "trafficcam-export", version, about)]
struct Cli {
    /// Partition file to read, e.g. sqlite_dataset/cam-1/2024-06-01.sqlite
    #[arg(long)]
    sqlite_file: PathBuf,

    /// Destination root; overrides the configured one
    #[arg(long)]
    out_root: Option<PathBuf>,

    /// Rows fetched per batch
    #[arg(long)]
    batch: Option<u32>,

    /// Abort on the first row whose timestamp cannot be parsed
    #[arg(long)]
    strict_timestamps: bool,

    /// Offset east of UTC used for file dates, in minutes
    #[arg(long, allow_hyphen_values = true)]
    utc_offset_minutes: Option<i32>,

    /// Extra configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config =
        ExportConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(out_root) = cli.out_root {
        config.out_root = out_root;
    }
    if let Some(batch) = cli.batch {
        config.batch_size = batch;
    }
    if cli.strict_timestamps {
        config.strict_timestamps = true;
    }
    if cli.utc_offset_minutes.is_some() {
        config.utc_offset_minutes = cli.utc_offset_minutes;
    }
    if cli.debug {
        config.logging.level = "debug".to_string();
    }

    init_tracing(&config.logging);
    config.validate().context("Invalid export configuration")?;

    info!(
        source = %cli.sqlite_file.display(),
        out_root = %config.out_root.display(),
        batch_size = config.batch_size,
        "Starting export"
    );

    let out_root = config.out_root.clone();
    let exporter = Exporter::new(config)?;
    match exporter.export(&cli.sqlite_file).await {
        Ok(summary) => {
            println!("[DONE] {summary} -> {}", out_root.display());
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Export failed");
            Err(e.into())
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(logging: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let registry = tracing_subscriber::registry().with(env_filter);
    match logging.format.as_str() {
        "json" => registry.with(fmt::layer().json()).init(),
        "pretty" => registry.with(fmt::layer().pretty()).init(),
        _ => registry.with(fmt::layer().compact()).init(),
    }
}
