use crate::record::PayloadEncoding;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Storage engine configuration shared by the capture process
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory holding `<cam_id>/<YYYY-MM-DD>.sqlite`
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    /// Payload column flavor for newly created partitions
    #[serde(default)]
    pub payload_encoding: PayloadEncoding,
    /// Fixed offset east of UTC in minutes; host local time when unset
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,
}

/// Configuration for the export batch job
#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    /// Destination root for exported images
    #[serde(default = "default_out_root")]
    pub out_root: PathBuf,
    /// Rows fetched per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Abort the whole export on the first unparseable timestamp
    #[serde(default)]
    pub strict_timestamps: bool,
    /// Offset used to turn epoch milliseconds into file dates and times
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_storage_root() -> PathBuf {
    PathBuf::from("sqlite_dataset")
}

fn default_out_root() -> PathBuf {
    PathBuf::from("images_export")
}

fn default_batch_size() -> u32 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            payload_encoding: PayloadEncoding::default(),
            utc_offset_minutes: None,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            out_root: default_out_root(),
            batch_size: default_batch_size(),
            strict_timestamps: false,
            utc_offset_minutes: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ExportConfig {
    /// Load configuration from config files and environment
    ///
    /// Sources, later overriding earlier:
    /// 1. `config/export.toml` (optional)
    /// 2. the explicit file passed on the command line (required if given)
    /// 3. environment variables, e.g. `EXPORT__BATCH_SIZE=500`
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/export").required(false));

        if let Some(path) = explicit {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("EXPORT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.batch_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "batch_size".to_string(),
                message: "Batch size must be greater than 0".to_string(),
            });
        }
        validate_offset(self.utc_offset_minutes, "utc_offset_minutes")?;
        Ok(())
    }
}

impl StorageConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.root.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField("storage.root".to_string()));
        }
        validate_offset(self.utc_offset_minutes, "storage.utc_offset_minutes")
    }
}

fn validate_offset(minutes: Option<i32>, field: &str) -> Result<(), ConfigValidationError> {
    match minutes {
        Some(m) if m.abs() >= 24 * 60 => Err(ConfigValidationError::InvalidValue {
            field: field.to_string(),
            message: format!("Offset of {m} minutes is out of range"),
        }),
        _ => Ok(()),
    }
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
