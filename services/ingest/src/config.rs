//! Configuration management for the capture service.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use trafficcam_storage::StorageConfig;

/// Main configuration for the capture service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestConfig {
    /// Cycle timing and retry configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Capture client configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Image normalization configuration
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Day partition storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Capture loop configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Cycle period in milliseconds
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,

    /// Delay before the first cycle in milliseconds, to stagger processes
    #[serde(default)]
    pub start_offset_ms: u64,

    /// Nominal cohort size; other sizes run with a warning
    #[serde(default = "default_expected_cohort")]
    pub expected_cohort: usize,

    /// Stop after this many cycles (unbounded when unset)
    #[serde(default)]
    pub max_cycles: Option<u64>,

    /// Delay before the single retry of image location in milliseconds
    #[serde(default = "default_locate_retry_ms")]
    pub locate_retry_ms: u64,

    /// Delay before the single retry of the image fetch in milliseconds
    #[serde(default = "default_fetch_retry_ms")]
    pub fetch_retry_ms: u64,
}

/// HTTP capture client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Page and image request timeout in seconds
    #[serde(default = "default_page_timeout")]
    pub page_timeout_secs: u64,

    /// Run without a visible browser window. The HTTP client is always
    /// headless; the flag is kept for parity with browser-backed clients.
    #[serde(default = "default_headless")]
    pub headless: bool,

    /// User agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Referer header for page and image requests
    #[serde(default)]
    pub referer: Option<String>,

    /// Origin header for page and image requests
    #[serde(default)]
    pub origin: Option<String>,

    /// Accept-Language header
    #[serde(default = "default_accept_language")]
    pub accept_language: String,

    /// Page requested once at startup to seed session cookies
    #[serde(default)]
    pub warm_up_url: Option<String>,
}

/// Image normalization configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    /// JPEG quality used when re-encoding animated sources
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Metrics configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Port for the Prometheus listener; disabled when unset
    #[serde(default)]
    pub port: Option<u16>,
}

// Default value functions
fn default_period_ms() -> u64 {
    15_000
}
fn default_expected_cohort() -> usize {
    6
}
fn default_locate_retry_ms() -> u64 {
    1_500
}
fn default_fetch_retry_ms() -> u64 {
    1_500
}
fn default_page_timeout() -> u64 {
    20
}
fn default_headless() -> bool {
    true
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0 Safari/537.36"
        .to_string()
}
fn default_accept_language() -> String {
    "vi-VN,vi;q=0.9,en-US;q=0.8,en;q=0.7".to_string()
}
fn default_jpeg_quality() -> u8 {
    90
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            period_ms: default_period_ms(),
            start_offset_ms: 0,
            expected_cohort: default_expected_cohort(),
            max_cycles: None,
            locate_retry_ms: default_locate_retry_ms(),
            fetch_retry_ms: default_fetch_retry_ms(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            page_timeout_secs: default_page_timeout(),
            headless: default_headless(),
            user_agent: default_user_agent(),
            referer: None,
            origin: None,
            accept_language: default_accept_language(),
            warm_up_url: None,
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: default_jpeg_quality(),
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

impl IngestConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. An explicit file, when given
    /// 4. Environment variables (prefixed with INGEST__)
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let mut builder = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false));

        if let Some(path) = explicit {
            builder = builder.add_source(File::from(path).required(true));
        }

        // Override with environment variables (e.g., INGEST__SCHEDULER__PERIOD_MS)
        let config = builder
            .add_source(
                Environment::with_prefix("INGEST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.scheduler.period_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "scheduler.period_ms".to_string(),
                message: "Period must be greater than 0".to_string(),
            });
        }

        if self.scheduler.expected_cohort == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "scheduler.expected_cohort".to_string(),
                message: "Cohort size must be greater than 0".to_string(),
            });
        }

        if self.scheduler.max_cycles == Some(0) {
            return Err(ConfigValidationError::InvalidValue {
                field: "scheduler.max_cycles".to_string(),
                message: "Cycle limit must be greater than 0 when set".to_string(),
            });
        }

        if self.client.page_timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "client.page_timeout_secs".to_string(),
                message: "Timeout must be greater than 0".to_string(),
            });
        }

        if self.client.user_agent.trim().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "client.user_agent".to_string(),
            ));
        }

        if !(1..=100).contains(&self.processing.jpeg_quality) {
            return Err(ConfigValidationError::InvalidValue {
                field: "processing.jpeg_quality".to_string(),
                message: "Quality must be between 1 and 100".to_string(),
            });
        }

        self.storage
            .validate()
            .map_err(|e| ConfigValidationError::InvalidValue {
                field: "storage".to_string(),
                message: e.to_string(),
            })?;

        Ok(())
    }
}

impl SchedulerConfig {
    /// Get the cycle period as Duration.
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    /// Get the startup offset as Duration.
    pub fn start_offset(&self) -> Duration {
        Duration::from_millis(self.start_offset_ms)
    }

    /// Get the locate retry delay as Duration.
    pub fn locate_retry(&self) -> Duration {
        Duration::from_millis(self.locate_retry_ms)
    }

    /// Get the fetch retry delay as Duration.
    pub fn fetch_retry(&self) -> Duration {
        Duration::from_millis(self.fetch_retry_ms)
    }
}

impl ClientConfig {
    /// Get the request timeout as Duration.
    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = IngestConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.period(), Duration::from_secs(15));
        assert_eq!(config.scheduler.expected_cohort, 6);
        assert_eq!(config.processing.jpeg_quality, 90);
        assert_eq!(config.client.page_timeout(), Duration::from_secs(20));
        assert_eq!(config.scheduler.locate_retry(), Duration::from_millis(1500));
        assert_eq!(config.scheduler.fetch_retry(), Duration::from_millis(1500));
    }

    #[test]
    fn test_zero_period() {
        let mut config = IngestConfig::default();
        config.scheduler.period_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_zero_max_cycles() {
        let mut config = IngestConfig::default();
        config.scheduler.max_cycles = Some(0);
        assert!(config.validate().is_err());

        config.scheduler.max_cycles = Some(1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_user_agent() {
        let mut config = IngestConfig::default();
        config.client.user_agent = "  ".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_invalid_jpeg_quality() {
        let mut config = IngestConfig::default();
        config.processing.jpeg_quality = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_storage_offset() {
        let mut config = IngestConfig::default();
        config.storage.utc_offset_minutes = Some(2000);
        assert!(config.validate().is_err());
    }
}
