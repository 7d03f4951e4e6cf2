//! Persisted frame records.
//!
//! A [`FrameRecord`] is one row of a day partition: the outcome of a single
//! capture attempt for one camera, successful or not. Rows are keyed by
//! `(cam_id, captured_at_ms)`.

use chrono::{DateTime, FixedOffset, NaiveDate, SecondsFormat};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How the image payload column is stored in a partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    /// Raw bytes in a `payload_bytes BLOB` column
    #[default]
    Bytes,
    /// Standard base64 text in a `payload_base64 TEXT` column
    Base64,
}

impl PayloadEncoding {
    /// Name of the payload column for this encoding.
    pub fn column(&self) -> &'static str {
        match self {
            PayloadEncoding::Bytes => "payload_bytes",
            PayloadEncoding::Base64 => "payload_base64",
        }
    }

    /// SQLite column type for this encoding.
    pub fn sql_type(&self) -> &'static str {
        match self {
            PayloadEncoding::Bytes => "BLOB",
            PayloadEncoding::Base64 => "TEXT",
        }
    }
}

impl fmt::Display for PayloadEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadEncoding::Bytes => f.write_str("bytes"),
            PayloadEncoding::Base64 => f.write_str("base64"),
        }
    }
}

impl FromStr for PayloadEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bytes" | "blob" => Ok(PayloadEncoding::Bytes),
            "base64" | "b64" => Ok(PayloadEncoding::Base64),
            other => Err(format!(
                "unknown payload encoding '{other}' (expected 'bytes' or 'base64')"
            )),
        }
    }
}

/// One persisted capture outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    /// Camera identifier
    pub cam_id: String,
    /// Capture time in the capturing process' local offset, millisecond precision
    pub captured_at: DateTime<FixedOffset>,
    /// Chunk file the camera was loaded from
    pub chunk_file: Option<String>,
    /// Filesystem-safe camera label
    pub code_slug: Option<String>,
    /// Page or endpoint the capture started from
    pub source_endpoint: Option<String>,
    /// Image URL actually fetched
    pub img_url: Option<String>,
    /// Declared content type of the fetched bytes
    pub content_type: Option<String>,
    /// File extension of the normalized payload, with leading dot
    pub extension: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// SHA-256 hex digest of the payload
    pub digest: Option<String>,
    pub was_animated_source: bool,
    pub ok: bool,
    /// Error tag for failed attempts
    pub error: Option<String>,
    /// Normalized image bytes; empty for failed attempts
    pub payload: Vec<u8>,
}

impl FrameRecord {
    /// Start a record for the given camera and capture time with every
    /// optional column unset and `ok = false`.
    pub fn new(cam_id: impl Into<String>, captured_at: DateTime<FixedOffset>) -> Self {
        Self {
            cam_id: cam_id.into(),
            captured_at,
            chunk_file: None,
            code_slug: None,
            source_endpoint: None,
            img_url: None,
            content_type: None,
            extension: None,
            width: None,
            height: None,
            digest: None,
            was_animated_source: false,
            ok: false,
            error: None,
            payload: Vec::new(),
        }
    }

    /// Epoch milliseconds; half of the uniqueness key.
    pub fn captured_at_ms(&self) -> i64 {
        self.captured_at.timestamp_millis()
    }

    /// RFC 3339 timestamp with milliseconds and the local offset.
    pub fn captured_at_iso(&self) -> String {
        self.captured_at
            .to_rfc3339_opts(SecondsFormat::Millis, false)
    }

    /// Calendar date of the capture in its local offset; selects the partition.
    pub fn partition_date(&self) -> NaiveDate {
        self.captured_at.date_naive()
    }
}
