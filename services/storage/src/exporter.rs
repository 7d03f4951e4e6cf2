//! Export stored frames back to image files.
//!
//! Reads one day partition and writes every successful capture to
//!
//! ```text
//! <out_root>/<cam_id>/<YYYYMMDD>/<cam_id>__<code_slug>__<YYYYMMDD>__<HHMMSS>__<digest8>.<ext>
//! ```
//!
//! Files that already exist are counted as skipped, so re-running an export
//! against the same destination only writes what is missing.

use crate::clock::LocalClock;
use crate::config::ExportConfig;
use crate::schema::{ResolvedSchema, SchemaError};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

const MAX_SLUG_CHARS: usize = 80;

/// Errors that abort an export.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("source store not found: {0}")]
    MissingSourceFile(PathBuf),

    #[error("unrecognized store schema: {0}")]
    UnrecognizedSchema(#[from] SchemaError),

    #[error("unparseable timestamp (ts_ms={ts_ms:?}, ts_iso={ts_iso:?})")]
    UnparseableTimestamp {
        ts_ms: Option<i64>,
        ts_iso: Option<String>,
    },

    #[error("invalid export configuration: {0}")]
    InvalidConfig(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Totals reported at the end of an export.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExportSummary {
    /// Exportable rows visited
    pub total_seen: u64,
    /// Files written by this run
    pub exported: u64,
    /// Rows not written: already exported, empty payload or bad timestamp
    pub skipped: u64,
    /// Written payloads that did not decode as an image
    pub raw_dumps: u64,
    /// Rows skipped because no timestamp could be parsed
    pub bad_timestamps: u64,
}

impl fmt::Display for ExportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total_seen={} exported={} skipped={}",
            self.total_seen, self.exported, self.skipped
        )?;
        if self.raw_dumps > 0 {
            write!(f, " raw_dumps={}", self.raw_dumps)?;
        }
        if self.bad_timestamps > 0 {
            write!(f, " bad_timestamps={}", self.bad_timestamps)?;
        }
        Ok(())
    }
}

/// One exportable row, already mapped to logical fields.
#[derive(Debug)]
struct ExportRow {
    cam_id: String,
    slug: Option<String>,
    ts_ms: Option<i64>,
    ts_iso: Option<String>,
    digest: Option<String>,
    extension: Option<String>,
    content_type: Option<String>,
    payload_bytes: Option<Vec<u8>>,
    payload_base64: Option<String>,
}

/// Lenient text read: accepts TEXT or INTEGER storage.
fn text_column(row: &SqliteRow, name: &str) -> Option<String> {
    match row.try_get::<Option<String>, _>(name) {
        Ok(value) => value,
        Err(_) => row
            .try_get::<Option<i64>, _>(name)
            .ok()
            .flatten()
            .map(|n| n.to_string()),
    }
}

impl ExportRow {
    fn from_row(row: &SqliteRow) -> Self {
        Self {
            cam_id: text_column(row, "cam_id").unwrap_or_else(|| "unknown".to_string()),
            slug: text_column(row, "slug"),
            ts_ms: row.try_get::<Option<i64>, _>("ts_ms").ok().flatten(),
            ts_iso: text_column(row, "ts_iso"),
            digest: text_column(row, "digest"),
            extension: text_column(row, "extension"),
            content_type: text_column(row, "content_type"),
            payload_bytes: row.try_get::<Option<Vec<u8>>, _>("payload_bytes").ok().flatten(),
            payload_base64: text_column(row, "payload_base64"),
        }
    }

    /// Raw payload, decoding the base64 column when no bytes are stored.
    fn payload(&self) -> Option<Vec<u8>> {
        if let Some(bytes) = self.payload_bytes.as_ref().filter(|b| !b.is_empty()) {
            return Some(bytes.clone());
        }
        let text = self.payload_base64.as_deref()?.trim();
        match STANDARD.decode(text) {
            Ok(bytes) if !bytes.is_empty() => Some(bytes),
            Ok(_) => None,
            Err(e) => {
                debug!(cam_id = %self.cam_id, error = %e, "Base64 payload failed to decode");
                None
            }
        }
    }
}

/// Normalize a stored extension to a lowercase, dotted form.
pub fn ensure_extension(ext: &str) -> String {
    let ext = ext.trim().to_ascii_lowercase();
    if ext.is_empty() {
        return ".jpg".to_string();
    }
    let ext = if ext.starts_with('.') { ext } else { format!(".{ext}") };
    if ext == ".jpeg" {
        ".jpg".to_string()
    } else {
        ext
    }
}

/// Extension implied by a content type, `.jpg` when unknown.
pub fn extension_from_content_type(content_type: Option<&str>) -> &'static str {
    let Some(ct) = content_type.map(str::to_ascii_lowercase) else {
        return ".jpg";
    };
    if ct.contains("png") {
        ".png"
    } else if ct.contains("webp") {
        ".webp"
    } else {
        ".jpg"
    }
}

/// Filesystem-safe label: trimmed, at most 80 characters, `nocode` if empty.
pub fn safe_slug(slug: Option<&str>) -> String {
    let cleaned: String = slug
        .unwrap_or_default()
        .trim()
        .chars()
        .take(MAX_SLUG_CHARS)
        .map(|c| if matches!(c, '/' | '\\') { '_' } else { c })
        .collect();
    if cleaned.is_empty() {
        "nocode".to_string()
    } else {
        cleaned
    }
}

/// Resolve a row timestamp in the capture's own local time.
///
/// The instant comes from epoch milliseconds when present, otherwise from the
/// ISO text. An RFC 3339 offset stored with the row wins over `clock`, so a
/// frame lands under the date it was captured on wherever the export runs.
pub fn parse_timestamp(
    clock: &LocalClock,
    ts_ms: Option<i64>,
    ts_iso: Option<&str>,
) -> Option<DateTime<FixedOffset>> {
    let iso = ts_iso.map(str::trim).filter(|s| !s.is_empty());
    let stamped = iso.and_then(|iso| DateTime::parse_from_rfc3339(iso).ok());

    if let Some(ms) = ts_ms {
        let at = match &stamped {
            Some(stamped) => Utc
                .timestamp_millis_opt(ms)
                .single()
                .map(|utc| utc.with_timezone(stamped.offset())),
            None => clock.from_millis(ms),
        };
        if at.is_some() {
            return at;
        }
    }
    if stamped.is_some() {
        return stamped;
    }

    let iso = iso?;

    // Offset-less text is taken as local wall-clock time.
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(iso, fmt).ok())
        .and_then(|naive| {
            let offset = *clock.now().offset();
            naive.and_local_timezone(offset).single()
        })
}

/// Destination path for a frame.
pub fn export_path(
    out_root: &Path,
    cam_id: &str,
    slug: &str,
    at: &DateTime<FixedOffset>,
    digest: Option<&str>,
    extension: &str,
) -> PathBuf {
    let date = at.format("%Y%m%d").to_string();
    let time = at.format("%H%M%S");
    let digest8: String = match digest.map(str::trim).filter(|d| !d.is_empty()) {
        Some(d) => d.chars().take(8).collect(),
        None => "nohash".to_string(),
    };

    out_root
        .join(cam_id)
        .join(&date)
        .join(format!("{cam_id}__{slug}__{date}__{time}__{digest8}{extension}"))
}

/// Export job over day partition files.
pub struct Exporter {
    config: ExportConfig,
    clock: LocalClock,
}

impl Exporter {
    pub fn new(config: ExportConfig) -> Result<Self, ExportError> {
        let clock = LocalClock::from_offset_minutes(config.utc_offset_minutes).ok_or_else(|| {
            ExportError::InvalidConfig(format!(
                "utc offset {:?} minutes is out of range",
                config.utc_offset_minutes
            ))
        })?;
        if config.batch_size == 0 {
            return Err(ExportError::InvalidConfig("batch size must be positive".into()));
        }

        Ok(Self { config, clock })
    }

    /// Export every successful frame of `source` below the configured root.
    #[instrument(skip(self), fields(out_root = %self.config.out_root.display()))]
    pub async fn export(&self, source: &Path) -> Result<ExportSummary, ExportError> {
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(ExportError::MissingSourceFile(source.to_path_buf()));
        }

        let options = SqliteConnectOptions::new()
            .filename(source)
            .read_only(true)
            .create_if_missing(false);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let result = self.export_from(&pool).await;
        pool.close().await;

        let summary = result?;
        info!(
            source = %source.display(),
            total_seen = summary.total_seen,
            exported = summary.exported,
            skipped = summary.skipped,
            "Export finished"
        );
        Ok(summary)
    }

    async fn export_from(&self, pool: &SqlitePool) -> Result<ExportSummary, ExportError> {
        let schema = ResolvedSchema::probe(pool).await?;
        debug!(?schema, "Resolved store schema");

        let sql = schema.select_batch_sql();
        let batch = i64::from(self.config.batch_size);
        let mut summary = ExportSummary::default();
        let mut created_dirs: HashSet<PathBuf> = HashSet::new();
        let mut offset: i64 = 0;

        loop {
            let rows = sqlx::query(&sql)
                .bind(batch)
                .bind(offset)
                .fetch_all(pool)
                .await?;
            if rows.is_empty() {
                break;
            }

            for row in &rows {
                summary.total_seen += 1;
                let row = ExportRow::from_row(row);
                self.export_row(row, &mut summary, &mut created_dirs).await?;
            }

            offset += rows.len() as i64;
        }

        Ok(summary)
    }

    async fn export_row(
        &self,
        row: ExportRow,
        summary: &mut ExportSummary,
        created_dirs: &mut HashSet<PathBuf>,
    ) -> Result<(), ExportError> {
        let Some(at) = parse_timestamp(&self.clock, row.ts_ms, row.ts_iso.as_deref()) else {
            if self.config.strict_timestamps {
                return Err(ExportError::UnparseableTimestamp {
                    ts_ms: row.ts_ms,
                    ts_iso: row.ts_iso,
                });
            }
            warn!(
                cam_id = %row.cam_id,
                ts_ms = ?row.ts_ms,
                ts_iso = ?row.ts_iso,
                "Skipping row with unparseable timestamp"
            );
            summary.bad_timestamps += 1;
            summary.skipped += 1;
            return Ok(());
        };

        let extension = match row.extension.as_deref() {
            Some(ext) if !ext.trim().is_empty() => ensure_extension(ext),
            _ => extension_from_content_type(row.content_type.as_deref()).to_string(),
        };
        let path = export_path(
            &self.config.out_root,
            &safe_slug(Some(&row.cam_id)),
            &safe_slug(row.slug.as_deref()),
            &at,
            row.digest.as_deref(),
            &extension,
        );

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            summary.skipped += 1;
            metrics::counter!("export.files.skipped").increment(1);
            return Ok(());
        }

        let Some(payload) = row.payload() else {
            summary.skipped += 1;
            return Ok(());
        };

        if let Some(dir) = path.parent() {
            if created_dirs.insert(dir.to_path_buf()) {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|source| ExportError::Write {
                        path: dir.to_path_buf(),
                        source,
                    })?;
            }
        }

        if image::load_from_memory(&payload).is_err() {
            warn!(path = %path.display(), "Payload is not a decodable image, writing raw bytes");
            summary.raw_dumps += 1;
        }
        write_atomically(&path, &payload).await?;

        summary.exported += 1;
        metrics::counter!("export.files.written").increment(1);
        debug!(path = %path.display(), "Frame exported");
        Ok(())
    }
}

/// Write to a sibling temp file and rename, so a crash never leaves a
/// partial file that a later run would treat as already exported.
async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), ExportError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".part");
    let tmp = PathBuf::from(tmp);

    let write_err = |source| ExportError::Write {
        path: path.to_path_buf(),
        source,
    };
    tokio::fs::write(&tmp, bytes).await.map_err(write_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(write_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ensure_extension() {
        assert_eq!(ensure_extension("JPEG"), ".jpg");
        assert_eq!(ensure_extension(".png"), ".png");
        assert_eq!(ensure_extension("  "), ".jpg");
        assert_eq!(ensure_extension("webp"), ".webp");
    }

    #[test]
    fn test_extension_from_content_type() {
        assert_eq!(extension_from_content_type(Some("image/png")), ".png");
        assert_eq!(extension_from_content_type(Some("image/webp")), ".webp");
        assert_eq!(extension_from_content_type(Some("text/html")), ".jpg");
        assert_eq!(extension_from_content_type(None), ".jpg");
    }

    #[test]
    fn test_safe_slug() {
        assert_eq!(safe_slug(None), "nocode");
        assert_eq!(safe_slug(Some("   ")), "nocode");
        assert_eq!(safe_slug(Some("a/b")), "a_b");
        assert_eq!(safe_slug(Some(&"x".repeat(120))).len(), 80);
    }

    #[test]
    fn test_parse_timestamp_prefers_millis() {
        let clock = LocalClock::from_offset_minutes(Some(420)).unwrap();
        let at = parse_timestamp(&clock, Some(1_704_067_200_000), Some("garbage")).unwrap();
        assert_eq!(at.format("%Y%m%d %H%M%S").to_string(), "20240101 070000");
    }

    #[test]
    fn test_parse_timestamp_keeps_stored_offset() {
        // Captured 2024-06-01T03:00:00+07:00, exported on a UTC host.
        let utc_host = LocalClock::from_offset_minutes(Some(0)).unwrap();
        let ms = 1_717_185_600_000;

        let at = parse_timestamp(&utc_host, Some(ms), Some("2024-06-01T03:00:00.000+07:00")).unwrap();
        assert_eq!(at.format("%Y%m%d %H%M%S").to_string(), "20240601 030000");
        assert_eq!(at.timestamp_millis(), ms);

        // Offset-less text gives no offset to keep.
        let at = parse_timestamp(&utc_host, Some(ms), Some("2024-06-01 03:00:00")).unwrap();
        assert_eq!(at.format("%Y%m%d %H%M%S").to_string(), "20240531 200000");
    }

    #[test]
    fn test_parse_timestamp_iso_fallback() {
        let clock = LocalClock::from_offset_minutes(Some(420)).unwrap();

        let at = parse_timestamp(&clock, None, Some("2024-06-01T08:09:10.123+07:00")).unwrap();
        assert_eq!(at.format("%H%M%S").to_string(), "080910");

        let naive = parse_timestamp(&clock, None, Some("2024-06-01 23:59:58")).unwrap();
        assert_eq!(naive.format("%Y%m%d%H%M%S").to_string(), "20240601235958");

        assert!(parse_timestamp(&clock, None, Some("not a time")).is_none());
        assert!(parse_timestamp(&clock, None, None).is_none());
    }

    #[test]
    fn test_export_path_layout() {
        let at = FixedOffset::east_opt(7 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 6, 1, 8, 9, 10)
            .unwrap();
        let path = export_path(
            Path::new("out"),
            "cam-1",
            "nga_tu",
            &at,
            Some("abcdef0123456789"),
            ".jpg",
        );
        assert_eq!(
            path,
            PathBuf::from("out/cam-1/20240601/cam-1__nga_tu__20240601__080910__abcdef01.jpg")
        );

        let no_digest = export_path(Path::new("out"), "cam-1", "x", &at, None, ".png");
        assert!(no_digest.to_string_lossy().ends_with("__nohash.png"));
    }
}
