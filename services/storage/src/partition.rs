//! Per-camera day partitions.
//!
//! Every camera writes into one SQLite file per local calendar date:
//!
//! ```text
//! <storage_root>/<cam_id>/<YYYY-MM-DD>.sqlite
//! ```
//!
//! A [`DayPartition`] owns the handle for one camera. It opens the file for a
//! date lazily on the first write, keeps it open for the rest of that day and
//! rotates when a record for another date arrives: the old file is
//! checkpointed and closed before the new one is opened.

use crate::config::StorageConfig;
use crate::record::{FrameRecord, PayloadEncoding};
use crate::schema::{create_statements, table_columns, FRAMES_TABLE};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::NaiveDate;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// File extension of partition stores.
pub const PARTITION_EXTENSION: &str = "sqlite";

/// Errors raised by the storage engine.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to prepare partition directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open partition {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },

    #[error("failed to write record: {0}")]
    Write(#[source] sqlx::Error),

    #[error("failed to read partition: {0}")]
    Read(#[source] sqlx::Error),

    #[error("record for camera '{record}' sent to partition of camera '{partition}'")]
    CameraMismatch { partition: String, record: String },

    #[error("partition is not open")]
    NotOpen,
}

/// Lifecycle state of one camera's partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Closed,
    Open { date: NaiveDate },
}

/// Side effect requested by a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionAction {
    Close(NaiveDate),
    Open(NaiveDate),
}

/// Transition for a write targeting `target`.
///
/// Returns the state after the write and the actions needed to reach it, in
/// the order they must run. A close always precedes the open of the next day.
pub fn transition(state: PartitionState, target: NaiveDate) -> (PartitionState, Vec<PartitionAction>) {
    match state {
        PartitionState::Open { date } if date == target => (state, Vec::new()),
        PartitionState::Open { date } => (
            PartitionState::Open { date: target },
            vec![PartitionAction::Close(date), PartitionAction::Open(target)],
        ),
        PartitionState::Closed => (
            PartitionState::Open { date: target },
            vec![PartitionAction::Open(target)],
        ),
    }
}

/// Path of the partition file for a camera and date.
pub fn partition_path(root: &Path, cam_id: &str, date: NaiveDate) -> PathBuf {
    root.join(cam_id)
        .join(format!("{}.{PARTITION_EXTENSION}", date.format("%Y-%m-%d")))
}

/// The write path of a single camera.
pub struct DayPartition {
    cam_id: String,
    root: PathBuf,
    encoding: PayloadEncoding,
    state: PartitionState,
    pool: Option<SqlitePool>,
}

impl DayPartition {
    /// Create a closed partition for `cam_id`; nothing touches disk yet.
    pub fn new(config: &StorageConfig, cam_id: impl Into<String>) -> Self {
        Self {
            cam_id: cam_id.into(),
            root: config.root.clone(),
            encoding: config.payload_encoding,
            state: PartitionState::Closed,
            pool: None,
        }
    }

    pub fn cam_id(&self) -> &str {
        &self.cam_id
    }

    pub fn state(&self) -> PartitionState {
        self.state
    }

    /// Path of the currently open file, if any.
    pub fn current_path(&self) -> Option<PathBuf> {
        match self.state {
            PartitionState::Open { date } => Some(partition_path(&self.root, &self.cam_id, date)),
            PartitionState::Closed => None,
        }
    }

    /// Insert a record, or overwrite every non-key column of the existing row
    /// with the same `(cam_id, captured_at_ms)`.
    ///
    /// Opens or rotates the underlying file as needed.
    #[instrument(skip(self, record), fields(cam_id = %self.cam_id, captured_at_ms = record.captured_at_ms()))]
    pub async fn upsert(&mut self, record: &FrameRecord) -> Result<(), StorageError> {
        if record.cam_id != self.cam_id {
            return Err(StorageError::CameraMismatch {
                partition: self.cam_id.clone(),
                record: record.cam_id.clone(),
            });
        }

        self.ensure_open(record.partition_date()).await?;
        let pool = self.pool.as_ref().ok_or(StorageError::NotOpen)?;

        let payload_column = self.encoding.column();
        let sql = format!(
            r#"
            INSERT INTO {FRAMES_TABLE} (
                cam_id, captured_at_ms, captured_at_iso, chunk_file, code_slug,
                source_endpoint, img_url, content_type, extension, width,
                height, digest, was_animated_source, ok, error,
                {payload_column}
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5,
                ?6, ?7, ?8, ?9, ?10,
                ?11, ?12, ?13, ?14, ?15,
                ?16
            )
            ON CONFLICT (cam_id, captured_at_ms) DO UPDATE SET
                captured_at_iso = excluded.captured_at_iso,
                chunk_file = excluded.chunk_file,
                code_slug = excluded.code_slug,
                source_endpoint = excluded.source_endpoint,
                img_url = excluded.img_url,
                content_type = excluded.content_type,
                extension = excluded.extension,
                width = excluded.width,
                height = excluded.height,
                digest = excluded.digest,
                was_animated_source = excluded.was_animated_source,
                ok = excluded.ok,
                error = excluded.error,
                {payload_column} = excluded.{payload_column}
            "#
        );

        let query = sqlx::query(&sql)
            .bind(&record.cam_id)
            .bind(record.captured_at_ms())
            .bind(record.captured_at_iso())
            .bind(&record.chunk_file)
            .bind(&record.code_slug)
            .bind(&record.source_endpoint)
            .bind(&record.img_url)
            .bind(&record.content_type)
            .bind(&record.extension)
            .bind(record.width.map(i64::from))
            .bind(record.height.map(i64::from))
            .bind(&record.digest)
            .bind(record.was_animated_source)
            .bind(record.ok)
            .bind(&record.error);

        let payload = (!record.payload.is_empty()).then_some(record.payload.as_slice());
        let query = match self.encoding {
            PayloadEncoding::Bytes => query.bind(payload),
            PayloadEncoding::Base64 => query.bind(payload.map(|bytes| STANDARD.encode(bytes))),
        };

        query.execute(pool).await.map_err(StorageError::Write)?;

        metrics::counter!("storage.frames.upserted").increment(1);
        debug!(ok = record.ok, "Frame record upserted");

        Ok(())
    }

    /// Number of rows in the open partition.
    pub async fn row_count(&self) -> Result<i64, StorageError> {
        let pool = self.pool.as_ref().ok_or(StorageError::NotOpen)?;
        let count: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {FRAMES_TABLE}"))
            .fetch_one(pool)
            .await
            .map_err(StorageError::Read)?;
        Ok(count.0)
    }

    /// Read back the row stored for `captured_at_ms` in the open partition.
    pub async fn fetch(&self, captured_at_ms: i64) -> Result<Option<StoredFrame>, StorageError> {
        let pool = self.pool.as_ref().ok_or(StorageError::NotOpen)?;
        let sql = format!(
            "SELECT captured_at_iso, ok, error, digest, extension, {payload} AS payload \
             FROM {FRAMES_TABLE} WHERE cam_id = ?1 AND captured_at_ms = ?2",
            payload = self.encoding.column(),
        );

        let row = sqlx::query(&sql)
            .bind(&self.cam_id)
            .bind(captured_at_ms)
            .fetch_optional(pool)
            .await
            .map_err(StorageError::Read)?;

        row.map(|row| StoredFrame::from_row(&row, self.encoding))
            .transpose()
    }

    /// Flush and release the handle. Safe to call repeatedly; the next write
    /// reopens automatically.
    pub async fn close(&mut self) {
        if let PartitionState::Open { date } = self.state {
            self.close_date(date).await;
        }
        self.state = PartitionState::Closed;
    }

    async fn ensure_open(&mut self, date: NaiveDate) -> Result<(), StorageError> {
        let (target, actions) = transition(self.state, date);

        for action in actions {
            match action {
                PartitionAction::Close(old) => {
                    self.close_date(old).await;
                    self.state = PartitionState::Closed;
                }
                PartitionAction::Open(new) => {
                    self.open_date(new).await?;
                    self.state = PartitionState::Open { date: new };
                }
            }
        }

        debug_assert_eq!(self.state, target);
        Ok(())
    }

    async fn open_date(&mut self, date: NaiveDate) -> Result<(), StorageError> {
        let path = partition_path(&self.root, &self.cam_id, date);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| StorageError::Directory {
                    path: dir.to_path_buf(),
                    source,
                })?;
        }

        let open_err = |source: sqlx::Error| StorageError::Open {
            path: path.clone(),
            source,
        };

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("temp_store", "MEMORY")
            .busy_timeout(Duration::from_secs(5));

        // Single writer per camera; one connection keeps writes ordered.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .connect_with(options)
            .await
            .map_err(open_err)?;

        for statement in create_statements(self.encoding) {
            sqlx::query(&statement)
                .execute(&pool)
                .await
                .map_err(open_err)?;
        }

        // A file created under the other payload encoding lacks our column.
        let columns = table_columns(&pool, FRAMES_TABLE).await.map_err(open_err)?;
        if !columns.contains(self.encoding.column()) {
            warn!(
                cam_id = %self.cam_id,
                path = %path.display(),
                column = self.encoding.column(),
                "Partition created with a different payload encoding, adding column"
            );
            sqlx::query(&format!(
                "ALTER TABLE {FRAMES_TABLE} ADD COLUMN {} {}",
                self.encoding.column(),
                self.encoding.sql_type()
            ))
            .execute(&pool)
            .await
            .map_err(open_err)?;
        }

        metrics::counter!("storage.partitions.opened").increment(1);
        info!(cam_id = %self.cam_id, path = %path.display(), "Day partition opened");

        self.pool = Some(pool);
        Ok(())
    }

    async fn close_date(&mut self, date: NaiveDate) {
        let Some(pool) = self.pool.take() else {
            return;
        };

        if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&pool)
            .await
        {
            warn!(cam_id = %self.cam_id, %date, error = %e, "WAL checkpoint failed on close");
        }
        pool.close().await;

        info!(cam_id = %self.cam_id, %date, "Day partition closed");
    }
}

/// Subset of a stored row read back for audit.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFrame {
    pub captured_at_iso: String,
    pub ok: bool,
    pub error: Option<String>,
    pub digest: Option<String>,
    pub extension: Option<String>,
    pub payload: Vec<u8>,
}

impl StoredFrame {
    fn from_row(row: &SqliteRow, encoding: PayloadEncoding) -> Result<Self, StorageError> {
        let payload = match encoding {
            PayloadEncoding::Bytes => row
                .try_get::<Option<Vec<u8>>, _>("payload")
                .map_err(StorageError::Read)?
                .unwrap_or_default(),
            PayloadEncoding::Base64 => row
                .try_get::<Option<String>, _>("payload")
                .map_err(StorageError::Read)?
                .and_then(|text| STANDARD.decode(text).ok())
                .unwrap_or_default(),
        };

        Ok(Self {
            captured_at_iso: row.try_get("captured_at_iso").map_err(StorageError::Read)?,
            ok: row
                .try_get::<Option<bool>, _>("ok")
                .map_err(StorageError::Read)?
                .unwrap_or(false),
            error: row.try_get("error").map_err(StorageError::Read)?,
            digest: row.try_get("digest").map_err(StorageError::Read)?,
            extension: row.try_get("extension").map_err(StorageError::Read)?,
            payload,
        })
    }
}
