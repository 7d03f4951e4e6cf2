//! Partition table layout and schema resolution for older store generations.
//!
//! Writers always create the current `frames` layout. Readers (the exporter)
//! resolve whatever shape a partition file actually has into a
//! [`ResolvedSchema`] once, and build their queries from that.

use crate::record::PayloadEncoding;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::BTreeSet;
use thiserror::Error;

/// Table written by the current storage engine.
pub const FRAMES_TABLE: &str = "frames";

/// Tables a reader accepts, in preference order.
pub const KNOWN_TABLES: [&str; 2] = ["frames", "captures"];

/// Statements that create the current layout if it is absent.
pub fn create_statements(encoding: PayloadEncoding) -> Vec<String> {
    vec![
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {FRAMES_TABLE} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cam_id TEXT NOT NULL,
                captured_at_ms INTEGER NOT NULL,
                captured_at_iso TEXT NOT NULL,
                chunk_file TEXT,
                code_slug TEXT,
                source_endpoint TEXT,
                img_url TEXT,
                content_type TEXT,
                extension TEXT,
                width INTEGER,
                height INTEGER,
                digest TEXT,
                was_animated_source INTEGER,
                ok INTEGER,
                error TEXT,
                {payload} {payload_type},
                UNIQUE (cam_id, captured_at_ms)
            )
            "#,
            payload = encoding.column(),
            payload_type = encoding.sql_type(),
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{FRAMES_TABLE}_captured_at_ms \
             ON {FRAMES_TABLE} (captured_at_ms)"
        ),
    ]
}

/// Column names present on `table`.
pub async fn table_columns(pool: &SqlitePool, table: &str) -> Result<BTreeSet<String>, sqlx::Error> {
    // Table names only ever come from KNOWN_TABLES, never from input.
    let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
        .fetch_all(pool)
        .await?;

    rows.iter()
        .map(|row| row.try_get::<String, _>("name"))
        .collect()
}

/// Errors raised while resolving a store's layout.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("no frame table found (tables present: {0:?})")]
    NoKnownTable(Vec<String>),

    #[error("table '{table}' lacks required {what} column (columns present: {columns:?})")]
    MissingColumn {
        table: String,
        what: &'static str,
        columns: Vec<String>,
    },

    #[error("database error while probing schema: {0}")]
    Database(#[from] sqlx::Error),
}

/// Mapping from logical fields to the physical columns of one store.
///
/// Built once per source file; every optional field is `None` when that
/// generation of the store did not record it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSchema {
    pub table: &'static str,
    pub cam_id: &'static str,
    pub slug: &'static str,
    pub ts_ms: Option<&'static str>,
    pub ts_iso: Option<&'static str>,
    pub digest: Option<&'static str>,
    pub ok: Option<&'static str>,
    pub extension: Option<&'static str>,
    pub content_type: Option<&'static str>,
    pub width: Option<&'static str>,
    pub height: Option<&'static str>,
    pub payload_bytes: Option<&'static str>,
    pub payload_base64: Option<&'static str>,
}

fn pick(columns: &BTreeSet<String>, aliases: &[&'static str]) -> Option<&'static str> {
    aliases.iter().copied().find(|alias| columns.contains(*alias))
}

impl ResolvedSchema {
    /// Resolve a layout from the table name and its column set.
    pub fn resolve(table: &'static str, columns: &BTreeSet<String>) -> Result<Self, SchemaError> {
        let missing = |what: &'static str| SchemaError::MissingColumn {
            table: table.to_string(),
            what,
            columns: columns.iter().cloned().collect(),
        };

        let cam_id = pick(columns, &["cam_id"]).ok_or_else(|| missing("camera id"))?;
        let slug = pick(columns, &["code_slug", "code", "title"]).ok_or_else(|| missing("label"))?;

        let ts_ms = pick(columns, &["captured_at_ms", "ts_vn_ms"]);
        let ts_iso = pick(columns, &["captured_at_iso", "ts_vn_iso", "ts_vn"]);
        if ts_ms.is_none() && ts_iso.is_none() {
            return Err(missing("timestamp"));
        }

        let payload_bytes = pick(columns, &["payload_bytes", "img_bytes"]);
        let payload_base64 = pick(columns, &["payload_base64", "img_b64"]);
        if payload_bytes.is_none() && payload_base64.is_none() {
            return Err(missing("payload"));
        }

        Ok(Self {
            table,
            cam_id,
            slug,
            ts_ms,
            ts_iso,
            digest: pick(columns, &["digest", "sha256"]),
            ok: pick(columns, &["ok"]),
            extension: pick(columns, &["extension", "ext"]),
            content_type: pick(columns, &["content_type"]),
            width: pick(columns, &["width", "w"]),
            height: pick(columns, &["height", "h"]),
            payload_bytes,
            payload_base64,
        })
    }

    /// Probe an open store and resolve its layout.
    pub async fn probe(pool: &SqlitePool) -> Result<Self, SchemaError> {
        let tables: BTreeSet<String> =
            sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table'")
                .fetch_all(pool)
                .await?
                .iter()
                .map(|row| row.try_get::<String, _>("name"))
                .collect::<Result<_, _>>()?;

        let table = KNOWN_TABLES
            .iter()
            .copied()
            .find(|t| tables.contains(*t))
            .ok_or_else(|| SchemaError::NoKnownTable(tables.iter().cloned().collect()))?;

        let columns = table_columns(pool, table).await?;
        Self::resolve(table, &columns)
    }

    /// Paged SELECT over exportable rows, ordered by timestamp ascending.
    ///
    /// Output columns are always aliased to the same names regardless of the
    /// source generation. Binds: `LIMIT ?1 OFFSET ?2`.
    pub fn select_batch_sql(&self) -> String {
        fn col(source: Option<&str>, alias: &str) -> String {
            match source {
                Some(name) => format!("{name} AS {alias}"),
                None => format!("NULL AS {alias}"),
            }
        }

        let select = [
            format!("{} AS cam_id", self.cam_id),
            format!("{} AS slug", self.slug),
            col(self.ts_ms, "ts_ms"),
            col(self.ts_iso, "ts_iso"),
            col(self.digest, "digest"),
            col(self.extension, "extension"),
            col(self.content_type, "content_type"),
            col(self.width, "width"),
            col(self.height, "height"),
            col(self.payload_bytes, "payload_bytes"),
            col(self.payload_base64, "payload_base64"),
        ]
        .join(", ");

        let mut conditions = Vec::new();
        if let Some(ok) = self.ok {
            conditions.push(format!("{ok} = 1"));
        }
        let payload_present = match (self.payload_bytes, self.payload_base64) {
            (Some(bytes), Some(b64)) => format!(
                "(({bytes} IS NOT NULL AND length({bytes}) > 0) OR ({b64} IS NOT NULL AND {b64} <> ''))"
            ),
            (Some(bytes), None) => format!("({bytes} IS NOT NULL AND length({bytes}) > 0)"),
            (None, Some(b64)) => format!("({b64} IS NOT NULL AND {b64} <> '')"),
            (None, None) => "0".to_string(),
        };
        conditions.push(payload_present);

        let order = self.ts_ms.or(self.ts_iso).unwrap_or(self.cam_id);

        format!(
            "SELECT {select} FROM {table} WHERE {conditions} ORDER BY {order} ASC LIMIT ?1 OFFSET ?2",
            table = self.table,
            conditions = conditions.join(" AND "),
        )
    }
}
