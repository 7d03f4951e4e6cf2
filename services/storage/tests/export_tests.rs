use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{FixedOffset, TimeZone};
use image::{DynamicImage, ImageFormat, RgbImage};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use trafficcam_storage::{
    DayPartition, ExportConfig, ExportError, Exporter, FrameRecord, PayloadEncoding, SchemaError,
    StorageConfig,
};

fn png_bytes() -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 3, image::Rgb([10, 20, 30])));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

fn export_config(out_root: &Path) -> ExportConfig {
    ExportConfig {
        out_root: out_root.to_path_buf(),
        batch_size: 2,
        utc_offset_minutes: Some(420),
        ..Default::default()
    }
}

fn files_under(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                found.push(path);
            }
        }
    }
    found.sort();
    found
}

/// Write five frames for one day (one of them failed) and return the file.
async fn seed_partition(root: &Path) -> PathBuf {
    let config = StorageConfig {
        root: root.to_path_buf(),
        payload_encoding: PayloadEncoding::Bytes,
        utc_offset_minutes: Some(420),
    };
    let offset = FixedOffset::east_opt(7 * 3600).unwrap();
    let png = png_bytes();
    let mut partition = DayPartition::new(&config, "cam-1");

    for i in 0..5u32 {
        let at = offset.with_ymd_and_hms(2024, 6, 1, 8, 0, i * 15).unwrap();
        let mut record = FrameRecord::new("cam-1", at);
        record.code_slug = Some("nga_tu".to_string());
        if i == 2 {
            record.error = Some("fetch_failed".to_string());
        } else {
            record.ok = true;
            record.extension = Some(".png".to_string());
            record.content_type = Some("image/png".to_string());
            record.digest = Some(format!("{i:02}cdef0123456789"));
            record.payload = png.clone();
        }
        partition.upsert(&record).await.unwrap();
    }

    let path = partition.current_path().unwrap();
    partition.close().await;
    path
}

#[tokio::test]
async fn test_export_writes_successful_frames() {
    let store = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let source = seed_partition(store.path()).await;

    let exporter = Exporter::new(export_config(out.path())).unwrap();
    let summary = exporter.export(&source).await.unwrap();

    assert_eq!(summary.total_seen, 4);
    assert_eq!(summary.exported, 4);
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.raw_dumps, 0);

    let files = files_under(out.path());
    assert_eq!(files.len(), 4);
    assert_eq!(
        files[0],
        out.path()
            .join("cam-1/20240601/cam-1__nga_tu__20240601__080000__00cdef01.png")
    );
    assert_eq!(std::fs::read(&files[0]).unwrap(), png_bytes());
    assert!(files.iter().all(|p| !p.to_string_lossy().ends_with(".part")));
}

#[tokio::test]
async fn test_second_run_skips_existing_files() {
    let store = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let source = seed_partition(store.path()).await;

    let exporter = Exporter::new(export_config(out.path())).unwrap();
    exporter.export(&source).await.unwrap();
    let again = exporter.export(&source).await.unwrap();

    assert_eq!(again.total_seen, 4);
    assert_eq!(again.exported, 0);
    assert_eq!(again.skipped, 4);
    assert_eq!(files_under(out.path()).len(), 4);
}

#[tokio::test]
async fn test_legacy_captures_store() {
    let store = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let source = store.path().join("legacy.sqlite");

    let pool = SqlitePool::connect_with(
        SqliteConnectOptions::new()
            .filename(&source)
            .create_if_missing(true),
    )
    .await
    .unwrap();
    sqlx::query(
        "CREATE TABLE captures (cam_id TEXT, code TEXT, ts_vn TEXT, sha256 TEXT, ext TEXT, img_b64 TEXT)",
    )
    .execute(&pool)
    .await
    .unwrap();
    let rows = [
        ("2024-06-01T08:09:10+07:00", Some(STANDARD.encode(png_bytes())), "jpeg"),
        ("2024-06-01T08:09:25+07:00", None, "jpeg"),
        ("2024-06-01T08:09:40+07:00", Some(STANDARD.encode(b"not an image")), ""),
    ];
    for (ts, b64, ext) in rows {
        sqlx::query("INSERT INTO captures VALUES ('cam-7', 'Cau Sai Gon', ?1, NULL, ?2, ?3)")
            .bind(ts)
            .bind(ext)
            .bind(b64)
            .execute(&pool)
            .await
            .unwrap();
    }
    pool.close().await;

    let exporter = Exporter::new(export_config(out.path())).unwrap();
    let summary = exporter.export(&source).await.unwrap();

    // The row without a payload is filtered out by the query.
    assert_eq!(summary.total_seen, 2);
    assert_eq!(summary.exported, 2);
    assert_eq!(summary.raw_dumps, 1);

    let day = out.path().join("cam-7/20240601");
    assert!(day
        .join("cam-7__Cau Sai Gon__20240601__080910__nohash.jpg")
        .exists());
    assert!(day
        .join("cam-7__Cau Sai Gon__20240601__080940__nohash.jpg")
        .exists());
}

#[tokio::test]
async fn test_bad_timestamp_handling() {
    let store = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let source = store.path().join("bad_ts.sqlite");

    let pool = SqlitePool::connect_with(
        SqliteConnectOptions::new()
            .filename(&source)
            .create_if_missing(true),
    )
    .await
    .unwrap();
    sqlx::query("CREATE TABLE captures (cam_id TEXT, title TEXT, ts_vn_iso TEXT, img_bytes BLOB)")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO captures VALUES ('cam-8', 'x', 'yesterday-ish', ?1)")
        .bind(png_bytes())
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    let lenient = Exporter::new(export_config(out.path())).unwrap();
    let summary = lenient.export(&source).await.unwrap();
    assert_eq!(summary.bad_timestamps, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.exported, 0);

    let strict = Exporter::new(ExportConfig {
        strict_timestamps: true,
        ..export_config(out.path())
    })
    .unwrap();
    assert!(matches!(
        strict.export(&source).await,
        Err(ExportError::UnparseableTimestamp { .. })
    ));
}

#[tokio::test]
async fn test_unrecognized_schema() {
    let store = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let source = store.path().join("other.sqlite");

    let pool = SqlitePool::connect_with(
        SqliteConnectOptions::new()
            .filename(&source)
            .create_if_missing(true),
    )
    .await
    .unwrap();
    sqlx::query("CREATE TABLE readings (id INTEGER, value REAL)")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    let exporter = Exporter::new(export_config(out.path())).unwrap();
    let err = exporter.export(&source).await.unwrap_err();
    assert!(matches!(
        err,
        ExportError::UnrecognizedSchema(SchemaError::NoKnownTable(_))
    ));
    assert!(files_under(out.path()).is_empty());
}

#[tokio::test]
async fn test_missing_source_file() {
    let out = tempfile::tempdir().unwrap();
    let exporter = Exporter::new(export_config(out.path())).unwrap();

    let err = exporter
        .export(Path::new("/nonexistent/cam-1/2024-06-01.sqlite"))
        .await
        .unwrap_err();
    assert!(matches!(err, ExportError::MissingSourceFile(_)));
}

#[tokio::test]
async fn test_export_dates_follow_capture_offset() {
    let store = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();

    let config = StorageConfig {
        root: store.path().to_path_buf(),
        payload_encoding: PayloadEncoding::Bytes,
        utc_offset_minutes: Some(420),
    };
    let at = FixedOffset::east_opt(7 * 3600)
        .unwrap()
        .with_ymd_and_hms(2024, 6, 1, 3, 0, 0)
        .unwrap();
    let mut record = FrameRecord::new("cam-1", at);
    record.ok = true;
    record.code_slug = Some("x".to_string());
    record.extension = Some(".png".to_string());
    record.digest = Some("abcdef0123456789".to_string());
    record.payload = png_bytes();

    let mut partition = DayPartition::new(&config, "cam-1");
    partition.upsert(&record).await.unwrap();
    let source = partition.current_path().unwrap();
    partition.close().await;
    assert!(source.ends_with("cam-1/2024-06-01.sqlite"));

    // Export host runs on UTC, where the capture instant is still 2024-05-31.
    let exporter = Exporter::new(ExportConfig {
        utc_offset_minutes: Some(0),
        ..export_config(out.path())
    })
    .unwrap();
    let summary = exporter.export(&source).await.unwrap();

    assert_eq!(summary.exported, 1);
    assert_eq!(
        files_under(out.path()),
        vec![out
            .path()
            .join("cam-1/20240601/cam-1__x__20240601__030000__abcdef01.png")]
    );
}

#[tokio::test]
async fn test_undecodable_base64_payload_is_skipped() {
    let store = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let source = store.path().join("bad_b64.sqlite");

    let pool = SqlitePool::connect_with(
        SqliteConnectOptions::new()
            .filename(&source)
            .create_if_missing(true),
    )
    .await
    .unwrap();
    sqlx::query("CREATE TABLE captures (cam_id TEXT, code TEXT, ts_vn TEXT, img_b64 TEXT)")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO captures VALUES ('cam-9', 'x', '2024-06-01T08:00:00+07:00', ?1)")
        .bind("%%% not base64 %%%")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    let exporter = Exporter::new(export_config(out.path())).unwrap();
    let summary = exporter.export(&source).await.unwrap();

    assert_eq!(summary.total_seen, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.exported, 0);
    assert_eq!(summary.raw_dumps, 0);
    assert!(files_under(out.path()).is_empty());
}
