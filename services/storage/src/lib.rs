//! Trafficcam Storage
//!
//! Durable storage for periodic traffic camera captures, plus the batch job
//! that turns a stored day back into plain image files.
//!
//! ## Features
//!
//! - **Day Partitions**: one SQLite file per camera per local calendar date,
//!   opened lazily and rotated when the date changes
//! - **Idempotent Writes**: `(cam_id, captured_at_ms)` is unique, a repeated
//!   write overwrites the earlier row
//! - **Schema Tolerant Export**: reads the current `frames` layout as well as
//!   older `captures` stores with their legacy column names
//!
//! ## Layout
//!
//! ```text
//! Capture process             Storage root                      Export root
//! ┌──────────────┐           ┌───────────────────────┐         ┌──────────────────────┐
//! │ FrameRecord  │──upsert──▶│ <cam_id>/             │         │ <cam_id>/<YYYYMMDD>/ │
//! └──────────────┘           │   <YYYY-MM-DD>.sqlite │──export▶│   <name>.<ext>       │
//!                            └───────────────────────┘         └──────────────────────┘
//! ```

pub mod clock;
pub mod config;
pub mod exporter;
pub mod partition;
pub mod record;
pub mod schema;

pub use clock::LocalClock;
pub use config::{ConfigValidationError, ExportConfig, LoggingConfig, StorageConfig};
pub use exporter::{ExportError, ExportSummary, Exporter};
pub use partition::{partition_path, DayPartition, PartitionState, StorageError, StoredFrame};
pub use record::{FrameRecord, PayloadEncoding};
pub use schema::{ResolvedSchema, SchemaError};
