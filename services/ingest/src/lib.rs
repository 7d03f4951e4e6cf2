//! Trafficcam Ingest
//!
//! Periodic snapshot capture for a small cohort of public traffic cameras.
//!
//! # Architecture
//!
//! ```text
//! CaptureScheduler ─(per camera, concurrently)─▶ CaptureClient ─▶ FrameNormalizer ─▶ DayPartition
//! ```
//!
//! One process handles one chunk file (nominally six cameras). Every period
//! it captures each camera once, stores the outcome (successful or not) in
//! that camera's partition for the day, and logs an `ok n/total` summary.

pub mod camera;
pub mod capture_client;
pub mod config;
pub mod digest;
pub mod frame_processor;
pub mod scheduler;

pub use camera::{load_chunk, slugify, CameraDescriptor, Chunk, ChunkError};
pub use capture_client::{CaptureClient, CaptureError, FetchedImage, HttpCaptureClient, PageSession};
pub use config::{ConfigValidationError, IngestConfig};
pub use frame_processor::{FrameNormalizer, NormalizeError, NormalizedFrame};
pub use scheduler::{
    CameraOutcome, CaptureAttempt, CaptureErrorKind, CaptureScheduler, CycleSummary,
    SchedulerError, SchedulerStats,
};
