//! Fixed-period capture scheduler.
//!
//! Every cycle spawns one task per camera, waits for all of them, then sleeps
//! out the rest of the period. Each task owns its camera's capture session
//! and day partition for the duration of the attempt and hands both back when
//! it finishes, so nothing is shared between cameras.
//!
//! ```text
//!            ┌──────────── cycle (period P) ─────────────┐
//! camera A ─▶ locate ─▶ fetch ─▶ normalize ─▶ upsert ─┐
//! camera B ─▶ locate ─▶ fetch ─▶ normalize ─▶ upsert ─┼─▶ join ─▶ summary ─▶ sleep(P - elapsed)
//! camera C ─▶ locate ─▶ fetch ─▶ normalize ─▶ upsert ─┘
//! ```

use crate::camera::{CameraDescriptor, Chunk};
use crate::capture_client::{CaptureClient, CaptureError, FetchedImage};
use crate::config::{IngestConfig, SchedulerConfig};
use crate::digest::short_digest;
use crate::frame_processor::FrameNormalizer;
use backoff::{backoff::Backoff, ExponentialBackoff};
use bytes::Bytes;
use chrono::{DateTime, FixedOffset};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use trafficcam_storage::{DayPartition, FrameRecord, LocalClock, StorageConfig};

/// Tries per step: the first attempt plus one retry.
const MAX_TRIES: u32 = 2;

/// Longest uninterrupted sleep between cancellation checks.
const CANCEL_POLL: Duration = Duration::from_millis(250);

/// Errors raised while building the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("cohort is empty")]
    EmptyCohort,

    #[error("utc offset of {0} minutes is out of range")]
    InvalidOffset(i32),
}

/// Why a capture attempt produced no usable frame. Never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CaptureErrorKind {
    NoImageFound,
    FetchFailed,
    DecodeFailure,
    StorageWriteFailure,
    MissingSourceEndpoint,
    SessionUnavailable,
    /// The camera's task panicked; its session and partition were rebuilt.
    TaskAborted,
}

impl CaptureErrorKind {
    /// Stable tag stored in the `error` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureErrorKind::NoImageFound => "no_image_found",
            CaptureErrorKind::FetchFailed => "fetch_failed",
            CaptureErrorKind::DecodeFailure => "decode_failure",
            CaptureErrorKind::StorageWriteFailure => "storage_write_failure",
            CaptureErrorKind::MissingSourceEndpoint => "missing_source_endpoint",
            CaptureErrorKind::SessionUnavailable => "session_unavailable",
            CaptureErrorKind::TaskAborted => "task_aborted",
        }
    }
}

impl fmt::Display for CaptureErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw result of one camera's capture in one cycle.
#[derive(Debug, Clone)]
pub struct CaptureAttempt {
    pub cam_id: String,
    pub code_slug: String,
    pub source_endpoint: Option<String>,
    pub captured_at: DateTime<FixedOffset>,
    pub img_url: Option<String>,
    pub content_type: Option<String>,
    pub raw_bytes: Option<Bytes>,
    pub error: Option<CaptureErrorKind>,
}

impl CaptureAttempt {
    fn start(camera: &CameraDescriptor, code_slug: &str, captured_at: DateTime<FixedOffset>) -> Self {
        Self {
            cam_id: camera.cam_id.clone(),
            code_slug: code_slug.to_string(),
            source_endpoint: camera.endpoint().map(str::to_string),
            captured_at,
            img_url: None,
            content_type: None,
            raw_bytes: None,
            error: None,
        }
    }

    fn failed(mut self, kind: CaptureErrorKind) -> Self {
        self.error = Some(kind);
        self
    }

    fn fetched(mut self, image: FetchedImage) -> Self {
        self.img_url = Some(image.url);
        self.content_type = image.content_type;
        self.raw_bytes = Some(image.bytes);
        self
    }
}

/// What happened to one camera in one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraOutcome {
    pub cam_id: String,
    pub ok: bool,
    pub error: Option<CaptureErrorKind>,
    pub digest: Option<String>,
}

impl CameraOutcome {
    /// Label used for the `capture.attempts` counter.
    pub fn tag(&self) -> &'static str {
        self.error.map(|e| e.as_str()).unwrap_or("ok")
    }
}

impl fmt::Display for CameraOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.error, &self.digest) {
            (None, Some(digest)) => write!(f, "{}=ok({})", self.cam_id, short_digest(digest)),
            (None, None) => write!(f, "{}=ok", self.cam_id),
            (Some(kind), _) => write!(f, "{}={}", self.cam_id, kind),
        }
    }
}

/// Result of one cycle.
#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub cycle: u64,
    pub started_at: DateTime<FixedOffset>,
    pub outcomes: Vec<CameraOutcome>,
}

impl CycleSummary {
    pub fn ok_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.ok).count()
    }

    pub fn total(&self) -> usize {
        self.outcomes.len()
    }
}

impl fmt::Display for CycleSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] ok {}/{}",
            self.started_at.format("%Y-%m-%d %H:%M:%S"),
            self.ok_count(),
            self.total()
        )
    }
}

/// Cumulative counters over the life of the scheduler.
#[derive(Debug, Default, Clone)]
pub struct SchedulerStats {
    pub cycles: u64,
    pub attempts: u64,
    pub successes: u64,
    pub failures: BTreeMap<CaptureErrorKind, u64>,
}

impl SchedulerStats {
    fn record(&mut self, summary: &CycleSummary) {
        self.cycles += 1;
        for outcome in &summary.outcomes {
            self.attempts += 1;
            match outcome.error {
                None => self.successes += 1,
                Some(kind) => *self.failures.entry(kind).or_default() += 1,
            }
        }
    }

    pub fn failed(&self) -> u64 {
        self.failures.values().sum()
    }
}

impl fmt::Display for SchedulerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cycles={} attempts={} ok={} failed={}",
            self.cycles,
            self.attempts,
            self.successes,
            self.failed()
        )?;
        for (kind, count) in &self.failures {
            write!(f, " {kind}={count}")?;
        }
        Ok(())
    }
}

/// Everything a camera owns across cycles.
struct CameraWorker<C: CaptureClient> {
    camera: CameraDescriptor,
    code_slug: String,
    session: Option<C::Session>,
    partition: DayPartition,
}

impl<C: CaptureClient> CameraWorker<C> {
    /// Fresh worker: no session yet and a closed partition.
    fn new(camera: CameraDescriptor, storage: &StorageConfig) -> Self {
        Self {
            code_slug: camera.code_slug(),
            partition: DayPartition::new(storage, camera.cam_id.clone()),
            session: None,
            camera,
        }
    }
}

/// Shared, read-only inputs of an attempt.
struct AttemptContext<C> {
    client: Arc<C>,
    normalizer: Arc<FrameNormalizer>,
    clock: LocalClock,
    chunk_file: Arc<str>,
    locate_retry: Duration,
    fetch_retry: Duration,
}

impl<C> Clone for AttemptContext<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            normalizer: Arc::clone(&self.normalizer),
            clock: self.clock,
            chunk_file: Arc::clone(&self.chunk_file),
            locate_retry: self.locate_retry,
            fetch_retry: self.fetch_retry,
        }
    }
}

/// Fixed-interval backoff used for the single retry of a step.
fn retry_backoff(delay: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: delay,
        initial_interval: delay,
        max_interval: delay,
        multiplier: 1.0,
        randomization_factor: 0.0,
        max_elapsed_time: None,
        ..Default::default()
    }
}

impl<C: CaptureClient> AttemptContext<C> {
    /// Run one camera's attempt end to end and give the worker back.
    async fn run(self, mut worker: CameraWorker<C>) -> (CameraWorker<C>, CameraOutcome) {
        let captured_at = self.clock.now();
        let attempt = self.capture(&mut worker, captured_at).await;
        let outcome = self.persist(&mut worker, attempt).await;

        metrics::counter!("capture.attempts", "outcome" => outcome.tag()).increment(1);
        match outcome.error {
            None => debug!(outcome = %outcome, "Capture stored"),
            Some(kind) => warn!(error = %kind, "Capture failed"),
        }

        (worker, outcome)
    }

    async fn capture(
        &self,
        worker: &mut CameraWorker<C>,
        captured_at: DateTime<FixedOffset>,
    ) -> CaptureAttempt {
        let attempt = CaptureAttempt::start(&worker.camera, &worker.code_slug, captured_at);
        if attempt.source_endpoint.is_none() {
            return attempt.failed(CaptureErrorKind::MissingSourceEndpoint);
        }

        // Sessions persist across cycles; one lost to an error is reopened here.
        let session = match worker.session.take() {
            Some(session) => session,
            None => match self.client.open_session(&worker.camera).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(error = %e, "Failed to open capture session");
                    return attempt.failed(CaptureErrorKind::SessionUnavailable);
                }
            },
        };
        let session = worker.session.insert(session);

        let Some(url) = self.locate_with_retry(session).await else {
            return attempt.failed(CaptureErrorKind::NoImageFound);
        };

        match self.fetch_with_retry(session, url).await {
            Ok(image) => attempt.fetched(image),
            Err(e) => {
                debug!(error = %e, "Fetch failed after retry");
                attempt.failed(CaptureErrorKind::FetchFailed)
            }
        }
    }

    async fn locate_with_retry(&self, session: &mut C::Session) -> Option<String> {
        let mut backoff = retry_backoff(self.locate_retry);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.client.locate_displayed_image(session).await {
                Ok(Some(url)) => return Some(url),
                Ok(None) => debug!(attempt = attempts, "No displayed image found"),
                Err(e) => debug!(attempt = attempts, error = %e, "Locating displayed image failed"),
            }

            if attempts >= MAX_TRIES {
                return None;
            }
            if let Some(delay) = backoff.next_backoff() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Fetch `url`; on failure wait, re-locate once and fetch again.
    async fn fetch_with_retry(
        &self,
        session: &mut C::Session,
        mut url: String,
    ) -> Result<FetchedImage, CaptureError> {
        let mut backoff = retry_backoff(self.fetch_retry);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let error = match self.client.fetch(session, &url).await {
                Ok(image) => return Ok(image),
                Err(e) => e,
            };

            if attempts >= MAX_TRIES {
                return Err(error);
            }
            debug!(attempt = attempts, url = %url, error = %error, "Fetch failed, retrying");
            if let Some(delay) = backoff.next_backoff() {
                tokio::time::sleep(delay).await;
            }

            // The page may have rotated to a new image URL in the meantime.
            match self.client.locate_displayed_image(session).await {
                Ok(Some(fresh)) => url = fresh,
                Ok(None) => {}
                Err(e) => debug!(error = %e, "Re-locate before fetch retry failed"),
            }
        }
    }

    async fn persist(&self, worker: &mut CameraWorker<C>, attempt: CaptureAttempt) -> CameraOutcome {
        let mut record = FrameRecord::new(attempt.cam_id.clone(), attempt.captured_at);
        record.chunk_file = Some(self.chunk_file.to_string());
        record.code_slug = Some(attempt.code_slug);
        record.source_endpoint = attempt.source_endpoint;
        record.img_url = attempt.img_url.clone();
        record.content_type = attempt.content_type.clone();

        let mut error = attempt.error;
        if let (None, Some(raw)) = (error, attempt.raw_bytes) {
            match self.normalizer.normalize(
                raw,
                attempt.content_type.as_deref(),
                attempt.img_url.as_deref(),
            ) {
                Ok(frame) => {
                    record.extension = Some(frame.extension.to_string());
                    record.width = frame.width;
                    record.height = frame.height;
                    record.digest = Some(frame.digest);
                    record.was_animated_source = frame.was_animated_source;
                    record.ok = true;
                    record.payload = frame.bytes.to_vec();
                }
                Err(e) => {
                    debug!(error = %e, "Normalization failed");
                    error = Some(CaptureErrorKind::DecodeFailure);
                }
            }
        }
        record.error = error.map(|kind| kind.as_str().to_string());

        if let Err(e) = worker.partition.upsert(&record).await {
            error!(error = %e, "Failed to store capture");
            // Drop the handle; the next write reopens the partition.
            worker.partition.close().await;
            return CameraOutcome {
                cam_id: attempt.cam_id,
                ok: false,
                error: Some(CaptureErrorKind::StorageWriteFailure),
                digest: None,
            };
        }

        CameraOutcome {
            cam_id: attempt.cam_id,
            ok: record.ok,
            error,
            digest: record.digest,
        }
    }
}

/// Capture loop over one cohort of cameras.
pub struct CaptureScheduler<C: CaptureClient> {
    config: SchedulerConfig,
    context: AttemptContext<C>,
    storage: StorageConfig,
    workers: Vec<CameraWorker<C>>,
    stats: SchedulerStats,
    cycle: u64,
}

impl<C: CaptureClient> CaptureScheduler<C> {
    pub fn new(client: Arc<C>, chunk: Chunk, config: &IngestConfig) -> Result<Self, SchedulerError> {
        if chunk.cameras.is_empty() {
            return Err(SchedulerError::EmptyCohort);
        }
        if chunk.cameras.len() != config.scheduler.expected_cohort {
            warn!(
                cameras = chunk.cameras.len(),
                expected = config.scheduler.expected_cohort,
                "Cohort size differs from the expected size"
            );
        }

        let offset = config.storage.utc_offset_minutes;
        let clock = LocalClock::from_offset_minutes(offset)
            .ok_or(SchedulerError::InvalidOffset(offset.unwrap_or_default()))?;

        let workers = chunk
            .cameras
            .into_iter()
            .map(|camera| CameraWorker::new(camera, &config.storage))
            .collect();

        Ok(Self {
            config: config.scheduler.clone(),
            context: AttemptContext {
                client,
                normalizer: Arc::new(FrameNormalizer::new(&config.processing)),
                clock,
                chunk_file: Arc::from(chunk.file_name),
                locate_retry: config.scheduler.locate_retry(),
                fetch_retry: config.scheduler.fetch_retry(),
            },
            storage: config.storage.clone(),
            workers,
            stats: SchedulerStats::default(),
            cycle: 0,
        })
    }

    /// Camera ids in cohort order.
    pub fn cam_ids(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.camera.cam_id.clone()).collect()
    }

    /// Snapshot of the cumulative statistics.
    pub fn stats(&self) -> SchedulerStats {
        self.stats.clone()
    }

    /// Open a capture session for every camera with an endpoint.
    ///
    /// Cameras whose session fails to open are retried on their next attempt.
    pub async fn open_sessions(&mut self) {
        let client = &self.context.client;
        let opens = self
            .workers
            .iter_mut()
            .filter(|w| w.session.is_none() && w.camera.endpoint().is_some())
            .map(|worker| async move {
                match client.open_session(&worker.camera).await {
                    Ok(session) => worker.session = Some(session),
                    Err(e) => warn!(
                        cam_id = %worker.camera.cam_id,
                        error = %e,
                        "Failed to open capture session"
                    ),
                }
            });
        join_all(opens).await;

        let open = self.workers.iter().filter(|w| w.session.is_some()).count();
        info!(open, total = self.workers.len(), "Capture sessions opened");
    }

    /// Run one cycle: every camera once, concurrently, then summarize.
    pub async fn run_cycle(&mut self) -> CycleSummary {
        self.cycle += 1;
        let started_at = self.context.clock.now();

        let (cameras, handles): (Vec<_>, Vec<_>) = std::mem::take(&mut self.workers)
            .into_iter()
            .map(|worker| {
                let span = info_span!("capture", cycle = self.cycle, cam_id = %worker.camera.cam_id);
                let camera = worker.camera.clone();
                (camera, tokio::spawn(self.context.clone().run(worker).instrument(span)))
            })
            .unzip();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (camera, joined) in cameras.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok((worker, outcome)) => {
                    self.workers.push(worker);
                    outcomes.push(outcome);
                }
                Err(e) => {
                    // Session and partition handle went down with the task.
                    error!(
                        cycle = self.cycle,
                        cam_id = %camera.cam_id,
                        error = %e,
                        "Capture task aborted, camera reset for the next cycle"
                    );
                    let kind = CaptureErrorKind::TaskAborted;
                    metrics::counter!("capture.attempts", "outcome" => kind.as_str()).increment(1);
                    outcomes.push(CameraOutcome {
                        cam_id: camera.cam_id.clone(),
                        ok: false,
                        error: Some(kind),
                        digest: None,
                    });
                    self.workers.push(CameraWorker::new(camera, &self.storage));
                }
            }
        }

        let summary = CycleSummary {
            cycle: self.cycle,
            started_at,
            outcomes,
        };
        self.stats.record(&summary);
        metrics::counter!("capture.cycles").increment(1);
        metrics::gauge!("capture.cycle.ok_count").set(summary.ok_count() as f64);

        info!(
            cycle = summary.cycle,
            ok_count = summary.ok_count(),
            total = summary.total(),
            "{summary}"
        );
        let detail = summary
            .outcomes
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        debug!(%detail, "Cycle detail");

        summary
    }

    /// Run cycles until `cancel` is set or the cycle limit is reached, then
    /// close every session and partition.
    ///
    /// The flag is checked between cycles and while sleeping; a cycle that
    /// has started always completes.
    pub async fn run(&mut self, cancel: Arc<AtomicBool>) -> SchedulerStats {
        let offset = self.config.start_offset();
        if !offset.is_zero() {
            info!(offset_ms = offset.as_millis() as u64, "Delaying first cycle");
            sleep_unless_cancelled(offset, &cancel).await;
        }

        self.open_sessions().await;

        let period = self.config.period();
        loop {
            if cancel.load(Ordering::SeqCst) {
                info!("Cancellation requested, stopping capture loop");
                break;
            }

            let t0 = Instant::now();
            self.run_cycle().await;

            if self.config.max_cycles.is_some_and(|max| self.cycle >= max) {
                info!(cycles = self.cycle, "Cycle limit reached");
                break;
            }

            let elapsed = t0.elapsed();
            if elapsed > period {
                warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    period_ms = period.as_millis() as u64,
                    "Cycle overran its period"
                );
            }
            sleep_unless_cancelled(period.saturating_sub(elapsed), &cancel).await;
        }

        self.shutdown().await;
        self.stats()
    }

    /// Close every partition and session. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        for worker in &mut self.workers {
            worker.partition.close().await;
            if let Some(session) = worker.session.take() {
                self.context.client.close_session(session).await;
            }
        }

        let stats = self.stats();
        info!(
            cycles = stats.cycles,
            attempts = stats.attempts,
            successes = stats.successes,
            failed = stats.failed(),
            "Scheduler stopped"
        );
    }
}

async fn sleep_unless_cancelled(duration: Duration, cancel: &AtomicBool) {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        tokio::time::sleep((deadline - now).min(CANCEL_POLL)).await;
    }
}
