//! Work and result records exchanged between the gateway and the workers.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

/// Unique identifier of one transcription request.
pub type JobId = Uuid;

/// One transcription job, enqueued at most once.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: JobId,
    /// Temporary upload; the worker that picks the item up deletes it.
    pub audio_path: PathBuf,
    /// Optional conditioning text passed to the engine as a prompt.
    pub context: Option<String>,
    /// Language hint; `None` means auto-detect.
    pub language: Option<String>,
    pub queued_at: Instant,
    pub server_epoch: Instant,
}

/// Message read by workers from the job queue.
#[derive(Debug)]
pub enum Job {
    Work(WorkItem),
    /// Stop sentinel; one is pushed per worker at shutdown.
    Stop,
}

/// Outcome of a [`WorkItem`], produced exactly once per dequeued item.
#[derive(Debug, Clone)]
pub struct ResultItem {
    pub id: JobId,
    /// Transcript on success, error message on failure.
    pub outcome: Result<String, String>,
    pub timing: Timing,
}

impl ResultItem {
    #[cfg(test)]
    pub fn text(&self) -> Option<&str> {
        self.outcome.as_deref().ok()
    }

    pub fn error(&self) -> Option<&str> {
        self.outcome.as_ref().err().map(String::as_str)
    }
}

/// Message read by the correlator from the result channel.
#[derive(Debug)]
pub enum ResultMessage {
    Result(ResultItem),
    Stop,
}

/// Timing diagnostics attached to a result and returned to the client.
#[derive(Debug, Clone, Serialize)]
pub struct Timing {
    pub worker_id: usize,
    pub gpu_id: usize,
    /// Absent when the item failed before completing.
    #[serde(flatten)]
    pub stages: Option<StageTimings>,
    /// Filled by the gateway once the result reaches the caller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_wait_ms: Option<f64>,
}

impl Timing {
    pub fn identity_only(worker_id: usize, gpu_id: usize) -> Self {
        Self {
            worker_id,
            gpu_id,
            stages: None,
            http_wait_ms: None,
        }
    }
}

/// Per-stage durations in milliseconds.
///
/// `generate_wall_ms` includes host-side orchestration; `generate_gpu_ms` is
/// the device-reported compute time when the engine can measure it.
#[derive(Debug, Clone, Serialize)]
pub struct StageTimings {
    pub queue_wait_ms: f64,
    pub load_ms: f64,
    pub preprocess_ms: f64,
    pub generate_wall_ms: f64,
    pub generate_gpu_ms: Option<f64>,
    pub decode_ms: f64,
    pub total_worker_ms: f64,
    pub timeline: Timeline,
}

/// Absolute stage boundaries in milliseconds since server start.
#[derive(Debug, Clone, Serialize)]
pub struct Timeline {
    pub picked_up: f64,
    pub load_start: f64,
    pub load_end: f64,
    pub preprocess_end: f64,
    pub generate_start: f64,
    pub generate_end: f64,
    pub done: f64,
}

/// Milliseconds from `earlier` to `later`, rounded to one decimal.
pub fn ms_between(earlier: Instant, later: Instant) -> f64 {
    ms(later.saturating_duration_since(earlier))
}

/// Duration in milliseconds, rounded to one decimal.
pub fn ms(duration: Duration) -> f64 {
    (duration.as_secs_f64() * 10_000.0).round() / 10.0
}
