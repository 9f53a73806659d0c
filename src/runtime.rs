//! Worker pool lifecycle and the gateway request path.
//!
//! [`ServerRuntime`] owns the two bounded channels, the worker handles, the
//! correlator thread, and the pending table. It is built once at startup and
//! shared with the HTTP layer. Shutdown starts with
//! [`ServerRuntime::begin_shutdown`] when the signal arrives and finishes with
//! [`ServerRuntime::stop`].

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audio::AudioFormat;
use crate::config::AppConfig;
use crate::correlator::{self, CorrelatorStats};
use crate::engine::EngineFactory;
use crate::error::AppError;
use crate::gpu::plan_worker_count;
use crate::job::{ms_between, Job, JobId, ResultMessage, Timing, WorkItem};
use crate::pending::PendingTable;
use crate::queue::{BoundedQueue, QueueFull};
use crate::worker::{self, WorkerContext, WorkerHandle, WorkerState};

/// How long shutdown waits to place each stop sentinel.
const SENTINEL_PUT_TIMEOUT: Duration = Duration::from_secs(1);

/// Pool sizing and timeouts.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub worker_count: usize,
    pub gpu_count: usize,
    pub max_queue_size: usize,
    pub enqueue_timeout: Duration,
    pub request_timeout: Duration,
    pub worker_shutdown_grace: Duration,
    pub temp_dir: PathBuf,
    pub ffmpeg_bin: String,
}

impl RuntimeOptions {
    /// Derives options from configuration and the detected GPU count.
    pub fn from_config(cfg: &AppConfig, gpu_count: usize) -> Result<Self, AppError> {
        Ok(Self {
            worker_count: plan_worker_count(cfg.num_workers, gpu_count)?,
            gpu_count,
            max_queue_size: cfg.max_queue_size,
            enqueue_timeout: cfg.enqueue_timeout(),
            request_timeout: cfg.request_timeout(),
            worker_shutdown_grace: cfg.worker_shutdown_grace(),
            temp_dir: cfg.audio_temp_dir(),
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
        })
    }
}

/// Audio submitted by a client.
#[derive(Debug, Clone)]
pub struct Upload {
    pub bytes: Vec<u8>,
    pub format: AudioFormat,
    pub context: Option<String>,
    pub language: Option<String>,
}

/// Successful response body.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionResponse {
    pub request_id: JobId,
    pub transcription: String,
    pub timing: Timing,
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub worker_id: usize,
    pub gpu_id: usize,
    pub state: WorkerState,
}

pub struct ServerRuntime {
    options: RuntimeOptions,
    jobs: BoundedQueue<Job>,
    results: BoundedQueue<ResultMessage>,
    pending: Arc<PendingTable>,
    stats: Arc<CorrelatorStats>,
    workers: Mutex<Vec<WorkerHandle>>,
    correlator: Mutex<Option<JoinHandle<()>>>,
    accepting: AtomicBool,
    stopped: AtomicBool,
    started_at: Instant,
}

impl ServerRuntime {
    /// Creates the queues, starts the correlator, then one worker per slot
    /// bound to GPU `index % gpu_count`.
    pub fn start(
        options: RuntimeOptions,
        factory: Arc<dyn EngineFactory>,
    ) -> Result<Arc<Self>, AppError> {
        if options.worker_count == 0 || options.gpu_count == 0 {
            return Err(AppError::worker_init(
                "worker pool needs at least one worker and one GPU",
            ));
        }
        fs::create_dir_all(&options.temp_dir).map_err(|err| {
            AppError::internal(format!(
                "failed to create audio temp dir {}: {err}",
                options.temp_dir.display()
            ))
        })?;

        let jobs = BoundedQueue::new(options.max_queue_size);
        let results = BoundedQueue::new(options.max_queue_size);
        let pending = Arc::new(PendingTable::new());
        let stats = Arc::new(CorrelatorStats::default());

        let correlator = correlator::spawn(results.clone(), pending.clone(), stats.clone())
            .map_err(|err| AppError::internal(format!("failed to start correlator: {err}")))?;

        let runtime = Arc::new(Self {
            jobs,
            results,
            pending,
            stats,
            workers: Mutex::new(Vec::with_capacity(options.worker_count)),
            correlator: Mutex::new(Some(correlator)),
            accepting: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            started_at: Instant::now(),
            options,
        });

        info!(
            workers = runtime.options.worker_count,
            gpus = runtime.options.gpu_count,
            max_queue_size = runtime.options.max_queue_size,
            "starting worker pool"
        );

        let ctx = WorkerContext {
            jobs: runtime.jobs.clone(),
            results: runtime.results.clone(),
            factory,
            ffmpeg_bin: runtime.options.ffmpeg_bin.clone(),
        };
        for worker_id in 0..runtime.options.worker_count {
            let gpu_id = worker_id % runtime.options.gpu_count;
            match worker::spawn(worker_id, gpu_id, ctx.clone()) {
                Ok(handle) => runtime.lock_workers().push(handle),
                Err(err) => {
                    runtime.stop();
                    return Err(AppError::worker_init(format!(
                        "failed to start worker {worker_id}: {err}"
                    )));
                }
            }
        }

        Ok(runtime)
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<WorkerHandle>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn workers_alive(&self) -> usize {
        self.lock_workers().iter().filter(|w| w.is_alive()).count()
    }

    pub fn workers_total(&self) -> usize {
        self.options.worker_count
    }

    pub fn worker_snapshots(&self) -> Vec<WorkerSnapshot> {
        self.lock_workers()
            .iter()
            .map(|w| WorkerSnapshot {
                worker_id: w.worker_id,
                gpu_id: w.gpu_id,
                state: w.state(),
            })
            .collect()
    }

    /// Requests currently waiting for a result.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Results that arrived after their request had timed out.
    pub fn late_results_discarded(&self) -> u64 {
        self.stats.discarded()
    }

    pub fn queued_jobs(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Runs one request through the pool: persist, register, enqueue, await.
    pub async fn transcribe(&self, upload: Upload) -> Result<TranscriptionResponse, AppError> {
        if !self.is_accepting() {
            return Err(AppError::ShuttingDown);
        }
        if self.workers_alive() == 0 {
            return Err(AppError::overloaded(
                "No workers available to process request",
            ));
        }

        let id = Uuid::new_v4();
        let audio_path =
            persist_upload(&self.options.temp_dir, id, upload.format, upload.bytes).await?;

        let rx = match self.pending.register(id) {
            Ok(rx) => rx,
            Err(err) => {
                remove_upload(&audio_path);
                return Err(err);
            }
        };
        let _entry = PendingEntry {
            table: &self.pending,
            id,
        };

        let queued_at = Instant::now();
        let item = WorkItem {
            id,
            audio_path: audio_path.clone(),
            context: upload.context,
            language: upload.language,
            queued_at,
            server_epoch: self.started_at,
        };

        if let Err(err) = self.enqueue(item).await {
            self.pending.remove(&id);
            remove_upload(&audio_path);
            warn!(request_id = %id, queued = self.jobs.len(), error = %err, "rejecting request");
            return Err(err);
        }

        let resolution = match tokio::time::timeout(self.options.request_timeout, rx).await {
            Ok(Ok(resolution)) => resolution,
            // The table drops senders only after resolving them.
            Ok(Err(_closed)) => Err(AppError::ShuttingDown),
            Err(_elapsed) => {
                warn!(
                    request_id = %id,
                    timeout_secs = self.options.request_timeout.as_secs_f64(),
                    "request timed out waiting for transcription"
                );
                Err(AppError::Timeout)
            }
        };
        self.pending.remove(&id);

        let item = resolution?;
        let transcription = item.outcome.map_err(AppError::Engine)?;
        let mut timing = item.timing;
        if timing.stages.is_some() {
            timing.http_wait_ms = Some(ms_between(queued_at, Instant::now()));
        }

        Ok(TranscriptionResponse {
            request_id: id,
            transcription,
            timing,
        })
    }

    /// Places a job without blocking the executor; a full queue is retried
    /// on the blocking pool until the enqueue timeout.
    async fn enqueue(&self, item: WorkItem) -> Result<(), AppError> {
        let job = match self.jobs.try_put(Job::Work(item)) {
            Ok(()) => return Ok(()),
            Err(QueueFull(job)) => job,
        };

        let jobs = self.jobs.clone();
        let timeout = self.options.enqueue_timeout;
        tokio::task::spawn_blocking(move || jobs.put(job, timeout))
            .await
            .map_err(|err| AppError::internal(format!("enqueue task failed: {err}")))?
            .map_err(|_| AppError::overloaded("Request queue is full. Please try again later."))
    }

    /// Stops admitting requests and fails every pending caller with
    /// [`AppError::ShuttingDown`]. Never blocks on workers, so it can run on
    /// the async executor as soon as a shutdown signal arrives.
    pub fn begin_shutdown(&self) -> usize {
        self.accepting.store(false, Ordering::Release);
        let released = self.pending.fail_all(AppError::ShuttingDown);
        if released > 0 {
            info!(released, "released pending requests");
        }
        released
    }

    /// Shuts the pool down. Safe to call more than once.
    ///
    /// Pending callers are released first, then workers are sent one stop
    /// sentinel each and given a grace period, then the correlator stops.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down worker pool");
        self.begin_shutdown();

        let mut workers = std::mem::take(&mut *self.lock_workers());
        for _ in 0..workers.len() {
            if self.jobs.put(Job::Stop, SENTINEL_PUT_TIMEOUT).is_err() {
                warn!("job queue full; stop sentinel not delivered");
            }
        }

        let deadline = Instant::now() + self.options.worker_shutdown_grace;
        for handle in &mut workers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if handle.wait_exit(remaining) {
                info!(worker_id = handle.worker_id, "worker exited");
            } else {
                handle.detach();
            }
        }

        let mut orphaned = 0;
        for job in self.jobs.drain() {
            if let Job::Work(item) = job {
                remove_upload(&item.audio_path);
                orphaned += 1;
            }
        }
        if orphaned > 0 {
            warn!(orphaned, "dropped queued jobs that no worker picked up");
        }

        let correlator = self
            .correlator
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(correlator) = correlator {
            if self.results.put(ResultMessage::Stop, SENTINEL_PUT_TIMEOUT).is_ok() {
                if correlator.join().is_err() {
                    warn!("response correlator panicked");
                }
            } else {
                warn!("result channel full; correlator not joined");
            }
        }

        info!(
            results_delivered = self.stats.delivered(),
            late_results_discarded = self.stats.discarded(),
            "worker pool shut down"
        );
    }
}

/// Removes the pending entry when the request future ends on any path,
/// including the caller disconnecting mid-wait.
struct PendingEntry<'a> {
    table: &'a PendingTable,
    id: JobId,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

async fn persist_upload(
    dir: &Path,
    id: JobId,
    format: AudioFormat,
    bytes: Vec<u8>,
) -> Result<PathBuf, AppError> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = tempfile::Builder::new()
            .prefix(&format!("whisper_{id}_"))
            .suffix(format.suffix())
            .tempfile_in(&dir)?;
        file.write_all(&bytes)?;
        file.flush()?;
        file.into_temp_path().keep().map_err(|err| err.error)
    })
    .await
    .map_err(|err| AppError::internal(format!("failed to save audio bytes: {err}")))?
    .map_err(|err| AppError::internal(format!("failed to save audio bytes: {err}")))
}

fn remove_upload(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed to delete temporary audio");
        }
    }
}
