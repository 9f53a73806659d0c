//! GPU worker actors.
//!
//! Each worker is a dedicated OS thread that owns one engine bound to one GPU
//! for its whole life. It shares nothing with the rest of the server except
//! the job queue it reads and the result channel it writes.

use std::fs;
use std::io::ErrorKind;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::audio::load_audio;
use crate::engine::{warm_up, Engine, EngineFactory, EngineRequest};
use crate::error::AppError;
use crate::job::{
    ms, ms_between, Job, ResultItem, ResultMessage, StageTimings, Timeline, Timing, WorkItem,
};
use crate::queue::BoundedQueue;

/// Lifecycle of a worker, published to health checks.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Initializing,
    Ready,
    Processing,
    ShuttingDown,
    Terminated,
}

/// Everything a worker thread needs; cloned into each thread.
#[derive(Clone)]
pub struct WorkerContext {
    pub jobs: BoundedQueue<Job>,
    pub results: BoundedQueue<ResultMessage>,
    pub factory: Arc<dyn EngineFactory>,
    pub ffmpeg_bin: String,
}

/// Supervisor-side handle to a running worker.
pub struct WorkerHandle {
    pub worker_id: usize,
    pub gpu_id: usize,
    state: watch::Receiver<WorkerState>,
    /// Disconnects when the worker thread ends, however it ends.
    exited: crossbeam_channel::Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn is_alive(&self) -> bool {
        let running = self
            .thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished());
        running && self.state() != WorkerState::Terminated
    }

    /// Waits up to `timeout` for the thread to end and joins it.
    ///
    /// Returns `false` if the worker is still running after the timeout.
    pub fn wait_exit(&mut self, timeout: Duration) -> bool {
        let Some(thread) = self.thread.take() else {
            return true;
        };
        match self.exited.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) | Ok(()) => {
                if thread.join().is_err() {
                    warn!(worker_id = self.worker_id, "worker thread panicked");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                self.thread = Some(thread);
                false
            }
        }
    }

    /// Stops supervising a worker that did not exit in time.
    ///
    /// Threads cannot be killed; a detached worker finishes its current item
    /// and its result is dropped once the correlator has stopped.
    pub fn detach(&mut self) {
        if self.thread.take().is_some() {
            warn!(
                worker_id = self.worker_id,
                gpu_id = self.gpu_id,
                "worker did not exit within grace period; detaching"
            );
        }
    }
}

/// Starts a worker thread bound to `gpu_id`.
pub fn spawn(worker_id: usize, gpu_id: usize, ctx: WorkerContext) -> std::io::Result<WorkerHandle> {
    let (state_tx, state_rx) = watch::channel(WorkerState::Initializing);
    let (exit_guard, exited) = crossbeam_channel::bounded::<()>(0);

    let thread = thread::Builder::new()
        .name(format!("gpu-worker-{worker_id}"))
        .spawn(move || {
            let _exit_guard = exit_guard;
            run(worker_id, gpu_id, &ctx, &state_tx);
            state_tx.send_replace(WorkerState::Terminated);
        })?;

    Ok(WorkerHandle {
        worker_id,
        gpu_id,
        state: state_rx,
        exited,
        thread: Some(thread),
    })
}

fn run(worker_id: usize, gpu_id: usize, ctx: &WorkerContext, state: &watch::Sender<WorkerState>) {
    info!(worker_id, gpu_id, "starting worker");

    let mut engine = match init_engine(ctx.factory.as_ref(), gpu_id) {
        Ok(engine) => engine,
        Err(err) => {
            error!(worker_id, gpu_id, error = %err, "worker failed to initialize");
            return;
        }
    };

    state.send_replace(WorkerState::Ready);
    info!(worker_id, gpu_id, "worker ready");

    while let Some(job) = ctx.jobs.get() {
        let item = match job {
            Job::Work(item) => item,
            Job::Stop => break,
        };

        state.send_replace(WorkerState::Processing);
        let result = process(engine.as_mut(), item, worker_id, gpu_id, &ctx.ffmpeg_bin);
        if ctx.results.put_blocking(ResultMessage::Result(result)).is_err() {
            error!(worker_id, "result channel closed; stopping worker");
            break;
        }
        state.send_replace(WorkerState::Ready);
    }

    state.send_replace(WorkerState::ShuttingDown);
    info!(worker_id, gpu_id, "worker shutting down");
}

fn init_engine(factory: &dyn EngineFactory, gpu_id: usize) -> Result<Box<dyn Engine>, AppError> {
    let mut engine = catch_unwind(AssertUnwindSafe(|| factory.create(gpu_id)))
        .map_err(|_| AppError::worker_init("engine construction panicked"))??;
    catch_unwind(AssertUnwindSafe(|| warm_up(engine.as_mut())))
        .map_err(|_| AppError::worker_init("engine warmup panicked"))??;
    Ok(engine)
}

/// Runs one item to a result. The upload is deleted on every path,
/// including a panic anywhere in decode or generation.
fn process(
    engine: &mut dyn Engine,
    item: WorkItem,
    worker_id: usize,
    gpu_id: usize,
    ffmpeg_bin: &str,
) -> ResultItem {
    let picked_up = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        transcribe_item(engine, &item, ffmpeg_bin, picked_up)
    }))
    .unwrap_or_else(|_| Err(AppError::engine("worker panicked while processing item")));

    if let Err(err) = fs::remove_file(&item.audio_path) {
        if err.kind() != ErrorKind::NotFound {
            warn!(
                request_id = %item.id,
                path = %item.audio_path.display(),
                error = %err,
                "failed to delete temporary audio"
            );
        }
    }

    match outcome {
        Ok((text, stages)) => {
            info!(
                request_id = %item.id,
                worker_id,
                gpu_id,
                queue_wait_ms = stages.queue_wait_ms,
                load_ms = stages.load_ms,
                preprocess_ms = stages.preprocess_ms,
                generate_wall_ms = stages.generate_wall_ms,
                generate_gpu_ms = ?stages.generate_gpu_ms,
                decode_ms = stages.decode_ms,
                total_worker_ms = stages.total_worker_ms,
                "transcription complete"
            );
            ResultItem {
                id: item.id,
                outcome: Ok(text),
                timing: Timing {
                    stages: Some(stages),
                    ..Timing::identity_only(worker_id, gpu_id)
                },
            }
        }
        Err(err) => {
            error!(request_id = %item.id, worker_id, gpu_id, error = %err, "transcription failed");
            ResultItem {
                id: item.id,
                outcome: Err(err.to_string()),
                timing: Timing::identity_only(worker_id, gpu_id),
            }
        }
    }
}

fn transcribe_item(
    engine: &mut dyn Engine,
    item: &WorkItem,
    ffmpeg_bin: &str,
    picked_up: Instant,
) -> Result<(String, StageTimings), AppError> {
    let load_start = Instant::now();
    let samples = load_audio(&item.audio_path, ffmpeg_bin)?;
    let load_end = Instant::now();

    let request = EngineRequest {
        samples: &samples,
        context: item.context.as_deref(),
        language: item.language.as_deref(),
    };
    let output = catch_unwind(AssertUnwindSafe(|| engine.transcribe(request)))
        .map_err(|_| AppError::engine("engine panicked during transcription"))??;
    let done = Instant::now();

    let t = output.timings;
    let preprocess_end = load_end + t.preprocess;
    let generate_end = preprocess_end + t.generate_wall;
    let epoch = item.server_epoch;

    let stages = StageTimings {
        queue_wait_ms: ms_between(item.queued_at, picked_up),
        load_ms: ms_between(load_start, load_end),
        preprocess_ms: ms(t.preprocess),
        generate_wall_ms: ms(t.generate_wall),
        generate_gpu_ms: t.generate_device.map(ms),
        decode_ms: ms(t.decode),
        total_worker_ms: ms_between(load_start, done),
        timeline: Timeline {
            picked_up: ms_between(epoch, picked_up),
            load_start: ms_between(epoch, load_start),
            load_end: ms_between(epoch, load_end),
            preprocess_end: ms_between(epoch, preprocess_end),
            generate_start: ms_between(epoch, preprocess_end),
            generate_end: ms_between(epoch, generate_end),
            done: ms_between(epoch, done),
        },
    };
    Ok((output.text, stages))
}
