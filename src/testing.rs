//! Scripted engines and fixtures shared by unit tests.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::audio::{wav_bytes, AudioFormat};
use crate::engine::{Engine, EngineFactory, EngineOutput, EngineRequest, EngineTimings};
use crate::error::AppError;
use crate::runtime::{RuntimeOptions, ServerRuntime, Upload};

/// Engine driven by the request context:
/// - `"slow"` sleeps one second before answering,
/// - `"hold"` blocks until the factory's hold gate is released,
/// - `"fail"` returns an engine error,
/// - anything else is echoed back as the transcript.
pub struct ScriptedEngine {
    hold: Receiver<()>,
}

impl Engine for ScriptedEngine {
    fn transcribe(&mut self, req: EngineRequest<'_>) -> Result<EngineOutput, AppError> {
        let text = match req.context {
            Some("slow") => {
                thread::sleep(Duration::from_secs(1));
                "slow".to_string()
            }
            Some("hold") => {
                let _ = self.hold.recv_timeout(Duration::from_secs(10));
                "held".to_string()
            }
            Some("fail") => return Err(AppError::engine("generation failed")),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        Ok(EngineOutput {
            text,
            timings: EngineTimings {
                generate_wall: Duration::from_millis(1),
                ..EngineTimings::default()
            },
        })
    }
}

/// Builds [`ScriptedEngine`]s, optionally blocking creation until released
/// and failing on chosen GPUs.
pub struct ScriptedFactory {
    init_gate: Option<Receiver<()>>,
    hold: Receiver<()>,
    failing_gpus: Vec<usize>,
}

/// Dropping a gate sender releases everything waiting on it.
pub struct Gates {
    pub init: Option<Sender<()>>,
    pub hold: Option<Sender<()>>,
}

impl ScriptedFactory {
    pub fn ready() -> (Arc<Self>, Gates) {
        Self::build(false, Vec::new())
    }

    pub fn gated() -> (Arc<Self>, Gates) {
        Self::build(true, Vec::new())
    }

    pub fn failing_on(gpus: Vec<usize>) -> (Arc<Self>, Gates) {
        Self::build(false, gpus)
    }

    fn build(gated: bool, failing_gpus: Vec<usize>) -> (Arc<Self>, Gates) {
        let (hold_tx, hold_rx) = crossbeam_channel::bounded(0);
        let (init_tx, init_rx) = if gated {
            let (tx, rx) = crossbeam_channel::bounded(0);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let factory = Arc::new(Self {
            init_gate: init_rx,
            hold: hold_rx,
            failing_gpus,
        });
        (
            factory,
            Gates {
                init: init_tx,
                hold: Some(hold_tx),
            },
        )
    }
}

impl EngineFactory for ScriptedFactory {
    fn create(&self, gpu_id: usize) -> Result<Box<dyn Engine>, AppError> {
        if let Some(gate) = &self.init_gate {
            let _ = gate.recv();
        }
        if self.failing_gpus.contains(&gpu_id) {
            return Err(AppError::worker_init(format!("cuda:{gpu_id} unavailable")));
        }
        Ok(Box::new(ScriptedEngine {
            hold: self.hold.clone(),
        }))
    }
}

pub fn options(temp_dir: &Path, workers: usize) -> RuntimeOptions {
    RuntimeOptions {
        worker_count: workers,
        gpu_count: workers,
        max_queue_size: 64,
        enqueue_timeout: Duration::from_millis(200),
        request_timeout: Duration::from_secs(10),
        worker_shutdown_grace: Duration::from_millis(200),
        temp_dir: temp_dir.to_path_buf(),
        ffmpeg_bin: "ffmpeg".to_string(),
    }
}

pub fn wav_upload(context: Option<&str>) -> Upload {
    Upload {
        bytes: wav_bytes(16_000, &[0; 1_600]),
        format: AudioFormat::Wav,
        context: context.map(ToOwned::to_owned),
        language: None,
    }
}

/// Polls `cond` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Stops a runtime off the async executor.
pub async fn stop(runtime: &Arc<ServerRuntime>) {
    let runtime = runtime.clone();
    tokio::task::spawn_blocking(move || runtime.stop())
        .await
        .expect("stop task");
}

pub fn files_in(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}
