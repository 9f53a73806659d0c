//! Transcription engine abstraction.
//!
//! Workers depend on the [`Engine`] trait instead of a concrete model, which
//! keeps the pool and its tests independent of GPU inference code. An engine
//! is created inside its worker thread and never leaves it.

use std::sync::Arc;
use std::time::Duration;

use crate::audio::TARGET_SAMPLE_RATE;
use crate::config::AppConfig;
use crate::error::AppError;
use crate::model_store::ensure_model_ready;

pub mod whisper_rs;

/// Input to one engine call.
#[derive(Debug, Clone, Copy)]
pub struct EngineRequest<'a> {
    /// 16 kHz mono PCM in `[-1.0, 1.0]`.
    pub samples: &'a [f32],
    /// Optional conditioning prompt.
    pub context: Option<&'a str>,
    /// Optional forced language; `None` means auto-detect.
    pub language: Option<&'a str>,
}

/// Stage durations reported by the engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineTimings {
    /// Work the engine does before generation starts. Engines that compute
    /// input features inside their generate call (whisper does) report only
    /// decoder setup here, and the features count toward `generate_wall`.
    pub preprocess: Duration,
    /// Host wall time around generation.
    pub generate_wall: Duration,
    /// Device-only generation time, when the engine can measure it.
    pub generate_device: Option<Duration>,
    /// Token-to-text decoding.
    pub decode: Duration,
}

/// Transcript plus stage timings.
#[derive(Debug, Clone)]
pub struct EngineOutput {
    pub text: String,
    pub timings: EngineTimings,
}

/// A loaded model bound to one device.
pub trait Engine {
    fn transcribe(&mut self, req: EngineRequest<'_>) -> Result<EngineOutput, AppError>;
}

/// Creates one engine per worker, bound to the worker's GPU.
pub trait EngineFactory: Send + Sync {
    /// Loads the model on `gpu_id`. Errors are fatal to the calling worker.
    fn create(&self, gpu_id: usize) -> Result<Box<dyn Engine>, AppError>;
}

/// Runs one transcription of a second of silence so the first real request
/// does not pay for lazy initialization.
pub fn warm_up(engine: &mut dyn Engine) -> Result<(), AppError> {
    let silence = vec![0.0_f32; TARGET_SAMPLE_RATE as usize];
    engine
        .transcribe(EngineRequest {
            samples: &silence,
            context: None,
            language: None,
        })
        .map(|_| ())
        .map_err(|err| AppError::worker_init(format!("engine warmup failed: {err}")))
}

/// Resolves the model and builds the production engine factory.
pub fn build_engine_factory(cfg: &AppConfig) -> Result<Arc<dyn EngineFactory>, AppError> {
    let model_path = ensure_model_ready(cfg)?;
    Ok(Arc::new(whisper_rs::WhisperRsFactory::new(model_path)))
}
