//! `whisper-rs` engine implementation.
//!
//! Each worker loads its own [`WhisperContext`] pinned to one GPU and runs
//! inference with a single CPU thread.

use std::time::Instant;

use tracing::{info, warn};
use whisper_rs::{
    FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters, WhisperState,
};

use crate::engine::{Engine, EngineFactory, EngineOutput, EngineRequest, EngineTimings};
use crate::error::AppError;

/// CPU threads used by whisper inside one worker.
const WHISPER_CPU_THREADS: i32 = 1;

/// Builds [`WhisperRsEngine`]s from a resolved model file.
pub struct WhisperRsFactory {
    model_path: String,
}

impl WhisperRsFactory {
    pub fn new(model_path: String) -> Self {
        Self { model_path }
    }
}

impl EngineFactory for WhisperRsFactory {
    fn create(&self, gpu_id: usize) -> Result<Box<dyn Engine>, AppError> {
        let device = i32::try_from(gpu_id)
            .map_err(|_| AppError::worker_init(format!("gpu index {gpu_id} out of range")))?;

        let mut params = WhisperContextParameters::default();
        params.use_gpu(true);
        params.gpu_device(device);

        let context = WhisperContext::new_with_params(&self.model_path, params).map_err(|err| {
            AppError::worker_init(format!(
                "failed to load model at {:?} on gpu {gpu_id}: {err}",
                self.model_path
            ))
        })?;

        info!(gpu_id, model = %self.model_path, "loaded whisper model");
        Ok(Box::new(WhisperRsEngine {
            context,
            model_path: self.model_path.clone(),
        }))
    }
}

/// Local inference engine powered by `whisper-rs`.
pub struct WhisperRsEngine {
    context: WhisperContext,
    model_path: String,
}

impl Engine for WhisperRsEngine {
    fn transcribe(&mut self, req: EngineRequest<'_>) -> Result<EngineOutput, AppError> {
        let started = Instant::now();
        let mut state = self
            .context
            .create_state()
            .map_err(|err| AppError::engine(format!("failed to create whisper state: {err}")))?;
        let params = build_params(req.language, req.context);
        // Mel extraction runs inside `full`, so it lands in generation time.
        let preprocessed = Instant::now();

        state.full(params, req.samples).map_err(|err| {
            AppError::engine(format!(
                "whisper inference failed using {:?}: {err}",
                self.model_path
            ))
        })?;
        let mut generated = Instant::now();
        let mut segments = extract_segments(&state)?;

        if segments.is_empty() && req.language.is_none() {
            state
                .full(build_params(Some("en"), req.context), req.samples)
                .map_err(|err| {
                    AppError::engine(format!(
                        "whisper fallback inference failed using {:?}: {err}",
                        self.model_path
                    ))
                })?;
            generated = Instant::now();
            let fallback = extract_segments(&state)?;
            if !fallback.is_empty() {
                warn!(
                    audio_samples = req.samples.len(),
                    segment_count = fallback.len(),
                    "whisper fallback used fixed language after empty auto-detect output"
                );
                segments = fallback;
            }
        }

        let text = normalize_text(&segments.join(" "));
        let decoded = Instant::now();

        Ok(EngineOutput {
            text,
            timings: EngineTimings {
                preprocess: preprocessed - started,
                generate_wall: generated - preprocessed,
                generate_device: None,
                decode: decoded - generated,
            },
        })
    }
}

fn build_params<'a>(language: Option<&'a str>, context: Option<&'a str>) -> FullParams<'a, 'a> {
    let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
    params.set_n_threads(WHISPER_CPU_THREADS);
    params.set_no_timestamps(true);
    params.set_print_special(false);
    params.set_print_progress(false);
    params.set_print_realtime(false);
    params.set_print_timestamps(false);
    params.set_temperature(0.0);
    params.set_translate(false);
    match language.map(str::trim).filter(|lang| !lang.is_empty()) {
        Some(lang) => params.set_language(Some(lang)),
        None => params.set_language(Some("auto")),
    }
    if let Some(prompt) = context.map(str::trim).filter(|p| !p.is_empty()) {
        params.set_initial_prompt(prompt);
    }
    params
}

fn extract_segments(state: &WhisperState) -> Result<Vec<String>, AppError> {
    let count = state.full_n_segments();
    let mut segments = Vec::with_capacity(count.max(0) as usize);
    for i in 0..count {
        let Some(seg) = state.get_segment(i) else {
            continue;
        };
        let text = seg
            .to_str_lossy()
            .map_err(|err| AppError::engine(format!("failed to read segment text: {err}")))?
            .trim()
            .to_string();
        if !text.is_empty() {
            segments.push(text);
        }
    }
    Ok(segments)
}

/// Collapses whitespace runs to one space.
pub fn normalize_text(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::normalize_text;

    #[test]
    fn normalize_collapses_spaces() {
        assert_eq!(
            normalize_text("  hello   world\nagain"),
            "hello world again"
        );
    }
}
