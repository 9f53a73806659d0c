//! Configuration loading from command line flags and environment variables.
//!
//! Every option can be given either way; values are validated early so
//! startup fails fast with actionable errors.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::AppError;

pub const DEFAULT_NUM_WORKERS: usize = 8;
pub const MAX_NUM_WORKERS: usize = 64;
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 10_000;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 600;

/// Runtime configuration for the HTTP server, worker pool, and engine.
#[derive(Debug, Clone, Parser)]
#[command(name = "whisper-gpu-pool-server", version, about)]
pub struct AppConfig {
    /// Host interface to bind.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,
    /// TCP port to bind.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,
    /// Requested number of GPU workers; capped at the detected GPU count.
    #[arg(long, env = "NUM_WORKERS", default_value_t = DEFAULT_NUM_WORKERS)]
    pub num_workers: usize,
    /// Overrides GPU discovery when set.
    #[arg(long, env = "NUM_GPUS")]
    pub num_gpus: Option<usize>,
    /// Capacity of the job queue and of the result channel.
    #[arg(long, env = "MAX_QUEUE_SIZE", default_value_t = DEFAULT_MAX_QUEUE_SIZE)]
    pub max_queue_size: usize,
    /// How long a request waits for its transcription.
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    pub request_timeout_secs: u64,
    /// How long an enqueue may block on a full queue before rejecting.
    #[arg(long, env = "ENQUEUE_TIMEOUT_MS", default_value_t = 5_000)]
    pub enqueue_timeout_ms: u64,
    /// How long shutdown waits for each worker before detaching it.
    #[arg(long, env = "WORKER_SHUTDOWN_GRACE_MS", default_value_t = 5_000)]
    pub worker_shutdown_grace_ms: u64,
    /// Directory for uploaded audio awaiting a worker.
    #[arg(long, env = "AUDIO_TEMP_DIR")]
    pub temp_dir: Option<PathBuf>,
    /// Maximum accepted request body size in bytes.
    #[arg(long, env = "MAX_UPLOAD_BYTES", default_value_t = 100 * 1024 * 1024)]
    pub max_upload_bytes: usize,
    /// External codec used for compressed containers.
    #[arg(long, env = "FFMPEG_BIN", default_value = "ffmpeg")]
    pub ffmpeg_bin: String,
    /// Explicit local Whisper model path.
    #[arg(long, env = "WHISPER_MODEL")]
    pub whisper_model: Option<String>,
    /// Download the model when it is missing locally.
    #[arg(
        long,
        env = "WHISPER_AUTO_DOWNLOAD",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub whisper_auto_download: bool,
    /// Hugging Face repository used for model download.
    #[arg(long, env = "WHISPER_HF_REPO", default_value = "ggerganov/whisper.cpp")]
    pub whisper_hf_repo: String,
    /// Model filename in the Hugging Face repository.
    #[arg(long, env = "WHISPER_HF_FILENAME", default_value = "ggml-large-v3-turbo.bin")]
    pub whisper_hf_filename: String,
    /// Local cache directory for downloaded models.
    #[arg(long, env = "WHISPER_CACHE_DIR")]
    pub whisper_cache_dir: Option<String>,
    /// Optional Hugging Face token for authenticated downloads.
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    pub hf_token: Option<String>,
}

impl AppConfig {
    /// Parses process arguments and environment, then validates ranges.
    pub fn load() -> Result<Self, AppError> {
        let cfg = Self::try_parse().map_err(|err| AppError::internal(err.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects values that would make the pool unusable.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.port == 0 {
            return Err(AppError::internal(format!(
                "invalid PORT={}; expected > 0",
                self.port
            )));
        }
        check_range("NUM_WORKERS", self.num_workers, 1, MAX_NUM_WORKERS)?;
        check_range("MAX_QUEUE_SIZE", self.max_queue_size, 1, usize::MAX)?;
        if self.request_timeout_secs == 0 {
            return Err(AppError::internal(
                "invalid REQUEST_TIMEOUT_SECS=0; expected > 0",
            ));
        }
        if self.ffmpeg_bin.trim().is_empty() {
            return Err(AppError::internal("FFMPEG_BIN must not be empty"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn worker_shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.worker_shutdown_grace_ms)
    }

    /// Directory where uploads are persisted until a worker deletes them.
    pub fn audio_temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Cache directory for downloaded models.
    pub fn model_cache_dir(&self) -> String {
        self.whisper_cache_dir.clone().unwrap_or_else(|| {
            format!(
                "{}/.cache/whispercpp/models",
                std::env::var("HOME").unwrap_or_else(|_| "/root".to_string())
            )
        })
    }
}

fn check_range(name: &str, value: usize, min: usize, max: usize) -> Result<(), AppError> {
    if value < min || value > max {
        return Err(AppError::internal(format!(
            "invalid {name}={value}; expected integer in range [{min}, {max}]"
        )));
    }
    Ok(())
}
