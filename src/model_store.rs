//! Model path resolution and optional Hugging Face download.
//!
//! Workers load the model independently, so the file must exist on disk
//! before the pool starts.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use tracing::info;

use crate::config::AppConfig;
use crate::error::AppError;

const LOCK_TIMEOUT: Duration = Duration::from_secs(600);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Returns a readable local model path, downloading it first if allowed.
pub fn ensure_model_ready(cfg: &AppConfig) -> Result<String, AppError> {
    let target = model_target_path(cfg);
    if is_model_file(&target) {
        return Ok(target.to_string_lossy().into_owned());
    }

    if cfg.whisper_model.is_some() || !cfg.whisper_auto_download {
        return Err(AppError::internal(format!(
            "model file not found at {}; set WHISPER_MODEL to an existing file \
             or enable WHISPER_AUTO_DOWNLOAD",
            target.display()
        )));
    }

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            AppError::internal(format!(
                "failed to create model cache directory {}: {err}",
                parent.display()
            ))
        })?;
    }

    let _lock = DownloadLock::acquire(&lock_path_for(&target))?;
    // Another process may have finished the download while we waited.
    if !is_model_file(&target) {
        download(cfg, &target)?;
    }
    Ok(target.to_string_lossy().into_owned())
}

fn is_model_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

fn model_target_path(cfg: &AppConfig) -> PathBuf {
    match cfg.whisper_model.as_deref() {
        Some(explicit) => PathBuf::from(explicit),
        None => Path::new(&cfg.model_cache_dir()).join(&cfg.whisper_hf_filename),
    }
}

fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "model".into());
    name.push(".lock");
    target.with_file_name(name)
}

fn download(cfg: &AppConfig, target: &Path) -> Result<(), AppError> {
    let url = hf_resolve_url(&cfg.whisper_hf_repo, &cfg.whisper_hf_filename);
    info!(%url, target = %target.display(), "downloading whisper model");

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(3600))
        .build()
        .map_err(|err| AppError::internal(format!("failed to create HTTP client: {err}")))?;

    let mut request = client.get(&url);
    if let Some(token) = cfg.hf_token.as_deref() {
        request = request.bearer_auth(token);
    }

    let mut response = request
        .send()
        .map_err(|err| AppError::internal(format!("failed to download model from {url}: {err}")))?;

    match response.status() {
        status if status.is_success() => {}
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            return Err(AppError::internal(format!(
                "Hugging Face rejected {url} with {}; set HF_TOKEN",
                response.status()
            )));
        }
        StatusCode::NOT_FOUND => {
            return Err(AppError::internal(format!(
                "model not found at {url}; check WHISPER_HF_REPO and WHISPER_HF_FILENAME"
            )));
        }
        status => {
            return Err(AppError::internal(format!(
                "model download from {url} failed with HTTP status {status}"
            )));
        }
    }

    let partial = target.with_extension("part");
    let mut out = File::create(&partial)?;
    let written = std::io::copy(&mut response, &mut out)?;
    out.flush()?;
    drop(out);

    if written == 0 {
        let _ = fs::remove_file(&partial);
        return Err(AppError::internal(format!(
            "downloaded empty model file from {url}"
        )));
    }

    fs::rename(&partial, target)?;
    info!(bytes = written, target = %target.display(), "model download complete");
    Ok(())
}

fn hf_resolve_url(repo: &str, filename: &str) -> String {
    format!(
        "https://huggingface.co/{}/resolve/main/{}",
        repo.trim_matches('/'),
        filename.trim_matches('/')
    )
}

/// Sibling lock file held for the duration of a download.
struct DownloadLock {
    path: PathBuf,
}

impl DownloadLock {
    fn acquire(path: &Path) -> Result<Self, AppError> {
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "pid={}", std::process::id());
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if started.elapsed() >= LOCK_TIMEOUT {
                        return Err(AppError::internal(format!(
                            "timed out waiting for model download lock at {}",
                            path.display()
                        )));
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(err) => {
                    return Err(AppError::internal(format!(
                        "failed to acquire model download lock at {}: {err}",
                        path.display()
                    )));
                }
            }
        }
    }
}

impl Drop for DownloadLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
