//! GPU discovery.

use std::process::{Command, Stdio};

use tracing::{debug, info};

use crate::config::AppConfig;
use crate::error::AppError;

/// Returns the number of usable GPUs, honouring `NUM_GPUS` when set.
pub fn detect_gpu_count(cfg: &AppConfig) -> usize {
    if let Some(count) = cfg.num_gpus {
        info!(gpu_count = count, "using configured gpu count");
        return count;
    }

    match Command::new("nvidia-smi")
        .args(["--query-gpu=index", "--format=csv,noheader"])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
    {
        Ok(output) if output.status.success() => {
            let count = count_gpu_lines(&String::from_utf8_lossy(&output.stdout));
            info!(gpu_count = count, "detected gpus with nvidia-smi");
            count
        }
        Ok(output) => {
            debug!(status = %output.status, "nvidia-smi reported failure");
            0
        }
        Err(err) => {
            debug!(error = %err, "nvidia-smi unavailable");
            0
        }
    }
}

/// Caps the configured worker count at the GPU count; zero GPUs is fatal.
pub fn plan_worker_count(configured: usize, gpu_count: usize) -> Result<usize, AppError> {
    if gpu_count == 0 {
        return Err(AppError::worker_init(
            "no GPUs detected; set NUM_GPUS to override discovery",
        ));
    }
    Ok(configured.min(gpu_count))
}

fn count_gpu_lines(stdout: &str) -> usize {
    stdout.lines().filter(|line| !line.trim().is_empty()).count()
}
