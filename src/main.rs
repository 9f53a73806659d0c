mod api;
mod audio;
mod config;
mod correlator;
mod engine;
mod error;
mod gpu;
mod job;
mod model_store;
mod pending;
mod queue;
mod runtime;
mod worker;

#[cfg(test)]
mod testing;

use tracing::info;

use crate::config::AppConfig;
use crate::engine::build_engine_factory;
use crate::gpu::detect_gpu_count;
use crate::runtime::{RuntimeOptions, ServerRuntime};

/// Math libraries get one thread per worker unless overridden.
const CPU_CAP_VARS: [(&str, &str); 7] = [
    ("OMP_NUM_THREADS", "1"),
    ("MKL_NUM_THREADS", "1"),
    ("OPENBLAS_NUM_THREADS", "1"),
    ("NUMEXPR_NUM_THREADS", "1"),
    ("VECLIB_MAXIMUM_THREADS", "1"),
    ("NUMBA_NUM_THREADS", "1"),
    ("TOKENIZERS_PARALLELISM", "false"),
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set before the runtime spawns any threads.
    for (key, value) in CPU_CAP_VARS {
        if std::env::var_os(key).is_none() {
            std::env::set_var(key, value);
        }
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(serve())
}

async fn serve() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "whisper_gpu_pool_server=info,axum=info".into()),
        )
        .compact()
        .init();

    let cfg = AppConfig::load()?;
    let gpu_count = detect_gpu_count(&cfg);
    let options = RuntimeOptions::from_config(&cfg, gpu_count)?;

    // Model provisioning may download over blocking HTTP.
    let factory = {
        let cfg = cfg.clone();
        tokio::task::spawn_blocking(move || build_engine_factory(&cfg)).await??
    };
    let runtime = ServerRuntime::start(options, factory)?;

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tokio::task::spawn_blocking(move || runtime.stop()).await?;
            return Err(err.into());
        }
    };

    info!(
        host = %cfg.host,
        port = cfg.port,
        workers = runtime.workers_total(),
        gpus = gpu_count,
        max_queue_size = cfg.max_queue_size,
        "starting whisper-gpu-pool-server"
    );

    let served = api::serve(
        listener,
        runtime.clone(),
        cfg.max_upload_bytes,
        shutdown_signal(),
    )
    .await;
    info!(
        late_results_discarded = runtime.late_results_discarded(),
        "server stopped"
    );
    served?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            let _ = sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received interrupt"),
        _ = terminate => info!("received terminate signal"),
    }
}
