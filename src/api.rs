//! HTTP surface of the transcription service.
//!
//! This module owns request parsing, input validation, and response
//! rendering; every accepted upload is handed to the [`ServerRuntime`].

use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::audio::AudioFormat;
use crate::error::AppError;
use crate::runtime::{ServerRuntime, TranscriptionResponse, Upload};

/// Shared state injected into all route handlers.
pub struct AppState {
    pub runtime: Arc<ServerRuntime>,
}

impl AppState {
    pub fn new(runtime: Arc<ServerRuntime>) -> Self {
        Self { runtime }
    }
}

/// Builds the Axum router for all public endpoints.
pub fn build_router(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ping", get(ping))
        .route("/transcribe", post(transcribe))
        .route("/invocations", post(invocations))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

/// Serves the router until `signal` resolves, then shuts the pool down.
///
/// Pending callers are failed as soon as the signal fires so in-flight
/// handlers answer 503 and the listener can drain; the blocking worker
/// shutdown runs after the listener has closed.
pub async fn serve<F>(
    listener: TcpListener,
    runtime: Arc<ServerRuntime>,
    max_upload_bytes: usize,
    signal: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(Arc::new(AppState::new(runtime.clone())), max_upload_bytes);
    let draining = runtime.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            signal.await;
            info!(
                pending_requests = draining.pending_requests(),
                "shutdown requested; draining connections"
            );
            draining.begin_shutdown();
        })
        .await;

    let stopping = runtime.clone();
    if let Err(err) = tokio::task::spawn_blocking(move || stopping.stop()).await {
        warn!(error = %err, "worker pool shutdown task failed");
    }
    served
}

/// Pool status (`GET /health`).
pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let runtime = &state.runtime;
    let alive = runtime.workers_alive();
    Json(json!({
        "status": if alive > 0 { "healthy" } else { "degraded" },
        "workers_alive": alive,
        "workers_total": runtime.workers_total(),
        "pending_requests": runtime.pending_requests(),
        "queued_jobs": runtime.queued_jobs(),
        "workers": runtime.worker_snapshots(),
    }))
}

/// Container health check (`GET /ping`): 200 while any worker is alive.
pub async fn ping(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, AppError> {
    let alive = state.runtime.workers_alive();
    if alive == 0 {
        return Err(AppError::overloaded("No workers available"));
    }
    Ok(Json(json!({
        "status": "ok",
        "workers_alive": alive,
        "workers_total": state.runtime.workers_total(),
    })))
}

/// Multipart upload (`POST /transcribe`) with `audio`, `context`, `language`.
pub async fn transcribe(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<TranscriptionResponse>, AppError> {
    let upload = parse_transcribe_form(&mut multipart).await?;
    Ok(Json(state.runtime.transcribe(upload).await?))
}

/// Inference endpoint (`POST /invocations`) taking raw audio or JSON with
/// base64 audio.
pub async fn invocations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let upload = if content_type.contains("application/json") {
        parse_json_invocation(&body)?
    } else {
        if body.is_empty() {
            return Err(AppError::invalid_request(
                "Empty request body",
                Some("empty_body"),
            ));
        }
        Upload {
            bytes: body.to_vec(),
            format: AudioFormat::from_content_type(&content_type),
            context: None,
            language: None,
        }
    };

    let response = state.runtime.transcribe(upload).await?;
    Ok((StatusCode::OK, Json(response)).into_response())
}

#[derive(Debug, Deserialize)]
struct InvocationPayload {
    audio_base64: Option<String>,
    audio: Option<String>,
    audio_format: Option<String>,
    context: Option<String>,
    language: Option<String>,
}

fn parse_json_invocation(body: &[u8]) -> Result<Upload, AppError> {
    let value: serde_json::Value = serde_json::from_slice(body).map_err(invalid_json)?;
    if !value.is_object() {
        return Err(AppError::invalid_request(
            "JSON body must be an object",
            Some("invalid_json"),
        ));
    }
    let payload: InvocationPayload = serde_json::from_value(value).map_err(invalid_json)?;

    let encoded = payload
        .audio_base64
        .filter(|v| !v.is_empty())
        .or(payload.audio.filter(|v| !v.is_empty()))
        .ok_or_else(|| {
            AppError::invalid_request(
                "Missing 'audio_base64' (or 'audio') in JSON body",
                Some("missing_audio"),
            )
        })?;

    let format = match payload.audio_format.as_deref() {
        Some(raw) => AudioFormat::parse(raw)?,
        None => AudioFormat::Wav,
    };

    let bytes = BASE64.decode(encoded.trim()).map_err(|err| {
        AppError::invalid_request(format!("Invalid base64 audio: {err}"), Some("invalid_base64"))
    })?;

    Ok(Upload {
        bytes,
        format,
        context: payload.context,
        language: non_empty(payload.language),
    })
}

fn invalid_json(err: serde_json::Error) -> AppError {
    AppError::invalid_request(format!("Invalid JSON: {err}"), Some("invalid_json"))
}

/// Parses and validates multipart form fields for `/transcribe`.
async fn parse_transcribe_form(multipart: &mut Multipart) -> Result<Upload, AppError> {
    let mut audio: Option<(AudioFormat, Vec<u8>)> = None;
    let mut context: Option<String> = None;
    let mut language: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        AppError::invalid_request(
            format!("invalid multipart body: {err}"),
            Some("invalid_multipart"),
        )
    })? {
        let Some(name) = field.name().map(ToOwned::to_owned) else {
            continue;
        };

        match name.as_str() {
            "audio" => {
                let filename = field.file_name().unwrap_or_default().to_owned();
                let format = AudioFormat::from_filename(&filename)?;
                let bytes = field.bytes().await.map_err(|err| {
                    AppError::invalid_request(
                        format!("failed to read audio bytes: {err}"),
                        Some("invalid_multipart"),
                    )
                })?;
                audio = Some((format, bytes.to_vec()));
            }
            "context" => {
                context = Some(field.text().await.map_err(|err| {
                    AppError::invalid_request(
                        format!("invalid context field: {err}"),
                        Some("invalid_multipart"),
                    )
                })?);
            }
            "language" => {
                language = non_empty(Some(field.text().await.map_err(|err| {
                    AppError::invalid_request(
                        format!("invalid language field: {err}"),
                        Some("invalid_multipart"),
                    )
                })?));
            }
            _ => {}
        }
    }

    let (format, bytes) = audio.ok_or_else(|| {
        AppError::invalid_request("missing required multipart field: audio", Some("missing_audio"))
    })?;
    if bytes.is_empty() {
        return Err(AppError::invalid_request(
            "uploaded file is empty",
            Some("empty_file"),
        ));
    }

    Ok(Upload {
        bytes,
        format,
        context,
        language,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use base64::Engine as _;
    use serde_json::Value;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tower::ServiceExt;

    use super::{build_router, serve, AppState, BASE64};
    use crate::audio::wav_bytes;
    use crate::runtime::ServerRuntime;
    use crate::testing::{eventually, files_in, options, stop, ScriptedFactory};

    const BOUNDARY: &str = "X-BOUNDARY";

    fn app(runtime: &Arc<ServerRuntime>) -> axum::Router {
        build_router(Arc::new(AppState::new(runtime.clone())), 10 * 1024 * 1024)
    }

    async fn parse_json_response(res: axum::response::Response) -> Value {
        let bytes = to_bytes(res.into_body(), 1024 * 1024)
            .await
            .expect("body bytes");
        serde_json::from_slice(&bytes).expect("json body")
    }

    fn multipart_body(filename: &str, audio: &[u8], context: Option<&str>) -> Vec<u8> {
        let mut body = format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"audio\"; filename=\"{filename}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(audio);
        body.extend_from_slice(b"\r\n");
        if let Some(context) = context {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\n\
                     Content-Disposition: form-data; name=\"context\"\r\n\r\n{context}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn transcribe_request(body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .uri("/transcribe")
            .method("POST")
            .header(
                "Content-Type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .expect("request")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn transcribe_returns_transcript_and_timing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (factory, _gates) = ScriptedFactory::ready();
        let runtime = ServerRuntime::start(options(dir.path(), 1), factory).expect("start");

        let wav = wav_bytes(16_000, &[0; 1_600]);
        let res = app(&runtime)
            .oneshot(transcribe_request(multipart_body("clip.WAV", &wav, Some("hello there"))))
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::OK);

        let payload = parse_json_response(res).await;
        assert_eq!(payload["transcription"], "hello there");
        assert!(payload["request_id"].is_string());
        assert_eq!(payload["timing"]["worker_id"], 0);
        assert!(payload["timing"]["generate_wall_ms"].is_number());
        assert!(payload["timing"]["timeline"]["done"].is_number());
        assert!(payload["timing"]["http_wait_ms"].is_number());
        stop(&runtime).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn transcribe_rejects_unsupported_extension_before_enqueue() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (factory, _gates) = ScriptedFactory::ready();
        let runtime = ServerRuntime::start(options(dir.path(), 1), factory).expect("start");

        let res = app(&runtime)
            .oneshot(transcribe_request(multipart_body("clip.mp3", b"ID3", None)))
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let payload = parse_json_response(res).await;
        assert_eq!(payload["code"], "invalid_file_format");
        assert_eq!(files_in(dir.path()), 0);
        stop(&runtime).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn malformed_webm_maps_to_500_and_cleans_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (factory, _gates) = ScriptedFactory::ready();
        let runtime = ServerRuntime::start(options(dir.path(), 1), factory).expect("start");

        let res = app(&runtime)
            .oneshot(transcribe_request(multipart_body("rec.webm", b"garbage", None)))
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let payload = parse_json_response(res).await;
        let detail = payload["detail"].as_str().expect("detail");
        assert!(detail.starts_with("Transcription failed: audio decode failed"));
        assert_eq!(files_in(dir.path()), 0);
        assert_eq!(runtime.pending_requests(), 0);
        stop(&runtime).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn invocations_accepts_json_base64() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (factory, _gates) = ScriptedFactory::ready();
        let runtime = ServerRuntime::start(options(dir.path(), 1), factory).expect("start");

        let body = serde_json::json!({
            "audio": BASE64.encode(wav_bytes(16_000, &[0; 800])),
            "audio_format": "wav",
            "context": "from json",
            "language": "en",
        });
        let req = Request::builder()
            .uri("/invocations")
            .method("POST")
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request");

        let res = app(&runtime).oneshot(req).await.expect("response");
        assert_eq!(res.status(), StatusCode::OK);
        let payload = parse_json_response(res).await;
        assert_eq!(payload["transcription"], "from json");
        stop(&runtime).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn invocations_accepts_raw_wav_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (factory, _gates) = ScriptedFactory::ready();
        let runtime = ServerRuntime::start(options(dir.path(), 1), factory).expect("start");

        let req = Request::builder()
            .uri("/invocations")
            .method("POST")
            .header("Content-Type", "audio/wav")
            .body(Body::from(wav_bytes(16_000, &[0; 800])))
            .expect("request");

        let res = app(&runtime).oneshot(req).await.expect("response");
        assert_eq!(res.status(), StatusCode::OK);
        let payload = parse_json_response(res).await;
        assert_eq!(payload["transcription"], "");
        stop(&runtime).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn invocations_validates_json_payloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (factory, _gates) = ScriptedFactory::ready();
        let runtime = ServerRuntime::start(options(dir.path(), 1), factory).expect("start");

        let cases = [
            ("{not json", "invalid_json"),
            ("[1, 2]", "invalid_json"),
            ("{\"context\": \"x\"}", "missing_audio"),
            ("{\"audio\": \"AAAA\", \"audio_format\": \"mp3\"}", "invalid_audio_format"),
            ("{\"audio_base64\": \"***\"}", "invalid_base64"),
        ];
        for (body, code) in cases {
            let req = Request::builder()
                .uri("/invocations")
                .method("POST")
                .header("Content-Type", "application/json")
                .body(Body::from(body))
                .expect("request");
            let res = app(&runtime).oneshot(req).await.expect("response");
            assert_eq!(res.status(), StatusCode::BAD_REQUEST, "body {body}");
            let payload = parse_json_response(res).await;
            assert_eq!(payload["code"], code, "body {body}");
        }

        let req = Request::builder()
            .uri("/invocations")
            .method("POST")
            .header("Content-Type", "application/octet-stream")
            .body(Body::empty())
            .expect("request");
        let res = app(&runtime).oneshot(req).await.expect("response");
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        stop(&runtime).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn health_and_ping_track_live_workers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (factory, _gates) = ScriptedFactory::failing_on(vec![1]);
        let runtime = ServerRuntime::start(options(dir.path(), 2), factory).expect("start");
        let runtime_ref = runtime.clone();
        assert!(eventually(Duration::from_secs(2), || runtime_ref.workers_alive() == 1).await);

        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .expect("request");
        let res = app(&runtime).oneshot(req).await.expect("response");
        assert_eq!(res.status(), StatusCode::OK);
        let payload = parse_json_response(res).await;
        assert_eq!(payload["status"], "healthy");
        assert_eq!(payload["workers_alive"], 1);
        assert_eq!(payload["workers_total"], 2);
        assert_eq!(payload["workers"][1]["state"], "terminated");

        let req = Request::builder()
            .uri("/ping")
            .body(Body::empty())
            .expect("request");
        let res = app(&runtime).oneshot(req).await.expect("response");
        assert_eq!(res.status(), StatusCode::OK);

        stop(&runtime).await;

        let req = Request::builder()
            .uri("/ping")
            .body(Body::empty())
            .expect("request");
        let res = app(&runtime).oneshot(req).await.expect("response");
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .expect("request");
        let res = app(&runtime).oneshot(req).await.expect("response");
        let payload = parse_json_response(res).await;
        assert_eq!(payload["status"], "degraded");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shutdown_signal_answers_in_flight_requests_with_503() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (factory, mut gates) = ScriptedFactory::ready();
        let runtime = ServerRuntime::start(options(dir.path(), 1), factory).expect("start");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (signal_tx, signal_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, runtime.clone(), 1024 * 1024, async move {
            let _ = signal_rx.await;
        }));

        let body = serde_json::json!({
            "audio": BASE64.encode(wav_bytes(16_000, &[0; 800])),
            "context": "hold",
        });
        let client = tokio::spawn(async move {
            reqwest::Client::new()
                .post(format!("http://{addr}/invocations"))
                .header("Content-Type", "application/json")
                .body(body.to_string())
                .send()
                .await
        });

        let runtime_ref = runtime.clone();
        assert!(eventually(Duration::from_secs(2), || runtime_ref.pending_requests() == 1).await);

        signal_tx.send(()).expect("signal");
        // The worker stays busy until the hold gate is released below.
        let res = tokio::time::timeout(Duration::from_secs(2), client)
            .await
            .expect("answered while the worker is still busy")
            .expect("client task")
            .expect("http response");
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
        let payload: Value = serde_json::from_str(&res.text().await.expect("body")).expect("json");
        assert_eq!(payload["code"], "shutting_down");

        gates.hold.take();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server stopped")
            .expect("server task")
            .expect("serve");
        assert!(!runtime.is_accepting());
        assert_eq!(runtime.pending_requests(), 0);
        assert_eq!(runtime.workers_alive(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn requests_after_shutdown_get_503() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (factory, _gates) = ScriptedFactory::ready();
        let runtime = ServerRuntime::start(options(dir.path(), 1), factory).expect("start");
        stop(&runtime).await;

        let wav = wav_bytes(16_000, &[0; 160]);
        let res = app(&runtime)
            .oneshot(transcribe_request(multipart_body("a.wav", &wav, None)))
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
        let payload = parse_json_response(res).await;
        assert_eq!(payload["code"], "shutting_down");
    }
}
