//! Application error types and their HTTP mapping.

use axum::response::{IntoResponse, Response};
use axum::Json;
use http::StatusCode;
use serde::Serialize;

/// Error model shared by the gateway, the worker pool, and startup code.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AppError {
    /// Malformed upload or request body; never reaches the job queue.
    #[error("{message}")]
    InvalidRequest {
        message: String,
        code: Option<String>,
    },
    /// Queue full or no live workers; rejected before enqueue.
    #[error("{0}")]
    Overloaded(String),
    /// The runtime is stopping; pending and new requests are released with this.
    #[error("server shutting down")]
    ShuttingDown,
    /// No result arrived within the gateway wait timeout.
    #[error("request timed out waiting for transcription")]
    Timeout,
    /// Audio decode or generation failure inside a worker.
    #[error("{0}")]
    Engine(String),
    /// A worker could not load or warm up its engine.
    #[error("{0}")]
    WorkerInit(String),
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// Creates a `400 Bad Request` validation error.
    pub fn invalid_request(message: impl Into<String>, code: Option<&str>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            code: code.map(ToOwned::to_owned),
        }
    }

    /// Creates a `503` admission-control rejection.
    pub fn overloaded(message: impl Into<String>) -> Self {
        Self::Overloaded(message.into())
    }

    /// Creates a per-item engine failure.
    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine(message.into())
    }

    /// Creates a fatal worker initialization failure.
    pub fn worker_init(message: impl Into<String>) -> Self {
        Self::WorkerInit(message.into())
    }

    /// Creates a generic internal server error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// HTTP status used when this error is rendered.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Overloaded(_) | Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Engine(_) | Self::WorkerInit(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn code(&self) -> Option<String> {
        match self {
            Self::InvalidRequest { code, .. } => code.clone(),
            Self::Overloaded(_) => Some("overloaded".to_string()),
            Self::ShuttingDown => Some("shutting_down".to_string()),
            Self::Timeout => Some("timeout".to_string()),
            Self::Engine(_) => Some("transcription_failed".to_string()),
            Self::WorkerInit(_) => Some("worker_init_failed".to_string()),
            Self::Internal(_) => Some("internal_error".to_string()),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::internal(format!("i/o error: {err}"))
    }
}

#[derive(Debug, Serialize)]
struct ErrorPayload {
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = match &self {
            Self::Engine(message) => format!("Transcription failed: {message}"),
            other => other.to_string(),
        };
        let payload = ErrorPayload {
            detail,
            code: self.code(),
        };

        (status, Json(payload)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_documented_status_codes() {
        assert_eq!(
            AppError::invalid_request("bad", None).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::overloaded("full").status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::ShuttingDown.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(AppError::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            AppError::engine("decode failed").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
