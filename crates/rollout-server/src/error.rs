use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use rollout_engine::TriggerError;
use rollout_store::{ErrorKind, LogError};

/// Error returned by request handlers, mapped onto status codes.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("not found")]
    NotFound,

    #[error("shutting down")]
    ShuttingDown,

    /// Storage failure while serving a read.
    #[error("{0}")]
    Storage(String),

    /// Trigger acceptance failed; `stack` carries the diagnostic trail.
    #[error("{message}")]
    Internal { message: String, stack: String },
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::Storage(_) | Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            Self::NotFound => status.into_response(),
            Self::Internal { message, stack } => {
                (status, Json(json!({ "message": message, "stack": stack }))).into_response()
            }
            other => (status, Json(json!({ "message": other.to_string() }))).into_response(),
        }
    }
}

impl From<LogError> for ApiError {
    fn from(e: LogError) -> Self {
        match e.kind() {
            ErrorKind::InvalidRange => Self::BadRequest(e.to_string()),
            ErrorKind::IoFailure => Self::Storage(e.to_string()),
        }
    }
}

impl From<TriggerError> for ApiError {
    fn from(e: TriggerError) -> Self {
        match e {
            TriggerError::UnknownService(_) => Self::NotFound,
            TriggerError::ShuttingDown => Self::ShuttingDown,
            TriggerError::Launch { source, .. } => Self::Internal {
                message: source.message(),
                stack: source.stack().to_string(),
            },
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}
