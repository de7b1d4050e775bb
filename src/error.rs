use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
            code: self.code,
        };
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Request-terminal failures of the chat gateway.
///
/// Upstream failures are not listed here: once the relay is streaming they are
/// reported in-band as an error frame, never as an HTTP status.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    Auth(String),
    #[error("Usage limit reached")]
    QuotaExceeded,
    #[error("{0}")]
    Validation(String),
    #[error("Invalid JSON body")]
    InvalidBody,
    #[error("Unsupported provider: {0}")]
    UnsupportedProvider(String),
    /// Anything uncaught before the stream opens. The message is passed
    /// through as is.
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::QuotaExceeded
            | Self::Validation(_)
            | Self::InvalidBody
            | Self::UnsupportedProvider(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(_) => "unauthorized",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Validation(_) => "invalid_request",
            Self::InvalidBody => "invalid_body",
            Self::UnsupportedProvider(_) => "unsupported_provider",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        AppError::new(err.status(), err.code(), err.to_string())
    }
}

impl From<crate::store::StoreError> for AppError {
    fn from(err: crate::store::StoreError) -> Self {
        tracing::error!("store operation failed: {err}");
        AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string())
    }
}
