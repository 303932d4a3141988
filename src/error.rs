use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Response exceeded maximum size")]
    MaximumSizeExceeded,

    #[error("Request body exceeded maximum size")]
    RequestTooLarge,

    #[error("Service not available")]
    TargetUnavailable,

    #[error("Target failed to become healthy")]
    TargetTimedOut,

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Cannot {action} service while {state}")]
    PauseBadState {
        action: &'static str,
        state: &'static str,
    },

    #[error("Invalid target address: {0}")]
    InvalidAddress(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::MaximumSizeExceeded => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::RequestTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::TargetUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::TargetTimedOut => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::PauseBadState { .. } => StatusCode::CONFLICT,
            ProxyError::InvalidAddress(_) => StatusCode::BAD_REQUEST,
            ProxyError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ProxyError::MaximumSizeExceeded => "MAXIMUM_SIZE_EXCEEDED",
            ProxyError::RequestTooLarge => "REQUEST_TOO_LARGE",
            ProxyError::TargetUnavailable => "SERVICE_UNAVAILABLE",
            ProxyError::TargetTimedOut => "TARGET_TIMED_OUT",
            ProxyError::Upstream(_) => "UPSTREAM_ERROR",
            ProxyError::PauseBadState { .. } => "PAUSE_BAD_STATE",
            ProxyError::InvalidAddress(_) => "INVALID_ADDRESS",
            ProxyError::Io(_) => "IO_ERROR",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();
        let message = self.to_string();

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
                "status": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
