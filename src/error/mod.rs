use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::connection_manager::ConnectionError;

/// Failures of the realtime core.
///
/// Authentication, transport and timeout failures are terminal for the
/// connection they happen on. Everything else is reported back to the
/// originating connection as an `error` event and the connection stays open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error(transparent)]
    Limit(#[from] ConnectionError),
}

impl GatewayError {
    /// Stable code carried in `error` events and HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) => "UNAUTHENTICATED",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::TransportFailure(_) => "TRANSPORT_FAILURE",
            Self::Timeout(_) => "TIMEOUT",
            Self::InvalidMessage(_) => "INVALID_MESSAGE",
            Self::Repository(_) => "REPOSITORY_ERROR",
            Self::Limit(_) => "CONNECTION_LIMIT",
        }
    }

    /// Whether the connection that produced this error must be closed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Unauthenticated(_) | Self::TransportFailure(_) | Self::Timeout(_) | Self::Limit(_)
        )
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Unauthorized(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidMessage(_) => StatusCode::BAD_REQUEST,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::TransportFailure(_) | Self::Repository(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Limit(_) => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

/// Errors surfaced by the HTTP API.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// Check if running in production mode (based on RUN_MODE env var)
fn is_production() -> bool {
    std::env::var("RUN_MODE")
        .map(|m| m == "production" || m == "prod")
        .unwrap_or(false)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, client_message, log_message) = match &self {
            AppError::Config(e) => {
                let log_msg = e.to_string();
                let client_msg = if is_production() {
                    "Configuration error".to_string()
                } else {
                    log_msg.clone()
                };
                (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR", client_msg, log_msg)
            }
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                msg.clone(),
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                msg.clone(),
                msg.clone(),
            ),
            AppError::Gateway(e) => {
                let log_msg = e.to_string();
                let client_msg = match e {
                    GatewayError::Repository(_) if is_production() => {
                        "Service temporarily unavailable".to_string()
                    }
                    _ => log_msg.clone(),
                };
                (e.status(), e.code(), client_msg, log_msg)
            }
            AppError::Internal(e) => {
                let log_msg = e.clone();
                let client_msg = if is_production() {
                    "Internal server error".to_string()
                } else {
                    log_msg.clone()
                };
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", client_msg, log_msg)
            }
        };

        if status.is_server_error() {
            tracing::error!(
                code = %code,
                status = %status.as_u16(),
                message = %log_message,
                "API error"
            );
        } else {
            tracing::warn!(
                code = %code,
                status = %status.as_u16(),
                message = %log_message,
                "API request rejected"
            );
        }

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: client_message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_errors() {
        assert!(GatewayError::Unauthenticated("bad token".into()).is_terminal());
        assert!(GatewayError::Timeout("handshake".into()).is_terminal());
        assert!(GatewayError::TransportFailure("closed".into()).is_terminal());
        assert!(!GatewayError::Unauthorized("conv1".into()).is_terminal());
        assert!(!GatewayError::NotFound("conv1".into()).is_terminal());
    }

    #[test]
    fn test_gateway_error_status_mapping() {
        let response = AppError::from(GatewayError::Unauthorized("conv1".into())).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = AppError::from(GatewayError::NotFound("conv1".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let limit = ConnectionError::TotalLimitExceeded { current: 10, max: 10 };
        let response = AppError::from(GatewayError::from(limit)).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
