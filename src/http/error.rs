//! HTTP error envelope
//!
//! Every error response is `{"error": {"code", "message"}}` with the
//! status implied by the error kind. Internal-class messages are
//! masked in production and included verbatim in development.

use crate::config::Environment;
use crate::error::Error;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

/// An [`Error`] ready for serialization, with the environment's
/// masking policy applied.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    #[must_use]
    pub fn new(e: &Error, environment: Environment) -> Self {
        let status = status_for(e);
        let code = e.code();

        let message = if status.is_server_error() {
            error!("request failed: {e}");
            if environment.is_production() {
                "internal error".to_string()
            } else {
                e.to_string()
            }
        } else {
            e.to_string()
        };

        Self {
            status,
            code,
            message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                details: None,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

const fn status_for(e: &Error) -> StatusCode {
    match e {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::Authentication(_) => StatusCode::UNAUTHORIZED,
        Error::Authorization(_) => StatusCode::FORBIDDEN,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::RateLimit(_) => StatusCode::TOO_MANY_REQUESTS,
        Error::Pop3 { .. } => StatusCode::BAD_GATEWAY,
        Error::Encryption(_) | Error::Database(_) | Error::Io(_) | Error::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
