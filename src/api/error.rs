//! Error responses for the REST surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::ajam::AjamError;
use crate::dispatch::DispatchError;

/// Errors returned by REST handlers.
///
/// Serialized as `{"error_id": .., "message": .., "details": {..}}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Dispatch(DispatchError::Unsupported(_)) => StatusCode::NOT_IMPLEMENTED,
            ApiError::Dispatch(DispatchError::Protocol { .. }) => StatusCode::BAD_REQUEST,
            ApiError::Dispatch(DispatchError::Gateway(AjamError::Unreachable { .. })) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Dispatch(DispatchError::Gateway(AjamError::HttpStatus { .. })) => {
                StatusCode::BAD_GATEWAY
            }
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn error_id(&self) -> &'static str {
        match self {
            ApiError::Dispatch(DispatchError::Unsupported(_)) => "not-supported",
            ApiError::Dispatch(DispatchError::Protocol { .. }) => "ami-error",
            ApiError::Dispatch(DispatchError::Gateway(AjamError::Unreachable { .. })) => {
                "ajam-unreachable"
            }
            ApiError::Dispatch(DispatchError::Gateway(AjamError::HttpStatus { .. })) => {
                "ajam-http-error"
            }
            ApiError::BadRequest(_) => "invalid-data",
        }
    }

    fn details(&self) -> Value {
        match self {
            ApiError::Dispatch(DispatchError::Unsupported(action)) => json!({ "action": action }),
            ApiError::Dispatch(DispatchError::Gateway(AjamError::Unreachable { url, cause })) => {
                json!({ "url": url, "cause": cause })
            }
            ApiError::Dispatch(DispatchError::Gateway(AjamError::HttpStatus { url, status })) => {
                json!({ "url": url, "status": status })
            }
            _ => json!({}),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        } else {
            warn!(error = %self, "Request rejected");
        }
        let body = json!({
            "error_id": self.error_id(),
            "message": self.to_string(),
            "details": self.details(),
        });
        (status, Json(body)).into_response()
    }
}
