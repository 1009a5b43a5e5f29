//! JSON error responses.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::warn;

use crate::engine::EngineError;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    kind: &'static str,
    message: String,
}

/// Error returned by control-plane handlers.
#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    BadRequest(String),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self::Engine(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::BadRequest(e.body_text())
    }
}

/// HTTP status for an engine error kind.
pub fn status_for(kind: &str) -> StatusCode {
    match kind {
        "validation" | "invalid_topology" | "invalid_extraction" | "pin_required" | "config" => {
            StatusCode::BAD_REQUEST
        }
        "unknown_model" | "unknown_device" | "unknown_request" => StatusCode::NOT_FOUND,
        "no_fit" | "capacity_exhausted" | "insufficient_capacity" | "occupied" | "not_held"
        | "duplicate_request" => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (kind, message) = match self {
            Self::Engine(e) => (e.kind(), e.to_string()),
            Self::BadRequest(message) => ("validation", message),
        };
        let status = status_for(kind);
        if status.is_server_error() {
            warn!(kind, %message, "Request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: ErrorDetail { kind, message },
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_status_codes() {
        assert_eq!(status_for("invalid_topology"), StatusCode::BAD_REQUEST);
        assert_eq!(status_for("no_fit"), StatusCode::CONFLICT);
        assert_eq!(status_for("capacity_exhausted"), StatusCode::CONFLICT);
        assert_eq!(status_for("not_held"), StatusCode::CONFLICT);
        assert_eq!(status_for("unknown_model"), StatusCode::NOT_FOUND);
        assert_eq!(status_for("eviction_failed"), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
