//! The client-facing error taxonomy and its HTTP mapping.
//!
//! Internal failures that never reach a client (health probe errors,
//! registry flush errors) are logged at their origin instead of being
//! wrapped here — see the module docs on `health.rs` and `registry.rs`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::jobs::JobStatus;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no eligible device: {last_error}")]
    NoEligibleDevice {
        last_error: String,
        states: serde_json::Value,
    },

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("job not found")]
    JobNotFound,

    #[error("job not done")]
    JobNotDone { status: JobStatus },

    #[error("unauthorized")]
    Unauthorized,

    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            GatewayError::NoEligibleDevice { last_error, states } => {
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({
                        "error": {
                            "code": "no_eligible_device",
                            "message": last_error,
                            "states": states,
                        }
                    })),
                )
                    .into_response();
            }
            GatewayError::UpstreamUnavailable(e) => {
                (StatusCode::BAD_GATEWAY, "upstream_unavailable", e.clone())
            }
            GatewayError::InvalidRequest(e) => {
                (StatusCode::BAD_REQUEST, "invalid_request", e.clone())
            }
            GatewayError::JobNotFound => (
                StatusCode::NOT_FOUND,
                "job_not_found",
                "no job with that id".to_string(),
            ),
            GatewayError::JobNotDone { status } => (
                StatusCode::ACCEPTED,
                "job_not_done",
                format!("job is {status:?}"),
            ),
            GatewayError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "missing or invalid api key".to_string(),
            ),
            GatewayError::ConfigError(e) => {
                tracing::error!(error = %e, "configuration error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "config_error",
                    "internal configuration error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));
        (status, body).into_response()
    }
}
