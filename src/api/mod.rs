use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

mod handlers;

use crate::AppState;

/// Builds the full router. The caller attaches `state` and any outer
/// layers (CORS, body limits) in `main.rs`.
pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    let gated = Router::new()
        .route("/warmup", post(handlers::warmup))
        .route("/ask", post(handlers::ask))
        .route("/ask_stream", post(handlers::ask_stream))
        .route("/ask_trace", post(handlers::ask_trace))
        .route("/ask_batch", post(handlers::ask_batch))
        .route("/jobs", post(handlers::enqueue_job))
        .route("/jobs/stream", post(handlers::enqueue_job_stream))
        .route("/jobs/:id", get(handlers::job_status))
        .route("/jobs/:id/result", get(handlers::job_result))
        .layer(middleware::from_fn_with_state(state.clone(), require_shared_secret));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/ping", get(handlers::ping))
        .route("/devices", get(handlers::devices))
        .merge(gated)
        .layer(TraceLayer::new_for_http())
}

/// Checks `x-api-key` against the configured shared secret, when one is
/// set. No-op when `shared_secret` is unset, matching the opt-in gating
/// described for `/ask*`, `/warmup`, and `/jobs*`.
async fn require_shared_secret(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = &state.config.shared_secret else {
        return Ok(next.run(req).await);
    };
    let provided = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());
    match provided {
        Some(key) if key == expected => Ok(next.run(req).await),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}
