//! HTTP handlers: thin adapters from axum extractors onto the engine.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};

use crate::cache::fingerprint;
use crate::dispatcher::{build_payload, AskRequest};
use crate::errors::GatewayError;
use crate::jobs::JobOutcome;
use crate::AppState;

type AppResult<T> = Result<T, GatewayError>;

fn device_states(state: &AppState) -> Value {
    let now = Instant::now();
    let entries: Vec<Value> = state
        .selector
        .unique_devices()
        .iter()
        .map(|d| {
            json!({
                "key": d.key(),
                "host": d.config.host,
                "port": d.config.port,
                "healthy": d.is_healthy(),
                "reason": d.reason(),
                "inflight": d.inflight(),
                "circuit_open": d.circuit_open(now),
            })
        })
        .collect();
    Value::Array(entries)
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let phones: Vec<Value> = state
        .selector
        .unique_devices()
        .iter()
        .map(|d| {
            json!({
                "host": d.config.host,
                "port": d.config.port,
                "model": d.config.default_model,
                "healthy": d.is_healthy(),
                "reason": d.reason(),
                "inflight": d.inflight(),
            })
        })
        .collect();
    Json(json!({ "phones": phones }))
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

pub async fn ping(State(state): State<Arc<AppState>>) -> Json<Value> {
    let timeout = Duration::from_secs(state.config.health_probe_timeout_secs);
    let probes = state.selector.unique_devices().iter().map(|d| {
        let client = state.http_client.clone();
        let host = d.config.host.clone();
        let port = d.config.port;
        let url = format!("{}/api/tags", d.config.base_url());
        async move {
            let start = Instant::now();
            let result = client.get(&url).timeout(timeout).send().await;
            let ms = start.elapsed().as_millis();
            match result {
                Ok(resp) => json!({
                    "host": host, "port": port,
                    "ok": resp.status().is_success(),
                    "status": resp.status().as_u16(),
                    "ms": ms,
                }),
                Err(e) => json!({
                    "host": host, "port": port,
                    "ok": false,
                    "error": e.to_string(),
                    "ms": ms,
                }),
            }
        }
    });
    let results = futures::future::join_all(probes).await;
    Json(Value::Array(results))
}

pub async fn devices(State(state): State<Arc<AppState>>) -> Json<Value> {
    let data: Vec<Value> = state
        .selector
        .unique_devices()
        .iter()
        .map(|d| {
            let mut merged = state
                .registry
                .get_by_key(d.key())
                .unwrap_or_else(|| json!({}));
            if let Some(obj) = merged.as_object_mut() {
                obj.insert("healthy".into(), json!(d.is_healthy()));
                obj.insert("reason".into(), json!(d.reason()));
                obj.insert("inflight".into(), json!(d.inflight()));
                obj.insert("models".into(), json!(d.discovered_models()));
            }
            merged
        })
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

#[derive(Serialize)]
struct WarmupResult {
    warmed: usize,
    total: usize,
}

pub async fn warmup(State(state): State<Arc<AppState>>) -> Json<WarmupResult> {
    let devices = state.selector.unique_devices().to_vec();
    let total = devices.len();
    let attempts = devices.iter().map(|d| {
        let dispatcher = state.dispatcher.clone();
        let d = d.clone();
        async move {
            let payload = build_payload(
                &AskRequest {
                    prompt: "ping".to_string(),
                    system: None,
                    model: None,
                    options: json!({}),
                    priority: 5,
                },
                d.config.default_model.as_deref(),
                false,
            );
            dispatcher.post(&d, &payload).await.is_ok()
        }
    });
    let results = futures::future::join_all(attempts).await;
    let warmed = results.into_iter().filter(|ok| *ok).count();
    Json(WarmupResult { warmed, total })
}

/// Shared core for `/ask` and `/ask_batch`: cache lookup, then up to
/// `unique device count` selection attempts.
async fn ask_one(state: &AppState, req: &AskRequest) -> AppResult<Value> {
    let device_count = state.selector.unique_devices().len().max(1);
    let tentative = state.selector.pick();
    let effective_model = req
        .model
        .clone()
        .or_else(|| tentative.config.default_model.clone());
    let cache_key = fingerprint(&req.prompt, &req.system, &effective_model, &req.options);

    if let Some(cache) = &state.cache {
        if let Some(hit) = cache.get(&cache_key) {
            return Ok(hit);
        }
    }

    let mut last_error = String::new();
    let mut device = tentative;
    for attempt in 0..device_count {
        if attempt > 0 {
            device = state.selector.pick();
        }
        let payload = build_payload(req, device.config.default_model.as_deref(), false);
        match state.dispatcher.post(&device, &payload).await {
            Ok(value) => {
                if let Some(cache) = &state.cache {
                    cache.set(cache_key, value.clone());
                }
                return Ok(value);
            }
            Err(e) => last_error = e.to_string(),
        }
    }

    Err(GatewayError::NoEligibleDevice {
        last_error,
        states: device_states(state),
    })
}

pub async fn ask(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AskRequest>,
) -> AppResult<Json<Value>> {
    req.validate()?;
    ask_one(&state, &req).await.map(Json)
}

pub async fn ask_batch(
    State(state): State<Arc<AppState>>,
    Json(reqs): Json<Vec<AskRequest>>,
) -> Json<Value> {
    let results = futures::future::join_all(reqs.iter().map(|req| async {
        match req.validate() {
            Err(e) => json!({"ok": false, "data": e.to_string()}),
            Ok(()) => match ask_one(&state, req).await {
                Ok(data) => json!({"ok": true, "data": data}),
                Err(e) => json!({"ok": false, "data": e.to_string()}),
            },
        }
    }))
    .await;
    Json(Value::Array(results))
}

pub async fn ask_stream(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AskRequest>,
) -> AppResult<Response> {
    req.validate()?;
    let device = state.selector.pick();
    let payload = build_payload(&req, device.config.default_model.as_deref(), true);
    let chunks = state
        .dispatcher
        .stream(&device, payload)
        .await
        .map_err(|e| GatewayError::UpstreamUnavailable(e.to_string()))?;
    let body = Body::from_stream(chunks.map(Ok::<_, std::io::Error>));
    Ok(Response::builder()
        .header("content-type", "application/octet-stream")
        .body(body)
        .expect("static response headers are valid"))
}

/// Diagnostic variant of `ask_stream`: narrates device count, selection,
/// and model as plain-text header lines ahead of the raw backend stream.
pub async fn ask_trace(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AskRequest>,
) -> AppResult<Response> {
    req.validate()?;
    let device_count = state.selector.unique_devices().len();
    let device = state.selector.pick();
    let model = req
        .model
        .clone()
        .or_else(|| device.config.default_model.clone())
        .unwrap_or_default();
    let payload = build_payload(&req, device.config.default_model.as_deref(), true);
    let chunks = state
        .dispatcher
        .stream(&device, payload)
        .await
        .map_err(|e| GatewayError::UpstreamUnavailable(e.to_string()))?;

    let header = futures::stream::iter(vec![
        bytes::Bytes::from(format!("# {device_count} device(s) known\n")),
        bytes::Bytes::from(format!(
            "# picked {}:{} model={}\n",
            device.config.host, device.config.port, model
        )),
    ]);
    let body = Body::from_stream(header.chain(chunks).map(Ok::<_, std::io::Error>));
    Ok(Response::builder()
        .header("content-type", "text/plain")
        .body(body)
        .expect("static response headers are valid"))
}

pub async fn enqueue_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AskRequest>,
) -> AppResult<Json<Value>> {
    let job_id = state.jobs.enqueue(req).await?;
    Ok(Json(json!({ "job_id": job_id, "queued": true })))
}

pub async fn enqueue_job_stream(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AskRequest>,
) -> AppResult<Response> {
    let job_id = state.jobs.enqueue_stream(req).await?;
    let Some(rx) = state.jobs.take_stream(&job_id).await else {
        return Ok((StatusCode::INTERNAL_SERVER_ERROR, "stream unavailable").into_response());
    };
    let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
    let body = Body::from_stream(stream.map(Ok::<_, std::io::Error>));
    Ok(Response::builder()
        .header("content-type", "application/octet-stream")
        .body(body)
        .expect("static response headers are valid"))
}

pub async fn job_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> AppResult<Json<Value>> {
    let view = state.jobs.status(&job_id).await.ok_or(GatewayError::JobNotFound)?;
    Ok(Json(serde_json::to_value(view).expect("JobView always serializes")))
}

pub async fn job_result(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> AppResult<Json<Value>> {
    match state.jobs.result(&job_id).await {
        None => Err(GatewayError::JobNotFound),
        Some(JobOutcome::Done(value)) => Ok(Json(value)),
        Some(JobOutcome::Pending(status)) => Err(GatewayError::JobNotDone { status }),
    }
}
