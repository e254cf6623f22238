//! Builds backend payloads and forwards them: retrying non-stream POSTs
//! with exponential backoff, and opening streaming passthroughs whose retry
//! boundary stops the instant response headers arrive.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::AppConfig;
use crate::errors::GatewayError;
use crate::metrics::Metrics;
use crate::registry::DeviceRegistry;
use crate::selector::{Device, InflightGuard};

/// A client-submitted chat request. `options` is forwarded to the backend
/// verbatim.
#[derive(Debug, Clone, Deserialize)]
pub struct AskRequest {
    pub prompt: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_options")]
    pub options: Value,
    #[serde(default = "default_priority")]
    pub priority: i64,
}

fn default_options() -> Value {
    json!({})
}

fn default_priority() -> i64 {
    5
}

impl AskRequest {
    /// Every entry point that accepts a request body (`/ask*`, `/jobs*`)
    /// must call this before building a payload or enqueuing a job.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.prompt.is_empty() {
            return Err(GatewayError::InvalidRequest("prompt must not be empty".into()));
        }
        Ok(())
    }
}

/// Resolves `request.model ∨ device.default_model ∨ none` and assembles the
/// chat-style message list the backend expects.
pub fn build_payload(req: &AskRequest, fallback_model: Option<&str>, stream: bool) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = &req.system {
        if !system.is_empty() {
            messages.push(json!({"role": "system", "content": system}));
        }
    }
    messages.push(json!({"role": "user", "content": req.prompt}));

    let mut payload = json!({
        "messages": messages,
        "stream": stream,
    });
    let obj = payload.as_object_mut().unwrap();
    if req.options.as_object().map(|o| !o.is_empty()).unwrap_or(false) {
        obj.insert("options".to_string(), req.options.clone());
    }
    let model = req.model.clone().or_else(|| fallback_model.map(String::from));
    if let Some(model) = model {
        obj.insert("model".to_string(), Value::String(model));
    }
    payload
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("backend returned status {0}")]
    Status(reqwest::StatusCode),
}

pub struct Dispatcher {
    client: reqwest::Client,
    registry: Arc<DeviceRegistry>,
    metrics: Arc<Metrics>,
    config: Arc<AppConfig>,
}

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

impl Dispatcher {
    pub fn new(registry: Arc<DeviceRegistry>, metrics: Arc<Metrics>, config: Arc<AppConfig>) -> Self {
        Self {
            client: reqwest::Client::new(),
            registry,
            metrics,
            config,
        }
    }

    /// Non-stream POST with up to `MAX_ATTEMPTS` tries, doubling backoff
    /// between them. Surfaces only the last error once attempts run out.
    pub async fn post(&self, device: &Arc<Device>, payload: &Value) -> Result<Value, DispatchError> {
        let url = format!("{}/api/chat", device.config.base_url());
        let mut backoff = INITIAL_BACKOFF;
        let mut last_err = None;

        for attempt in 0..MAX_ATTEMPTS {
            let guard: InflightGuard = device.acquire().await;
            let start = Instant::now();
            let result = self.attempt_post(&url, payload).await;
            let elapsed = start.elapsed().as_secs_f64();
            drop(guard);

            match result {
                Ok(value) => {
                    self.metrics.mark(Some(device.key()), true, elapsed);
                    device.record_success(&self.registry);
                    return Ok(value);
                }
                Err(e) => {
                    self.metrics.mark(Some(device.key()), false, elapsed);
                    device.record_call_failure(
                        self.config.cb_fail_threshold,
                        self.config.cb_open_secs,
                        &self.registry,
                    );
                    last_err = Some(e);
                    if attempt + 1 < MAX_ATTEMPTS {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        Err(last_err.expect("at least one attempt ran"))
    }

    async fn attempt_post(&self, url: &str, payload: &Value) -> Result<Value, DispatchError> {
        let mut req = self.client.post(url).json(payload);
        if let Some(secs) = self.config.post_timeout_secs {
            req = req.timeout(Duration::from_secs(secs));
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(DispatchError::Status(resp.status()));
        }
        Ok(resp.json().await?)
    }

    /// Opens a streaming chat completion. Retries only until the response
    /// headers are received; once bytes start flowing there is no further
    /// retry. The device's concurrency permit is held for the lifetime of
    /// the returned stream.
    pub async fn stream(
        &self,
        device: &Arc<Device>,
        mut payload: Value,
    ) -> Result<impl Stream<Item = Bytes> + Send, DispatchError> {
        payload
            .as_object_mut()
            .unwrap()
            .insert("stream".to_string(), Value::Bool(true));
        let url = format!("{}/api/chat", device.config.base_url());
        let mut backoff = INITIAL_BACKOFF;
        let mut last_err = None;

        for attempt in 0..MAX_ATTEMPTS {
            let guard = device.acquire().await;
            let mut req = self.client.post(&url).json(&payload);
            if let Some(secs) = self.config.stream_timeout_secs {
                req = req.timeout(Duration::from_secs(secs));
            }
            match req.send().await {
                Ok(resp) if resp.status().is_success() => {
                    device.record_success(&self.registry);
                    return Ok(open_byte_stream(guard, resp));
                }
                Ok(resp) => {
                    drop(guard);
                    device.record_call_failure(
                        self.config.cb_fail_threshold,
                        self.config.cb_open_secs,
                        &self.registry,
                    );
                    last_err = Some(DispatchError::Status(resp.status()));
                }
                Err(e) => {
                    drop(guard);
                    device.record_call_failure(
                        self.config.cb_fail_threshold,
                        self.config.cb_open_secs,
                        &self.registry,
                    );
                    last_err = Some(DispatchError::Request(e));
                }
            }
            if attempt + 1 < MAX_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
        Err(last_err.expect("at least one attempt ran"))
    }
}

fn open_byte_stream(guard: InflightGuard, resp: reqwest::Response) -> impl Stream<Item = Bytes> + Send {
    let inner = resp.bytes_stream();
    stream::unfold((guard, inner), |(guard, mut inner)| async move {
        loop {
            match inner.next().await {
                Some(Ok(bytes)) if bytes.is_empty() => continue,
                Some(Ok(bytes)) => return Some((bytes, (guard, inner))),
                Some(Err(_)) | None => return None,
            }
        }
    })
}
