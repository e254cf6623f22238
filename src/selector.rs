//! Device runtime state, weighted round-robin selection, and the circuit
//! breaker that lives on each device.
//!
//! There is no separate `CircuitBreaker` type: breaker state is just a few
//! fields on [`Device`], touched by the health prober and the dispatcher
//! alike. `open_until` is tracked as a monotonic [`Instant`]; it is only
//! ever converted to a wall-clock string at the point it's written back to
//! the [`DeviceRegistry`].

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::registry::DeviceRegistry;

/// Static configuration for one backend, read once from `phones.json`.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub key: String,
    pub host: String,
    pub port: u16,
    pub default_model: Option<String>,
    pub weight: u32,
    pub max_concurrency: u32,
}

impl DeviceConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn from_value(entry: &Value) -> Option<Self> {
        let host = entry.get("host")?.as_str()?.to_string();
        let port = entry
            .get("port")
            .and_then(Value::as_u64)
            .unwrap_or(11434) as u16;
        let serial = entry.get("serial").and_then(Value::as_str).filter(|s| !s.is_empty());
        let key = serial.map(str::to_string).unwrap_or_else(|| format!("{host}:{port}"));
        Some(Self {
            key,
            host,
            port,
            default_model: entry.get("model").and_then(Value::as_str).map(String::from),
            weight: entry.get("weight").and_then(Value::as_u64).unwrap_or(1).max(1) as u32,
            max_concurrency: entry
                .get("max_concurrency")
                .and_then(Value::as_u64)
                .unwrap_or(1)
                .max(1) as u32,
        })
    }
}

/// Mutable, process-local health and breaker state for one device.
pub struct Device {
    pub config: DeviceConfig,
    healthy: AtomicBool,
    reason: Mutex<Option<String>>,
    inflight: AtomicU32,
    consecutive_failures: AtomicU32,
    open_until: Mutex<Option<Instant>>,
    discovered_models: Mutex<Vec<String>>,
    semaphore: Arc<Semaphore>,
}

impl Device {
    pub fn new(config: DeviceConfig) -> Self {
        let permits = config.max_concurrency as usize;
        Self {
            config,
            healthy: AtomicBool::new(false),
            reason: Mutex::new(Some("unknown".to_string())),
            inflight: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
            open_until: Mutex::new(None),
            discovered_models: Mutex::new(Vec::new()),
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    pub fn key(&self) -> &str {
        &self.config.key
    }

    pub fn inflight(&self) -> u32 {
        self.inflight.load(Ordering::SeqCst)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().unwrap().clone()
    }

    pub fn discovered_models(&self) -> Vec<String> {
        self.discovered_models.lock().unwrap().clone()
    }

    pub fn open_until_instant(&self) -> Option<Instant> {
        *self.open_until.lock().unwrap()
    }

    /// Circuit is open and selection must skip this device.
    pub fn circuit_open(&self, now: Instant) -> bool {
        self.open_until_instant().map(|t| t > now).unwrap_or(false)
    }

    /// Eligible for selection: healthy and not presently circuit-open.
    pub fn is_eligible(&self, now: Instant) -> bool {
        self.is_healthy() && !self.circuit_open(now)
    }

    /// Acquire a concurrency permit, incrementing `inflight` for the
    /// duration of the guard.
    pub async fn acquire(self: &Arc<Self>) -> InflightGuard {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore never closed");
        self.inflight.fetch_add(1, Ordering::SeqCst);
        InflightGuard {
            device: self.clone(),
            _permit: permit,
        }
    }

    /// Record a successful probe or forwarded call: resets the breaker.
    pub fn record_success(&self, registry: &DeviceRegistry) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.healthy.store(true, Ordering::SeqCst);
        *self.reason.lock().unwrap() = None;
        *self.open_until.lock().unwrap() = None;
        registry.mark_ok(self.key());
        registry.update_dynamic(
            self.key(),
            &[
                ("healthy", Value::Bool(true)),
                ("reason", Value::Null),
                ("inflight", Value::from(self.inflight())),
                ("open_until", Value::Null),
            ],
        );
    }

    /// Record a probe or health-check failure that should also mark the
    /// device unhealthy (used by the health prober, which does not retry).
    pub fn record_health_failure(
        &self,
        reason: String,
        fail_threshold: u32,
        open_secs: u64,
        registry: &DeviceRegistry,
    ) {
        self.healthy.store(false, Ordering::SeqCst);
        *self.reason.lock().unwrap() = Some(reason.clone());
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let open_until_value = if failures >= fail_threshold {
            let until = Instant::now() + Duration::from_secs(open_secs);
            *self.open_until.lock().unwrap() = Some(until);
            registry_open_until_value(open_secs)
        } else {
            Value::Null
        };
        registry.mark_error(self.key());
        registry.update_dynamic(
            self.key(),
            &[
                ("healthy", Value::Bool(false)),
                ("reason", Value::String(reason)),
                ("inflight", Value::from(self.inflight())),
                ("open_until", open_until_value),
            ],
        );
    }

    /// Record a forwarded-request failure (dispatcher). Unlike a health
    /// probe failure this does not itself flip `healthy`; it only advances
    /// the failure counter and may open the circuit, matching §4.4.
    pub fn record_call_failure(&self, fail_threshold: u32, open_secs: u64, registry: &DeviceRegistry) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= fail_threshold {
            let until = Instant::now() + Duration::from_secs(open_secs);
            *self.open_until.lock().unwrap() = Some(until);
            registry.update_dynamic(
                self.key(),
                &[
                    ("healthy", Value::Bool(false)),
                    ("reason", Value::String("circuit_open".to_string())),
                    ("open_until", registry_open_until_value(open_secs)),
                ],
            );
        }
    }

    pub fn set_circuit_open_for_probe_skip(&self) {
        self.healthy.store(false, Ordering::SeqCst);
        *self.reason.lock().unwrap() = Some("circuit_open".to_string());
    }

    pub fn replace_discovered_models(&self, mut models: Vec<String>) {
        models.sort();
        models.dedup();
        *self.discovered_models.lock().unwrap() = models;
    }
}

fn registry_open_until_value(open_secs: u64) -> Value {
    let until = chrono::Utc::now() + chrono::Duration::seconds(open_secs as i64);
    Value::String(until.to_rfc3339())
}

/// Decrements `inflight` on drop, regardless of exit path. The semaphore
/// permit is released automatically when `_permit` drops alongside it.
pub struct InflightGuard {
    device: Arc<Device>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.device.inflight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Weighted round-robin selector over a fixed set of devices.
pub struct Selector {
    unique: Vec<Arc<Device>>,
    weighted: Vec<Arc<Device>>,
    cursor: Mutex<usize>,
}

impl Selector {
    pub fn new(devices: Vec<Arc<Device>>) -> Self {
        let mut weighted = Vec::new();
        for d in &devices {
            let reps = d.config.weight.max(1);
            for _ in 0..reps {
                weighted.push(d.clone());
            }
        }
        Self {
            unique: devices,
            weighted,
            cursor: Mutex::new(0),
        }
    }

    pub fn unique_devices(&self) -> &[Arc<Device>] {
        &self.unique
    }

    /// Walk the weighted list at most one full cycle from the cursor,
    /// returning the first eligible device. Falls back to a uniformly
    /// random pick if none qualify, so a probe eventually gets a chance to
    /// reset a device's state.
    pub fn pick(&self) -> Arc<Device> {
        let now = Instant::now();
        let n = self.weighted.len();
        let mut cursor = self.cursor.lock().unwrap();
        for _ in 0..n {
            let candidate = self.weighted[*cursor].clone();
            *cursor = (*cursor + 1) % n;
            if candidate.is_eligible(now) {
                return candidate;
            }
        }
        drop(cursor);
        self.weighted
            .choose(&mut rand::thread_rng())
            .expect("weighted list is non-empty")
            .clone()
    }
}
