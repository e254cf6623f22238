//! Process-wide request metrics, rendered as Prometheus scrape text.
//!
//! Total requests, total failures, average success latency, and a
//! per-device hit counter — the small set the original gateway tracked.
//! Everything lives behind one registry so `mark` and `render` never race.

use std::sync::Mutex;

use prometheus::{Counter, CounterVec, Encoder, Opts, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    requests_total: Counter,
    failures_total: Counter,
    latency_sum: Mutex<f64>,
    phone_hits: CounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = Counter::with_opts(Opts::new("gw_requests_total", "Total requests"))
            .expect("valid metric opts");
        let failures_total = Counter::with_opts(Opts::new("gw_failures_total", "Total failed requests"))
            .expect("valid metric opts");
        let phone_hits = CounterVec::new(
            Opts::new("gw_phone_hits_total", "Requests routed per device"),
            &["phone"],
        )
        .expect("valid metric opts");

        registry.register(Box::new(requests_total.clone())).unwrap();
        registry.register(Box::new(failures_total.clone())).unwrap();
        registry.register(Box::new(phone_hits.clone())).unwrap();

        Self {
            registry,
            requests_total,
            failures_total,
            latency_sum: Mutex::new(0.0),
            phone_hits,
        }
    }

    /// Records one forwarded attempt. `device_key` is `host:port` (or the
    /// device's serial-derived key); `None` when no device was reached yet.
    pub fn mark(&self, device_key: Option<&str>, ok: bool, latency_seconds: f64) {
        self.requests_total.inc();
        if ok {
            *self.latency_sum.lock().unwrap() += latency_seconds;
        } else {
            self.failures_total.inc();
        }
        if let Some(key) = device_key {
            self.phone_hits.with_label_values(&[key]).inc();
        }
    }

    fn successes(&self) -> f64 {
        let total = self.requests_total.get();
        let failures = self.failures_total.get();
        (total - failures).max(1.0)
    }

    /// Renders the scrape text format: counters from the registry plus a
    /// hand-computed average-latency gauge line, matching the original
    /// gateway's exact metric names.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&families, &mut buf).unwrap_or_default();
        let mut text = String::from_utf8(buf).unwrap_or_default();

        let avg = *self.latency_sum.lock().unwrap() / self.successes();
        text.push_str("# HELP gw_latency_seconds_avg Average success latency\n");
        text.push_str("# TYPE gw_latency_seconds_avg gauge\n");
        text.push_str(&format!("gw_latency_seconds_avg {avg:.6}\n"));
        text
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
