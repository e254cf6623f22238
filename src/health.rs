//! Background health prober: one GET per unique device per interval,
//! feeding the circuit breaker and the on-disk registry.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::config::AppConfig;
use crate::registry::DeviceRegistry;
use crate::selector::{Device, Selector};

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagsModel>,
}

#[derive(Deserialize)]
struct TagsModel {
    name: Option<String>,
}

pub struct HealthProber {
    client: reqwest::Client,
    registry: Arc<DeviceRegistry>,
    config: Arc<AppConfig>,
}

impl HealthProber {
    pub fn new(registry: Arc<DeviceRegistry>, config: Arc<AppConfig>) -> Self {
        Self {
            client: reqwest::Client::new(),
            registry,
            config,
        }
    }

    /// Spawns the probe loop as a detached task, returning a handle the
    /// caller can abort on shutdown.
    pub fn spawn(self: Arc<Self>, selector: Arc<Selector>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.probe_all(&selector).await;
                if let Err(e) = self.registry.flush_if_dirty() {
                    tracing::warn!(error = %e, "failed to flush device registry");
                }
                tokio::time::sleep(Duration::from_secs(self.config.health_interval_secs)).await;
            }
        })
    }

    async fn probe_all(&self, selector: &Selector) {
        let devices = selector.unique_devices();
        let probes = devices.iter().map(|d| self.probe_one(d));
        futures::future::join_all(probes).await;
    }

    async fn probe_one(&self, device: &Arc<Device>) {
        if device.circuit_open(std::time::Instant::now()) {
            device.set_circuit_open_for_probe_skip();
            self.registry.update_dynamic(
                device.key(),
                &[
                    ("healthy", serde_json::Value::Bool(false)),
                    ("reason", serde_json::Value::String("circuit_open".into())),
                    ("inflight", serde_json::Value::from(device.inflight())),
                ],
            );
            return;
        }

        let url = format!("{}/api/tags", device.config.base_url());
        let result = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(self.config.health_probe_timeout_secs))
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => match resp.json::<TagsResponse>().await {
                Ok(tags) => {
                    let models: Vec<String> = tags.models.into_iter().filter_map(|m| m.name).collect();
                    device.replace_discovered_models(models.clone());
                    device.record_success(&self.registry);
                    self.registry.update_dynamic(
                        device.key(),
                        &[(
                            "models",
                            serde_json::Value::Array(models.into_iter().map(serde_json::Value::String).collect()),
                        )],
                    );
                    tracing::info!(device = device.key(), "health probe ok");
                }
                Err(e) => self.fail(device, format!("health_fail: invalid body: {e}")),
            },
            Ok(resp) => self.fail(device, format!("health_fail: status {}", resp.status())),
            Err(e) => self.fail(device, format!("health_fail: {e}")),
        }
    }

    fn fail(&self, device: &Arc<Device>, reason: String) {
        tracing::warn!(device = device.key(), reason = %reason, "health probe failed");
        device.record_health_failure(
            reason,
            self.config.cb_fail_threshold,
            self.config.cb_open_secs,
            &self.registry,
        );
    }
}
