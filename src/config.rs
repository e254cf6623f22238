//! Environment-driven configuration, loaded once at startup.

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub registry_path: String,
    pub health_interval_secs: u64,
    pub health_probe_timeout_secs: u64,
    pub cb_fail_threshold: u32,
    pub cb_open_secs: u64,
    pub post_timeout_secs: Option<u64>,
    pub stream_timeout_secs: Option<u64>,
    pub cache_enabled: bool,
    pub cache_capacity: usize,
    pub job_workers: usize,
    pub shared_secret: Option<String>,
}

pub fn load() -> anyhow::Result<AppConfig> {
    dotenvy::dotenv().ok();

    let config = AppConfig {
        bind_addr: std::env::var("GATEWAY_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into()),
        registry_path: std::env::var("GATEWAY_REGISTRY_PATH").unwrap_or_else(|_| "phones.json".into()),
        health_interval_secs: env_parse("GATEWAY_HEALTH_INTERVAL_SECS", 10),
        health_probe_timeout_secs: env_parse("GATEWAY_HEALTH_PROBE_TIMEOUT_SECS", 5),
        cb_fail_threshold: env_parse("GATEWAY_CB_FAIL_THRESHOLD", 3),
        cb_open_secs: env_parse("GATEWAY_CB_OPEN_SECS", 30),
        post_timeout_secs: std::env::var("GATEWAY_POST_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()),
        stream_timeout_secs: std::env::var("GATEWAY_STREAM_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok()),
        cache_enabled: std::env::var("GATEWAY_CACHE_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true),
        cache_capacity: env_parse("GATEWAY_CACHE_CAPACITY", 128),
        job_workers: env_parse("GATEWAY_JOB_WORKERS", 2),
        shared_secret: std::env::var("GATEWAY_SHARED_SECRET").ok(),
    };

    if config.job_workers == 0 {
        anyhow::bail!("GATEWAY_JOB_WORKERS must be at least 1");
    }

    Ok(config)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
