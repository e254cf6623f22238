use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod cache;
mod cli;
mod config;
mod dispatcher;
mod errors;
mod health;
mod jobs;
mod metrics;
mod registry;
mod selector;

use cache::ResponseCache;
use config::AppConfig;
use dispatcher::Dispatcher;
use health::HealthProber;
use jobs::JobQueue;
use metrics::Metrics;
use registry::DeviceRegistry;
use selector::{Device, DeviceConfig, Selector};

pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<DeviceRegistry>,
    pub selector: Arc<Selector>,
    pub dispatcher: Arc<Dispatcher>,
    pub cache: Option<Arc<ResponseCache>>,
    pub metrics: Arc<Metrics>,
    pub jobs: Arc<JobQueue>,
    pub http_client: reqwest::Client,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "gateway=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut cfg = config::load().context("loading configuration")?;
    let cli = cli::Cli::parse();

    if let Some(cli::Commands::Serve {
        bind_addr,
        registry_path,
        job_workers,
    }) = cli.command
    {
        if let Some(addr) = bind_addr {
            cfg.bind_addr = addr;
        }
        if let Some(path) = registry_path {
            cfg.registry_path = path;
        }
        if let Some(workers) = job_workers {
            cfg.job_workers = workers;
        }
    }

    run_server(cfg).await
}

async fn run_server(cfg: AppConfig) -> anyhow::Result<()> {
    let config = Arc::new(cfg);

    tracing::info!(path = %config.registry_path, "loading device registry");
    let registry = Arc::new(
        DeviceRegistry::load(&config.registry_path)
            .with_context(|| format!("loading device registry from {}", config.registry_path))?,
    );

    let devices: Vec<Arc<Device>> = registry
        .snapshot()
        .iter()
        .filter_map(DeviceConfig::from_value)
        .map(|cfg| Arc::new(Device::new(cfg)))
        .collect();
    if devices.is_empty() {
        anyhow::bail!("device registry contains no usable devices");
    }
    let selector = Arc::new(Selector::new(devices));

    let metrics = Arc::new(Metrics::new());
    let dispatcher = Arc::new(Dispatcher::new(registry.clone(), metrics.clone(), config.clone()));
    let cache = if config.cache_enabled {
        Some(Arc::new(ResponseCache::new(config.cache_capacity)))
    } else {
        None
    };
    let jobs = JobQueue::new();

    let prober = Arc::new(HealthProber::new(registry.clone(), config.clone()));
    let health_handle = prober.spawn(selector.clone());
    let worker_handles = jobs.spawn_workers(config.job_workers, selector.clone(), dispatcher.clone());

    let state = Arc::new(AppState {
        config: config.clone(),
        registry: registry.clone(),
        selector,
        dispatcher,
        cache,
        metrics,
        jobs: jobs.clone(),
        http_client: reqwest::Client::new(),
    });

    let app = api::router(state.clone())
        .with_state(state)
        .layer(DefaultBodyLimit::max(25 * 1024 * 1024))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = config.bind_addr.parse().context("parsing bind_addr")?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "device gateway listening");

    let shutdown = shutdown_signal();
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    tracing::info!("shutting down: stopping job queue and health loop");
    jobs.stop();
    health_handle.abort();
    for handle in worker_handles {
        let _ = handle.await;
    }
    if let Err(e) = registry.flush_if_dirty() {
        tracing::warn!(error = %e, "failed to flush device registry on shutdown");
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
