//! Gateway library crate — re-exports modules needed by integration tests
//! under `tests/`.

pub mod api;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod health;
pub mod jobs;
pub mod metrics;
pub mod registry;
pub mod selector;

use std::sync::Arc;

use config::AppConfig;
use dispatcher::Dispatcher;
use jobs::JobQueue;
use metrics::Metrics;
use registry::DeviceRegistry;
use selector::Selector;
use cache::ResponseCache;

/// Shared application state passed to every handler.
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<DeviceRegistry>,
    pub selector: Arc<Selector>,
    pub dispatcher: Arc<Dispatcher>,
    pub cache: Option<Arc<ResponseCache>>,
    pub metrics: Arc<Metrics>,
    pub jobs: Arc<JobQueue>,
    /// Ad-hoc client for diagnostic endpoints (`/ping`) that bypass the
    /// Dispatcher's retry envelope. Separate from the Dispatcher's own
    /// internal client, which is not exposed outside that module.
    pub http_client: reqwest::Client,
}
